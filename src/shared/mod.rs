pub mod errors;
pub mod ids;
pub mod time;

pub use errors::RuntimeError;
pub use ids::{validate_identifier_value, ArtifactId, PackageId, WorkflowId};
pub use time::{format_clock_time, now_millis, now_secs, parse_event_timestamp, sleep_with_stop};
