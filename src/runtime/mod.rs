pub mod logging;
pub mod paths;
pub mod session;

pub use logging::append_runtime_log;
pub use paths::{
    bootstrap_runtime_root, default_state_root_path, RuntimePaths, DEFAULT_STATE_ROOT_DIR,
};
pub use session::{NoticeCallback, SessionError, SessionNotice, SessionSignal, WorkflowSession};
