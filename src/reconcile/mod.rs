pub mod merge;
pub mod reconciler;
pub mod view;

pub use merge::{
    classify_error_code, union_artifacts, DropReason, ErrorSeverity, GateBlocked, GatePhase,
    MergeOutcome, ReconcileState,
};
pub use reconciler::{Reconciler, ViewCallback};
pub use view::{ArtifactRef, ProgressView, Stage, Status, StatusSnapshot, StepLogEntry, StepSource};
