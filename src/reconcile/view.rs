use crate::shared::ids::{ArtifactId, PackageId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Workflow stages in engine order. The derived `Ord` carries the total
/// order the reconciler relies on: stage never moves backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Analysis,
    Copywriting,
    ImageGeneration,
    VideoGeneration,
    QaReview,
    Approval,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Init,
        Stage::Analysis,
        Stage::Copywriting,
        Stage::ImageGeneration,
        Stage::VideoGeneration,
        Stage::QaReview,
        Stage::Approval,
        Stage::Done,
    ];

    /// Percentage at which the engine reports entry into this stage.
    pub fn entry_percentage(self) -> u8 {
        match self {
            Stage::Init => 0,
            Stage::Analysis => 10,
            Stage::Copywriting => 25,
            Stage::ImageGeneration => 45,
            Stage::VideoGeneration => 65,
            Stage::QaReview => 85,
            Stage::Approval => 95,
            Stage::Done => 100,
        }
    }

    /// Inclusive percentage band owned by this stage: `[entry, next_entry - 1]`,
    /// with `done` pinned to exactly 100.
    pub fn band(self) -> (u8, u8) {
        match self.next() {
            Some(next) => (self.entry_percentage(), next.entry_percentage() - 1),
            None => (100, 100),
        }
    }

    pub fn next(self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|stage| *stage == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Init => "Initializing",
            Stage::Analysis => "Analysis",
            Stage::Copywriting => "Copywriting",
            Stage::ImageGeneration => "Image Generation",
            Stage::VideoGeneration => "Video Generation",
            Stage::QaReview => "QA Review",
            Stage::Approval => "Approval",
            Stage::Done => "Done",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        match raw {
            "init" => Some(Stage::Init),
            "analysis" => Some(Stage::Analysis),
            "copywriting" => Some(Stage::Copywriting),
            "image_generation" => Some(Stage::ImageGeneration),
            "video_generation" => Some(Stage::VideoGeneration),
            "qa_review" => Some(Stage::QaReview),
            "approval" => Some(Stage::Approval),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Init => write!(f, "init"),
            Stage::Analysis => write!(f, "analysis"),
            Stage::Copywriting => write!(f, "copywriting"),
            Stage::ImageGeneration => write!(f, "image_generation"),
            Stage::VideoGeneration => write!(f, "video_generation"),
            Stage::QaReview => write!(f, "qa_review"),
            Stage::Approval => write!(f, "approval"),
            Stage::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    ApprovalRequired,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// Whether `next` is reachable from `self` along the status path
    /// `pending -> running -> {approval_required -> running}* -> terminal`.
    /// Reachability rather than adjacency: a late-joining observer may see
    /// any downstream status as its first input.
    pub fn can_advance_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Running)
                | (Status::Pending, Status::ApprovalRequired)
                | (Status::Pending, Status::Completed)
                | (Status::Pending, Status::Failed)
                | (Status::Pending, Status::Cancelled)
                | (Status::Running, Status::ApprovalRequired)
                | (Status::Running, Status::Completed)
                | (Status::Running, Status::Failed)
                | (Status::Running, Status::Cancelled)
                | (Status::ApprovalRequired, Status::Running)
                | (Status::ApprovalRequired, Status::Completed)
                | (Status::ApprovalRequired, Status::Failed)
                | (Status::ApprovalRequired, Status::Cancelled)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Running => write!(f, "running"),
            Status::ApprovalRequired => write!(f, "approval_required"),
            Status::Completed => write!(f, "completed"),
            Status::Failed => write!(f, "failed"),
            Status::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Point-in-time status as served by `GET /workflows/{id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub package_id: Option<PackageId>,
    pub status: Status,
    pub stage: Stage,
    #[serde(default)]
    pub progress_percentage: u8,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<ArtifactRef>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    Thought,
    ToolCall,
    Progress,
    Error,
}

/// One narration entry consumed by the presentation adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLogEntry {
    pub at_ms: i64,
    pub source: StepSource,
    pub label: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// The authoritative progress aggregate. Owned and mutated exclusively by the
/// reconciler; everyone else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub workflow_id: WorkflowId,
    pub stage: Stage,
    pub status: Status,
    pub percentage: u8,
    pub current_step_label: String,
    pub artifacts: BTreeMap<String, Vec<ArtifactRef>>,
    /// Millisecond timestamp of the newest input merged into this view.
    pub last_event_at_ms: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ProgressView {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            stage: Stage::Init,
            status: Status::Pending,
            percentage: 0,
            current_step_label: "Waiting for workflow".to_string(),
            artifacts: BTreeMap::new(),
            last_event_at_ms: 0,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_engine_pipeline() {
        for window in Stage::ALL.windows(2) {
            assert!(window[0] < window[1], "{} < {}", window[0], window[1]);
            assert!(window[0].entry_percentage() < window[1].entry_percentage());
        }
    }

    #[test]
    fn bands_tile_the_full_percentage_range() {
        let mut expected_floor = 0u8;
        for stage in Stage::ALL {
            let (floor, ceiling) = stage.band();
            assert_eq!(floor, expected_floor, "band floor for {stage}");
            assert!(floor <= ceiling);
            if stage != Stage::Done {
                expected_floor = ceiling + 1;
            }
        }
        assert_eq!(Stage::Done.band(), (100, 100));
    }

    #[test]
    fn stage_display_round_trips_through_parse() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(&stage.to_string()), Some(stage));
        }
        assert_eq!(Stage::parse("packaging"), None);
    }
}
