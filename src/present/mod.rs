use crate::reconcile::view::{ProgressView, Stage, Status, StepLogEntry};
use crate::shared::time::format_clock_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageIndicator {
    Pending,
    Current,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRow {
    pub stage: Stage,
    pub label: &'static str,
    pub indicator: StageIndicator,
}

/// Ordered stage list for a progress panel. Read-only projection; a completed
/// workflow marks every stage done, otherwise stages before the current one
/// are done and later ones pending.
pub fn stage_rows(view: &ProgressView) -> Vec<StageRow> {
    Stage::ALL
        .iter()
        .map(|stage| StageRow {
            stage: *stage,
            label: stage.label(),
            indicator: indicator_for(*stage, view),
        })
        .collect()
}

fn indicator_for(stage: Stage, view: &ProgressView) -> StageIndicator {
    if view.status == Status::Completed {
        return StageIndicator::Completed;
    }
    if stage < view.stage {
        StageIndicator::Completed
    } else if stage == view.stage {
        StageIndicator::Current
    } else {
        StageIndicator::Pending
    }
}

/// Chronological narration lines, `[HH:MM:SS] label` with an optional detail.
pub fn narrate_step_log(entries: &[StepLogEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let clock = format_clock_time(entry.at_ms);
            match entry.detail.as_deref() {
                Some(detail) => format!("[{clock}] {}: {detail}", entry.label),
                None => format!("[{clock}] {}", entry.label),
            }
        })
        .collect()
}

/// Per-type artifact counts, `images: 2, videos: 1`, in type order.
pub fn artifact_summary(view: &ProgressView) -> String {
    let parts: Vec<String> = view
        .artifacts
        .iter()
        .filter(|(_, refs)| !refs.is_empty())
        .map(|(artifact_type, refs)| format!("{artifact_type}: {}", refs.len()))
        .collect();
    if parts.is_empty() {
        return "no artifacts yet".to_string();
    }
    parts.join(", ")
}

/// One-line summary for a status bar.
pub fn progress_summary(view: &ProgressView) -> String {
    let mut summary = format!(
        "{} at {}%, {}",
        view.stage.label(),
        view.percentage,
        view.status
    );
    let step = view.current_step_label.trim();
    if !step.is_empty() {
        summary.push_str(": ");
        summary.push_str(step);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::WorkflowId;

    fn view_at(stage: Stage, status: Status, percentage: u8) -> ProgressView {
        let mut view = ProgressView::new(WorkflowId::parse("wf-present").expect("workflow id"));
        view.stage = stage;
        view.status = status;
        view.percentage = percentage;
        view.current_step_label = "Drafting body copy".to_string();
        view
    }

    #[test]
    fn mid_run_rows_split_around_the_current_stage() {
        let rows = stage_rows(&view_at(Stage::Copywriting, Status::Running, 30));
        assert_eq!(rows.len(), Stage::ALL.len());
        assert_eq!(rows[0].indicator, StageIndicator::Completed);
        assert_eq!(rows[1].indicator, StageIndicator::Completed);
        assert_eq!(rows[2].stage, Stage::Copywriting);
        assert_eq!(rows[2].indicator, StageIndicator::Current);
        assert!(rows[3..]
            .iter()
            .all(|row| row.indicator == StageIndicator::Pending));
    }

    #[test]
    fn completed_workflows_mark_every_stage_done() {
        let rows = stage_rows(&view_at(Stage::Done, Status::Completed, 100));
        assert!(rows
            .iter()
            .all(|row| row.indicator == StageIndicator::Completed));
    }

    #[test]
    fn a_failed_workflow_keeps_its_failing_stage_current() {
        let rows = stage_rows(&view_at(Stage::ImageGeneration, Status::Failed, 50));
        assert_eq!(rows[3].indicator, StageIndicator::Current);
        assert_eq!(rows[4].indicator, StageIndicator::Pending);
    }

    #[test]
    fn summary_carries_stage_percentage_and_step() {
        let summary = progress_summary(&view_at(Stage::Copywriting, Status::Running, 30));
        assert_eq!(summary, "Copywriting at 30%, running: Drafting body copy");
    }

    #[test]
    fn empty_artifact_map_reads_as_placeholder() {
        let view = view_at(Stage::Analysis, Status::Running, 12);
        assert_eq!(artifact_summary(&view), "no artifacts yet");
    }
}
