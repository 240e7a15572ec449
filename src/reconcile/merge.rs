use crate::reconcile::view::{
    ArtifactRef, ProgressView, Stage, Status, StatusSnapshot, StepLogEntry, StepSource,
};
use crate::shared::ids::WorkflowId;
use crate::shared::time::parse_event_timestamp;
use crate::transport::events::{EventPayload, StreamEvent, ToolCallStatus};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Duplicate-suppression horizon. Reconnects replay at most a short tail of
/// recent events, so a bounded window is enough.
const FINGERPRINT_WINDOW: usize = 512;

/// Narration history kept for presentation. Oldest entries fall off.
const MAX_STEP_LOG: usize = 256;

const MAX_LABEL_LEN: usize = 80;

/// Where the approval gate stands for the current occurrence.
///
/// `Pending` means the edge has fired and no decision has been submitted yet.
/// `Submitted` means a decision is on its way to the engine and the gate must
/// not re-fire until the engine confirms the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Idle,
    Pending,
    Submitted,
}

/// Why a decision slot could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBlocked {
    NoActiveWorkflow,
    NotAwaitingApproval(Status),
    DecisionInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoActiveWorkflow,
    ForeignWorkflow,
    Duplicate,
    AfterTerminal,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::NoActiveWorkflow => write!(f, "no_active_workflow"),
            DropReason::ForeignWorkflow => write!(f, "foreign_workflow"),
            DropReason::Duplicate => write!(f, "duplicate_event"),
            DropReason::AfterTerminal => write!(f, "after_terminal"),
        }
    }
}

/// What a single merge did. The caller decides who to notify from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub view_changed: bool,
    pub log_appended: bool,
    /// Set on the transition into `approval_required`, once per occurrence.
    pub approval_edge: bool,
    /// Set on the transition into a terminal status, never on later input.
    pub reached_terminal: Option<Status>,
    pub dropped: Option<DropReason>,
}

impl MergeOutcome {
    fn dropped(reason: DropReason) -> MergeOutcome {
        MergeOutcome {
            dropped: Some(reason),
            ..MergeOutcome::default()
        }
    }

    pub fn notifies_subscribers(&self) -> bool {
        self.view_changed || self.log_appended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Fatal,
    Transient,
}

/// Maps an engine error code to a severity. Unknown codes are treated as
/// transient so a code added on the engine side never fails a run that is
/// still making progress.
pub fn classify_error_code(code: &str) -> ErrorSeverity {
    match code {
        "GENERATION_FAILED" | "WORKFLOW_FAILED" | "INTERNAL_ERROR" => ErrorSeverity::Fatal,
        "RATE_LIMITED" | "PROVIDER_UNAVAILABLE" | "TIMEOUT" => ErrorSeverity::Transient,
        _ => ErrorSeverity::Transient,
    }
}

#[derive(Debug, Default)]
struct FingerprintWindow {
    order: VecDeque<String>,
    seen: BTreeSet<String>,
}

impl FingerprintWindow {
    /// Returns false when the fingerprint was already inside the window.
    fn insert(&mut self, fingerprint: &str) -> bool {
        if self.seen.contains(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string());
        self.order.push_back(fingerprint.to_string());
        if self.order.len() > FINGERPRINT_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Mutable reconciliation state for one workflow. This is the only place
/// `ProgressView` is ever written. All methods are infallible merges that
/// report what they did through `MergeOutcome`.
#[derive(Debug)]
pub struct ReconcileState {
    view: ProgressView,
    step_log: Vec<StepLogEntry>,
    gate: GatePhase,
    /// Engine timestamp of the evidence that latched the gate. `i64::MAX`
    /// when that evidence carried no timestamp, so nothing can outrank it.
    gate_latched_at_ms: i64,
    seen_events: FingerprintWindow,
    label_at_ms: i64,
    label_from_poll: bool,
}

impl ReconcileState {
    pub fn new(workflow_id: WorkflowId) -> ReconcileState {
        ReconcileState {
            view: ProgressView::new(workflow_id),
            step_log: Vec::new(),
            gate: GatePhase::Idle,
            gate_latched_at_ms: 0,
            seen_events: FingerprintWindow::default(),
            label_at_ms: i64::MIN,
            label_from_poll: false,
        }
    }

    pub fn view(&self) -> &ProgressView {
        &self.view
    }

    pub fn step_log(&self) -> &[StepLogEntry] {
        &self.step_log
    }

    pub fn gate_phase(&self) -> GatePhase {
        self.gate
    }

    /// Reserves the gate for one in-flight decision. The caller submits the
    /// decision to the engine only after this succeeds.
    pub fn begin_decision(&mut self) -> Result<(), GateBlocked> {
        if self.view.status != Status::ApprovalRequired {
            return Err(GateBlocked::NotAwaitingApproval(self.view.status));
        }
        if self.gate == GatePhase::Submitted {
            return Err(GateBlocked::DecisionInFlight);
        }
        self.gate = GatePhase::Submitted;
        Ok(())
    }

    /// Re-arms the gate after a decision submission failed to reach the
    /// engine. The occurrence is still unresolved.
    pub fn cancel_decision(&mut self) {
        if self.gate == GatePhase::Submitted {
            self.gate = GatePhase::Pending;
        }
    }

    /// Merges a full poll snapshot. Snapshots are authoritative for stage,
    /// percentage and status, subject to the monotonicity rules.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &StatusSnapshot,
        received_at_ms: i64,
    ) -> MergeOutcome {
        if self.view.status.is_terminal() {
            return MergeOutcome::dropped(DropReason::AfterTerminal);
        }
        if snapshot.workflow_id != self.view.workflow_id {
            return MergeOutcome::dropped(DropReason::ForeignWorkflow);
        }
        let mut outcome = MergeOutcome::default();
        let engine_ts = snapshot
            .updated_at
            .as_deref()
            .and_then(parse_event_timestamp);
        let at_ms = engine_ts.unwrap_or(received_at_ms);

        self.merge_stage(snapshot.stage, &mut outcome);
        self.merge_percentage(snapshot.progress_percentage, &mut outcome);
        if union_artifacts(&mut self.view.artifacts, &snapshot.artifacts) {
            outcome.view_changed = true;
        }
        self.merge_status(snapshot.status, engine_ts, &mut outcome);
        if let Some(error) = snapshot.error.as_deref() {
            self.record_error(error, &mut outcome);
        }
        if let Some(step) = snapshot.current_step.as_deref() {
            if self.consider_label(step, at_ms, true) {
                outcome.view_changed = true;
            }
        }
        if self.clamp_percentage() {
            outcome.view_changed = true;
        }
        self.note_input_time(at_ms);
        outcome
    }

    /// Merges one stream event. Incremental kinds narrate; only kinds that
    /// carry an absolute position (progress, result, terminal errors) may
    /// move stage, percentage or status.
    pub fn apply_event(&mut self, event: &StreamEvent) -> MergeOutcome {
        if self.view.status.is_terminal() {
            return MergeOutcome::dropped(DropReason::AfterTerminal);
        }
        if event.workflow_id != self.view.workflow_id {
            return MergeOutcome::dropped(DropReason::ForeignWorkflow);
        }
        if !self.seen_events.insert(&event.fingerprint) {
            return MergeOutcome::dropped(DropReason::Duplicate);
        }
        let mut outcome = MergeOutcome::default();
        let at_ms = event.effective_timestamp_ms();
        match &event.payload {
            EventPayload::Thought { content, node_name } => {
                let (label, detail) = match node_name {
                    Some(name) => (name.clone(), Some(content.clone())),
                    None => (truncate_label(content), None),
                };
                if self.consider_label(&label, at_ms, false) {
                    outcome.view_changed = true;
                }
                self.push_log(at_ms, StepSource::Thought, label, detail, &mut outcome);
            }
            EventPayload::ToolCall {
                tool_name,
                status,
                message,
            } => {
                if *status == ToolCallStatus::InProgress
                    && self.consider_label(tool_name, at_ms, false)
                {
                    outcome.view_changed = true;
                }
                let detail = message
                    .clone()
                    .unwrap_or_else(|| status.to_string());
                self.push_log(
                    at_ms,
                    StepSource::ToolCall,
                    tool_name.clone(),
                    Some(detail),
                    &mut outcome,
                );
            }
            EventPayload::Result {
                artifacts,
                completes_workflow,
                summary,
            } => {
                if union_artifacts(&mut self.view.artifacts, artifacts) {
                    outcome.view_changed = true;
                }
                if *completes_workflow {
                    self.merge_stage(Stage::Done, &mut outcome);
                    self.merge_status(Status::Completed, event.timestamp_ms, &mut outcome);
                }
                self.push_log(
                    at_ms,
                    StepSource::Progress,
                    "Result ready".to_string(),
                    summary.as_ref().map(|copy| truncate_label(copy)),
                    &mut outcome,
                );
            }
            EventPayload::Error { code, message } => {
                self.record_error(message, &mut outcome);
                if classify_error_code(code) == ErrorSeverity::Fatal {
                    self.merge_status(Status::Failed, event.timestamp_ms, &mut outcome);
                }
                let label = if code.trim().is_empty() {
                    "engine error".to_string()
                } else {
                    code.clone()
                };
                self.push_log(
                    at_ms,
                    StepSource::Error,
                    label,
                    Some(message.clone()),
                    &mut outcome,
                );
            }
            EventPayload::Progress {
                stage,
                percentage,
                current_step,
            } => {
                self.merge_stage(*stage, &mut outcome);
                if let Some(percentage) = percentage {
                    self.merge_percentage(*percentage, &mut outcome);
                }
                if let Some(step) = current_step.as_deref() {
                    if self.consider_label(step, at_ms, false) {
                        outcome.view_changed = true;
                    }
                    self.push_log(
                        at_ms,
                        StepSource::Progress,
                        step.to_string(),
                        None,
                        &mut outcome,
                    );
                }
            }
            EventPayload::Artifact {
                artifact_type,
                artifact,
            } => {
                if push_unique_artifact(&mut self.view.artifacts, artifact_type, artifact) {
                    outcome.view_changed = true;
                }
                self.push_log(
                    at_ms,
                    StepSource::Progress,
                    format!("{artifact_type} ready"),
                    artifact.label.clone(),
                    &mut outcome,
                );
            }
            EventPayload::ApprovalRequired { reason } => {
                self.merge_status(Status::ApprovalRequired, event.timestamp_ms, &mut outcome);
                if self.consider_label("Awaiting approval", at_ms, false) {
                    outcome.view_changed = true;
                }
                self.push_log(
                    at_ms,
                    StepSource::Progress,
                    "Approval requested".to_string(),
                    reason.clone(),
                    &mut outcome,
                );
            }
        }
        if self.clamp_percentage() {
            outcome.view_changed = true;
        }
        self.note_input_time(at_ms);
        outcome
    }

    fn merge_stage(&mut self, incoming: Stage, outcome: &mut MergeOutcome) {
        if incoming > self.view.stage {
            self.view.stage = incoming;
            outcome.view_changed = true;
        }
    }

    fn merge_percentage(&mut self, incoming: u8, outcome: &mut MergeOutcome) {
        // Compare inside the current stage's band: a report beyond the band
        // lands on the same clamped value every time and is not a change.
        let (low, high) = self.view.stage.band();
        let incoming = incoming.clamp(low, high);
        if incoming > self.view.percentage {
            self.view.percentage = incoming;
            outcome.view_changed = true;
        }
    }

    fn merge_status(
        &mut self,
        incoming: Status,
        engine_ts: Option<i64>,
        outcome: &mut MergeOutcome,
    ) {
        let current = self.view.status;
        if incoming == current {
            // A repeated approval_required report keeps the latch current so
            // older `running` reports cannot outrank it later.
            if incoming == Status::ApprovalRequired && self.gate != GatePhase::Submitted {
                if let Some(ts) = engine_ts {
                    if ts > self.gate_latched_at_ms {
                        self.gate_latched_at_ms = ts;
                    }
                }
            }
            return;
        }
        if !current.can_advance_to(incoming) {
            return;
        }
        // While a decision is pending here, a `running` report only clears
        // the gate when it is provably newer than the latching evidence.
        // Anything concurrent or unstamped loses to the gate.
        if current == Status::ApprovalRequired
            && self.gate == GatePhase::Pending
            && !incoming.is_terminal()
            && engine_ts.map_or(true, |ts| ts <= self.gate_latched_at_ms)
        {
            return;
        }
        self.view.status = incoming;
        outcome.view_changed = true;
        if incoming == Status::ApprovalRequired {
            self.gate_latched_at_ms = engine_ts.unwrap_or(i64::MAX);
            if self.gate == GatePhase::Idle {
                self.gate = GatePhase::Pending;
                outcome.approval_edge = true;
            }
        } else {
            // Leaving approval_required resolves the occurrence; the next
            // one is a fresh edge.
            self.gate = GatePhase::Idle;
        }
        if incoming.is_terminal() {
            outcome.reached_terminal = Some(incoming);
        }
    }

    fn record_error(&mut self, message: &str, outcome: &mut MergeOutcome) {
        if self.view.error_message.is_some() || message.trim().is_empty() {
            return;
        }
        self.view.error_message = Some(message.to_string());
        outcome.view_changed = true;
    }

    fn consider_label(&mut self, candidate: &str, at_ms: i64, from_poll: bool) -> bool {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return false;
        }
        // Last writer wins by timestamp; on a tie the poll snapshot wins
        // because it is a complete state, not a partial narration.
        let wins = at_ms > self.label_at_ms
            || (at_ms == self.label_at_ms && (from_poll || !self.label_from_poll));
        if !wins {
            return false;
        }
        self.label_at_ms = at_ms;
        self.label_from_poll = from_poll;
        if self.view.current_step_label == candidate {
            return false;
        }
        self.view.current_step_label = candidate.to_string();
        true
    }

    fn push_log(
        &mut self,
        at_ms: i64,
        source: StepSource,
        label: String,
        detail: Option<String>,
        outcome: &mut MergeOutcome,
    ) {
        if self.step_log.len() == MAX_STEP_LOG {
            self.step_log.remove(0);
        }
        self.step_log.push(StepLogEntry {
            at_ms,
            source,
            label,
            detail,
        });
        outcome.log_appended = true;
    }

    /// Keeps the percentage inside the band the current stage owns. Bands
    /// only rise with stage, so clamping never moves the value backwards.
    fn clamp_percentage(&mut self) -> bool {
        let (low, high) = self.view.stage.band();
        let clamped = self.view.percentage.clamp(low, high);
        if clamped == self.view.percentage {
            return false;
        }
        self.view.percentage = clamped;
        true
    }

    fn note_input_time(&mut self, at_ms: i64) {
        if at_ms > self.view.last_event_at_ms {
            self.view.last_event_at_ms = at_ms;
        }
    }
}

/// Unions `incoming` into `target`, deduplicated by artifact id within each
/// artifact type. Returns true when anything new landed.
pub fn union_artifacts(
    target: &mut BTreeMap<String, Vec<ArtifactRef>>,
    incoming: &BTreeMap<String, Vec<ArtifactRef>>,
) -> bool {
    let mut changed = false;
    for (artifact_type, refs) in incoming {
        for artifact in refs {
            if push_unique_artifact(target, artifact_type, artifact) {
                changed = true;
            }
        }
    }
    changed
}

fn push_unique_artifact(
    target: &mut BTreeMap<String, Vec<ArtifactRef>>,
    artifact_type: &str,
    artifact: &ArtifactRef,
) -> bool {
    let slot = target.entry(artifact_type.to_string()).or_default();
    if slot.iter().any(|existing| existing.id == artifact.id) {
        return false;
    }
    slot.push(artifact.clone());
    true
}

fn truncate_label(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_LABEL_LEN {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(MAX_LABEL_LEN).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_error_codes_stay_transient() {
        assert_eq!(classify_error_code("GENERATION_FAILED"), ErrorSeverity::Fatal);
        assert_eq!(classify_error_code("RATE_LIMITED"), ErrorSeverity::Transient);
        assert_eq!(classify_error_code("SOME_FUTURE_CODE"), ErrorSeverity::Transient);
        assert_eq!(classify_error_code(""), ErrorSeverity::Transient);
    }

    #[test]
    fn artifact_union_is_idempotent() {
        let mut target = BTreeMap::new();
        let mut incoming = BTreeMap::new();
        incoming.insert(
            "images".to_string(),
            vec![ArtifactRef {
                id: crate::shared::ids::ArtifactId::parse("img-1").expect("artifact id"),
                label: Some("Hero shot".to_string()),
                url: None,
            }],
        );
        assert!(union_artifacts(&mut target, &incoming));
        assert!(!union_artifacts(&mut target, &incoming));
        assert_eq!(target.get("images").map(Vec::len), Some(1));
    }

    #[test]
    fn fingerprint_window_evicts_oldest() {
        let mut window = FingerprintWindow::default();
        for index in 0..=FINGERPRINT_WINDOW {
            assert!(window.insert(&format!("fp-{index}")));
        }
        // fp-0 was evicted and is admitted again; a recent one is not.
        assert!(window.insert("fp-0"));
        assert!(!window.insert(&format!("fp-{FINGERPRINT_WINDOW}")));
    }

    #[test]
    fn labels_never_exceed_display_width() {
        let long = "x".repeat(300);
        let label = truncate_label(&long);
        assert_eq!(label.chars().count(), MAX_LABEL_LEN + 3);
        assert!(label.ends_with("..."));
        assert_eq!(truncate_label("  short  "), "short");
    }
}
