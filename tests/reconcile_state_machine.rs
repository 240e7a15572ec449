use packtrack::reconcile::{
    ArtifactRef, DropReason, GateBlocked, ProgressView, ReconcileState, Stage, Status,
    StatusSnapshot,
};
use packtrack::shared::ids::{ArtifactId, WorkflowId};
use packtrack::transport::decode_stream_text;
use packtrack::transport::StreamEvent;
use std::collections::BTreeMap;

fn workflow(raw: &str) -> WorkflowId {
    WorkflowId::parse(raw).expect("workflow id")
}

fn snapshot(stage: Stage, status: Status, percentage: u8) -> StatusSnapshot {
    StatusSnapshot {
        workflow_id: workflow("wf-1"),
        package_id: None,
        status,
        stage,
        progress_percentage: percentage,
        current_step: None,
        artifacts: BTreeMap::new(),
        error: None,
        updated_at: None,
    }
}

fn stamped(stage: Stage, status: Status, percentage: u8, updated_at: &str) -> StatusSnapshot {
    StatusSnapshot {
        updated_at: Some(updated_at.to_string()),
        ..snapshot(stage, status, percentage)
    }
}

fn event(frame: &str, observed_at_ms: i64) -> StreamEvent {
    decode_stream_text(frame, observed_at_ms)
        .expect("decodable frame")
        .expect("agent event")
}

fn artifact(id: &str) -> ArtifactRef {
    ArtifactRef {
        id: ArtifactId::parse(id).expect("artifact id"),
        label: None,
        url: None,
    }
}

#[test]
fn stage_never_regresses_on_stale_snapshots() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::Copywriting, Status::Running, 30), 1_000);

    let outcome = state.apply_snapshot(&snapshot(Stage::Analysis, Status::Running, 15), 2_000);
    assert!(!outcome.view_changed);
    assert_eq!(state.view().stage, Stage::Copywriting);
    assert_eq!(state.view().percentage, 30);
    assert_eq!(state.view().status, Status::Running);
}

#[test]
fn observed_stages_are_non_decreasing_over_any_interleaving() {
    let inputs = [
        snapshot(Stage::Analysis, Status::Running, 12),
        snapshot(Stage::ImageGeneration, Status::Running, 50),
        snapshot(Stage::Init, Status::Running, 1),
        snapshot(Stage::Copywriting, Status::Running, 30),
        snapshot(Stage::QaReview, Status::Running, 88),
        snapshot(Stage::Analysis, Status::Running, 20),
    ];
    let mut state = ReconcileState::new(workflow("wf-1"));
    let mut observed = Vec::new();
    for (tick, input) in inputs.iter().enumerate() {
        state.apply_snapshot(input, tick as i64 * 1_000);
        observed.push((state.view().stage, state.view().percentage));
    }
    for pair in observed.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "stage regressed: {pair:?}");
        assert!(pair[1].1 >= pair[0].1, "percentage regressed: {pair:?}");
    }
}

#[test]
fn percentage_is_clamped_into_the_band_the_stage_owns() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    // Stage says image generation but the engine's percentage lags behind.
    state.apply_snapshot(&snapshot(Stage::ImageGeneration, Status::Running, 20), 1_000);
    let (floor, ceiling) = Stage::ImageGeneration.band();
    assert_eq!(state.view().percentage, floor);

    // And an overshooting percentage is pinned to the band ceiling.
    state.apply_snapshot(&snapshot(Stage::ImageGeneration, Status::Running, 99), 2_000);
    assert_eq!(state.view().percentage, ceiling);
}

#[test]
fn repeated_snapshots_beyond_the_band_do_not_renotify() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let (_, ceiling) = Stage::ImageGeneration.band();

    // The engine's percentage overshoots the stage's band; the first apply
    // lands on the band ceiling and counts as a change.
    let over = snapshot(Stage::ImageGeneration, Status::Running, 99);
    let outcome = state.apply_snapshot(&over, 1_000);
    assert!(outcome.view_changed);
    assert_eq!(state.view().percentage, ceiling);

    // The identical snapshot on the next poll tick changes nothing and must
    // not wake subscribers.
    let outcome = state.apply_snapshot(&over, 2_000);
    assert!(!outcome.view_changed);
    assert!(!outcome.notifies_subscribers());
    assert_eq!(state.view().percentage, ceiling);
    assert_eq!(state.view().stage, Stage::ImageGeneration);
}

#[test]
fn artifact_union_is_idempotent_and_never_shrinks() {
    let mut first = snapshot(Stage::ImageGeneration, Status::Running, 50);
    first
        .artifacts
        .insert("images".to_string(), vec![artifact("img-1")]);

    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&first, 1_000);
    assert_eq!(state.view().artifact_count(), 1);

    // The same artifact again, plus a snapshot with an empty map.
    state.apply_snapshot(&first, 2_000);
    state.apply_snapshot(&snapshot(Stage::ImageGeneration, Status::Running, 55), 3_000);
    assert_eq!(state.view().artifact_count(), 1);

    let mut second = snapshot(Stage::VideoGeneration, Status::Running, 70);
    second
        .artifacts
        .insert("images".to_string(), vec![artifact("img-1"), artifact("img-2")]);
    state.apply_snapshot(&second, 4_000);
    assert_eq!(state.view().artifact_count(), 2);
}

#[test]
fn terminal_status_freezes_every_field() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::Done, Status::Completed, 100), 1_000);
    let frozen: ProgressView = state.view().clone();

    let outcome = state.apply_snapshot(&snapshot(Stage::Done, Status::Failed, 100), 2_000);
    assert_eq!(outcome.dropped, Some(DropReason::AfterTerminal));

    let thought = event(
        r#"{"type":"thought","workflowId":"wf-1","data":{"content":"late narration"}}"#,
        3_000,
    );
    let outcome = state.apply_event(&thought);
    assert_eq!(outcome.dropped, Some(DropReason::AfterTerminal));
    assert_eq!(state.view(), &frozen);
    assert!(state.step_log().is_empty());
}

#[test]
fn five_identical_approval_snapshots_raise_one_gate_edge() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let mut edges = 0;
    for tick in 0..5 {
        let outcome = state.apply_snapshot(
            &snapshot(Stage::Approval, Status::ApprovalRequired, 95),
            tick * 1_000,
        );
        if outcome.approval_edge {
            edges += 1;
        }
    }
    assert_eq!(edges, 1);
    assert_eq!(state.view().status, Status::ApprovalRequired);
}

#[test]
fn approve_flow_resolves_through_engine_confirmation() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let outcome = state.apply_snapshot(
        &stamped(
            Stage::Approval,
            Status::ApprovalRequired,
            95,
            "2026-08-24T10:00:00+00:00",
        ),
        1_000,
    );
    assert!(outcome.approval_edge);

    state.begin_decision().expect("gate open");

    // The engine confirms the decision: back to running, then terminal.
    state.apply_snapshot(
        &stamped(Stage::Approval, Status::Running, 95, "2026-08-24T10:00:05+00:00"),
        2_000,
    );
    assert_eq!(state.view().status, Status::Running);

    let outcome = state.apply_snapshot(
        &stamped(Stage::Done, Status::Completed, 100, "2026-08-24T10:00:10+00:00"),
        3_000,
    );
    assert_eq!(outcome.reached_terminal, Some(Status::Completed));
    assert_eq!(state.view().stage, Stage::Done);
    assert_eq!(state.view().percentage, 100);
}

#[test]
fn a_stale_running_poll_cannot_clear_a_pending_gate() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(
        &stamped(
            Stage::Approval,
            Status::ApprovalRequired,
            95,
            "2026-08-24T10:00:10+00:00",
        ),
        1_000,
    );

    // A concurrent poll still reporting running, stamped before the gate.
    state.apply_snapshot(
        &stamped(Stage::Approval, Status::Running, 95, "2026-08-24T10:00:08+00:00"),
        2_000,
    );
    assert_eq!(state.view().status, Status::ApprovalRequired);

    // An unstamped running report loses too.
    state.apply_snapshot(&snapshot(Stage::Approval, Status::Running, 95), 3_000);
    assert_eq!(state.view().status, Status::ApprovalRequired);
}

#[test]
fn deciding_after_cancellation_is_rejected_at_call_time() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::Approval, Status::ApprovalRequired, 95), 1_000);

    // The engine resolves the workflow before the human decides.
    state.apply_snapshot(&snapshot(Stage::Approval, Status::Cancelled, 95), 2_000);
    assert_eq!(
        state.begin_decision(),
        Err(GateBlocked::NotAwaitingApproval(Status::Cancelled))
    );
    assert_eq!(state.view().status, Status::Cancelled);
}

#[test]
fn narration_events_never_move_stage_or_percentage() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::Copywriting, Status::Running, 30), 1_000);

    let thought = event(
        r#"{"type":"thought","workflowId":"wf-1","data":{"content":"Writing the product headline","node_name":"copywriter"}}"#,
        2_000,
    );
    let tool_call = event(
        r#"{"type":"tool_call","workflowId":"wf-1","data":{"tool_name":"image_prompt_builder","status":"in_progress"}}"#,
        3_000,
    );
    state.apply_event(&thought);
    state.apply_event(&tool_call);

    assert_eq!(state.view().stage, Stage::Copywriting);
    assert_eq!(state.view().percentage, 30);
    assert_eq!(state.view().current_step_label, "image_prompt_builder");
    assert_eq!(state.step_log().len(), 2);
}

#[test]
fn duplicate_stream_events_are_suppressed_by_fingerprint() {
    let frame = r#"{"type":"thought","workflowId":"wf-1","data":{"content":"replayed on reconnect"},"timestamp":"2026-08-24T10:00:00+00:00"}"#;
    let mut state = ReconcileState::new(workflow("wf-1"));

    let outcome = state.apply_event(&event(frame, 1_000));
    assert!(outcome.log_appended);
    let outcome = state.apply_event(&event(frame, 2_000));
    assert_eq!(outcome.dropped, Some(DropReason::Duplicate));
    assert_eq!(state.step_log().len(), 1);
}

#[test]
fn fatal_error_events_fail_the_workflow_once() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::VideoGeneration, Status::Running, 70), 1_000);

    // A transient error narrates but does not fail the run.
    let transient = event(
        r#"{"type":"error","workflowId":"wf-1","data":{"code":"RATE_LIMITED","message":"provider rate limited"}}"#,
        2_000,
    );
    state.apply_event(&transient);
    assert_eq!(state.view().status, Status::Running);
    assert_eq!(
        state.view().error_message.as_deref(),
        Some("provider rate limited")
    );

    let fatal = event(
        r#"{"type":"error","workflowId":"wf-1","data":{"code":"GENERATION_FAILED","message":"video render crashed"}}"#,
        3_000,
    );
    let outcome = state.apply_event(&fatal);
    assert_eq!(outcome.reached_terminal, Some(Status::Failed));
    // First error message wins and is never overwritten.
    assert_eq!(
        state.view().error_message.as_deref(),
        Some("provider rate limited")
    );
}

#[test]
fn result_events_union_artifacts_and_may_complete_the_run() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    state.apply_snapshot(&snapshot(Stage::QaReview, Status::Running, 88), 1_000);

    let result = event(
        r#"{"type":"result","workflowId":"wf-1","data":{"final":true,"stage":"done","artifacts":{"copy":[{"id":"copy-1","label":"Final copy"}],"images":[{"id":"img-1"}]}}}"#,
        2_000,
    );
    let outcome = state.apply_event(&result);
    assert_eq!(outcome.reached_terminal, Some(Status::Completed));
    assert_eq!(state.view().stage, Stage::Done);
    assert_eq!(state.view().percentage, 100);
    assert_eq!(state.view().artifact_count(), 2);
}

#[test]
fn label_ties_between_channels_favor_the_poll_snapshot() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let at = "2026-08-24T10:00:00+00:00";

    let narrated = event(
        &format!(
            r#"{{"type":"thought","workflowId":"wf-1","data":{{"content":"partial narration"}},"timestamp":"{at}"}}"#
        ),
        500,
    );
    state.apply_event(&narrated);
    assert_eq!(state.view().current_step_label, "partial narration");

    // Same engine instant from the poll: the complete snapshot wins the tie.
    let mut polled = stamped(Stage::Analysis, Status::Running, 12, at);
    polled.current_step = Some("Analyzing product inputs".to_string());
    state.apply_snapshot(&polled, 600);
    assert_eq!(state.view().current_step_label, "Analyzing product inputs");

    // The reverse tie does not take the label back.
    state.apply_event(&event(
        &format!(
            r#"{{"type":"thought","workflowId":"wf-1","data":{{"content":"late narration"}},"timestamp":"{at}"}}"#
        ),
        700,
    ));
    assert_eq!(state.view().current_step_label, "Analyzing product inputs");
}

#[test]
fn foreign_workflow_inputs_never_merge() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let mut foreign = snapshot(Stage::Done, Status::Completed, 100);
    foreign.workflow_id = workflow("wf-other");

    let outcome = state.apply_snapshot(&foreign, 1_000);
    assert_eq!(outcome.dropped, Some(DropReason::ForeignWorkflow));
    assert_eq!(state.view().status, Status::Pending);
    assert_eq!(state.view().stage, Stage::Init);
}

#[test]
fn progress_events_move_position_like_snapshots() {
    let mut state = ReconcileState::new(workflow("wf-1"));
    let advance = event(
        r#"{"type":"progress","workflowId":"wf-1","data":{"stage":"copywriting","percentage":28,"current_step":"Drafting body copy"}}"#,
        1_000,
    );
    state.apply_event(&advance);
    assert_eq!(state.view().stage, Stage::Copywriting);
    assert_eq!(state.view().percentage, 28);

    // Stale progress obeys the same monotonicity rules.
    let stale = event(
        r#"{"type":"progress","workflowId":"wf-1","data":{"stage":"analysis","percentage":12}}"#,
        2_000,
    );
    let outcome = state.apply_event(&stale);
    assert!(!outcome.view_changed);
    assert_eq!(state.view().stage, Stage::Copywriting);
}
