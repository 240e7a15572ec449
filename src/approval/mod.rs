use crate::engine::api::{DecisionAck, EngineApiClient};
use crate::engine::EngineError;
use crate::reconcile::merge::GateBlocked;
use crate::reconcile::reconciler::Reconciler;
use crate::reconcile::view::Status;
use crate::runtime::logging::append_runtime_log;
use crate::runtime::paths::RuntimePaths;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("no active workflow to decide on")]
    NoActiveWorkflow,
    /// The approval window is gone: the workflow is not awaiting approval
    /// any more, either locally or on the engine.
    #[error("workflow is not awaiting approval (status {status})")]
    DecisionRejected { status: Status },
    #[error("a decision is already being submitted")]
    AlreadySubmitted,
    #[error("decision submission failed: {0}")]
    Submit(String),
}

/// Human-in-the-loop checkpoint. Fires through the reconciler's approval
/// watchers on each `approval_required` edge; `decide` submits the verdict.
///
/// The gate never mutates the progress view itself. The engine's answer is
/// observed again through polling and streaming, like any other change.
pub struct ApprovalGate {
    api: EngineApiClient,
    reconciler: Arc<Reconciler>,
    paths: RuntimePaths,
}

impl ApprovalGate {
    pub fn new(api: EngineApiClient, reconciler: Arc<Reconciler>, paths: RuntimePaths) -> Self {
        Self {
            api,
            reconciler,
            paths,
        }
    }

    /// Submits an approve/reject decision for the active workflow.
    ///
    /// The gate state is checked at call time: if the workflow already moved
    /// on (resolved elsewhere, cancelled, finished) this returns
    /// `DecisionRejected` instead of submitting.
    pub fn decide(
        &self,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<DecisionAck, DecisionError> {
        let Some(workflow_id) = self.reconciler.active_workflow() else {
            return Err(DecisionError::NoActiveWorkflow);
        };
        self.reconciler.begin_decision().map_err(map_gate_blocked)?;
        match self.api.submit_decision(&workflow_id, decision.as_str(), comment) {
            Ok(ack) => {
                append_runtime_log(
                    &self.paths,
                    "info",
                    "approval.submitted",
                    &format!("{decision} submitted for workflow {workflow_id}"),
                );
                Ok(ack)
            }
            Err(err) => {
                self.reconciler.cancel_decision();
                append_runtime_log(
                    &self.paths,
                    "warn",
                    "approval.submit_failed",
                    &format!("{decision} for workflow {workflow_id} failed: {err}"),
                );
                Err(self.map_submit_error(err))
            }
        }
    }

    fn map_submit_error(&self, error: EngineError) -> DecisionError {
        match error.http_status() {
            // The engine refused the decision: the window closed on its side.
            Some(400) | Some(404) | Some(409) => {
                let status = self
                    .reconciler
                    .progress_view()
                    .map(|view| view.status)
                    .unwrap_or(Status::Running);
                DecisionError::DecisionRejected { status }
            }
            _ => DecisionError::Submit(error.to_string()),
        }
    }
}

fn map_gate_blocked(blocked: GateBlocked) -> DecisionError {
    match blocked {
        GateBlocked::NoActiveWorkflow => DecisionError::NoActiveWorkflow,
        GateBlocked::NotAwaitingApproval(status) => DecisionError::DecisionRejected { status },
        GateBlocked::DecisionInFlight => DecisionError::AlreadySubmitted,
    }
}
