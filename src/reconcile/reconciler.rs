use crate::reconcile::merge::{DropReason, GateBlocked, GatePhase, MergeOutcome, ReconcileState};
use crate::reconcile::view::{ProgressView, StatusSnapshot, StepLogEntry};
use crate::runtime::logging::append_runtime_log;
use crate::runtime::paths::RuntimePaths;
use crate::shared::ids::WorkflowId;
use crate::transport::events::StreamEvent;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub type ViewCallback = Arc<dyn Fn(&ProgressView) + Send + Sync>;

struct Inner {
    active: Option<ReconcileState>,
    subscribers: BTreeMap<u64, ViewCallback>,
    approval_watchers: BTreeMap<u64, ViewCallback>,
    next_handle: u64,
}

/// Single writer of `ProgressView`. Both input channels land here and every
/// merge runs under one lock; readers get clones. Callbacks run after the
/// lock is released so a slow subscriber cannot stall a merge.
pub struct Reconciler {
    inner: Mutex<Inner>,
    paths: RuntimePaths,
}

impl Reconciler {
    pub fn new(paths: RuntimePaths) -> Reconciler {
        Reconciler {
            inner: Mutex::new(Inner {
                active: None,
                subscribers: BTreeMap::new(),
                approval_watchers: BTreeMap::new(),
                next_handle: 1,
            }),
            paths,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Starts tracking a workflow. Switching to a different id discards the
    /// previous state entirely; re-activating the current id keeps it.
    pub fn activate(&self, workflow_id: WorkflowId) {
        let mut inner = self.lock_inner();
        if inner
            .active
            .as_ref()
            .is_some_and(|state| state.view().workflow_id == workflow_id)
        {
            return;
        }
        inner.active = Some(ReconcileState::new(workflow_id.clone()));
        drop(inner);
        append_runtime_log(
            &self.paths,
            "info",
            "reconciler.activate",
            &format!("tracking workflow {workflow_id}"),
        );
    }

    pub fn active_workflow(&self) -> Option<WorkflowId> {
        self.lock_inner()
            .active
            .as_ref()
            .map(|state| state.view().workflow_id.clone())
    }

    /// Releases a finished workflow once the consumer has seen the terminal
    /// view. Returns false while the workflow is still in flight.
    pub fn acknowledge_terminal(&self) -> bool {
        let mut inner = self.lock_inner();
        let terminal = inner
            .active
            .as_ref()
            .is_some_and(|state| state.view().is_terminal());
        if !terminal {
            return false;
        }
        let released = inner.active.take();
        drop(inner);
        if let Some(state) = released {
            append_runtime_log(
                &self.paths,
                "info",
                "reconciler.released",
                &format!(
                    "workflow {} released after {}",
                    state.view().workflow_id,
                    state.view().status
                ),
            );
        }
        true
    }

    pub fn progress_view(&self) -> Option<ProgressView> {
        self.lock_inner()
            .active
            .as_ref()
            .map(|state| state.view().clone())
    }

    pub fn step_log(&self) -> Vec<StepLogEntry> {
        self.lock_inner()
            .active
            .as_ref()
            .map(|state| state.step_log().to_vec())
            .unwrap_or_default()
    }

    pub fn gate_phase(&self) -> Option<GatePhase> {
        self.lock_inner()
            .active
            .as_ref()
            .map(|state| state.gate_phase())
    }

    /// Registers a change subscriber. The handle works with `unsubscribe`.
    pub fn subscribe(&self, callback: ViewCallback) -> u64 {
        let mut inner = self.lock_inner();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.subscribers.insert(handle, callback);
        handle
    }

    /// Registers an approval-edge watcher, fired once per occurrence.
    pub fn on_approval_required(&self, callback: ViewCallback) -> u64 {
        let mut inner = self.lock_inner();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.approval_watchers.insert(handle, callback);
        handle
    }

    pub fn unsubscribe(&self, handle: u64) {
        let mut inner = self.lock_inner();
        inner.subscribers.remove(&handle);
        inner.approval_watchers.remove(&handle);
    }

    pub fn clear_callbacks(&self) {
        let mut inner = self.lock_inner();
        inner.subscribers.clear();
        inner.approval_watchers.clear();
    }

    pub fn ingest_event(&self, event: &StreamEvent) -> MergeOutcome {
        let mut inner = self.lock_inner();
        let Some(state) = inner.active.as_mut() else {
            drop(inner);
            let outcome = MergeOutcome {
                dropped: Some(DropReason::NoActiveWorkflow),
                ..MergeOutcome::default()
            };
            self.log_outcome("event", &event.workflow_id, None, &outcome);
            return outcome;
        };
        let outcome = state.apply_event(event);
        let view = state.view().clone();
        let (subscribers, watchers) = collect_callbacks(&inner, &outcome);
        drop(inner);
        self.log_outcome("event", &event.workflow_id, Some(&view), &outcome);
        notify(&view, watchers, subscribers);
        outcome
    }

    pub fn ingest_snapshot(&self, snapshot: &StatusSnapshot, received_at_ms: i64) -> MergeOutcome {
        let mut inner = self.lock_inner();
        let Some(state) = inner.active.as_mut() else {
            drop(inner);
            let outcome = MergeOutcome {
                dropped: Some(DropReason::NoActiveWorkflow),
                ..MergeOutcome::default()
            };
            self.log_outcome("snapshot", &snapshot.workflow_id, None, &outcome);
            return outcome;
        };
        let outcome = state.apply_snapshot(snapshot, received_at_ms);
        let view = state.view().clone();
        let (subscribers, watchers) = collect_callbacks(&inner, &outcome);
        drop(inner);
        self.log_outcome("snapshot", &snapshot.workflow_id, Some(&view), &outcome);
        notify(&view, watchers, subscribers);
        outcome
    }

    /// Opens the decision slot ahead of an approve/reject submission.
    pub fn begin_decision(&self) -> Result<(), GateBlocked> {
        let mut inner = self.lock_inner();
        match inner.active.as_mut() {
            Some(state) => state.begin_decision(),
            None => Err(GateBlocked::NoActiveWorkflow),
        }
    }

    /// Re-arms the gate after a submission that never reached the engine.
    pub fn cancel_decision(&self) {
        let mut inner = self.lock_inner();
        if let Some(state) = inner.active.as_mut() {
            state.cancel_decision();
        }
    }

    fn log_outcome(
        &self,
        channel: &str,
        workflow_id: &WorkflowId,
        view: Option<&ProgressView>,
        outcome: &MergeOutcome,
    ) {
        if let Some(reason) = outcome.dropped {
            append_runtime_log(
                &self.paths,
                "debug",
                "reconciler.dropped",
                &format!("{channel} for workflow {workflow_id} dropped: {reason}"),
            );
            return;
        }
        let Some(view) = view else {
            return;
        };
        if let Some(status) = outcome.reached_terminal {
            append_runtime_log(
                &self.paths,
                "info",
                "reconciler.terminal",
                &format!(
                    "workflow {workflow_id} finished {status} at stage {} ({}%)",
                    view.stage, view.percentage
                ),
            );
            return;
        }
        if outcome.approval_edge {
            append_runtime_log(
                &self.paths,
                "info",
                "reconciler.approval_required",
                &format!("workflow {workflow_id} awaits approval at stage {}", view.stage),
            );
            return;
        }
        if outcome.view_changed {
            append_runtime_log(
                &self.paths,
                "debug",
                "reconciler.view_changed",
                &format!(
                    "workflow {workflow_id} stage {} status {} at {}%",
                    view.stage, view.status, view.percentage
                ),
            );
        }
    }
}

fn collect_callbacks(inner: &Inner, outcome: &MergeOutcome) -> (Vec<ViewCallback>, Vec<ViewCallback>) {
    let subscribers = if outcome.notifies_subscribers() {
        inner.subscribers.values().cloned().collect()
    } else {
        Vec::new()
    };
    let watchers = if outcome.approval_edge {
        inner.approval_watchers.values().cloned().collect()
    } else {
        Vec::new()
    };
    (subscribers, watchers)
}

fn notify(view: &ProgressView, watchers: Vec<ViewCallback>, subscribers: Vec<ViewCallback>) {
    for watcher in watchers {
        watcher(view);
    }
    for subscriber in subscribers {
        subscriber(view);
    }
}
