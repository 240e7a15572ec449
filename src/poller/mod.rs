use crate::engine::api::EngineApiClient;
use crate::engine::EngineError;
use crate::reconcile::view::StatusSnapshot;
use crate::runtime::logging::append_runtime_log;
use crate::runtime::paths::RuntimePaths;
use crate::runtime::session::SessionSignal;
use crate::shared::ids::WorkflowId;
use crate::shared::time::{now_millis, sleep_with_stop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

/// Everything one polling thread needs for its workflow.
#[derive(Clone)]
pub struct PollContext {
    pub api: EngineApiClient,
    pub workflow_id: WorkflowId,
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub paths: RuntimePaths,
}

/// Polls the status endpoint on a fixed cadence, starting immediately.
///
/// Requests run sequentially and each is bounded by the poll timeout, which
/// settings validation keeps below the interval, so at most one request is
/// ever in flight. A terminal snapshot is forwarded once and ends the loop.
/// Failures retry next tick; after `max_consecutive_failures` in a row a
/// single degraded notice goes out, re-armed by the next success.
pub fn run_poll_loop(context: &PollContext, tx: &Sender<SessionSignal>, stop: &AtomicBool) {
    run_poll_loop_with(context, tx, stop, |workflow_id| {
        context.api.fetch_status(workflow_id)
    });
}

/// The polling loop with the status fetch injected, so its schedule can be
/// exercised without a reachable engine.
pub fn run_poll_loop_with<F>(
    context: &PollContext,
    tx: &Sender<SessionSignal>,
    stop: &AtomicBool,
    fetch: F,
) where
    F: Fn(&WorkflowId) -> Result<StatusSnapshot, EngineError>,
{
    let mut consecutive_failures: u32 = 0;
    let mut degraded_notified = false;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let started = Instant::now();
        match fetch(&context.workflow_id) {
            Ok(snapshot) => {
                consecutive_failures = 0;
                degraded_notified = false;
                let terminal = snapshot.status.is_terminal();
                let status = snapshot.status;
                let _ = tx.send(SessionSignal::Snapshot {
                    snapshot,
                    received_at_ms: now_millis(),
                });
                if terminal {
                    append_runtime_log(
                        &context.paths,
                        "info",
                        "poller.terminal",
                        &format!(
                            "workflow {} reported {status}, polling stopped",
                            context.workflow_id
                        ),
                    );
                    break;
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                append_runtime_log(
                    &context.paths,
                    "warn",
                    "poller.fetch_failed",
                    &format!(
                        "poll {consecutive_failures} for workflow {} failed: {err}",
                        context.workflow_id
                    ),
                );
                if consecutive_failures >= context.max_consecutive_failures && !degraded_notified {
                    degraded_notified = true;
                    append_runtime_log(
                        &context.paths,
                        "warn",
                        "poller.degraded",
                        &format!(
                            "workflow {} status polling degraded after {consecutive_failures} consecutive failures",
                            context.workflow_id
                        ),
                    );
                    let _ = tx.send(SessionSignal::PollDegraded {
                        workflow_id: context.workflow_id.clone(),
                        consecutive_failures,
                    });
                }
            }
        }
        let wait = context.interval.saturating_sub(started.elapsed());
        if !sleep_with_stop(wait, stop) {
            break;
        }
    }
}
