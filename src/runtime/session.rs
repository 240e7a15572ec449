use crate::approval::{ApprovalGate, Decision, DecisionError};
use crate::config::{ConfigError, EngineCredentials, Settings};
use crate::engine::api::{DecisionAck, EngineApiClient, GenerateAck, GenerateRequest};
use crate::engine::EngineError;
use crate::poller::{run_poll_loop, PollContext};
use crate::reconcile::merge::GatePhase;
use crate::reconcile::reconciler::{Reconciler, ViewCallback};
use crate::reconcile::view::{ProgressView, StatusSnapshot, StepLogEntry};
use crate::runtime::logging::append_runtime_log;
use crate::runtime::paths::{bootstrap_runtime_root, RuntimePaths};
use crate::shared::errors::RuntimeError;
use crate::shared::ids::{PackageId, WorkflowId};
use crate::transport::socket::{run_stream_loop, StreamContext};
use crate::transport::StreamSignal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const LOOP_TICK: Duration = Duration::from_millis(50);

/// Inputs funneled into the session loop. The stream and poll workers are the
/// only producers; the loop thread is the only consumer and the only caller
/// of the reconciler's merge methods.
#[derive(Debug)]
pub enum SessionSignal {
    Stream(StreamSignal),
    Snapshot {
        snapshot: StatusSnapshot,
        received_at_ms: i64,
    },
    PollDegraded {
        workflow_id: WorkflowId,
        consecutive_failures: u32,
    },
}

/// Connection and degradation notices surfaced to subscribers. Workflow-level
/// failure travels through `ProgressView` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StreamConnected,
    StreamDisconnected,
    /// Reconnecting gave up; a new `connect` call is required.
    StreamConnectError { detail: String },
    /// Polling kept failing but stays scheduled; streaming may still be fine.
    PollDegraded {
        workflow_id: WorkflowId,
        consecutive_failures: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type NoticeCallback = Arc<dyn Fn(&SessionNotice) + Send + Sync>;

#[derive(Default)]
struct NoticeRegistry {
    subscribers: BTreeMap<u64, NoticeCallback>,
    next_handle: u64,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    fn stop_and_join(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

/// Owns the whole tracking pipeline for one consumer: the stream worker, the
/// per-workflow poll worker, the session loop draining their signals into the
/// reconciler, and the approval gate.
///
/// Workers are plain threads with stop flags, joined on every exit path;
/// `Drop` runs a full shutdown so a session can never leak its threads.
pub struct WorkflowSession {
    settings: Settings,
    paths: RuntimePaths,
    api: EngineApiClient,
    reconciler: Arc<Reconciler>,
    gate: ApprovalGate,
    active_workflow: Arc<Mutex<Option<WorkflowId>>>,
    notices: Arc<Mutex<NoticeRegistry>>,
    signal_tx: Sender<SessionSignal>,
    loop_worker: Option<Worker>,
    stream_worker: Option<Worker>,
    poll_worker: Option<Worker>,
}

impl WorkflowSession {
    /// Validates settings, bootstraps the state root and starts the session
    /// loop. No network traffic happens until `connect` and
    /// `set_active_workflow`.
    pub fn start(
        settings: Settings,
        credentials: &EngineCredentials,
    ) -> Result<WorkflowSession, SessionError> {
        settings.validate()?;
        let paths = RuntimePaths::new(settings.resolve_state_root()?);
        bootstrap_runtime_root(&paths)?;

        let api = EngineApiClient::new(&settings, credentials);
        let reconciler = Arc::new(Reconciler::new(paths.clone()));
        let gate = ApprovalGate::new(api.clone(), reconciler.clone(), paths.clone());
        let notices = Arc::new(Mutex::new(NoticeRegistry::default()));

        let (signal_tx, signal_rx) = mpsc::channel::<SessionSignal>();
        let stop = Arc::new(AtomicBool::new(false));
        let loop_worker = {
            let reconciler = reconciler.clone();
            let notices = notices.clone();
            let paths = paths.clone();
            let stop_flag = stop.clone();
            Worker {
                stop,
                handle: thread::spawn(move || {
                    run_session_loop(signal_rx, &reconciler, &notices, &paths, &stop_flag)
                }),
            }
        };

        append_runtime_log(&paths, "info", "session.started", "workflow session ready");
        Ok(WorkflowSession {
            settings,
            paths,
            api,
            reconciler,
            gate,
            active_workflow: Arc::new(Mutex::new(None)),
            notices,
            signal_tx,
            loop_worker: Some(loop_worker),
            stream_worker: None,
            poll_worker: None,
        })
    }

    /// Brings the event stream up. Returns false without touching the network
    /// when no usable credential is available. Reconnecting an already
    /// connected session replaces the stream worker.
    pub fn connect(&mut self, credentials: &EngineCredentials) -> bool {
        if !credentials.is_usable() {
            append_runtime_log(
                &self.paths,
                "warn",
                "session.connect_refused",
                "no usable engine credential, stream left offline",
            );
            return false;
        }
        if let Some(worker) = self.stream_worker.take() {
            worker.stop_and_join();
        }
        let context = StreamContext {
            stream_url: self.settings.stream_url.clone(),
            bearer_token: credentials.bearer_token.clone(),
            reconnect_backoff: Duration::from_millis(self.settings.reconnect_backoff_ms),
            max_reconnect_attempts: self.settings.max_reconnect_attempts,
            active_workflow: self.active_workflow.clone(),
            paths: self.paths.clone(),
        };
        let tx = self.signal_tx.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        self.stream_worker = Some(Worker {
            stop,
            handle: thread::spawn(move || run_stream_loop(&context, &tx, &stop_flag)),
        });
        true
    }

    /// Switches tracking to `workflow_id`: the old poll worker stops, the
    /// stream filter moves over, reconciler state resets and a fresh poll
    /// worker starts with an immediate first request. An in-flight poll for
    /// the old id may still land but is dropped as a foreign-workflow input.
    pub fn set_active_workflow(&mut self, workflow_id: WorkflowId) {
        if let Some(worker) = self.poll_worker.take() {
            worker.stop_and_join();
        }
        {
            let mut active = lock_cell(&self.active_workflow);
            *active = Some(workflow_id.clone());
        }
        self.reconciler.activate(workflow_id.clone());

        let context = PollContext {
            api: self.api.clone(),
            workflow_id: workflow_id.clone(),
            interval: self.settings.poll_interval(),
            max_consecutive_failures: self.settings.max_consecutive_poll_failures,
            paths: self.paths.clone(),
        };
        let tx = self.signal_tx.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        self.poll_worker = Some(Worker {
            stop,
            handle: thread::spawn(move || run_poll_loop(&context, &tx, &stop_flag)),
        });
        append_runtime_log(
            &self.paths,
            "info",
            "session.workflow_activated",
            &format!("now tracking workflow {workflow_id}"),
        );
    }

    pub fn active_workflow(&self) -> Option<WorkflowId> {
        lock_cell(&self.active_workflow).clone()
    }

    pub fn progress_view(&self) -> Option<ProgressView> {
        self.reconciler.progress_view()
    }

    pub fn step_log(&self) -> Vec<StepLogEntry> {
        self.reconciler.step_log()
    }

    pub fn gate_phase(&self) -> Option<GatePhase> {
        self.reconciler.gate_phase()
    }

    /// Change subscription; the callback runs on the session loop thread
    /// after each merge that altered the view or appended narration.
    pub fn subscribe(&self, callback: ViewCallback) -> u64 {
        self.reconciler.subscribe(callback)
    }

    /// Fires once per `approval_required` occurrence.
    pub fn on_approval_required(&self, callback: ViewCallback) -> u64 {
        self.reconciler.on_approval_required(callback)
    }

    pub fn unsubscribe(&self, handle: u64) {
        self.reconciler.unsubscribe(handle);
    }

    /// Connection and degraded-polling notices.
    pub fn subscribe_notices(&self, callback: NoticeCallback) -> u64 {
        let mut registry = lock_cell(&self.notices);
        registry.next_handle += 1;
        let handle = registry.next_handle;
        registry.subscribers.insert(handle, callback);
        handle
    }

    pub fn unsubscribe_notices(&self, handle: u64) {
        lock_cell(&self.notices).subscribers.remove(&handle);
    }

    /// Submits an approve/reject decision for the active workflow. The
    /// resulting state change is observed through polling and streaming, not
    /// applied locally.
    pub fn decide(
        &self,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<DecisionAck, DecisionError> {
        self.gate.decide(decision, comment)
    }

    /// Boundary convenience: kicks off a generation run. The caller is
    /// expected to `set_active_workflow` with the returned workflow id.
    pub fn start_generation(
        &self,
        package_id: &PackageId,
        request: &GenerateRequest,
    ) -> Result<GenerateAck, EngineError> {
        self.api.start_generation(package_id, request)
    }

    /// Releases a terminal view once the consumer has taken note of it.
    /// Returns false while the workflow is still in flight.
    pub fn acknowledge_terminal(&mut self) -> bool {
        if !self.reconciler.acknowledge_terminal() {
            return false;
        }
        if let Some(worker) = self.poll_worker.take() {
            worker.stop_and_join();
        }
        let mut active = lock_cell(&self.active_workflow);
        *active = None;
        true
    }

    /// Stops the stream worker and clears every registered callback.
    /// Idempotent; polling and the session loop keep running.
    pub fn disconnect(&mut self) {
        if let Some(worker) = self.stream_worker.take() {
            worker.stop_and_join();
        }
        self.reconciler.clear_callbacks();
        lock_cell(&self.notices).subscribers.clear();
    }

    /// Full teardown: stream, poll worker and session loop are stopped and
    /// joined. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.disconnect();
        if let Some(worker) = self.poll_worker.take() {
            worker.stop_and_join();
        }
        if let Some(worker) = self.loop_worker.take() {
            worker.stop_and_join();
        }
    }

    #[cfg(test)]
    pub(crate) fn signal_sender(&self) -> Sender<SessionSignal> {
        self.signal_tx.clone()
    }
}

impl Drop for WorkflowSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_cell<T>(cell: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(|err| err.into_inner())
}

fn run_session_loop(
    rx: Receiver<SessionSignal>,
    reconciler: &Reconciler,
    notices: &Mutex<NoticeRegistry>,
    paths: &RuntimePaths,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(LOOP_TICK) {
            Ok(signal) => handle_signal(signal, reconciler, notices, paths),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn handle_signal(
    signal: SessionSignal,
    reconciler: &Reconciler,
    notices: &Mutex<NoticeRegistry>,
    paths: &RuntimePaths,
) {
    match signal {
        SessionSignal::Stream(StreamSignal::Event(event)) => {
            reconciler.ingest_event(&event);
        }
        SessionSignal::Snapshot {
            snapshot,
            received_at_ms,
        } => {
            reconciler.ingest_snapshot(&snapshot, received_at_ms);
        }
        SessionSignal::Stream(StreamSignal::Connected) => {
            dispatch_notice(notices, &SessionNotice::StreamConnected);
        }
        SessionSignal::Stream(StreamSignal::Disconnected) => {
            dispatch_notice(notices, &SessionNotice::StreamDisconnected);
        }
        SessionSignal::Stream(StreamSignal::ConnectError { detail }) => {
            append_runtime_log(
                paths,
                "error",
                "session.stream_unavailable",
                &format!("stream gave up: {detail}"),
            );
            dispatch_notice(notices, &SessionNotice::StreamConnectError { detail });
        }
        SessionSignal::PollDegraded {
            workflow_id,
            consecutive_failures,
        } => {
            dispatch_notice(
                notices,
                &SessionNotice::PollDegraded {
                    workflow_id,
                    consecutive_failures,
                },
            );
        }
    }
}

fn dispatch_notice(notices: &Mutex<NoticeRegistry>, notice: &SessionNotice) {
    let callbacks: Vec<NoticeCallback> = lock_cell(notices).subscribers.values().cloned().collect();
    for callback in callbacks {
        callback(notice);
    }
}
