use crate::runtime::logging::append_runtime_log;
use crate::runtime::paths::RuntimePaths;
use crate::runtime::session::SessionSignal;
use crate::shared::ids::WorkflowId;
use crate::shared::time::{now_millis, now_secs, sleep_with_stop};
use crate::transport::events::decode_stream_text;
use crate::transport::StreamSignal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect, Message, WebSocket};

const SOCKET_IDLE_SLEEP: Duration = Duration::from_millis(40);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(15);
const JITTER_CEILING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    Retryable,
    NonRetryable,
}

/// Stream connection state persisted for inspection while a session runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamHealth {
    pub connected: bool,
    pub last_event_at: Option<i64>,
    pub last_reconnect: Option<i64>,
    pub last_error: Option<String>,
}

pub fn load_stream_health(paths: &RuntimePaths) -> StreamHealth {
    let Ok(raw) = fs::read_to_string(paths.stream_health_path()) else {
        return StreamHealth::default();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

fn save_stream_health(paths: &RuntimePaths, health: &StreamHealth) {
    let path = paths.stream_health_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(body) = serde_json::to_vec_pretty(health) {
        let _ = fs::write(&path, body);
    }
}

/// Everything the stream thread needs. The active-workflow cell is shared
/// with the session, which moves it when the caller switches workflows.
#[derive(Clone)]
pub struct StreamContext {
    pub stream_url: String,
    pub bearer_token: String,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub active_workflow: Arc<Mutex<Option<WorkflowId>>>,
    pub paths: RuntimePaths,
}

enum FailureNext {
    Retry(Duration),
    GiveUp(String),
}

/// Connects, reads and reconnects until stopped or retries are exhausted.
/// Inbound events are filtered against the active workflow before they are
/// forwarded; everything else is logged and dropped here.
pub fn run_stream_loop(context: &StreamContext, tx: &Sender<SessionSignal>, stop: &AtomicBool) {
    let mut health = load_stream_health(&context.paths);
    let mut failed_attempts: u32 = 0;
    let url = stream_endpoint(&context.stream_url, &context.bearer_token);

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        health.last_reconnect = Some(now_secs());

        let (mut socket, _) = match connect(url.as_str()) {
            Ok(connection) => connection,
            Err(err) => {
                let class = classify_stream_failure(&err);
                let message = format_stream_error("stream connect failed", &err.to_string(), class);
                match register_connect_failure(
                    context,
                    &mut health,
                    &mut failed_attempts,
                    message,
                    class,
                ) {
                    FailureNext::GiveUp(detail) => {
                        let _ = tx.send(SessionSignal::Stream(StreamSignal::ConnectError {
                            detail,
                        }));
                        break;
                    }
                    FailureNext::Retry(delay) => {
                        if !sleep_with_stop(delay, stop) {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        if let Err(detail) = set_socket_nonblocking(&mut socket) {
            // A blocking socket would pin the read loop and starve the stop
            // flag, so treat this connection as unusable.
            let _ = socket.close(None);
            match register_connect_failure(
                context,
                &mut health,
                &mut failed_attempts,
                detail,
                RetryClass::Retryable,
            ) {
                FailureNext::GiveUp(detail) => {
                    let _ = tx.send(SessionSignal::Stream(StreamSignal::ConnectError { detail }));
                    break;
                }
                FailureNext::Retry(delay) => {
                    if !sleep_with_stop(delay, stop) {
                        break;
                    }
                    continue;
                }
            }
        }

        failed_attempts = 0;
        health.connected = true;
        health.last_error = None;
        save_stream_health(&context.paths, &health);
        append_runtime_log(
            &context.paths,
            "info",
            "stream.connected",
            &format!("stream online at {}", context.stream_url),
        );
        let _ = tx.send(SessionSignal::Stream(StreamSignal::Connected));

        let outcome = process_single_connection(&mut socket, context, tx, stop, &mut health);

        health.connected = false;
        save_stream_health(&context.paths, &health);
        append_runtime_log(&context.paths, "info", "stream.disconnected", "stream offline");
        let _ = tx.send(SessionSignal::Stream(StreamSignal::Disconnected));

        match outcome {
            ConnectionOutcome::StopRequested => break,
            ConnectionOutcome::Dropped => {
                if !sleep_with_stop(reconnect_delay(context.reconnect_backoff, 1), stop) {
                    break;
                }
            }
        }
    }

    if health.connected {
        health.connected = false;
        save_stream_health(&context.paths, &health);
    }
}

fn register_connect_failure(
    context: &StreamContext,
    health: &mut StreamHealth,
    failed_attempts: &mut u32,
    message: String,
    class: RetryClass,
) -> FailureNext {
    health.connected = false;
    health.last_error = Some(message.clone());
    save_stream_health(&context.paths, health);
    append_runtime_log(&context.paths, "warn", "stream.connect_failed", &message);
    *failed_attempts += 1;
    if class == RetryClass::NonRetryable || *failed_attempts >= context.max_reconnect_attempts {
        append_runtime_log(
            &context.paths,
            "error",
            "stream.gave_up",
            &format!("stopping reconnects after {failed_attempts} attempts: {message}"),
        );
        return FailureNext::GiveUp(message);
    }
    FailureNext::Retry(reconnect_delay(context.reconnect_backoff, *failed_attempts))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionOutcome {
    Dropped,
    StopRequested,
}

fn process_single_connection(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    context: &StreamContext,
    tx: &Sender<SessionSignal>,
    stop: &AtomicBool,
    health: &mut StreamHealth,
) -> ConnectionOutcome {
    let mut outcome = ConnectionOutcome::Dropped;
    loop {
        if stop.load(Ordering::Relaxed) {
            outcome = ConnectionOutcome::StopRequested;
            break;
        }
        match socket.read() {
            Ok(Message::Text(text)) => {
                handle_stream_text(text.as_str(), context, tx, now_millis(), health);
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Ping(payload)) => {
                let _ = socket.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(tungstenite::Error::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                thread::sleep(SOCKET_IDLE_SLEEP);
            }
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(err) => {
                let class = classify_stream_failure(&err);
                let message = format_stream_error("stream read failed", &err.to_string(), class);
                health.last_error = Some(message.clone());
                append_runtime_log(&context.paths, "warn", "stream.read_failed", &message);
                break;
            }
        }
    }
    let _ = socket.close(None);
    outcome
}

/// Decodes one text frame and forwards it when it addresses the active
/// workflow. Events arriving before activation are discarded, not buffered.
fn handle_stream_text(
    text: &str,
    context: &StreamContext,
    tx: &Sender<SessionSignal>,
    observed_at_ms: i64,
    health: &mut StreamHealth,
) {
    let event = match decode_stream_text(text, observed_at_ms) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(err) => {
            append_runtime_log(&context.paths, "warn", "stream.decode_failed", &err.to_string());
            return;
        }
    };
    {
        let active = context
            .active_workflow
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        match active.as_ref() {
            None => {
                append_runtime_log(
                    &context.paths,
                    "debug",
                    "stream.discarded",
                    &format!(
                        "{} event for workflow {} before activation",
                        event.kind, event.workflow_id
                    ),
                );
                return;
            }
            Some(active_id) if event.workflow_id != *active_id => {
                append_runtime_log(
                    &context.paths,
                    "debug",
                    "stream.discarded",
                    &format!(
                        "{} event for inactive workflow {}",
                        event.kind, event.workflow_id
                    ),
                );
                return;
            }
            Some(_) => {}
        }
    }
    health.last_event_at = Some(observed_at_ms);
    let _ = tx.send(SessionSignal::Stream(StreamSignal::Event(event)));
}

fn stream_endpoint(stream_url: &str, token: &str) -> String {
    format!(
        "{}?token={}",
        stream_url.trim_end_matches('/'),
        urlencoding::encode(token)
    )
}

fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(attempt.max(1));
    scaled.min(MAX_RECONNECT_DELAY) + reconnect_jitter(base)
}

fn reconnect_jitter(base: Duration) -> Duration {
    let ceiling = base.min(JITTER_CEILING).as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    let mut seed = [0u8; 8];
    if getrandom::getrandom(&mut seed).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(seed) % (ceiling + 1))
}

fn classify_stream_failure(error: &tungstenite::Error) -> RetryClass {
    if let tungstenite::Error::Http(response) = error {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return RetryClass::NonRetryable;
        }
    }
    let lower = error.to_string().to_ascii_lowercase();
    if ["401", "403", "unauthorized", "forbidden", "invalid token"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        RetryClass::NonRetryable
    } else {
        RetryClass::Retryable
    }
}

fn format_stream_error(context: &str, detail: &str, class: RetryClass) -> String {
    let class = match class {
        RetryClass::Retryable => "retryable",
        RetryClass::NonRetryable => "non_retryable",
    };
    format!("{context} ({class}): {detail}")
}

fn set_socket_nonblocking(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> Result<(), String> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_nonblocking(true),
        MaybeTlsStream::Rustls(stream) => stream.sock.set_nonblocking(true),
        _ => Ok(()),
    }
    .map_err(|err| format!("failed to configure stream socket: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path, active: Option<&str>) -> StreamContext {
        let active_workflow = active.map(|raw| WorkflowId::parse(raw).expect("workflow id"));
        StreamContext {
            stream_url: "ws://127.0.0.1:9".to_string(),
            bearer_token: "token-123".to_string(),
            reconnect_backoff: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            active_workflow: Arc::new(Mutex::new(active_workflow)),
            paths: RuntimePaths::new(dir),
        }
    }

    fn thought_frame(workflow: &str) -> String {
        format!(
            r#"{{"type":"thought","workflowId":"{workflow}","data":{{"content":"drafting outline"}},"timestamp":"2026-08-24T10:00:00+00:00"}}"#
        )
    }

    #[test]
    fn events_before_activation_are_discarded_not_buffered() {
        let dir = tempdir().expect("tempdir");
        let context = context(dir.path(), None);
        let (tx, rx) = mpsc::channel();
        let mut health = StreamHealth::default();

        handle_stream_text(&thought_frame("wf-1"), &context, &tx, 10, &mut health);
        assert!(rx.try_recv().is_err());
        assert_eq!(health.last_event_at, None);

        // Activating afterwards does not resurrect the dropped event.
        *context
            .active_workflow
            .lock()
            .expect("active cell") = Some(WorkflowId::parse("wf-1").expect("workflow id"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn matching_events_are_forwarded_and_tracked() {
        let dir = tempdir().expect("tempdir");
        let context = context(dir.path(), Some("wf-1"));
        let (tx, rx) = mpsc::channel();
        let mut health = StreamHealth::default();

        handle_stream_text(&thought_frame("wf-1"), &context, &tx, 99, &mut health);
        match rx.try_recv().expect("forwarded signal") {
            SessionSignal::Stream(StreamSignal::Event(event)) => {
                assert_eq!(event.workflow_id.as_str(), "wf-1");
            }
            other => panic!("unexpected signal {other:?}"),
        }
        assert_eq!(health.last_event_at, Some(99));
    }

    #[test]
    fn foreign_and_control_frames_are_dropped() {
        let dir = tempdir().expect("tempdir");
        let context = context(dir.path(), Some("wf-1"));
        let (tx, rx) = mpsc::channel();
        let mut health = StreamHealth::default();

        handle_stream_text(&thought_frame("wf-2"), &context, &tx, 10, &mut health);
        handle_stream_text(r#"{"type":"connected"}"#, &context, &tx, 10, &mut health);
        handle_stream_text("{not json", &context, &tx, 10, &mut health);
        assert!(rx.try_recv().is_err());
        assert_eq!(health.last_event_at, None);
    }

    #[test]
    fn stream_health_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let paths = RuntimePaths::new(dir.path());
        let health = StreamHealth {
            connected: true,
            last_event_at: Some(123),
            last_reconnect: Some(456),
            last_error: None,
        };
        save_stream_health(&paths, &health);
        let loaded = load_stream_health(&paths);
        assert!(loaded.connected);
        assert_eq!(loaded.last_event_at, Some(123));
        assert_eq!(loaded.last_reconnect, Some(456));
    }

    #[test]
    fn http_auth_failures_are_non_retryable() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .expect("response");
        assert_eq!(
            classify_stream_failure(&tungstenite::Error::Http(response)),
            RetryClass::NonRetryable
        );
        let io = tungstenite::Error::Io(std::io::Error::new(
            ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(classify_stream_failure(&io), RetryClass::Retryable);
    }

    #[test]
    fn reconnect_delay_grows_linearly_with_bounded_jitter() {
        let base = Duration::from_millis(100);
        for attempt in 1..=4u32 {
            let delay = reconnect_delay(base, attempt);
            let floor = base * attempt;
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= floor + base, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn stream_endpoint_embeds_the_encoded_token() {
        let url = stream_endpoint("ws://127.0.0.1:8000/ws/agents/", "a b+c");
        assert_eq!(url, "ws://127.0.0.1:8000/ws/agents?token=a%20b%2Bc");
    }
}
