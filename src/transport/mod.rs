pub mod events;
pub mod socket;

pub use events::{
    decode_stream_text, event_fingerprint, EventDecodeError, EventKind, EventPayload, StreamEvent,
    ToolCallStatus,
};
pub use socket::{load_stream_health, run_stream_loop, StreamContext, StreamHealth};

/// Typed callbacks the stream transport raises toward the session.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    Connected,
    Disconnected,
    /// Raised once when reconnecting gave up; no further attempts happen
    /// until the caller reconnects explicitly.
    ConnectError { detail: String },
    Event(StreamEvent),
}
