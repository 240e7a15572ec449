pub mod api;

pub use api::{DecisionAck, EngineApiClient, GenerateAck, GenerateRequest};

/// Failures talking to the workflow engine over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request never produced an HTTP response (DNS, refused, timeout).
    #[error("engine request failed: {0}")]
    Request(String),
    /// The engine answered with a non-success status.
    #[error("engine returned status {status}: {body}")]
    Response { status: u16, body: String },
    #[error("failed to decode engine response for {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// HTTP status when the engine answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            EngineError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}
