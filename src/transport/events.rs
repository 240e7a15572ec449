use crate::reconcile::view::{ArtifactRef, Stage};
use crate::shared::ids::{ArtifactId, WorkflowId};
use crate::shared::time::parse_event_timestamp;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Thought,
    ToolCall,
    Result,
    Error,
    Progress,
    Artifact,
    ApprovalRequired,
}

impl EventKind {
    pub fn parse(raw: &str) -> Option<EventKind> {
        match raw {
            "thought" => Some(EventKind::Thought),
            "tool_call" => Some(EventKind::ToolCall),
            "result" => Some(EventKind::Result),
            "error" => Some(EventKind::Error),
            "progress" => Some(EventKind::Progress),
            "artifact" => Some(EventKind::Artifact),
            "approval_required" => Some(EventKind::ApprovalRequired),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Thought => write!(f, "thought"),
            EventKind::ToolCall => write!(f, "tool_call"),
            EventKind::Result => write!(f, "result"),
            EventKind::Error => write!(f, "error"),
            EventKind::Progress => write!(f, "progress"),
            EventKind::Artifact => write!(f, "artifact"),
            EventKind::ApprovalRequired => write!(f, "approval_required"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    InProgress,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn parse(raw: &str) -> Option<ToolCallStatus> {
        match raw {
            "in_progress" => Some(ToolCallStatus::InProgress),
            "completed" => Some(ToolCallStatus::Completed),
            "error" => Some(ToolCallStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolCallStatus::InProgress => write!(f, "in_progress"),
            ToolCallStatus::Completed => write!(f, "completed"),
            ToolCallStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Thought {
        content: String,
        node_name: Option<String>,
    },
    ToolCall {
        tool_name: String,
        status: ToolCallStatus,
        message: Option<String>,
    },
    Result {
        artifacts: BTreeMap<String, Vec<ArtifactRef>>,
        completes_workflow: bool,
        summary: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    Progress {
        stage: Stage,
        percentage: Option<u8>,
        current_step: Option<String>,
    },
    Artifact {
        artifact_type: String,
        artifact: ArtifactRef,
    },
    ApprovalRequired {
        reason: Option<String>,
    },
}

/// One decoded stream event. Immutable; the same event may be delivered more
/// than once, which the fingerprint lets the reconciler suppress.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub workflow_id: WorkflowId,
    /// Engine-side timestamp, when the envelope carried a parseable one.
    pub timestamp_ms: Option<i64>,
    /// Client receive time, the ordering fallback.
    pub observed_at_ms: i64,
    pub payload: EventPayload,
    pub fingerprint: String,
}

impl StreamEvent {
    pub fn effective_timestamp_ms(&self) -> i64 {
        self.timestamp_ms.unwrap_or(self.observed_at_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("stream frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("unknown stream event kind `{0}`")]
    UnknownKind(String),
    #[error("stream event has no workflow id")]
    MissingWorkflowId,
    #[error("invalid workflow id in stream event: {0}")]
    InvalidWorkflowId(String),
    #[error("malformed `{kind}` payload: {detail}")]
    Payload { kind: EventKind, detail: String },
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    r#type: String,
    #[serde(default, rename = "workflowId")]
    workflow_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThoughtData {
    #[serde(default)]
    content: String,
    #[serde(default)]
    node_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallData {
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    artifacts: BTreeMap<String, Vec<ArtifactRef>>,
    #[serde(default)]
    r#final: bool,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default, rename = "finalCopy")]
    final_copy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    #[serde(default)]
    stage: String,
    #[serde(default)]
    percentage: Option<u8>,
    #[serde(default)]
    current_step: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtifactData {
    #[serde(default)]
    artifact_type: String,
    #[serde(default)]
    artifact_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApprovalData {
    #[serde(default)]
    reason: Option<String>,
}

// Server chatter that is not an agent event and not worth a warning.
const CONTROL_FRAMES: [&str; 4] = ["connected", "disconnected", "pong", "ack"];

/// Decodes one text frame. `Ok(None)` means a recognized control frame;
/// errors are decode warnings the caller logs and drops.
pub fn decode_stream_text(
    text: &str,
    observed_at_ms: i64,
) -> Result<Option<StreamEvent>, EventDecodeError> {
    let envelope: StreamEnvelope = serde_json::from_str(text).map_err(EventDecodeError::Json)?;
    if CONTROL_FRAMES.contains(&envelope.r#type.as_str()) {
        return Ok(None);
    }
    let Some(kind) = EventKind::parse(&envelope.r#type) else {
        return Err(EventDecodeError::UnknownKind(envelope.r#type));
    };
    let raw_workflow = envelope.workflow_id.unwrap_or_default();
    if raw_workflow.trim().is_empty() {
        return Err(EventDecodeError::MissingWorkflowId);
    }
    let workflow_id =
        WorkflowId::parse(&raw_workflow).map_err(EventDecodeError::InvalidWorkflowId)?;
    let payload = decode_payload(kind, &envelope.data)?;
    let fingerprint = event_fingerprint(
        &envelope.r#type,
        &raw_workflow,
        envelope.timestamp.as_deref().unwrap_or(""),
        &envelope.data,
    );
    let timestamp_ms = envelope
        .timestamp
        .as_deref()
        .and_then(parse_event_timestamp);
    Ok(Some(StreamEvent {
        kind,
        workflow_id,
        timestamp_ms,
        observed_at_ms,
        payload,
        fingerprint,
    }))
}

fn payload_error(kind: EventKind, detail: impl Into<String>) -> EventDecodeError {
    EventDecodeError::Payload {
        kind,
        detail: detail.into(),
    }
}

fn decode_payload(
    kind: EventKind,
    data: &serde_json::Value,
) -> Result<EventPayload, EventDecodeError> {
    match kind {
        EventKind::Thought => {
            let parsed: ThoughtData = typed_data(kind, data)?;
            if parsed.content.trim().is_empty() {
                return Err(payload_error(kind, "content must be non-empty"));
            }
            Ok(EventPayload::Thought {
                content: parsed.content,
                node_name: parsed.node_name.filter(|name| !name.trim().is_empty()),
            })
        }
        EventKind::ToolCall => {
            let parsed: ToolCallData = typed_data(kind, data)?;
            if parsed.tool_name.trim().is_empty() {
                return Err(payload_error(kind, "tool_name must be non-empty"));
            }
            let Some(status) = ToolCallStatus::parse(&parsed.status) else {
                return Err(payload_error(
                    kind,
                    format!("unknown tool status `{}`", parsed.status),
                ));
            };
            Ok(EventPayload::ToolCall {
                tool_name: parsed.tool_name,
                status,
                message: parsed.message.filter(|msg| !msg.trim().is_empty()),
            })
        }
        EventKind::Result => {
            let parsed: ResultData = typed_data(kind, data)?;
            let stage_is_done = matches!(parsed.stage.as_deref(), Some("done"));
            Ok(EventPayload::Result {
                artifacts: parsed.artifacts,
                completes_workflow: parsed.r#final || stage_is_done,
                summary: parsed.final_copy.filter(|copy| !copy.trim().is_empty()),
            })
        }
        EventKind::Error => {
            let parsed: ErrorData = typed_data(kind, data)?;
            if parsed.code.trim().is_empty() && parsed.message.trim().is_empty() {
                return Err(payload_error(kind, "error payload carries no code or message"));
            }
            let message = if parsed.message.trim().is_empty() {
                parsed.code.clone()
            } else {
                parsed.message
            };
            Ok(EventPayload::Error {
                code: parsed.code,
                message,
            })
        }
        EventKind::Progress => {
            let parsed: ProgressData = typed_data(kind, data)?;
            let Some(stage) = Stage::parse(&parsed.stage) else {
                return Err(payload_error(
                    kind,
                    format!("unknown stage `{}`", parsed.stage),
                ));
            };
            Ok(EventPayload::Progress {
                stage,
                percentage: parsed.percentage,
                current_step: parsed.current_step.filter(|step| !step.trim().is_empty()),
            })
        }
        EventKind::Artifact => {
            let parsed: ArtifactData = typed_data(kind, data)?;
            if parsed.artifact_type.trim().is_empty() {
                return Err(payload_error(kind, "artifact_type must be non-empty"));
            }
            let id = ArtifactId::parse(&parsed.artifact_id)
                .map_err(|err| payload_error(kind, err))?;
            Ok(EventPayload::Artifact {
                artifact_type: parsed.artifact_type,
                artifact: ArtifactRef {
                    id,
                    label: parsed.label,
                    url: parsed.url,
                },
            })
        }
        EventKind::ApprovalRequired => {
            let parsed: ApprovalData = typed_data(kind, data)?;
            Ok(EventPayload::ApprovalRequired {
                reason: parsed.reason.filter(|reason| !reason.trim().is_empty()),
            })
        }
    }
}

fn typed_data<T: for<'de> Deserialize<'de>>(
    kind: EventKind,
    data: &serde_json::Value,
) -> Result<T, EventDecodeError> {
    serde_json::from_value(data.clone()).map_err(|err| payload_error(kind, err.to_string()))
}

/// Content fingerprint for duplicate suppression across reconnects.
pub fn event_fingerprint(kind: &str, workflow_id: &str, timestamp: &str, data: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0]);
    hasher.update(workflow_id.as_bytes());
    hasher.update([0]);
    hasher.update(timestamp.as_bytes());
    hasher.update([0]);
    hasher.update(data.to_string().as_bytes());
    let digest = hasher.finalize();
    digest[..16]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
}
