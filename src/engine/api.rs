use crate::config::{EngineCredentials, Settings};
use crate::engine::EngineError;
use crate::reconcile::view::StatusSnapshot;
use crate::shared::ids::{PackageId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Overrides the configured API base, mainly for tests and staging.
pub const ENGINE_API_BASE_ENV: &str = "PACKTRACK_ENGINE_API_BASE";

/// Timeout for caller-initiated requests (generate, approve). Status polls
/// use the tighter poll timeout from settings instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_BODY: usize = 300;

/// Request body for kicking off a generation run.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateAck {
    pub package_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionAck {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Blocking HTTP client for the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineApiClient {
    api_base: String,
    bearer_token: String,
    status_timeout: Duration,
}

impl EngineApiClient {
    pub fn new(settings: &Settings, credentials: &EngineCredentials) -> EngineApiClient {
        let api_base = std::env::var(ENGINE_API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| settings.engine_api_base.clone());
        EngineApiClient {
            api_base,
            bearer_token: credentials.bearer_token.clone(),
            status_timeout: settings.poll_timeout(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        timeout: Duration,
        context: &str,
    ) -> Result<T, EngineError> {
        let url = self.endpoint(path);
        let response = ureq::get(&url)
            .timeout(timeout)
            .set("Authorization", &self.bearer())
            .call()
            .map_err(map_call_error)?;
        response.into_json::<T>().map_err(|source| EngineError::Decode {
            context: context.to_string(),
            source,
        })
    }

    fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        context: &str,
    ) -> Result<T, EngineError> {
        let url = self.endpoint(path);
        let payload =
            serde_json::to_value(body).map_err(|err| EngineError::Request(err.to_string()))?;
        let response = ureq::post(&url)
            .timeout(REQUEST_TIMEOUT)
            .set("Authorization", &self.bearer())
            .send_json(payload)
            .map_err(map_call_error)?;
        response.into_json::<T>().map_err(|source| EngineError::Decode {
            context: context.to_string(),
            source,
        })
    }

    /// Point-in-time snapshot for one workflow. Bounded by the poll timeout
    /// so a slow engine cannot overlap the next tick.
    pub fn fetch_status(&self, workflow_id: &WorkflowId) -> Result<StatusSnapshot, EngineError> {
        let path = format!(
            "workflows/{}/status",
            urlencoding::encode(workflow_id.as_str())
        );
        self.get_json(&path, self.status_timeout, "workflow status")
    }

    /// Submits an approve/reject decision for a gated workflow.
    pub fn submit_decision(
        &self,
        workflow_id: &WorkflowId,
        decision: &str,
        comment: Option<&str>,
    ) -> Result<DecisionAck, EngineError> {
        let path = format!(
            "workflows/{}/approve",
            urlencoding::encode(workflow_id.as_str())
        );
        let mut body = serde_json::json!({ "decision": decision });
        if let Some(comment) = comment.map(str::trim).filter(|comment| !comment.is_empty()) {
            body["comment"] = serde_json::Value::String(comment.to_string());
        }
        self.post_json(&path, &body, "approval decision")
    }

    /// Kicks off a generation run for a package and reports the workflow id
    /// to watch.
    pub fn start_generation(
        &self,
        package_id: &PackageId,
        request: &GenerateRequest,
    ) -> Result<GenerateAck, EngineError> {
        let path = format!(
            "workflows/{}/generate",
            urlencoding::encode(package_id.as_str())
        );
        self.post_json(&path, request, "generation start")
    }
}

fn map_call_error(error: ureq::Error) -> EngineError {
    match error {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            EngineError::Response {
                status,
                body: truncate_body(&body),
            }
        }
        other => EngineError::Request(other.to_string()),
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY).collect()
}
