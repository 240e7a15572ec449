use super::ConfigError;
use crate::shared::errors::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENGINE_TOKEN_ENV: &str = "PACKTRACK_ENGINE_TOKEN";

fn default_engine_api_base() -> String {
    "http://127.0.0.1:8000/api/v1".to_string()
}

fn default_stream_url() -> String {
    "ws://127.0.0.1:8000/ws/agents".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_timeout_ms() -> u64 {
    1500
}

fn default_max_consecutive_poll_failures() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_engine_api_base")]
    pub engine_api_base: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Root for logs and stream health diagnostics. Defaults to `~/.packtrack`.
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_poll_failures")]
    pub max_consecutive_poll_failures: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_api_base: default_engine_api_base(),
            stream_url: default_stream_url(),
            state_root: None,
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_consecutive_poll_failures: default_max_consecutive_poll_failures(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.engine_api_base.starts_with("http://")
            && !self.engine_api_base.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "engine_api_base must be an http(s) url, got `{}`",
                self.engine_api_base
            )));
        }
        if !self.stream_url.starts_with("ws://") && !self.stream_url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "stream_url must be a ws(s) url, got `{}`",
                self.stream_url
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be greater than zero".to_string(),
            ));
        }
        // A poll request must give up before the next tick so at most one
        // request is ever in flight per workflow.
        if self.poll_timeout_ms >= self.poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "poll_timeout_ms ({}) must be shorter than poll_interval_ms ({})",
                self.poll_timeout_ms, self.poll_interval_ms
            )));
        }
        if self.max_consecutive_poll_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_poll_failures must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_reconnect_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, RuntimeError> {
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => crate::runtime::default_state_root_path(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let settings: Settings = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    settings.validate()?;
    Ok(settings)
}

/// Bearer credential for the engine API and stream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCredentials {
    pub bearer_token: String,
}

impl EngineCredentials {
    pub fn new(bearer_token: impl Into<String>) -> Self {
        Self {
            bearer_token: bearer_token.into(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            bearer_token: std::env::var(ENGINE_TOKEN_ENV).unwrap_or_default(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.bearer_token.trim().is_empty()
    }
}
