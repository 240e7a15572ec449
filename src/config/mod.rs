pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::{load_settings, EngineCredentials, Settings, ENGINE_TOKEN_ENV};
