//! Error types for the IoT agent

use thiserror::Error;

/// Main error type for the IoT agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A container runtime command ran but reported failure
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// The container runtime could not be reached at all
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Update error: {0}")]
    UpdateError(String),

    #[error("Telemetry error: {0}")]
    TelemetryError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
