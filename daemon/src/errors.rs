/// Error types for the daemon's HTTP and WebSocket surfaces
use hyper::StatusCode;
use serde_json::json;
use thiserror::Error;
use vdesk_core::{ProvisionError, SessionError, ViewerError};

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed or invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown route or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Session or task registry error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Display provisioning error
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// Viewer URL that cannot be built or parsed
    #[error(transparent)]
    Viewer(#[from] ViewerError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// WebSocket transport error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::InvalidRequest(_)
            | DaemonError::SerializationError(_)
            | DaemonError::Viewer(_) => StatusCode::BAD_REQUEST,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::Session(e) => match e {
                SessionError::NotFound(_) | SessionError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                SessionError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::SessionClosed(_) | SessionError::TaskAlreadyRunning { .. } => {
                    StatusCode::CONFLICT
                }
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::ConfigError(_) => "config_error",
            DaemonError::InvalidRequest(_) => "invalid_request",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::ServerError(_) => "server_error",
            DaemonError::Session(e) => match e {
                SessionError::NotFound(_) => "session_not_found",
                SessionError::TaskNotFound(_) => "task_not_found",
                SessionError::CapacityExceeded(_) => "capacity_exceeded",
                SessionError::SessionClosed(_) => "session_closed",
                SessionError::TaskAlreadyRunning { .. } => "task_already_running",
            },
            DaemonError::Provision(_) => "provision_error",
            DaemonError::Viewer(_) => "invalid_url",
            DaemonError::SerializationError(_) => "invalid_json",
            DaemonError::MetricsError(_) => "metrics_error",
            DaemonError::ConnectionError(_) => "connection_error",
            DaemonError::IoError(_) => "io_error",
            DaemonError::Other(_) => "internal_error",
        }
    }

    /// Error body: `{"error": {"code", "message"}}`
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string()
            }
        })
    }
}

impl From<serde_json::error::Error> for DaemonError {
    fn from(e: serde_json::error::Error) -> Self {
        DaemonError::SerializationError(e.to_string())
    }
}

impl From<hyper::Error> for DaemonError {
    fn from(e: hyper::Error) -> Self {
        DaemonError::ServerError(e.to_string())
    }
}

impl From<String> for DaemonError {
    fn from(e: String) -> Self {
        DaemonError::Other(e)
    }
}

impl From<&str> for DaemonError {
    fn from(e: &str) -> Self {
        DaemonError::Other(e.to_string())
    }
}
