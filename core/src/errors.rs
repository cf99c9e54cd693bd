/// Error types for display provisioning and session orchestration.
use crate::display::Stage;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while allocating, provisioning or supervising displays.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("{stage} on display :{display} not ready within {timeout_secs}s{}", format_diagnostics(.diagnostics))]
    ReadinessTimeout {
        stage: Stage,
        display: u32,
        timeout_secs: u64,
        diagnostics: String,
    },

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_diagnostics(diagnostics: &str) -> String {
    if diagnostics.trim().is_empty() {
        String::new()
    } else {
        format!("\n--- captured stderr ---\n{}", diagnostics.trim_end())
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Request-level errors for the session and task registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("No ready display available ({0} provisioned)")]
    CapacityExceeded(usize),

    #[error("Session {0} is closed")]
    SessionClosed(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Session {session_id} already has running task {task_id}")]
    TaskAlreadyRunning { session_id: Uuid, task_id: Uuid },
}

/// Result type for session and task operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Viewer URLs that cannot be built or parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewerError {
    #[error("Invalid viewer URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
