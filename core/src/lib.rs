// vdesk: virtual desktop provisioning and agent session orchestration
// Core library: display topology, supervision, sessions, tasks and live updates

pub mod agent_runner;
pub mod allocator;
pub mod config;
pub mod display;
pub mod errors;
pub mod host;
pub mod live_update;
pub mod provisioner;
pub mod readiness;
pub mod session;
pub mod session_manager;
pub mod supervisor;
pub mod task_coordinator;
pub mod viewer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use errors::{ProvisionError, ProvisionResult, SessionError, SessionResult, ViewerError};

pub use config::{CommandConfig, CommandTemplate, DisplayConfig, ProvisionConfig, ReadinessConfig};

pub use display::{DisplaySlot, DisplayState, SlotRegistry, SlotView, Stage};

pub use host::{DesktopHost, LocalHost, ManagedProcess, ProcessSpec};

pub use provisioner::{CrashReport, ProcessRole, Provisioner, READY_SENTINEL};

pub use supervisor::{Supervisor, SupervisorStats, TickOutcome};

pub use session::{
    CreateSessionRequest, ExecutionLogEntry, LogLevel, Message, MessageRole, Session,
    SessionStatus, StartTaskRequest, Task, TaskStatus,
};

pub use session_manager::SessionManager;

pub use task_coordinator::{TaskCoordinator, TaskStats};

pub use agent_runner::{
    AgentCommandConfig, AgentFailure, AgentRunner, MessageSink, ProcessAgentRunner, TaskContext,
};

pub use live_update::{LiveUpdateEvent, LiveUpdateHub};

pub use viewer::{toggle_view_only, ViewerUrl};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
