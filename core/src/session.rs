//! Sessions, tasks and messages.
//!
//! A [`Session`] is a logical agent context bound for its whole life to one
//! display slot. A [`Task`] is a bounded unit of agent work inside a session;
//! its [`Message`] history is append-only.

use crate::display::DisplaySlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

// ============================================================================
// SESSIONS
// ============================================================================

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Closed,
}

/// Parameters for a new session. Every field falls back to a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
}

/// An agent context bound to one display slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub display_number: u32,
    pub vnc_port: u16,
    pub web_port: u16,
    pub provider: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub enable_thinking: bool,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Tasks started in this session so far
    pub task_count: u32,
}

impl Session {
    /// Create a session bound to `slot`.
    pub fn new(slot: &DisplaySlot, request: CreateSessionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_number: slot.display_number,
            vnc_port: slot.vnc_port,
            web_port: slot.web_port,
            provider: request
                .provider
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            model: request.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_output_tokens: request.max_output_tokens.unwrap_or(4096),
            enable_thinking: request.enable_thinking.unwrap_or(true),
            status: SessionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            closed_at: None,
            task_count: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// One-based display index relative to the lowest configured VNC port.
    pub fn display_index(&self, base_vnc_port: u16) -> u32 {
        u32::from(self.vnc_port.saturating_sub(base_vnc_port)) + 1
    }

    /// Ordering key for "most recent first" listings.
    pub fn recency(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Task lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => next == TaskStatus::Running,
            TaskStatus::Running => next.is_terminal(),
            TaskStatus::Completed | TaskStatus::Error => false,
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}

fn default_display_index() -> u32 {
    1
}

/// Parameters for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub description: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_display_index")]
    pub display_index: u32,
}

impl StartTaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            max_iterations: default_max_iterations(),
            display_index: default_display_index(),
        }
    }
}

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One entry of a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    /// Plain text or a structured content block
    pub content: serde_json::Value,
    /// Free-form tag such as `text`, `tool_use` or `thinking`
    pub message_type: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: serde_json::Value, message_type: impl Into<String>) -> Self {
        Self {
            role,
            content,
            message_type: message_type.into(),
            iteration: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, serde_json::Value::String(text.into()), "text")
    }
}

/// A unit of agent work within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: Uuid,
    pub description: String,
    pub max_iterations: u32,
    pub display_index: u32,
    pub status: TaskStatus,
    pub iterations: u32,
    pub messages: Vec<Message>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(session_id: Uuid, request: StartTaskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            description: request.description,
            max_iterations: request.max_iterations,
            display_index: request.display_index,
            status: TaskStatus::Pending,
            iterations: 0,
            messages: Vec::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Snapshot without the message history, for status events and listings.
    pub fn summary(&self) -> Task {
        Task {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

// ============================================================================
// EXECUTION LOG
// ============================================================================

/// Severity of an execution log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// A session-wide event such as a lifecycle change or a task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Increases across all sessions
    pub id: u64,
    pub session_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
