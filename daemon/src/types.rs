/// Request and response bodies of the HTTP API
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vdesk_core::{DisplaySlot, ExecutionLogEntry, Session, Task, ViewerError, ViewerUrl};

/// A session as handed to browsers: the stored record plus the values a
/// client needs to attach a viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: Session,
    /// 1-based position of the session's display in the VNC port list
    pub display_index: u32,
    pub viewer_url: String,
}

impl SessionResponse {
    pub fn new(
        session: Session,
        base_vnc_port: u16,
        public_host: &str,
    ) -> Result<Self, ViewerError> {
        let viewer_url = ViewerUrl::new(public_host, session.web_port).render()?;
        Ok(SessionResponse {
            display_index: session.display_index(base_vnc_port),
            viewer_url,
            session,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogsResponse {
    pub session_id: Uuid,
    pub logs: Vec<ExecutionLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaysResponse {
    pub displays: Vec<DisplaySlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerToggleRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerResponse {
    pub url: String,
    pub view_only: bool,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Every display is Ready
    pub ready: bool,
    pub version: String,
    pub displays_ready: usize,
    pub displays_total: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// Server information returned from `/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub websocket: String,
    pub routes: Vec<String>,
}
