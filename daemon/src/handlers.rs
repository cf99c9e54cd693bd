/// HTTP API handlers over the core registries
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::{CoreSnapshot, MetricsCollector};
use crate::types::*;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use vdesk_core::{
    toggle_view_only, AgentRunner, CreateSessionRequest, LiveUpdateHub, Provisioner,
    SessionManager, StartTaskRequest, SupervisorStats, TaskCoordinator, ViewerUrl,
};

/// Shared state behind every HTTP and WebSocket connection
pub struct Handlers {
    pub config: DaemonConfig,
    pub provisioner: Arc<Provisioner>,
    pub sessions: Arc<SessionManager>,
    pub tasks: Arc<TaskCoordinator>,
    pub metrics: Arc<MetricsCollector>,
}

impl Handlers {
    /// Wire the session and task registries onto a provisioner's slots.
    pub fn new(
        config: DaemonConfig,
        provisioner: Arc<Provisioner>,
        runner: Arc<dyn AgentRunner>,
        supervisor: Arc<SupervisorStats>,
    ) -> DaemonResult<Self> {
        let sessions = Arc::new(SessionManager::new(provisioner.view()));
        let tasks = Arc::new(TaskCoordinator::new(
            sessions.clone(),
            runner,
            Arc::new(LiveUpdateHub::new()),
        ));

        let metrics = Arc::new(MetricsCollector::new()?);
        {
            let provisioner = provisioner.clone();
            let sessions = sessions.clone();
            let tasks = tasks.clone();
            metrics.register_core(move || {
                let task_stats = tasks.stats();
                CoreSnapshot {
                    tasks_started: task_stats.started(),
                    tasks_completed: task_stats.completed(),
                    tasks_failed: task_stats.failed(),
                    tasks_active: tasks.running_count(),
                    displays_ready: provisioner.view().ready().len(),
                    open_sessions: sessions.open_sessions(),
                    live_channels: tasks.hub().open_channels(),
                    supervisor_crashes: supervisor.crashes(),
                    supervisor_recoveries: supervisor.recoveries(),
                }
            })?;
        }

        Ok(Handlers {
            config,
            provisioner,
            sessions,
            tasks,
            metrics,
        })
    }

    pub fn hub(&self) -> Arc<LiveUpdateHub> {
        self.tasks.hub()
    }

    fn session_response(&self, session: vdesk_core::Session) -> DaemonResult<SessionResponse> {
        Ok(SessionResponse::new(
            session,
            self.sessions.base_vnc_port(),
            &self.config.server.public_host,
        )?)
    }

    /// GET /
    pub fn handle_info(&self) -> DaemonResult<Value> {
        let routes = [
            "GET /health",
            "GET /metrics",
            "GET /api/displays",
            "POST /api/sessions",
            "GET /api/sessions",
            "GET /api/sessions/{id}",
            "POST /api/sessions/{id}/start",
            "POST /api/sessions/{id}/close",
            "POST /api/sessions/{id}/tasks",
            "GET /api/sessions/{id}/tasks",
            "GET /api/sessions/{id}/logs",
            "GET /api/sessions/{id}/viewer",
            "POST /api/viewer/toggle",
            "GET /api/tasks/{id}",
        ];
        let info = ServerInfo {
            name: "vdesk-daemon".to_string(),
            version: vdesk_core::VERSION.to_string(),
            websocket: format!("ws://{{host}}:{}/ws/tasks/{{task_id}}", self.config.server.ws_port),
            routes: routes.iter().map(|r| r.to_string()).collect(),
        };
        Ok(serde_json::to_value(info)?)
    }

    /// GET /health
    pub fn handle_health(&self) -> DaemonResult<Value> {
        let view = self.provisioner.view();
        let displays_ready = view.ready().len();
        let ready = view.all_ready();
        let response = HealthResponse {
            status: if ready { "healthy" } else { "degraded" }.to_string(),
            ready,
            version: vdesk_core::VERSION.to_string(),
            displays_ready,
            displays_total: view.len(),
            uptime_secs: self.metrics.uptime_secs(),
            timestamp: Utc::now(),
        };
        Ok(serde_json::to_value(response)?)
    }

    /// GET /metrics
    pub fn handle_metrics(&self) -> DaemonResult<String> {
        self.metrics.gather_metrics()
    }

    /// GET /api/displays
    pub fn handle_displays(&self) -> DaemonResult<Value> {
        let response = DisplaysResponse {
            displays: self.provisioner.slots(),
        };
        Ok(serde_json::to_value(response)?)
    }

    /// POST /api/sessions
    pub fn handle_session_create(&self, body: &[u8]) -> DaemonResult<Value> {
        let request: CreateSessionRequest = parse_body_or_default(body)?;
        let session = self.sessions.create_session(request)?;
        self.metrics.record_session_created();
        info!(
            "Session {} bound to display :{} (vnc {}, web {})",
            session.id, session.display_number, session.vnc_port, session.web_port
        );
        Ok(serde_json::to_value(self.session_response(session)?)?)
    }

    /// GET /api/sessions
    pub fn handle_session_list(&self) -> DaemonResult<Value> {
        let sessions = self
            .sessions
            .list_sessions()
            .into_iter()
            .map(|s| self.session_response(s))
            .collect::<DaemonResult<Vec<_>>>()?;
        Ok(serde_json::to_value(SessionsResponse { sessions })?)
    }

    /// GET /api/sessions/{id}
    pub fn handle_session_get(&self, id: Uuid) -> DaemonResult<Value> {
        let session = self.sessions.get_session(id)?;
        Ok(serde_json::to_value(self.session_response(session)?)?)
    }

    /// POST /api/sessions/{id}/start
    pub fn handle_session_start(&self, id: Uuid) -> DaemonResult<Value> {
        let session = self.sessions.start_session(id)?;
        Ok(serde_json::to_value(self.session_response(session)?)?)
    }

    /// POST /api/sessions/{id}/close
    pub fn handle_session_close(&self, id: Uuid) -> DaemonResult<Value> {
        let session = self.sessions.close_session(id)?;
        Ok(serde_json::to_value(self.session_response(session)?)?)
    }

    /// POST /api/sessions/{id}/tasks
    pub fn handle_task_start(&self, session_id: Uuid, body: &[u8]) -> DaemonResult<Value> {
        let request: StartTaskRequest = serde_json::from_slice(body)
            .map_err(|e| DaemonError::InvalidRequest(format!("Invalid task request: {}", e)))?;
        if request.description.trim().is_empty() {
            return Err(DaemonError::InvalidRequest(
                "description must not be empty".to_string(),
            ));
        }
        if request.max_iterations == 0 {
            return Err(DaemonError::InvalidRequest(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let task = self.tasks.start_task(session_id, request)?;
        Ok(serde_json::to_value(task)?)
    }

    /// GET /api/sessions/{id}/tasks
    pub fn handle_task_list(&self, session_id: Uuid) -> DaemonResult<Value> {
        let tasks = self.tasks.list_tasks(session_id)?;
        Ok(serde_json::to_value(TasksResponse { tasks })?)
    }

    /// GET /api/sessions/{id}/logs
    pub fn handle_session_logs(&self, session_id: Uuid) -> DaemonResult<Value> {
        let logs = self.sessions.session_logs(session_id)?;
        Ok(serde_json::to_value(SessionLogsResponse { session_id, logs })?)
    }

    /// GET /api/tasks/{id}
    pub fn handle_task_get(&self, task_id: Uuid) -> DaemonResult<Value> {
        Ok(serde_json::to_value(self.tasks.get_task(task_id)?)?)
    }

    /// GET /api/sessions/{id}/viewer?view_only=bool
    pub fn handle_viewer(&self, session_id: Uuid, view_only: bool) -> DaemonResult<Value> {
        let session = self.sessions.get_session(session_id)?;
        let url = ViewerUrl::new(self.config.server.public_host.clone(), session.web_port)
            .view_only(view_only);
        Ok(serde_json::to_value(ViewerResponse {
            url: url.render()?,
            view_only,
        })?)
    }

    /// POST /api/viewer/toggle `{"url": ...}`
    pub fn handle_viewer_toggle(&self, body: &[u8]) -> DaemonResult<Value> {
        let request: ViewerToggleRequest = serde_json::from_slice(body)
            .map_err(|e| DaemonError::InvalidRequest(format!("Invalid toggle request: {}", e)))?;
        let (url, view_only) = toggle_view_only(&request.url)?;
        Ok(serde_json::to_value(ViewerResponse { url, view_only })?)
    }
}

/// An empty body means "all defaults".
fn parse_body_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> DaemonResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| DaemonError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdesk_core::testing::{free_ports, FakeHost, ScriptStep, ScriptedAgentRunner};
    use vdesk_core::SessionError;

    async fn handlers() -> Handlers {
        let ports = free_ports(2);
        let mut config = DaemonConfig::default();
        config.display.vnc_ports = vec![ports[0]];
        config.display.web_ports = vec![ports[1]];
        config.readiness.poll_interval_ms = 10;

        let provisioner = Arc::new(Provisioner::new(config.provision(), Arc::new(FakeHost::new())));
        provisioner.provision().await.unwrap();
        let runner = Arc::new(ScriptedAgentRunner::new(vec![ScriptStep::Finish(None)]));
        Handlers::new(config, provisioner, runner, Arc::new(SupervisorStats::default())).unwrap()
    }

    #[tokio::test]
    async fn test_create_session_with_empty_body() {
        let handlers = handlers().await;
        let created = handlers.handle_session_create(b"").unwrap();
        assert_eq!(created["display_index"], 1);
        assert_eq!(created["status"], "created");

        let err = handlers.handle_session_create(b"{}").unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Session(SessionError::CapacityExceeded(1))
        ));
        handlers.provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_request_validation() {
        let handlers = handlers().await;
        let session = handlers.sessions.create_session(Default::default()).unwrap();

        let err = handlers.handle_task_start(session.id, b"{\"description\":\"  \"}").unwrap_err();
        assert!(matches!(err, DaemonError::InvalidRequest(_)));

        let err = handlers.handle_task_start(session.id, b"not json").unwrap_err();
        assert!(matches!(err, DaemonError::InvalidRequest(_)));

        let err = handlers
            .handle_task_start(session.id, b"{\"description\":\"x\",\"max_iterations\":0}")
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidRequest(_)));
        handlers.provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_viewer_url_respects_view_only() {
        let handlers = handlers().await;
        let session = handlers.sessions.create_session(Default::default()).unwrap();

        let viewer = handlers.handle_viewer(session.id, true).unwrap();
        assert_eq!(viewer["view_only"], true);
        assert!(viewer["url"].as_str().unwrap().ends_with("view_only=true"));
        handlers.provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_viewer_toggle_flips_mode() {
        let handlers = handlers().await;
        let session = handlers.sessions.create_session(Default::default()).unwrap();
        let viewer = handlers.handle_viewer(session.id, false).unwrap();
        let url = viewer["url"].as_str().unwrap().to_string();

        let body = serde_json::to_vec(&serde_json::json!({ "url": url })).unwrap();
        let toggled = handlers.handle_viewer_toggle(&body).unwrap();
        assert_eq!(toggled["view_only"], true);
        let locked = toggled["url"].as_str().unwrap();
        assert!(locked.ends_with("view_only=true"));

        let body = serde_json::to_vec(&serde_json::json!({ "url": locked })).unwrap();
        let restored = handlers.handle_viewer_toggle(&body).unwrap();
        assert_eq!(restored["view_only"], false);
        assert_eq!(restored["url"], url.as_str());

        let err = handlers
            .handle_viewer_toggle(b"{\"url\":\"not a url\"}")
            .unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_url");
        handlers.provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_logs_follow_task_outcome() {
        let handlers = handlers().await;
        let created = handlers.handle_session_create(b"").unwrap();
        let id = Uuid::parse_str(created["id"].as_str().unwrap()).unwrap();

        let task = handlers
            .handle_task_start(id, b"{\"description\":\"list files\"}")
            .unwrap();
        let task_id = Uuid::parse_str(task["id"].as_str().unwrap()).unwrap();
        for _ in 0..200 {
            if handlers.hub().subscribe(task_id).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let body = handlers.handle_session_logs(id).unwrap();
        assert_eq!(body["session_id"], id.to_string());
        let messages: Vec<String> = body["logs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["message"].as_str().unwrap().to_string())
            .collect();
        assert!(messages[0].starts_with("Session created"));
        assert!(messages
            .iter()
            .any(|m| m == &format!("Task {} started: list files", task_id)));
        assert!(messages
            .iter()
            .any(|m| m == &format!("Task {} completed", task_id)));

        let err = handlers.handle_session_logs(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::NOT_FOUND);
        handlers.provisioner.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_ready_displays() {
        let handlers = handlers().await;
        let health = handlers.handle_health().unwrap();
        assert_eq!(health["ready"], true);
        assert_eq!(health["displays_ready"], 1);

        let metrics = handlers.handle_metrics().unwrap();
        assert!(metrics.contains("vdesk_displays_ready 1"));
        handlers.provisioner.shutdown().await;
    }
}
