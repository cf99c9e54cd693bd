/// WebSocket live update channel: `ws://host:{ws_port}/ws/tasks/{task_id}`
///
/// Each connection follows one task. The server only writes; client text
/// frames are ignored. Disconnecting never affects the task.
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::Handlers;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vdesk_core::{LiveUpdateEvent, Task};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Task id addressed by a `/ws/tasks/{id}` path
pub fn parse_task_path(path: &str) -> Option<Uuid> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["ws", "tasks", id] => Uuid::parse_str(id).ok(),
        _ => None,
    }
}

/// WebSocket listener for task live updates
pub struct EventStreamServer {
    handlers: Arc<Handlers>,
    listener: TcpListener,
    heartbeat: Duration,
}

impl EventStreamServer {
    /// Bind the configured WebSocket address.
    pub async fn bind(handlers: Arc<Handlers>) -> DaemonResult<Self> {
        let addr = format!(
            "{}:{}",
            handlers.config.server.ws_addr, handlers.config.server.ws_port
        );
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self::from_listener(handlers, listener))
    }

    pub fn from_listener(handlers: Arc<Handlers>, listener: TcpListener) -> Self {
        let heartbeat = Duration::from_secs(handlers.config.server.heartbeat_secs);
        EventStreamServer {
            handlers,
            listener,
            heartbeat,
        }
    }

    pub fn local_addr(&self) -> DaemonResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> DaemonResult<()> {
        info!("WebSocket live updates on ws://{}/ws/tasks/{{id}}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("WebSocket listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept WebSocket connection: {}", e);
                            continue;
                        }
                    };
                    let handlers = self.handlers.clone();
                    let heartbeat = self.heartbeat;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_task_stream(stream, handlers, heartbeat, shutdown).await {
                            debug!("WebSocket connection from {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

/// Handle a WebSocket connection following one task
pub async fn handle_task_stream(
    stream: TcpStream,
    handlers: Arc<Handlers>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    let mut path = String::new();
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    .map_err(|e| {
        error!("Failed to accept WebSocket connection: {}", e);
        DaemonError::ConnectionError(e.to_string())
    })?;

    handlers.metrics.record_connection();
    let result = follow_task(ws_stream, &path, &handlers, heartbeat, shutdown).await;
    handlers.metrics.record_connection_closed();
    result
}

async fn follow_task(
    ws_stream: WebSocketStream<TcpStream>,
    path: &str,
    handlers: &Handlers,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let task_id = match parse_task_path(path) {
        Some(id) => id,
        None => {
            let event = LiveUpdateEvent::Error {
                message: format!("Unknown stream path: {}", path),
            };
            return send_and_close(&mut ws_sink, &[event]).await;
        }
    };

    // Subscribe before reading the task so nothing published in between is lost
    let hub = handlers.hub();
    let receiver = hub.subscribe(task_id);
    let task = match handlers.tasks.get_task(task_id) {
        Ok(task) => task,
        Err(e) => {
            let event = LiveUpdateEvent::Error {
                message: e.to_string(),
            };
            return send_and_close(&mut ws_sink, &[event]).await;
        }
    };

    info!(
        "Live updates for task {} requested ({} subscriber(s))",
        task_id,
        hub.subscriber_count(task_id)
    );
    send_event(&mut ws_sink, &LiveUpdateEvent::connected(task_id)).await?;

    let mut receiver = match receiver {
        Some(rx) if !task.status.is_terminal() => rx,
        _ => {
            // Already finished; the channel may be gone, so replay the final state
            let task = handlers.tasks.get_task(task_id).unwrap_or(task);
            return send_and_close(&mut ws_sink, &final_events(&task)).await;
        }
    };

    let start = tokio::time::Instant::now() + heartbeat;
    let mut heartbeat_interval = tokio::time::interval_at(start, heartbeat);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                break;
            }
            event = receiver.recv() => {
                match event {
                    Ok(event) => send_event(&mut ws_sink, &event).await?,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Live update subscriber for task {} skipped {} events", task_id, missed);
                    }
                    Err(RecvError::Closed) => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_sink
                            .send(WsMessage::Pong(data))
                            .await
                            .map_err(|e| DaemonError::ConnectionError(e.to_string()))?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("Client left live updates for task {}", task_id);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ignore client text and binary frames
                    }
                    Some(Err(e)) => {
                        return Err(DaemonError::ConnectionError(e.to_string()));
                    }
                }
            }
            _ = heartbeat_interval.tick() => {
                ws_sink
                    .send(WsMessage::Ping(Vec::new()))
                    .await
                    .map_err(|e| DaemonError::ConnectionError(e.to_string()))?;
            }
        }
    }

    Ok(())
}

/// Events replayed to a client that connects after the task finished.
fn final_events(task: &Task) -> Vec<LiveUpdateEvent> {
    let mut events = vec![LiveUpdateEvent::task_update(task)];
    if task.status.is_terminal() {
        events.push(LiveUpdateEvent::TaskComplete {
            status: task.status,
        });
    }
    events
}

async fn send_event(ws_sink: &mut WsSink, event: &LiveUpdateEvent) -> DaemonResult<()> {
    ws_sink
        .send(WsMessage::Text(event.to_json()))
        .await
        .map_err(|e| DaemonError::ConnectionError(e.to_string()))
}

async fn send_and_close(ws_sink: &mut WsSink, events: &[LiveUpdateEvent]) -> DaemonResult<()> {
    for event in events {
        send_event(ws_sink, event).await?;
    }
    ws_sink
        .send(WsMessage::Close(None))
        .await
        .map_err(|e| DaemonError::ConnectionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdesk_core::{StartTaskRequest, TaskStatus};

    #[test]
    fn test_parse_task_path() {
        let id = Uuid::new_v4();
        assert_eq!(parse_task_path(&format!("/ws/tasks/{}", id)), Some(id));
        assert_eq!(parse_task_path(&format!("/ws/tasks/{}/", id)), Some(id));
        assert_eq!(parse_task_path("/ws/tasks/abc"), None);
        assert_eq!(parse_task_path("/api/tasks"), None);
    }

    #[test]
    fn test_final_events_for_finished_task() {
        let mut task = Task::new(Uuid::new_v4(), StartTaskRequest::new("list files"));
        task.status = TaskStatus::Error;

        let events = final_events(&task);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LiveUpdateEvent::TaskUpdate { .. }));
        assert_eq!(
            events[1],
            LiveUpdateEvent::TaskComplete {
                status: TaskStatus::Error
            }
        );
    }
}
