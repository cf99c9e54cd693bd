/// HTTP server implementation
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::Handlers;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::Value;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::form_urlencoded;
use uuid::Uuid;

/// A routed response before it is encoded.
enum Reply {
    Json(StatusCode, Value),
    Text(String),
}

fn ok(value: Value) -> Reply {
    Reply::Json(StatusCode::OK, value)
}

fn created(value: Value) -> Reply {
    Reply::Json(StatusCode::CREATED, value)
}

/// HTTP API server
pub struct HttpServer {
    handlers: Arc<Handlers>,
    listener: TcpListener,
}

impl HttpServer {
    /// Bind the configured HTTP address.
    pub fn bind(handlers: Arc<Handlers>) -> DaemonResult<Self> {
        let addr = format!(
            "{}:{}",
            handlers.config.server.http_addr, handlers.config.server.http_port
        );
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| DaemonError::ServerError(format!("Invalid address: {}", e)))?;
        let listener = TcpListener::bind(addr)?;
        Self::from_listener(handlers, listener)
    }

    pub fn from_listener(handlers: Arc<Handlers>, listener: TcpListener) -> DaemonResult<Self> {
        listener.set_nonblocking(true)?;
        Ok(HttpServer { handlers, listener })
    }

    pub fn local_addr(&self) -> DaemonResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> DaemonResult<()> {
        let addr = self.local_addr()?;
        let handlers = self.handlers;

        let make_svc = make_service_fn(move |_conn| {
            let handlers = handlers.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let handlers = handlers.clone();
                    handle_http_request(req, handlers)
                }))
            }
        });

        let server = Server::from_tcp(self.listener)?
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        info!("HTTP API listening on http://{}", addr);

        server
            .await
            .map_err(|e| DaemonError::ServerError(format!("HTTP server error: {}", e)))
    }
}

/// Handle one HTTP request
async fn handle_http_request(
    req: Request<Body>,
    handlers: Arc<Handlers>,
) -> Result<Response<Body>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = hyper::body::to_bytes(req.into_body()).await?;

    let response = match route(&handlers, &method, &path, &query, &body) {
        Ok(reply) => encode(reply),
        Err(e) => {
            if e.status_code().is_server_error() {
                error!("{} {} failed: {}", method, path, e);
            } else {
                debug!("{} {} rejected: {}", method, path, e);
            }
            json_response(e.status_code(), &e.to_json())
        }
    };

    handlers.metrics.record_request(
        started.elapsed().as_secs_f64(),
        !response.status().is_success(),
    );
    Ok(response)
}

fn route(
    handlers: &Handlers,
    method: &Method,
    path: &str,
    query: &str,
    body: &[u8],
) -> DaemonResult<Reply> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::GET, []) => handlers.handle_info().map(ok),
        (&Method::GET, ["health"]) => handlers.handle_health().map(ok),
        (&Method::GET, ["metrics"]) => handlers.handle_metrics().map(Reply::Text),
        (&Method::GET, ["api", "displays"]) => handlers.handle_displays().map(ok),

        (&Method::POST, ["api", "sessions"]) => handlers.handle_session_create(body).map(created),
        (&Method::GET, ["api", "sessions"]) => handlers.handle_session_list().map(ok),
        (&Method::GET, ["api", "sessions", id]) => handlers.handle_session_get(parse_id(id)?).map(ok),
        (&Method::POST, ["api", "sessions", id, "start"]) => {
            handlers.handle_session_start(parse_id(id)?).map(ok)
        }
        (&Method::POST, ["api", "sessions", id, "close"]) => {
            handlers.handle_session_close(parse_id(id)?).map(ok)
        }
        (&Method::POST, ["api", "sessions", id, "tasks"]) => {
            handlers.handle_task_start(parse_id(id)?, body).map(created)
        }
        (&Method::GET, ["api", "sessions", id, "tasks"]) => {
            handlers.handle_task_list(parse_id(id)?).map(ok)
        }
        (&Method::GET, ["api", "sessions", id, "logs"]) => {
            handlers.handle_session_logs(parse_id(id)?).map(ok)
        }
        (&Method::GET, ["api", "sessions", id, "viewer"]) => {
            let view_only = query_flag(query, "view_only")?;
            handlers.handle_viewer(parse_id(id)?, view_only).map(ok)
        }
        (&Method::POST, ["api", "viewer", "toggle"]) => {
            handlers.handle_viewer_toggle(body).map(ok)
        }
        (&Method::GET, ["api", "tasks", id]) => handlers.handle_task_get(parse_id(id)?).map(ok),

        _ => Err(DaemonError::NotFound(format!("{} {}", method, path))),
    }
}

fn parse_id(raw: &str) -> DaemonResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| DaemonError::InvalidRequest(format!("'{}' is not a valid id", raw)))
}

/// Boolean query parameter; absent means false.
fn query_flag(query: &str, name: &str) -> DaemonResult<bool> {
    let value = form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value);

    match value.as_deref() {
        None => Ok(false),
        Some("" | "true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(other) => Err(DaemonError::InvalidRequest(format!(
            "{} must be true or false, got '{}'",
            name, other
        ))),
    }
}

fn encode(reply: Reply) -> Response<Body> {
    match reply {
        Reply::Json(status, value) => json_response(status, &value),
        Reply::Text(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(text))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    }
}

fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
