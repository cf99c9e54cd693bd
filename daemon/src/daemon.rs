/// Daemon lifecycle: provision displays, supervise them, serve the APIs,
/// and tear everything down on shutdown.
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::event_stream::EventStreamServer;
use crate::handlers::Handlers;
use crate::server::HttpServer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vdesk_core::{AgentRunner, DesktopHost, Provisioner, Supervisor};

/// Run the daemon until `shutdown` is cancelled or a listener fails.
///
/// Provisioning failure is fatal: processes started so far are stopped and
/// the error is returned before any listener is bound.
pub async fn run_daemon(
    config: DaemonConfig,
    host: Arc<dyn DesktopHost>,
    runner: Arc<dyn AgentRunner>,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    config.validate()?;

    if config.commands.vnc_is_unauthenticated() {
        warn!("VNC servers run without a password; expose the display ports on trusted networks only");
    }

    let provisioner = Arc::new(Provisioner::new(config.provision(), host));
    match provisioner.provision().await {
        Ok(slots) => {
            for slot in &slots {
                info!(
                    "Display :{} ready (vnc {}, web {})",
                    slot.display_number, slot.vnc_port, slot.web_port
                );
            }
        }
        Err(e) => {
            error!("Display provisioning failed: {}", e);
            provisioner.shutdown().await;
            return Err(DaemonError::Provision(e));
        }
    }

    let supervisor = Supervisor::new(provisioner.clone(), config.readiness.supervisor_interval());
    let supervisor_stats = supervisor.stats();
    let supervisor_handle = supervisor.spawn(shutdown.clone());

    let handlers = Arc::new(Handlers::new(
        config,
        provisioner.clone(),
        runner,
        supervisor_stats,
    )?);

    let result = serve(handlers, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = supervisor_handle.await {
        warn!("Supervisor task ended abnormally: {}", e);
    }
    provisioner.shutdown().await;
    info!("All display processes stopped");
    result
}

/// Bind both listeners and serve until shutdown.
pub async fn serve(handlers: Arc<Handlers>, shutdown: CancellationToken) -> DaemonResult<()> {
    let http = HttpServer::bind(handlers.clone())?;
    let ws = EventStreamServer::bind(handlers).await?;
    serve_listeners(http, ws, shutdown).await
}

/// Serve already-bound listeners; either one failing stops both.
pub async fn serve_listeners(
    http: HttpServer,
    ws: EventStreamServer,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    let http_shutdown = shutdown.clone();
    let http_task = async move {
        let result = http.run(http_shutdown.clone()).await;
        http_shutdown.cancel();
        result
    };

    let ws_shutdown = shutdown.clone();
    let ws_task = async move {
        let result = ws.run(ws_shutdown.clone()).await;
        ws_shutdown.cancel();
        result
    };

    let (http_result, ws_result) = tokio::join!(http_task, ws_task);
    http_result.and(ws_result)
}
