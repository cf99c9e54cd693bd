/// vdesk daemon - main entry point
/// Provisions the virtual displays, then serves sessions and tasks over HTTP
/// and live task updates over WebSocket
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vdesk_core::{LocalHost, ProcessAgentRunner};
use vdesk_daemon::{run_daemon, DaemonConfig, Overrides};

#[derive(Parser, Debug)]
#[command(
    name = "vdesk-daemon",
    about = "Virtual desktop provisioning and agent session server",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        env = "VDESK_CONFIG",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Display width in pixels
    #[arg(long, env = "WIDTH")]
    width: Option<u32>,

    /// Display height in pixels
    #[arg(long, env = "HEIGHT")]
    height: Option<u32>,

    /// Display DPI
    #[arg(long, env = "DPI")]
    dpi: Option<u32>,

    /// X display numbers, e.g. "1 2"
    #[arg(long, env = "DISPLAY_NUMS", value_name = "LIST")]
    display_nums: Option<String>,

    /// VNC ports, one per display, e.g. "5900 5901"
    #[arg(long, env = "VNC_PORTS", value_name = "LIST")]
    vnc_ports: Option<String>,

    /// Web viewer ports, e.g. "6080 6081"
    #[arg(long, env = "WEB_PORTS", value_name = "LIST")]
    web_ports: Option<String>,

    /// HTTP server port
    #[arg(long, value_name = "PORT", help = "HTTP server port (default: 8080)")]
    http_port: Option<u16>,

    /// WebSocket server port
    #[arg(long, value_name = "PORT", help = "WebSocket server port (default: 8081)")]
    ws_port: Option<u16>,

    /// Host name used in viewer URLs
    #[arg(long, env = "VDESK_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Agent program run for each task
    #[arg(long, env = "VDESK_AGENT", value_name = "PROGRAM")]
    agent: Option<String>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Log format
    #[arg(long, value_name = "FORMAT", help = "Log format (text, json)")]
    log_format: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .init();
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;

    // Apply CLI and environment overrides
    Overrides {
        width: args.width,
        height: args.height,
        dpi: args.dpi,
        display_nums: args.display_nums,
        vnc_ports: args.vnc_ports,
        web_ports: args.web_ports,
        http_port: args.http_port,
        ws_port: args.ws_port,
        public_host: args.public_host,
        agent_program: args.agent,
        log_level: if args.verbose {
            Some("debug".to_string())
        } else {
            args.log_level
        },
        log_format: args.log_format,
    }
    .apply(&mut config)?;

    // Setup logging
    init_logging(&config.logging.level, config.logging.is_json())?;

    info!("Starting vdesk daemon v{}", vdesk_daemon::VERSION);
    match &args.config {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    // Validate configuration before anything is spawned
    config.validate()?;

    info!(
        "Server configuration: HTTP {}:{}, WebSocket {}:{}, displays {}x{}@{}dpi",
        config.server.http_addr,
        config.server.http_port,
        config.server.ws_addr,
        config.server.ws_port,
        config.display.width,
        config.display.height,
        config.display.dpi
    );

    for program in LocalHost::preflight(&config.commands) {
        warn!("Required program not found: {}", program);
    }

    let host = Arc::new(LocalHost::new(
        config.display.clone(),
        config.commands.display_probe.clone(),
    ));
    let runner = Arc::new(ProcessAgentRunner::new(config.agent.clone()));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down daemon...");
        signal_token.cancel();
    });

    run_daemon(config, host, runner, shutdown).await?;

    info!("vdesk daemon stopped");
    Ok(())
}
