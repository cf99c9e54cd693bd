/// vdesk daemon: HTTP API and WebSocket live updates for agent sessions
/// running on provisioned virtual desktops
pub mod config;
pub mod daemon;
pub mod errors;
pub mod event_stream;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use config::{DaemonConfig, LoggingConfig, Overrides, ServerConfig};
pub use daemon::{run_daemon, serve, serve_listeners};
pub use errors::{DaemonError, DaemonResult};
pub use event_stream::EventStreamServer;
pub use handlers::Handlers;
pub use metrics::MetricsCollector;
pub use server::HttpServer;

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
