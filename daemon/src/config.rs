/// Daemon configuration
use crate::errors::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vdesk_core::{
    AgentCommandConfig, CommandConfig, DisplayConfig, ProvisionConfig, ReadinessConfig, ViewerUrl,
};

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub agent: AgentCommandConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address
    #[serde(default = "default_addr")]
    pub http_addr: String,
    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// WebSocket server bind address
    #[serde(default = "default_addr")]
    pub ws_addr: String,
    /// WebSocket server port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Host name placed in viewer URLs handed to browsers
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// WebSocket heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_ws_port() -> u16 {
    8081
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_addr: default_addr(),
            http_port: default_http_port(),
            ws_addr: default_addr(),
            ws_port: default_ws_port(),
            public_host: default_public_host(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_level")]
    pub level: String,
    /// Log format: "text" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            format: default_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Values supplied on the command line or through the environment.
///
/// Port and display lists accept whitespace or comma separated numbers,
/// matching the `VNC_PORTS="5900 5901"` style.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    pub display_nums: Option<String>,
    pub vnc_ports: Option<String>,
    pub web_ports: Option<String>,
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub public_host: Option<String>,
    pub agent_program: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut DaemonConfig) -> DaemonResult<()> {
        if let Some(width) = self.width {
            config.display.width = width;
        }
        if let Some(height) = self.height {
            config.display.height = height;
        }
        if let Some(dpi) = self.dpi {
            config.display.dpi = dpi;
        }
        if let Some(list) = self.display_nums {
            config.display.display_numbers = parse_list("DISPLAY_NUMS", &list)?;
        }
        if let Some(list) = self.vnc_ports {
            config.display.vnc_ports = parse_list("VNC_PORTS", &list)?;
        }
        if let Some(list) = self.web_ports {
            config.display.web_ports = parse_list("WEB_PORTS", &list)?;
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(port) = self.ws_port {
            config.server.ws_port = port;
        }
        if let Some(host) = self.public_host {
            config.server.public_host = host;
        }
        if let Some(program) = self.agent_program {
            config.agent.program = program;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        Ok(())
    }
}

/// Parse a whitespace or comma separated list of numbers.
pub fn parse_list<T: std::str::FromStr>(name: &str, raw: &str) -> DaemonResult<Vec<T>> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| {
                DaemonError::ConfigError(format!("{}: '{}' is not a valid number", name, s))
            })
        })
        .collect()
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from TOML file or use defaults
    pub fn load_or_default(path: Option<&Path>) -> DaemonResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// The provisioning pipeline's share of the configuration.
    pub fn provision(&self) -> ProvisionConfig {
        ProvisionConfig {
            display: self.display.clone(),
            readiness: self.readiness.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Validate configuration; nothing is spawned before this passes.
    pub fn validate(&self) -> DaemonResult<()> {
        self.provision()
            .validate()
            .map_err(|e| DaemonError::ConfigError(e.to_string()))?;

        if self.server.http_port == 0 || self.server.ws_port == 0 {
            return Err(DaemonError::ConfigError(
                "http_port and ws_port must be non-zero".to_string(),
            ));
        }

        if self.server.http_port == self.server.ws_port && self.server.http_addr == self.server.ws_addr {
            return Err(DaemonError::ConfigError(format!(
                "http_port and ws_port are both {}",
                self.server.http_port
            )));
        }

        let slots = self
            .display
            .allocate()
            .map_err(|e| DaemonError::ConfigError(e.to_string()))?;
        for port in [self.server.http_port, self.server.ws_port] {
            if slots.iter().any(|s| s.vnc_port == port || s.web_port == port) {
                return Err(DaemonError::ConfigError(format!(
                    "port {} is used by both the daemon and a display",
                    port
                )));
            }
        }

        if let Some(slot) = slots.first() {
            ViewerUrl::new(self.server.public_host.clone(), slot.web_port)
                .to_url()
                .map_err(|e| {
                    DaemonError::ConfigError(format!(
                        "public_host '{}' is unusable: {}",
                        self.server.public_host, e
                    ))
                })?;
        }

        if self.server.heartbeat_secs == 0 {
            return Err(DaemonError::ConfigError(
                "heartbeat_secs must be greater than 0".to_string(),
            ));
        }

        if !["text", "json"].contains(&self.logging.format.to_ascii_lowercase().as_str()) {
            return Err(DaemonError::ConfigError(format!(
                "unknown log format '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}
