/// Provisioning configuration: display geometry, port lists, readiness bounds
/// and the command lines used for each stage.
use crate::allocator;
use crate::display::{DisplaySlot, Stage};
use crate::errors::{ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Display geometry and topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_dpi")]
    pub dpi: u32,

    /// VNC ports, one per display. Empty means a single display on 5900.
    #[serde(default)]
    pub vnc_ports: Vec<u16>,

    /// Web proxy ports. Empty means `vnc_port + 180` for each VNC port.
    #[serde(default)]
    pub web_ports: Vec<u16>,

    /// X display numbers. Empty means `1..=N`.
    #[serde(default)]
    pub display_numbers: Vec<u32>,

    /// Lock file checked before launching a frame buffer; `{display}` is
    /// replaced with the display number.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_dpi() -> u32 {
    96
}

fn default_lock_file() -> String {
    "/tmp/.X{display}-lock".to_string()
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            dpi: default_dpi(),
            vnc_ports: Vec::new(),
            web_ports: Vec::new(),
            display_numbers: Vec::new(),
            lock_file: default_lock_file(),
        }
    }
}

impl DisplayConfig {
    /// Allocate the slot topology described by this configuration.
    pub fn allocate(&self) -> ProvisionResult<Vec<DisplaySlot>> {
        allocator::allocate(
            non_empty(&self.vnc_ports),
            non_empty(&self.web_ports),
            non_empty(&self.display_numbers),
        )
    }

    /// Lock file an X server holds while serving `display`.
    pub fn lock_file_for(&self, display: u32) -> String {
        self.lock_file.replace("{display}", &display.to_string())
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ProvisionError::Configuration(
                "display width and height must be non-zero".to_string(),
            ));
        }
        if self.dpi == 0 {
            return Err(ProvisionError::Configuration(
                "display dpi must be non-zero".to_string(),
            ));
        }
        self.allocate().map(|_| ())
    }
}

fn non_empty<T>(values: &[T]) -> Option<&[T]> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Polling bounds for readiness gates and the crash supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_frame_buffer_timeout")]
    pub frame_buffer_timeout_secs: u64,

    #[serde(default = "default_desktop_timeout")]
    pub desktop_timeout_secs: u64,

    /// Applied per port for VNC servers and web proxies
    #[serde(default = "default_port_timeout")]
    pub port_timeout_secs: u64,

    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_frame_buffer_timeout() -> u64 {
    10
}

fn default_desktop_timeout() -> u64 {
    30
}

fn default_port_timeout() -> u64 {
    10
}

fn default_supervisor_interval() -> u64 {
    5
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            frame_buffer_timeout_secs: default_frame_buffer_timeout(),
            desktop_timeout_secs: default_desktop_timeout(),
            port_timeout_secs: default_port_timeout(),
            supervisor_interval_secs: default_supervisor_interval(),
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout_for(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::FrameBuffer => self.frame_buffer_timeout_secs,
            Stage::Desktop => self.desktop_timeout_secs,
            Stage::RemoteFramebuffer | Stage::WebProxy => self.port_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs)
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.poll_interval_ms == 0 || self.supervisor_interval_secs == 0 {
            return Err(ProvisionError::Configuration(
                "poll and supervisor intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A program plus argument template.
///
/// Arguments may contain `{display}`, `{width}`, `{height}`, `{dpi}`,
/// `{vnc_port}`, `{web_port}` and `{novnc_dir}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Command lines for every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: CommandTemplate,

    /// Probe that exits 0 once the X server answers
    #[serde(default = "default_display_probe")]
    pub display_probe: CommandTemplate,

    #[serde(default = "default_panel")]
    pub panel: CommandTemplate,

    #[serde(default = "default_window_manager")]
    pub window_manager: CommandTemplate,

    /// Window class searched for to confirm the window manager is up
    #[serde(default = "default_window_manager_class")]
    pub window_manager_class: String,

    #[serde(default = "default_vnc_server")]
    pub vnc_server: CommandTemplate,

    #[serde(default = "default_web_proxy")]
    pub web_proxy: CommandTemplate,

    #[serde(default = "default_novnc_dir")]
    pub novnc_dir: String,
}

fn default_frame_buffer() -> CommandTemplate {
    CommandTemplate::new(
        "Xvfb",
        &[
            ":{display}",
            "-ac",
            "-screen",
            "0",
            "{width}x{height}x24",
            "-retro",
            "-dpi",
            "{dpi}",
            "-nolisten",
            "tcp",
            "-nolisten",
            "unix",
        ],
    )
}

fn default_display_probe() -> CommandTemplate {
    CommandTemplate::new("xdpyinfo", &["-display", ":{display}"])
}

fn default_panel() -> CommandTemplate {
    CommandTemplate::new("tint2", &[])
}

fn default_window_manager() -> CommandTemplate {
    CommandTemplate::new("mutter", &["--replace", "--sm-disable"]).with_env("XDG_SESSION_TYPE", "x11")
}

fn default_window_manager_class() -> String {
    "mutter".to_string()
}

fn default_vnc_server() -> CommandTemplate {
    // -nopw: the remote desktop is served without a password. The deployment
    // is assumed to sit on a trusted network.
    CommandTemplate::new(
        "x11vnc",
        &[
            "-display",
            ":{display}",
            "-forever",
            "-shared",
            "-wait",
            "50",
            "-rfbport",
            "{vnc_port}",
            "-nopw",
        ],
    )
}

fn default_web_proxy() -> CommandTemplate {
    CommandTemplate::new(
        "{novnc_dir}/utils/novnc_proxy",
        &[
            "--vnc",
            "localhost:{vnc_port}",
            "--listen",
            "{web_port}",
            "--web",
            "{novnc_dir}",
        ],
    )
}

fn default_novnc_dir() -> String {
    "/opt/noVNC".to_string()
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            frame_buffer: default_frame_buffer(),
            display_probe: default_display_probe(),
            panel: default_panel(),
            window_manager: default_window_manager(),
            window_manager_class: default_window_manager_class(),
            vnc_server: default_vnc_server(),
            web_proxy: default_web_proxy(),
            novnc_dir: default_novnc_dir(),
        }
    }
}

impl CommandConfig {
    /// Whether the configured VNC server runs without a password.
    pub fn vnc_is_unauthenticated(&self) -> bool {
        self.vnc_server.args.iter().any(|a| a == "-nopw")
    }
}

/// Everything the provisioning pipeline needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub commands: CommandConfig,
}

impl ProvisionConfig {
    pub fn validate(&self) -> ProvisionResult<()> {
        self.display.validate()?;
        self.readiness.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProvisionConfig::default();
        assert_eq!(config.display.width, 1024);
        assert_eq!(config.display.height, 768);
        assert_eq!(config.display.dpi, 96);
        assert_eq!(config.readiness.timeout_for(Stage::FrameBuffer), Duration::from_secs(10));
        assert_eq!(config.readiness.timeout_for(Stage::Desktop), Duration::from_secs(30));
        assert_eq!(config.readiness.supervisor_interval(), Duration::from_secs(5));
        assert!(config.commands.vnc_is_unauthenticated());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ProvisionConfig = toml::from_str(
            r#"
            [display]
            vnc_ports = [5900, 5901]

            [readiness]
            port_timeout_secs = 3
            "#,
        )
        .unwrap();

        let slots = config.display.allocate().unwrap();
        assert_eq!(slots[1].web_port, 6081);
        assert_eq!(config.readiness.port_timeout_secs, 3);
        assert_eq!(config.readiness.desktop_timeout_secs, 30);
        assert_eq!(config.commands.window_manager_class, "mutter");
    }

    #[test]
    fn test_validate_rejects_mismatched_lists() {
        let mut config = ProvisionConfig::default();
        config.display.vnc_ports = vec![5900, 5901];
        config.display.web_ports = vec![6080];
        assert!(matches!(
            config.validate(),
            Err(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_lock_file_template() {
        let config = DisplayConfig::default();
        assert_eq!(config.lock_file_for(3), "/tmp/.X3-lock");
    }
}
