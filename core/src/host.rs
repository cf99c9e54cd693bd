//! Host abstraction for spawning and probing desktop processes.
//!
//! The provisioning pipeline never touches `tokio::process` directly. It goes
//! through [`DesktopHost`], whose production implementation is [`LocalHost`].
//! Every child gets its own environment (`DISPLAY=:N` and friends) set on the
//! `Command`, so concurrent per-display launches never share process-global
//! state.

use crate::config::{CommandConfig, CommandTemplate, DisplayConfig};
use crate::errors::{ProvisionError, ProvisionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Lines of stderr retained per process.
pub const STDERR_TAIL_LINES: usize = 200;

/// Upper bound for a single probe command or connect attempt.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A fully rendered command line ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Short name for logs, e.g. `x11vnc :1`
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment binding, if set.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A long-running child process owned by the pipeline.
#[async_trait]
pub trait ManagedProcess: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn has_exited(&mut self) -> bool;

    /// Most recent stderr lines, newline separated.
    fn stderr_tail(&self) -> String;

    /// Stop the process and reap it.
    async fn terminate(&mut self);
}

/// Everything the pipeline needs from the machine it runs on.
#[async_trait]
pub trait DesktopHost: Send + Sync {
    /// Whether an X server already holds `display` (lock indicator present).
    async fn display_locked(&self, display: u32) -> bool;

    async fn spawn(&self, spec: ProcessSpec) -> ProvisionResult<Box<dyn ManagedProcess>>;

    /// Whether the X server for `display` answers queries.
    async fn probe_display(&self, display: u32) -> bool;

    /// Whether a window with class `class` exists on `display`.
    async fn probe_window_class(&self, display: u32, class: &str) -> bool;

    /// Whether something accepts TCP connections on localhost:`port`.
    async fn port_listening(&self, port: u16) -> bool {
        tcp_listening(port).await
    }
}

/// Try a single TCP connect to `127.0.0.1:port`.
pub async fn tcp_listening(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

// ============================================================================
// STDERR CAPTURE
// ============================================================================

/// Bounded buffer holding the tail of a process's stderr.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
}

impl StderrTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(max_lines.min(64)))),
            max_lines,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        lines.push_back(line.into());
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    pub fn contents(&self) -> String {
        self.lines
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drain a child's stderr into this buffer until EOF.
    ///
    /// The returned handle resolves once the pipe is closed.
    pub(crate) fn follow(&self, stderr: ChildStderr) -> JoinHandle<()> {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tail.push(line);
            }
        })
    }
}

// ============================================================================
// LOCAL HOST
// ============================================================================

/// [`DesktopHost`] backed by real processes on this machine.
pub struct LocalHost {
    display: DisplayConfig,
    display_probe: CommandTemplate,
}

impl LocalHost {
    pub fn new(display: DisplayConfig, display_probe: CommandTemplate) -> Self {
        Self {
            display,
            display_probe,
        }
    }

    /// Programs referenced by `commands` that cannot be found on `PATH`.
    pub fn preflight(commands: &CommandConfig) -> Vec<String> {
        let novnc = |p: &str| p.replace("{novnc_dir}", &commands.novnc_dir);
        let programs = [
            commands.frame_buffer.program.clone(),
            commands.display_probe.program.clone(),
            commands.panel.program.clone(),
            commands.window_manager.program.clone(),
            "xdotool".to_string(),
            commands.vnc_server.program.clone(),
            novnc(&commands.web_proxy.program),
        ];

        programs
            .into_iter()
            .filter(|program| {
                if program.contains('/') {
                    !Path::new(program).exists()
                } else {
                    which::which(program).is_err()
                }
            })
            .collect()
    }

    async fn probe(mut command: Command) -> bool {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(PROBE_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("Probe failed to run: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl DesktopHost for LocalHost {
    async fn display_locked(&self, display: u32) -> bool {
        tokio::fs::metadata(self.display.lock_file_for(display))
            .await
            .is_ok()
    }

    async fn spawn(&self, spec: ProcessSpec) -> ProvisionResult<Box<dyn ManagedProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ProvisionError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let stderr = StderrTail::new(STDERR_TAIL_LINES);
        if let Some(pipe) = child.stderr.take() {
            stderr.follow(pipe);
        }

        debug!("Spawned {} (pid {:?})", spec.label, child.id());
        Ok(Box::new(LocalProcess {
            label: spec.label,
            child,
            stderr,
        }))
    }

    async fn probe_display(&self, display: u32) -> bool {
        let display_arg = display.to_string();
        let mut command = Command::new(&self.display_probe.program);
        command.args(
            self.display_probe
                .args
                .iter()
                .map(|a| a.replace("{display}", &display_arg)),
        );
        Self::probe(command).await
    }

    async fn probe_window_class(&self, display: u32, class: &str) -> bool {
        let mut command = Command::new("xdotool");
        command
            .args(["search", "--class", class])
            .env("DISPLAY", format!(":{}", display));
        Self::probe(command).await
    }
}

/// A child spawned by [`LocalHost`].
pub struct LocalProcess {
    label: String,
    child: Child,
    stderr: StderrTail,
}

#[async_trait]
impl ManagedProcess for LocalProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to poll {}: {}", self.label, e);
                true
            }
        }
    }

    fn stderr_tail(&self) -> String {
        self.stderr.contents()
    }

    async fn terminate(&mut self) {
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && timeout(TERMINATE_GRACE, self.child.wait()).await.is_ok()
            {
                debug!("{} exited after SIGTERM", self.label);
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill {}: {}", self.label, e);
        }
    }
}
