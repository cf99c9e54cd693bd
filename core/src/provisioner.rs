//! Display provisioning pipeline.
//!
//! Brings every configured display through four stages in strict order:
//!
//! ```text
//! frame buffer ──► desktop (panel + WM) ──► VNC server ──► web proxy
//! ```
//!
//! Within a stage all displays are handled concurrently; a stage starts only
//! after every display finished the previous one. Each stage is a
//! check-then-act reconciliation, so running the whole pipeline again over a
//! partly healthy topology only restarts what is actually missing. The crash
//! supervisor relies on that.

use crate::config::{CommandTemplate, ProvisionConfig};
use crate::display::{DisplaySlot, DisplayState, SlotRegistry, SlotView, Stage};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::host::{DesktopHost, ManagedProcess, ProcessSpec};
use crate::readiness::wait_until;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Logged once per successful pass, after the last stage.
pub const READY_SENTINEL: &str = "display topology ready";

/// Which process of a display a tracked child is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    FrameBuffer,
    Panel,
    WindowManager,
    VncServer,
    WebProxy,
}

impl ProcessRole {
    /// Long-running network servers watched by the supervisor.
    pub fn is_supervised(self) -> bool {
        matches!(self, ProcessRole::VncServer | ProcessRole::WebProxy)
    }
}

/// A supervised process found dead.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub display_number: u32,
    pub role: ProcessRole,
    pub pid: Option<u32>,
    pub stderr_tail: String,
}

type ProcessTable = BTreeMap<(u32, ProcessRole), Box<dyn ManagedProcess>>;

/// Owns the slot registry and every process it spawned.
pub struct Provisioner {
    config: ProvisionConfig,
    host: Arc<dyn DesktopHost>,
    registry: SlotRegistry,
    processes: Mutex<ProcessTable>,
    /// Serializes pipeline passes (startup vs. supervisor re-runs)
    run_lock: Mutex<()>,
    passes: AtomicU64,
}

impl Provisioner {
    pub fn new(config: ProvisionConfig, host: Arc<dyn DesktopHost>) -> Self {
        Self {
            config,
            host,
            registry: SlotRegistry::new(),
            processes: Mutex::new(BTreeMap::new()),
            run_lock: Mutex::new(()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Read-only view of the slots for the session layer.
    pub fn view(&self) -> SlotView {
        self.registry.view()
    }

    pub fn slots(&self) -> Vec<DisplaySlot> {
        self.registry.snapshot()
    }

    /// Number of successfully completed passes.
    pub fn completed_passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run the full pipeline over every configured display.
    ///
    /// Configuration errors are reported before anything is spawned. A
    /// readiness timeout in any stage aborts the pass; no slot is reported
    /// Ready unless every stage succeeded for every display.
    pub async fn provision(&self) -> ProvisionResult<Vec<DisplaySlot>> {
        let _pass = self.run_lock.lock().await;

        let slots = self.config.display.allocate()?;
        self.registry.install(slots.clone());
        self.registry.set_all(DisplayState::Starting);

        info!(
            "Provisioning {} display(s): {}",
            slots.len(),
            slots
                .iter()
                .map(|s| format!(":{} vnc={} web={}", s.display_number, s.vnc_port, s.web_port))
                .collect::<Vec<_>>()
                .join(", ")
        );

        for stage in Stage::ALL {
            let results = join_all(slots.iter().map(|slot| self.reconcile(stage, slot))).await;

            let mut first_error = None;
            for (slot, result) in slots.iter().zip(results) {
                match result {
                    Ok(()) => self.registry.mark_stage(slot.display_number, stage),
                    Err(e) => {
                        error!("{} failed on display :{}: {}", stage, slot.display_number, e);
                        self.registry.set_state(slot.display_number, DisplayState::Failed);
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            debug!("{} ready on all displays", stage);
        }

        self.registry.set_all(DisplayState::Ready);
        self.passes.fetch_add(1, Ordering::Relaxed);
        info!("{}", READY_SENTINEL);
        Ok(self.registry.snapshot())
    }

    /// Remove and report supervised processes that have exited.
    pub async fn reap_crashed(&self) -> Vec<CrashReport> {
        let mut processes = self.processes.lock().await;
        let dead: Vec<(u32, ProcessRole)> = processes
            .iter_mut()
            .filter(|((_, role), _)| role.is_supervised())
            .filter_map(|(key, process)| process.has_exited().then_some(*key))
            .collect();

        dead.into_iter()
            .filter_map(|key| {
                processes.remove(&key).map(|process| CrashReport {
                    display_number: key.0,
                    role: key.1,
                    pid: process.id(),
                    stderr_tail: process.stderr_tail(),
                })
            })
            .collect()
    }

    /// Terminate every tracked process, newest stage first.
    pub async fn shutdown(&self) {
        let _pass = self.run_lock.lock().await;
        let mut processes = self.processes.lock().await;
        let mut keys: Vec<_> = processes.keys().copied().collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1));

        for key in keys {
            if let Some(mut process) = processes.remove(&key) {
                debug!("Stopping {:?} on display :{}", key.1, key.0);
                process.terminate().await;
            }
        }
        self.registry.set_all(DisplayState::Pending);
        info!("All display processes stopped");
    }

    // ========================================================================
    // STAGES
    // ========================================================================

    async fn reconcile(&self, stage: Stage, slot: &DisplaySlot) -> ProvisionResult<()> {
        match stage {
            Stage::FrameBuffer => self.ensure_frame_buffer(slot).await,
            Stage::Desktop => self.ensure_desktop(slot).await,
            Stage::RemoteFramebuffer => {
                self.ensure_port_server(slot, stage, ProcessRole::VncServer, slot.vnc_port)
                    .await
            }
            Stage::WebProxy => {
                self.ensure_port_server(slot, stage, ProcessRole::WebProxy, slot.web_port)
                    .await
            }
        }
    }

    async fn ensure_frame_buffer(&self, slot: &DisplaySlot) -> ProvisionResult<()> {
        let display_number = slot.display_number;
        if self.host.display_locked(display_number).await {
            debug!("Display :{} already running, skipping frame buffer", display_number);
            return Ok(());
        }

        let spec = self.render(&self.config.commands.frame_buffer, slot, "frame buffer");
        info!("Starting frame buffer on display :{}", display_number);
        let mut process = self.host.spawn(spec).await?;

        let readiness = &self.config.readiness;
        let ready = wait_until(
            readiness.poll_interval(),
            readiness.timeout_for(Stage::FrameBuffer),
            || self.host.probe_display(display_number),
        )
        .await;

        if !ready {
            let diagnostics = process.stderr_tail();
            process.terminate().await;
            return Err(self.timeout(Stage::FrameBuffer, display_number, diagnostics));
        }

        self.track(display_number, ProcessRole::FrameBuffer, process).await;
        Ok(())
    }

    async fn ensure_desktop(&self, slot: &DisplaySlot) -> ProvisionResult<()> {
        let display_number = slot.display_number;
        let commands = &self.config.commands;
        let class = commands.window_manager_class.as_str();

        if self.host.probe_window_class(display_number, class).await {
            debug!("Window manager already up on :{}, skipping desktop", display_number);
            return Ok(());
        }

        info!("Starting panel and window manager on display :{}", display_number);
        let mut panel = self
            .host
            .spawn(self.render(&commands.panel, slot, "panel"))
            .await?;

        let mut wm = match self
            .host
            .spawn(self.render(&commands.window_manager, slot, "window manager"))
            .await
        {
            Ok(wm) => wm,
            Err(e) => {
                panel.terminate().await;
                return Err(e);
            }
        };

        let readiness = &self.config.readiness;
        let ready = wait_until(
            readiness.poll_interval(),
            readiness.timeout_for(Stage::Desktop),
            || self.host.probe_window_class(display_number, class),
        )
        .await;

        if !ready {
            let diagnostics = wm.stderr_tail();
            error!(
                "Window manager on :{} did not come up. stderr:\n{}",
                display_number, diagnostics
            );
            wm.terminate().await;
            panel.terminate().await;
            return Err(self.timeout(Stage::Desktop, display_number, diagnostics));
        }

        self.track(display_number, ProcessRole::Panel, panel).await;
        self.track(display_number, ProcessRole::WindowManager, wm).await;
        Ok(())
    }

    async fn ensure_port_server(
        &self,
        slot: &DisplaySlot,
        stage: Stage,
        role: ProcessRole,
        port: u16,
    ) -> ProvisionResult<()> {
        let display_number = slot.display_number;
        let tracked_alive = self.tracked_alive(display_number, role).await;
        let listening = self.host.port_listening(port).await;

        match (tracked_alive, listening) {
            (true, true) => {
                debug!("{} for :{} healthy on port {}", stage, display_number, port);
                return Ok(());
            }
            (false, true) => {
                warn!(
                    "Port {} already accepts connections but is not ours; leaving it for :{}",
                    port, display_number
                );
                return Ok(());
            }
            _ => {}
        }

        let template = match role {
            ProcessRole::VncServer => &self.config.commands.vnc_server,
            _ => &self.config.commands.web_proxy,
        };
        info!("Starting {} for display :{} on port {}", stage, display_number, port);
        let mut process = self
            .host
            .spawn(self.render(template, slot, &stage.to_string()))
            .await?;

        let readiness = &self.config.readiness;
        let ready = wait_until(readiness.poll_interval(), readiness.timeout_for(stage), || {
            self.host.port_listening(port)
        })
        .await;

        if !ready {
            let diagnostics = process.stderr_tail();
            process.terminate().await;
            return Err(self.timeout(stage, display_number, diagnostics));
        }

        self.track(display_number, role, process).await;
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn tracked_alive(&self, display: u32, role: ProcessRole) -> bool {
        match self.processes.lock().await.get_mut(&(display, role)) {
            Some(process) => !process.has_exited(),
            None => false,
        }
    }

    /// Record `process`, stopping whatever it replaces.
    async fn track(&self, display: u32, role: ProcessRole, process: Box<dyn ManagedProcess>) {
        let previous = self.processes.lock().await.insert((display, role), process);
        if let Some(mut previous) = previous {
            previous.terminate().await;
        }
    }

    fn timeout(&self, stage: Stage, display: u32, diagnostics: String) -> ProvisionError {
        ProvisionError::ReadinessTimeout {
            stage,
            display,
            timeout_secs: self.config.readiness.timeout_for(stage).as_secs(),
            diagnostics,
        }
    }

    /// Expand a command template for one slot.
    ///
    /// `DISPLAY` is bound on the child only, never on this process.
    fn render(&self, template: &CommandTemplate, slot: &DisplaySlot, label: &str) -> ProcessSpec {
        let display = &self.config.display;
        let novnc_dir = &self.config.commands.novnc_dir;
        let expand = |raw: &str| {
            raw.replace("{novnc_dir}", novnc_dir)
                .replace("{display}", &slot.display_number.to_string())
                .replace("{width}", &display.width.to_string())
                .replace("{height}", &display.height.to_string())
                .replace("{dpi}", &display.dpi.to_string())
                .replace("{vnc_port}", &slot.vnc_port.to_string())
                .replace("{web_port}", &slot.web_port.to_string())
        };

        let mut spec = ProcessSpec::new(
            format!("{} :{}", label, slot.display_number),
            expand(&template.program),
        );
        for arg in &template.args {
            spec = spec.arg(expand(arg));
        }
        let mut env: Vec<_> = template.env.iter().collect();
        env.sort();
        for (key, value) in env {
            spec = spec.env(key.as_str(), expand(value));
        }
        spec.env("DISPLAY", slot.x_display())
    }
}
