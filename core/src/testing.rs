//! Test doubles: an in-memory [`DesktopHost`] and a scripted [`AgentRunner`].
//!
//! Frame buffers and window managers are simulated by bookkeeping only. VNC
//! servers and web proxies bind real loopback listeners, so readiness probes
//! and crash detection run against actual sockets.

use crate::agent_runner::{AgentFailure, AgentRunner, MessageSink, TaskContext};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::host::{DesktopHost, ManagedProcess, ProcessSpec, StderrTail, STDERR_TAIL_LINES};
use crate::session::{Message, MessageRole};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Reserve `n` distinct loopback ports that are free right now.
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .filter_map(|_| TcpListener::bind("127.0.0.1:0").ok())
        .collect();
    listeners
        .iter()
        .filter_map(|l| l.local_addr().ok().map(|a| a.port()))
        .collect()
}

#[derive(Clone)]
struct FakeHandle {
    program: String,
    display: Option<u32>,
    port: Option<u16>,
    stalled: bool,
    exited: Arc<AtomicBool>,
    listener: Arc<Mutex<Option<TcpListener>>>,
    stderr: StderrTail,
}

impl FakeHandle {
    fn alive(&self) -> bool {
        !self.stalled && !self.exited.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.listener.lock().take();
    }
}

#[derive(Default)]
struct FakeState {
    spawned: Vec<ProcessSpec>,
    locked: HashSet<u32>,
    stalled: HashMap<String, String>,
    failing: HashSet<String>,
    handles: Vec<FakeHandle>,
}

/// Scriptable stand-in for the local machine.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an X server already holds `display`.
    pub fn lock_display(&self, display: u32) {
        self.state.lock().locked.insert(display);
    }

    /// Processes of `program` start but never become ready, writing `stderr`.
    pub fn stall_program(&self, program: &str, stderr: &str) {
        self.state
            .lock()
            .stalled
            .insert(program.to_string(), stderr.to_string());
    }

    pub fn clear_stall(&self, program: &str) {
        self.state.lock().stalled.remove(program);
    }

    /// Spawning `program` fails outright.
    pub fn fail_program(&self, program: &str) {
        self.state.lock().failing.insert(program.to_string());
    }

    /// Every spawn request, in order.
    pub fn spawned(&self) -> Vec<ProcessSpec> {
        self.state.lock().spawned.clone()
    }

    pub fn live_count(&self, program: &str) -> usize {
        self.state
            .lock()
            .handles
            .iter()
            .filter(|h| h.program == program && h.alive())
            .count()
    }

    /// Kill the live process serving `port`, as if it had crashed.
    pub fn crash_port(&self, port: u16, stderr: &str) -> bool {
        let state = self.state.lock();
        match state
            .handles
            .iter()
            .find(|h| h.port == Some(port) && h.alive())
        {
            Some(handle) => {
                handle.stderr.push(stderr);
                handle.stop();
                true
            }
            None => false,
        }
    }

    fn live(&self, predicate: impl Fn(&FakeHandle) -> bool) -> bool {
        self.state
            .lock()
            .handles
            .iter()
            .any(|h| h.alive() && predicate(h))
    }
}

fn display_of(spec: &ProcessSpec) -> Option<u32> {
    spec.env_value("DISPLAY")
        .and_then(|d| d.trim_start_matches(':').parse().ok())
}

fn port_of(spec: &ProcessSpec) -> Option<u16> {
    spec.args
        .windows(2)
        .find(|w| w[0] == "-rfbport" || w[0] == "--listen")
        .and_then(|w| w[1].parse().ok())
}

#[async_trait]
impl DesktopHost for FakeHost {
    async fn display_locked(&self, display: u32) -> bool {
        let locked = self.state.lock().locked.contains(&display);
        locked || self.probe_display(display).await
    }

    async fn spawn(&self, spec: ProcessSpec) -> ProvisionResult<Box<dyn ManagedProcess>> {
        let mut state = self.state.lock();
        state.spawned.push(spec.clone());

        if state.failing.contains(&spec.program) {
            return Err(ProvisionError::Spawn {
                program: spec.program,
                reason: "No such file or directory (os error 2)".to_string(),
            });
        }

        let stderr = StderrTail::new(STDERR_TAIL_LINES);
        let stall = state.stalled.get(&spec.program).cloned();
        if let Some(message) = &stall {
            stderr.push(message.clone());
        }

        let port = port_of(&spec);
        let exited = Arc::new(AtomicBool::new(false));
        let listener = match (port, &stall) {
            (Some(port), None) => match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    stderr.push(format!("bind {}: {}", port, e));
                    exited.store(true, Ordering::SeqCst);
                    None
                }
            },
            _ => None,
        };

        let handle = FakeHandle {
            program: spec.program.clone(),
            display: display_of(&spec),
            port,
            stalled: stall.is_some(),
            exited,
            listener: Arc::new(Mutex::new(listener)),
            stderr,
        };
        state.handles.push(handle.clone());
        Ok(Box::new(FakeProcess { handle }))
    }

    async fn probe_display(&self, display: u32) -> bool {
        self.live(|h| h.program == "Xvfb" && h.display == Some(display))
    }

    async fn probe_window_class(&self, display: u32, class: &str) -> bool {
        self.live(|h| h.display == Some(display) && h.program.ends_with(class))
    }
}

struct FakeProcess {
    handle: FakeHandle,
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.handle.exited.load(Ordering::SeqCst)
    }

    fn stderr_tail(&self) -> String {
        self.handle.stderr.contents()
    }

    async fn terminate(&mut self) {
        self.handle.stop();
    }
}

// ============================================================================
// SCRIPTED AGENT
// ============================================================================

/// One step of a scripted agent run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Iteration,
    Say(MessageRole, String),
    Emit(Message),
    Wait(Duration),
    Fail(String),
    Panic,
    Finish(Option<String>),
}

/// [`AgentRunner`] replaying a fixed list of steps.
pub struct ScriptedAgentRunner {
    steps: Vec<ScriptStep>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedAgentRunner {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps, gate: None }
    }

    /// Each run waits for one `notify_one` on the returned handle first.
    pub fn gated(steps: Vec<ScriptStep>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                steps,
                gate: Some(gate.clone()),
            },
            gate,
        )
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn run(
        &self,
        _context: TaskContext,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Option<String>, AgentFailure> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        for step in &self.steps {
            match step {
                ScriptStep::Iteration => {
                    sink.next_iteration()?;
                }
                ScriptStep::Say(role, text) => sink.push(Message::text(*role, text.clone())),
                ScriptStep::Emit(message) => sink.push(message.clone()),
                ScriptStep::Wait(duration) => tokio::time::sleep(*duration).await,
                ScriptStep::Fail(reason) => return Err(AgentFailure::Failed(reason.clone())),
                ScriptStep::Panic => panic!("scripted agent panicked"),
                ScriptStep::Finish(result) => return Ok(result.clone()),
            }
        }
        Ok(None)
    }
}
