/// Agent execution seam for the task coordinator.
///
/// The coordinator hands an [`AgentRunner`] a [`TaskContext`] describing the
/// task and its display, plus a [`MessageSink`] the agent reports through:
/// - `push` appends a message to the task history and streams it live
/// - `next_iteration` counts one agent step and enforces the iteration limit
///
/// [`ProcessAgentRunner`] runs an external agent command per task and reads
/// its NDJSON output.
use crate::host::{StderrTail, STDERR_TAIL_LINES};
use crate::session::{Message, MessageRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a failed agent's stderr may take to reach EOF after exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why an agent run ended without a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentFailure {
    #[error("Failed to launch agent: {0}")]
    Launch(String),

    #[error("Iteration limit of {0} reached")]
    IterationLimit(u32),

    #[error("Agent timed out after {0}s")]
    TimedOut(u64),

    #[error("Agent failed: {0}")]
    Failed(String),
}

/// Everything an agent needs to know about the task it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub description: String,
    pub max_iterations: u32,
    pub display_number: u32,
    pub display_index: u32,
    pub provider: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub enable_thinking: bool,
}

impl TaskContext {
    pub fn x_display(&self) -> String {
        format!(":{}", self.display_number)
    }
}

/// Where an agent reports progress.
pub trait MessageSink: Send + Sync {
    /// Append a message to the task history and publish it.
    fn push(&self, message: Message);

    /// Count one agent step. Fails once `max_iterations` steps were taken.
    fn next_iteration(&self) -> Result<u32, AgentFailure>;

    fn iterations(&self) -> u32;
}

/// Runs one task to completion.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Returns the final result text, if the agent produced one.
    async fn run(
        &self,
        context: TaskContext,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Option<String>, AgentFailure>;
}

// ============================================================================
// PROCESS RUNNER
// ============================================================================

/// External agent command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Wall-clock limit per task; none when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_agent_program() -> String {
    "vdesk-agent".to_string()
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }
}

/// One parsed line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentLine {
    Iteration,
    Message(Message),
    Blank,
}

#[derive(Deserialize)]
struct WireLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    role: Option<MessageRole>,
    content: Option<serde_json::Value>,
    message_type: Option<String>,
}

/// Interpret one stdout line.
///
/// JSON objects with `role` and `content` become messages and
/// `{"type": "iteration"}` marks a step. Anything else is kept as assistant
/// text so no output is lost.
pub fn parse_line(line: &str) -> AgentLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return AgentLine::Blank;
    }

    match serde_json::from_str::<WireLine>(trimmed) {
        Ok(WireLine {
            kind: Some(kind), ..
        }) if kind == "iteration" => AgentLine::Iteration,
        Ok(WireLine {
            role: Some(role),
            content: Some(content),
            message_type,
            ..
        }) => AgentLine::Message(Message::new(
            role,
            content,
            message_type.unwrap_or_else(|| "text".to_string()),
        )),
        _ => AgentLine::Message(Message::text(MessageRole::Assistant, trimmed)),
    }
}

/// [`AgentRunner`] that launches the configured agent command per task.
pub struct ProcessAgentRunner {
    config: AgentCommandConfig,
}

impl ProcessAgentRunner {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, context: &TaskContext) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env("DISPLAY", context.x_display())
            .env("DISPLAY_INDEX", context.display_index.to_string())
            .env("TASK_ID", context.task_id.to_string())
            .env("TASK_DESCRIPTION", &context.description)
            .env("MAX_ITERATIONS", context.max_iterations.to_string())
            .env("PROVIDER", &context.provider)
            .env("MODEL", &context.model)
            .env("MAX_OUTPUT_TOKENS", context.max_output_tokens.to_string())
            .env("ENABLE_THINKING", context.enable_thinking.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
    }

    async fn run_process(
        &self,
        context: &TaskContext,
        sink: &dyn MessageSink,
    ) -> Result<Option<String>, AgentFailure> {
        let mut child = self
            .build_command(context)
            .spawn()
            .map_err(|e| AgentFailure::Launch(format!("{}: {}", self.config.program, e)))?;

        let stderr = StderrTail::new(STDERR_TAIL_LINES);
        let stderr_reader = child.stderr.take().map(|pipe| stderr.follow(pipe));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentFailure::Launch("agent stdout was not captured".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut result = None;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read agent output for task {}: {}", context.task_id, e);
                    break;
                }
            };

            match parse_line(&line) {
                AgentLine::Blank => {}
                AgentLine::Iteration => {
                    if let Err(failure) = sink.next_iteration() {
                        if let Err(e) = child.kill().await {
                            warn!("Failed to stop agent for task {}: {}", context.task_id, e);
                        }
                        return Err(failure);
                    }
                }
                AgentLine::Message(message) => {
                    if message.role == MessageRole::Assistant && message.message_type == "text" {
                        if let Some(text) = message.content.as_str() {
                            result = Some(text.to_string());
                        }
                    }
                    sink.push(message);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentFailure::Failed(format!("waiting for agent: {}", e)))?;
        if status.success() {
            Ok(result)
        } else {
            // The exit can be observed before the last stderr lines are read
            if let Some(reader) = stderr_reader {
                if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!("stderr of agent for task {} still open after exit", context.task_id);
                }
            }
            let tail = stderr.contents();
            Err(AgentFailure::Failed(if tail.is_empty() {
                format!("agent exited with {}", status)
            } else {
                format!("agent exited with {}: {}", status, tail)
            }))
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(
        &self,
        context: TaskContext,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Option<String>, AgentFailure> {
        info!(
            "Launching {} for task {} on display {}",
            self.config.program,
            context.task_id,
            context.x_display()
        );

        let outcome = match self.config.timeout_secs {
            Some(secs) => tokio::time::timeout(
                Duration::from_secs(secs),
                self.run_process(&context, sink.as_ref()),
            )
            .await
            .unwrap_or(Err(AgentFailure::TimedOut(secs))),
            None => self.run_process(&context, sink.as_ref()).await,
        };

        debug!("Agent for task {} finished: {:?}", context.task_id, outcome);
        outcome
    }
}
