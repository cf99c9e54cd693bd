//! Task execution coordinator.
//!
//! At most one task runs per session. The running slot is claimed atomically
//! before anything else happens, so concurrent start requests for the same
//! session yield exactly one running task and `TaskAlreadyRunning` for the
//! rest.
//!
//! Live event order for a task:
//!
//! ```text
//! task_update(running) → message* → task_update(completed) → task_complete
//! task_update(running) → message* → error → task_update(error) → task_complete
//! ```
//!
//! after which the task's live channel is closed.

use crate::agent_runner::{AgentFailure, AgentRunner, MessageSink, TaskContext};
use crate::errors::{SessionError, SessionResult};
use crate::live_update::{LiveUpdateEvent, LiveUpdateHub};
use crate::session::{LogLevel, Message, Session, StartTaskRequest, Task, TaskStatus};
use crate::session_manager::SessionManager;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifetime task counters.
#[derive(Debug, Default)]
pub struct TaskStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TaskStats {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct TaskCoordinator {
    sessions: Arc<SessionManager>,
    runner: Arc<dyn AgentRunner>,
    hub: Arc<LiveUpdateHub>,
    tasks: Arc<DashMap<Uuid, Task>>,
    /// session id -> running task id
    running: Arc<DashMap<Uuid, Uuid>>,
    stats: Arc<TaskStats>,
}

impl TaskCoordinator {
    pub fn new(
        sessions: Arc<SessionManager>,
        runner: Arc<dyn AgentRunner>,
        hub: Arc<LiveUpdateHub>,
    ) -> Self {
        Self {
            sessions,
            runner,
            hub,
            tasks: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            stats: Arc::new(TaskStats::default()),
        }
    }

    pub fn hub(&self) -> Arc<LiveUpdateHub> {
        Arc::clone(&self.hub)
    }

    pub fn stats(&self) -> Arc<TaskStats> {
        Arc::clone(&self.stats)
    }

    /// Create a task in `session_id` and start executing it in the background.
    ///
    /// Returns the task as it is once Running.
    pub fn start_task(&self, session_id: Uuid, request: StartTaskRequest) -> SessionResult<Task> {
        self.start_task_subscribed(session_id, request)
            .map(|(task, _)| task)
    }

    /// Like [`TaskCoordinator::start_task`], also returning a receiver
    /// subscribed before the first `task_update`, so it observes every event
    /// of the task.
    pub fn start_task_subscribed(
        &self,
        session_id: Uuid,
        request: StartTaskRequest,
    ) -> SessionResult<(Task, broadcast::Receiver<LiveUpdateEvent>)> {
        let session = self.sessions.get_session(session_id)?;
        if session.is_closed() {
            return Err(SessionError::SessionClosed(session_id));
        }

        let task = Task::new(session_id, request);
        match self.running.entry(session_id) {
            Entry::Occupied(entry) => {
                return Err(SessionError::TaskAlreadyRunning {
                    session_id,
                    task_id: *entry.get(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(task.id);
            }
        }

        let session = match self.sessions.begin_task(session_id) {
            Ok(session) => session,
            Err(e) => {
                self.running.remove(&session_id);
                return Err(e);
            }
        };

        let task_id = task.id;
        let description = task.description.clone();
        self.tasks.insert(task_id, task);
        self.hub.open(task_id);
        let receiver = self
            .hub
            .subscribe(task_id)
            .ok_or(SessionError::TaskNotFound(task_id))?;

        let running = self
            .transition(task_id, TaskStatus::Running, |task| {
                task.started_at = Some(Utc::now());
            })
            .ok_or(SessionError::TaskNotFound(task_id))?;
        self.stats.started.fetch_add(1, Ordering::Relaxed);

        info!(
            "Task {} started in session {} on display :{}",
            task_id, session_id, session.display_number
        );
        self.sessions.record(
            session_id,
            LogLevel::Info,
            format!("Task {} started: {}", task_id, description),
        );
        self.spawn_execution(&session, &running);
        Ok((running, receiver))
    }

    /// Full task including message history.
    pub fn get_task(&self, task_id: Uuid) -> SessionResult<Task> {
        self.tasks
            .get(&task_id)
            .map(|t| t.clone())
            .ok_or(SessionError::TaskNotFound(task_id))
    }

    /// Tasks of a session without their histories, newest first.
    pub fn list_tasks(&self, session_id: Uuid) -> SessionResult<Vec<Task>> {
        self.sessions.get_session(session_id)?;
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.summary())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub fn running_task(&self, session_id: Uuid) -> Option<Uuid> {
        self.running.get(&session_id).map(|t| *t)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn transition(
        &self,
        task_id: Uuid,
        next: TaskStatus,
        update: impl FnOnce(&mut Task),
    ) -> Option<Task> {
        let snapshot = apply_status(&self.tasks, task_id, next, update)?;
        self.hub
            .publish(task_id, LiveUpdateEvent::task_update(&snapshot));
        Some(snapshot)
    }

    fn spawn_execution(&self, session: &Session, task: &Task) {
        let context = TaskContext {
            task_id: task.id,
            session_id: session.id,
            description: task.description.clone(),
            max_iterations: task.max_iterations,
            display_number: session.display_number,
            display_index: task.display_index,
            provider: session.provider.clone(),
            model: session.model.clone(),
            max_output_tokens: session.max_output_tokens,
            enable_thinking: session.enable_thinking,
        };
        let sink = Arc::new(TaskSink {
            task_id: task.id,
            max_iterations: task.max_iterations,
            iterations: AtomicU32::new(0),
            tasks: Arc::clone(&self.tasks),
            hub: Arc::clone(&self.hub),
        });

        let runner = Arc::clone(&self.runner);
        let tasks = Arc::clone(&self.tasks);
        let running = Arc::clone(&self.running);
        let sessions = Arc::clone(&self.sessions);
        let hub = Arc::clone(&self.hub);
        let stats = Arc::clone(&self.stats);
        let session_id = session.id;
        let task_id = task.id;

        tokio::spawn(async move {
            // Run on its own task so a panicking agent surfaces as a JoinError
            let agent = tokio::spawn(async move { runner.run(context, sink).await });
            let outcome = match agent.await {
                Ok(outcome) => outcome,
                Err(e) => Err(AgentFailure::Failed(format!("agent aborted: {}", e))),
            };

            let (finished, failure) = match outcome {
                Ok(result) => {
                    let finished = apply_status(&tasks, task_id, TaskStatus::Completed, |task| {
                        task.result = result;
                        task.completed_at = Some(Utc::now());
                    });
                    (finished, None)
                }
                Err(failure) => {
                    let message = failure.to_string();
                    error!("Task {} failed: {}", task_id, message);
                    let finished = apply_status(&tasks, task_id, TaskStatus::Error, |task| {
                        task.error = Some(message.clone());
                        task.completed_at = Some(Utc::now());
                    });
                    (finished, Some(message))
                }
            };

            // Free the session before anyone hears about the outcome
            running.remove_if(&session_id, |_, running_id| *running_id == task_id);
            sessions.end_task(session_id);

            match (&finished, &failure) {
                (Some(_), None) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    info!("Task {} completed", task_id);
                    sessions.record(session_id, LogLevel::Info, format!("Task {} completed", task_id));
                }
                (Some(_), Some(message)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    sessions.record(
                        session_id,
                        LogLevel::Error,
                        format!("Task {} failed: {}", task_id, message),
                    );
                }
                (None, _) => {}
            }

            if let Some(message) = failure {
                hub.publish(task_id, LiveUpdateEvent::Error { message });
            }
            if let Some(task) = &finished {
                hub.publish(task_id, LiveUpdateEvent::task_update(task));
            }
            let status = tasks
                .get(&task_id)
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Error);
            hub.publish(task_id, LiveUpdateEvent::TaskComplete { status });
            hub.close(task_id);
        });
    }
}

/// Apply a monotonic status change, returning the updated task.
fn apply_status(
    tasks: &DashMap<Uuid, Task>,
    task_id: Uuid,
    next: TaskStatus,
    update: impl FnOnce(&mut Task),
) -> Option<Task> {
    let mut task = tasks.get_mut(&task_id)?;
    if !task.status.can_transition_to(next) {
        warn!(
            "Ignoring transition of task {} from {:?} to {:?}",
            task_id, task.status, next
        );
        return None;
    }
    task.status = next;
    update(&mut *task);
    Some(task.clone())
}

/// [`MessageSink`] writing into a task's history and live channel.
struct TaskSink {
    task_id: Uuid,
    max_iterations: u32,
    iterations: AtomicU32,
    tasks: Arc<DashMap<Uuid, Task>>,
    hub: Arc<LiveUpdateHub>,
}

impl MessageSink for TaskSink {
    fn push(&self, mut message: Message) {
        message.iteration = self.iterations();
        {
            let Some(mut task) = self.tasks.get_mut(&self.task_id) else {
                return;
            };
            if task.status.is_terminal() {
                warn!("Dropping message for finished task {}", self.task_id);
                return;
            }
            task.messages.push(message.clone());
        }
        self.hub
            .publish(self.task_id, LiveUpdateEvent::message(&message));
    }

    fn next_iteration(&self) -> Result<u32, AgentFailure> {
        let next = self
            .iterations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_iterations).then_some(n + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| AgentFailure::IterationLimit(self.max_iterations))?;

        if let Some(mut task) = self.tasks.get_mut(&self.task_id) {
            task.iterations = next;
        }
        Ok(next)
    }

    fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplaySlot, DisplayState, SlotRegistry};
    use crate::session::{CreateSessionRequest, MessageRole};
    use crate::testing::{ScriptStep, ScriptedAgentRunner};
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    struct Fixture {
        _registry: SlotRegistry,
        sessions: Arc<SessionManager>,
        coordinator: TaskCoordinator,
    }

    fn fixture(runner: ScriptedAgentRunner) -> Fixture {
        let registry = SlotRegistry::new();
        registry.install(vec![DisplaySlot::new(1, 5900, 6080), DisplaySlot::new(2, 5901, 6081)]);
        registry.set_all(DisplayState::Ready);
        let sessions = Arc::new(SessionManager::new(registry.view()));
        let coordinator = TaskCoordinator::new(
            sessions.clone(),
            Arc::new(runner),
            Arc::new(LiveUpdateHub::new()),
        );
        Fixture {
            _registry: registry,
            sessions,
            coordinator,
        }
    }

    async fn wait_terminal(coordinator: &TaskCoordinator, task_id: Uuid) -> Task {
        for _ in 0..200 {
            let task = coordinator.get_task(task_id).unwrap();
            if task.status.is_terminal() && coordinator.hub().subscribe(task_id).is_none() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    async fn collect(mut rx: tokio::sync::broadcast::Receiver<LiveUpdateEvent>) -> Vec<LiveUpdateEvent> {
        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) => events.push(event),
                Err(RecvError::Closed) => return events,
                Err(RecvError::Lagged(n)) => panic!("lagged by {}", n),
            }
        }
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![
            ScriptStep::Iteration,
            ScriptStep::Say(MessageRole::Assistant, "I'll list the files".into()),
            ScriptStep::Say(MessageRole::Tool, "a.txt\nb.txt".into()),
            ScriptStep::Finish(Some("a.txt b.txt".into())),
        ]);
        let fx = fixture(runner);
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();

        let task = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("list files"))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        let rx = fx.coordinator.hub().subscribe(task.id).unwrap();
        gate.notify_one();
        let events = collect(rx).await;

        let finished = fx.coordinator.get_task(task.id).unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.result.as_deref(), Some("a.txt b.txt"));
        assert_eq!(finished.iterations, 1);

        // History equals the concatenated message events
        let streamed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, LiveUpdateEvent::Message { .. }))
            .cloned()
            .collect();
        let stored: Vec<_> = finished.messages.iter().map(LiveUpdateEvent::message).collect();
        assert_eq!(streamed, stored);
        assert_eq!(stored.len(), 2);

        assert!(matches!(
            events.last(),
            Some(LiveUpdateEvent::TaskComplete {
                status: TaskStatus::Completed
            })
        ));
        assert!(!events.iter().any(|e| matches!(e, LiveUpdateEvent::Error { .. })));
        assert_eq!(fx.sessions.get_session(session.id).unwrap().task_count, 1);
    }

    #[tokio::test]
    async fn test_failure_emits_error_once_then_completes() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![
            ScriptStep::Say(MessageRole::Assistant, "trying".into()),
            ScriptStep::Fail("model unavailable".into()),
        ]);
        let fx = fixture(runner);
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let task = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("open a browser"))
            .unwrap();

        let rx = fx.coordinator.hub().subscribe(task.id).unwrap();
        gate.notify_one();
        let events = collect(rx).await;

        let errors = events
            .iter()
            .filter(|e| matches!(e, LiveUpdateEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);

        let n = events.len();
        assert!(matches!(events[n - 3], LiveUpdateEvent::Error { .. }));
        match &events[n - 2] {
            LiveUpdateEvent::TaskUpdate { task } => assert_eq!(task.status, TaskStatus::Error),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            events[n - 1],
            LiveUpdateEvent::TaskComplete {
                status: TaskStatus::Error
            }
        );

        let failed = fx.coordinator.get_task(task.id).unwrap();
        assert!(failed.error.unwrap().contains("model unavailable"));
        assert_eq!(fx.coordinator.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_panicking_agent_marks_task_error() {
        let fx = fixture(ScriptedAgentRunner::new(vec![ScriptStep::Panic]));
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let task = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("crash"))
            .unwrap();

        let finished = wait_terminal(&fx.coordinator, task.id).await;
        assert_eq!(finished.status, TaskStatus::Error);
        assert_eq!(fx.coordinator.running_task(session.id), None);
    }

    #[tokio::test]
    async fn test_iteration_limit_fails_task() {
        let fx = fixture(ScriptedAgentRunner::new(vec![
            ScriptStep::Iteration,
            ScriptStep::Iteration,
            ScriptStep::Iteration,
            ScriptStep::Finish(None),
        ]));
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let mut request = StartTaskRequest::new("loop forever");
        request.max_iterations = 2;
        let task = fx.coordinator.start_task(session.id, request).unwrap();

        let finished = wait_terminal(&fx.coordinator, task.id).await;
        assert_eq!(finished.status, TaskStatus::Error);
        assert_eq!(finished.iterations, 2);
        assert_eq!(
            finished.error.as_deref(),
            Some("Iteration limit of 2 reached")
        );
    }

    #[tokio::test]
    async fn test_second_task_rejected_while_first_runs() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![ScriptStep::Finish(None)]);
        let fx = fixture(runner);
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();

        let first = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("first"))
            .unwrap();
        let err = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("second"))
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::TaskAlreadyRunning {
                session_id: session.id,
                task_id: first.id
            }
        );

        // The first task is unaffected and the session frees up afterwards
        assert_eq!(fx.coordinator.get_task(first.id).unwrap().status, TaskStatus::Running);
        gate.notify_one();
        wait_terminal(&fx.coordinator, first.id).await;

        gate.notify_one();
        let second = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("second"))
            .unwrap();
        wait_terminal(&fx.coordinator, second.id).await;
        assert_eq!(fx.coordinator.list_tasks(session.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_running_task() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![ScriptStep::Finish(None)]);
        let fx = fixture(runner);
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let coordinator = Arc::new(fx.coordinator);

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.start_task(session.id, StartTaskRequest::new(format!("task {}", i)))
                })
            })
            .collect();

        let mut started = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => started += 1,
                Err(SessionError::TaskAlreadyRunning { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((started, rejected), (1, 7));
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_session_is_free_when_outcome_is_published() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![ScriptStep::Finish(None)]);
        let fx = fixture(runner);
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();

        for round in 0..3 {
            let (task, mut rx) = fx
                .coordinator
                .start_task_subscribed(session.id, StartTaskRequest::new(format!("round {}", round)))
                .unwrap();
            gate.notify_one();

            loop {
                match rx.recv().await.unwrap() {
                    LiveUpdateEvent::TaskUpdate { task: update } if update.status.is_terminal() => {
                        assert_eq!(update.id, task.id);
                        assert_eq!(fx.coordinator.running_task(session.id), None);
                        break;
                    }
                    _ => {}
                }
            }
            // Reacting to the terminal update never races the running claim
            let next = fx
                .coordinator
                .start_task(session.id, StartTaskRequest::new("follow-up"))
                .unwrap();
            gate.notify_one();
            wait_terminal(&fx.coordinator, next.id).await;
        }
    }

    #[tokio::test]
    async fn test_closed_session_keeps_display_until_task_ends() {
        let (runner, gate) = ScriptedAgentRunner::gated(vec![ScriptStep::Finish(None)]);
        let fx = fixture(runner);
        let first = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        fx.sessions.create_session(CreateSessionRequest::default()).unwrap();

        let task = fx
            .coordinator
            .start_task(first.id, StartTaskRequest::new("long job"))
            .unwrap();
        fx.sessions.close_session(first.id).unwrap();

        // The agent still drives display :1, so it cannot be leased again
        assert_eq!(
            fx.sessions
                .create_session(CreateSessionRequest::default())
                .unwrap_err(),
            SessionError::CapacityExceeded(2)
        );
        assert_eq!(fx.coordinator.get_task(task.id).unwrap().status, TaskStatus::Running);

        gate.notify_one();
        let finished = wait_terminal(&fx.coordinator, task.id).await;
        assert_eq!(finished.status, TaskStatus::Completed);

        let next = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        assert_eq!(next.display_number, first.display_number);

        let logs = fx.sessions.session_logs(first.id).unwrap();
        assert!(logs.iter().any(|e| e.message.contains("held until the running task finishes")));
        assert!(logs.iter().any(|e| e.message == "Display :1 released"));
    }

    #[tokio::test]
    async fn test_failed_task_is_logged_as_error() {
        let fx = fixture(ScriptedAgentRunner::new(vec![ScriptStep::Fail("no display".into())]));
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let task = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("open a browser"))
            .unwrap();
        wait_terminal(&fx.coordinator, task.id).await;

        let logs = fx.sessions.session_logs(session.id).unwrap();
        let failure = logs
            .iter()
            .find(|e| e.level == LogLevel::Error)
            .expect("an error entry");
        assert!(failure.message.contains(&task.id.to_string()));
        assert!(failure.message.contains("no display"));
        assert!(logs
            .iter()
            .any(|e| e.message == format!("Task {} started: open a browser", task.id)));
    }

    #[tokio::test]
    async fn test_start_task_validates_session() {
        let fx = fixture(ScriptedAgentRunner::new(vec![ScriptStep::Finish(None)]));
        let unknown = Uuid::new_v4();
        assert_eq!(
            fx.coordinator
                .start_task(unknown, StartTaskRequest::new("x"))
                .unwrap_err(),
            SessionError::NotFound(unknown)
        );

        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        fx.sessions.close_session(session.id).unwrap();
        assert_eq!(
            fx.coordinator
                .start_task(session.id, StartTaskRequest::new("x"))
                .unwrap_err(),
            SessionError::SessionClosed(session.id)
        );
        assert_eq!(fx.coordinator.running_count(), 0);
        assert!(fx.coordinator.get_task(unknown).is_err());
    }

    #[tokio::test]
    async fn test_start_task_auto_starts_session() {
        let fx = fixture(ScriptedAgentRunner::new(vec![ScriptStep::Finish(None)]));
        let session = fx.sessions.create_session(CreateSessionRequest::default()).unwrap();
        let task = fx
            .coordinator
            .start_task(session.id, StartTaskRequest::new("x"))
            .unwrap();

        let session = fx.sessions.get_session(session.id).unwrap();
        assert_eq!(session.status, crate::session::SessionStatus::Active);
        wait_terminal(&fx.coordinator, task.id).await;
    }
}
