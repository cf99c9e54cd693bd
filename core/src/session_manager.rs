//! In-memory session registry.
//!
//! Each non-closed session holds a lease on exactly one Ready display slot.
//! Leases are taken under a single lock so two concurrent creations can never
//! bind the same slot. Closing a session releases its lease, unless a task is
//! still running there; then the lease is released when that task finishes.

use crate::display::SlotView;
use crate::errors::{SessionError, SessionResult};
use crate::session::{CreateSessionRequest, ExecutionLogEntry, LogLevel, Session, SessionStatus};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Execution log entries kept per session; older entries are dropped.
pub const EXECUTION_LOG_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct Leases {
    /// display number -> owning session
    owners: HashMap<u32, Uuid>,
    /// sessions with a task in flight
    busy: HashSet<Uuid>,
}

impl Leases {
    fn release(&mut self, display_number: u32, session_id: Uuid) -> bool {
        if self.owners.get(&display_number) == Some(&session_id) {
            self.owners.remove(&display_number);
            true
        } else {
            false
        }
    }
}

pub struct SessionManager {
    slots: SlotView,
    sessions: DashMap<Uuid, Session>,
    leases: Mutex<Leases>,
    logs: DashMap<Uuid, VecDeque<ExecutionLogEntry>>,
    next_log_id: AtomicU64,
}

impl SessionManager {
    pub fn new(slots: SlotView) -> Self {
        Self {
            slots,
            sessions: DashMap::new(),
            leases: Mutex::new(Leases::default()),
            logs: DashMap::new(),
            next_log_id: AtomicU64::new(1),
        }
    }

    pub fn slots(&self) -> &SlotView {
        &self.slots
    }

    /// Base for [`Session::display_index`].
    pub fn base_vnc_port(&self) -> u16 {
        self.slots
            .base_vnc_port()
            .unwrap_or(crate::allocator::DEFAULT_VNC_PORT)
    }

    /// Bind a new session to the first Ready slot without a lease.
    pub fn create_session(&self, request: CreateSessionRequest) -> SessionResult<Session> {
        let mut leases = self.leases.lock();
        let slot = self
            .slots
            .ready()
            .into_iter()
            .find(|slot| !leases.owners.contains_key(&slot.display_number))
            .ok_or_else(|| SessionError::CapacityExceeded(self.slots.len()))?;

        let session = Session::new(&slot, request);
        leases.owners.insert(slot.display_number, session.id);
        self.sessions.insert(session.id, session.clone());
        drop(leases);

        info!(
            "Created session {} on display :{} (vnc {}, web {})",
            session.id, session.display_number, session.vnc_port, session.web_port
        );
        self.record(
            session.id,
            LogLevel::Info,
            format!(
                "Session created on display :{} ({} / {})",
                session.display_number, session.provider, session.model
            ),
        );
        Ok(session)
    }

    /// Move a session to Active. Starting an Active session is a no-op.
    pub fn start_session(&self, id: Uuid) -> SessionResult<Session> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;

        let status = session.status;
        match status {
            SessionStatus::Closed => Err(SessionError::SessionClosed(id)),
            SessionStatus::Active => Ok(session.clone()),
            SessionStatus::Created => {
                session.status = SessionStatus::Active;
                session.started_at = Some(Utc::now());
                let started = session.clone();
                drop(session);
                debug!("Session {} started", id);
                self.record(id, LogLevel::Info, "Session started");
                Ok(started)
            }
        }
    }

    pub fn get_session(&self, id: Uuid) -> SessionResult<Session> {
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or(SessionError::NotFound(id))
    }

    /// All sessions, most recently started (or created) first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| {
            b.recency()
                .cmp(&a.recency())
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        sessions
    }

    /// Close a session and release its display. Idempotent.
    ///
    /// A task already running in the session keeps running, and keeps the
    /// display leased until it finishes.
    pub fn close_session(&self, id: Uuid) -> SessionResult<Session> {
        let mut leases = self.leases.lock();
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;

        if session.status == SessionStatus::Closed {
            return Ok(session.clone());
        }

        session.status = SessionStatus::Closed;
        session.closed_at = Some(Utc::now());
        let closed = session.clone();
        drop(session);

        let message = if leases.busy.contains(&id) {
            format!(
                "Session closed; display :{} held until the running task finishes",
                closed.display_number
            )
        } else {
            leases.release(closed.display_number, id);
            format!("Session closed; display :{} released", closed.display_number)
        };
        drop(leases);

        info!("Session {}: {}", id, message);
        self.record(id, LogLevel::Info, message);
        Ok(closed)
    }

    /// Validate a session for a new task, starting it if needed.
    ///
    /// Marks the session busy until [`SessionManager::end_task`].
    pub(crate) fn begin_task(&self, id: Uuid) -> SessionResult<Session> {
        let mut leases = self.leases.lock();
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;

        match session.status {
            SessionStatus::Closed => return Err(SessionError::SessionClosed(id)),
            SessionStatus::Created => {
                session.status = SessionStatus::Active;
                session.started_at = Some(Utc::now());
            }
            SessionStatus::Active => {}
        }
        session.task_count += 1;
        leases.busy.insert(id);
        Ok(session.clone())
    }

    /// The session's running task finished; release its display if the
    /// session was closed in the meantime.
    pub(crate) fn end_task(&self, id: Uuid) {
        let mut leases = self.leases.lock();
        leases.busy.remove(&id);

        let closed_on = self
            .sessions
            .get(&id)
            .filter(|s| s.is_closed())
            .map(|s| s.display_number);
        if let Some(display_number) = closed_on {
            if leases.release(display_number, id) {
                drop(leases);
                info!("Display :{} released by closed session {}", display_number, id);
                self.record(
                    id,
                    LogLevel::Info,
                    format!("Display :{} released", display_number),
                );
            }
        }
    }

    /// Append to a session's execution log.
    pub fn record(&self, session_id: Uuid, level: LogLevel, message: impl Into<String>) {
        let entry = ExecutionLogEntry {
            id: self.next_log_id.fetch_add(1, Ordering::Relaxed),
            session_id,
            level,
            message: message.into(),
            created_at: Utc::now(),
        };
        let mut log = self.logs.entry(session_id).or_default();
        if log.len() == EXECUTION_LOG_LIMIT {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Execution log of a session, oldest first.
    pub fn session_logs(&self, id: Uuid) -> SessionResult<Vec<ExecutionLogEntry>> {
        if !self.sessions.contains_key(&id) {
            return Err(SessionError::NotFound(id));
        }
        Ok(self
            .logs
            .get(&id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Display numbers currently leased, including closed sessions whose
    /// task has not finished yet.
    pub fn leased_displays(&self) -> Vec<u32> {
        let mut displays: Vec<u32> = self.leases.lock().owners.keys().copied().collect();
        displays.sort_unstable();
        displays
    }

    /// Sessions that are not closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_closed()).count()
    }
}
