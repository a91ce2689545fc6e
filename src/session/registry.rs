//! Concurrent session registry.
//!
//! The id → slot map is guarded by a short-lived `RwLock` that is never held
//! across an `.await`; each slot carries its own async mutex, so operations
//! on different sessions never block each other while operations on the
//! same session are serialized.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::broker::PendingPermission;
use super::dispatcher::OutputStream;
use crate::models::frame::ServerFrame;
use crate::models::permission::{PermissionOutcome, PermissionRequest};
use crate::models::session::{Session, SessionStatus, SessionSummary};
use crate::{AppError, Result};

/// Mutable per-session state guarded by [`SessionSlot::state`].
#[derive(Debug)]
pub(crate) struct SessionEntry {
    /// Session record.
    pub session: Session,
    /// Buffered output and live subscriber.
    pub stream: OutputStream,
    /// Outstanding permission request with its reply channel and timer.
    pub pending: Option<PendingPermission>,
    /// Most recently resolved permission request.
    pub last_permission: Option<PermissionRequest>,
    /// Whether a prompt turn is currently executing.
    pub turn_running: bool,
}

impl SessionEntry {
    /// Whether the session has been retired.
    pub fn is_closed(&self) -> bool {
        self.session.status == SessionStatus::Closed
    }

    /// Refresh the session's public permission view from `pending`.
    pub fn sync_pending_view(&mut self) {
        self.session.pending_permission = self.pending.as_ref().map(|p| p.request.clone());
    }
}

/// Registry slot for one session.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    /// Session id (immutable).
    pub id: String,
    /// Serialized per-session state.
    pub state: tokio::sync::Mutex<SessionEntry>,
    /// Held for the duration of a prompt turn.
    pub turn_gate: tokio::sync::Mutex<()>,
    /// Cancelled when the session closes; turns and permission timers use
    /// child tokens of it.
    pub cancel: CancellationToken,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The session was live and is now closed.
    Closed,
    /// The session had already been closed.
    AlreadyClosed,
}

/// Closed sessions remembered for idempotent close and lookups.
#[derive(Debug, Default)]
struct RetiredSessions {
    order: VecDeque<String>,
    by_id: HashMap<String, Session>,
}

impl RetiredSessions {
    fn insert(&mut self, session: Session, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.order.len() >= capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.by_id.remove(&oldest);
            }
        }
        self.order.push_back(session.id.clone());
        self.by_id.insert(session.id.clone(), session);
    }
}

/// Concurrency-safe keyed store of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    retired: Mutex<RetiredSessions>,
    buffer_capacity: usize,
    retired_capacity: usize,
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// `buffer_capacity` bounds each session's undelivered output;
    /// `retired_capacity` bounds how many closed sessions are remembered.
    #[must_use]
    pub fn new(buffer_capacity: usize, retired_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredSessions::default()),
            buffer_capacity,
            retired_capacity,
        }
    }

    /// Allocate a fresh session and return its id.
    pub fn create(&self, working_directory: Option<PathBuf>) -> String {
        let session = Session::new(working_directory);
        let id = session.id.clone();
        let slot = Arc::new(SessionSlot {
            id: id.clone(),
            state: tokio::sync::Mutex::new(SessionEntry {
                session,
                stream: OutputStream::new(self.buffer_capacity),
                pending: None,
                last_permission: None,
                turn_running: false,
            }),
            turn_gate: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), slot);
        info!(session_id = %id, "session created");
        id
    }

    /// Look up a session snapshot, including recently closed sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is unknown.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        if let Some(slot) = self.live_slot(session_id) {
            return Ok(slot.state.lock().await.session.clone());
        }
        self.retired_snapshot(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_owned()))
    }

    /// Snapshot summaries of all live sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for slot in self.slots() {
            let entry = slot.state.lock().await;
            if !entry.is_closed() {
                summaries.push(entry.session.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Close a session, cancelling its turn and any pending permission.
    ///
    /// Idempotent: closing an already-closed session succeeds with
    /// [`CloseOutcome::AlreadyClosed`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id was never issued (or has
    /// aged out of the retired set).
    pub async fn close(&self, session_id: &str, reason: &str) -> Result<CloseOutcome> {
        let Some(slot) = self.live_slot(session_id) else {
            return if self.retired_snapshot(session_id).is_some() {
                Ok(CloseOutcome::AlreadyClosed)
            } else {
                Err(AppError::SessionNotFound(session_id.to_owned()))
            };
        };
        let mut entry = slot.state.lock().await;
        if entry.is_closed() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        self.retire(&slot, &mut entry, reason);
        Ok(CloseOutcome::Closed)
    }

    /// Close several sessions, best-effort.
    ///
    /// Every id is attempted regardless of earlier failures; the outcome of
    /// each is reported in input order.
    pub async fn close_many(
        &self,
        session_ids: &[String],
        reason: &str,
    ) -> Vec<(String, Result<CloseOutcome>)> {
        let mut outcomes = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            outcomes.push((id.clone(), self.close(id, reason).await));
        }
        outcomes
    }

    /// Close every live session.
    pub async fn close_all(&self, reason: &str) -> usize {
        let ids = self.ids();
        let outcomes = self.close_many(&ids, reason).await;
        outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Ok(CloseOutcome::Closed)))
            .count()
    }

    /// Ids of all live sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a live slot or explain why the id is unusable.
    pub(crate) fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        if let Some(slot) = self.live_slot(session_id) {
            return Ok(slot);
        }
        if self.retired_snapshot(session_id).is_some() {
            Err(AppError::InvalidSessionState(format!(
                "session {session_id} is closed"
            )))
        } else {
            Err(AppError::SessionNotFound(session_id.to_owned()))
        }
    }

    /// Clone the handles of all live slots.
    pub(crate) fn slots(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Retire a session whose state lock the caller already holds.
    pub(crate) fn retire(&self, slot: &SessionSlot, entry: &mut SessionEntry, reason: &str) {
        slot.cancel.cancel();

        if let Some(pending) = entry.pending.take() {
            let request_id = pending.request.id.clone();
            let mut request = pending.cancel();
            request.resolved = true;
            entry.last_permission = Some(request);
            entry
                .stream
                .publish(ServerFrame::PermissionResolved {
                    session_id: slot.id.clone(),
                    request_id,
                    outcome: PermissionOutcome::Cancelled,
                    decision: "abort".into(),
                });
        }

        entry.session.status = SessionStatus::Closed;
        entry.session.touch();
        entry.sync_pending_view();
        entry
            .stream
            .publish(ServerFrame::SessionClosed {
                session_id: slot.id.clone(),
                reason: reason.to_owned(),
            });
        entry.stream.finish();

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot.id);
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.session.clone(), self.retired_capacity);

        if entry.turn_running {
            warn!(session_id = %slot.id, reason, "session closed with a turn in flight");
        }
        info!(session_id = %slot.id, reason, "session closed");
    }

    fn live_slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn retired_snapshot(&self, session_id: &str) -> Option<Session> {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(session_id)
            .cloned()
    }
}
