//! Permission broker.
//!
//! Suspends a session while a human decision is outstanding:
//!
//! ```text
//! active ──raise──▶ awaiting_permission ──resolve / timeout──▶ active
//!                                     └──abort (policy)──────▶ closed
//! ```
//!
//! Each pending request owns a timer whose cancellation token is a child of
//! the session's token, so closing the session or resolving early always
//! disarms it. The timer also re-checks the request id under the session
//! lock, so a late wake-up can never resurrect or re-resolve anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::registry::{SessionEntry, SessionRegistry, SessionSlot};
use crate::config::TimeoutOutcome;
use crate::models::frame::ServerFrame;
use crate::models::permission::{
    PermissionDecision, PermissionOutcome, PermissionRequest, PermissionResolution,
};
use crate::models::session::SessionStatus;
use crate::{AppError, Result};

/// Outstanding permission request of one session.
#[derive(Debug)]
pub(crate) struct PendingPermission {
    /// Public view of the request.
    pub request: PermissionRequest,
    reply: oneshot::Sender<PermissionDecision>,
    timer: CancellationToken,
}

impl PendingPermission {
    /// Disarm the timer and answer the backend.
    fn settle(self, decision: PermissionDecision) -> PermissionRequest {
        self.timer.cancel();
        if self.reply.send(decision).is_err() {
            warn!(
                session_id = %self.request.session_id,
                request_id = %self.request.id,
                "backend stopped waiting before the permission decision arrived"
            );
        }
        self.request
    }

    /// Disarm the timer and drop the reply channel; the backend observes an
    /// abort.
    pub(crate) fn cancel(self) -> PermissionRequest {
        self.timer.cancel();
        self.request
    }
}

/// Coordinates permission requests with session state.
#[derive(Debug, Clone)]
pub struct PermissionBroker {
    registry: Arc<SessionRegistry>,
    timeout: Duration,
    timeout_outcome: TimeoutOutcome,
    decline_closes_session: bool,
}

impl PermissionBroker {
    /// Create a broker.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        timeout: Duration,
        timeout_outcome: TimeoutOutcome,
        decline_closes_session: bool,
    ) -> Self {
        Self {
            registry,
            timeout,
            timeout_outcome,
            decline_closes_session,
        }
    }

    /// Suspend a session on a backend permission need.
    ///
    /// A request raised while another is pending is rejected and answered
    /// with [`PermissionDecision::Deny`] rather than queued.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidSessionState` if the session is closed or
    /// already awaiting permission.
    pub(crate) async fn raise(
        &self,
        slot: &SessionSlot,
        prompt: String,
        reply: oneshot::Sender<PermissionDecision>,
    ) -> Result<PermissionRequest> {
        let mut entry = slot.state.lock().await;
        if entry.is_closed() {
            return Err(AppError::InvalidSessionState(format!(
                "session {} is closed",
                slot.id
            )));
        }
        if entry.pending.is_some() {
            let _ = reply.send(PermissionDecision::Deny);
            warn!(session_id = %slot.id, "rejecting second concurrent permission request");
            return Err(AppError::InvalidSessionState(format!(
                "session {} already has a pending permission request",
                slot.id
            )));
        }

        let request = PermissionRequest::new(slot.id.clone(), prompt);
        let timer = slot.cancel.child_token();
        self.arm_timer(slot.id.clone(), request.id.clone(), timer.clone());

        entry.pending = Some(PendingPermission {
            request: request.clone(),
            reply,
            timer,
        });
        entry.session.status = SessionStatus::AwaitingPermission;
        entry.session.touch();
        entry.sync_pending_view();
        entry
            .stream
            .publish(ServerFrame::PermissionRequest {
                session_id: slot.id.clone(),
                request: request.clone(),
            });

        info!(
            session_id = %slot.id,
            request_id = %request.id,
            timeout_seconds = self.timeout.as_secs(),
            "session awaiting permission"
        );
        Ok(request)
    }

    /// Resolve the pending permission request of a session with a human
    /// response.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound` if the session does not exist.
    /// - `AppError::PermissionAlreadyResolved` if the most recent request
    ///   was already resolved and nothing new is pending.
    /// - `AppError::InvalidSessionState` if no request was ever pending or
    ///   the session is closed.
    pub async fn resolve(&self, session_id: &str, response: &str) -> Result<PermissionResolution> {
        let slot = self.registry.slot(session_id)?;
        let mut entry = slot.state.lock().await;

        let Some(pending) = entry.pending.take() else {
            return Err(match entry.last_permission {
                Some(ref last) => AppError::PermissionAlreadyResolved(last.id.clone()),
                None => AppError::InvalidSessionState(format!(
                    "session {session_id} has no pending permission request"
                )),
            });
        };

        let decision = PermissionDecision::parse(response);
        let request_id = pending.request.id.clone();
        let mut request = pending.settle(decision.clone());
        request.resolved = true;
        entry.last_permission = Some(request);

        let status =
            self.finish(&slot, &mut entry, &request_id, &decision, PermissionOutcome::Answered);

        info!(
            session_id,
            request_id = %request_id,
            decision = decision.label(),
            "permission request resolved"
        );
        Ok(PermissionResolution {
            session_id: session_id.to_owned(),
            request_id,
            decision: decision.label().to_owned(),
            status,
        })
    }

    /// Drop a request left pending by a turn that has already ended.
    pub(crate) async fn clear_stale(&self, slot: &SessionSlot) {
        let mut entry = slot.state.lock().await;
        if let Some(pending) = entry.pending.take() {
            let request_id = pending.request.id.clone();
            let mut request = pending.cancel();
            request.resolved = true;
            entry.last_permission = Some(request);
            self.finish(
                slot,
                &mut entry,
                &request_id,
                &PermissionDecision::Abort,
                PermissionOutcome::Cancelled,
            );
        }
    }

    fn arm_timer(&self, session_id: String, request_id: String, timer: CancellationToken) {
        let broker = self.clone();
        let timeout = self.timeout;
        let span = info_span!("permission_timer", session_id = %session_id, request_id = %request_id);
        tokio::spawn(
            async move {
                tokio::select! {
                    () = timer.cancelled() => {}
                    () = tokio::time::sleep(timeout) => {
                        broker.expire(&session_id, &request_id).await;
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Apply the default outcome to a request whose timeout elapsed.
    async fn expire(&self, session_id: &str, request_id: &str) {
        let Ok(slot) = self.registry.slot(session_id) else {
            return;
        };
        let mut entry = slot.state.lock().await;
        if entry.is_closed()
            || entry
                .pending
                .as_ref()
                .is_none_or(|p| p.request.id != request_id)
        {
            return;
        }
        let Some(pending) = entry.pending.take() else {
            return;
        };

        let decision = match self.timeout_outcome {
            TimeoutOutcome::Deny => PermissionDecision::Deny,
            TimeoutOutcome::Abort => PermissionDecision::Abort,
        };
        let mut request = pending.settle(decision.clone());
        request.resolved = true;
        entry.last_permission = Some(request);

        self.finish(&slot, &mut entry, request_id, &decision, PermissionOutcome::TimedOut);
        info!(
            decision = decision.label(),
            timeout_seconds = self.timeout.as_secs(),
            "permission request timed out"
        );
    }

    /// Publish the resolution and move the session out of
    /// `awaiting_permission`.
    fn finish(
        &self,
        slot: &SessionSlot,
        entry: &mut SessionEntry,
        request_id: &str,
        decision: &PermissionDecision,
        outcome: PermissionOutcome,
    ) -> SessionStatus {
        entry.sync_pending_view();
        entry
            .stream
            .publish(ServerFrame::PermissionResolved {
                session_id: slot.id.clone(),
                request_id: request_id.to_owned(),
                outcome,
                decision: decision.label().to_owned(),
            });

        let closes = *decision == PermissionDecision::Abort
            && outcome != PermissionOutcome::Cancelled
            && (self.decline_closes_session || outcome == PermissionOutcome::TimedOut);
        if closes {
            self.registry.retire(slot, entry, "permission declined");
        } else {
            entry.session.status = SessionStatus::Active;
            entry.session.touch();
        }
        entry.session.status
    }
}
