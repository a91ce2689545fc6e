//! Prompt turn orchestration.
//!
//! [`SessionManager`] is the single entry point the HTTP routes and the
//! websocket channel use. It resolves sessions through the registry, runs
//! one backend turn at a time per session, and routes backend events to the
//! dispatcher and the permission broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::broker::PermissionBroker;
use super::dispatcher::{StreamDispatcher, Subscriber};
use super::registry::{CloseOutcome, SessionRegistry, SessionSlot};
use crate::backend::{Backend, BackendEvent, BackendRequest};
use crate::config::BridgeConfig;
use crate::models::api::StartedSession;
use crate::models::frame::ServerFrame;
use crate::models::permission::PermissionResolution;
use crate::models::response::{AssistantResponse, ResponseFormat};
use crate::models::session::{Session, SessionStatus, SessionSummary};
use crate::{AppError, Result};

/// Backend events buffered between the backend and the turn loop.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Prompt submitted over the streaming channel.
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    /// Client correlation id.
    pub request_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Target session; a new one is created when absent.
    pub session_id: Option<String>,
    /// Working directory for a new session.
    pub working_directory: Option<PathBuf>,
    /// Requested output format.
    pub format: ResponseFormat,
}

/// Session-facing facade over the registry, dispatcher, broker and backend.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    dispatcher: StreamDispatcher,
    broker: PermissionBroker,
    backend: Arc<dyn Backend>,
    prompt_timeout: Option<Duration>,
    default_working_directory: Option<PathBuf>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.len())
            .field("prompt_timeout", &self.prompt_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Build the session core from configuration.
    #[must_use]
    pub fn new(config: &BridgeConfig, backend: Arc<dyn Backend>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.stream.buffer_capacity,
            config.sessions.retired_capacity,
        ));
        let broker = PermissionBroker::new(
            Arc::clone(&registry),
            config.permission_timeout(),
            config.permissions.timeout_outcome,
            config.permissions.decline_closes_session,
        );
        Self {
            dispatcher: StreamDispatcher::new(Arc::clone(&registry)),
            registry,
            broker,
            backend,
            prompt_timeout: config.prompt_timeout(),
            default_working_directory: config.default_working_directory.clone(),
        }
    }

    /// Shared registry handle.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create an idle session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` if `working_directory` is not an
    /// existing directory.
    pub fn create_session(&self, working_directory: Option<PathBuf>) -> Result<String> {
        let working_directory = match working_directory {
            Some(dir) => Some(dir.canonicalize().map_err(|err| {
                AppError::BadRequest(format!(
                    "working directory {} is not usable: {err}",
                    dir.display()
                ))
            })?),
            None => self.default_working_directory.clone(),
        };
        if let Some(ref dir) = working_directory {
            if !dir.is_dir() {
                return Err(AppError::BadRequest(format!(
                    "working directory {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(self.registry.create(working_directory))
    }

    /// Create a session and run its first prompt.
    ///
    /// # Errors
    ///
    /// Propagates working-directory validation and turn failures.
    pub async fn start_session(
        &self,
        prompt: String,
        working_directory: Option<PathBuf>,
        format: ResponseFormat,
    ) -> Result<StartedSession> {
        let session_id = self.create_session(working_directory)?;
        let slot = self.registry.slot(&session_id)?;
        let response = self.turn(&slot, prompt, format, None).await?;
        Ok(StartedSession {
            session_id,
            response,
        })
    }

    /// Run a prompt in an existing session.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound` for unknown ids.
    /// - `AppError::InvalidSessionState` when the session is closed or
    ///   awaiting permission.
    /// - Backend and timeout failures of the turn itself.
    pub async fn send_to_existing(
        &self,
        session_id: &str,
        prompt: String,
        format: ResponseFormat,
    ) -> Result<AssistantResponse> {
        let slot = self.registry.slot(session_id)?;
        ensure_accepting(&*slot.state.lock().await)?;
        self.turn(&slot, prompt, format, None).await
    }

    /// One-shot prompt: reuse `session_id` when given, otherwise create a
    /// session implicitly.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_to_existing`] and [`Self::create_session`].
    pub async fn ask(
        &self,
        prompt: String,
        session_id: Option<&str>,
        working_directory: Option<PathBuf>,
        format: ResponseFormat,
    ) -> Result<AssistantResponse> {
        match session_id {
            Some(id) => self.send_to_existing(id, prompt, format).await,
            None => {
                let id = self.create_session(working_directory)?;
                let slot = self.registry.slot(&id)?;
                self.turn(&slot, prompt, format, None).await
            }
        }
    }

    /// Accept a prompt from the streaming channel.
    ///
    /// The subscriber is attached to the target session before the turn is
    /// spawned, so it observes every frame of the turn. Returns the session
    /// id the prompt runs in.
    ///
    /// # Errors
    ///
    /// Returns lookup and state errors synchronously; turn failures are
    /// delivered as `error` frames.
    pub async fn submit_channel_prompt(
        &self,
        prompt: ChannelPrompt,
        subscriber: Subscriber,
    ) -> Result<String> {
        let (slot, created) = match prompt.session_id {
            Some(ref id) => {
                let slot = self.registry.slot(id)?;
                ensure_accepting(&*slot.state.lock().await)?;
                (slot, false)
            }
            None => {
                let id = self.create_session(prompt.working_directory.clone())?;
                (self.registry.slot(&id)?, true)
            }
        };

        self.dispatcher.subscribe(&slot.id, subscriber).await?;
        if created {
            self.dispatcher
                .publish(
                    &slot,
                    ServerFrame::SessionStarted {
                        request_id: prompt.request_id.clone(),
                        session_id: slot.id.clone(),
                    },
                )
                .await;
        }

        let manager = self.clone();
        let session_id = slot.id.clone();
        let span = info_span!("channel_turn", session_id = %slot.id, request_id = %prompt.request_id);
        tokio::spawn(
            async move {
                let _ = manager
                    .turn(&slot, prompt.prompt, prompt.format, Some(prompt.request_id))
                    .await;
            }
            .instrument(span),
        );
        Ok(session_id)
    }

    /// Resolve the pending permission request of a session.
    ///
    /// # Errors
    ///
    /// See [`PermissionBroker::resolve`].
    pub async fn handle_permission_prompt(
        &self,
        session_id: &str,
        response: &str,
    ) -> Result<PermissionResolution> {
        self.broker.resolve(session_id, response).await
    }

    /// Attach a subscriber to a session.
    ///
    /// # Errors
    ///
    /// See [`StreamDispatcher::subscribe`].
    pub async fn subscribe(&self, session_id: &str, subscriber: Subscriber) -> Result<()> {
        self.dispatcher.subscribe(session_id, subscriber).await
    }

    /// Detach a dropped connection from all sessions.
    pub async fn detach_connection(&self, connection_id: u64) -> usize {
        self.dispatcher.detach_connection(connection_id).await
    }

    /// Close a session on client request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for unknown ids.
    pub async fn close(&self, session_id: &str) -> Result<CloseOutcome> {
        self.registry.close(session_id, "closed by client").await
    }

    /// Snapshot of live sessions.
    pub async fn list(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for unknown ids.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.registry.get(session_id).await
    }

    /// Run one turn and publish its terminal frame.
    ///
    /// The turn gate stays held until the terminal frame is published so
    /// the next turn's partials never precede this turn's response. Channel
    /// turns are announced with `turn_started` once the gate is held.
    async fn turn(
        &self,
        slot: &Arc<SessionSlot>,
        prompt: String,
        format: ResponseFormat,
        request_id: Option<String>,
    ) -> Result<AssistantResponse> {
        let _gate = slot.turn_gate.lock().await;
        if let Some(ref request_id) = request_id {
            self.dispatcher
                .publish_turn_start(slot, request_id.clone())
                .await;
        }
        let result = self.execute_turn(slot, prompt, format).await;
        let frame = match result {
            Ok(ref response) => ServerFrame::Response {
                session_id: slot.id.clone(),
                request_id,
                response: response.clone(),
            },
            Err(ref err) => {
                warn!(session_id = %slot.id, %err, "prompt turn failed");
                ServerFrame::error(Some(slot.id.clone()), request_id, err)
            }
        };
        self.dispatcher.publish(slot, frame).await;
        result
    }

    async fn execute_turn(
        &self,
        slot: &Arc<SessionSlot>,
        prompt: String,
        format: ResponseFormat,
    ) -> Result<AssistantResponse> {
        let (resume_id, working_directory) = {
            let mut entry = slot.state.lock().await;
            ensure_accepting(&entry)?;
            entry.turn_running = true;
            entry.session.prompt_count += 1;
            entry.session.touch();
            (
                entry.session.backend_session_id.clone(),
                entry.session.working_directory.clone(),
            )
        };

        let cancel = slot.cancel.child_token();
        let request = BackendRequest {
            session_id: slot.id.clone(),
            prompt,
            working_directory,
            format,
            resume_id,
            cancel: cancel.clone(),
        };
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let started = Instant::now();
        let mut partials = 0_u64;
        info!(session_id = %slot.id, format = format.as_str(), "prompt turn started");

        let run = async {
            let execution = self.backend.execute(request, events_tx);
            tokio::pin!(execution);
            let result = loop {
                tokio::select! {
                    biased;
                    Some(event) = events_rx.recv() => {
                        self.handle_event(slot, event, &mut partials).await;
                    }
                    result = &mut execution => break result,
                }
            };
            while let Ok(event) = events_rx.try_recv() {
                self.handle_event(slot, event, &mut partials).await;
            }
            result
        };

        let result = match self.prompt_timeout {
            Some(limit) => {
                if let Ok(result) = tokio::time::timeout(limit, run).await {
                    result
                } else {
                    cancel.cancel();
                    Err(AppError::Timeout(format!(
                        "prompt exceeded {}s",
                        limit.as_secs()
                    )))
                }
            }
            None => run.await,
        };

        self.broker.clear_stale(slot).await;

        let mut entry = slot.state.lock().await;
        entry.turn_running = false;
        if entry.is_closed() {
            return Err(AppError::InvalidSessionState(format!(
                "session {} closed during the turn",
                slot.id
            )));
        }
        entry.session.touch();
        let output = result?;
        if output.backend_session_id.is_some() {
            entry
                .session
                .backend_session_id
                .clone_from(&output.backend_session_id);
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(session_id = %slot.id, duration_ms, partials, "prompt turn completed");
        Ok(AssistantResponse::new(
            slot.id.clone(),
            output.content,
            format,
            duration_ms,
            partials,
        ))
    }

    async fn handle_event(&self, slot: &SessionSlot, event: BackendEvent, partials: &mut u64) {
        match event {
            BackendEvent::Partial(text) => {
                if let Some(seq) = self.dispatcher.publish_partial(slot, text).await {
                    *partials += 1;
                    debug!(session_id = %slot.id, seq, "partial published");
                }
            }
            BackendEvent::PermissionRequired { prompt, reply } => {
                if let Err(err) = self.broker.raise(slot, prompt, reply).await {
                    warn!(session_id = %slot.id, %err, "permission request rejected");
                }
            }
        }
    }
}

/// Reject prompts for sessions that are closed or awaiting permission.
fn ensure_accepting(entry: &super::registry::SessionEntry) -> Result<()> {
    match entry.session.status {
        SessionStatus::Active => Ok(()),
        SessionStatus::AwaitingPermission => Err(AppError::InvalidSessionState(format!(
            "session {} is awaiting permission",
            entry.session.id
        ))),
        SessionStatus::Closed => Err(AppError::InvalidSessionState(format!(
            "session {} is closed",
            entry.session.id
        ))),
    }
}
