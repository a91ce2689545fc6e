//! Client connection manager.
//!
//! Owns at most one [`Connection`]. `connect` probes `/health` with a
//! bounded timeout, then upgrades to the duplex channel; the connection is
//! only reported `connected` once the channel is open. One receive loop
//! task per connection reads frames and routes each before awaiting the
//! next. Observer-visible state changes go through a single `watch`
//! channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::probe;
use super::router::{FrameRouter, StreamEvent};
use super::transport::{self, HttpTransport};
use crate::models::api::{
    AskRequest, CloseAck, PermissionAnswer, ServerInfo, SessionList, StartStreamRequest,
    StartedSession, StreamPromptRequest,
};
use crate::models::endpoint::Endpoint;
use crate::models::frame::{ClientFrame, ServerFrame};
use crate::models::health::HealthReport;
use crate::models::permission::PermissionResolution;
use crate::models::response::{AssistantResponse, PartialChunk, ResponseFormat};
use crate::models::session::{Session, SessionSummary};
use crate::{AppError, Result};

/// Lifecycle of the client connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Probe or channel upgrade in progress.
    Connecting,
    /// Channel open.
    Connected,
    /// Last connect attempt failed.
    Errored(String),
}

/// Observer-visible client state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientStatus {
    /// Connection lifecycle.
    pub connection: ConnectionState,
    /// Session the most recent prompt ran in.
    pub current_session: Option<String>,
}

/// Client timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bound on the `/health` probe and the channel handshake.
    pub probe_timeout: Duration,
    /// Bound on non-prompt requests.
    pub request_timeout: Duration,
    /// Bound on prompts; `None` waits as long as the backend runs.
    pub prompt_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            prompt_timeout: None,
        }
    }
}

/// Explicitly owned live connection.
#[derive(Debug)]
struct Connection {
    generation: u64,
    endpoint: Endpoint,
    http: HttpTransport,
    outbound: mpsc::Sender<Message>,
    router: Arc<Mutex<FrameRouter>>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    options: ClientOptions,
    status: watch::Sender<ClientStatus>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    events: broadcast::Sender<ServerFrame>,
}

/// Handle to the client's single connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl ConnectionManager {
    /// Create a disconnected manager.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let (status, _) = watch::channel(ClientStatus::default());
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                options,
                status,
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Current state snapshot.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.shared.status.subscribe()
    }

    /// Subscribe to every frame received on the channel.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ServerFrame> {
        self.shared.events.subscribe()
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().connection == ConnectionState::Connected
    }

    /// Connect to `endpoint`, replacing any existing connection.
    ///
    /// # Errors
    ///
    /// - `AppError::AuthenticationFailed` if the probe or upgrade is
    ///   rejected for the credential.
    /// - `AppError::ConnectionFailed` for other rejections or a malformed
    ///   endpoint.
    /// - `AppError::Network` / `AppError::Timeout` for transport failures.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.disconnect();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_connection_state(ConnectionState::Connecting);
        let span = info_span!("connect", address = endpoint.address(), port = endpoint.port());

        match self.establish(endpoint, generation).instrument(span).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.shared.generation.load(Ordering::SeqCst) == generation {
                    self.set_connection_state(ConnectionState::Errored(err.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Tear down the connection. Idempotent and safe from any state.
    ///
    /// Sends a close frame, fails waiting streaming prompts, clears session
    /// affinity and reports `disconnected` before returning.
    pub fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = previous {
            connection.cancel.cancel();
            connection
                .router
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fail_all(&AppError::ConnectionFailed("disconnected".into()));
            info!(address = connection.endpoint.address(), "disconnected");
        }
        self.shared.status.send_modify(|status| {
            status.connection = ConnectionState::Disconnected;
            status.current_session = None;
        });
    }

    /// Probe the connected endpoint. Never changes connection state.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` when not connected; otherwise the probe
    /// errors of [`probe::check`].
    pub async fn health_check(&self) -> Result<HealthReport> {
        let endpoint = self.with_connection(|c| c.endpoint.clone())?;
        probe::check(&endpoint, self.shared.options.probe_timeout).await
    }

    /// One-shot prompt over the request/response surface.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` immediately, without a network call,
    /// when not connected; otherwise the server's error.
    pub async fn send_prompt(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        format: ResponseFormat,
    ) -> Result<AssistantResponse> {
        let http = self.http()?;
        let body = AskRequest {
            prompt: Some(prompt.to_owned()),
            session_id: session_id.map(str::to_owned),
            format,
            working_directory: None,
        };
        let response: AssistantResponse = http
            .post("/ask", &body, self.shared.options.prompt_timeout)
            .await?;
        self.set_current_session(Some(response.session_id.clone()));
        Ok(response)
    }

    /// Prompt over the duplex channel, delivering partial chunks in
    /// sequence order to `on_partial` and resolving on the terminal
    /// response.
    ///
    /// # Errors
    ///
    /// - `AppError::ConnectionFailed` when not connected.
    /// - The server's error frame for this prompt.
    /// - `AppError::Network` if the channel drops before the response.
    /// - `AppError::Timeout` if `prompt_timeout` elapses.
    pub async fn send_streaming_prompt<F>(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        format: ResponseFormat,
        mut on_partial: F,
    ) -> Result<AssistantResponse>
    where
        F: FnMut(PartialChunk) + Send,
    {
        let request_id = Uuid::new_v4().to_string();
        let (outbound, router) = self.with_connection(|c| (c.outbound.clone(), Arc::clone(&c.router)))?;
        let mut events = router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(request_id.clone(), session_id.map(str::to_owned));

        let frame = ClientFrame::Prompt {
            request_id: request_id.clone(),
            prompt: prompt.to_owned(),
            session_id: session_id.map(str::to_owned),
            working_directory: None,
            format,
        };
        if let Err(err) = send_frame(&outbound, &frame).await {
            router
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .unregister(&request_id);
            return Err(err);
        }

        let wait = async {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Started(id) => self.set_current_session(Some(id)),
                    StreamEvent::Partial(chunk) => on_partial(chunk),
                    StreamEvent::Done(outcome) => return outcome,
                }
            }
            Err(AppError::Network("channel closed before the response".into()))
        };

        let outcome = match self.shared.options.prompt_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!("prompt exceeded {}s", limit.as_secs())))
            }),
            None => wait.await,
        };
        router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(&request_id);

        let response = outcome?;
        self.set_current_session(Some(response.session_id.clone()));
        Ok(response)
    }

    /// Attach the channel as live subscriber of a session.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` when not connected.
    pub async fn subscribe(&self, session_id: &str) -> Result<()> {
        let outbound = self.with_connection(|c| c.outbound.clone())?;
        send_frame(
            &outbound,
            &ClientFrame::Subscribe {
                session_id: session_id.to_owned(),
            },
        )
        .await
    }

    /// Create a streaming session over HTTP and run its first prompt.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` when not connected; otherwise the
    /// server's error.
    pub async fn start_session(
        &self,
        prompt: &str,
        working_directory: Option<std::path::PathBuf>,
        format: ResponseFormat,
    ) -> Result<StartedSession> {
        let http = self.http()?;
        let body = StartStreamRequest {
            prompt: Some(prompt.to_owned()),
            working_directory,
            format,
        };
        let started: StartedSession = http
            .post("/stream/start", &body, self.shared.options.prompt_timeout)
            .await?;
        self.set_current_session(Some(started.session_id.clone()));
        Ok(started)
    }

    /// Continue an existing session over HTTP.
    ///
    /// # Errors
    ///
    /// `AppError::SessionNotFound`, `AppError::InvalidSessionState`, or
    /// `AppError::ConnectionFailed` when not connected.
    pub async fn send_to_session(
        &self,
        session_id: &str,
        prompt: &str,
        format: ResponseFormat,
    ) -> Result<AssistantResponse> {
        let http = self.http()?;
        let body = StreamPromptRequest {
            prompt: Some(prompt.to_owned()),
            format,
        };
        http.post(
            &format!("/stream/{session_id}"),
            &body,
            self.shared.options.prompt_timeout,
        )
        .await
    }

    /// Close a session.
    ///
    /// # Errors
    ///
    /// `AppError::SessionNotFound` for unknown ids.
    pub async fn close_session(&self, session_id: &str) -> Result<CloseAck> {
        let http = self.http()?;
        let ack: CloseAck = http.delete(&format!("/stream/{session_id}")).await?;
        self.shared.status.send_if_modified(|status| {
            if status.current_session.as_deref() == Some(session_id) {
                status.current_session = None;
                true
            } else {
                false
            }
        });
        Ok(ack)
    }

    /// List live sessions.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` when not connected.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let list: SessionList = self.http()?.get("/sessions").await?;
        Ok(list.sessions)
    }

    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// `AppError::SessionNotFound` for unknown ids.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.http()?.get(&format!("/sessions/{session_id}")).await
    }

    /// Answer a pending permission request.
    ///
    /// # Errors
    ///
    /// `AppError::SessionNotFound`, `AppError::InvalidSessionState`, or
    /// `AppError::PermissionAlreadyResolved`.
    pub async fn respond_to_permission(
        &self,
        session_id: &str,
        response: &str,
    ) -> Result<PermissionResolution> {
        let body = PermissionAnswer {
            response: Some(response.to_owned()),
        };
        self.http()?
            .post(&format!("/permission/{session_id}"), &body, None)
            .await
    }

    /// Server capabilities.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` when not connected.
    pub async fn server_info(&self) -> Result<ServerInfo> {
        self.http()?.get("/info").await
    }

    async fn establish(&self, endpoint: Endpoint, generation: u64) -> Result<()> {
        let options = self.shared.options;
        let report = probe::check(&endpoint, options.probe_timeout).await?;
        debug!(version = %report.version, "probe succeeded");

        let http = HttpTransport::new(&endpoint, options.request_timeout)?;
        let channel = transport::open_channel(&endpoint, options.probe_timeout).await?;
        let (mut sink, mut stream) = channel.split();

        let cancel = CancellationToken::new();
        let router = Arc::new(Mutex::new(FrameRouter::new(self.shared.events.clone())));
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);

        let writer_cancel = cancel.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        () = writer_cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = sink.close().await;
                            break;
                        }
                        message = outbound_rx.recv() => {
                            let Some(message) = message else { break };
                            if let Err(err) = sink.send(message).await {
                                debug!(%err, "channel write failed");
                                break;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let manager = self.clone();
        let loop_router = Arc::clone(&router);
        let loop_cancel = cancel.clone();
        tokio::spawn(
            async move {
                let reason = loop {
                    let message = tokio::select! {
                        () = loop_cancel.cancelled() => return,
                        message = stream.next() => message,
                    };
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                                Ok(frame) => loop_router
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .route(frame),
                                Err(err) => warn!(%err, "undecodable frame ignored"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break "channel closed by server".to_owned(),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break err.to_string(),
                    }
                };
                manager.on_channel_lost(generation, &reason);
            }
            .in_current_span(),
        );

        let mut slot = self
            .shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.generation.load(Ordering::SeqCst) != generation {
            cancel.cancel();
            return Err(AppError::ConnectionFailed(
                "connect superseded by disconnect".into(),
            ));
        }
        *slot = Some(Connection {
            generation,
            endpoint,
            http,
            outbound,
            router,
            cancel,
        });
        drop(slot);
        self.set_connection_state(ConnectionState::Connected);
        info!("connected");
        Ok(())
    }

    /// Receive loop ended on its own: drop the connection it belonged to.
    fn on_channel_lost(&self, generation: u64, reason: &str) {
        let lost = {
            let mut slot = self
                .shared
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|c| c.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let Some(connection) = lost else {
            return;
        };
        warn!(reason, "channel lost");
        connection.cancel.cancel();
        connection
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_all(&AppError::Network(reason.to_owned()));
        self.shared.status.send_modify(|status| {
            status.connection = ConnectionState::Disconnected;
            status.current_session = None;
        });
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        self.shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
            .ok_or_else(|| AppError::ConnectionFailed("not connected".into()))
    }

    fn http(&self) -> Result<HttpTransport> {
        self.with_connection(|c| c.http.clone())
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.shared.status.send_modify(|status| status.connection = state);
    }

    fn set_current_session(&self, session_id: Option<String>) {
        self.shared.status.send_if_modified(|status| {
            if status.current_session == session_id {
                false
            } else {
                status.current_session = session_id;
                true
            }
        });
    }
}

async fn send_frame(outbound: &mpsc::Sender<Message>, frame: &ClientFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    outbound
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| AppError::Network("channel closed".into()))
}
