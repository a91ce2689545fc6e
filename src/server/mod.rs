//! HTTP and websocket surface of the bridge.
//!
//! Mounts the request/response routes and the `/ws` duplex channel on one
//! axum router behind bearer authentication.

pub mod auth;
pub mod error;
pub mod routes;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::Backend;
use crate::config::BridgeConfig;
use crate::health::HealthMonitor;
use crate::models::endpoint::CHANNEL_PATH;
use crate::session::SessionManager;
use crate::{AppError, Result};

use self::auth::TokenDigest;

/// Shared state handed to every route and channel.
#[derive(Debug)]
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<BridgeConfig>,
    /// Session core.
    pub manager: SessionManager,
    /// Backend health monitor.
    pub health: HealthMonitor,
    auth: Option<TokenDigest>,
    connection_ids: AtomicU64,
    shutdown: CancellationToken,
}

impl AppState {
    /// Assemble server state around a backend.
    ///
    /// Authentication is enabled iff `config.auth.token` is set.
    #[must_use]
    pub fn new(config: Arc<BridgeConfig>, backend: Arc<dyn Backend>) -> Self {
        let manager = SessionManager::new(&config, Arc::clone(&backend));
        let auth = config.auth.token.as_deref().map(TokenDigest::new);
        Self {
            manager,
            health: HealthMonitor::new(backend),
            auth,
            connection_ids: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Allocate a websocket connection id.
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn auth(&self) -> Option<&TokenDigest> {
        self.auth.as_ref()
    }

    /// Cancelled when the server starts shutting down; open channels close.
    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// `METHOD /path` list advertised by `GET /info`.
pub const ENDPOINTS: &[&str] = &[
    "GET /health",
    "POST /ask",
    "POST /stream/start",
    "POST /stream/{sessionId}",
    "DELETE /stream/{sessionId}",
    "GET /sessions",
    "GET /sessions/{sessionId}",
    "POST /permission/{sessionId}",
    "GET /info",
];

/// Build the router with all routes and the auth layer.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ask", post(routes::ask))
        .route("/stream/start", post(routes::start_stream))
        .route(
            "/stream/{session_id}",
            post(routes::send_to_session).delete(routes::close_session),
        )
        .route("/sessions", get(routes::list_sessions))
        .route("/sessions/{session_id}", get(routes::get_session))
        .route("/permission/{session_id}", post(routes::resolve_permission))
        .route("/info", get(routes::info))
        .route(CHANNEL_PATH, get(ws::upgrade))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_bearer,
        ))
        .with_state(state)
}

/// Bind `bind_address:http_port` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails to bind.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = format!("{}:{}", state.config.bind_address, state.config.http_port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    serve_on(listener, state, ct).await
}

/// Serve on an already-bound listener until `ct` is cancelled, then close
/// every live session and end open channels.
///
/// # Errors
///
/// Returns `AppError::Io` if the server stops with an I/O failure.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(bind = ?local, auth = state.auth.is_some(), "bridge server listening");

    let channels = state.shutdown.clone();
    let manager = state.manager.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            // Subscribers get their session_closed frames before channels end.
            let closed = manager.registry().close_all("server shutdown").await;
            info!(closed, "sessions closed");
            channels.cancel();
        })
        .await
        .map_err(|err| AppError::Io(format!("server error: {err}")))?;

    info!("bridge server shut down");
    Ok(())
}
