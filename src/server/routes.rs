//! Request/response route handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, info_span, Instrument};

use super::error::ApiError;
use super::{AppState, ENDPOINTS};
use crate::health::RECHECK_INTERVAL;
use crate::models::api::{
    required, AskRequest, CloseAck, PermissionAnswer, ServerInfo, SessionList,
    StartStreamRequest, StartedSession, StreamPromptRequest,
};
use crate::models::endpoint::CHANNEL_PATH;
use crate::models::health::HealthReport;
use crate::models::response::AssistantResponse;
use crate::models::session::Session;
use crate::models::permission::PermissionResolution;
use crate::session::CloseOutcome;

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// `GET /health`: 200 with the report when the backend is usable, 503
/// otherwise. An unhealthy report is re-probed at most once per
/// [`RECHECK_INTERVAL`].
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let mut report = state.health.latest();
    if !report.is_healthy() {
        report = state.health.refresh(RECHECK_INTERVAL).await;
    }
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// `POST /ask`: one-shot prompt.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> ApiResult<AssistantResponse> {
    let Json(body) = body?;
    let prompt = required(body.prompt, "prompt")?;
    let span = info_span!("ask", session_id = body.session_id.as_deref().unwrap_or("new"));
    let response = state
        .manager
        .ask(
            prompt,
            body.session_id.as_deref(),
            body.working_directory,
            body.format,
        )
        .instrument(span)
        .await?;
    Ok(Json(response))
}

/// `POST /stream/start`: create a session and run its first prompt.
pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<StartStreamRequest>, JsonRejection>,
) -> ApiResult<StartedSession> {
    let Json(body) = body?;
    let prompt = required(body.prompt, "prompt")?;
    let started = state
        .manager
        .start_session(prompt, body.working_directory, body.format)
        .instrument(info_span!("stream_start"))
        .await?;
    Ok(Json(started))
}

/// `POST /stream/{sessionId}`: continue an existing session.
pub async fn send_to_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: std::result::Result<Json<StreamPromptRequest>, JsonRejection>,
) -> ApiResult<AssistantResponse> {
    let Json(body) = body?;
    let prompt = required(body.prompt, "prompt")?;
    let response = state
        .manager
        .send_to_existing(&session_id, prompt, body.format)
        .instrument(info_span!("stream_prompt", session_id = %session_id))
        .await?;
    Ok(Json(response))
}

/// `DELETE /stream/{sessionId}`: close a session.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<CloseAck> {
    let outcome = state.manager.close(&session_id).await?;
    info!(session_id, ?outcome, "close requested");
    Ok(Json(CloseAck {
        session_id,
        status: "closed".into(),
        already_closed: outcome == CloseOutcome::AlreadyClosed,
    }))
}

/// `GET /sessions`: snapshot of live sessions.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionList> {
    Json(SessionList {
        sessions: state.manager.list().await,
    })
}

/// `GET /sessions/{sessionId}`: one session, including recently closed.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Session> {
    Ok(Json(state.manager.get(&session_id).await?))
}

/// `POST /permission/{sessionId}`: answer a pending permission request.
pub async fn resolve_permission(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: std::result::Result<Json<PermissionAnswer>, JsonRejection>,
) -> ApiResult<PermissionResolution> {
    let Json(body) = body?;
    let response = required(body.response, "response")?;
    let resolution = state
        .manager
        .handle_permission_prompt(&session_id, &response)
        .await?;
    Ok(Json(resolution))
}

/// `GET /info`: server capabilities.
pub async fn info(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        name: crate::NAME.into(),
        version: crate::VERSION.into(),
        backend_available: state.health.latest().backend_available,
        endpoints: ENDPOINTS.iter().map(|e| (*e).to_owned()).collect(),
        streaming_path: CHANNEL_PATH.into(),
    })
}
