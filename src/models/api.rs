//! Request and response bodies of the HTTP surface.
//!
//! Shared by the server routes and the client transport so both halves
//! agree on field names (`camelCase` on the wire).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::response::{AssistantResponse, ResponseFormat};
use super::session::SessionSummary;
use crate::AppError;

/// Body of `POST /ask`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    /// Prompt text; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Existing session to continue; a session is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Requested output format.
    #[serde(default)]
    pub format: ResponseFormat,
    /// Working directory for an implicitly created session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

/// Body of `POST /stream/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    /// Initial prompt; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Working directory of the new session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Requested output format.
    #[serde(default)]
    pub format: ResponseFormat,
}

/// Body of `POST /stream/{sessionId}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamPromptRequest {
    /// Prompt text; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Requested output format.
    #[serde(default)]
    pub format: ResponseFormat,
}

/// Body of `POST /permission/{sessionId}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionAnswer {
    /// Human response; required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Result of starting a streaming session over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    /// Newly created session.
    pub session_id: String,
    /// Response to the initial prompt.
    pub response: AssistantResponse,
}

/// Acknowledgement of `DELETE /stream/{sessionId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloseAck {
    /// Closed session.
    pub session_id: String,
    /// Always `closed`.
    pub status: String,
    /// Whether the session had already been closed before this call.
    pub already_closed: bool,
}

/// Body of `GET /sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionList {
    /// Live sessions, oldest first.
    pub sessions: Vec<SessionSummary>,
}

/// Body of `GET /info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Whether the assistant backend is currently usable.
    pub backend_available: bool,
    /// Request/response endpoints, as `METHOD /path`.
    pub endpoints: Vec<String>,
    /// Path of the duplex channel.
    pub streaming_path: String,
}

/// Structured error body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine-readable kind plus human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Stable error kind, see [`AppError::kind`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        Self {
            error: ErrorDetail {
                kind: err.kind().to_owned(),
                message: err.detail().to_owned(),
            },
        }
    }
}

impl ErrorBody {
    /// Rebuild the [`AppError`] this body describes.
    #[must_use]
    pub fn into_error(self) -> AppError {
        AppError::from_wire(&self.error.kind, self.error.message)
    }
}

/// Extract a required, non-blank prompt-like field.
///
/// # Errors
///
/// Returns `AppError::BadRequest` naming `field` when it is absent or
/// blank.
pub fn required(value: Option<String>, field: &str) -> crate::Result<String> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(AppError::BadRequest(format!("missing {field}"))),
    }
}
