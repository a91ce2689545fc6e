//! Frames carried over the `/ws` duplex channel.
//!
//! Every frame is one JSON text message tagged by a `type` field. Field
//! names use `camelCase` to match the request/response surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::permission::{PermissionOutcome, PermissionRequest};
use super::response::{AssistantResponse, PartialChunk, ResponseFormat};
use crate::AppError;

/// Frame sent from the server to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// A `prompt` frame without a session created a new session.
    SessionStarted {
        /// Client correlation id from the originating `prompt` frame.
        request_id: String,
        /// Newly allocated session id.
        session_id: String,
    },
    /// A channel prompt's turn began; its partials start at `first_seq`.
    /// Partials with lower numbers belong to earlier turns.
    TurnStarted {
        /// Owning session.
        session_id: String,
        /// Client correlation id from the originating `prompt` frame.
        request_id: String,
        /// Sequence number of the turn's first partial.
        first_seq: u64,
    },
    /// Ordered fragment of an in-progress response.
    Partial {
        /// Owning session.
        session_id: String,
        /// Per-session sequence number.
        seq: u64,
        /// Text fragment.
        text: String,
    },
    /// Terminal response of a prompt.
    Response {
        /// Owning session.
        session_id: String,
        /// Correlation id when the prompt arrived over the channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Materialized response.
        response: AssistantResponse,
    },
    /// The backend needs a human decision before it can continue.
    PermissionRequest {
        /// Owning session.
        session_id: String,
        /// Request details.
        request: PermissionRequest,
    },
    /// A pending permission request ended.
    PermissionResolved {
        /// Owning session.
        session_id: String,
        /// Identifier of the resolved request.
        request_id: String,
        /// How the request ended.
        outcome: PermissionOutcome,
        /// Decision label delivered to the backend.
        decision: String,
    },
    /// Buffered partial chunks were dropped while no subscriber was attached.
    Gap {
        /// Owning session.
        session_id: String,
        /// Number of dropped frames.
        dropped: u64,
        /// Sequence number of the first partial delivered after the gap.
        resume_seq: u64,
    },
    /// The session was closed.
    SessionClosed {
        /// Closed session.
        session_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A prompt or control frame failed.
    Error {
        /// Session the error relates to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Correlation id of the failed `prompt` frame, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Machine-readable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// Reply to a client `ping` frame.
    Pong,
}

impl ServerFrame {
    /// Build a partial frame from a chunk.
    #[must_use]
    pub fn partial(chunk: PartialChunk) -> Self {
        Self::Partial {
            session_id: chunk.session_id,
            seq: chunk.seq,
            text: chunk.text,
        }
    }

    /// Build an error frame from an [`AppError`].
    #[must_use]
    pub fn error(session_id: Option<String>, request_id: Option<String>, err: &AppError) -> Self {
        Self::Error {
            session_id,
            request_id,
            kind: err.kind().to_owned(),
            message: err.detail().to_owned(),
        }
    }

    /// Session the frame is tagged with, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::TurnStarted { session_id, .. }
            | Self::Partial { session_id, .. }
            | Self::Response { session_id, .. }
            | Self::PermissionRequest { session_id, .. }
            | Self::PermissionResolved { session_id, .. }
            | Self::Gap { session_id, .. }
            | Self::SessionClosed { session_id, .. } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Pong => None,
        }
    }

    /// Whether the frame is a partial chunk; partials are the only frames
    /// the dispatcher may drop on overflow.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

/// Frame sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Run a prompt, creating a session when `session_id` is absent.
    Prompt {
        /// Client-chosen correlation id echoed in `session_started`,
        /// `response`, and `error` frames.
        request_id: String,
        /// Prompt text.
        prompt: String,
        /// Target session; a new session is started when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Working directory for a new session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
        /// Requested output format.
        #[serde(default)]
        format: ResponseFormat,
    },
    /// Attach this channel as the live subscriber of a session.
    Subscribe {
        /// Session to attach to.
        session_id: String,
    },
    /// Answer a pending permission request.
    Permission {
        /// Session awaiting permission.
        session_id: String,
        /// Raw human response (`y`, `n`, or free text).
        response: String,
    },
    /// Keep-alive; answered with `pong`.
    Ping,
}
