//! Permission request model and decision parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionStatus;

/// A backend-raised need for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Unique request identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Prompt text or context shown to the human.
    pub prompt: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Whether the request has been resolved.
    pub resolved: bool,
}

impl PermissionRequest {
    /// Construct a new unresolved permission request.
    #[must_use]
    pub fn new(session_id: String, prompt: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            prompt,
            created_at: Utc::now(),
            resolved: false,
        }
    }
}

/// Decision delivered back to the backend for a permission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "decision", content = "text")]
pub enum PermissionDecision {
    /// Proceed with the requested action.
    Allow,
    /// Refuse the requested action; the session continues.
    Deny,
    /// Hard decline that stops the current turn.
    Abort,
    /// Free-form answer forwarded verbatim.
    Custom(String),
}

impl PermissionDecision {
    /// Parse a human response such as `y`, `no`, or free text.
    #[must_use]
    pub fn parse(response: &str) -> Self {
        let trimmed = response.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "y" | "yes" | "allow" | "approve" | "ok" => Self::Allow,
            "n" | "no" | "deny" | "reject" => Self::Deny,
            "abort" | "decline" | "stop" => Self::Abort,
            _ => Self::Custom(trimmed.to_owned()),
        }
    }

    /// Short label used in logs and wire frames.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Abort => "abort",
            Self::Custom(_) => "custom",
        }
    }

    /// Raw text sent to the backend alongside the decision label.
    #[must_use]
    pub fn response_text(&self) -> &str {
        match self {
            Self::Allow => "y",
            Self::Deny | Self::Abort => "n",
            Self::Custom(text) => text,
        }
    }
}

/// Acknowledgement returned after a permission request is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResolution {
    /// Session that was waiting.
    pub session_id: String,
    /// Resolved request.
    pub request_id: String,
    /// Decision label delivered to the backend.
    pub decision: String,
    /// Session status after resolution.
    pub status: SessionStatus,
}

/// How a pending permission request ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// A human answered before the timeout.
    Answered,
    /// The timeout elapsed and the default outcome was applied.
    TimedOut,
    /// The session closed while the request was pending.
    Cancelled,
}
