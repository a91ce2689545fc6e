//! Assistant response and partial chunk units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Requested output format for a one-shot prompt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Structured JSON output (default).
    #[default]
    Json,
    /// Plain text output.
    Text,
    /// Markdown output.
    Markdown,
}

impl ResponseFormat {
    /// Wire name of the format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Markdown => "markdown",
        }
    }
}

/// Fully materialized result of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponse {
    /// Unique response identifier.
    pub id: String,
    /// Session that produced the response.
    pub session_id: String,
    /// Final assistant output.
    pub content: String,
    /// Output format the backend was asked for.
    pub format: ResponseFormat,
    /// Completion timestamp.
    pub created_at: DateTime<Utc>,
    /// Wall-clock duration of the turn in milliseconds.
    pub duration_ms: u64,
    /// Number of partial chunks emitted before this response.
    pub partial_count: u64,
}

impl AssistantResponse {
    /// Construct a response stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        session_id: String,
        content: String,
        format: ResponseFormat,
        duration_ms: u64,
        partial_count: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            content,
            format,
            created_at: Utc::now(),
            duration_ms,
            partial_count,
        }
    }
}

/// Ordered fragment of an in-progress response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartialChunk {
    /// Session the fragment belongs to.
    pub session_id: String,
    /// Per-session sequence number, strictly increasing from 1.
    pub seq: u64,
    /// Text fragment.
    pub text: String,
}
