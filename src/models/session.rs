//! Session model and lifecycle helpers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::PermissionRequest;

/// Lifecycle status for a bridge session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session accepts prompts.
    Active,
    /// Forward progress is suspended until a human permission decision.
    AwaitingPermission,
    /// Session retired; no further operations are accepted.
    Closed,
}

/// Server-side addressable unit of an ongoing backend conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque, globally unique identifier.
    pub id: String,
    /// Directory the backend runs in for this session.
    pub working_directory: Option<PathBuf>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp; never decreases.
    pub updated_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Outstanding permission request, present only while awaiting permission.
    pub pending_permission: Option<PermissionRequest>,
    /// Conversation id reported by the backend, used to resume the next turn.
    pub backend_session_id: Option<String>,
    /// Number of prompts accepted by this session.
    pub prompt_count: u64,
}

impl Session {
    /// Construct a new active session with a generated identifier.
    #[must_use]
    pub fn new(working_directory: Option<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            working_directory,
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            pending_permission: None,
            backend_session_id: None,
            prompt_count: 0,
        }
    }

    /// Advance `updated_at` to now, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Active,
                SessionStatus::AwaitingPermission | SessionStatus::Closed
            ) | (
                SessionStatus::AwaitingPermission,
                SessionStatus::Active | SessionStatus::Closed
            )
        )
    }

    /// Build the list-view summary of this session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            working_directory: self.working_directory.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            awaiting_permission: self.pending_permission.is_some(),
            prompt_count: self.prompt_count,
        }
    }
}

/// Snapshot of a session returned by `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Working directory, if any.
    pub working_directory: Option<PathBuf>,
    /// Lifecycle status at snapshot time.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub updated_at: DateTime<Utc>,
    /// Whether a permission decision is outstanding.
    pub awaiting_permission: bool,
    /// Number of prompts accepted so far.
    pub prompt_count: u64,
}
