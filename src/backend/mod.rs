//! Assistant backend abstraction.
//!
//! The [`Backend`] trait decouples session orchestration from the way the
//! code-assistant is actually run. [`process::ProcessBackend`] drives a host
//! CLI per turn; tests substitute scripted implementations.

pub mod codec;
pub mod process;
pub mod reader;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::models::permission::PermissionDecision;
use crate::models::response::ResponseFormat;
use crate::Result;

/// Boxed future returned by [`Backend`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One prompt turn handed to the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Bridge session the turn belongs to.
    pub session_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Directory the backend should run in.
    pub working_directory: Option<PathBuf>,
    /// Requested output format.
    pub format: ResponseFormat,
    /// Backend conversation id from the previous turn, if any.
    pub resume_id: Option<String>,
    /// Fires when the session closes; the backend must stop promptly.
    pub cancel: CancellationToken,
}

/// Events a backend emits while a turn is in progress.
#[derive(Debug)]
pub enum BackendEvent {
    /// Fragment of the in-progress answer.
    Partial(String),
    /// The backend is blocked until a human decides.
    ///
    /// Dropping `reply` without sending is equivalent to
    /// [`PermissionDecision::Abort`].
    PermissionRequired {
        /// Text shown to the human.
        prompt: String,
        /// Channel the decision is delivered on.
        reply: oneshot::Sender<PermissionDecision>,
    },
}

/// Final output of a successful turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    /// Final answer text.
    pub content: String,
    /// Conversation id to resume on the next turn.
    pub backend_session_id: Option<String>,
}

/// Result of a backend liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendProbe {
    /// Whether the backend can run prompts.
    pub available: bool,
    /// Version string reported by the backend.
    pub version: Option<String>,
}

/// Interface between session orchestration and the code-assistant.
pub trait Backend: Send + Sync {
    /// Run one prompt turn to completion.
    ///
    /// Partial output and permission needs are sent through `events` in the
    /// order the backend produces them. The future resolves once the backend
    /// has finished the turn.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`](crate::AppError::Backend) when the
    /// backend fails, is aborted by a permission decline, or is cancelled.
    fn execute(
        &self,
        request: BackendRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> BoxFuture<'_, Result<BackendOutput>>;

    /// Check whether the backend is installed and responsive.
    fn probe(&self) -> BoxFuture<'_, BackendProbe>;
}
