//! Server-side session core.
//!
//! - [`registry`] owns the concurrent id → session map with per-session
//!   serialization.
//! - [`dispatcher`] buffers and fans out per-session output frames.
//! - [`broker`] suspends sessions on permission requests and resumes them.
//! - [`manager`] runs prompt turns against the backend.
//! - [`eviction`] retires idle, unattached sessions.

pub mod broker;
pub mod dispatcher;
pub mod eviction;
pub mod manager;
pub mod registry;

pub use broker::PermissionBroker;
pub use dispatcher::{StreamDispatcher, Subscriber};
pub use manager::{ChannelPrompt, SessionManager};
pub use registry::{CloseOutcome, SessionRegistry};
