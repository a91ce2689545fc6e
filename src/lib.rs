#![forbid(unsafe_code)]

//! Session-oriented streaming bridge between remote clients and a
//! code-assistant backend.
//!
//! The server half ([`server`], [`session`], [`backend`], [`health`])
//! exposes prompts, streamed output and permission handshakes over HTTP and
//! a `/ws` duplex channel. The client half ([`client`]) connects to it.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod health;
pub mod models;
pub mod server;
pub mod session;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};

/// Crate name reported by `/info`.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Crate version reported by `/health` and `/info`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
