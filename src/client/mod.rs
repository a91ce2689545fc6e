//! Client half of the bridge.
//!
//! - [`transport`] performs request/response calls and opens the duplex
//!   channel.
//! - [`connection`] owns the single connection and its receive loop.
//! - [`router`] matches inbound frames to waiting prompts.
//! - [`probe`] and [`discovery`] check reachability of servers.

pub mod connection;
pub mod discovery;
pub mod probe;
pub(crate) mod router;
pub mod transport;

pub use connection::{ClientOptions, ClientStatus, ConnectionManager, ConnectionState};
pub use discovery::{discover, DiscoveredServer};
