//! Domain model module declarations.

pub mod api;
pub mod endpoint;
pub mod frame;
pub mod health;
pub mod permission;
pub mod response;
pub mod session;
