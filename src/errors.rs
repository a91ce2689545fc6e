//! Error types shared across the server and client halves of the bridge.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all protocol failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or process I/O failure.
    Io(String),
    /// The assistant backend failed or produced an unusable result.
    Backend(String),
    /// Request payload is missing a required field or is malformed.
    BadRequest(String),
    /// Connection could not be established or is not active.
    ConnectionFailed(String),
    /// The remote endpoint rejected the supplied credential.
    AuthenticationFailed,
    /// Transport-level failure (DNS, TCP, TLS, websocket I/O).
    Network(String),
    /// Remote peer returned a malformed or unexpected payload.
    InvalidResponse(String),
    /// No session exists with the given identifier.
    SessionNotFound(String),
    /// The session cannot accept the operation in its current state.
    InvalidSessionState(String),
    /// The permission request has already been resolved.
    PermissionAlreadyResolved(String),
    /// An operation exceeded its time budget.
    Timeout(String),
}

impl AppError {
    /// Stable machine-readable error kind used in wire error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Backend(_) => "backend",
            Self::BadRequest(_) => "bad_request",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Network(_) => "network",
            Self::InvalidResponse(_) => "invalid_response",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidSessionState(_) => "invalid_session_state",
            Self::PermissionAlreadyResolved(_) => "permission_already_resolved",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Message carried by the error, without the kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::AuthenticationFailed => "credential rejected",
            Self::Config(msg)
            | Self::Io(msg)
            | Self::Backend(msg)
            | Self::BadRequest(msg)
            | Self::ConnectionFailed(msg)
            | Self::Network(msg)
            | Self::InvalidResponse(msg)
            | Self::SessionNotFound(msg)
            | Self::InvalidSessionState(msg)
            | Self::PermissionAlreadyResolved(msg)
            | Self::Timeout(msg) => msg,
        }
    }

    /// Rebuild an error from a wire `kind` and `message` pair.
    ///
    /// Unknown kinds map to [`AppError::InvalidResponse`] so that a newer
    /// server never produces an error the client cannot represent.
    #[must_use]
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "config" => Self::Config(message),
            "io" => Self::Io(message),
            "backend" => Self::Backend(message),
            "bad_request" => Self::BadRequest(message),
            "connection_failed" => Self::ConnectionFailed(message),
            "authentication_failed" => Self::AuthenticationFailed,
            "network" => Self::Network(message),
            "invalid_response" => Self::InvalidResponse(message),
            "session_not_found" => Self::SessionNotFound(message),
            "invalid_session_state" => Self::InvalidSessionState(message),
            "permission_already_resolved" => Self::PermissionAlreadyResolved(message),
            "timeout" => Self::Timeout(message),
            other => Self::InvalidResponse(format!("unknown error kind {other}: {message}")),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Backend(msg) => write!(f, "backend: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            Self::AuthenticationFailed => write!(f, "authentication failed"),
            Self::Network(msg) => write!(f, "network: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::InvalidSessionState(msg) => write!(f, "invalid session state: {msg}"),
            Self::PermissionAlreadyResolved(msg) => {
                write!(f, "permission already resolved: {msg}")
            }
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(format!("malformed json: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(ref response) => {
                let status = response.status();
                if status == 401 || status == 403 {
                    Self::AuthenticationFailed
                } else {
                    Self::ConnectionFailed(format!("channel upgrade rejected: HTTP {status}"))
                }
            }
            WsError::Url(url_err) => Self::ConnectionFailed(format!("invalid channel url: {url_err}")),
            other => Self::Network(other.to_string()),
        }
    }
}
