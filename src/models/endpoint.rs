//! Backend endpoint description used by the client.

use std::fmt::{Debug, Formatter};

use reqwest::Url;

use crate::{AppError, Result};

/// Path of the persistent duplex channel on the server.
pub const CHANNEL_PATH: &str = "/ws";

/// Address of a bridge server plus the credential used to reach it.
///
/// Re-created on every `connect`; never mutated while a connection uses it.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: String,
    port: u16,
    auth_token: Option<String>,
    secure: bool,
}

impl Endpoint {
    /// Construct an endpoint with an explicit transport security flag.
    ///
    /// Any `http://` / `https://` prefix and trailing slash on `address`
    /// are stripped.
    #[must_use]
    pub fn new(address: &str, port: u16, auth_token: Option<String>, secure: bool) -> Self {
        Self {
            address: strip_scheme(address).to_owned(),
            port,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            secure,
        }
    }

    /// Construct an endpoint, inferring TLS from port 443 or an `https`
    /// address prefix.
    #[must_use]
    pub fn infer(address: &str, port: u16, auth_token: Option<String>) -> Self {
        let secure = port == 443 || address.trim().starts_with("https");
        Self::new(address, port, auth_token, secure)
    }

    /// Host name or IP address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bearer credential, if any.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Whether TLS is used for both HTTP and the channel.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Base URL for request/response calls.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` if the address or port cannot
    /// form a valid URL.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        self.url_with_scheme(scheme, "/")
    }

    /// URL of the duplex channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` if the address or port cannot
    /// form a valid URL.
    pub fn channel_url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        self.url_with_scheme(scheme, CHANNEL_PATH)
    }

    fn url_with_scheme(&self, scheme: &str, path: &str) -> Result<Url> {
        if self.address.is_empty() || self.address.chars().any(char::is_whitespace) {
            return Err(AppError::ConnectionFailed(format!(
                "invalid server address '{}'",
                self.address
            )));
        }
        if self.port == 0 {
            return Err(AppError::ConnectionFailed("invalid server port 0".into()));
        }
        let raw = format!("{scheme}://{}:{}{path}", self.address, self.port);
        let url = Url::parse(&raw)
            .map_err(|err| AppError::ConnectionFailed(format!("invalid server url {raw}: {err}")))?;
        if url.path() != path {
            return Err(AppError::ConnectionFailed(format!(
                "invalid server address '{}'",
                self.address
            )));
        }
        Ok(url)
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("secure", &self.secure)
            .finish()
    }
}

fn strip_scheme(address: &str) -> &str {
    let trimmed = address.trim();
    let without = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without.trim_end_matches('/')
}
