//! Server configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name holding the bearer credential.
pub const KEYRING_SERVICE: &str = "companion-bridge";

/// Environment variable consulted when the keychain has no credential.
pub const AUTH_TOKEN_ENV: &str = "COMPANION_AUTH_TOKEN";

/// Assistant backend process settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Host CLI binary (e.g., `claude`).
    pub host_cli: String,
    /// Arguments passed before the prompt on every turn.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Arguments used by the health probe to query the backend version.
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
    /// Upper bound for a single health probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Interval between periodic health probes; 0 disables them.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

fn default_version_args() -> Vec<String> {
    vec!["--version".into()]
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_interval() -> u64 {
    60
}

/// Configurable timeout values (seconds) for blocking flows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// How long a permission request may stay unanswered.
    #[serde(default = "default_permission_seconds")]
    pub permission_seconds: u64,
    /// Upper bound for a single prompt turn; 0 means no limit.
    #[serde(default = "default_prompt_seconds")]
    pub prompt_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            permission_seconds: default_permission_seconds(),
            prompt_seconds: default_prompt_seconds(),
        }
    }
}

fn default_permission_seconds() -> u64 {
    300
}

fn default_prompt_seconds() -> u64 {
    1800
}

/// Streaming dispatcher limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Frames buffered per session while no subscriber is attached.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Outbound queue depth of each websocket connection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    64
}

/// Session retirement settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Idle time after which unattached sessions are closed; 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// How often the eviction task scans for idle sessions.
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_seconds: u64,
    /// Number of closed sessions remembered for idempotent close.
    #[serde(default = "default_retired_capacity")]
    pub retired_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            eviction_interval_seconds: default_eviction_interval(),
            retired_capacity: default_retired_capacity(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_eviction_interval() -> u64 {
    60
}

fn default_retired_capacity() -> usize {
    1024
}

/// Outcome applied when a permission request times out.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutOutcome {
    /// Deny the request; the session resumes.
    #[default]
    Deny,
    /// Abort the turn and close the session.
    Abort,
}

/// Permission broker policy.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionConfig {
    /// Default outcome on timeout.
    #[serde(default)]
    pub timeout_outcome: TimeoutOutcome,
    /// Whether a hard decline (`abort`) closes the session.
    #[serde(default = "default_true")]
    pub decline_closes_session: bool,
}

fn default_true() -> bool {
    true
}

/// Bearer authentication settings.
///
/// The token itself is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuthConfig {
    /// Refuse to start without a credential.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Bearer token (populated at runtime).
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: true,
            token: None,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    3000
}

/// Server configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Interface the HTTP server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// HTTP port for the request/response surface and `/ws`.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Working directory for sessions that do not specify one.
    #[serde(default)]
    pub default_working_directory: Option<PathBuf>,
    /// Assistant backend settings.
    pub backend: BackendConfig,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Streaming limits.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Session retirement settings.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Permission broker policy.
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the bearer token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `auth.required` is set and neither
    /// keychain nor env var provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        match load_credential("auth_token", AUTH_TOKEN_ENV).await {
            Ok(token) => {
                self.auth.token = Some(token);
                Ok(())
            }
            Err(err) if self.auth.required => Err(err),
            Err(_) => {
                warn!("no auth token configured; bearer authentication disabled");
                self.auth.token = None;
                Ok(())
            }
        }
    }

    /// Permission timeout as a [`Duration`].
    #[must_use]
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.permission_seconds)
    }

    /// Prompt timeout, or `None` when unlimited.
    #[must_use]
    pub fn prompt_timeout(&self) -> Option<Duration> {
        (self.timeouts.prompt_seconds > 0).then(|| Duration::from_secs(self.timeouts.prompt_seconds))
    }

    /// Idle eviction timeout, or `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.sessions.idle_timeout_seconds > 0)
            .then(|| Duration::from_secs(self.sessions.idle_timeout_seconds))
    }

    fn validate(&mut self) -> Result<()> {
        if self.backend.host_cli.trim().is_empty() {
            return Err(AppError::Config("backend.host_cli must not be empty".into()));
        }

        if self.timeouts.permission_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.permission_seconds must be greater than zero".into(),
            ));
        }

        if self.stream.buffer_capacity == 0 || self.stream.channel_capacity == 0 {
            return Err(AppError::Config(
                "stream capacities must be greater than zero".into(),
            ));
        }

        if self.sessions.eviction_interval_seconds == 0 {
            return Err(AppError::Config(
                "sessions.eviction_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.backend.probe_timeout_seconds == 0 {
            return Err(AppError::Config(
                "backend.probe_timeout_seconds must be greater than zero".into(),
            ));
        }

        if let Some(ref dir) = self.default_working_directory {
            let canonical = dir.canonicalize().map_err(|err| {
                AppError::Config(format!("default_working_directory invalid: {err}"))
            })?;
            self.default_working_directory = Some(canonical);
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
