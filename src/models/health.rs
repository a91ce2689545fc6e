//! Health report returned by the liveness probe.

use serde::{Deserialize, Serialize};

/// Liveness and capability report for a bridge server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok` when the backend is usable, `degraded` otherwise.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Whether the assistant backend answered its probe.
    #[serde(default)]
    pub backend_available: bool,
    /// Version string reported by the backend, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_version: Option<String>,
}

impl HealthReport {
    /// Report for a server whose backend has not been probed or is down.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            status: "degraded".into(),
            version: crate::VERSION.into(),
            backend_available: false,
            backend_version: None,
        }
    }

    /// Report for a reachable backend.
    #[must_use]
    pub fn available(backend_version: Option<String>) -> Self {
        Self {
            status: "ok".into(),
            version: crate::VERSION.into(),
            backend_available: true,
            backend_version,
        }
    }

    /// Whether the report describes a usable server.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.backend_available
    }
}
