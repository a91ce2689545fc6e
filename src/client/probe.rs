//! Bounded-timeout reachability and authorization probe of `/health`.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use tracing::debug;

use super::transport::HttpTransport;
use crate::models::endpoint::Endpoint;
use crate::models::health::HealthReport;
use crate::{AppError, Result};

/// Probe `GET /health` on `endpoint`.
///
/// # Errors
///
/// - `AppError::AuthenticationFailed` when the server rejects the
///   credential (401/403), never `ConnectionFailed`.
/// - `AppError::ConnectionFailed` for any other non-success status or a
///   malformed endpoint.
/// - `AppError::Network` / `AppError::Timeout` for transport failures.
/// - `AppError::InvalidResponse` if the report cannot be decoded.
pub async fn check(endpoint: &Endpoint, timeout: Duration) -> Result<HealthReport> {
    let transport = HttpTransport::new(endpoint, timeout)?;
    let response = transport
        .send(transport.request(Method::GET, "/health")?, Some(timeout))
        .await?;

    let status = response.status();
    debug!(%status, address = endpoint.address(), port = endpoint.port(), "health probe");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::AuthenticationFailed),
        status if status.is_success() => HttpTransport::decode(response).await,
        status => Err(AppError::ConnectionFailed(format!(
            "health probe returned HTTP {status}"
        ))),
    }
}
