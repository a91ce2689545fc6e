//! Bearer token authentication.
//!
//! Every route, including `/health` and the `/ws` upgrade, requires the
//! configured credential either as `Authorization: Bearer <token>` or as a
//! `token` query parameter (for websocket clients that cannot set headers).
//! Only the SHA-256 digest of the token is kept in memory and compared.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::error::ApiError;
use super::AppState;
use crate::AppError;

/// Digest of the expected bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenDigest([u8; 32]);

impl std::fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenDigest(<redacted>)")
    }
}

impl TokenDigest {
    /// Hash `token`.
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self(Sha256::digest(token.as_bytes()).into())
    }

    /// Compare a presented token against the expected digest.
    ///
    /// Both sides are fixed-length digests compared without early exit.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let other: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.0
            .iter()
            .zip(other.iter())
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Middleware rejecting requests without the configured credential.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth() else {
        return next.run(request).await;
    };

    let presented = bearer_token(request.headers()).or_else(|| query_token(request.uri()));
    match presented {
        Some(token) if expected.matches(&token) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "request rejected: invalid credential");
            ApiError(AppError::AuthenticationFailed).into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "request rejected: missing credential");
            ApiError(AppError::AuthenticationFailed).into_response()
        }
    }
}

/// Extract the token of an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_owned())
        .filter(|t| !t.is_empty())
}

/// Extract `token` from a URI query string.
fn query_token(uri: &Uri) -> Option<String> {
    uri.query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v.to_owned())
            .filter(|v| !v.is_empty())
    })
}
