//! Mapping of [`AppError`] onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::api::ErrorBody;
use crate::AppError;

/// Error returned by route handlers.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(AppError::BadRequest(rejection.body_text()))
    }
}

/// Stable status code for each error kind.
#[must_use]
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AppError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidSessionState(_) | AppError::PermissionAlreadyResolved(_) => {
            StatusCode::CONFLICT
        }
        AppError::Backend(_) => StatusCode::BAD_GATEWAY,
        AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), err = %self.0, "request failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}
