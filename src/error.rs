//! Typed errors shared by the policy engine, ceremonies, and the HTTP layer.
//!
//! Callers branch on these variants, so they are never collapsed into a
//! generic failure internally. Only the outward message is collapsed: every
//! ceremony verification failure reads "invalid or expired" to the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("insufficient authentication factor")]
    InsufficientFactor,
    #[error("method disabled")]
    MethodDisabled,
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,
    #[error("denied by external approver")]
    ExternalDenied,
    #[error("timed out waiting for approval")]
    Timeout,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("malformed request")]
    MalformedRequest,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("not registered")]
    NotRegistered,
}

impl AuthError {
    /// Message safe to show an unauthenticated caller.
    #[must_use]
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "Authentication required",
            Self::InsufficientFactor => "Additional authentication required",
            Self::MethodDisabled => "Method not available",
            Self::InvalidOrExpiredToken => "Invalid or expired",
            Self::ExternalDenied => "Request denied",
            Self::Timeout => "Request timed out, try again",
            Self::StoreUnavailable => "Service unavailable",
            Self::MalformedRequest => "Malformed request",
            Self::AlreadyRegistered => "Already registered",
            Self::NotRegistered => "Not registered",
        }
    }

    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::InvalidOrExpiredToken => StatusCode::UNAUTHORIZED,
            Self::InsufficientFactor | Self::ExternalDenied => StatusCode::FORBIDDEN,
            Self::MethodDisabled => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::MalformedRequest => StatusCode::BAD_REQUEST,
            Self::AlreadyRegistered | Self::NotRegistered => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({ "status": "KO", "message": self.public_message() })),
        )
            .into_response()
    }
}
