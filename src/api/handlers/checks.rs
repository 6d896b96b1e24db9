//! Redirection checks for the login portal.

use super::{first_factor::safe_redirect, session::current_session};
use crate::api::state::AppState;
use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SafeRedirectionRequest {
    uri: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SafeRedirectionResponse {
    ok: bool,
}

#[utoipa::path(
    post,
    path = "/api/checks/safe-redirection",
    request_body = SafeRedirectionRequest,
    responses(
        (
            status = 200,
            description = "Whether the URI is a safe redirection target",
            body = SafeRedirectionResponse
        ),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "No authenticated session"),
        (status = 503, description = "Session store unavailable")
    ),
    tag = "auth"
)]
pub async fn safe_redirection(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<SafeRedirectionRequest>,
) -> Response {
    if let Err(err) = current_session(&state, &headers).await {
        return err.into_response();
    }
    let ok = safe_redirect(&request.uri, state.cookie.domain()).is_some();
    debug!(ok, "redirection checked");
    Json(SafeRedirectionResponse { ok }).into_response()
}
