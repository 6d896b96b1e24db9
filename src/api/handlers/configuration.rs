use super::session::current_session;
use crate::{api::state::AppState, session::SecondFactorMethod};
use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

/// Second factors the portal may offer.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConfigurationResponse {
    pub available_methods: Vec<SecondFactorMethod>,
}

#[utoipa::path(
    get,
    path = "/api/configuration",
    responses(
        (status = 200, description = "Enabled second factors", body = ConfigurationResponse),
        (status = 401, description = "No authenticated session"),
        (status = 503, description = "Session store unavailable")
    ),
    tag = "auth"
)]
pub async fn configuration(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match current_session(&state, &headers).await {
        Ok(_) => Json(ConfigurationResponse {
            available_methods: state.ceremonies.enabled_methods(),
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}
