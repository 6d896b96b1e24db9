//! Step-up ceremony endpoints.

use super::{session::current_session, user_state::StateResponse};
use crate::{
    api::state::AppState,
    ceremony::{Operation, Proof, Purpose, StartedCeremony},
    error::AuthError,
    session::SecondFactorMethod,
};
use axum::{
    extract::Extension,
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRequest {
    method: SecondFactorMethod,
    operation: Operation,
}

/// Not `Debug`: the proof may carry a one-time code.
#[derive(Deserialize, ToSchema)]
pub struct FinishRequest {
    method: SecondFactorMethod,
    operation: Operation,
    token: String,
    proof: Proof,
}

#[utoipa::path(
    post,
    path = "/api/secondfactor/start",
    request_body = StartRequest,
    responses(
        (status = 200, description = "Ceremony started", body = StartedCeremony),
        (status = 401, description = "No first-factor session"),
        (status = 403, description = "Second factor required to add another credential"),
        (status = 404, description = "Method disabled"),
        (status = 409, description = "Already registered or not registered")
    ),
    tag = "secondfactor"
)]
pub async fn start(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartedCeremony>, AuthError> {
    let current = current_session(&state, &headers).await?;
    let started = state
        .ceremonies
        .start(&current.session, request.method, request.operation)
        .await?;
    Ok(Json(started))
}

#[utoipa::path(
    post,
    path = "/api/secondfactor/finish",
    request_body = FinishRequest,
    responses(
        (status = 200, description = "Ceremony finished", body = StateResponse),
        (status = 401, description = "Invalid or expired"),
        (status = 403, description = "Denied by the approver"),
        (status = 408, description = "Approval timed out")
    ),
    tag = "secondfactor"
)]
pub async fn finish(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<FinishRequest>,
) -> Result<Json<StateResponse>, AuthError> {
    let current = current_session(&state, &headers).await?;
    let session = state
        .ceremonies
        .finish(
            &current.key,
            &current.session,
            Purpose::new(request.method, request.operation),
            &request.token,
            &request.proof,
        )
        .await?;
    Ok(Json(StateResponse::new(
        &session,
        state.ceremonies.enabled_methods(),
    )))
}
