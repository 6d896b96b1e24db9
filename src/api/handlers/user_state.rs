use super::session::current_session;
use crate::{
    api::state::AppState,
    error::AuthError,
    session::{FactorLevel, IdentitySession, SecondFactorMethod},
};
use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

/// What the login portal needs to render the next step.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct StateResponse {
    pub username: Option<String>,
    pub factor_level: FactorLevel,
    pub authenticated_methods: Vec<SecondFactorMethod>,
    pub available_methods: Vec<SecondFactorMethod>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StateResponse {
    pub(crate) fn new(session: &IdentitySession, available: Vec<SecondFactorMethod>) -> Self {
        let authenticated = !session.is_anonymous();
        Self {
            username: session.principal.clone(),
            factor_level: session.factor_level,
            authenticated_methods: session.authenticated_methods.iter().copied().collect(),
            available_methods: available,
            expires_at: authenticated.then_some(session.expires_at),
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/state",
    responses(
        (status = 200, description = "Current authentication state", body = StateResponse),
        (status = 503, description = "Session store unavailable")
    ),
    tag = "auth"
)]
pub async fn user_state(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let available = state.ceremonies.enabled_methods();
    match current_session(&state, &headers).await {
        Ok(current) => Json(StateResponse::new(&current.session, available)).into_response(),
        Err(AuthError::Unauthenticated) => Json(StateResponse::new(
            &IdentitySession::anonymous(Utc::now()),
            available,
        ))
        .into_response(),
        Err(err) => err.into_response(),
    }
}
