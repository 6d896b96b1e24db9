//! Username/password login.
//!
//! The credential check runs inside the timing gate so that a wrong password
//! and a right one are answered after the same delay. Any session the caller
//! already holds is destroyed and a fresh token is minted.

use super::session::{extract_session_token, session_cookie};
use crate::{
    api::state::AppState,
    error::AuthError,
    session::{generate_session_token, session_key, IdentitySession, UserDetails},
};
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use url::Url;
use utoipa::ToSchema;

/// Login form. Deliberately not `Debug`; it carries the password.
#[derive(Deserialize, ToSchema)]
pub struct FirstFactorRequest {
    username: String,
    password: String,
    #[serde(default)]
    keep_me_logged_in: bool,
    /// Where the portal should send the browser afterwards.
    #[serde(default)]
    target_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FirstFactorResponse {
    status: String,
    /// Present only when the requested target is a safe redirection.
    redirect: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/firstfactor",
    request_body = FirstFactorRequest,
    responses(
        (
            status = 200,
            description = "Authenticated; session cookie set",
            body = FirstFactorResponse
        ),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Invalid credentials"),
        (status = 503, description = "Backend unavailable")
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn first_factor(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(request): Json<FirstFactorRequest>,
) -> Response {
    let username = request.username.trim().to_string();
    let password = SecretString::from(request.password);
    if username.is_empty() {
        return AuthError::MalformedRequest.into_response();
    }

    let checked = state
        .timing
        .run(async {
            match state.credentials.check_password(&username, &password).await {
                Ok(Some(user)) => (Ok(Some(user)), true),
                other => (other, false),
            }
        })
        .await;

    let user = match checked {
        Ok(Some(user)) => user,
        Ok(None) => {
            info!(username = %username, "first factor rejected");
            return AuthError::Unauthenticated.into_response();
        }
        Err(err) => {
            error!("Credential backend failed: {err}");
            return err.into_response();
        }
    };

    // Never reuse a pre-login session token.
    if let Some(previous) = extract_session_token(&headers, state.cookie.name()) {
        if let Err(err) = state.sessions.delete(&session_key(&previous)).await {
            warn!("Failed to delete previous session: {err}");
        }
    }

    let response_headers = match create_session(&state, &user, request.keep_me_logged_in).await {
        Ok(headers) => headers,
        Err(err) => return err.into_response(),
    };
    info!(username = %username, "first factor accepted");

    let redirect = request
        .target_url
        .as_deref()
        .and_then(|target| safe_redirect(target, state.cookie.domain()));
    (
        response_headers,
        Json(FirstFactorResponse {
            status: "OK".to_string(),
            redirect,
        }),
    )
        .into_response()
}

async fn create_session(
    state: &AppState,
    user: &UserDetails,
    remember_me: bool,
) -> Result<HeaderMap, AuthError> {
    let now = Utc::now();
    let session = IdentitySession::first_factor(user, remember_me, &state.session_config, now);
    let token = generate_session_token().map_err(|err| {
        error!("Failed to generate session token: {err}");
        AuthError::StoreUnavailable
    })?;
    let ttl = session.ttl(now);
    state
        .sessions
        .save(&session_key(&token), &session, ttl)
        .await?;

    let cookie = session_cookie(&state.cookie, &token, ttl).map_err(|err| {
        error!("Failed to build session cookie: {err}");
        AuthError::StoreUnavailable
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    Ok(headers)
}

/// Accept only `https` targets inside the cookie domain, so the portal
/// cannot be used as an open redirector.
pub(crate) fn safe_redirect(target: &str, cookie_domain: Option<&str>) -> Option<String> {
    let url = Url::parse(target).ok()?;
    if url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    let allowed = cookie_domain.map_or(true, |domain| {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    });
    allowed.then(|| url.to_string())
}
