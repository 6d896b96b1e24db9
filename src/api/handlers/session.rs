//! Session cookie handling and logout.

use crate::{
    api::state::{AppState, CookieConfig},
    error::{AuthError, Result},
    session::{session_key, IdentitySession},
};
use axum::{
    extract::Extension,
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// A stored, unexpired, authenticated session and its store key.
pub struct CurrentSession {
    pub key: String,
    pub session: IdentitySession,
}

#[utoipa::path(
    post,
    path = "/api/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers, state.cookie.name()) {
        let key = session_key(&token);
        match state.sessions.load(&key).await {
            Ok(Some(session)) => {
                if let Some(subject) = session.principal.as_deref() {
                    if let Err(err) = state.ceremonies.abandon(subject).await {
                        error!("Failed to drop ceremony tokens: {err}");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => error!("Failed to load session: {err}"),
        }
        if let Err(err) = state.sessions.delete(&key).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session was already gone.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&state.cookie) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// Load the caller's session.
///
/// # Errors
/// `Unauthenticated` when there is no live session, `StoreUnavailable` when
/// the store cannot be read.
pub(crate) async fn current_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<CurrentSession> {
    let token =
        extract_session_token(headers, state.cookie.name()).ok_or(AuthError::Unauthenticated)?;
    let key = session_key(&token);
    match state.sessions.load(&key).await? {
        Some(session) if !session.is_anonymous() && !session.is_expired(Utc::now()) => {
            Ok(CurrentSession { key, session })
        }
        Some(_) => {
            debug!("stale session presented");
            state.sessions.delete(&key).await?;
            Err(AuthError::Unauthenticated)
        }
        None => Err(AuthError::Unauthenticated),
    }
}

/// Build the `HttpOnly` session cookie.
pub(crate) fn session_cookie(
    config: &CookieConfig,
    token: &str,
    max_age: Duration,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        config.name(),
        max_age.as_secs()
    );
    push_attributes(config, &mut cookie);
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(
    config: &CookieConfig,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", config.name());
    push_attributes(config, &mut cookie);
    HeaderValue::from_str(&cookie)
}

fn push_attributes(config: &CookieConfig, cookie: &mut String) {
    if let Some(domain) = config.domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if config.secure() {
        cookie.push_str("; Secure");
    }
}

/// Bearer token first, then the session cookie.
pub(crate) fn extract_session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == cookie_name && !val.trim().is_empty()).then(|| val.trim().to_string())
        })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
