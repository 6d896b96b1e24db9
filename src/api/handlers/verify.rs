//! Forward-auth endpoint consulted by the reverse proxy.
//!
//! The original request is reconstructed from `X-Original-URL`, or from the
//! `X-Forwarded-Proto`/`X-Forwarded-Host`/`X-Forwarded-Uri` triple.

use super::session::extract_session_token;
use crate::{
    api::state::AppState,
    error::AuthError,
    verify::{is_browser, VerificationRequest, X_ORIGINAL_URL},
};
use axum::{
    extract::{ConnectInfo, Extension},
    http::{header::LOCATION, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tracing::{debug, warn};
use url::Url;

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_URI: &str = "x-forwarded-uri";
const X_ORIGINAL_METHOD: &str = "x-original-method";
const X_FORWARDED_METHOD: &str = "x-forwarded-method";

#[utoipa::path(
    get,
    path = "/api/verify",
    responses(
        (status = 200, description = "Allowed; identity headers attached"),
        (status = 302, description = "Login required; Location carries the portal URL"),
        (status = 400, description = "Original request could not be reconstructed"),
        (status = 401, description = "Login required (non-browser client)"),
        (status = 403, description = "Denied")
    ),
    tag = "verify"
)]
pub async fn verify(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<AppState>>,
) -> Response {
    let Some(target) = original_url(&headers) else {
        debug!("missing or invalid original URL headers");
        return AuthError::MalformedRequest.into_response();
    };
    let method = original_method(&headers);
    let peer = connect_info.map_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED), |info| info.0.ip());
    let token = extract_session_token(&headers, state.cookie.name());

    let request = VerificationRequest {
        target,
        method,
        peer,
        headers: &headers,
        session_token: token.as_deref(),
        browser: is_browser(&headers),
    };
    let result = state.verifier.verify(&request).await;

    let mut response_headers = HeaderMap::new();
    if let Some(identity) = &result.identity {
        response_headers.extend(identity.to_header_map());
    }
    if let Some(redirect) = &result.redirect_target {
        match HeaderValue::from_str(redirect.as_str()) {
            Ok(location) => {
                response_headers.insert(LOCATION, location);
            }
            Err(err) => {
                warn!("Failed to build Location header: {err}");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }
    (result.status, response_headers).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn original_url(headers: &HeaderMap) -> Option<Url> {
    if let Some(url) = header_str(headers, X_ORIGINAL_URL) {
        return Url::parse(url).ok().filter(Url::has_host);
    }
    let proto = header_str(headers, X_FORWARDED_PROTO)?;
    let host = header_str(headers, X_FORWARDED_HOST)?;
    let uri = header_str(headers, X_FORWARDED_URI).unwrap_or("/");
    Url::parse(&format!("{proto}://{host}{uri}"))
        .ok()
        .filter(Url::has_host)
}

fn original_method(headers: &HeaderMap) -> Method {
    header_str(headers, X_ORIGINAL_METHOD)
        .or_else(|| header_str(headers, X_FORWARDED_METHOD))
        .and_then(|method| Method::from_bytes(method.to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET)
}
