//! Forward-auth verification workflow.
//!
//! Flow Overview:
//! 1) Resolve the real client address through the trusted proxy chain.
//! 2) Resolve the session; a missing or expired one is treated as anonymous.
//! 3) Evaluate the rule snapshot and shape the result for the proxy: identity
//!    headers on `Allow`, a login redirect on `DenyRedirect` for browsers,
//!    a bare 401/403 otherwise.
//!
//! Any store error yields `Deny`. The only side effect is the sliding-expiry
//! touch of non remember-me sessions.

use crate::{
    access::{Decision, PolicyHandle, Target, TrustedProxies},
    error::Result,
    session::{
        session_key, FactorLevel, IdentitySession, SecondFactorMethod, SessionConfig,
        SessionStore,
    },
};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use chrono::{DateTime, Utc};
use std::{collections::BTreeSet, net::IpAddr, sync::Arc};
use tracing::{debug, error, instrument, warn};
use url::Url;

pub const REMOTE_USER: &str = "remote-user";
pub const REMOTE_GROUPS: &str = "remote-groups";
pub const REMOTE_NAME: &str = "remote-name";
pub const REMOTE_EMAIL: &str = "remote-email";
pub const X_ORIGINAL_URL: &str = "x-original-url";

/// One proxied request as seen by the gateway.
#[derive(Clone, Debug)]
pub struct VerificationRequest<'a> {
    pub target: Url,
    pub method: Method,
    pub peer: IpAddr,
    pub headers: &'a HeaderMap,
    pub session_token: Option<&'a str>,
    pub browser: bool,
}

/// Headers the upstream application reads on `Allow`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub original_url: String,
}

impl IdentityHeaders {
    fn from_session(session: &IdentitySession, target: &Url) -> Self {
        Self {
            user: session.principal.clone(),
            groups: session.groups.iter().cloned().collect(),
            name: session.display_name.clone(),
            email: session.emails.first().cloned(),
            original_url: target.to_string(),
        }
    }

    /// Render as HTTP headers. Values that are not valid header text are
    /// dropped.
    #[must_use]
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => warn!(header = name, "identity value is not a valid header"),
        };
        if let Some(user) = &self.user {
            insert(REMOTE_USER, user);
            insert(REMOTE_GROUPS, &self.groups.join(","));
        }
        if let Some(name) = &self.name {
            insert(REMOTE_NAME, name);
        }
        if let Some(email) = &self.email {
            insert(REMOTE_EMAIL, email);
        }
        insert(X_ORIGINAL_URL, &self.original_url);
        headers
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub decision: Decision,
    pub status: StatusCode,
    pub required_level: Option<FactorLevel>,
    pub required_methods: BTreeSet<SecondFactorMethod>,
    pub redirect_target: Option<Url>,
    pub identity: Option<IdentityHeaders>,
}

impl VerificationResult {
    fn deny(status: StatusCode) -> Self {
        Self {
            decision: Decision::Deny,
            status,
            required_level: None,
            required_methods: BTreeSet::new(),
            redirect_target: None,
            identity: None,
        }
    }
}

/// Whether the caller can follow a login redirect.
///
/// XHR requests and clients that do not accept HTML get a bare status.
#[must_use]
pub fn is_browser(headers: &HeaderMap) -> bool {
    let xhr = headers
        .get("x-requested-with")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("xmlhttprequest"));
    if xhr {
        return false;
    }
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map_or(true, |accept| {
            accept.contains("text/html") || accept.contains("*/*")
        })
}

pub struct Verifier {
    policy: Arc<PolicyHandle>,
    sessions: Arc<dyn SessionStore>,
    proxies: TrustedProxies,
    session_config: SessionConfig,
    login_url: Url,
}

impl Verifier {
    #[must_use]
    pub fn new(
        policy: Arc<PolicyHandle>,
        sessions: Arc<dyn SessionStore>,
        proxies: TrustedProxies,
        session_config: SessionConfig,
        login_url: Url,
    ) -> Self {
        Self {
            policy,
            sessions,
            proxies,
            session_config,
            login_url,
        }
    }

    #[must_use]
    pub fn proxies(&self) -> &TrustedProxies {
        &self.proxies
    }

    /// Decide one proxied request.
    #[instrument(skip_all, fields(host = request.target.host_str(), method = %request.method))]
    pub async fn verify(&self, request: &VerificationRequest<'_>) -> VerificationResult {
        let client_ip = self.proxies.client_ip(request.peer, request.headers);
        let target = Target::new(request.target.clone(), request.method.clone(), client_ip);
        let now = Utc::now();

        let (key, session) = match self.resolve_session(request.session_token, now).await {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("Session lookup failed, denying: {err}");
                return VerificationResult::deny(StatusCode::FORBIDDEN);
            }
        };

        if let Some(key) = &key {
            if let Err(err) = self.touch(key, &session, now).await {
                error!("Session touch failed, denying: {err}");
                return VerificationResult::deny(StatusCode::FORBIDDEN);
            }
        }

        let snapshot = self.policy.snapshot();
        let decision = snapshot.evaluate(&target, &session);
        debug!(%client_ip, ?decision, "request evaluated");

        match decision {
            Decision::Allow => VerificationResult {
                decision: Decision::Allow,
                status: StatusCode::OK,
                required_level: None,
                required_methods: BTreeSet::new(),
                redirect_target: None,
                identity: Some(IdentityHeaders::from_session(&session, &request.target)),
            },
            Decision::Deny => VerificationResult::deny(StatusCode::FORBIDDEN),
            Decision::DenyRedirect {
                required_level,
                required_methods,
            } => {
                if !request.browser {
                    return VerificationResult {
                        required_level: Some(required_level),
                        required_methods,
                        ..VerificationResult::deny(StatusCode::UNAUTHORIZED)
                    };
                }
                let redirect =
                    self.redirect_url(&request.target, required_level, &required_methods);
                VerificationResult {
                    decision: Decision::DenyRedirect {
                        required_level,
                        required_methods: required_methods.clone(),
                    },
                    status: StatusCode::FOUND,
                    required_level: Some(required_level),
                    required_methods,
                    redirect_target: Some(redirect),
                    identity: None,
                }
            }
        }
    }

    async fn resolve_session(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Option<String>, IdentitySession)> {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return Ok((None, IdentitySession::anonymous(now)));
        };
        let key = session_key(token);
        match self.sessions.load(&key).await? {
            Some(session) if !session.is_expired(now) && !session.is_anonymous() => {
                Ok((Some(key), session))
            }
            Some(_) => {
                debug!("expired session removed");
                self.sessions.delete(&key).await?;
                Ok((None, IdentitySession::anonymous(now)))
            }
            None => Ok((None, IdentitySession::anonymous(now))),
        }
    }

    /// Slide the inactivity window. A lost race means another request just
    /// wrote a fresher copy, which is fine.
    async fn touch(&self, key: &str, session: &IdentitySession, now: DateTime<Utc>) -> Result<()> {
        let Some(touched) = session.touched(&self.session_config, now) else {
            return Ok(());
        };
        if !self.sessions.compare_and_swap(key, session, &touched).await? {
            debug!("session changed concurrently, skipping touch");
        }
        Ok(())
    }

    fn redirect_url(
        &self,
        target: &Url,
        level: FactorLevel,
        methods: &BTreeSet<SecondFactorMethod>,
    ) -> Url {
        let mut url = self.login_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("rd", target.as_str());
            query.append_pair(
                "level",
                match level {
                    FactorLevel::Second => "two_factor",
                    FactorLevel::First | FactorLevel::None => "one_factor",
                },
            );
            if !methods.is_empty() {
                let methods: Vec<&str> = methods.iter().map(|method| method.as_str()).collect();
                query.append_pair("methods", &methods.join(","));
            }
        }
        url
    }
}
