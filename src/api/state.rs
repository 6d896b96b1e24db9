//! Shared gateway state handed to every handler.

use crate::{
    access::PolicyHandle,
    ceremony::Ceremonies,
    credentials::CredentialBackend,
    session::{SessionConfig, SessionStore},
    timing::TimingGate,
    verify::Verifier,
};
use std::{path::PathBuf, sync::Arc};

pub const DEFAULT_SESSION_COOKIE_NAME: &str = "authgate_session";

#[derive(Clone, Debug)]
pub struct CookieConfig {
    name: String,
    secure: bool,
    domain: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            secure: true,
            domain: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Share the cookie with every protected subdomain.
    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

pub struct AppState {
    pub verifier: Verifier,
    pub policy: Arc<PolicyHandle>,
    pub sessions: Arc<dyn SessionStore>,
    pub ceremonies: Ceremonies,
    pub credentials: Arc<dyn CredentialBackend>,
    pub timing: Arc<TimingGate>,
    pub session_config: SessionConfig,
    pub cookie: CookieConfig,
    /// Source of the rule set, re-read on SIGHUP.
    pub access_control_path: Option<PathBuf>,
}
