//! Identity session value object.
//!
//! Flow Overview:
//! 1) A successful first factor creates a session at `FactorLevel::First`.
//! 2) A finished step-up ceremony upgrades it in place to `FactorLevel::Second`.
//! 3) Logout, expiry, or invalidation removes it from the store.
//!
//! The core never caches sessions across requests; every request re-reads the
//! store through [`store::SessionStore`].

pub mod store;

pub use store::{MemorySessionStore, SessionStore};

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt, str::FromStr};
use utoipa::ToSchema;

const DEFAULT_EXPIRATION_SECONDS: i64 = 60 * 60;
const DEFAULT_INACTIVITY_SECONDS: i64 = 5 * 60;
const DEFAULT_REMEMBER_ME_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Ordinal strength of the authentication a session holds.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FactorLevel {
    #[default]
    None,
    First,
    Second,
}

/// Second-factor methods a ceremony can complete.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SecondFactorMethod {
    Totp,
    Webauthn,
    Push,
}

impl SecondFactorMethod {
    pub const ALL: [Self; 3] = [Self::Totp, Self::Webauthn, Self::Push];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Webauthn => "webauthn",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for SecondFactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecondFactorMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "totp" => Ok(Self::Totp),
            "webauthn" => Ok(Self::Webauthn),
            "push" | "duo" => Ok(Self::Push),
            other => Err(format!("unknown second factor method: {other}")),
        }
    }
}

/// Identity resolved by the first-factor backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDetails {
    pub username: String,
    pub display_name: Option<String>,
    pub emails: Vec<String>,
    pub groups: BTreeSet<String>,
}

/// Session lifetime settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    expiration_seconds: i64,
    inactivity_seconds: i64,
    remember_me_seconds: Option<i64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            expiration_seconds: DEFAULT_EXPIRATION_SECONDS,
            inactivity_seconds: DEFAULT_INACTIVITY_SECONDS,
            remember_me_seconds: Some(DEFAULT_REMEMBER_ME_SECONDS),
        }
    }

    #[must_use]
    pub fn with_expiration_seconds(mut self, seconds: i64) -> Self {
        self.expiration_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_inactivity_seconds(mut self, seconds: i64) -> Self {
        self.inactivity_seconds = seconds;
        self
    }

    /// `None` disables remember-me entirely.
    #[must_use]
    pub fn with_remember_me_seconds(mut self, seconds: Option<i64>) -> Self {
        self.remember_me_seconds = seconds;
        self
    }

    #[must_use]
    pub fn expiration(&self) -> Duration {
        Duration::seconds(self.expiration_seconds)
    }

    #[must_use]
    pub fn inactivity(&self) -> Duration {
        Duration::seconds(self.inactivity_seconds)
    }

    #[must_use]
    pub fn remember_me(&self) -> Option<Duration> {
        self.remember_me_seconds.map(Duration::seconds)
    }

    #[must_use]
    pub fn remember_me_enabled(&self) -> bool {
        self.remember_me_seconds.is_some()
    }
}

/// An authenticated principal's current trust level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySession {
    pub principal: Option<String>,
    pub display_name: Option<String>,
    pub emails: Vec<String>,
    pub factor_level: FactorLevel,
    pub authenticated_methods: BTreeSet<SecondFactorMethod>,
    pub groups: BTreeSet<String>,
    pub remember_me: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revision: u64,
}

impl IdentitySession {
    /// The session every unauthenticated request is evaluated with.
    #[must_use]
    pub fn anonymous(now: DateTime<Utc>) -> Self {
        Self {
            principal: None,
            display_name: None,
            emails: Vec::new(),
            factor_level: FactorLevel::None,
            authenticated_methods: BTreeSet::new(),
            groups: BTreeSet::new(),
            remember_me: false,
            created_at: now,
            last_activity: now,
            expires_at: now,
            revision: 0,
        }
    }

    /// Session minted by a successful first-factor check.
    #[must_use]
    pub fn first_factor(
        user: &UserDetails,
        remember_me: bool,
        config: &SessionConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let remember = config.remember_me().filter(|_| remember_me);
        let expires_at = match remember {
            Some(duration) => now + duration,
            None => now + config.inactivity().min(config.expiration()),
        };
        Self {
            principal: Some(user.username.clone()),
            display_name: user.display_name.clone(),
            emails: user.emails.clone(),
            factor_level: FactorLevel::First,
            authenticated_methods: BTreeSet::new(),
            groups: user.groups.clone(),
            remember_me: remember.is_some(),
            created_at: now,
            last_activity: now,
            expires_at,
            revision: 0,
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.principal.is_none() || self.factor_level == FactorLevel::None
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn has_method(&self, method: SecondFactorMethod) -> bool {
        self.authenticated_methods.contains(&method)
    }

    /// Copy of the session raised to `Second` with `method` recorded.
    ///
    /// Never lowers the level, so merging into a newer concurrent write is safe.
    #[must_use]
    pub fn upgraded(&self, method: SecondFactorMethod, now: DateTime<Utc>) -> Self {
        let mut session = self.clone();
        session.factor_level = session.factor_level.max(FactorLevel::Second);
        session.authenticated_methods.insert(method);
        session.last_activity = now;
        session
    }

    /// Sliding-expiry touch. Remember-me sessions keep their fixed expiry.
    #[must_use]
    pub fn touched(&self, config: &SessionConfig, now: DateTime<Utc>) -> Option<Self> {
        if self.remember_me || self.is_anonymous() {
            return None;
        }
        let hard_limit = self.created_at + config.expiration();
        let mut session = self.clone();
        session.last_activity = now;
        session.expires_at = (now + config.inactivity()).min(hard_limit);
        Some(session)
    }

    /// Remaining lifetime, used as the store TTL.
    #[must_use]
    pub fn ttl(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Create a new opaque session token for the cookie.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_session_token() -> Result<String, rand::Error> {
    let mut bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Store key for a session token; raw tokens never reach the store.
#[must_use]
pub fn session_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserDetails {
        UserDetails {
            username: "alice".to_string(),
            display_name: Some("Alice".to_string()),
            emails: vec!["alice@example.com".to_string()],
            groups: BTreeSet::from(["admins".to_string()]),
        }
    }

    #[test]
    fn factor_levels_are_ordered() {
        assert!(FactorLevel::None < FactorLevel::First);
        assert!(FactorLevel::First < FactorLevel::Second);
    }

    #[test]
    fn first_factor_session_uses_inactivity_window() {
        let now = Utc::now();
        let config = SessionConfig::new();
        let session = IdentitySession::first_factor(&alice(), false, &config, now);
        assert_eq!(session.factor_level, FactorLevel::First);
        assert_eq!(session.expires_at, now + config.inactivity());
        assert!(!session.remember_me);
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + config.inactivity() + Duration::seconds(1)));
    }

    #[test]
    fn remember_me_ignored_when_disabled() {
        let now = Utc::now();
        let config = SessionConfig::new().with_remember_me_seconds(None);
        let session = IdentitySession::first_factor(&alice(), true, &config, now);
        assert!(!session.remember_me);
    }

    #[test]
    fn remember_me_sessions_are_not_slid() {
        let now = Utc::now();
        let config = SessionConfig::new();
        let session = IdentitySession::first_factor(&alice(), true, &config, now);
        assert!(session.remember_me);
        assert!(session.touched(&config, now + Duration::seconds(10)).is_none());
    }

    #[test]
    fn touch_extends_but_respects_absolute_expiration() {
        let now = Utc::now();
        let config = SessionConfig::new()
            .with_inactivity_seconds(300)
            .with_expiration_seconds(600);
        let session = IdentitySession::first_factor(&alice(), false, &config, now);

        let later = now + Duration::seconds(200);
        let touched = session.touched(&config, later).expect("touch");
        assert_eq!(touched.expires_at, later + Duration::seconds(300));

        let much_later = now + Duration::seconds(500);
        let capped = touched.touched(&config, much_later).expect("touch");
        assert_eq!(capped.expires_at, now + Duration::seconds(600));
    }

    #[test]
    fn upgrade_is_monotonic() {
        let now = Utc::now();
        let session = IdentitySession::first_factor(&alice(), false, &SessionConfig::new(), now);
        let upgraded = session
            .upgraded(SecondFactorMethod::Totp, now)
            .upgraded(SecondFactorMethod::Webauthn, now);
        assert_eq!(upgraded.factor_level, FactorLevel::Second);
        assert!(upgraded.has_method(SecondFactorMethod::Totp));
        assert!(upgraded.has_method(SecondFactorMethod::Webauthn));
    }

    #[test]
    fn session_key_is_stable_hex() {
        let key = session_key("token");
        assert_eq!(key, session_key("token"));
        assert_eq!(key.len(), 64);
        assert_ne!(key, session_key("other"));
    }

    #[test]
    fn method_parsing_accepts_duo_alias() {
        assert_eq!(
            "duo".parse::<SecondFactorMethod>(),
            Ok(SecondFactorMethod::Push)
        );
        assert!("sms".parse::<SecondFactorMethod>().is_err());
    }
}
