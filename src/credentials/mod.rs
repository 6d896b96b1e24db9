//! First-factor credential backends.
//!
//! The static backend reads a JSON users file:
//!
//! ```json
//! {
//!   "users": {
//!     "alice": {
//!       "password_hash": "$argon2id$v=19$m=19456,t=2,p=1$...",
//!       "display_name": "Alice",
//!       "emails": ["alice@example.com"],
//!       "groups": ["admins"],
//!       "totp_secret": "JBSWY3DPEHPK3PXP"
//!     }
//!   }
//! }
//! ```
//!
//! Password hashes are PHC strings; `hash_password` produces Argon2id ones.

use crate::{
    error::{AuthError, Result},
    session::UserDetails,
};
use anyhow::{anyhow, Context};
use argon2::{
    password_hash::SaltString, Algorithm, Argon2, Params, PasswordHash, PasswordHasher,
    PasswordVerifier, Version,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};
use totp_rs::Secret;
use tracing::{debug, error, info};

#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Check a username/password pair. `Ok(None)` means the credentials are
    /// wrong; unknown users and wrong passwords are indistinguishable.
    async fn check_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<UserDetails>>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserEntry {
    password_hash: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    groups: BTreeSet<String>,
    #[serde(default)]
    totp_secret: Option<String>,
    #[serde(default)]
    disabled: bool,
}

struct StaticUser {
    password_hash: String,
    details: UserDetails,
    totp_secret: Option<Vec<u8>>,
    disabled: bool,
}

pub struct StaticUserBackend {
    users: HashMap<String, StaticUser>,
    /// Verified for unknown usernames so they cost as much as real ones.
    dummy_hash: String,
}

/// Hash a password into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &SecretString) -> anyhow::Result<String> {
    hash_with(Params::default(), password.expose_secret().as_bytes())
}

fn hash_with(params: Params, password: &[u8]) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password, &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// Hash of a throwaway password with the cost of a configured user.
fn dummy_hash(users: &HashMap<String, StaticUser>) -> anyhow::Result<String> {
    let params = users
        .values()
        .find_map(|user| {
            let parsed = PasswordHash::new(&user.password_hash).ok()?;
            Params::try_from(&parsed).ok()
        })
        .unwrap_or_default();
    hash_with(params, b"authgate-unknown-user")
}

fn verify_password(password: &SecretString, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.expose_secret().as_bytes(), &parsed)
        .is_ok()
}

impl StaticUserBackend {
    /// Parse a users document.
    ///
    /// # Errors
    /// Returns an error naming the offending user when a password hash or
    /// TOTP secret is malformed.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: UsersFile = serde_json::from_str(json).context("Invalid users JSON")?;
        let mut users = HashMap::with_capacity(file.users.len());
        for (username, entry) in file.users {
            let password_hash = entry.password_hash.trim().to_string();
            PasswordHash::new(&password_hash)
                .map_err(|err| anyhow!("user '{username}': invalid password_hash: {err}"))?;
            let totp_secret = entry
                .totp_secret
                .map(|encoded| {
                    Secret::Encoded(encoded.replace(' ', "").to_uppercase())
                        .to_bytes()
                        .map_err(|err| {
                            anyhow!("user '{username}': invalid totp_secret: {err:?}")
                        })
                })
                .transpose()?;
            let details = UserDetails {
                username: username.clone(),
                display_name: entry.display_name,
                emails: entry.emails,
                groups: entry.groups,
            };
            users.insert(
                username,
                StaticUser {
                    password_hash,
                    details,
                    totp_secret,
                    disabled: entry.disabled,
                },
            );
        }
        let dummy_hash = dummy_hash(&users)?;
        Ok(Self { users, dummy_hash })
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read users file: {}", path.display()))?;
        let backend = Self::from_json(&json)?;
        info!(users = backend.users.len(), "users loaded");
        Ok(backend)
    }

    /// TOTP secrets provisioned in the users file.
    #[must_use]
    pub fn totp_secrets(&self) -> Vec<(String, Vec<u8>)> {
        self.users
            .iter()
            .filter_map(|(name, user)| {
                user.totp_secret.clone().map(|secret| (name.clone(), secret))
            })
            .collect()
    }
}

#[async_trait]
impl CredentialBackend for StaticUserBackend {
    async fn check_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<UserDetails>> {
        let user = self.users.get(username);
        // Unknown users still pay for a full hash verification.
        let stored_hash = user.map_or(&self.dummy_hash, |user| &user.password_hash).clone();
        let presented = SecretString::from(password.expose_secret().to_string());
        let matches =
            tokio::task::spawn_blocking(move || verify_password(&presented, &stored_hash))
                .await
                .map_err(|err| {
                    error!("Password verification task failed: {err}");
                    AuthError::StoreUnavailable
                })?;

        match user {
            Some(user) if user.disabled => {
                debug!(username, "login for disabled user");
                Ok(None)
            }
            Some(user) if matches => Ok(Some(user.details.clone())),
            _ => Ok(None),
        }
    }
}
