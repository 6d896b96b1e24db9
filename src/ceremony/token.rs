//! Ceremony tokens and their store.
//!
//! A token is consumed exactly once: `take_if_valid` removes it under the
//! same lock that checks it. Tokens presented for the wrong subject or
//! purpose stay in place so a foreign caller cannot burn someone's challenge.

use super::{Operation, Purpose};
use crate::{
    error::{AuthError, Result},
    session::SecondFactorMethod,
};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Mutex, time::interval};
use tracing::{debug, error};
use ulid::Ulid;

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 5 * 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CeremonyToken {
    pub id: Ulid,
    pub nonce: String,
    pub purpose: Purpose,
    pub subject: String,
    /// Method-specific state: a possession challenge or a pending TOTP secret.
    pub challenge: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CeremonyToken {
    /// Mint a token with a fresh 256-bit nonce.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the OS random source fails.
    pub fn issue(
        subject: &str,
        purpose: Purpose,
        challenge: Vec<u8>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes).map_err(|err| {
            error!("Failed to generate ceremony nonce: {err}");
            AuthError::StoreUnavailable
        })?;
        Ok(Self {
            id: Ulid::new(),
            nonce: Base64UrlUnpadded::encode_string(&bytes),
            purpose,
            subject: subject.to_string(),
            challenge,
            created_at: now,
            expires_at: now + ttl,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[async_trait]
pub trait CeremonyTokenStore: Send + Sync {
    async fn put(&self, token: CeremonyToken) -> Result<()>;

    /// Atomically remove and return the token if it is live and bound to
    /// `subject` and `purpose`.
    async fn take_if_valid(
        &self,
        nonce: &str,
        subject: &str,
        purpose: Purpose,
    ) -> Result<Option<CeremonyToken>>;

    /// Store `token` as the only live token for its (subject, method,
    /// operation) tuple, dropping the others under the same lock. Returns how
    /// many were dropped.
    async fn replace(&self, token: CeremonyToken) -> Result<usize>;

    /// Drop every outstanding token for the tuple. Returns how many were dropped.
    async fn invalidate_all(
        &self,
        subject: &str,
        method: SecondFactorMethod,
        operation: Operation,
    ) -> Result<usize>;

    /// Remove expired tokens. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, CeremonyToken>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[async_trait]
impl CeremonyTokenStore for MemoryTokenStore {
    async fn put(&self, token: CeremonyToken) -> Result<()> {
        self.tokens.lock().await.insert(token.nonce.clone(), token);
        Ok(())
    }

    async fn replace(&self, token: CeremonyToken) -> Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, existing| {
            !(existing.subject == token.subject && existing.purpose == token.purpose)
        });
        let dropped = before - tokens.len();
        tokens.insert(token.nonce.clone(), token);
        Ok(dropped)
    }

    async fn take_if_valid(
        &self,
        nonce: &str,
        subject: &str,
        purpose: Purpose,
    ) -> Result<Option<CeremonyToken>> {
        let mut tokens = self.tokens.lock().await;
        let Some(token) = tokens.get(nonce) else {
            return Ok(None);
        };
        if token.is_expired(Utc::now()) {
            debug!(token = %token.id, "ceremony token expired");
            tokens.remove(nonce);
            return Ok(None);
        }
        if token.subject != subject || token.purpose != purpose {
            debug!(token = %token.id, "ceremony token bound to another subject or purpose");
            return Ok(None);
        }
        Ok(tokens.remove(nonce))
    }

    async fn invalidate_all(
        &self,
        subject: &str,
        method: SecondFactorMethod,
        operation: Operation,
    ) -> Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, token| {
            !(token.subject == subject
                && token.purpose.method == method
                && token.purpose.operation == operation)
        });
        Ok(before - tokens.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired(now));
        Ok(before - tokens.len())
    }
}

/// Periodically drop expired tokens so abandoned ceremonies do not pile up.
pub fn spawn_sweeper(store: Arc<dyn CeremonyTokenStore>, every: std::time::Duration) {
    let mut ticker = interval(every);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!("purged {} expired ceremony tokens", removed),
                Err(err) => error!("Failed to purge ceremony tokens: {err}"),
            }
        }
    });
}
