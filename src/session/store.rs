//! Session persistence contract and the in-memory store.

use super::IdentitySession;
use crate::error::{AuthError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

/// Abstract session store.
///
/// `compare_and_swap` succeeds only when the stored `revision` equals the
/// expected one; the stored copy then carries `expected.revision + 1`. When
/// the new copy expires later than the stored one, the store TTL moves out by
/// the same amount.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<IdentitySession>>;

    async fn save(&self, key: &str, session: &IdentitySession, ttl: Duration) -> Result<()>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &IdentitySession,
        new: &IdentitySession,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

struct Entry {
    session: IdentitySession,
    deadline: Instant,
}

#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<IdentitySession>> {
        let mut entries = self.entries.lock().await;
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.deadline <= Instant::now());
        if expired {
            debug!("session entry reached its TTL");
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.session.clone()))
    }

    async fn save(&self, key: &str, session: &IdentitySession, ttl: Duration) -> Result<()> {
        let deadline = Instant::now()
            .checked_add(ttl)
            .ok_or(AuthError::MalformedRequest)?;
        let mut entries = self.entries.lock().await;
        let revision = entries
            .get(key)
            .map_or(session.revision, |entry| entry.session.revision + 1);
        let mut session = session.clone();
        session.revision = revision;
        entries.insert(key.to_string(), Entry { session, deadline });
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &IdentitySession,
        new: &IdentitySession,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.session.revision != expected.revision || entry.deadline <= Instant::now() {
            return Ok(false);
        }
        if let Ok(extension) = (new.expires_at - entry.session.expires_at).to_std() {
            entry.deadline = entry
                .deadline
                .checked_add(extension)
                .unwrap_or(entry.deadline);
        }
        let mut session = new.clone();
        session.revision = expected.revision + 1;
        entry.session = session;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
