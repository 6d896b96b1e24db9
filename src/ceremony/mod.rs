//! Step-up ceremony state machine.
//!
//! Flow Overview:
//! 1) `start`: the caller must already hold a first factor. A fresh token is
//!    minted, the method verifier produces the challenge, and the token
//!    atomically replaces any outstanding one for the same (principal, method,
//!    operation).
//! 2) `finish`: the token is taken atomically (single use), then the method
//!    verifier checks the proof.
//! 3) A successful authentication raises the session to `Second` through a
//!    compare-and-swap; a successful registration stores the credential.
//!
//! States: `Idle -> Started -> Finished(success) | Finished(failure) | Expired`.
//!
//! Security boundaries: every verification failure surfaces as
//! `InvalidOrExpiredToken`; the precise cause is only logged. Failures leave
//! the session untouched and nothing is retried here.

pub mod possession;
pub mod push;
pub mod token;
pub mod totp;

pub use possession::PossessionVerifier;
pub use push::{HttpPushApprover, PushApprover, PushStatus, PushVerifier};
pub use token::{CeremonyToken, CeremonyTokenStore, MemoryTokenStore};
pub use totp::TotpVerifier;

use crate::{
    error::{AuthError, Result},
    session::{FactorLevel, IdentitySession, SecondFactorMethod, SessionStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

const MAX_UPGRADE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Register,
    Authenticate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => f.write_str("register"),
            Self::Authenticate => f.write_str("authenticate"),
        }
    }
}

/// What a token was minted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Purpose {
    pub method: SecondFactorMethod,
    pub operation: Operation,
}

impl Purpose {
    #[must_use]
    pub fn new(method: SecondFactorMethod, operation: Operation) -> Self {
        Self { method, operation }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CeremonyState {
    Idle,
    Started,
    Finished { success: bool },
    Expired,
}

/// Method-specific challenge returned by `start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Challenge {
    /// Enter the current code. Registration also carries the new secret.
    Totp {
        secret: Option<String>,
        otpauth_url: Option<String>,
    },
    /// Sign `challenge` with a registered (or the new) credential.
    Possession {
        challenge: String,
        credential_ids: Vec<String>,
    },
    /// An approval request was sent out of band.
    Push { transaction: String },
}

/// Proof submitted to `finish`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proof {
    Code {
        code: String,
    },
    Registration {
        credential_id: String,
        public_key: String,
        signature: String,
    },
    Assertion {
        credential_id: String,
        counter: u32,
        signature: String,
    },
    Approval,
}

/// Verifier result. `Rejected` carries the internal cause for logs only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(&'static str),
}

/// Capability each second-factor method plugs into the state machine.
#[async_trait]
pub trait FactorVerifier: Send + Sync {
    fn method(&self) -> SecondFactorMethod;

    async fn is_registered(&self, subject: &str) -> Result<bool>;

    /// Whether a subject may enroll more than one credential.
    fn allows_multiple(&self) -> bool {
        false
    }

    /// Produce the method state stored in the token and the client challenge.
    async fn begin(&self, token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)>;

    /// Check `proof` against the consumed token. Registration proofs persist
    /// the new credential on success.
    async fn verify(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict>;
}

/// Result of a successful `start`.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct StartedCeremony {
    pub token: String,
    pub method: SecondFactorMethod,
    pub operation: Operation,
    pub expires_at: DateTime<Utc>,
    pub challenge: Challenge,
}

pub struct Ceremonies {
    verifiers: HashMap<SecondFactorMethod, Arc<dyn FactorVerifier>>,
    tokens: Arc<dyn CeremonyTokenStore>,
    sessions: Arc<dyn SessionStore>,
    token_ttl: Duration,
}

impl Ceremonies {
    #[must_use]
    pub fn new(tokens: Arc<dyn CeremonyTokenStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            verifiers: HashMap::new(),
            tokens,
            sessions,
            token_ttl: Duration::seconds(token::DEFAULT_TOKEN_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn FactorVerifier>) -> Self {
        self.verifiers.insert(verifier.method(), verifier);
        self
    }

    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn is_enabled(&self, method: SecondFactorMethod) -> bool {
        self.verifiers.contains_key(&method)
    }

    /// Methods with a verifier configured, in stable order.
    #[must_use]
    pub fn enabled_methods(&self) -> Vec<SecondFactorMethod> {
        SecondFactorMethod::ALL
            .into_iter()
            .filter(|method| self.is_enabled(*method))
            .collect()
    }

    /// Drop every outstanding ceremony of `subject`.
    ///
    /// # Errors
    /// Returns store failures.
    pub async fn abandon(&self, subject: &str) -> Result<usize> {
        let mut dropped = 0;
        for method in self.verifiers.keys() {
            for operation in [Operation::Register, Operation::Authenticate] {
                dropped += self.tokens.invalidate_all(subject, *method, operation).await?;
            }
        }
        Ok(dropped)
    }

    fn verifier(&self, method: SecondFactorMethod) -> Result<&Arc<dyn FactorVerifier>> {
        self.verifiers.get(&method).ok_or(AuthError::MethodDisabled)
    }

    /// Begin a ceremony for the session's principal.
    ///
    /// # Errors
    /// `Unauthenticated` without a first factor, `MethodDisabled`,
    /// `AlreadyRegistered`/`NotRegistered` per operation,
    /// `InsufficientFactor` when enrolling an additional credential without a
    /// second factor, or store failures.
    #[instrument(skip(self, session), fields(principal = session.principal.as_deref()))]
    pub async fn start(
        &self,
        session: &IdentitySession,
        method: SecondFactorMethod,
        operation: Operation,
    ) -> Result<StartedCeremony> {
        self.try_start(session, method, operation)
            .await
            .inspect_err(|err| {
                debug!(state = ?CeremonyState::Idle, %err, "ceremony not started");
            })
    }

    async fn try_start(
        &self,
        session: &IdentitySession,
        method: SecondFactorMethod,
        operation: Operation,
    ) -> Result<StartedCeremony> {
        let subject = require_first_factor(session)?;
        let verifier = self.verifier(method)?;

        let registered = verifier.is_registered(subject).await?;
        match operation {
            Operation::Register if registered && !verifier.allows_multiple() => {
                return Err(AuthError::AlreadyRegistered)
            }
            // Another credential may only be added by someone who proved one.
            Operation::Register if registered && session.factor_level < FactorLevel::Second => {
                return Err(AuthError::InsufficientFactor)
            }
            Operation::Authenticate if !registered => return Err(AuthError::NotRegistered),
            _ => {}
        }

        let mut token = CeremonyToken::issue(
            subject,
            Purpose::new(method, operation),
            Vec::new(),
            self.token_ttl,
            Utc::now(),
        )?;
        let (state, challenge) = verifier.begin(&token).await?;
        token.challenge = state;

        let started = StartedCeremony {
            token: token.nonce.clone(),
            method,
            operation,
            expires_at: token.expires_at,
            challenge,
        };
        let id = token.id;
        // Overlapping starts race here; whichever lands last stays valid.
        let dropped = self.tokens.replace(token).await?;
        if dropped > 0 {
            debug!("invalidated {} outstanding ceremony tokens", dropped);
        }

        info!(token = %id, state = ?CeremonyState::Started, "ceremony started");
        Ok(started)
    }

    /// Complete a ceremony. `session_key` addresses the stored session that
    /// `session` was loaded from.
    ///
    /// # Errors
    /// `InvalidOrExpiredToken` for any token or proof failure,
    /// `ExternalDenied`/`Timeout` from out-of-band approval, or store failures.
    #[instrument(
        skip(self, session, nonce, proof),
        fields(principal = session.principal.as_deref())
    )]
    pub async fn finish(
        &self,
        session_key: &str,
        session: &IdentitySession,
        purpose: Purpose,
        nonce: &str,
        proof: &Proof,
    ) -> Result<IdentitySession> {
        let subject = require_first_factor(session)?;
        let verifier = self.verifier(purpose.method)?;

        let Some(token) = self.tokens.take_if_valid(nonce, subject, purpose).await? else {
            info!(state = ?CeremonyState::Expired, "ceremony token missing or expired");
            return Err(AuthError::InvalidOrExpiredToken);
        };

        match verifier.verify(&token, proof).await? {
            Verdict::Accepted => {}
            Verdict::Rejected(reason) => {
                debug!(token = %token.id, reason, "ceremony proof rejected");
                info!(
                    token = %token.id,
                    state = ?CeremonyState::Finished { success: false },
                    "ceremony failed"
                );
                return Err(AuthError::InvalidOrExpiredToken);
            }
        }

        info!(
            token = %token.id,
            state = ?CeremonyState::Finished { success: true },
            "ceremony finished"
        );

        match purpose.operation {
            Operation::Register => Ok(session.clone()),
            Operation::Authenticate => {
                self.persist_upgrade(session_key, session, purpose.method)
                    .await
            }
        }
    }

    /// Raise the stored session, merging into concurrent writes.
    async fn persist_upgrade(
        &self,
        session_key: &str,
        session: &IdentitySession,
        method: SecondFactorMethod,
    ) -> Result<IdentitySession> {
        let mut current = session.clone();
        for _ in 0..MAX_UPGRADE_ATTEMPTS {
            let upgraded = current.upgraded(method, Utc::now());
            if self
                .sessions
                .compare_and_swap(session_key, &current, &upgraded)
                .await?
            {
                let mut stored = upgraded;
                stored.revision = current.revision + 1;
                return Ok(stored);
            }

            debug!("session changed concurrently, merging upgrade");
            current = match self.sessions.load(session_key).await? {
                Some(latest)
                    if latest.principal == session.principal
                        && !latest.is_expired(Utc::now()) =>
                {
                    latest
                }
                _ => return Err(AuthError::Unauthenticated),
            };
        }
        warn!("gave up upgrading session after {MAX_UPGRADE_ATTEMPTS} attempts");
        Err(AuthError::StoreUnavailable)
    }
}

fn require_first_factor(session: &IdentitySession) -> Result<&str> {
    match session.principal.as_deref() {
        Some(subject) if session.factor_level >= FactorLevel::First => Ok(subject),
        _ => Err(AuthError::Unauthenticated),
    }
}

#[cfg(test)]
mod tests;
