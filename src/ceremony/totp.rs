//! Time-based one-time passwords (SHA-1, 6 digits, 30 second step).
//!
//! Codes are accepted for the current step and one step either side. The
//! last accepted step is remembered per subject so a code cannot be reused,
//! and neither can an older one once a newer code went through.

use super::{CeremonyToken, Challenge, FactorVerifier, Operation, Proof, Verdict};
use crate::{
    error::{AuthError, Result},
    session::SecondFactorMethod,
};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretSlice};
use std::collections::HashMap;
use subtle::{Choice, ConstantTimeEq};
use tokio::sync::Mutex;
use totp_rs::{Algorithm, TOTP};
use tracing::{error, info};

pub const DIGITS: usize = 6;
pub const STEP_SECONDS: u64 = 30;
pub const DRIFT_STEPS: u64 = 1;
const SECRET_BYTES: usize = 20;

pub struct TotpVerifier {
    issuer: String,
    secrets: Mutex<HashMap<String, SecretSlice<u8>>>,
    last_step: Mutex<HashMap<String, u64>>,
}

impl TotpVerifier {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            secrets: Mutex::new(HashMap::new()),
            last_step: Mutex::new(HashMap::new()),
        }
    }

    /// Store a secret for `subject`, replacing any previous one.
    pub async fn enroll(&self, subject: &str, secret: Vec<u8>) {
        self.secrets
            .lock()
            .await
            .insert(subject.to_string(), SecretSlice::from(secret));
        self.last_step.lock().await.remove(subject);
    }

    fn totp(&self, secret: Vec<u8>, subject: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            0,
            STEP_SECONDS,
            secret,
            Some(self.issuer.clone()),
            subject.to_string(),
        )
        .map_err(|err| {
            error!("TOTP init error: {err}");
            AuthError::MalformedRequest
        })
    }

    /// Match `code` against the drift window around `unix_time`.
    ///
    /// Returns the matching step. Every candidate is compared so the work
    /// does not depend on which step matched.
    fn matching_step(totp: &TOTP, code: &str, unix_time: u64) -> Option<u64> {
        let current = unix_time / STEP_SECONDS;
        let mut found = None;
        for step in current.saturating_sub(DRIFT_STEPS)..=current + DRIFT_STEPS {
            let expected = totp.generate(step * STEP_SECONDS);
            let matched: Choice = expected.as_bytes().ct_eq(code.as_bytes());
            if bool::from(matched) {
                found = Some(step);
            }
        }
        found
    }

    /// Check a code for a registered subject at `unix_time`, recording the step.
    async fn check_registered(&self, subject: &str, code: &str, unix_time: u64) -> Result<Verdict> {
        let secret = {
            let secrets = self.secrets.lock().await;
            match secrets.get(subject) {
                Some(secret) => secret.expose_secret().to_vec(),
                None => return Ok(Verdict::Rejected("no totp secret")),
            }
        };
        let totp = self.totp(secret, subject)?;
        let Some(step) = Self::matching_step(&totp, code, unix_time) else {
            return Ok(Verdict::Rejected("code mismatch"));
        };
        Ok(self.record_step(subject, step).await)
    }

    async fn record_step(&self, subject: &str, step: u64) -> Verdict {
        let mut last_step = self.last_step.lock().await;
        match last_step.get(subject) {
            Some(last) if *last >= step => Verdict::Rejected("code replayed"),
            _ => {
                last_step.insert(subject.to_string(), step);
                Verdict::Accepted
            }
        }
    }

    async fn check_registration(
        &self,
        token: &CeremonyToken,
        code: &str,
        unix_time: u64,
    ) -> Result<Verdict> {
        let totp = self.totp(token.challenge.clone(), &token.subject)?;
        let Some(step) = Self::matching_step(&totp, code, unix_time) else {
            return Ok(Verdict::Rejected("code mismatch"));
        };
        self.enroll(&token.subject, token.challenge.clone()).await;
        self.record_step(&token.subject, step).await;
        info!(subject = %token.subject, "totp credential registered");
        Ok(Verdict::Accepted)
    }

    async fn check(&self, token: &CeremonyToken, proof: &Proof, unix_time: u64) -> Result<Verdict> {
        let Proof::Code { code } = proof else {
            return Ok(Verdict::Rejected("proof type mismatch"));
        };
        let code = code.trim();
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Verdict::Rejected("code format"));
        }
        match token.purpose.operation {
            Operation::Register => self.check_registration(token, code, unix_time).await,
            Operation::Authenticate => self.check_registered(&token.subject, code, unix_time).await,
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[async_trait]
impl FactorVerifier for TotpVerifier {
    fn method(&self) -> SecondFactorMethod {
        SecondFactorMethod::Totp
    }

    async fn is_registered(&self, subject: &str) -> Result<bool> {
        Ok(self.secrets.lock().await.contains_key(subject))
    }

    async fn begin(&self, token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        match token.purpose.operation {
            Operation::Authenticate => Ok((
                Vec::new(),
                Challenge::Totp {
                    secret: None,
                    otpauth_url: None,
                },
            )),
            Operation::Register => {
                let mut secret = vec![0u8; SECRET_BYTES];
                OsRng.try_fill_bytes(&mut secret).map_err(|err| {
                    error!("Failed to generate TOTP secret: {err}");
                    AuthError::StoreUnavailable
                })?;
                let totp = self.totp(secret.clone(), &token.subject)?;
                Ok((
                    secret,
                    Challenge::Totp {
                        secret: Some(totp.get_secret_base32()),
                        otpauth_url: Some(totp.get_url()),
                    },
                ))
            }
        }
    }

    async fn verify(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        self.check(token, proof, unix_now()).await
    }
}
