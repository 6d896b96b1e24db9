//! Possession-proof credentials (WebAuthn-style) backed by Ed25519 keys.
//!
//! Authentication signs `challenge || counter` where `counter` is a big-endian
//! u32 that must strictly increase per credential. A valid signature with a
//! stale counter means the key was cloned: the credential is marked
//! compromised and refuses every later assertion.

use super::{CeremonyToken, Challenge, FactorVerifier, Operation, Proof, Verdict};
use crate::{
    error::{AuthError, Result},
    session::SecondFactorMethod,
};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const CHALLENGE_BYTES: usize = 32;
const MAX_CREDENTIALS: usize = 10;

#[derive(Clone, Debug)]
pub struct PossessionCredential {
    pub id: String,
    pub public_key: VerifyingKey,
    pub counter: u32,
    pub compromised: bool,
}

#[derive(Default)]
pub struct PossessionVerifier {
    credentials: Mutex<HashMap<String, Vec<PossessionCredential>>>,
}

impl PossessionVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of one credential.
    pub async fn credential(&self, subject: &str, id: &str) -> Option<PossessionCredential> {
        self.credentials
            .lock()
            .await
            .get(subject)
            .and_then(|list| list.iter().find(|cred| cred.id == id).cloned())
    }

    async fn register(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        let Proof::Registration {
            credential_id,
            public_key,
            signature,
        } = proof
        else {
            return Ok(Verdict::Rejected("proof type mismatch"));
        };
        let Some(public_key) = decode_key(public_key) else {
            return Ok(Verdict::Rejected("public key encoding"));
        };
        let Some(signature) = decode_signature(signature) else {
            return Ok(Verdict::Rejected("signature encoding"));
        };
        if public_key.verify_strict(&token.challenge, &signature).is_err() {
            return Ok(Verdict::Rejected("registration signature"));
        }

        let mut credentials = self.credentials.lock().await;
        let list = credentials.entry(token.subject.clone()).or_default();
        if list.iter().any(|cred| &cred.id == credential_id) {
            return Ok(Verdict::Rejected("credential id in use"));
        }
        if list.len() >= MAX_CREDENTIALS {
            return Ok(Verdict::Rejected("too many credentials"));
        }
        list.push(PossessionCredential {
            id: credential_id.clone(),
            public_key,
            counter: 0,
            compromised: false,
        });
        info!(
            subject = %token.subject,
            credential = %credential_id,
            "possession credential registered"
        );
        Ok(Verdict::Accepted)
    }

    async fn authenticate(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        let Proof::Assertion {
            credential_id,
            counter,
            signature,
        } = proof
        else {
            return Ok(Verdict::Rejected("proof type mismatch"));
        };
        let Some(signature) = decode_signature(signature) else {
            return Ok(Verdict::Rejected("signature encoding"));
        };

        let mut credentials = self.credentials.lock().await;
        let Some(credential) = credentials
            .get_mut(&token.subject)
            .and_then(|list| list.iter_mut().find(|cred| &cred.id == credential_id))
        else {
            return Ok(Verdict::Rejected("unknown credential"));
        };
        if credential.compromised {
            return Ok(Verdict::Rejected("credential compromised"));
        }

        let mut message = token.challenge.clone();
        message.extend_from_slice(&counter.to_be_bytes());
        if credential
            .public_key
            .verify_strict(&message, &signature)
            .is_err()
        {
            return Ok(Verdict::Rejected("assertion signature"));
        }

        if *counter <= credential.counter {
            credential.compromised = true;
            warn!(
                subject = %token.subject,
                credential = %credential.id,
                stored = credential.counter,
                presented = counter,
                "signature counter did not increase, credential marked compromised"
            );
            return Ok(Verdict::Rejected("counter regression"));
        }
        credential.counter = *counter;
        Ok(Verdict::Accepted)
    }
}

fn decode_key(encoded: &str) -> Option<VerifyingKey> {
    let bytes = Base64UrlUnpadded::decode_vec(encoded).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(encoded: &str) -> Option<Signature> {
    let bytes = Base64UrlUnpadded::decode_vec(encoded).ok()?;
    Signature::from_slice(&bytes).ok()
}

#[async_trait]
impl FactorVerifier for PossessionVerifier {
    fn method(&self) -> SecondFactorMethod {
        SecondFactorMethod::Webauthn
    }

    async fn is_registered(&self, subject: &str) -> Result<bool> {
        Ok(self
            .credentials
            .lock()
            .await
            .get(subject)
            .is_some_and(|list| list.iter().any(|cred| !cred.compromised)))
    }

    fn allows_multiple(&self) -> bool {
        true
    }

    async fn begin(&self, token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        let mut challenge = vec![0u8; CHALLENGE_BYTES];
        OsRng.try_fill_bytes(&mut challenge).map_err(|err| {
            error!("Failed to generate possession challenge: {err}");
            AuthError::StoreUnavailable
        })?;

        let credentials = self.credentials.lock().await;
        let list = credentials.get(&token.subject);
        let credential_ids = match token.purpose.operation {
            Operation::Register => {
                if list.is_some_and(|list| list.len() >= MAX_CREDENTIALS) {
                    return Err(AuthError::AlreadyRegistered);
                }
                Vec::new()
            }
            Operation::Authenticate => list
                .map(|list| {
                    list.iter()
                        .filter(|cred| !cred.compromised)
                        .map(|cred| cred.id.clone())
                        .collect()
                })
                .unwrap_or_default(),
        };
        drop(credentials);

        let encoded = Base64UrlUnpadded::encode_string(&challenge);
        Ok((
            challenge,
            Challenge::Possession {
                challenge: encoded,
                credential_ids,
            },
        ))
    }

    async fn verify(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        match token.purpose.operation {
            Operation::Register => self.register(token, proof).await,
            Operation::Authenticate => self.authenticate(token, proof).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::Purpose;
    use chrono::{Duration, Utc};
    use ed25519_dalek::{Signer, SigningKey};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn token(operation: Operation, challenge: &[u8]) -> CeremonyToken {
        CeremonyToken::issue(
            "alice",
            Purpose::new(SecondFactorMethod::Webauthn, operation),
            challenge.to_vec(),
            Duration::seconds(60),
            Utc::now(),
        )
        .unwrap()
    }

    fn assertion(challenge: &[u8], counter: u32) -> Proof {
        let mut message = challenge.to_vec();
        message.extend_from_slice(&counter.to_be_bytes());
        Proof::Assertion {
            credential_id: "key-1".to_string(),
            counter,
            signature: Base64UrlUnpadded::encode_string(&key().sign(&message).to_bytes()),
        }
    }

    fn registration(id: &str, key: &SigningKey, challenge: &[u8]) -> Proof {
        Proof::Registration {
            credential_id: id.to_string(),
            public_key: Base64UrlUnpadded::encode_string(key.verifying_key().as_bytes()),
            signature: Base64UrlUnpadded::encode_string(&key.sign(challenge).to_bytes()),
        }
    }

    async fn registered() -> PossessionVerifier {
        let verifier = PossessionVerifier::new();
        let challenge = b"registration-challenge";
        let verdict = verifier
            .verify(
                &token(Operation::Register, challenge),
                &registration("key-1", &key(), challenge),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);
        verifier
    }

    #[tokio::test]
    async fn registration_requires_proof_of_key() {
        let verifier = PossessionVerifier::new();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let proof = Proof::Registration {
            credential_id: "key-1".to_string(),
            public_key: Base64UrlUnpadded::encode_string(key().verifying_key().as_bytes()),
            signature: Base64UrlUnpadded::encode_string(&other.sign(b"c").to_bytes()),
        };
        let verdict = verifier
            .verify(&token(Operation::Register, b"c"), &proof)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("registration signature"));
        assert!(!verifier.is_registered("alice").await.unwrap());
    }

    #[tokio::test]
    async fn increasing_counter_is_accepted() {
        let verifier = registered().await;
        assert!(verifier.is_registered("alice").await.unwrap());
        for counter in [1, 2, 10] {
            let verdict = verifier
                .verify(&token(Operation::Authenticate, b"c"), &assertion(b"c", counter))
                .await
                .unwrap();
            assert_eq!(verdict, Verdict::Accepted);
        }
        assert_eq!(verifier.credential("alice", "key-1").await.unwrap().counter, 10);
    }

    #[tokio::test]
    async fn stale_counter_marks_credential_compromised() {
        let verifier = registered().await;
        let verdict = verifier
            .verify(&token(Operation::Authenticate, b"c"), &assertion(b"c", 5))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);

        let verdict = verifier
            .verify(&token(Operation::Authenticate, b"d"), &assertion(b"d", 5))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("counter regression"));
        assert!(verifier.credential("alice", "key-1").await.unwrap().compromised);

        // Even a fresh counter is refused once compromised.
        let verdict = verifier
            .verify(&token(Operation::Authenticate, b"e"), &assertion(b"e", 6))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("credential compromised"));
        assert!(!verifier.is_registered("alice").await.unwrap());
    }

    #[tokio::test]
    async fn signature_over_other_challenge_is_rejected() {
        let verifier = registered().await;
        let verdict = verifier
            .verify(&token(Operation::Authenticate, b"c"), &assertion(b"other", 1))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("assertion signature"));
        assert!(!verifier.credential("alice", "key-1").await.unwrap().compromised);
    }

    #[tokio::test]
    async fn begin_lists_usable_credentials() {
        let verifier = registered().await;
        let (challenge, client) = verifier
            .begin(&token(Operation::Authenticate, b""))
            .await
            .unwrap();
        assert_eq!(challenge.len(), CHALLENGE_BYTES);
        let Challenge::Possession { credential_ids, .. } = client else {
            panic!("expected possession challenge");
        };
        assert_eq!(credential_ids, vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn additional_keys_up_to_the_cap() {
        let verifier = registered().await;
        assert!(verifier.allows_multiple());

        for n in 2..=MAX_CREDENTIALS {
            let id = format!("key-{n}");
            let extra = SigningKey::from_bytes(&[u8::try_from(n + 100).unwrap(); 32]);
            let verdict = verifier
                .verify(&token(Operation::Register, b"r"), &registration(&id, &extra, b"r"))
                .await
                .unwrap();
            assert_eq!(verdict, Verdict::Accepted);
        }

        let (_, client) = verifier
            .begin(&token(Operation::Authenticate, b""))
            .await
            .unwrap();
        let Challenge::Possession { credential_ids, .. } = client else {
            panic!("expected possession challenge");
        };
        assert_eq!(credential_ids.len(), MAX_CREDENTIALS);

        let err = verifier
            .begin(&token(Operation::Register, b""))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::AlreadyRegistered);
    }
}
