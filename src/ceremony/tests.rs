use super::*;
use crate::session::{MemorySessionStore, SessionConfig, UserDetails};
use std::time::Duration as StdDuration;

/// Accepts `Proof::Code { code: "ok" }` and nothing else.
struct StaticVerifier {
    method: SecondFactorMethod,
    registered: bool,
}

#[async_trait]
impl FactorVerifier for StaticVerifier {
    fn method(&self) -> SecondFactorMethod {
        self.method
    }

    async fn is_registered(&self, _subject: &str) -> Result<bool> {
        Ok(self.registered)
    }

    async fn begin(&self, _token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        Ok((
            Vec::new(),
            Challenge::Totp {
                secret: None,
                otpauth_url: None,
            },
        ))
    }

    async fn verify(&self, _token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        match proof {
            Proof::Code { code } if code == "ok" => Ok(Verdict::Accepted),
            _ => Ok(Verdict::Rejected("bad code")),
        }
    }
}

/// Delays `begin` so two starts overlap.
struct SlowBegin(StaticVerifier);

#[async_trait]
impl FactorVerifier for SlowBegin {
    fn method(&self) -> SecondFactorMethod {
        self.0.method()
    }

    async fn is_registered(&self, subject: &str) -> Result<bool> {
        self.0.is_registered(subject).await
    }

    async fn begin(&self, token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        self.0.begin(token).await
    }

    async fn verify(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        self.0.verify(token, proof).await
    }
}

/// Registered, and open to further enrollments.
struct MultiKey;

#[async_trait]
impl FactorVerifier for MultiKey {
    fn method(&self) -> SecondFactorMethod {
        SecondFactorMethod::Webauthn
    }

    async fn is_registered(&self, _subject: &str) -> Result<bool> {
        Ok(true)
    }

    fn allows_multiple(&self) -> bool {
        true
    }

    async fn begin(&self, _token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        Ok((
            Vec::new(),
            Challenge::Possession {
                challenge: String::new(),
                credential_ids: Vec::new(),
            },
        ))
    }

    async fn verify(&self, _token: &CeremonyToken, _proof: &Proof) -> Result<Verdict> {
        Ok(Verdict::Accepted)
    }
}

struct Fixture {
    ceremonies: Arc<Ceremonies>,
    sessions: Arc<MemorySessionStore>,
    tokens: Arc<MemoryTokenStore>,
    key: String,
    session: IdentitySession,
}

async fn fixture(registered: bool) -> Fixture {
    let sessions = Arc::new(MemorySessionStore::new());
    let tokens = Arc::new(MemoryTokenStore::new());
    let ceremonies = Ceremonies::new(tokens.clone(), sessions.clone()).with_verifier(Arc::new(
        StaticVerifier {
            method: SecondFactorMethod::Totp,
            registered,
        },
    ));

    let user = UserDetails {
        username: "alice".to_string(),
        ..UserDetails::default()
    };
    let session = IdentitySession::first_factor(&user, false, &SessionConfig::new(), Utc::now());
    let key = "session-key".to_string();
    sessions
        .save(&key, &session, StdDuration::from_secs(300))
        .await
        .unwrap();
    let session = sessions.load(&key).await.unwrap().unwrap();

    Fixture {
        ceremonies: Arc::new(ceremonies),
        sessions,
        tokens,
        key,
        session,
    }
}

fn authenticate() -> Purpose {
    Purpose::new(SecondFactorMethod::Totp, Operation::Authenticate)
}

fn ok() -> Proof {
    Proof::Code {
        code: "ok".to_string(),
    }
}

#[tokio::test]
async fn start_requires_first_factor() {
    let fx = fixture(true).await;
    let anonymous = IdentitySession::anonymous(Utc::now());
    let err = fx
        .ceremonies
        .start(&anonymous, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Unauthenticated);
}

#[tokio::test]
async fn start_rejects_disabled_method() {
    let fx = fixture(true).await;
    let err = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Push, Operation::Authenticate)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::MethodDisabled);
    assert_eq!(fx.ceremonies.enabled_methods(), vec![SecondFactorMethod::Totp]);
}

#[tokio::test]
async fn start_checks_registration_state() {
    let fx = fixture(false).await;
    let err = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::NotRegistered);

    let fx = fixture(true).await;
    let err = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Register)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::AlreadyRegistered);
}

#[tokio::test]
async fn additional_credential_needs_second_factor() {
    let fx = fixture(true).await;
    let ceremonies = Ceremonies::new(fx.tokens.clone(), fx.sessions.clone())
        .with_verifier(Arc::new(MultiKey));

    let err = ceremonies
        .start(&fx.session, SecondFactorMethod::Webauthn, Operation::Register)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InsufficientFactor);

    let stepped_up = fx.session.upgraded(SecondFactorMethod::Webauthn, Utc::now());
    let started = ceremonies
        .start(&stepped_up, SecondFactorMethod::Webauthn, Operation::Register)
        .await
        .unwrap();
    assert_eq!(started.operation, Operation::Register);
}

#[tokio::test]
async fn restarting_invalidates_previous_token() {
    let fx = fixture(true).await;
    let first = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    let second = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    assert_ne!(first.token, second.token);
    assert_eq!(fx.tokens.len().await, 1);

    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &first.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);

    let upgraded = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &second.token, &ok())
        .await
        .unwrap();
    assert_eq!(upgraded.factor_level, FactorLevel::Second);
}

#[tokio::test]
async fn overlapping_starts_leave_one_valid_challenge() {
    let fx = fixture(true).await;
    let ceremonies = Ceremonies::new(fx.tokens.clone(), fx.sessions.clone()).with_verifier(
        Arc::new(SlowBegin(StaticVerifier {
            method: SecondFactorMethod::Totp,
            registered: true,
        })),
    );

    let (first, second) = tokio::join!(
        ceremonies.start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate),
        ceremonies.start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(fx.tokens.len().await, 1);

    let mut successes = 0;
    for started in [first, second] {
        if ceremonies
            .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
            .await
            .is_ok()
        {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn abandon_drops_outstanding_ceremonies() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    assert_eq!(fx.ceremonies.abandon("alice").await.unwrap(), 1);

    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);
}

#[tokio::test]
async fn finish_upgrades_stored_session() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    let returned = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap();

    let stored = fx.sessions.load(&fx.key).await.unwrap().unwrap();
    assert_eq!(stored, returned);
    assert_eq!(stored.factor_level, FactorLevel::Second);
    assert!(stored.has_method(SecondFactorMethod::Totp));
}

#[tokio::test]
async fn wrong_proof_consumes_token_and_keeps_session() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    let bad = Proof::Code {
        code: "nope".to_string(),
    };
    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &bad)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);
    assert_eq!(err.public_message(), "Invalid or expired");

    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);

    let stored = fx.sessions.load(&fx.key).await.unwrap().unwrap();
    assert_eq!(stored.factor_level, FactorLevel::First);
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let fx = fixture(true).await;
    let ceremonies = Ceremonies::new(fx.tokens.clone(), fx.sessions.clone())
        .with_verifier(Arc::new(StaticVerifier {
            method: SecondFactorMethod::Totp,
            registered: true,
        }))
        .with_token_ttl(Duration::seconds(-1));
    let started = ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    let err = ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);
}

#[tokio::test]
async fn token_is_bound_to_operation() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    let register = Purpose::new(SecondFactorMethod::Totp, Operation::Register);
    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, register, &started.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidOrExpiredToken);
}

#[tokio::test]
async fn registration_does_not_upgrade_session() {
    let fx = fixture(false).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Register)
        .await
        .unwrap();
    let register = Purpose::new(SecondFactorMethod::Totp, Operation::Register);
    let session = fx
        .ceremonies
        .finish(&fx.key, &fx.session, register, &started.token, &ok())
        .await
        .unwrap();
    assert_eq!(session.factor_level, FactorLevel::First);
    let stored = fx.sessions.load(&fx.key).await.unwrap().unwrap();
    assert_eq!(stored.factor_level, FactorLevel::First);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_finishers_succeed_exactly_once() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ceremonies = fx.ceremonies.clone();
        let key = fx.key.clone();
        let session = fx.session.clone();
        let nonce = started.token.clone();
        handles.push(tokio::spawn(async move {
            ceremonies
                .finish(&key, &session, authenticate(), &nonce, &ok())
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(err) => assert_eq!(err, AuthError::InvalidOrExpiredToken),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn upgrade_merges_into_concurrent_write() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();

    // Another request touches the session after this one loaded it.
    let mut touched = fx.session.clone();
    touched.last_activity = Utc::now();
    fx.sessions
        .save(&fx.key, &touched, StdDuration::from_secs(300))
        .await
        .unwrap();

    let upgraded = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap();
    assert_eq!(upgraded.factor_level, FactorLevel::Second);
    assert_eq!(upgraded.revision, fx.session.revision + 2);
    let stored = fx.sessions.load(&fx.key).await.unwrap().unwrap();
    assert_eq!(stored.factor_level, FactorLevel::Second);
}

#[tokio::test]
async fn upgrade_fails_when_session_vanished() {
    let fx = fixture(true).await;
    let started = fx
        .ceremonies
        .start(&fx.session, SecondFactorMethod::Totp, Operation::Authenticate)
        .await
        .unwrap();
    fx.sessions.delete(&fx.key).await.unwrap();
    let err = fx
        .ceremonies
        .finish(&fx.key, &fx.session, authenticate(), &started.token, &ok())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Unauthenticated);
}
