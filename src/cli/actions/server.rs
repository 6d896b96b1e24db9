use crate::{
    access::{self, PolicyHandle, TrustedProxies},
    api::{self, AppState, CookieConfig},
    ceremony::{
        token::spawn_sweeper, Ceremonies, CeremonyTokenStore, HttpPushApprover,
        MemoryTokenStore, PossessionVerifier, PushVerifier, TotpVerifier,
    },
    cli::{
        commands::{factors, session},
        telemetry,
    },
    credentials::StaticUserBackend,
    session::{MemorySessionStore, SessionConfig, SessionStore},
    timing::{TimingConfig, TimingGate, DEFAULT_RECOMPUTE_INTERVAL},
    verify::Verifier,
};
use anyhow::Result;
use axum::http::HeaderName;
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PUSH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub login_url: Url,
    pub access_control_path: PathBuf,
    pub users_path: PathBuf,
    pub trusted_hops: NonZeroUsize,
    pub forwarded_header: HeaderName,
    pub session: session::Options,
    pub factors: factors::Options,
    pub timing: TimingConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the rule or users file cannot be loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let policy = Arc::new(PolicyHandle::new(access::config::load_file(
        &args.access_control_path,
    )?));
    let users = StaticUserBackend::load_file(&args.users_path)?;

    let session_config = SessionConfig::new()
        .with_expiration_seconds(args.session.expiration_seconds)
        .with_inactivity_seconds(args.session.inactivity_seconds)
        .with_remember_me_seconds(args.session.remember_me_seconds);
    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());

    let tokens: Arc<dyn CeremonyTokenStore> = Arc::new(MemoryTokenStore::new());
    spawn_sweeper(tokens.clone(), TOKEN_SWEEP_INTERVAL);

    let mut ceremonies = Ceremonies::new(tokens, sessions.clone())
        .with_token_ttl(chrono::Duration::seconds(args.factors.ceremony_ttl_seconds));
    if args.factors.totp_enabled {
        let totp = TotpVerifier::new(args.factors.totp_issuer.clone());
        for (subject, secret) in users.totp_secrets() {
            totp.enroll(&subject, secret).await;
        }
        ceremonies = ceremonies.with_verifier(Arc::new(totp));
    }
    if args.factors.webauthn_enabled {
        ceremonies = ceremonies.with_verifier(Arc::new(PossessionVerifier::new()));
    }
    if let Some(push_url) = &args.factors.push_url {
        let wait = Duration::from_secs(args.factors.push_timeout_seconds);
        let approver = HttpPushApprover::new(push_url.clone(), PUSH_REQUEST_TIMEOUT)?;
        let verifier = PushVerifier::new(Arc::new(approver)).with_wait(wait);
        ceremonies = ceremonies.with_verifier(Arc::new(verifier));
    }
    info!(methods = ?ceremonies.enabled_methods(), "second factors enabled");

    let timing = Arc::new(TimingGate::new(args.timing));
    timing.spawn_recompute(DEFAULT_RECOMPUTE_INTERVAL);

    let verifier = Verifier::new(
        policy.clone(),
        sessions.clone(),
        TrustedProxies::new(args.forwarded_header, args.trusted_hops),
        session_config.clone(),
        args.login_url,
    );

    let cookie = CookieConfig::new()
        .with_name(args.session.cookie_name)
        .with_secure(args.session.cookie_secure)
        .with_domain(args.session.cookie_domain);
    debug!(?cookie, "session cookie configured");

    let state = Arc::new(AppState {
        verifier,
        policy,
        sessions,
        ceremonies,
        credentials: Arc::new(users),
        timing,
        session_config,
        cookie,
        access_control_path: Some(args.access_control_path),
    });

    let result = api::new(args.port, state).await;
    telemetry::shutdown_tracer();
    result
}
