//! # authgate
//!
//! Forward-auth gateway. A reverse proxy asks `GET /api/verify` about every
//! request; the gateway answers allow, redirect-to-login, or deny, and on
//! allow hands back identity headers for the upstream application.
//!
//! ## Trust levels
//!
//! A session moves from anonymous to first factor (password) to second
//! factor (TOTP, security key, or push approval). Rules are evaluated in
//! order and the first one matching both the request and the session decides
//! the required level; a session below it is sent to the login portal.
//!
//! ## Step-up ceremonies
//!
//! Second factors are registered and proven through short-lived, single-use
//! ceremony tokens bound to the principal, the method, and the operation.
//! Every failure reads "invalid or expired" to the caller.
//!
//! ## Login timing
//!
//! Password checks are padded to a percentile of recent successful check
//! latencies, so response time does not reveal whether a user exists or a
//! password was right.

pub mod access;
pub mod api;
pub mod ceremony;
pub mod cli;
pub mod credentials;
pub mod error;
pub mod session;
pub mod timing;
pub mod verify;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
