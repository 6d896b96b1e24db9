//! Command-line argument dispatch.
//!
//! Validated CLI matches are mapped to the server action with its full
//! configuration.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{
    factors, session, timing, ARG_ACCESS_CONTROL, ARG_FORWARDED_HEADER, ARG_LOGIN_URL, ARG_PORT,
    ARG_TRUSTED_HOPS, ARG_USERS,
};
use anyhow::{Context, Result};
use axum::http::HeaderName;
use std::{num::NonZeroUsize, path::PathBuf};
use url::Url;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(9091);

    let login_url = matches
        .get_one::<String>(ARG_LOGIN_URL)
        .context("missing required argument: --login-url")?;
    let login_url = Url::parse(login_url).context("invalid --login-url")?;

    let access_control_path = matches
        .get_one::<String>(ARG_ACCESS_CONTROL)
        .map(PathBuf::from)
        .context("missing required argument: --access-control")?;
    let users_path = matches
        .get_one::<String>(ARG_USERS)
        .map(PathBuf::from)
        .context("missing required argument: --users")?;

    let trusted_hops = matches
        .get_one::<u64>(ARG_TRUSTED_HOPS)
        .copied()
        .and_then(|hops| usize::try_from(hops).ok())
        .and_then(NonZeroUsize::new)
        .context("--trusted-hops must be a positive integer")?;
    let forwarded_header = matches
        .get_one::<String>(ARG_FORWARDED_HEADER)
        .map_or(crate::access::client_ip::DEFAULT_FORWARDED_HEADER, String::as_str);
    let forwarded_header = HeaderName::from_bytes(forwarded_header.to_ascii_lowercase().as_bytes())
        .context("invalid --forwarded-header")?;

    Ok(Action::Server(Args {
        port,
        login_url,
        access_control_path,
        users_path,
        trusted_hops,
        forwarded_header,
        session: session::Options::parse(matches)?,
        factors: factors::Options::parse(matches)?,
        timing: timing::parse(matches)?,
    }))
}
