use clap::{Arg, ArgAction, ArgMatches, Command};
use url::Url;

pub const ARG_TOTP_ISSUER: &str = "totp-issuer";
pub const ARG_DISABLE_TOTP: &str = "disable-totp";
pub const ARG_DISABLE_WEBAUTHN: &str = "disable-webauthn";
pub const ARG_PUSH_URL: &str = "push-url";
pub const ARG_PUSH_TIMEOUT: &str = "push-timeout-seconds";
pub const ARG_CEREMONY_TTL: &str = "ceremony-ttl-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub totp_issuer: String,
    pub totp_enabled: bool,
    pub webauthn_enabled: bool,
    /// Push approval service; push is disabled without it.
    pub push_url: Option<Url>,
    pub push_timeout_seconds: u64,
    pub ceremony_ttl_seconds: i64,
}

impl Options {
    /// Parse second-factor arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the push URL is not a valid URL.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let push_url = matches
            .get_one::<String>(ARG_PUSH_URL)
            .filter(|v| !v.trim().is_empty())
            .map(|value| {
                Url::parse(value).map_err(|err| anyhow::anyhow!("invalid --{ARG_PUSH_URL}: {err}"))
            })
            .transpose()?;

        Ok(Self {
            totp_issuer: matches
                .get_one::<String>(ARG_TOTP_ISSUER)
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            totp_enabled: !matches.get_flag(ARG_DISABLE_TOTP),
            webauthn_enabled: !matches.get_flag(ARG_DISABLE_WEBAUTHN),
            push_url,
            push_timeout_seconds: matches
                .get_one::<u64>(ARG_PUSH_TIMEOUT)
                .copied()
                .unwrap_or(60),
            ceremony_ttl_seconds: matches
                .get_one::<i64>(ARG_CEREMONY_TTL)
                .copied()
                .unwrap_or(crate::ceremony::token::DEFAULT_TOKEN_TTL_SECONDS),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer shown by authenticator apps")
                .env("AUTHGATE_TOTP_ISSUER")
                .default_value(env!("CARGO_PKG_NAME")),
        )
        .arg(
            Arg::new(ARG_DISABLE_TOTP)
                .long(ARG_DISABLE_TOTP)
                .help("Disable one-time code second factor")
                .env("AUTHGATE_DISABLE_TOTP")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_DISABLE_WEBAUTHN)
                .long(ARG_DISABLE_WEBAUTHN)
                .help("Disable security key second factor")
                .env("AUTHGATE_DISABLE_WEBAUTHN")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_PUSH_URL)
                .long(ARG_PUSH_URL)
                .help("Base URL of the push approval service")
                .env("AUTHGATE_PUSH_URL"),
        )
        .arg(
            Arg::new(ARG_PUSH_TIMEOUT)
                .long(ARG_PUSH_TIMEOUT)
                .help("Seconds to wait for a push approval")
                .env("AUTHGATE_PUSH_TIMEOUT_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CEREMONY_TTL)
                .long(ARG_CEREMONY_TTL)
                .help("Lifetime of a started step-up ceremony in seconds")
                .env("AUTHGATE_CEREMONY_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}
