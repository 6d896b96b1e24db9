use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_SESSION_EXPIRATION: &str = "session-expiration-seconds";
pub const ARG_SESSION_INACTIVITY: &str = "session-inactivity-seconds";
pub const ARG_REMEMBER_ME: &str = "remember-me-seconds";
pub const ARG_COOKIE_NAME: &str = "cookie-name";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_COOKIE_INSECURE: &str = "cookie-insecure";

#[derive(Debug, Clone)]
pub struct Options {
    pub expiration_seconds: i64,
    pub inactivity_seconds: i64,
    /// `None` disables remember-me.
    pub remember_me_seconds: Option<i64>,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
}

impl Options {
    /// Parse session and cookie arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the inactivity window exceeds the hard expiration.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let expiration_seconds = matches
            .get_one::<i64>(ARG_SESSION_EXPIRATION)
            .copied()
            .unwrap_or(3600);
        let inactivity_seconds = matches
            .get_one::<i64>(ARG_SESSION_INACTIVITY)
            .copied()
            .unwrap_or(300);
        if inactivity_seconds > expiration_seconds {
            anyhow::bail!(
                "--{ARG_SESSION_INACTIVITY} ({inactivity_seconds}) must not exceed \
                 --{ARG_SESSION_EXPIRATION} ({expiration_seconds})"
            );
        }
        let remember_me_seconds = matches
            .get_one::<i64>(ARG_REMEMBER_ME)
            .copied()
            .filter(|seconds| *seconds > 0);

        Ok(Self {
            expiration_seconds,
            inactivity_seconds,
            remember_me_seconds,
            cookie_name: matches
                .get_one::<String>(ARG_COOKIE_NAME)
                .cloned()
                .unwrap_or_else(|| crate::api::state::DEFAULT_SESSION_COOKIE_NAME.to_string()),
            cookie_domain: matches
                .get_one::<String>(ARG_COOKIE_DOMAIN)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            cookie_secure: !matches.get_flag(ARG_COOKIE_INSECURE),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_EXPIRATION)
                .long(ARG_SESSION_EXPIRATION)
                .help("Hard session lifetime in seconds")
                .env("AUTHGATE_SESSION_EXPIRATION_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_INACTIVITY)
                .long(ARG_SESSION_INACTIVITY)
                .help("Idle time in seconds before a session expires")
                .env("AUTHGATE_SESSION_INACTIVITY_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REMEMBER_ME)
                .long(ARG_REMEMBER_ME)
                .help("Remember-me session lifetime in seconds, 0 disables it")
                .env("AUTHGATE_REMEMBER_ME_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Session cookie name")
                .env("AUTHGATE_COOKIE_NAME")
                .default_value(crate::api::state::DEFAULT_SESSION_COOKIE_NAME),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Cookie domain shared by all protected hosts, also bounds login redirects")
                .env("AUTHGATE_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_COOKIE_INSECURE)
                .long(ARG_COOKIE_INSECURE)
                .help("Omit the Secure cookie attribute (plain HTTP development only)")
                .env("AUTHGATE_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
}
