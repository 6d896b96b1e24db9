pub mod factors;
pub mod logging;
pub mod session;
pub mod timing;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_LOGIN_URL: &str = "login-url";
pub const ARG_ACCESS_CONTROL: &str = "access-control";
pub const ARG_USERS: &str = "users";
pub const ARG_TRUSTED_HOPS: &str = "trusted-hops";
pub const ARG_FORWARDED_HEADER: &str = "forwarded-header";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("authgate")
        .about("Forward-auth gateway with step-up authentication")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("9091")
                .env("AUTHGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_LOGIN_URL)
                .long(ARG_LOGIN_URL)
                .help("Login portal URL browsers are redirected to")
                .env("AUTHGATE_LOGIN_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_CONTROL)
                .long(ARG_ACCESS_CONTROL)
                .help("Path to the access-control rules (JSON), re-read on SIGHUP")
                .env("AUTHGATE_ACCESS_CONTROL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_USERS)
                .long(ARG_USERS)
                .help("Path to the users file (JSON)")
                .env("AUTHGATE_USERS")
                .required(true),
        )
        .arg(
            Arg::new(ARG_TRUSTED_HOPS)
                .long(ARG_TRUSTED_HOPS)
                .help("Number of reverse proxies in front of the gateway")
                .long_help(
                    "Number of trusted reverse proxies in front of the gateway. The client \
                     address is\nread this many entries from the right of the forwarded \
                     header; entries further left\nare client-controlled and ignored.",
                )
                .env("AUTHGATE_TRUSTED_HOPS")
                .required(true)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_FORWARDED_HEADER)
                .long(ARG_FORWARDED_HEADER)
                .help("Header carrying the forwarded client address chain")
                .env("AUTHGATE_FORWARDED_HEADER")
                .default_value(crate::access::client_ip::DEFAULT_FORWARDED_HEADER),
        );

    let command = session::with_args(command);
    let command = factors::with_args(command);
    let command = timing::with_args(command);
    logging::with_args(command)
}
