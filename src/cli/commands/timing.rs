use crate::timing::{TimingConfig, DEFAULT_TARGET_PERCENTILE, DEFAULT_WINDOW};
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_TIMING_MIN_MS: &str = "timing-min-delay-ms";
pub const ARG_TIMING_MAX_MS: &str = "timing-max-delay-ms";
pub const ARG_TIMING_PERCENTILE: &str = "timing-percentile";
pub const ARG_TIMING_WINDOW: &str = "timing-window";

/// Build the login timing gate settings.
///
/// # Errors
/// Returns an error if the minimum delay exceeds the maximum.
pub fn parse(matches: &ArgMatches) -> anyhow::Result<TimingConfig> {
    let min = matches.get_one::<u64>(ARG_TIMING_MIN_MS).copied().unwrap_or(250);
    let max = matches.get_one::<u64>(ARG_TIMING_MAX_MS).copied().unwrap_or(1000);
    if min > max {
        anyhow::bail!(
            "--{ARG_TIMING_MIN_MS} ({min}) must not exceed --{ARG_TIMING_MAX_MS} ({max})"
        );
    }
    Ok(TimingConfig {
        min_delay: Duration::from_millis(min),
        max_delay: Duration::from_millis(max),
        target_percentile: matches
            .get_one::<u8>(ARG_TIMING_PERCENTILE)
            .copied()
            .unwrap_or(DEFAULT_TARGET_PERCENTILE),
        window: matches
            .get_one::<usize>(ARG_TIMING_WINDOW)
            .copied()
            .unwrap_or(DEFAULT_WINDOW),
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TIMING_MIN_MS)
                .long(ARG_TIMING_MIN_MS)
                .help("Minimum login response delay in milliseconds")
                .env("AUTHGATE_TIMING_MIN_DELAY_MS")
                .default_value("250")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_TIMING_MAX_MS)
                .long(ARG_TIMING_MAX_MS)
                .help("Maximum login response delay in milliseconds")
                .env("AUTHGATE_TIMING_MAX_DELAY_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_TIMING_PERCENTILE)
                .long(ARG_TIMING_PERCENTILE)
                .help("Percentile of successful login latencies used as the delay target")
                .env("AUTHGATE_TIMING_PERCENTILE")
                .default_value("85")
                .value_parser(clap::value_parser!(u8).range(1..=100)),
        )
        .arg(
            Arg::new(ARG_TIMING_WINDOW)
                .long(ARG_TIMING_WINDOW)
                .help("Number of recent successful logins sampled")
                .env("AUTHGATE_TIMING_WINDOW")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
}
