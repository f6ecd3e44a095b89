//! Parsing for the duration strings used in cycling settings and health checks.
//!
//! Durations are written the way Kubernetes tooling writes them: a sequence of decimal numbers,
//! each with a unit suffix, such as `"90s"`, `"1h30m"` or `"1.5h"`. Valid units are `ns`, `us`
//! (or `µs`), `ms`, `s`, `m` and `h`.
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ensure, OptionExt};
use std::time::Duration;

lazy_static! {
    /// Matches a complete duration string.
    pub static ref DURATION_RE: Regex =
        Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h))+$").expect("Invalid regex literal.");
    static ref DURATION_COMPONENT_RE: Regex =
        Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("Invalid regex literal.");
}

/// Parses a duration string such as `"1h30m"` into a `Duration`.
///
/// `"0"` is accepted as a zero duration.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    ensure!(
        DURATION_RE.is_match(value),
        error::InvalidDurationSnafu { value }
    );

    let mut total_secs = 0f64;
    for component in DURATION_COMPONENT_RE.captures_iter(value) {
        let amount: f64 = component[1]
            .parse()
            .ok()
            .context(error::InvalidDurationSnafu { value })?;
        let unit_secs = match &component[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return error::InvalidDurationSnafu { value }.fail(),
        };
        total_secs += amount * unit_secs;
    }

    Ok(Duration::from_secs_f64(total_secs))
}

/// Renders a `Duration` in the same notation accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let millis = duration.subsec_millis();
    if total == 0 {
        return format!("{}ms", millis);
    }

    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut rendered = String::new();
    if hours > 0 {
        rendered.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        rendered.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || rendered.is_empty() {
        rendered.push_str(&format!("{}s", seconds));
    }
    rendered
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DurationError {
        #[snafu(display("'{}' is not a valid duration, expected a value like '90s' or '1h30m'", value))]
        InvalidDuration { value: String },
    }
}

pub use error::DurationError;
type Result<T> = std::result::Result<T, DurationError>;
