//! Project-wide utility for initializing tracing.
//!
//! Everything is configured from the environment:
//! * `CYCLOPS_TRACING_FILTER_DIRECTIVE` takes an `EnvFilter` directive, `info` by default.
//! * `CYCLOPS_LOGGING_FORMATTER` is one of `full`, `compact`, `pretty` or `json`.
//! * `CYCLOPS_LOGGING_ANSI_ENABLED` turns colours on or off.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "CYCLOPS_TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "CYCLOPS_LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "CYCLOPS_LOGGING_ANSI_ENABLED";

/// The formatter for logging tracing events.
///
/// Controls the format of the message as well as whether or not to enable ANSI colors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    message_format: MessageFormat,
    ansi_enabled: bool,
}

impl LogFormatter {
    pub fn try_from_env() -> Result<Self> {
        Ok(Self {
            message_format: MessageFormat::try_from_env()?,
            ansi_enabled: ansi_enabled_from_env()?,
        })
    }

    /// Adds a formatting layer to a tracing event subscriber.
    fn add_format_layer<S>(&self, event_subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // The layers are all different types, so each arm boxes its own subscriber.
        let layer = fmt::layer().with_ansi(self.ansi_enabled);
        match self.message_format {
            MessageFormat::Full => Box::new(event_subscriber.with(layer)),
            MessageFormat::Compact => Box::new(event_subscriber.with(layer.compact())),
            MessageFormat::Pretty => Box::new(event_subscriber.with(layer.pretty())),
            MessageFormat::Json => Box::new(event_subscriber.with(layer.json())),
        }
    }
}

fn ansi_enabled_from_env() -> Result<bool> {
    env::var(LOGGING_ANSI_ENABLED_ENV_VAR)
        .ok()
        .map(|ansi_enabled_str| {
            ansi_enabled_str
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu {
                    env_value: ansi_enabled_str.to_string(),
                })
        })
        .unwrap_or(Ok(false))
}

/// The message format for logging tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    #[default]
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

impl MessageFormat {
    pub fn try_from_env() -> Result<Self> {
        env::var(LOGGING_FORMATTER_ENV_VAR)
            .ok()
            .map(|formatter| {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter,
                })
            })
            .unwrap_or(Ok(Default::default()))
    }
}

/// Installs the global tracing subscriber. Must be called at most once per process.
pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LogFormatter::try_from_env()?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use super::*;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatter_from_environment() {
        env::remove_var(LOGGING_FORMATTER_ENV_VAR);
        env::remove_var(LOGGING_ANSI_ENABLED_ENV_VAR);
        assert_eq!(LogFormatter::try_from_env().unwrap(), LogFormatter::default());

        env::set_var(LOGGING_FORMATTER_ENV_VAR, "json");
        env::set_var(LOGGING_ANSI_ENABLED_ENV_VAR, "TRUE");
        assert_eq!(
            LogFormatter::try_from_env().unwrap(),
            LogFormatter {
                message_format: MessageFormat::Json,
                ansi_enabled: true,
            }
        );

        env::set_var(LOGGING_FORMATTER_ENV_VAR, "fancy");
        assert!(MessageFormat::try_from_env().is_err());

        env::set_var(LOGGING_FORMATTER_ENV_VAR, "compact");
        env::set_var(LOGGING_ANSI_ENABLED_ENV_VAR, "sometimes");
        assert!(LogFormatter::try_from_env().is_err());

        env::remove_var(LOGGING_FORMATTER_ENV_VAR);
        env::remove_var(LOGGING_ANSI_ENABLED_ENV_VAR);

        // Only the first subscriber of the process is installed.
        assert!(init_telemetry_from_env().is_ok());
        assert!(matches!(
            init_telemetry_from_env(),
            Err(TelemetryConfigError::TracingConfiguration { .. })
        ));
    }
}
