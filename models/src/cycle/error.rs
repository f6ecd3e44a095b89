use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Object must have valid rfc3339 timestamp, got '{}': '{}'", value, source))]
    TimestampFormat {
        source: chrono::ParseError,
        value: String,
    },

    #[snafu(display("Invalid duration in field '{}': '{}'", field, source))]
    InvalidDurationField {
        source: crate::duration::DurationError,
        field: String,
    },

    #[snafu(display("Invalid cycle settings: '{}'", source))]
    InvalidCycleSettings { source: validator::ValidationErrors },

    #[snafu(display("Invalid health check '{}': '{}'", endpoint, source))]
    InvalidHealthCheck {
        source: validator::ValidationErrors,
        endpoint: String,
    },
}
