//! Custom resources which drive the cycling of a node group.
//!
//! A `CycleNodeRequest` describes the rotation of a whole node group. While it runs, it spawns one
//! `CycleNodeStatus` per node being replaced; each of those drains and terminates a single node.
mod error;
mod request;
mod settings;
mod status;

pub use self::error::{Error as CycleError, Result};
pub use self::request::*;
pub use self::settings::*;
pub use self::status::*;

use chrono::{DateTime, Utc};
use snafu::ResultExt;

// We can't use these consts inside macros, but we do provide constants for use in generating kubernetes objects.
pub const K8S_CNR_KIND: &str = "CycleNodeRequest";
pub const K8S_CNR_PLURAL: &str = "cyclenoderequests";
pub const K8S_CNR_SHORTNAME: &str = "cnr";
pub const K8S_CNS_KIND: &str = "CycleNodeStatus";
pub const K8S_CNS_PLURAL: &str = "cyclenodestatuses";
pub const K8S_CNS_SHORTNAME: &str = "cns";

/// Timestamps are persisted as rfc3339 strings.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339()
}

/// Parses a persisted rfc3339 timestamp.
pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(timestamp)
        .context(error::TimestampFormatSnafu {
            value: timestamp.to_string(),
        })?
        .into())
}

/// Parses an optional persisted timestamp, returning `None` when it was never recorded.
pub(crate) fn parse_optional_timestamp(timestamp: Option<&String>) -> Result<Option<DateTime<Utc>>> {
    timestamp.map(|value| parse_timestamp(value)).transpose()
}

/// Joins a new failure onto an existing status message.
///
/// Repeated failures are recorded side by side, separated by a comma, so that no earlier
/// diagnostic is lost.
pub fn append_message(existing: Option<&str>, message: &str) -> String {
    match existing {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, message),
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(
            parse_timestamp(&format_timestamp(timestamp)).unwrap(),
            timestamp
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_append_message() {
        assert_eq!(append_message(None, "first"), "first");
        assert_eq!(append_message(Some(""), "first"), "first");
        assert_eq!(append_message(Some("first"), "second"), "first, second");
    }
}
