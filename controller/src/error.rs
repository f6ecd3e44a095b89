use models::cloudprovider::ProviderError;
use models::cycle::CycleError;
use models::node::ClusterClientError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
///
/// Returning one of these from a reconcile means "try again later". Failures which should fail
/// a request or node are instead recorded in its status by the transitioners.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to read cluster state: '{}'", source))]
    ClusterRead { source: ClusterClientError },

    #[snafu(display("Unable to modify cluster state: '{}'", source))]
    ClusterWrite { source: ClusterClientError },

    #[snafu(display("Unable to persist status of {} '{}': '{}'", kind, name, source))]
    PersistStatus {
        source: ClusterClientError,
        kind: String,
        name: String,
    },

    #[snafu(display("Cloud provider failed to {}: '{}'", action, source))]
    CloudProvider {
        source: ProviderError,
        action: String,
    },

    #[snafu(display("Status of {} '{}' is corrupt: '{}'", kind, name, source))]
    CorruptStatus {
        source: CycleError,
        kind: String,
        name: String,
    },

    #[snafu(display("{} '{}' is in an unknown phase", kind, name))]
    UnknownPhase { kind: String, name: String },

    #[snafu(display("{} is missing its '{}'", kind, field))]
    MissingMetadata { kind: String, field: String },

    #[snafu(display("Reconcile permits are no longer available: '{}'", source))]
    PermitUnavailable { source: tokio::sync::AcquireError },
}
