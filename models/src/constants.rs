/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! cyclops_domain {
    () => {
        "cyclops.atlassian.com"
    };
    ($s:literal) => {
        concat!(cyclops_domain!(), "/", $s)
    };
}

// CRD group and version. These are repeated as literals inside the `#[kube(...)]` attributes,
// which cannot take constants.
pub const CRD_GROUP: &str = "atlassian.com";
pub const CRD_VERSION: &str = "v1";
pub const API_VERSION: &str = "atlassian.com/v1";

pub const CYCLOPS: &str = "cyclops";
pub const CYCLOPS_DOMAIN_LIKE_NAME: &str = cyclops_domain!();

// Label keys
/// Placed on a node once a CycleNodeRequest has claimed it. The value is the request's name.
pub const NODE_CYCLING_LABEL: &str = cyclops_domain!("terminate");
/// Placed on every CycleNodeStatus, pointing back at the owning CycleNodeRequest by name.
pub const CYCLE_NODE_STATUS_OWNER_LABEL: &str = "name";

// Kubernetes well-known values
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const NODE_READY_CONDITION: &str = "Ready";
pub const NODE_INTERNAL_IP: &str = "InternalIP";
pub const EVICTION_SUBRESOURCE: &str = "pods/eviction";

/// The name under which Kubernetes events are reported.
pub const EVENT_REPORTER: &str = "cyclops-controller";
