use super::error::{self, Result};
use crate::duration::{parse_duration, DURATION_RE};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

/// How a node's workloads are moved off before the node is removed.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum CycleMethod {
    /// Evict (or delete) every drainable pod from the node.
    Drain,
    /// Wait for drainable pods to leave the node on their own.
    Wait,
}

serde_plain::derive_display_from_serialize!(CycleMethod);

/// Settings which control how each node in a request is cycled. These are copied verbatim onto
/// every `CycleNodeStatus` spawned by the request.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CycleSettings {
    /// The cycling method. A request without a method fails validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<CycleMethod>,
    /// How many nodes may be cycled at once. Values of zero or less cycle every target node in a
    /// single batch.
    #[serde(default)]
    pub concurrency: i64,
    /// Labels removed from the pods on a node before it is drained, e.g. to pull them out of a
    /// service's endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_to_remove: Vec<String>,
    /// Pods carrying any of these label values are not waited upon.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ignore_pods_labels: BTreeMap<String, Vec<String>>,
    /// Pods in these namespaces are not waited upon.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_namespaces: Vec<String>,
    /// Upper bound on how long a single node may take to cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(regex = "DURATION_RE")]
    pub cycling_timeout: Option<String>,
}

impl CycleSettings {
    pub fn cycling_timeout(&self) -> Result<Option<Duration>> {
        self.cycling_timeout
            .as_deref()
            .map(|timeout| {
                parse_duration(timeout).context(error::InvalidDurationFieldSnafu {
                    field: "cycleSettings.cyclingTimeout",
                })
            })
            .transpose()
    }

    /// Checks the settings are usable before any node is touched.
    pub fn check(&self) -> Result<()> {
        self.validate().context(error::InvalidCycleSettingsSnafu)
    }
}

/// Names of the environment variables holding PEM encoded TLS material for a health check.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsEnvVars {
    /// Variable holding a CA bundle used to verify the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ca_env_var: Option<String>,
    /// Variable holding the client certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_env_var: Option<String>,
    /// Variable holding the client private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env_var: Option<String>,
}

/// An HTTP check performed against a node.
///
/// `endpoint` may reference the node's private address as `{{.NodeIP}}`.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub endpoint: String,
    /// How long the check may keep failing before it is treated as fatal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(regex = "DURATION_RE")]
    pub wait_period: Option<String>,
    /// Accepted response codes. An empty list accepts any 2xx response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_status_codes: Vec<u16>,
    /// When set, the response body must match this expression and the status code is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEnvVars>,
}

impl HealthCheck {
    pub fn wait_period(&self) -> Result<Duration> {
        self.wait_period
            .as_deref()
            .map(|period| {
                parse_duration(period).context(error::InvalidDurationFieldSnafu {
                    field: format!("healthCheck[{}].waitPeriod", self.endpoint),
                })
            })
            .unwrap_or(Ok(Duration::ZERO))
    }

    pub fn check(&self) -> Result<()> {
        self.validate().context(error::InvalidHealthCheckSnafu {
            endpoint: self.endpoint.clone(),
        })
    }
}

/// A two step check run before a node is handed over for termination: `triggerEndpoint` is
/// sent a single POST, then `healthCheck` is polled until it passes.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreTerminationCheck {
    pub trigger_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_valid_status_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEnvVars>,
    pub health_check: HealthCheck,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOptions {
    /// Proceed with the named nodes that do exist rather than failing the request.
    #[serde(default)]
    pub skip_missing_named_nodes: bool,
}
