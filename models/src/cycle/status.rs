use super::error::Result;
use super::settings::CycleSettings;
use super::{format_timestamp, parse_optional_timestamp};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CycleNodeStatusPhase is the position of a single node in the node cycling state machine.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
pub enum CycleNodeStatusPhase {
    #[default]
    #[serde(rename = "")]
    Undefined,
    /// Validated and timed; the node has not been looked at yet.
    Pending,
    /// Waiting for workloads to leave the node by themselves.
    WaitingPods,
    /// Stripping configured labels from the pods on the node.
    RemovingLabelsFromPods,
    /// Evicting or deleting pods from the node.
    DrainingPods,
    /// Removing the node object from Kubernetes.
    DeletingNode,
    /// Terminating the cloud instance backing the node.
    TerminatingNode,
    Failed,
    Successful,
    #[serde(other)]
    Unknown,
}

serde_plain::derive_display_from_serialize!(CycleNodeStatusPhase);

/// The Kubernetes node being cycled and the cloud instance backing it.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeStatusNode {
    pub name: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
}

/// The `CycleNodeStatusSpec` describes the cycling of one node. It is created by a
/// `CycleNodeRequest`, which owns it and deletes it once it reaches a terminal phase.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "atlassian.com",
    kind = "CycleNodeStatus",
    namespaced,
    plural = "cyclenodestatuses",
    shortname = "cns",
    singular = "cyclenodestatus",
    status = "CycleNodeStatusStatus",
    version = "v1",
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Method", "type":"string", "jsonPath":".spec.cycleSettings.method"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeStatusSpec {
    pub node_name: String,
    #[serde(default)]
    pub cycle_settings: CycleSettings,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeStatusStatus {
    #[serde(default)]
    pub phase: CycleNodeStatusPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<CycleNodeStatusNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_timestamp: Option<String>,
    /// The deadline past which waiting or draining fails the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_timestamp: Option<String>,
}

impl CycleNodeStatusStatus {
    pub fn started_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.started_timestamp.as_ref())
    }

    pub fn timeout_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.timeout_timestamp.as_ref())
    }

    pub fn set_timestamps(&mut self, started: DateTime<Utc>, timeout: DateTime<Utc>) {
        self.started_timestamp = Some(format_timestamp(started));
        self.timeout_timestamp = Some(format_timestamp(timeout));
    }
}

impl CycleNodeStatus {
    pub fn phase(&self) -> CycleNodeStatusPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }
}
