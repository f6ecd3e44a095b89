use super::error::Result;
use super::settings::{CycleSettings, HealthCheck, PreTerminationCheck, ValidationOptions};
use super::{format_timestamp, parse_optional_timestamp};
use crate::node::NodeHash;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// CycleNodeRequestPhase is the position of a request in the node group cycling state machine.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
pub enum CycleNodeRequestPhase {
    /// Newly created requests have no phase until they are validated.
    #[default]
    #[serde(rename = "")]
    Undefined,
    /// The request is valid, and is waiting for the node group to be in equilibrium before the
    /// target nodes are chosen.
    Pending,
    /// Target nodes are known; the next batch is ready to be selected.
    Initialised,
    /// A batch of instances has been detached and their replacements are starting.
    ScalingUp,
    /// Replacements are up. The batch is being cordoned and handed to CycleNodeStatus workers.
    CordoningNode,
    /// Workers are draining and terminating the batch.
    WaitingTermination,
    /// Something went wrong. Detached nodes are being returned to service.
    Healing,
    /// Terminal: the request failed.
    Failed,
    /// Terminal: every target node was cycled.
    Successful,
    /// A phase written by something other than this controller.
    #[serde(other)]
    Unknown,
}

serde_plain::derive_display_from_serialize!(CycleNodeRequestPhase);

/// A node targeted by a request, as recorded in its status.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestNode {
    pub name: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(default)]
    pub node_group_name: String,
    #[serde(default, rename = "privateIP")]
    pub private_ip: String,
}

impl CycleNodeRequestNode {
    pub fn hash(&self) -> NodeHash {
        NodeHash::new(&self.provider_id, &self.name)
    }
}

/// The `CycleNodeRequestSpec` describes the rotation of the nodes of one or more node groups.
/// It is written by whoever creates the request and never changes afterwards.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "atlassian.com",
    kind = "CycleNodeRequest",
    namespaced,
    plural = "cyclenoderequests",
    shortname = "cnr",
    singular = "cyclenoderequest",
    status = "CycleNodeRequestStatus",
    version = "v1",
    printcolumn = r#"{"name":"Node Group", "type":"string", "jsonPath":".spec.nodeGroupName"}"#,
    printcolumn = r#"{"name":"Method", "type":"string", "jsonPath":".spec.cycleSettings.method"}"#,
    printcolumn = r#"{"name":"Concurrency", "type":"integer", "jsonPath":".spec.cycleSettings.concurrency"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestSpec {
    /// The cluster the node group belongs to.
    #[serde(default)]
    pub cluster_name: String,
    /// The node group to cycle.
    #[serde(default)]
    pub node_group_name: String,
    /// Further node groups cycled alongside `nodeGroupName`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_groups_list: Vec<String>,
    /// Selects the Kubernetes nodes belonging to the node groups.
    #[serde(default)]
    pub selector: LabelSelector,
    /// Restricts cycling to these nodes rather than every selected node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,
    #[serde(default)]
    pub cycle_settings: CycleSettings,
    /// Checks which must pass against new nodes before old ones are drained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,
    /// Checks which must pass against each old node before it is handed over for termination.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_termination_checks: Vec<PreTerminationCheck>,
    #[serde(default)]
    pub validation_options: ValidationOptions,
    #[serde(default)]
    pub skip_initial_health_checks: bool,
    #[serde(default)]
    pub skip_pre_termination_checks: bool,
}

impl CycleNodeRequestSpec {
    /// Returns every node group targeted by the request, without duplicates.
    pub fn node_group_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for name in std::iter::once(&self.node_group_name).chain(self.node_groups_list.iter()) {
            if !name.is_empty() && !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Per node progress of the cycling health checks, keyed in the status by node hash.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckStatus {
    /// When the node's checks first failed. Wait periods are measured from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ready: Option<String>,
    /// One flag per configured health check, set once that check has passed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<bool>,
    /// Set once the node needs no further checking.
    #[serde(default)]
    pub skip: bool,
}

impl HealthCheckStatus {
    pub fn node_ready(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.node_ready.as_ref())
    }
}

/// Progress of one pre-termination check against one node.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreTerminationCheckStatus {
    /// When the trigger was sent. The trigger is never sent twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Set once the follow-up health check has passed.
    #[serde(default)]
    pub check: bool,
}

impl PreTerminationCheckStatus {
    pub fn trigger(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.trigger.as_ref())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CycleNodeRequestStatus {
    #[serde(default)]
    pub phase: CycleNodeRequestPhase,
    /// Human readable failure description. Successive failures are comma separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The batch of nodes currently being replaced.
    #[serde(default)]
    pub current_nodes: Vec<CycleNodeRequestNode>,
    /// Every node the request still has to cycle.
    #[serde(default)]
    pub nodes_to_terminate: Vec<CycleNodeRequestNode>,
    /// Target nodes which have not yet been claimed by a batch.
    #[serde(default)]
    pub nodes_available: Vec<CycleNodeRequestNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_started: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equilibrium_wait_started: Option<String>,
    /// When every remaining target was first found unselectable with no children working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_wait_started: Option<String>,
    /// Ready nodes, not claimed by any request, seen just before the current batch was detached.
    #[serde(default)]
    pub nodes_before_scale_up: i64,
    /// Ready node group instances seen just before the current batch was detached.
    #[serde(default)]
    pub instances_before_scale_up: i64,
    /// The number of CycleNodeStatus children still working.
    #[serde(default)]
    pub active_children: i64,
    #[serde(default)]
    pub num_nodes_cycled: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub health_checks: BTreeMap<String, HealthCheckStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pre_termination_checks: BTreeMap<String, Vec<PreTerminationCheckStatus>>,
    /// Hashes of nodes which have already been announced as selected.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub selected_nodes: BTreeSet<String>,
}

impl CycleNodeRequestStatus {
    pub fn scale_up_started(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.scale_up_started.as_ref())
    }

    pub fn set_scale_up_started(&mut self, timestamp: DateTime<Utc>) {
        self.scale_up_started = Some(format_timestamp(timestamp));
    }

    pub fn equilibrium_wait_started(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.equilibrium_wait_started.as_ref())
    }

    pub fn set_equilibrium_wait_started(&mut self, timestamp: DateTime<Utc>) {
        self.equilibrium_wait_started = Some(format_timestamp(timestamp));
    }

    pub fn selection_wait_started(&self) -> Result<Option<DateTime<Utc>>> {
        parse_optional_timestamp(self.selection_wait_started.as_ref())
    }

    pub fn set_selection_wait_started(&mut self, timestamp: DateTime<Utc>) {
        self.selection_wait_started = Some(format_timestamp(timestamp));
    }
}

impl CycleNodeRequest {
    pub fn phase(&self) -> CycleNodeRequestPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    /// Name given to the CycleNodeStatus which cycles `node_name` on behalf of this request.
    pub fn child_name(&self, node_name: &str) -> String {
        format!("{}-{}", kube::ResourceExt::name_any(self), node_name)
    }
}
