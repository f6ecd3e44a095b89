//! Finding the nodes a request should act upon.
use crate::manager::ResourceManager;

use models::cloudprovider::{Instance, ProviderResult};
use models::cycle::CycleNodeRequestNode;
use models::node::{
    node_cycling_label, node_internal_ip, node_is_ready, node_provider_id, ClusterClient,
    ClusterClientError,
};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{event, instrument, Level};

impl<C: ClusterClient> ResourceManager<C> {
    /// Lists the Ready nodes matching `selector`. Nodes claimed by a request are left out
    /// unless `include_in_progress` is set.
    #[instrument(skip(self), err)]
    pub async fn list_ready_nodes(
        &self,
        selector: &str,
        include_in_progress: bool,
    ) -> Result<Vec<Node>, ClusterClientError> {
        let nodes = self.client.list_nodes(selector).await?;
        Ok(nodes
            .into_iter()
            .filter(node_is_ready)
            .filter(|node| include_in_progress || node_cycling_label(node).is_none())
            .collect())
    }

    /// Keeps the nodes whose cloud instance still exists.
    pub async fn nodes_in_cloud(&self, nodes: Vec<Node>) -> ProviderResult<Vec<Node>> {
        let provider_ids: Vec<String> = nodes
            .iter()
            .filter_map(|node| node_provider_id(node).map(str::to_string))
            .collect();
        let existing: BTreeSet<String> = self
            .cloud_provider
            .instances_exist(&provider_ids)
            .await?
            .into_iter()
            .collect();

        Ok(nodes
            .into_iter()
            .filter(|node| {
                let exists = node_provider_id(node).map_or(false, |id| existing.contains(id));
                if !exists {
                    event!(
                        Level::DEBUG,
                        "Node '{}' no longer has an instance in {}",
                        node.name_any(),
                        self.cloud_provider.name()
                    );
                }
                exists
            })
            .collect())
    }
}

/// Describes `node` as it is recorded in a request's status.
pub fn request_node(node: &Node, node_group_name: &str) -> CycleNodeRequestNode {
    CycleNodeRequestNode {
        name: node.name_any(),
        provider_id: node_provider_id(node).unwrap_or_default().to_string(),
        node_group_name: node_group_name.to_string(),
        private_ip: node_internal_ip(node).unwrap_or_default().to_string(),
    }
}

fn find_instance<'a>(
    node: &Node,
    instances: &'a BTreeMap<String, Instance>,
) -> Option<&'a Instance> {
    let provider_id = node_provider_id(node)?;
    instances
        .get(provider_id)
        .or_else(|| {
            instances
                .values()
                .find(|instance| instance.matches_provider_id(provider_id))
        })
}

/// Pairs each node with the node group instance backing it. Nodes without one are left out.
pub fn match_nodes_to_instances(
    nodes: &[Node],
    instances: &BTreeMap<String, Instance>,
) -> Vec<CycleNodeRequestNode> {
    nodes
        .iter()
        .filter_map(|node| match find_instance(node, instances) {
            Some(instance) => Some(request_node(node, instance.node_group_name())),
            None => {
                event!(
                    Level::WARN,
                    "Node '{}' does not belong to any of the requested node groups",
                    node.name_any()
                );
                None
            }
        })
        .collect()
}

/// Picks the nodes named by a request out of those which can be cycled. Returns the nodes
/// found, followed by the names which were not.
pub fn resolve_named_nodes(
    names: &[String],
    candidates: &[CycleNodeRequestNode],
) -> (Vec<CycleNodeRequestNode>, Vec<String>) {
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        match candidates.iter().find(|candidate| &candidate.name == name) {
            Some(node) if !found.contains(node) => found.push(node.clone()),
            Some(_) => {}
            None => missing.push(name.clone()),
        }
    }
    (found, missing)
}

/// Describes how Kubernetes and the cloud provider disagree about a node group: the nodes
/// with no instance, then the instances with no node.
pub fn equilibrium_differences(
    nodes: &[Node],
    instances: &BTreeMap<String, Instance>,
) -> (Vec<String>, Vec<String>) {
    let nodes_without_instance = nodes
        .iter()
        .filter(|node| find_instance(node, instances).is_none())
        .map(|node| node.name_any())
        .collect();

    let instances_without_node = instances
        .values()
        .filter(|instance| {
            !nodes.iter().any(|node| {
                node_provider_id(node).map_or(false, |id| instance.matches_provider_id(id))
            })
        })
        .map(|instance| instance.id().to_string())
        .collect();

    (nodes_without_instance, instances_without_node)
}
