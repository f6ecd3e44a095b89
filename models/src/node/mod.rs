//! Helpers for Kubernetes `Node`s, and the client used to act on the cluster.
mod client;
pub mod drain;
mod error;

pub use self::client::*;
pub use self::error::{api_error, Error as ClusterClientError};

use crate::constants::{NODE_CYCLING_LABEL, NODE_INTERNAL_IP, NODE_READY_CONDITION};

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::fmt;

#[cfg(any(test, feature = "mockall"))]
pub use self::client::MockClusterClient;

/// Identifies one specific pairing of a cloud instance and a Kubernetes node.
///
/// A replacement instance may come back with the name and address of the node it replaced, so
/// the node name alone is not enough to tell them apart. The provider ID is.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeHash {
    provider_id: String,
    name: String,
}

impl NodeHash {
    pub fn new(provider_id: &str, name: &str) -> Self {
        NodeHash {
            provider_id: provider_id.to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_node(node: &Node) -> Self {
        Self::new(node_provider_id(node).unwrap_or_default(), &node.name_any())
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.name)
    }
}

/// Returns whether the node's `Ready` condition is `True`.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == NODE_READY_CONDITION && condition.status == "True")
        })
}

pub fn node_provider_id(node: &Node) -> Option<&str> {
    node.spec.as_ref().and_then(|spec| spec.provider_id.as_deref())
}

/// Returns the node's first `InternalIP` address.
pub fn node_internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|address| address.type_ == NODE_INTERNAL_IP)
                .map(|address| address.address.as_str())
        })
}

/// Returns the name of the request which has claimed this node for cycling, if any.
pub fn node_cycling_label(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(NODE_CYCLING_LABEL))
        .map(String::as_str)
}

pub fn node_is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Renders a `LabelSelector` in the string form accepted by list calls.
///
/// Returns an empty string for a selector which selects nothing in particular; callers must
/// treat that as "no selector" rather than "everything".
pub fn label_selector_string(selector: &LabelSelector) -> String {
    let mut requirements: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    for expression in selector.match_expressions.iter().flatten() {
        let values = expression.values.clone().unwrap_or_default().join(",");
        let requirement = match expression.operator.as_str() {
            "In" => format!("{} in ({})", expression.key, values),
            "NotIn" => format!("{} notin ({})", expression.key, values),
            "Exists" => expression.key.clone(),
            "DoesNotExist" => format!("!{}", expression.key),
            other => format!("{} {} ({})", expression.key, other.to_lowercase(), values),
        };
        requirements.push(requirement);
    }

    requirements.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn node(ready: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("ip-10-0-0-1".to_string()),
                labels: Some(btreemap! {
                    NODE_CYCLING_LABEL.to_string() => "cycle-workers".to_string(),
                }),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("aws:///us-east-1a/i-0abc".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "ip-10-0-0-1".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.0.0.1".to_string(),
                    },
                ]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_node_accessors() {
        let ready = node("True");
        assert!(node_is_ready(&ready));
        assert!(!node_is_ready(&node("Unknown")));
        assert_eq!(node_provider_id(&ready), Some("aws:///us-east-1a/i-0abc"));
        assert_eq!(node_internal_ip(&ready), Some("10.0.0.1"));
        assert_eq!(node_cycling_label(&ready), Some("cycle-workers"));
        assert!(!node_is_unschedulable(&ready));
        assert_eq!(
            NodeHash::for_node(&ready).to_string(),
            "aws:///us-east-1a/i-0abc/ip-10-0-0-1"
        );
    }

    #[test]
    fn test_node_hash_distinguishes_reused_names() {
        let old = NodeHash::new("aws:///us-east-1a/i-0abc", "ip-10-0-0-1");
        let replacement = NodeHash::new("aws:///us-east-1a/i-0def", "ip-10-0-0-1");
        assert_ne!(old, replacement);
        assert!(old < replacement);
    }

    #[test]
    fn test_label_selector_string() {
        let test_cases = vec![
            (LabelSelector::default(), ""),
            (
                LabelSelector {
                    match_labels: Some(btreemap! {
                        "role".to_string() => "worker".to_string(),
                        "customer".to_string() => "shared".to_string(),
                    }),
                    match_expressions: None,
                },
                "customer=shared,role=worker",
            ),
            (
                LabelSelector {
                    match_labels: Some(btreemap! { "role".to_string() => "worker".to_string() }),
                    match_expressions: Some(vec![
                        LabelSelectorRequirement {
                            key: "zone".to_string(),
                            operator: "In".to_string(),
                            values: Some(vec!["a".to_string(), "b".to_string()]),
                        },
                        LabelSelectorRequirement {
                            key: "spot".to_string(),
                            operator: "DoesNotExist".to_string(),
                            values: None,
                        },
                    ]),
                },
                "role=worker,zone in (a,b),!spot",
            ),
        ];

        for (selector, expected) in test_cases {
            assert_eq!(label_selector_string(&selector), expected);
        }
    }
}
