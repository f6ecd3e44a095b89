//! Provides draining of Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining is done client side: the Node is cordoned, then its Pods are evicted (or deleted,
//! where the cluster does not support evictions). Evictions respect PodDisruptionBudgets (PDBs).
//!
//! Unlike `kubectl drain`, nothing here blocks until the Pods are gone. Each call makes one pass
//! over the Node's Pods and reports what happened, so that the caller can requeue and check
//! again later.
use super::ClusterClient;
use crate::constants::MIRROR_POD_ANNOTATION;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{event, instrument, Level};

// Maximum number of Pods to evict concurrently.
// We don't want to generate too many TPS to Kubernetes, keeping this relatively low is probably a good idea.
const CONCURRENT_EVICTIONS: usize = 5;

/// Pods which are not waited upon when a node is cycled with the `Wait` method.
#[derive(Clone, Debug)]
pub struct IgnoreRules<'a> {
    pub namespaces: &'a [String],
    pub pod_labels: &'a BTreeMap<String, Vec<String>>,
}

impl IgnoreRules<'_> {
    fn ignores(&self, pod: &Pod) -> bool {
        if let Some(namespace) = pod.metadata.namespace.as_ref() {
            if self.namespaces.contains(namespace) {
                return true;
            }
        }

        pod.labels().iter().any(|(key, value)| {
            self.pod_labels
                .get(key)
                .map_or(false, |ignored| ignored.contains(value))
        })
    }
}

/// Given a list of all pods for a given node, returns those which draining must remove.
///
/// Kubectl by default will not evict pods under some criteria without further instruction.
/// We always skip:
/// * DaemonSet Pods - The DaemonSet controller will not respect node cordons, so we don't battle it.
/// * Mirror Pods - These are static and cannot be controlled.
/// * Completed Pods - These hold no running workload.
///
/// `ignore` further excludes Pods by namespace or label value.
pub fn drainable_pods<I>(pods: I, ignore: Option<&IgnoreRules>) -> Vec<Pod>
where
    I: IntoIterator<Item = Pod>,
{
    pods.into_iter()
        .filter(|pod| {
            if let Some(phase) = pod.status.as_ref().and_then(|status| status.phase.as_ref()) {
                if phase == "Failed" || phase == "Succeeded" {
                    return false;
                }
            }

            // Ignore daemonset pods, as the DaemonSet controller ignores node cordons.
            if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
                if owner_references.iter().any(|reference| {
                    reference.controller == Some(true) && reference.kind == "DaemonSet"
                }) {
                    event!(
                        Level::DEBUG,
                        "Not draining Pod '{}': Pod is member of a DaemonSet",
                        pod.name_any()
                    );
                    return false;
                }
            }

            // Ignore static mirror pods, they cannot be controlled.
            if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
                event!(
                    Level::DEBUG,
                    "Not draining Pod '{}': Pod is a static Mirror Pod",
                    pod.name_any()
                );
                return false;
            }

            !ignore.map_or(false, |rules| rules.ignores(pod))
        })
        .collect()
}

/// How a drain pass went for the Node's Pods.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Pods whose eviction was refused to protect a PodDisruptionBudget. Worth retrying.
    pub blocked: Vec<String>,
    /// Descriptions of every other failure. These will not get better by retrying.
    pub failures: Vec<String>,
}

impl DrainOutcome {
    pub fn is_clean(&self) -> bool {
        self.blocked.is_empty() && self.failures.is_empty()
    }
}

/// Removes every given Pod, concurrently.
///
/// Pods are evicted when `use_eviction` is set and deleted otherwise. Every Pod is attempted
/// regardless of earlier failures, so that the outcome describes all of them.
#[instrument(skip(client, pods), fields(pod_count = pods.len()))]
pub async fn drain_pods<T: ClusterClient>(
    client: &T,
    pods: Vec<Pod>,
    use_eviction: bool,
) -> DrainOutcome {
    let results: Vec<(String, Result<(), error::EvictionError>)> = stream::iter(pods)
        .map(|pod| async move {
            let pod_name = pod.name_any();
            let result = if use_eviction {
                client.evict_pod(&pod).await
            } else {
                client
                    .delete_pod(&pod)
                    .await
                    .map_err(|err| error::EvictionError::Rejected {
                        pod_name: pod_name.clone(),
                        reason: err.to_string(),
                    })
            };
            (pod_name, result)
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .collect()
        .await;

    let mut outcome = DrainOutcome::default();
    for (pod_name, result) in results {
        match result {
            Ok(()) => event!(Level::INFO, "Removed Pod '{}'", pod_name),
            Err(err @ error::EvictionError::TooManyRequests { .. }) => {
                event!(
                    Level::WARN,
                    "{}. This is likely due to respecting a Pod Disruption Budget.",
                    err
                );
                outcome.blocked.push(pod_name);
            }
            Err(err) => {
                event!(Level::ERROR, "{}", err);
                outcome.failures.push(err.to_string());
            }
        }
    }
    outcome
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        /// The API server refused the eviction with a 429, which is how a PodDisruptionBudget
        /// asks us to wait.
        #[snafu(display("Too many requests when evicting Pod '{}'", pod_name))]
        TooManyRequests { pod_name: String },

        #[snafu(display("Unable to remove Pod '{}': '{}'", pod_name, reason))]
        Rejected { pod_name: String, reason: String },
    }
}
