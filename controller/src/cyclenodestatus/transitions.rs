use super::CycleNodeStatusTransitioner;
use crate::error::{self, Result};
use crate::transition::Transition;

use models::cycle::{CycleMethod, CycleNodeStatusNode, CycleNodeStatusPhase};
use models::duration::format_duration;
use models::node::drain::{drain_pods, drainable_pods, IgnoreRules};
use models::node::{node_provider_id, ClusterClient};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use snafu::ResultExt;
use std::time::Duration;
use tracing::{event, Level};

/// Deadlines further out than this are clamped so that they can always be stored.
const MAX_CYCLING_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn pod_names(pods: &[Pod]) -> Vec<String> {
    pods.iter().map(|pod| pod.name_any()).collect()
}

impl<C: ClusterClient> CycleNodeStatusTransitioner<'_, C> {
    /// Checks the settings and starts the clock on the node.
    pub(super) async fn transition_undefined(&mut self) -> Result<Transition> {
        let settings = self.cns.spec.cycle_settings.clone();
        if self.node_name().is_empty() {
            return self.fail("node name must be set".to_string()).await;
        }
        if settings.method.is_none() {
            return self
                .fail("cycle method must be one of 'Drain' or 'Wait'".to_string())
                .await;
        }
        let timeout = match settings.cycling_timeout() {
            Ok(timeout) => timeout.unwrap_or(self.manager.config.node_termination_grace_period),
            Err(err) => return self.fail(err.to_string()).await,
        };

        let now = Utc::now();
        let deadline = chrono::Duration::from_std(timeout.min(MAX_CYCLING_TIMEOUT))
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(now);
        event!(
            Level::INFO,
            cns = %self.name(),
            "Cycling node '{}', giving up after {}",
            self.node_name(),
            format_duration(timeout.min(MAX_CYCLING_TIMEOUT))
        );
        self.status.set_timestamps(now, deadline);
        self.transition_object(CycleNodeStatusPhase::Pending).await
    }

    /// Finds the node and its instance. Either having gone already means there is nothing to do.
    pub(super) async fn transition_pending(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let node_name = self.node_name().to_string();

        let node = match manager
            .client
            .get_node(&node_name)
            .await
            .context(error::ClusterReadSnafu)?
        {
            Some(node) => node,
            None => {
                event!(
                    Level::INFO,
                    cns = %self.name(),
                    "Node '{}' no longer exists, nothing to do",
                    node_name
                );
                return self.transition_object(CycleNodeStatusPhase::Successful).await;
            }
        };
        let provider_id = match node_provider_id(&node) {
            Some(provider_id) if !provider_id.is_empty() => provider_id.to_string(),
            _ => {
                return self
                    .fail(format!("node '{}' has no provider ID", node_name))
                    .await
            }
        };

        let existing = manager
            .cloud_provider
            .instances_exist(&[provider_id.clone()])
            .await
            .context(error::CloudProviderSnafu {
                action: "check instances exist",
            })?;
        if existing.is_empty() {
            event!(
                Level::INFO,
                cns = %self.name(),
                "Instance of node '{}' no longer exists, nothing to do",
                node_name
            );
            return self.transition_object(CycleNodeStatusPhase::Successful).await;
        }

        self.status.current_node = Some(CycleNodeStatusNode {
            name: node_name,
            provider_id,
        });
        match self.cns.spec.cycle_settings.method {
            Some(CycleMethod::Wait) => {
                self.transition_object(CycleNodeStatusPhase::WaitingPods)
                    .await
            }
            Some(CycleMethod::Drain) => {
                self.transition_object(CycleNodeStatusPhase::RemovingLabelsFromPods)
                    .await
            }
            None => {
                self.fail("cycle method must be one of 'Drain' or 'Wait'".to_string())
                    .await
            }
        }
    }

    /// Waits for the node's workloads to leave by themselves.
    pub(super) async fn transition_waiting_pods(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let node_name = self.node_name().to_string();
        if self.timed_out(Utc::now())? {
            return self
                .fail(format!(
                    "timed out waiting for pods to leave node '{}'",
                    node_name
                ))
                .await;
        }

        let pods = manager
            .client
            .list_pods_on_node(&node_name)
            .await
            .context(error::ClusterReadSnafu)?;
        let settings = &self.cns.spec.cycle_settings;
        let ignore = IgnoreRules {
            namespaces: &settings.ignore_namespaces,
            pod_labels: &settings.ignore_pods_labels,
        };
        let remaining = drainable_pods(pods, Some(&ignore));
        if remaining.is_empty() {
            return self
                .transition_object(CycleNodeStatusPhase::RemovingLabelsFromPods)
                .await;
        }

        event!(
            Level::INFO,
            cns = %self.name(),
            "Waiting for {} pods to leave node '{}': {:?}",
            remaining.len(),
            node_name,
            pod_names(&remaining)
        );
        Ok(Transition::requeue_after(manager.config.wait_pods_requeue))
    }

    /// Strips the configured labels from the node's pods, so that services stop routing to
    /// them before they are drained.
    pub(super) async fn transition_removing_labels(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let keys = self.cns.spec.cycle_settings.labels_to_remove.clone();
        if keys.is_empty() {
            return self
                .transition_object(CycleNodeStatusPhase::DrainingPods)
                .await;
        }

        let labelled: Vec<Pod> = manager
            .client
            .list_pods_on_node(self.node_name())
            .await
            .context(error::ClusterReadSnafu)?
            .into_iter()
            .filter(|pod| keys.iter().any(|key| pod.labels().contains_key(key)))
            .collect();
        if labelled.is_empty() {
            return self
                .transition_object(CycleNodeStatusPhase::DrainingPods)
                .await;
        }

        for pod in &labelled {
            manager
                .client
                .remove_pod_labels(pod, &keys)
                .await
                .context(error::ClusterWriteSnafu)?;
        }
        event!(
            Level::INFO,
            cns = %self.name(),
            "Removed labels {:?} from pods {:?}",
            keys,
            pod_names(&labelled)
        );
        Ok(Transition::requeue_after(manager.config.remove_labels_requeue))
    }

    /// Makes one pass at removing the node's pods.
    pub(super) async fn transition_draining_pods(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let config = &manager.config;
        let node_name = self.node_name().to_string();
        if self.timed_out(Utc::now())? {
            return self
                .fail(format!("timed out draining node '{}'", node_name))
                .await;
        }

        let pods = manager
            .client
            .list_pods_on_node(&node_name)
            .await
            .context(error::ClusterReadSnafu)?;
        let pods = drainable_pods(pods, None);
        if pods.is_empty() {
            event!(Level::INFO, cns = %self.name(), "Node '{}' is drained", node_name);
            return self
                .transition_object(CycleNodeStatusPhase::DeletingNode)
                .await;
        }

        let use_eviction = manager
            .client
            .eviction_supported()
            .await
            .context(error::ClusterReadSnafu)?;
        let outcome = drain_pods(&manager.client, pods, use_eviction).await;
        if !outcome.failures.is_empty() {
            return self
                .fail(format!(
                    "unable to drain node '{}': {}",
                    node_name,
                    outcome.failures.join(", ")
                ))
                .await;
        }
        if !outcome.blocked.is_empty() {
            event!(
                Level::INFO,
                cns = %self.name(),
                "Evictions of {:?} are blocked, trying again in {}",
                outcome.blocked,
                format_duration(config.drain_blocked_requeue)
            );
            return Ok(Transition::requeue_after(config.drain_blocked_requeue));
        }
        Ok(Transition::requeue_after(config.drain_requeue))
    }

    pub(super) async fn transition_deleting_node(&mut self) -> Result<Transition> {
        let node_name = self.node_name().to_string();
        match self.manager.client.delete_node(&node_name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                event!(Level::DEBUG, cns = %self.name(), "Node '{}' was already deleted", node_name);
            }
            Err(err) => return Err(err).context(error::ClusterWriteSnafu),
        }
        self.transition_object(CycleNodeStatusPhase::TerminatingNode)
            .await
    }

    pub(super) async fn transition_terminating_node(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let provider_id = match self.status.current_node.as_ref() {
            Some(node) => node.provider_id.clone(),
            None => {
                return self
                    .fail(format!(
                        "no instance was recorded for node '{}'",
                        self.node_name()
                    ))
                    .await
            }
        };

        manager
            .cloud_provider
            .terminate_instance(&provider_id)
            .await
            .context(error::CloudProviderSnafu {
                action: "terminate instance",
            })?;

        let note = format!(
            "Terminated instance '{}' of node '{}'",
            provider_id,
            self.node_name()
        );
        event!(Level::INFO, cns = %self.name(), "{}", note);
        let transition = self
            .transition_object(CycleNodeStatusPhase::Successful)
            .await?;
        manager
            .publish_event(&self.cns, EventType::Normal, "NodeTerminated", &note)
            .await;
        Ok(transition)
    }
}
