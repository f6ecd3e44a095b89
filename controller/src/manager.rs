//! Bundles everything a transitioner acts upon.
use crate::checks::HealthCheckEngine;
use crate::config::TransitionConfig;
use crate::retry::retry_on_conflict;

use models::cloudprovider::CloudProvider;
use models::cycle::{CycleNodeRequest, CycleNodeRequestNode, CycleNodeStatus};
use models::node::{ClusterClient, ClusterClientError};
use models::notifier::Notifier;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// The cluster client, cloud provider, optional notifier and timings shared by every
/// transitioner.
pub struct ResourceManager<C: ClusterClient> {
    pub client: C,
    pub cloud_provider: Arc<dyn CloudProvider>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub config: TransitionConfig,
    pub checks: HealthCheckEngine,
}

impl<C: ClusterClient> ResourceManager<C> {
    pub fn new(client: C, cloud_provider: Arc<dyn CloudProvider>, config: TransitionConfig) -> Self {
        let checks = HealthCheckEngine::new(config.health_check_timeout);
        ResourceManager {
            client,
            cloud_provider,
            notifier: None,
            config,
            checks,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Records a Kubernetes Event against `obj`. Failing to do so is logged and otherwise
    /// ignored: events are informational.
    pub async fn publish_event<K>(&self, obj: &K, type_: EventType, reason: &str, note: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        let reference = obj.object_ref(&());
        if let Err(err) = self
            .client
            .publish_event(&reference, type_, reason, note)
            .await
        {
            event!(
                Level::WARN,
                "Unable to publish '{}' event for '{}': '{}'",
                reason,
                obj.name_any(),
                err
            );
        }
    }

    pub async fn notify_cycling_started(&self, cnr: &CycleNodeRequest) {
        if let Some(notifier) = self.notifier.as_ref() {
            if let Err(err) = notifier.cycling_started(cnr).await {
                event!(Level::WARN, "Unable to notify that cycling started: '{}'", err);
            }
        }
    }

    pub async fn notify_phase_transitioned(&self, cnr: &CycleNodeRequest) {
        if let Some(notifier) = self.notifier.as_ref() {
            if let Err(err) = notifier.phase_transitioned(cnr).await {
                event!(Level::WARN, "Unable to notify of phase transition: '{}'", err);
            }
        }
    }

    pub async fn notify_nodes_selected(&self, cnr: &CycleNodeRequest, nodes: &[CycleNodeRequestNode]) {
        if nodes.is_empty() {
            return;
        }
        if let Some(notifier) = self.notifier.as_ref() {
            if let Err(err) = notifier.nodes_selected(cnr, nodes).await {
                event!(Level::WARN, "Unable to notify of selected nodes: '{}'", err);
            }
        }
    }

    /// Writes `cnr.status`, retrying when the object was changed underneath us.
    ///
    /// Only the status is ours to write, so on a conflict the latest `resourceVersion` is
    /// fetched and our status written on top of it.
    #[instrument(skip(self, cnr), fields(cnr = %cnr.name_any()), err)]
    pub async fn persist_cnr_status(
        &self,
        cnr: &CycleNodeRequest,
    ) -> Result<CycleNodeRequest, ClusterClientError> {
        let namespace = cnr.namespace().unwrap_or_default();
        let name = cnr.name_any();
        let refresh = AtomicBool::new(false);
        let (refresh, namespace, name) = (&refresh, namespace.as_str(), name.as_str());

        retry_on_conflict(&self.config.conflict_retry, "CycleNodeRequest status update", move || async move {
            let mut desired = cnr.clone();
            if refresh.swap(true, Ordering::SeqCst) {
                if let Some(latest) = self.client.get_cycle_node_request(namespace, name).await? {
                    desired.metadata.resource_version = latest.metadata.resource_version;
                }
            }
            self.client.update_cycle_node_request_status(&desired).await
        })
        .await
    }

    /// Writes `cns.status`, with the same conflict handling as [`Self::persist_cnr_status`].
    #[instrument(skip(self, cns), fields(cns = %cns.name_any()), err)]
    pub async fn persist_cns_status(
        &self,
        cns: &CycleNodeStatus,
    ) -> Result<CycleNodeStatus, ClusterClientError> {
        let namespace = cns.namespace().unwrap_or_default();
        let name = cns.name_any();
        let refresh = AtomicBool::new(false);
        let (refresh, namespace, name) = (&refresh, namespace.as_str(), name.as_str());

        retry_on_conflict(&self.config.conflict_retry, "CycleNodeStatus status update", move || async move {
            let mut desired = cns.clone();
            if refresh.swap(true, Ordering::SeqCst) {
                if let Some(latest) = self.client.get_cycle_node_status(namespace, name).await? {
                    desired.metadata.resource_version = latest.metadata.resource_version;
                }
            }
            self.client.update_cycle_node_status_status(&desired).await
        })
        .await
    }
}
