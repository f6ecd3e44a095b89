use super::drain::error::EvictionError;
use super::error::{self, Result};
use crate::constants::{self, EVICTION_SUBRESOURCE};
use crate::cycle::{CycleNodeRequest, CycleNodeStatus, K8S_CNR_KIND, K8S_CNS_KIND};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(any(test, feature = "mockall"))]
use mockall::{mock, predicate::*};

#[async_trait]
/// A trait providing an interface to the parts of the cluster which cycling acts upon: Nodes,
/// their Pods, and the cycling custom resources. This is provided as a trait in order to allow
/// mocks to be used for testing purposes.
pub trait ClusterClient: Clone + Sized + Send + Sync {
    /// Lists the Nodes matching a label selector. An empty selector lists every Node.
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>>;
    /// Fetches a Node, returning `None` if it does not exist.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon_node(&self, name: &str) -> Result<()>;
    /// Marks the given node as scheduleable, allowing Pods to be deployed onto it.
    async fn uncordon_node(&self, name: &str) -> Result<()>;
    async fn add_node_label(&self, name: &str, key: &str, value: &str) -> Result<()>;
    async fn remove_node_label(&self, name: &str, key: &str) -> Result<()>;
    /// Deletes a Node. Deleting a Node which is already gone succeeds.
    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    async fn remove_pod_labels(&self, pod: &Pod, keys: &[String]) -> Result<()>;
    /// Whether the cluster serves the Pod eviction subresource.
    async fn eviction_supported(&self) -> Result<bool>;
    /// Creates an eviction for the Pod. Evicting a Pod which is already gone succeeds.
    async fn evict_pod(&self, pod: &Pod) -> std::result::Result<(), EvictionError>;
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    async fn get_cycle_node_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeRequest>>;
    /// Writes the `.status` of a CycleNodeRequest. The write is rejected with a conflict if the
    /// object has changed since its `resourceVersion` was read.
    async fn update_cycle_node_request_status(
        &self,
        cnr: &CycleNodeRequest,
    ) -> Result<CycleNodeRequest>;
    async fn delete_cycle_node_request(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_cycle_node_statuses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<CycleNodeStatus>>;
    async fn get_cycle_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>>;
    async fn create_cycle_node_status(&self, cns: &CycleNodeStatus) -> Result<CycleNodeStatus>;
    /// Writes the `.status` of a CycleNodeStatus, with the same conflict semantics as
    /// [`ClusterClient::update_cycle_node_request_status`].
    async fn update_cycle_node_status_status(
        &self,
        cns: &CycleNodeStatus,
    ) -> Result<CycleNodeStatus>;
    /// Deletes a CycleNodeStatus. Deleting one which is already gone succeeds.
    async fn delete_cycle_node_status(&self, namespace: &str, name: &str) -> Result<()>;

    /// Records a Kubernetes Event against the referenced object.
    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> Result<()>;
}

#[cfg(any(test, feature = "mockall"))]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>>;
        async fn get_node(&self, name: &str) -> Result<Option<Node>>;
        async fn cordon_node(&self, name: &str) -> Result<()>;
        async fn uncordon_node(&self, name: &str) -> Result<()>;
        async fn add_node_label(&self, name: &str, key: &str, value: &str) -> Result<()>;
        async fn remove_node_label(&self, name: &str, key: &str) -> Result<()>;
        async fn delete_node(&self, name: &str) -> Result<()>;
        async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn remove_pod_labels(&self, pod: &Pod, keys: &[String]) -> Result<()>;
        async fn eviction_supported(&self) -> Result<bool>;
        async fn evict_pod(&self, pod: &Pod) -> std::result::Result<(), EvictionError>;
        async fn delete_pod(&self, pod: &Pod) -> Result<()>;
        async fn get_cycle_node_request(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<CycleNodeRequest>>;
        async fn update_cycle_node_request_status(
            &self,
            cnr: &CycleNodeRequest,
        ) -> Result<CycleNodeRequest>;
        async fn delete_cycle_node_request(&self, namespace: &str, name: &str) -> Result<()>;
        async fn list_cycle_node_statuses(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<CycleNodeStatus>>;
        async fn get_cycle_node_status(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<CycleNodeStatus>>;
        async fn create_cycle_node_status(&self, cns: &CycleNodeStatus) -> Result<CycleNodeStatus>;
        async fn update_cycle_node_status_status(
            &self,
            cns: &CycleNodeStatus,
        ) -> Result<CycleNodeStatus>;
        async fn delete_cycle_node_status(&self, namespace: &str, name: &str) -> Result<()>;
        async fn publish_event(
            &self,
            reference: &ObjectReference,
            type_: EventType,
            reason: &str,
            note: &str,
        ) -> Result<()>;
    }

    impl Clone for ClusterClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterClient for Arc<T>
where
    T: ClusterClient,
{
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>> {
        (**self).list_nodes(selector).await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        (**self).get_node(name).await
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        (**self).cordon_node(name).await
    }

    async fn uncordon_node(&self, name: &str) -> Result<()> {
        (**self).uncordon_node(name).await
    }

    async fn add_node_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        (**self).add_node_label(name, key, value).await
    }

    async fn remove_node_label(&self, name: &str, key: &str) -> Result<()> {
        (**self).remove_node_label(name, key).await
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        (**self).delete_node(name).await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_pods_on_node(node_name).await
    }

    async fn remove_pod_labels(&self, pod: &Pod, keys: &[String]) -> Result<()> {
        (**self).remove_pod_labels(pod, keys).await
    }

    async fn eviction_supported(&self) -> Result<bool> {
        (**self).eviction_supported().await
    }

    async fn evict_pod(&self, pod: &Pod) -> std::result::Result<(), EvictionError> {
        (**self).evict_pod(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        (**self).delete_pod(pod).await
    }

    async fn get_cycle_node_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeRequest>> {
        (**self).get_cycle_node_request(namespace, name).await
    }

    async fn update_cycle_node_request_status(
        &self,
        cnr: &CycleNodeRequest,
    ) -> Result<CycleNodeRequest> {
        (**self).update_cycle_node_request_status(cnr).await
    }

    async fn delete_cycle_node_request(&self, namespace: &str, name: &str) -> Result<()> {
        (**self).delete_cycle_node_request(namespace, name).await
    }

    async fn list_cycle_node_statuses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<CycleNodeStatus>> {
        (**self).list_cycle_node_statuses(namespace, selector).await
    }

    async fn get_cycle_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>> {
        (**self).get_cycle_node_status(namespace, name).await
    }

    async fn create_cycle_node_status(&self, cns: &CycleNodeStatus) -> Result<CycleNodeStatus> {
        (**self).create_cycle_node_status(cns).await
    }

    async fn update_cycle_node_status_status(
        &self,
        cns: &CycleNodeStatus,
    ) -> Result<CycleNodeStatus> {
        (**self).update_cycle_node_status_status(cns).await
    }

    async fn delete_cycle_node_status(&self, namespace: &str, name: &str) -> Result<()> {
        (**self).delete_cycle_node_status(namespace, name).await
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        (**self).publish_event(reference, type_, reason, note).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SClusterClient {
    k8s_client: kube::client::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterClient { k8s_client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }

    /// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
    fn namespaced_pod_api(&self, pod: &Pod) -> Api<Pod> {
        match pod.metadata.namespace.as_ref() {
            Some(ns) => Api::namespaced(self.k8s_client.clone(), ns),
            None => Api::default_namespaced(self.k8s_client.clone()),
        }
    }

    async fn patch_node_labels(&self, name: &str, labels: serde_json::Value) -> Result<()> {
        let patch = json!({ "metadata": { "labels": labels } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::LabelNodeSnafu { name })?;
        Ok(())
    }

    /// Writes an object's `.status` with a merge patch which carries its `resourceVersion`, so
    /// that the API server rejects the write if the object changed underneath us.
    async fn patch_status<K>(&self, kind: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let name = obj.meta().name.clone().context(error::MissingMetadataSnafu {
            kind,
            field: "name",
        })?;
        let namespace = obj.namespace().context(error::MissingMetadataSnafu {
            kind,
            field: "namespace",
        })?;
        let status = serde_json::to_value(obj)
            .context(error::CreateK8SPatchSnafu)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let patch = json!({
            "apiVersion": constants::API_VERSION,
            "kind": kind,
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });

        let api: Api<K> = Api::namespaced(self.k8s_client.clone(), &namespace);
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::UpdateObjectStatusSnafu { kind, name })
    }

    async fn delete_namespaced<K>(&self, kind: &str, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.k8s_client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).context(error::DeleteObjectSnafu { kind, name }),
        }
    }
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        Ok(self
            .nodes()
            .list(&params)
            .await
            .context(error::ListNodesSnafu { selector })?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.nodes()
            .get_opt(name)
            .await
            .context(error::GetNodeSnafu { name })
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, name: &str) -> Result<()> {
        self.nodes()
            .cordon(name)
            .await
            .context(error::CordonNodeSnafu { name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon_node(&self, name: &str) -> Result<()> {
        self.nodes()
            .uncordon(name)
            .await
            .context(error::UncordonNodeSnafu { name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn add_node_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.patch_node_labels(name, json!({ key: value })).await
    }

    #[instrument(skip(self), err)]
    async fn remove_node_label(&self, name: &str, key: &str) -> Result<()> {
        // A null value in a merge patch removes the key.
        self.patch_node_labels(name, json!({ key: null })).await
    }

    #[instrument(skip(self), err)]
    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                event!(Level::INFO, "Node '{}' was already deleted", name);
                Ok(())
            }
            Err(e) => Err(e).context(error::DeleteNodeSnafu { name }),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        Ok(pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await
            .context(error::ListPodsSnafu { node_name })?
            .items)
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn remove_pod_labels(&self, pod: &Pod, keys: &[String]) -> Result<()> {
        let labels: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .map(|key| (key.clone(), serde_json::Value::Null))
            .collect();
        let patch = json!({ "metadata": { "labels": labels } });

        self.namespaced_pod_api(pod)
            .patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::LabelPodSnafu {
                pod_name: pod.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn eviction_supported(&self) -> Result<bool> {
        let resources = self
            .k8s_client
            .list_core_api_resources("v1")
            .await
            .context(error::DiscoverResourcesSnafu)?;
        Ok(resources
            .resources
            .iter()
            .any(|resource| resource.name == EVICTION_SUBRESOURCE))
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn evict_pod(&self, pod: &Pod) -> std::result::Result<(), EvictionError> {
        let pod_name = pod.name_any();
        // A 429 (TOO_MANY_REQUESTS) response code is used to indicate that we must wait to allow
        // a PodDisruptionBudget (PDB) to be satisfied. Anything else is not going to improve by
        // asking again.
        match self
            .namespaced_pod_api(pod)
            .evict(&pod_name, &EvictParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                event!(Level::INFO, "Pod '{}' was already gone", pod_name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 429 => {
                Err(EvictionError::TooManyRequests { pod_name })
            }
            Err(e) => Err(EvictionError::Rejected {
                pod_name,
                reason: e.to_string(),
            }),
        }
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        match self
            .namespaced_pod_api(pod)
            .delete(&pod.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).context(error::DeletePodSnafu {
                pod_name: pod.name_any(),
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_cycle_node_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeRequest>> {
        let api: Api<CycleNodeRequest> = Api::namespaced(self.k8s_client.clone(), namespace);
        api.get_opt(name).await.context(error::GetObjectSnafu {
            kind: K8S_CNR_KIND,
            name,
        })
    }

    #[instrument(skip(self, cnr), fields(cnr = %cnr.name_any()), err)]
    async fn update_cycle_node_request_status(
        &self,
        cnr: &CycleNodeRequest,
    ) -> Result<CycleNodeRequest> {
        self.patch_status(K8S_CNR_KIND, cnr).await
    }

    #[instrument(skip(self), err)]
    async fn delete_cycle_node_request(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_namespaced::<CycleNodeRequest>(K8S_CNR_KIND, namespace, name)
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_cycle_node_statuses(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<CycleNodeStatus>> {
        let api: Api<CycleNodeStatus> = Api::namespaced(self.k8s_client.clone(), namespace);
        Ok(api
            .list(&ListParams::default().labels(selector))
            .await
            .context(error::ListObjectsSnafu {
                kind: K8S_CNS_KIND,
                selector,
            })?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn get_cycle_node_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>> {
        let api: Api<CycleNodeStatus> = Api::namespaced(self.k8s_client.clone(), namespace);
        api.get_opt(name).await.context(error::GetObjectSnafu {
            kind: K8S_CNS_KIND,
            name,
        })
    }

    #[instrument(skip(self, cns), fields(cns = %cns.name_any()), err)]
    async fn create_cycle_node_status(&self, cns: &CycleNodeStatus) -> Result<CycleNodeStatus> {
        let namespace = cns.namespace().context(error::MissingMetadataSnafu {
            kind: K8S_CNS_KIND,
            field: "namespace",
        })?;
        let api: Api<CycleNodeStatus> = Api::namespaced(self.k8s_client.clone(), &namespace);
        api.create(&PostParams::default(), cns)
            .await
            .context(error::CreateObjectSnafu {
                kind: K8S_CNS_KIND,
                name: cns.name_any(),
            })
    }

    #[instrument(skip(self, cns), fields(cns = %cns.name_any()), err)]
    async fn update_cycle_node_status_status(
        &self,
        cns: &CycleNodeStatus,
    ) -> Result<CycleNodeStatus> {
        self.patch_status(K8S_CNS_KIND, cns).await
    }

    #[instrument(skip(self), err)]
    async fn delete_cycle_node_status(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_namespaced::<CycleNodeStatus>(K8S_CNS_KIND, namespace, name)
            .await
    }

    #[instrument(skip(self, reference), err)]
    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        let reporter = Reporter {
            controller: constants::EVENT_REPORTER.to_string(),
            instance: None,
        };
        Recorder::new(self.k8s_client.clone(), reporter, reference.clone())
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: reason.to_string(),
                secondary: None,
            })
            .await
            .context(error::PublishEventSnafu { reason })
    }
}
