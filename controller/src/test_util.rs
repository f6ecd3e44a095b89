//! In-memory stand-ins for the cluster and cloud provider, used by scenario tests.
use crate::config::TransitionConfig;
use crate::manager::ResourceManager;
use crate::retry::RetryConfig;

use models::cloudprovider::{CloudProvider, Instance, NodeGroups, ProviderError, ProviderResult};
use models::constants::{CYCLE_NODE_STATUS_OWNER_LABEL, NODE_CYCLING_LABEL};
use models::cycle::{
    CycleNodeRequest, CycleNodeRequestSpec, CycleNodeRequestStatus, CycleNodeStatus,
    CycleNodeStatusSpec, CycleNodeStatusStatus,
};
use models::node::drain::error::EvictionError;
use models::node::{api_error, ClusterClient, ClusterClientError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus, ObjectReference, Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Result<T> = std::result::Result<T, ClusterClientError>;

pub const NAMESPACE: &str = "kube-system";

pub fn provider_id(instance_id: &str) -> String {
    format!("aws:///us-east-1a/{}", instance_id)
}

pub fn ready_node(name: &str, instance_id: &str, ip: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "role".to_string(),
                "worker".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id(instance_id)),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            }]),
            ..Default::default()
        }),
    }
}

pub fn instance(instance_id: &str, node_group_name: &str) -> (String, Instance) {
    (
        provider_id(instance_id),
        Instance {
            id: instance_id.to_string(),
            provider_id: provider_id(instance_id),
            node_group_name: node_group_name.to_string(),
            out_of_date: true,
        },
    )
}

pub fn pod(name: &str, node_name: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn cycle_node_request(
    name: &str,
    spec: CycleNodeRequestSpec,
    status: CycleNodeRequestStatus,
) -> CycleNodeRequest {
    let mut cnr = CycleNodeRequest::new(name, spec);
    cnr.metadata.namespace = Some(NAMESPACE.to_string());
    cnr.metadata.uid = Some(format!("{}-uid", name));
    cnr.metadata.creation_timestamp = Some(Time(Utc::now()));
    cnr.status = Some(status);
    cnr
}

pub fn cycle_node_status(
    name: &str,
    spec: CycleNodeStatusSpec,
    status: CycleNodeStatusStatus,
) -> CycleNodeStatus {
    let mut cns = CycleNodeStatus::new(name, spec);
    cns.metadata.namespace = Some(NAMESPACE.to_string());
    cns.status = Some(status);
    cns
}

/// Timings which never make a test wait.
pub fn quick_config() -> TransitionConfig {
    TransitionConfig {
        conflict_retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..Default::default()
    }
}

pub fn manager(cluster: &FakeCluster, cloud: &FakeCloud) -> ResourceManager<FakeCluster> {
    ResourceManager::new(cluster.clone(), Arc::new(cloud.clone()), quick_config())
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}

#[derive(Default)]
pub struct ClusterState {
    pub nodes: BTreeMap<String, Node>,
    pub pods: Vec<Pod>,
    pub cnrs: BTreeMap<String, CycleNodeRequest>,
    pub cnses: BTreeMap<String, CycleNodeStatus>,
    /// Reason and note of every published event.
    pub events: Vec<(String, String)>,
    pub eviction_supported: bool,
    /// Pods whose eviction is answered with the given status code.
    pub eviction_responses: BTreeMap<String, u16>,
    pub evicted: Vec<String>,
    pub deleted_pods: Vec<String>,
    pub deleted_cnrs: Vec<String>,
    /// Status writes to reject with a conflict before accepting any.
    pub status_conflicts: usize,
    /// Uncordons to reject with a conflict before accepting any.
    pub uncordon_conflicts: usize,
    resource_version: u64,
}

impl ClusterState {
    fn next_resource_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    pub fn event_reasons(&self) -> Vec<&str> {
        self.events.iter().map(|(reason, _)| reason.as_str()).collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(node.name_any(), node);
    }

    /// Stores `cnr` as the API server would, returning the stored copy.
    pub fn add_cnr(&self, mut cnr: CycleNodeRequest) -> CycleNodeRequest {
        let mut state = self.state();
        cnr.metadata.resource_version = state.next_resource_version();
        state.cnrs.insert(cnr.name_any(), cnr.clone());
        cnr
    }

    pub fn add_cns(&self, mut cns: CycleNodeStatus) -> CycleNodeStatus {
        let mut state = self.state();
        cns.metadata.resource_version = state.next_resource_version();
        state.cnses.insert(cns.name_any(), cns.clone());
        cns
    }

    fn with_node<T>(&self, name: &str, f: impl FnOnce(&mut Node) -> T) -> Option<T> {
        self.state().nodes.get_mut(name).map(f)
    }
}

fn not_found() -> kube::Error {
    api_error(404, "NotFound")
}

fn set_label(metadata: &mut ObjectMeta, key: &str, value: Option<&str>) {
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    match value {
        Some(value) => {
            labels.insert(key.to_string(), value.to_string());
        }
        None => {
            labels.remove(key);
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self, _selector: &str) -> Result<Vec<Node>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state().nodes.get(name).cloned())
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        self.with_node(name, |node| {
            node.spec.get_or_insert_with(Default::default).unschedulable = Some(true)
        })
        .ok_or_else(|| ClusterClientError::CordonNode {
            source: not_found(),
            name: name.to_string(),
        })
    }

    async fn uncordon_node(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state();
            if state.uncordon_conflicts > 0 {
                state.uncordon_conflicts -= 1;
                return Err(ClusterClientError::UncordonNode {
                    source: api_error(409, "Conflict"),
                    name: name.to_string(),
                });
            }
        }
        self.with_node(name, |node| {
            node.spec.get_or_insert_with(Default::default).unschedulable = None
        })
        .ok_or_else(|| ClusterClientError::UncordonNode {
            source: not_found(),
            name: name.to_string(),
        })
    }

    async fn add_node_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.with_node(name, |node| set_label(&mut node.metadata, key, Some(value)))
            .ok_or_else(|| ClusterClientError::LabelNode {
                source: not_found(),
                name: name.to_string(),
            })
    }

    async fn remove_node_label(&self, name: &str, key: &str) -> Result<()> {
        self.with_node(name, |node| set_label(&mut node.metadata, key, None))
            .ok_or_else(|| ClusterClientError::LabelNode {
                source: not_found(),
                name: name.to_string(),
            })
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.state().nodes.remove(name);
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn remove_pod_labels(&self, pod: &Pod, keys: &[String]) -> Result<()> {
        let mut state = self.state();
        if let Some(stored) = state
            .pods
            .iter_mut()
            .find(|stored| stored.name_any() == pod.name_any())
        {
            for key in keys {
                set_label(&mut stored.metadata, key, None);
            }
        }
        Ok(())
    }

    async fn eviction_supported(&self) -> Result<bool> {
        Ok(self.state().eviction_supported)
    }

    async fn evict_pod(&self, pod: &Pod) -> std::result::Result<(), EvictionError> {
        let mut state = self.state();
        let pod_name = pod.name_any();
        match state.eviction_responses.get(&pod_name).copied() {
            Some(429) => Err(EvictionError::TooManyRequests { pod_name }),
            Some(code) => Err(EvictionError::Rejected {
                pod_name,
                reason: format!("status code {}", code),
            }),
            None => {
                state.pods.retain(|stored| stored.name_any() != pod_name);
                state.evicted.push(pod_name);
                Ok(())
            }
        }
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let mut state = self.state();
        let pod_name = pod.name_any();
        state.pods.retain(|stored| stored.name_any() != pod_name);
        state.deleted_pods.push(pod_name);
        Ok(())
    }

    async fn get_cycle_node_request(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeRequest>> {
        Ok(self.state().cnrs.get(name).cloned())
    }

    async fn update_cycle_node_request_status(
        &self,
        cnr: &CycleNodeRequest,
    ) -> Result<CycleNodeRequest> {
        let mut state = self.state();
        let name = cnr.name_any();
        let conflict = || ClusterClientError::UpdateObjectStatus {
            source: api_error(409, "Conflict"),
            kind: "CycleNodeRequest".to_string(),
            name: name.clone(),
        };
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(conflict());
        }
        let current_version = match state.cnrs.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => {
                return Err(ClusterClientError::UpdateObjectStatus {
                    source: not_found(),
                    kind: "CycleNodeRequest".to_string(),
                    name: name.clone(),
                })
            }
        };
        if current_version != cnr.metadata.resource_version {
            return Err(conflict());
        }
        let resource_version = state.next_resource_version();
        let stored = state.cnrs.get_mut(&name).ok_or_else(conflict)?;
        stored.status = cnr.status.clone();
        stored.metadata.resource_version = resource_version;
        Ok(stored.clone())
    }

    async fn delete_cycle_node_request(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.cnrs.remove(name);
        state.deleted_cnrs.push(name.to_string());
        Ok(())
    }

    async fn list_cycle_node_statuses(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<CycleNodeStatus>> {
        let owner = selector
            .strip_prefix(&format!("{}=", CYCLE_NODE_STATUS_OWNER_LABEL))
            .unwrap_or_default()
            .to_string();
        Ok(self
            .state()
            .cnses
            .values()
            .filter(|cns| cns.labels().get(CYCLE_NODE_STATUS_OWNER_LABEL) == Some(&owner))
            .cloned()
            .collect())
    }

    async fn get_cycle_node_status(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<CycleNodeStatus>> {
        Ok(self.state().cnses.get(name).cloned())
    }

    async fn create_cycle_node_status(&self, cns: &CycleNodeStatus) -> Result<CycleNodeStatus> {
        let name = cns.name_any();
        if self.state().cnses.contains_key(&name) {
            return Err(ClusterClientError::CreateObject {
                source: api_error(409, "AlreadyExists"),
                kind: "CycleNodeStatus".to_string(),
                name,
            });
        }
        Ok(self.add_cns(cns.clone()))
    }

    async fn update_cycle_node_status_status(
        &self,
        cns: &CycleNodeStatus,
    ) -> Result<CycleNodeStatus> {
        let mut state = self.state();
        let name = cns.name_any();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(ClusterClientError::UpdateObjectStatus {
                source: api_error(409, "Conflict"),
                kind: "CycleNodeStatus".to_string(),
                name,
            });
        }
        let resource_version = state.next_resource_version();
        let stored = state.cnses.entry(name).or_insert_with(|| cns.clone());
        stored.status = cns.status.clone();
        stored.metadata.resource_version = resource_version;
        Ok(stored.clone())
    }

    async fn delete_cycle_node_status(&self, _namespace: &str, name: &str) -> Result<()> {
        self.state().cnses.remove(name);
        Ok(())
    }

    async fn publish_event(
        &self,
        _reference: &ObjectReference,
        _type_: EventType,
        reason: &str,
        note: &str,
    ) -> Result<()> {
        self.state()
            .events
            .push((reason.to_string(), note.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CloudState {
    /// Instances attached to a node group, keyed by provider ID.
    pub instances: BTreeMap<String, Instance>,
    /// Instances which exist but are no longer in their node group.
    pub detached: BTreeMap<String, Instance>,
    pub not_ready: BTreeSet<String>,
    /// Instances some other actor is already detaching.
    pub already_detaching: BTreeSet<String>,
    pub detach_failures: BTreeSet<String>,
    pub detach_calls: Vec<String>,
    pub attach_calls: Vec<String>,
    pub terminated: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    pub fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    pub fn add_instance(&self, instance_id: &str, node_group_name: &str) {
        let (key, instance) = instance(instance_id, node_group_name);
        self.state().instances.insert(key, instance);
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn name(&self) -> String {
        "fake".to_string()
    }

    async fn instances_exist(&self, provider_ids: &[String]) -> ProviderResult<Vec<String>> {
        let state = self.state();
        Ok(provider_ids
            .iter()
            .filter(|id| state.instances.contains_key(*id) || state.detached.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_node_groups(&self, names: &[String]) -> ProviderResult<Box<dyn NodeGroups>> {
        Ok(Box::new(FakeNodeGroups {
            cloud: self.clone(),
            names: names.to_vec(),
        }))
    }

    async fn terminate_instance(&self, provider_id: &str) -> ProviderResult<()> {
        let mut state = self.state();
        if state.instances.remove(provider_id).is_none() && state.detached.remove(provider_id).is_none()
        {
            return Err(ProviderError::new_with_context(format!(
                "no instance '{}'",
                provider_id
            )));
        }
        state.terminated.push(provider_id.to_string());
        Ok(())
    }
}

pub struct FakeNodeGroups {
    cloud: FakeCloud,
    names: Vec<String>,
}

impl FakeNodeGroups {
    fn select(&self, ready: Option<bool>) -> BTreeMap<String, Instance> {
        let state = self.cloud.state();
        state
            .instances
            .iter()
            .filter(|(_, instance)| self.names.iter().any(|name| name == instance.node_group_name()))
            .filter(|(id, _)| ready.map_or(true, |ready| ready != state.not_ready.contains(*id)))
            .map(|(id, instance)| (id.clone(), instance.clone()))
            .collect()
    }
}

#[async_trait]
impl NodeGroups for FakeNodeGroups {
    fn instances(&self) -> BTreeMap<String, Instance> {
        self.select(None)
    }

    fn ready_instances(&self) -> BTreeMap<String, Instance> {
        self.select(Some(true))
    }

    fn not_ready_instances(&self) -> BTreeMap<String, Instance> {
        self.select(Some(false))
    }

    async fn detach_instance(&self, provider_id: &str) -> ProviderResult<bool> {
        let mut state = self.cloud.state();
        state.detach_calls.push(provider_id.to_string());
        if state.detach_failures.contains(provider_id) {
            return Err(ProviderError::new_with_context("throttled"));
        }
        if state.already_detaching.contains(provider_id) {
            return Ok(true);
        }
        if let Some(instance) = state.instances.remove(provider_id) {
            state.detached.insert(provider_id.to_string(), instance);
        }
        Ok(false)
    }

    async fn attach_instance(&self, provider_id: &str, _node_group_name: &str) -> ProviderResult<bool> {
        let mut state = self.cloud.state();
        state.attach_calls.push(provider_id.to_string());
        if state.instances.contains_key(provider_id) {
            return Ok(true);
        }
        match state.detached.remove(provider_id) {
            Some(instance) => {
                state.instances.insert(provider_id.to_string(), instance);
                Ok(false)
            }
            None => Err(ProviderError::new_with_context(format!(
                "no instance '{}'",
                provider_id
            ))),
        }
    }
}

/// Marks `node` as claimed by the request `cnr_name`.
pub fn claimed(mut node: Node, cnr_name: &str) -> Node {
    set_label(&mut node.metadata, NODE_CYCLING_LABEL, Some(cnr_name));
    node
}
