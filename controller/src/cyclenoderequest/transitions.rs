use super::CycleNodeRequestTransitioner;
use crate::checks::CheckProgress;
use crate::error::{self, Result};
use crate::selection::{
    equilibrium_differences, match_nodes_to_instances, request_node, resolve_named_nodes,
};
use crate::transition::Transition;

use models::constants::{CYCLE_NODE_STATUS_OWNER_LABEL, NODE_CYCLING_LABEL};
use models::cycle::{
    CycleNodeRequestNode, CycleNodeRequestPhase, CycleNodeStatus, CycleNodeStatusSpec,
    K8S_CNR_KIND,
};
use models::duration::format_duration;
use models::node::{
    label_selector_string, node_cycling_label, node_is_ready, ClusterClient, NodeHash,
};

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{event, Level};

impl<C: ClusterClient> CycleNodeRequestTransitioner<'_, C> {
    fn selector(&self) -> String {
        label_selector_string(&self.cnr.spec.selector)
    }

    /// Returns why the request cannot be acted upon, if it cannot.
    fn validation_failure(&self) -> Option<String> {
        let spec = &self.cnr.spec;
        if self.selector().is_empty() {
            return Some("selector must match at least one label".to_string());
        }
        if spec.node_group_names().is_empty() {
            return Some("at least one node group must be given".to_string());
        }
        if let Err(err) = spec.cycle_settings.check() {
            return Some(err.to_string());
        }
        if spec.cycle_settings.method.is_none() {
            return Some("cycle method must be one of 'Drain' or 'Wait'".to_string());
        }
        let checks = spec
            .health_checks
            .iter()
            .chain(spec.pre_termination_checks.iter().map(|check| &check.health_check));
        for check in checks {
            if let Err(err) = check.check() {
                return Some(err.to_string());
            }
        }
        None
    }

    pub(super) async fn transition_undefined(&mut self) -> Result<Transition> {
        if let Some(reason) = self.validation_failure() {
            return self
                .transition_to_healing(format!("validation failed: {}", reason))
                .await;
        }
        self.transition_object(CycleNodeRequestPhase::Pending).await
    }

    /// Waits for the node groups to be in equilibrium, then chooses the nodes to cycle.
    pub(super) async fn transition_pending(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let spec = self.cnr.spec.clone();
        let config = &manager.config;
        let now = Utc::now();

        let nodes = manager
            .list_ready_nodes(&self.selector(), true)
            .await
            .context(error::ClusterReadSnafu)?;
        let nodes = manager
            .nodes_in_cloud(nodes)
            .await
            .context(error::CloudProviderSnafu {
                action: "check instances exist",
            })?;
        let node_groups = manager
            .cloud_provider
            .get_node_groups(&spec.node_group_names())
            .await
            .context(error::CloudProviderSnafu {
                action: "describe node groups",
            })?;
        let instances = node_groups.instances();

        if nodes.len() != instances.len() {
            let (nodes_without_instance, instances_without_node) =
                equilibrium_differences(&nodes, &instances);
            event!(
                Level::WARN,
                cnr = %self.name(),
                "Waiting for equilibrium: {} nodes but {} instances. Nodes without instances: {:?}. Instances without nodes: {:?}",
                nodes.len(),
                instances.len(),
                nodes_without_instance,
                instances_without_node
            );

            let started = match self.corrupt(self.status.equilibrium_wait_started())? {
                Some(started) => started,
                None => {
                    self.status.set_equilibrium_wait_started(now);
                    now
                }
            };
            let waited = (now - started).to_std().unwrap_or(Duration::ZERO);
            if waited >= config.node_equilibrium_wait_limit {
                return self
                    .transition_to_healing(format!(
                        "node groups did not reach equilibrium within {}: nodes without instances {:?}, instances without nodes {:?}",
                        format_duration(config.node_equilibrium_wait_limit),
                        nodes_without_instance,
                        instances_without_node
                    ))
                    .await;
            }

            self.persist().await?;
            let requeue = waited
                .max(config.transition_duration)
                .min(config.equilibrium_max_requeue);
            return Ok(Transition::requeue_after(requeue));
        }
        self.status.equilibrium_wait_started = None;

        let candidates = match_nodes_to_instances(&nodes, &instances);
        let targets = if spec.node_names.is_empty() {
            candidates.clone()
        } else {
            let (found, missing) = resolve_named_nodes(&spec.node_names, &candidates);
            if !missing.is_empty() {
                if !spec.validation_options.skip_missing_named_nodes {
                    return self
                        .transition_to_healing(format!(
                            "named nodes not found: {}",
                            missing.join(", ")
                        ))
                        .await;
                }
                event!(
                    Level::WARN,
                    cnr = %self.name(),
                    "Skipping named nodes which were not found: {}",
                    missing.join(", ")
                );
            }
            found
        };
        if targets.is_empty() {
            return self
                .transition_to_healing("no nodes matched the request".to_string())
                .await;
        }
        self.status.nodes_to_terminate = targets.clone();
        self.status.nodes_available = targets;

        // A request with the same name may have run before. Its children would confuse reaping.
        self.delete_children().await?;

        if !spec.health_checks.is_empty() {
            if !spec.skip_initial_health_checks {
                if let Err(err) = manager
                    .checks
                    .run_initial_health_checks(&spec.health_checks, &candidates)
                    .await
                {
                    return self
                        .transition_to_healing(format!("initial health checks failed: {}", err))
                        .await;
                }
            }
            // Existing nodes are not checked again while cycling; only their replacements are.
            for node in &candidates {
                self.status
                    .health_checks
                    .entry(node.hash().to_string())
                    .or_default()
                    .skip = true;
            }
        }

        let transition = self
            .transition_object(CycleNodeRequestPhase::Initialised)
            .await?;
        let note = format!(
            "Cycling {} nodes in batches of up to {}",
            self.status.nodes_to_terminate.len(),
            self.concurrency()
        );
        manager
            .publish_event(&self.cnr, EventType::Normal, "CyclingStarted", &note)
            .await;
        manager.notify_cycling_started(&self.cnr).await;
        Ok(transition)
    }

    /// Selects the next batch of nodes and detaches them from their node groups.
    pub(super) async fn transition_initialised(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let now = Utc::now();

        let nodes: BTreeMap<String, _> = manager
            .client
            .list_nodes(&self.selector())
            .await
            .context(error::ClusterReadSnafu)?
            .into_iter()
            .map(|node| (node.name_any(), node))
            .collect();

        let capacity = (self.concurrency() - self.status.active_children).max(0) as usize;
        let mut selected: Vec<CycleNodeRequestNode> = Vec::new();
        let mut available = Vec::new();
        for node in std::mem::take(&mut self.status.nodes_available) {
            let kube_node = match nodes.get(&node.name) {
                Some(kube_node) if NodeHash::for_node(kube_node) == node.hash() => kube_node,
                _ => {
                    event!(
                        Level::WARN,
                        cnr = %self.name(),
                        "Node '{}' no longer exists, it will not be cycled",
                        node.name
                    );
                    self.status
                        .nodes_to_terminate
                        .retain(|target| target.hash() != node.hash());
                    continue;
                }
            };

            if selected.len() >= capacity {
                available.push(node);
            } else if !node_is_ready(kube_node) {
                event!(Level::INFO, "Node '{}' is not ready, skipping for now", node.name);
                available.push(node);
            } else if let Some(owner) = node_cycling_label(kube_node) {
                event!(
                    Level::INFO,
                    "Node '{}' is already being cycled by '{}', skipping for now",
                    node.name,
                    owner
                );
                available.push(node);
            } else {
                selected.push(node);
            }
        }
        self.status.nodes_available = available;

        if selected.is_empty() {
            if self.status.active_children > 0 {
                self.status.selection_wait_started = None;
                return self
                    .transition_object(CycleNodeRequestPhase::WaitingTermination)
                    .await;
            }
            if !self.status.nodes_available.is_empty() {
                return self.wait_for_blocked_nodes(now).await;
            }
            self.status.selection_wait_started = None;
            return self.check_if_transitioning().await;
        }
        self.status.selection_wait_started = None;

        let newly_selected: Vec<CycleNodeRequestNode> = selected
            .iter()
            .filter(|node| self.status.selected_nodes.insert(node.hash().to_string()))
            .cloned()
            .collect();
        manager.notify_nodes_selected(&self.cnr, &newly_selected).await;

        let node_groups = manager
            .cloud_provider
            .get_node_groups(&self.cnr.spec.node_group_names())
            .await
            .context(error::CloudProviderSnafu {
                action: "describe node groups",
            })?;
        let unclaimed_nodes = manager
            .list_ready_nodes(&self.selector(), false)
            .await
            .context(error::ClusterReadSnafu)?;
        self.status.nodes_before_scale_up = unclaimed_nodes.len() as i64;
        self.status.instances_before_scale_up = node_groups.ready_instances().len() as i64;

        let mut batch = Vec::new();
        let mut failures = Vec::new();
        for node in selected {
            match node_groups.detach_instance(&node.provider_id).await {
                Ok(false) => batch.push(node),
                Ok(true) => {
                    event!(
                        Level::WARN,
                        cnr = %self.name(),
                        "Instance of node '{}' is already being detached, it will not be cycled",
                        node.name
                    );
                    self.status
                        .nodes_to_terminate
                        .retain(|target| target.hash() != node.hash());
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        cnr = %self.name(),
                        "Unable to detach instance of node '{}': '{}'",
                        node.name,
                        err
                    );
                    failures.push(format!("{}: {}", node.name, err));
                    self.status.nodes_available.push(node);
                }
            }
        }

        if batch.is_empty() {
            if !failures.is_empty() {
                return self
                    .transition_to_healing(format!(
                        "unable to detach any instance: {}",
                        failures.join(", ")
                    ))
                    .await;
            }
            return self
                .transition_object(CycleNodeRequestPhase::Initialised)
                .await;
        }

        event!(
            Level::INFO,
            cnr = %self.name(),
            "Detached {} instances, waiting for replacements",
            batch.len()
        );
        self.status.current_nodes = batch;
        self.status.set_scale_up_started(now);
        self.transition_object(CycleNodeRequestPhase::ScalingUp).await
    }

    /// Stays in Initialised while every remaining target is either not ready or claimed by
    /// another request, and nothing of ours is being cycled. Heals once that has lasted longer
    /// than `node_selection_wait_limit`.
    async fn wait_for_blocked_nodes(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        let limit = self.manager.config.node_selection_wait_limit;
        let blocked: Vec<String> = self
            .status
            .nodes_available
            .iter()
            .map(|node| node.name.clone())
            .collect();

        let started = match self.corrupt(self.status.selection_wait_started())? {
            Some(started) => started,
            None => {
                self.status.set_selection_wait_started(now);
                now
            }
        };
        let waited = (now - started).to_std().unwrap_or(Duration::ZERO);
        if waited >= limit {
            return self
                .transition_to_healing(format!(
                    "nodes could not be selected within {}: {}",
                    format_duration(limit),
                    blocked.join(", ")
                ))
                .await;
        }

        event!(
            Level::INFO,
            cnr = %self.name(),
            "No node can be selected yet, waited {} on {:?}",
            format_duration(waited),
            blocked
        );
        self.persist().await?;
        Ok(Transition::requeue_after(self.transition_duration()))
    }

    /// Decides between WaitingTermination and Successful when there is nothing left to select.
    ///
    /// Nodes we have labelled which are still Ready, and still have an instance in the cloud
    /// provider, are still being cycled.
    async fn check_if_transitioning(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let in_progress: Vec<_> = manager
            .list_ready_nodes(&self.selector(), true)
            .await
            .context(error::ClusterReadSnafu)?
            .into_iter()
            .filter(|node| self.claimed_by_us(node_cycling_label(node)))
            .collect();
        if in_progress.is_empty() {
            return self.transition_to_successful().await;
        }

        let in_cloud = manager
            .nodes_in_cloud(in_progress)
            .await
            .context(error::CloudProviderSnafu {
                action: "check instances exist",
            })?;
        if in_cloud.is_empty() {
            return self.transition_to_successful().await;
        }
        self.transition_object(CycleNodeRequestPhase::WaitingTermination)
            .await
    }

    async fn transition_to_successful(&mut self) -> Result<Transition> {
        let note = format!("Cycled {} nodes", self.status.num_nodes_cycled);
        let transition = self
            .transition_object(CycleNodeRequestPhase::Successful)
            .await?;
        self.manager
            .publish_event(&self.cnr, EventType::Normal, "CyclingSucceeded", &note)
            .await;
        Ok(transition)
    }

    /// Waits for the node groups to replace the detached batch.
    pub(super) async fn transition_scaling_up(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let config = &manager.config;
        let now = Utc::now();

        let started = match self.corrupt(self.status.scale_up_started())? {
            Some(started) => started,
            None => {
                self.status.set_scale_up_started(now);
                now
            }
        };
        let waited = (now - started).to_std().unwrap_or(Duration::ZERO);
        if waited < config.scale_up_wait {
            self.persist().await?;
            return Ok(Transition::requeue_after(
                (config.scale_up_wait - waited).max(config.transition_duration),
            ));
        }
        if waited > config.scale_up_limit {
            return self
                .transition_to_healing(format!(
                    "node groups did not scale up within {}",
                    format_duration(config.scale_up_limit)
                ))
                .await;
        }

        let mut remaining = Vec::new();
        for node in std::mem::take(&mut self.status.current_nodes) {
            let kube_node = manager
                .client
                .get_node(&node.name)
                .await
                .context(error::ClusterReadSnafu)?;
            match kube_node {
                Some(kube_node) if NodeHash::for_node(&kube_node) == node.hash() => {
                    remaining.push(node)
                }
                _ => {
                    event!(
                        Level::WARN,
                        cnr = %self.name(),
                        "Node '{}' disappeared while scaling up, most likely a race with another actor. Dropping it from the batch",
                        node.name
                    );
                    self.status
                        .nodes_to_terminate
                        .retain(|target| target.hash() != node.hash());
                    self.status.nodes_before_scale_up -= 1;
                }
            }
        }
        self.status.current_nodes = remaining;
        if self.status.current_nodes.is_empty() {
            return self
                .transition_object(CycleNodeRequestPhase::Initialised)
                .await;
        }

        let node_groups = manager
            .cloud_provider
            .get_node_groups(&self.cnr.spec.node_group_names())
            .await
            .context(error::CloudProviderSnafu {
                action: "describe node groups",
            })?;
        let ready_instances = node_groups.ready_instances().len() as i64;
        let ready_nodes = manager
            .list_ready_nodes(&self.selector(), false)
            .await
            .context(error::ClusterReadSnafu)?
            .len() as i64;
        let wanted_nodes =
            self.status.nodes_before_scale_up + self.status.current_nodes.len() as i64;

        if ready_instances >= self.status.instances_before_scale_up && ready_nodes >= wanted_nodes {
            return self
                .transition_object(CycleNodeRequestPhase::CordoningNode)
                .await;
        }

        event!(
            Level::INFO,
            cnr = %self.name(),
            "Waiting for replacements: {}/{} instances ready, {}/{} nodes ready",
            ready_instances,
            self.status.instances_before_scale_up,
            ready_nodes,
            wanted_nodes
        );
        self.persist().await?;
        Ok(Transition::requeue_after(config.transition_duration))
    }

    /// Checks the replacement nodes, then claims the batch and hands it over to children.
    pub(super) async fn transition_cordoning_node(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let spec = self.cnr.spec.clone();
        let now = Utc::now();
        let name = self.name();

        if !spec.health_checks.is_empty() {
            let batch: Vec<NodeHash> = self
                .status
                .current_nodes
                .iter()
                .map(CycleNodeRequestNode::hash)
                .collect();
            let new_nodes: Vec<CycleNodeRequestNode> = manager
                .list_ready_nodes(&self.selector(), false)
                .await
                .context(error::ClusterReadSnafu)?
                .iter()
                .map(|node| request_node(node, ""))
                .filter(|node| !batch.contains(&node.hash()))
                .collect();

            let progress = manager
                .checks
                .run_cycling_health_checks(
                    &spec.health_checks,
                    &new_nodes,
                    &mut self.status.health_checks,
                    now,
                )
                .await;
            match progress {
                Ok(CheckProgress::Complete) => {}
                Ok(CheckProgress::Pending) => {
                    self.persist().await?;
                    return Ok(Transition::requeue_after(self.transition_duration()));
                }
                Err(err) => {
                    return self
                        .transition_to_healing(format!("health checks failed: {}", err))
                        .await
                }
            }
        }

        for node in self.status.current_nodes.clone() {
            let claimed = match manager.client.cordon_node(&node.name).await {
                Ok(()) => {
                    manager
                        .client
                        .add_node_label(&node.name, NODE_CYCLING_LABEL, &name)
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = claimed {
                return self
                    .transition_to_healing(format!("unable to cordon node '{}': {}", node.name, err))
                    .await;
            }
        }

        if !spec.pre_termination_checks.is_empty() && !spec.skip_pre_termination_checks {
            let current_nodes = self.status.current_nodes.clone();
            let progress = manager
                .checks
                .run_pre_termination_checks(
                    &spec.pre_termination_checks,
                    &current_nodes,
                    &mut self.status.pre_termination_checks,
                    now,
                )
                .await;
            match progress {
                Ok(CheckProgress::Complete) => {}
                Ok(CheckProgress::Pending) => {
                    self.persist().await?;
                    return Ok(Transition::requeue_after(self.transition_duration()));
                }
                Err(err) => {
                    return self
                        .transition_to_healing(format!("pre-termination checks failed: {}", err))
                        .await
                }
            }
        }

        for node in self.status.current_nodes.clone() {
            let child = self.child_for(&node)?;
            match manager.client.create_cycle_node_status(&child).await {
                Ok(_) => {
                    event!(Level::INFO, cnr = %name, "Created '{}'", child.name_any());
                }
                Err(err) if err.is_already_exists() => {
                    event!(Level::DEBUG, cnr = %name, "'{}' already exists", child.name_any());
                }
                Err(err) => {
                    return self
                        .transition_to_healing(format!(
                            "unable to create CycleNodeStatus for node '{}': {}",
                            node.name, err
                        ))
                        .await
                }
            }
        }

        self.status.current_nodes.clear();
        self.transition_object(CycleNodeRequestPhase::WaitingTermination)
            .await
    }

    /// Builds the CycleNodeStatus which cycles `node`, owned by this request.
    pub(super) fn child_for(&self, node: &CycleNodeRequestNode) -> Result<CycleNodeStatus> {
        let owner = self
            .cnr
            .controller_owner_ref(&())
            .context(error::MissingMetadataSnafu {
                kind: K8S_CNR_KIND,
                field: "metadata.uid",
            })?;

        Ok(CycleNodeStatus {
            metadata: ObjectMeta {
                name: Some(self.cnr.child_name(&node.name)),
                namespace: self.cnr.namespace(),
                labels: Some(BTreeMap::from([(
                    CYCLE_NODE_STATUS_OWNER_LABEL.to_string(),
                    self.name(),
                )])),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: CycleNodeStatusSpec {
                node_name: node.name.clone(),
                cycle_settings: self.cnr.spec.cycle_settings.clone(),
            },
            status: None,
        })
    }

    pub(super) async fn transition_waiting_termination(&mut self) -> Result<Transition> {
        let reaped = self.reap_children(true).await?;

        if !reaped.failures.is_empty() {
            return self
                .transition_to_healing(format!(
                    "nodes failed to cycle: {}",
                    reaped.failures.join(", ")
                ))
                .await;
        }
        if self.status.nodes_available.is_empty() && reaped.in_progress > 0 {
            return Ok(Transition::requeue_after(self.transition_duration()));
        }
        if reaped.in_progress as i64 <= self.concurrency() / 2 {
            return self
                .transition_object(CycleNodeRequestPhase::Initialised)
                .await;
        }
        Ok(Transition::requeue_after(self.transition_duration()))
    }

    /// Returns every target node to service, then fails the request.
    pub(super) async fn transition_healing(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let name = self.name();
        let mut errors = Vec::new();

        let node_groups = match manager
            .cloud_provider
            .get_node_groups(&self.cnr.spec.node_group_names())
            .await
        {
            Ok(node_groups) => Some(node_groups),
            Err(err) => {
                errors.push(format!("unable to describe node groups: {}", err));
                None
            }
        };

        for node in self.status.nodes_to_terminate.clone() {
            let kube_node = match manager.client.get_node(&node.name).await {
                Ok(Some(kube_node)) => kube_node,
                Ok(None) => {
                    event!(
                        Level::INFO,
                        cnr = %name,
                        "Node '{}' no longer exists, nothing to heal",
                        node.name
                    );
                    continue;
                }
                Err(err) => {
                    errors.push(format!("{}: {}", node.name, err));
                    continue;
                }
            };
            if let Some(owner) = node_cycling_label(&kube_node).filter(|owner| *owner != name) {
                event!(
                    Level::WARN,
                    cnr = %name,
                    "Node '{}' is being cycled by '{}', leaving it alone",
                    node.name,
                    owner
                );
                continue;
            }

            if let Some(node_groups) = node_groups.as_ref() {
                match node_groups
                    .attach_instance(&node.provider_id, &node.node_group_name)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => event!(
                        Level::INFO,
                        cnr = %name,
                        "Re-attached instance of node '{}'",
                        node.name
                    ),
                    Err(err) => errors.push(format!("{}: {}", node.name, err)),
                }
            }

            if let Err(err) = self.release_node(&node.name).await {
                errors.push(err);
            }
        }

        let reason = (!errors.is_empty())
            .then(|| format!("errors while healing: {}", errors.join(", ")));
        self.transition_to_failed(reason).await
    }

    pub(super) async fn transition_failed(&mut self) -> Result<Transition> {
        let reaped = self.reap_children(false).await?;
        if reaped.in_progress > 0 {
            return Ok(Transition::requeue_after(self.transition_duration()));
        }
        self.persist().await?;
        Ok(Transition::done())
    }

    pub(super) async fn transition_successful(&mut self) -> Result<Transition> {
        let manager = self.manager;
        let config = &manager.config;

        let reaped = self.reap_children(false).await?;
        if reaped.in_progress > 0 {
            return Ok(Transition::requeue_after(self.transition_duration()));
        }
        self.persist().await?;

        if !config.delete_cnr_on_success {
            return Ok(Transition::done());
        }
        let created = self
            .cnr
            .creation_timestamp()
            .map(|created| created.0)
            .context(error::MissingMetadataSnafu {
                kind: K8S_CNR_KIND,
                field: "metadata.creationTimestamp",
            })?;
        let age = (Utc::now() - created).to_std().unwrap_or(Duration::ZERO);
        if age < config.delete_cnr_expiry {
            return Ok(Transition::requeue_after(config.delete_cnr_requeue));
        }

        event!(
            Level::INFO,
            cnr = %self.name(),
            "Deleting request which succeeded {} ago",
            format_duration(age)
        );
        manager
            .client
            .delete_cycle_node_request(&self.namespace(), &self.name())
            .await
            .context(error::ClusterWriteSnafu)?;
        Ok(Transition::done())
    }
}
