//! The CycleNodeRequest state machine, which rotates the nodes of whole node groups.
//!
//! A request is validated (Pending), then its target nodes are chosen once the node groups
//! are in equilibrium (Initialised). Batches of at most `concurrency` nodes are then detached
//! from their node group (ScalingUp), cordoned once replacements are up (CordoningNode) and
//! handed over to CycleNodeStatus children (WaitingTermination). Children are reaped as they
//! finish, and the next batch is selected, until no target nodes remain (Successful). Any
//! failure returns the nodes to service (Healing) and fails the request (Failed).
//!
//! Every step reads what it needs from the cluster and the cloud provider, and records its
//! progress in the request's status before moving on, so any step can safely be re-run.
mod reap;
mod transitions;


use crate::error::{self, Result};
use crate::manager::ResourceManager;
use crate::transition::Transition;

use models::constants::NODE_CYCLING_LABEL;
use models::cycle::{
    append_message, CycleError, CycleNodeRequest, CycleNodeRequestPhase, CycleNodeRequestStatus,
    K8S_CNR_KIND,
};
use models::node::ClusterClient;

use kube::runtime::events::EventType;
use kube::ResourceExt;
use snafu::ResultExt;
use std::time::Duration;
use tracing::{event, instrument, Level};

/// Drives one CycleNodeRequest through a single step of its state machine.
pub struct CycleNodeRequestTransitioner<'a, C: ClusterClient> {
    cnr: CycleNodeRequest,
    status: CycleNodeRequestStatus,
    /// The status as it was last read or written, to skip writes which would change nothing.
    persisted: CycleNodeRequestStatus,
    manager: &'a ResourceManager<C>,
}

impl<'a, C: ClusterClient> CycleNodeRequestTransitioner<'a, C> {
    pub fn new(cnr: CycleNodeRequest, manager: &'a ResourceManager<C>) -> Self {
        let status = cnr.status.clone().unwrap_or_default();
        CycleNodeRequestTransitioner {
            persisted: status.clone(),
            status,
            cnr,
            manager,
        }
    }

    pub fn cnr(&self) -> &CycleNodeRequest {
        &self.cnr
    }

    pub fn status(&self) -> &CycleNodeRequestStatus {
        &self.status
    }

    /// Performs the work of the request's current phase.
    #[instrument(skip(self), fields(cnr = %self.cnr.name_any(), phase = %self.status.phase), err)]
    pub async fn run(&mut self) -> Result<Transition> {
        match self.status.phase {
            CycleNodeRequestPhase::Undefined => self.transition_undefined().await,
            CycleNodeRequestPhase::Pending => self.transition_pending().await,
            CycleNodeRequestPhase::Initialised => self.transition_initialised().await,
            CycleNodeRequestPhase::ScalingUp => self.transition_scaling_up().await,
            CycleNodeRequestPhase::CordoningNode => self.transition_cordoning_node().await,
            CycleNodeRequestPhase::WaitingTermination => {
                self.transition_waiting_termination().await
            }
            CycleNodeRequestPhase::Healing => self.transition_healing().await,
            CycleNodeRequestPhase::Failed => self.transition_failed().await,
            CycleNodeRequestPhase::Successful => self.transition_successful().await,
            CycleNodeRequestPhase::Unknown => error::UnknownPhaseSnafu {
                kind: K8S_CNR_KIND,
                name: self.name(),
            }
            .fail(),
        }
    }

    fn name(&self) -> String {
        self.cnr.name_any()
    }

    fn namespace(&self) -> String {
        self.cnr.namespace().unwrap_or_default()
    }

    /// The selector matching the children of this request.
    fn children_selector(&self) -> String {
        format!(
            "{}={}",
            models::constants::CYCLE_NODE_STATUS_OWNER_LABEL,
            self.name()
        )
    }

    /// Whether `label` (the value of a node's cycling label) marks the node as ours.
    fn claimed_by_us(&self, label: Option<&str>) -> bool {
        label == Some(self.name().as_str())
    }

    /// How many nodes may be worked on at once. Without a positive concurrency in the request,
    /// every target node is cycled in one batch.
    fn concurrency(&self) -> i64 {
        match self.cnr.spec.cycle_settings.concurrency {
            concurrency if concurrency > 0 => concurrency,
            _ => (self.status.nodes_to_terminate.len() as i64 + self.status.num_nodes_cycled).max(1),
        }
    }

    fn transition_duration(&self) -> Duration {
        self.manager.config.transition_duration
    }

    fn corrupt<T>(&self, result: std::result::Result<T, CycleError>) -> Result<T> {
        result.context(error::CorruptStatusSnafu {
            kind: K8S_CNR_KIND,
            name: self.name(),
        })
    }

    /// Writes the status if it has changed since it was last read or written.
    async fn persist(&mut self) -> Result<()> {
        if self.status == self.persisted {
            return Ok(());
        }

        let mut desired = self.cnr.clone();
        desired.status = Some(self.status.clone());
        let updated = self
            .manager
            .persist_cnr_status(&desired)
            .await
            .context(error::PersistStatusSnafu {
                kind: K8S_CNR_KIND,
                name: self.name(),
            })?;

        self.cnr = updated;
        self.cnr.status = Some(self.status.clone());
        self.persisted = self.status.clone();
        Ok(())
    }

    /// Moves the request to `phase`, persisting everything recorded so far.
    async fn transition_object(&mut self, phase: CycleNodeRequestPhase) -> Result<Transition> {
        let previous = self.status.phase;
        self.status.phase = phase;
        self.persist().await?;

        if previous != phase {
            event!(
                Level::INFO,
                cnr = %self.name(),
                "Transitioned from '{}' to '{}'",
                previous,
                phase
            );
            self.manager.notify_phase_transitioned(&self.cnr).await;
        }
        Ok(Transition::requeue_after(self.transition_duration()))
    }

    /// Records `reason` and moves the request to Healing, where detached nodes are returned
    /// to service.
    async fn transition_to_healing(&mut self, reason: String) -> Result<Transition> {
        event!(Level::WARN, cnr = %self.name(), "Healing: {}", reason);
        self.status.message = Some(append_message(self.status.message.as_deref(), &reason));
        self.manager
            .publish_event(&self.cnr, EventType::Warning, "CycleNodeRequestHealing", &reason)
            .await;
        self.transition_object(CycleNodeRequestPhase::Healing).await
    }

    /// Moves the request to Failed, recording `reason` if given. A request which has already
    /// failed is left untouched.
    async fn transition_to_failed(&mut self, reason: Option<String>) -> Result<Transition> {
        if self.status.phase == CycleNodeRequestPhase::Failed {
            return Ok(Transition::requeue_after(self.transition_duration()));
        }

        let note = reason.clone().unwrap_or_else(|| "cycling failed".to_string());
        if let Some(reason) = reason {
            self.status.message = Some(append_message(self.status.message.as_deref(), &reason));
        }
        event!(Level::ERROR, cnr = %self.name(), "Failed: {}", note);
        self.manager
            .publish_event(&self.cnr, EventType::Warning, "CycleNodeRequestFailed", &note)
            .await;
        self.transition_object(CycleNodeRequestPhase::Failed).await
    }

    /// Removes our claim on a node which is being returned to service.
    async fn release_node(&self, node_name: &str) -> std::result::Result<(), String> {
        let manager = self.manager;
        crate::retry::retry_on_conflict(&manager.config.conflict_retry, "uncordon", || {
            manager.client.uncordon_node(node_name)
        })
        .await
        .map_err(|err| format!("{}: {}", node_name, err))?;

        manager
            .client
            .remove_node_label(node_name, NODE_CYCLING_LABEL)
            .await
            .map_err(|err| format!("{}: {}", node_name, err))
    }
}
