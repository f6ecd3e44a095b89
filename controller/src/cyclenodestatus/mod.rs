//! The CycleNodeStatus state machine, which removes a single node on behalf of the
//! CycleNodeRequest that created it.
//!
//! The node is either waited upon until its workloads leave by themselves, or drained. The
//! node object is then deleted and its cloud instance terminated. A node which has already
//! gone is a success.
mod transitions;


use crate::error::{self, Result};
use crate::manager::ResourceManager;
use crate::transition::Transition;

use models::cycle::{
    append_message, CycleError, CycleNodeStatus, CycleNodeStatusPhase, CycleNodeStatusStatus,
    K8S_CNS_KIND,
};
use models::node::ClusterClient;

use chrono::{DateTime, Utc};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// Drives one CycleNodeStatus through a single step of its state machine.
pub struct CycleNodeStatusTransitioner<'a, C: ClusterClient> {
    cns: CycleNodeStatus,
    status: CycleNodeStatusStatus,
    persisted: CycleNodeStatusStatus,
    manager: &'a ResourceManager<C>,
}

impl<'a, C: ClusterClient> CycleNodeStatusTransitioner<'a, C> {
    pub fn new(cns: CycleNodeStatus, manager: &'a ResourceManager<C>) -> Self {
        let status = cns.status.clone().unwrap_or_default();
        CycleNodeStatusTransitioner {
            persisted: status.clone(),
            status,
            cns,
            manager,
        }
    }

    pub fn cns(&self) -> &CycleNodeStatus {
        &self.cns
    }

    pub fn status(&self) -> &CycleNodeStatusStatus {
        &self.status
    }

    #[instrument(skip(self), fields(cns = %self.cns.name_any(), phase = %self.status.phase), err)]
    pub async fn run(&mut self) -> Result<Transition> {
        match self.status.phase {
            CycleNodeStatusPhase::Undefined => self.transition_undefined().await,
            CycleNodeStatusPhase::Pending => self.transition_pending().await,
            CycleNodeStatusPhase::WaitingPods => self.transition_waiting_pods().await,
            CycleNodeStatusPhase::RemovingLabelsFromPods => {
                self.transition_removing_labels().await
            }
            CycleNodeStatusPhase::DrainingPods => self.transition_draining_pods().await,
            CycleNodeStatusPhase::DeletingNode => self.transition_deleting_node().await,
            CycleNodeStatusPhase::TerminatingNode => self.transition_terminating_node().await,
            CycleNodeStatusPhase::Failed | CycleNodeStatusPhase::Successful => {
                Ok(Transition::done())
            }
            CycleNodeStatusPhase::Unknown => error::UnknownPhaseSnafu {
                kind: K8S_CNS_KIND,
                name: self.name(),
            }
            .fail(),
        }
    }

    fn name(&self) -> String {
        self.cns.name_any()
    }

    fn node_name(&self) -> &str {
        &self.cns.spec.node_name
    }

    fn corrupt<T>(&self, result: std::result::Result<T, CycleError>) -> Result<T> {
        result.context(error::CorruptStatusSnafu {
            kind: K8S_CNS_KIND,
            name: self.name(),
        })
    }

    /// Whether the deadline recorded when the node was first looked at has passed.
    fn timed_out(&self, now: DateTime<Utc>) -> Result<bool> {
        let deadline = self.corrupt(self.status.timeout_timestamp())?;
        Ok(deadline.map_or(false, |deadline| now > deadline))
    }

    async fn persist(&mut self) -> Result<()> {
        if self.status == self.persisted {
            return Ok(());
        }

        let mut desired = self.cns.clone();
        desired.status = Some(self.status.clone());
        let updated = self
            .manager
            .persist_cns_status(&desired)
            .await
            .context(error::PersistStatusSnafu {
                kind: K8S_CNS_KIND,
                name: self.name(),
            })?;

        self.cns = updated;
        self.cns.status = Some(self.status.clone());
        self.persisted = self.status.clone();
        Ok(())
    }

    async fn transition_object(&mut self, phase: CycleNodeStatusPhase) -> Result<Transition> {
        let previous = self.status.phase;
        self.status.phase = phase;
        self.persist().await?;

        if previous != phase {
            event!(
                Level::INFO,
                cns = %self.name(),
                "Transitioned from '{}' to '{}'",
                previous,
                phase
            );
        }
        Ok(Transition::requeue_after(self.manager.config.transition_duration))
    }

    /// Records `reason` and fails the node. The owning request notices when it next reaps.
    async fn fail(&mut self, reason: String) -> Result<Transition> {
        if self.status.phase == CycleNodeStatusPhase::Failed {
            return Ok(Transition::done());
        }

        event!(Level::ERROR, cns = %self.name(), "Failed: {}", reason);
        self.status.message = Some(append_message(self.status.message.as_deref(), &reason));
        self.manager
            .publish_event(&self.cns, EventType::Warning, "CycleNodeStatusFailed", &reason)
            .await;
        self.transition_object(CycleNodeStatusPhase::Failed).await
    }
}
