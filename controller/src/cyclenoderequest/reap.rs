use super::CycleNodeRequestTransitioner;
use crate::error::{self, Result};

use models::cycle::CycleNodeStatusPhase;
use models::node::ClusterClient;

use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{event, Level};

/// What became of a request's children during one reap.
#[derive(Debug, Default)]
pub(super) struct Reaped {
    /// One description per child which failed.
    pub failures: Vec<String>,
    pub in_progress: usize,
}

impl<C: ClusterClient> CycleNodeRequestTransitioner<'_, C> {
    /// Accounts for children which have finished, then deletes them.
    ///
    /// The status is persisted before any child is deleted. A successful child is only counted
    /// while its node is still a target, so reaping the same child twice counts it once.
    /// When `record_failures` is set, failed children are reported and left in place until the
    /// request has recorded their failure. Otherwise they are logged and deleted.
    pub(super) async fn reap_children(&mut self, record_failures: bool) -> Result<Reaped> {
        let manager = self.manager;
        let namespace = self.namespace();
        let children = manager
            .client
            .list_cycle_node_statuses(&namespace, &self.children_selector())
            .await
            .context(error::ClusterReadSnafu)?;

        let mut reaped = Reaped::default();
        let mut finished = Vec::new();
        for child in children {
            let node_name = child.spec.node_name.clone();
            match child.phase() {
                CycleNodeStatusPhase::Failed => {
                    let message = child
                        .status
                        .as_ref()
                        .and_then(|status| status.message.clone())
                        .unwrap_or_else(|| "no reason given".to_string());
                    event!(
                        Level::WARN,
                        cnr = %self.name(),
                        "'{}' failed to cycle node '{}': {}",
                        child.name_any(),
                        node_name,
                        message
                    );
                    if record_failures {
                        reaped.failures.push(format!("{}: {}", node_name, message));
                    } else {
                        finished.push(child.name_any());
                    }
                }
                CycleNodeStatusPhase::Successful => {
                    let before = self.status.nodes_to_terminate.len();
                    self.status
                        .nodes_to_terminate
                        .retain(|node| node.name != node_name);
                    if self.status.nodes_to_terminate.len() < before {
                        self.status.num_nodes_cycled += 1;
                    }
                    event!(
                        Level::INFO,
                        cnr = %self.name(),
                        "Node '{}' has been cycled",
                        node_name
                    );
                    finished.push(child.name_any());
                }
                _ => reaped.in_progress += 1,
            }
        }
        self.status.active_children = reaped.in_progress as i64;
        self.persist().await?;

        for child in finished {
            manager
                .client
                .delete_cycle_node_status(&namespace, &child)
                .await
                .context(error::ClusterWriteSnafu)?;
        }
        Ok(reaped)
    }

    /// Deletes every child, whatever its phase.
    pub(super) async fn delete_children(&self) -> Result<()> {
        let manager = self.manager;
        let namespace = self.namespace();
        let children = manager
            .client
            .list_cycle_node_statuses(&namespace, &self.children_selector())
            .await
            .context(error::ClusterReadSnafu)?;

        for child in children {
            event!(
                Level::INFO,
                cnr = %self.name(),
                "Deleting '{}' left over from an earlier request",
                child.name_any()
            );
            manager
                .client
                .delete_cycle_node_status(&namespace, &child.name_any())
                .await
                .context(error::ClusterWriteSnafu)?;
        }
        Ok(())
    }
}
