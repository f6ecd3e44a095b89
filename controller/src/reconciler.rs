//! Connects the transitioners to kube-runtime controllers.
use crate::config::ControllerSettings;
use crate::cyclenoderequest::CycleNodeRequestTransitioner;
use crate::cyclenodestatus::CycleNodeStatusTransitioner;
use crate::error::{self, Error, Result};
use crate::manager::ResourceManager;

use models::cycle::{CycleNodeRequest, CycleNodeStatus, K8S_CNR_KIND, K8S_CNS_KIND};
use models::duration::format_duration;
use models::node::{ClusterClient, K8SClusterClient};

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, ResourceExt};
use snafu::ResultExt;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{event, instrument, Level};

/// Shared by every reconcile.
pub struct Context<C: ClusterClient> {
    pub manager: ResourceManager<C>,
    /// Requests are reconciled one at a time, as they compete for the same nodes.
    cnr_permits: Semaphore,
    cns_permits: Semaphore,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(manager: ResourceManager<C>, settings: &ControllerSettings) -> Self {
        Context {
            manager,
            cnr_permits: Semaphore::new(1),
            cns_permits: Semaphore::new(settings.cns_concurrency),
        }
    }
}

/// Runs one step of a CycleNodeRequest.
///
/// The object handed over by the watcher may predate our own last status write, so the latest
/// copy is read before acting on it.
#[instrument(skip(cnr, ctx), fields(cnr = %cnr.name_any()), err)]
pub async fn reconcile_cnr<C: ClusterClient + 'static>(
    cnr: Arc<CycleNodeRequest>,
    ctx: Arc<Context<C>>,
) -> Result<Action> {
    let _permit = ctx
        .cnr_permits
        .acquire()
        .await
        .context(error::PermitUnavailableSnafu)?;

    let latest = ctx
        .manager
        .client
        .get_cycle_node_request(&cnr.namespace().unwrap_or_default(), &cnr.name_any())
        .await
        .context(error::ClusterReadSnafu)?;
    let latest = match latest {
        Some(latest) => latest,
        None => return Ok(Action::await_change()),
    };

    let mut transitioner = CycleNodeRequestTransitioner::new(latest, &ctx.manager);
    Ok(transitioner.run().await?.into())
}

/// Runs one step of a CycleNodeStatus.
#[instrument(skip(cns, ctx), fields(cns = %cns.name_any()), err)]
pub async fn reconcile_cns<C: ClusterClient + 'static>(
    cns: Arc<CycleNodeStatus>,
    ctx: Arc<Context<C>>,
) -> Result<Action> {
    let _permit = ctx
        .cns_permits
        .acquire()
        .await
        .context(error::PermitUnavailableSnafu)?;

    let latest = ctx
        .manager
        .client
        .get_cycle_node_status(&cns.namespace().unwrap_or_default(), &cns.name_any())
        .await
        .context(error::ClusterReadSnafu)?;
    let latest = match latest {
        Some(latest) => latest,
        None => return Ok(Action::await_change()),
    };

    let mut transitioner = CycleNodeStatusTransitioner::new(latest, &ctx.manager);
    Ok(transitioner.run().await?.into())
}

/// Errors leave the object's status untouched; it is simply reconciled again later.
pub fn error_policy<K: ResourceExt, C: ClusterClient>(
    object: Arc<K>,
    err: &Error,
    ctx: Arc<Context<C>>,
) -> Action {
    let delay = ctx.manager.config.error_requeue;
    event!(
        Level::WARN,
        "Reconciling '{}' failed, trying again in {}: {}",
        object.name_any(),
        format_duration(delay),
        err
    );
    Action::requeue(delay)
}

fn log_reconcile_result<T: Debug, E: Debug>(
    kind: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> futures::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => event!(Level::DEBUG, "Reconciled {} {:?}", kind, object),
            Err(err) => event!(Level::ERROR, "{} reconciliation error: {:?}", kind, err),
        }
        futures::future::ready(())
    }
}

/// Watches both kinds in the configured namespace until the process is signalled to stop.
///
/// Requests are also woken when one of their children changes.
///
/// Nothing is logged until the embedding binary has installed a subscriber, normally with
/// `models::telemetry::init_telemetry_from_env` before this is called.
pub async fn run_controllers(
    client: kube::Client,
    manager: ResourceManager<K8SClusterClient>,
    settings: ControllerSettings,
) {
    let cnrs: Api<CycleNodeRequest> = Api::namespaced(client.clone(), &settings.namespace);
    let cnses: Api<CycleNodeStatus> = Api::namespaced(client, &settings.namespace);
    let context = Arc::new(Context::new(manager, &settings));

    event!(
        Level::INFO,
        namespace = %settings.namespace,
        cns_concurrency = settings.cns_concurrency,
        "Starting controllers"
    );
    let cnr_controller = Controller::new(cnrs, watcher::Config::default())
        .owns(cnses.clone(), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_cnr, error_policy, context.clone())
        .for_each(log_reconcile_result(K8S_CNR_KIND));
    let cns_controller = Controller::new(cnses, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_cns, error_policy, context)
        .for_each(log_reconcile_result(K8S_CNS_KIND));

    futures::join!(cnr_controller, cns_controller);
    event!(Level::INFO, "Controllers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        cycle_node_request, cycle_node_status, manager, ready_node, FakeCloud, FakeCluster,
    };
    use models::cycle::{
        CycleMethod, CycleNodeRequestPhase, CycleNodeRequestSpec, CycleNodeRequestStatus,
        CycleNodeStatusPhase, CycleNodeStatusSpec, CycleNodeStatusStatus, CycleSettings,
    };
    use std::time::Duration;

    fn context(cluster: &FakeCluster, cloud: &FakeCloud) -> Arc<Context<FakeCluster>> {
        Arc::new(Context::new(
            manager(cluster, cloud),
            &ControllerSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_reconcile_cnr_reads_latest_copy() {
        let cluster = FakeCluster::default();
        let cloud = FakeCloud::default();
        let stale = cycle_node_request(
            "cycle-workers",
            CycleNodeRequestSpec::default(),
            CycleNodeRequestStatus::default(),
        );
        let mut latest = stale.clone();
        latest.status = Some(CycleNodeRequestStatus {
            phase: CycleNodeRequestPhase::Failed,
            ..Default::default()
        });
        cluster.add_cnr(latest);

        // The stale copy would fail validation and heal; the latest has already failed.
        let action = reconcile_cnr(Arc::new(stale), context(&cluster, &cloud))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(cluster.state().events.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_deleted_objects() {
        let cluster = FakeCluster::default();
        let cloud = FakeCloud::default();
        let ctx = context(&cluster, &cloud);

        let cnr = cycle_node_request(
            "cycle-workers",
            CycleNodeRequestSpec::default(),
            CycleNodeRequestStatus::default(),
        );
        let action = reconcile_cnr(Arc::new(cnr), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let cns = cycle_node_status(
            "cycle-workers-ip-10-0-0-1",
            CycleNodeStatusSpec::default(),
            CycleNodeStatusStatus::default(),
        );
        let action = reconcile_cns(Arc::new(cns), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_cns_steps_state_machine() {
        let cluster = FakeCluster::default();
        let cloud = FakeCloud::default();
        cluster.add_node(ready_node("ip-10-0-0-1", "i-01", "10.0.0.1"));
        let cns = cluster.add_cns(cycle_node_status(
            "cycle-workers-ip-10-0-0-1",
            CycleNodeStatusSpec {
                node_name: "ip-10-0-0-1".to_string(),
                cycle_settings: CycleSettings {
                    method: Some(CycleMethod::Drain),
                    ..Default::default()
                },
            },
            CycleNodeStatusStatus::default(),
        ));

        let action = reconcile_cns(Arc::new(cns), context(&cluster, &cloud))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(
            cluster.state().cnses["cycle-workers-ip-10-0-0-1"].phase(),
            CycleNodeStatusPhase::Pending
        );
    }

    #[test]
    fn test_error_policy_requeues() {
        let cluster = FakeCluster::default();
        let cloud = FakeCloud::default();
        let cnr = cycle_node_request(
            "cycle-workers",
            CycleNodeRequestSpec::default(),
            CycleNodeRequestStatus::default(),
        );
        let err = Error::UnknownPhase {
            kind: K8S_CNR_KIND.to_string(),
            name: "cycle-workers".to_string(),
        };
        assert_eq!(
            error_policy(Arc::new(cnr), &err, context(&cluster, &cloud)),
            Action::requeue(Duration::from_secs(30))
        );
    }
}
