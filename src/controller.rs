//! Kubernetes controller driving the inspection of cluster deployments.
//!
//! Every deployment gets a [`DeploymentRuntime`] on its first reconcile: the
//! stores and cluster client it is inspected with, plus the health and
//! reclaim loops running next to the controller. Reconciles of the same
//! deployment never overlap, so the inspector is the only writer of a tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster_api::{ClusterControl, HttpClusterControl};
use crate::config::OperatorConfig;
use crate::crd::ClusterDeployment;
use crate::error::{with_timeout, OperatorError, Result};
use crate::events::{EventSink, KubeEventSink};
use crate::finalizers::FinalizerEngine;
use crate::health_cache::{run_health_loop, ClusterHealthCache};
use crate::inspector::{DeploymentFacts, PodInspector};
use crate::member::DeploymentMode;
use crate::metrics;
use crate::reclaimer::{run_reclaim_loop, StaleMemberReclaimer};
use crate::resources::{KubeResourceStore, LABEL_DEPLOYMENT};
use crate::shutdown::ShutdownCoordinator;
use crate::store::KubeStatusStore;

/// Name the operator reports events under.
pub const CONTROLLER_NAME: &str = "dbcluster-operator";

/// Requeue delay after a failed reconcile.
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Everything needed to inspect one deployment.
pub struct DeploymentRuntime {
    mode: DeploymentMode,
    inspector: PodInspector,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownCoordinator,
}

impl DeploymentRuntime {
    fn build(client: &Client, config: &OperatorConfig, deployment: &ClusterDeployment) -> Result<Self> {
        let name = deployment.name_any();
        let namespace = deployment
            .namespace()
            .ok_or_else(|| OperatorError::Internal(format!("deployment {} has no namespace", name)))?;
        let mode = deployment.spec.mode;

        let cluster: Arc<dyn ClusterControl> = Arc::new(HttpClusterControl::new(
            &config.database.endpoint(&name, &namespace),
            config.database.token.clone(),
            config.timeouts.cluster(),
        )?);
        let status = Arc::new(KubeStatusStore::new(
            Api::namespaced(client.clone(), &namespace),
            name.clone(),
            config.timeouts.kubernetes(),
        ));
        let resources = Arc::new(KubeResourceStore::new(
            client.clone(),
            &namespace,
            &name,
            config.timeouts.kubernetes(),
        ));

        let engine = FinalizerEngine::standard(name.clone(), cluster.clone(), config.timeouts.cluster());
        let inspector = PodInspector::new(
            status.clone(),
            resources.clone(),
            engine,
            config.inspection.clone(),
        );

        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(
            Recorder::new(client.clone(), reporter),
            deployment.object_ref(&()),
        ));

        let shutdown = ShutdownCoordinator::new();
        let cache = Arc::new(ClusterHealthCache::new());

        tokio::spawn(run_health_loop(
            name.clone(),
            cache.clone(),
            cluster,
            config.health.refresh_interval(),
            config.timeouts.cluster(),
            shutdown.clone(),
        ));

        let reclaimer = Arc::new(StaleMemberReclaimer::new(
            name.clone(),
            mode,
            status,
            resources,
            cache,
            config.health.max_age(),
            config.reclaim.clone(),
        ));
        tokio::spawn(run_reclaim_loop(
            reclaimer,
            events.clone(),
            config.reclaim.interval(),
            shutdown.clone(),
        ));

        info!(deployment = %name, namespace = %namespace, ?mode, "Started deployment runtime");
        Ok(Self {
            mode,
            inspector,
            events,
            shutdown,
        })
    }
}

/// Shared state of all reconciles.
pub struct Context {
    client: Client,
    config: OperatorConfig,
    runtimes: Mutex<HashMap<String, Arc<DeploymentRuntime>>>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Runtime of `deployment`, started on first use and restarted when the
    /// deployment mode changes. Runtimes whose loops stopped on their own are
    /// dropped first.
    fn runtime_for(&self, deployment: &ClusterDeployment) -> Result<Arc<DeploymentRuntime>> {
        let key = runtime_key(deployment);
        let mut runtimes = self.runtimes.lock();
        prune_stopped(&mut *runtimes, |runtime| &runtime.shutdown);

        if let Some(runtime) = runtimes.get(&key) {
            if runtime.mode == deployment.spec.mode {
                return Ok(runtime.clone());
            }
            info!(deployment = %key, "Deployment mode changed, restarting runtime");
            runtime.shutdown.shutdown();
        }

        let runtime = Arc::new(DeploymentRuntime::build(&self.client, &self.config, deployment)?);
        runtimes.insert(key, runtime.clone());
        Ok(runtime)
    }

    fn stop_runtime(&self, key: &str) {
        if let Some(runtime) = self.runtimes.lock().remove(key) {
            runtime.shutdown.shutdown();
            info!(deployment = %key, "Stopped deployment runtime");
        }
    }

    /// Stop the loops of every deployment.
    pub fn stop_all(&self) {
        for (_, runtime) in self.runtimes.lock().drain() {
            runtime.shutdown.shutdown();
        }
    }
}

/// Drop runtimes whose loops have stopped, such as those of deleted deployments.
fn prune_stopped<R>(
    runtimes: &mut HashMap<String, R>,
    shutdown_of: impl Fn(&R) -> &ShutdownCoordinator,
) {
    runtimes.retain(|key, runtime| {
        let live = !shutdown_of(runtime).is_shutting_down();
        if !live {
            info!(deployment = %key, "Dropped stopped deployment runtime");
        }
        live
    });
}

fn runtime_key(deployment: &ClusterDeployment) -> String {
    format!(
        "{}/{}",
        deployment.namespace().unwrap_or_default(),
        deployment.name_any()
    )
}

/// Watch deployments and their pods and claims until `shutdown` fires.
pub async fn run(client: Client, config: OperatorConfig, namespace: &str, shutdown: ShutdownCoordinator) -> Result<()> {
    let deployments: Api<ClusterDeployment> = namespaced_or_all(&client, namespace);
    let pods: Api<Pod> = namespaced_or_all(&client, namespace);
    let pvcs: Api<PersistentVolumeClaim> = namespaced_or_all(&client, namespace);

    if let Err(e) = deployments.list(&ListParams::default().limit(1)).await {
        error!("Failed to list ClusterDeployments. Is the CRD installed? Error: {}", e);
        return Err(OperatorError::Kube(e));
    }

    let ctx = Arc::new(Context::new(client, config));

    // The controller only understands a plain future as shutdown trigger.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown.wait_for_shutdown().await;
        let _ = stop_tx.send(());
    });

    let selector = Config::default().labels(LABEL_DEPLOYMENT);
    KubeController::new(deployments, Config::default())
        .watches(pods, selector.clone(), |pod| deployment_of(&pod))
        .watches(pvcs, selector, |pvc| deployment_of(&pvc))
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        })
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "Reconciliation successful"),
                Err(e) => warn!(error = %e, "Reconciliation error"),
            }
        })
        .await;

    ctx.stop_all();
    info!("Controller stopped");
    Ok(())
}

fn namespaced_or_all<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

/// Map a labelled pod or claim to its deployment.
fn deployment_of<K: ResourceExt>(obj: &K) -> Option<ObjectRef<ClusterDeployment>> {
    let name = obj.labels().get(LABEL_DEPLOYMENT)?;
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// One inspection tick of a deployment.
async fn reconcile(deployment: Arc<ClusterDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let key = runtime_key(&deployment);
    let runtime = ctx.runtime_for(&deployment)?;

    let facts = DeploymentFacts {
        name: deployment.name_any(),
        spec: deployment.spec.clone(),
        deleting: deployment.meta().deletion_timestamp.is_some(),
    };

    let report = with_timeout(
        ctx.config.inspection.tick_deadline(),
        "inspection tick",
        runtime.inspector.inspect(&facts),
    )
    .await?;

    for event in &report.events {
        runtime.events.publish(event).await;
    }

    if facts.deleting && report.pods_inspected == 0 {
        ctx.stop_runtime(&key);
        return Ok(Action::await_change());
    }

    debug!(
        deployment = %key,
        pods = report.pods_inspected,
        written = report.status_written,
        next = ?report.interval.as_duration(),
        "Inspection tick finished"
    );
    Ok(Action::requeue(report.interval.as_duration()))
}

fn error_policy(deployment: Arc<ClusterDeployment>, error: &OperatorError, _ctx: Arc<Context>) -> Action {
    metrics::record_error(error.kind());
    if error.is_conflict() {
        debug!(name = %deployment.name_any(), "Status changed during tick, retrying");
    } else {
        warn!(name = %deployment.name_any(), error = %error, "Inspection tick failed");
    }
    Action::requeue(ERROR_REQUEUE)
}
