//! YellowTang controller
//!
//! Wires the reconciliation state machine into the Kubernetes controller
//! runtime: watches the cluster resource and its owned pods, gates on the
//! bootstrap annotation, and retries failed reconciliations with
//! exponential backoff.

use crate::cluster::reconcile_cluster;
use crate::crd::{YellowTang, INITIALIZED_ANNOTATION};
use crate::error::{OperatorError, Result};
use crate::facade::ResourceFacade;
use crate::mysql::MysqlClient;
use crate::replicas::reconcile_replicas;
use crate::resources::{instance_name, ROLE_MASTER, ROLE_SLAVE};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Base delay of the per-key retry backoff
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap of the per-key retry backoff
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Runtime configuration injected at process start
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    /// Root password of the managed database instances; also written into
    /// each pod's `MYSQL_ROOT_PASSWORD` environment
    pub mysql_root_password: String,
}

/// Context passed to every reconciliation
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Injected runtime configuration
    pub settings: OperatorSettings,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster retry counts driving the exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Last observed GTID set executed by the primary.
    ///
    /// Written while a primary is observable, read by the elector when it is
    /// not. Process-local and best-effort: after an operator restart the
    /// elector runs with an empty snapshot and admits any healthy replica.
    pub master_gtid: RwLock<String>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("yellowtang_operator_reconciliations_total"),
            errors: metrics::counter!("yellowtang_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("yellowtang_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the YellowTang controller and block until shutdown.
///
/// The controller watches the cluster resources and every owned pod, so a
/// pod eviction triggers a reconcile of its parent cluster. The runtime
/// never reconciles the same resource concurrently, which is the
/// single-writer assumption the rest of the operator rests on.
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    settings: OperatorSettings,
) -> Result<()> {
    let tangs: Api<YellowTang> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let pods: Api<Pod> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        settings,
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
        master_gtid: RwLock::new(String::new()),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting YellowTang controller"
    );

    Controller::new(tangs, Config::default())
        .owns(pods, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

fn reconcile_key(tang: &YellowTang) -> String {
    format!(
        "{}/{}",
        tang.namespace().unwrap_or_default(),
        tang.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(tang, ctx), fields(name = %tang.name_any(), namespace = tang.namespace()))]
async fn reconcile(tang: Arc<YellowTang>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = reconcile_inner(&tang, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }

    if result.is_ok() {
        ctx.error_counts.remove(&reconcile_key(&tang));
    }

    result
}

async fn reconcile_inner(tang: &YellowTang, ctx: &ControllerContext) -> Result<Action> {
    let facade = ResourceFacade::new(&ctx.client, tang)?;

    if !tang.is_initialized() {
        bootstrap(tang, &facade, &ctx.settings.mysql_root_password).await?;
        mark_initialized(tang, ctx).await?;
        info!("cluster bootstrap complete");
        // The annotation write re-triggers the watch; the next pass finds no
        // primary endpoint and elects one through the failover path.
        return Ok(Action::await_change());
    }

    reconcile_replicas(tang, &facade, &ctx.settings.mysql_root_password).await?;

    let mysql = MysqlClient::new(&facade, &ctx.settings.mysql_root_password);
    reconcile_cluster(tang, &facade, &mysql, &ctx.master_gtid).await?;

    Ok(Action::await_change())
}

/// Ordered materialization of the initial one-primary, N-replica topology.
///
/// Creates services, then per-ordinal configmaps, volume claims and pods;
/// each pod create blocks until readiness so instances come up in ordinal
/// order. Replication is NOT configured here: the first steady-state pass
/// finds the master service without endpoints and wires the topology
/// through the same election path used for failover.
async fn bootstrap(
    tang: &YellowTang,
    facade: &ResourceFacade<'_>,
    root_password: &str,
) -> Result<()> {
    let replicas = tang.spec.replicas;
    info!(replicas, "bootstrapping cluster");

    if replicas < 1 {
        return Err(OperatorError::InvalidReplicas(replicas));
    }
    tang.spec
        .validate()
        .map_err(|err| OperatorError::ValidationFailed(err.to_string()))?;

    facade
        .ensure_service(&tang.spec.master_service, ROLE_MASTER)
        .await?;
    facade
        .ensure_service(&tang.spec.slave_service, ROLE_SLAVE)
        .await?;

    for ordinal in 1..=replicas {
        facade
            .ensure_configmap(&instance_name(ordinal), ordinal)
            .await?;
    }
    for ordinal in 1..=replicas {
        facade.ensure_pvc(&instance_name(ordinal)).await?;
    }
    for ordinal in 1..=replicas {
        let name = instance_name(ordinal);
        facade.create_pod(&name, &name, &name, root_password).await?;
    }

    Ok(())
}

/// Persist the bootstrap marker. The transition is monotonic: the
/// annotation is merged in and never cleared afterwards.
async fn mark_initialized(tang: &YellowTang, ctx: &ControllerContext) -> Result<()> {
    let namespace = tang
        .namespace()
        .ok_or_else(|| OperatorError::InvalidConfig("cluster namespace is required".to_string()))?;
    let tangs: Api<YellowTang> = Api::namespaced(ctx.client.clone(), &namespace);

    let patch = serde_json::json!({
        "metadata": { "annotations": { INITIALIZED_ANNOTATION: "true" } }
    });
    tangs
        .patch(&tang.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// Delay before the n-th consecutive retry of one cluster's reconciliation
fn backoff_delay(retries: u32) -> Duration {
    let exp = retries.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE * 2u32.saturating_pow(exp);
    delay.min(BACKOFF_CAP)
}

/// Error policy for the controller: per-key exponential backoff, reset on
/// the next successful reconciliation
fn error_policy(
    tang: Arc<YellowTang>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = reconcile_key(&tang);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ResourceAmounts, ResourcesSpec, StorageSpec, YellowTangSpec};

    fn sample_tang() -> YellowTang {
        let mut tang = YellowTang::new(
            "demo",
            YellowTangSpec {
                image: "mysql:8.0".to_string(),
                replicas: 2,
                master_service: "master-svc".to_string(),
                slave_service: "slave-svc".to_string(),
                storage: StorageSpec {
                    storage_class_name: "standard".to_string(),
                    size: "10Gi".to_string(),
                },
                resources: ResourcesSpec {
                    requests: ResourceAmounts {
                        cpu: "500m".to_string(),
                        memory: "1Gi".to_string(),
                    },
                    limits: ResourceAmounts {
                        cpu: "1".to_string(),
                        memory: "2Gi".to_string(),
                    },
                },
                readiness_probe: None,
            },
        );
        tang.metadata.namespace = Some("default".to_string());
        tang
    }

    #[test]
    fn test_backoff_delay_growth() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_cap() {
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_reconcile_key() {
        assert_eq!(reconcile_key(&sample_tang()), "default/demo");
    }
}
