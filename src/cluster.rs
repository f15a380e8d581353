//! Cluster-health reconcile and replication topology
//!
//! Determines primary liveness from the master service's endpoints, then
//! either runs failover (elect a survivor and re-wire the rest) or repairs
//! replicas whose replication threads have stopped.

use crate::crd::YellowTang;
use crate::elect::elect_new_master;
use crate::error::Result;
use crate::facade::{instance_selector, ResourceFacade};
use crate::mysql::{MysqlClient, ReplicaHealth};
use crate::resources::{ROLE_MASTER, ROLE_SLAVE};
use k8s_openapi::api::core::v1::Endpoints;
use std::sync::RwLock;
use tracing::{info, warn};

/// Pod currently backing the master service, if any.
///
/// Empty endpoints (no subsets or no addresses) mean the primary is gone.
pub fn master_pod_name(endpoints: &Endpoints) -> Option<String> {
    endpoints
        .subsets
        .as_ref()?
        .first()?
        .addresses
        .as_ref()?
        .first()?
        .target_ref
        .as_ref()?
        .name
        .clone()
}

/// One pass of the cluster-health state machine.
///
/// With a live primary the pass refreshes the primary GTID snapshot,
/// classifies every replica by its replication thread state, re-establishes
/// replication for the failed ones and re-asserts the replica role labels.
/// Without one it dispatches to the failover path.
pub async fn reconcile_cluster(
    tang: &YellowTang,
    facade: &ResourceFacade<'_>,
    mysql: &MysqlClient<'_>,
    master_gtid: &RwLock<String>,
) -> Result<()> {
    let endpoints = facade.master_endpoints().await?;

    let Some(master) = master_pod_name(&endpoints) else {
        warn!("master service has no live endpoint, starting failover");
        return handle_master_failure(tang, facade, mysql, master_gtid).await;
    };

    // Refresh the GTID snapshot while the primary is observable. The
    // snapshot is an optimistic hint for elections, so a failed probe only
    // degrades a future failover, it does not fail this pass.
    match mysql.executed_gtid_set(&master).await {
        Ok(set) if !set.is_empty() => {
            *master_gtid.write().expect("gtid snapshot lock poisoned") = set;
        }
        Ok(_) => {}
        Err(err) => {
            warn!(pod = %master, error = %err, "could not refresh primary GTID snapshot");
        }
    }

    let pods = facade.list_pods(&instance_selector(None)).await?;
    let replicas: Vec<String> = pods
        .iter()
        .filter_map(|pod| pod.metadata.name.clone())
        .filter(|name| *name != master)
        .collect();
    info!(master = %master, replicas = ?replicas, "checking replica replication state");

    let mut failed = Vec::new();
    for name in &replicas {
        if mysql.replica_health(name).await == ReplicaHealth::Failed {
            warn!(pod = %name, "replica replication threads are not running");
            failed.push(name.clone());
        }
    }

    if !failed.is_empty() {
        setup_replication(tang, facade, mysql, &master, &failed).await?;
    }

    for name in &replicas {
        facade.label_pod(name, ROLE_SLAVE).await?;
    }

    Ok(())
}

/// Failover: elect the best surviving replica and re-wire the others to it
async fn handle_master_failure(
    tang: &YellowTang,
    facade: &ResourceFacade<'_>,
    mysql: &MysqlClient<'_>,
    master_gtid: &RwLock<String>,
) -> Result<()> {
    let snapshot = master_gtid
        .read()
        .expect("gtid snapshot lock poisoned")
        .clone();

    let election = elect_new_master(facade, mysql, &snapshot).await?;
    setup_replication(
        tang,
        facade,
        mysql,
        &election.new_master,
        &election.remaining_slaves,
    )
    .await
}

/// Establish replication from one primary to a set of replicas.
///
/// Labeling the primary `role=master` is what points the master service's
/// selector at it and repopulates its endpoints. Replicas connect through
/// that service DNS name, so a later failover only needs to move the label.
/// An empty replica set is valid (single-instance cluster).
pub async fn setup_replication(
    tang: &YellowTang,
    facade: &ResourceFacade<'_>,
    mysql: &MysqlClient<'_>,
    master_name: &str,
    slave_names: &[String],
) -> Result<()> {
    info!(master = %master_name, slaves = ?slave_names, "establishing replication topology");

    facade.get_pod(master_name).await?;
    facade.label_pod(master_name, ROLE_MASTER).await?;
    mysql.configure_master(master_name).await?;

    for slave in slave_names {
        facade.get_pod(slave).await?;
        mysql
            .configure_replica(slave, &tang.spec.master_service)
            .await?;
        facade.label_pod(slave, ROLE_SLAVE).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, ObjectReference};

    fn endpoints_with_target(name: &str) -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.7".to_string(),
                    target_ref: Some(ObjectReference {
                        name: Some(name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_master_pod_name_present() {
        let endpoints = endpoints_with_target("mysql-01");
        assert_eq!(master_pod_name(&endpoints).as_deref(), Some("mysql-01"));
    }

    #[test]
    fn test_master_pod_name_no_subsets() {
        assert_eq!(master_pod_name(&Endpoints::default()), None);
    }

    #[test]
    fn test_master_pod_name_empty_addresses() {
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset::default()]),
            ..Default::default()
        };
        assert_eq!(master_pod_name(&endpoints), None);
    }

    #[test]
    fn test_master_pod_name_missing_target_ref() {
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.7".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(master_pod_name(&endpoints), None);
    }
}
