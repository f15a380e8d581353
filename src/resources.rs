//! Kubernetes manifest builders
//!
//! This module generates the objects owned by a YellowTang cluster
//! (Service, ConfigMap, PersistentVolumeClaim, Pod) from its specification.
//! Builders are pure; every side effect against the platform API lives in
//! [`crate::facade`].

use crate::crd::YellowTang;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// API version written into owner references
pub const API_VERSION: &str = "apps.kaxonliu.com/v1";
/// Kind written into owner references
pub const KIND: &str = "YellowTang";

/// Role label key on instance pods and services
pub const ROLE_LABEL: &str = "role";
/// Role of the single writable primary
pub const ROLE_MASTER: &str = "master";
/// Role of read-only replicas
pub const ROLE_SLAVE: &str = "slave";

/// Name of the database container in every instance pod
pub const MYSQL_CONTAINER: &str = "mysql";
/// MySQL server port
pub const MYSQL_PORT: i32 = 3306;
/// Data directory inside the instance container
pub const DATA_DIR: &str = "/var/lib/mysql";

static ORDINAL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"mysql-(\d+)").unwrap());

/// Name of the instance with the given 1-based ordinal (`mysql-01`, ...)
pub fn instance_name(ordinal: i32) -> String {
    format!("mysql-{:02}", ordinal)
}

/// Parse the ordinal out of an instance name; `None` for foreign pods
pub fn parse_ordinal(name: &str) -> Option<i32> {
    ORDINAL_REGEX
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Strip leading and trailing whitespace from every line of a config template
fn trim_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the per-instance `my.cnf`
///
/// `server_id` must be positive and unique across the cluster; GTID mode is
/// mandatory because both replication wiring (`MASTER_AUTO_POSITION`) and
/// failover election depend on transaction identifier sets.
pub fn mysql_config(server_id: i32) -> String {
    trim_lines(&format!(
        "[mysqld]
        server-id={server_id}
        binlog_format=row
        log-bin=mysql-bin
        skip-name-resolve
        gtid-mode=on
        enforce-gtid-consistency=true
        log-slave-updates=1
        relay_log_purge=0"
    ))
}

/// A pod is healthy when it is running and its first container reports ready
pub fn pod_is_healthy(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .container_statuses
            .as_ref()
            .and_then(|cs| cs.first())
            .is_some_and(|c| c.ready)
}

/// Builder for the Kubernetes objects owned by one YellowTang cluster
pub struct ResourceBuilder<'a> {
    tang: &'a YellowTang,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a builder for the given cluster resource
    pub fn new(tang: &'a YellowTang) -> Result<Self> {
        let name = tang
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("cluster name is required".to_string()))?;
        let namespace = tang
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("cluster namespace is required".to_string()))?;

        Ok(Self { tang, name, namespace })
    }

    /// Namespace all owned objects are created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Owner reference rooting every owned object at the cluster resource,
    /// so platform cascade-delete reclaims them
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.name.clone(),
            uid: self.tang.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }
    }

    /// Labels carried by every owned object
    fn instance_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("tang".to_string(), "true".to_string());
        labels.insert("app".to_string(), "mysql".to_string());
        labels
    }

    /// Labels plus the role, used by services to select pods
    fn role_labels(&self, role: &str) -> BTreeMap<String, String> {
        let mut labels = self.instance_labels();
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
        labels
    }

    /// Build a ClusterIP service selecting instances by role
    pub fn build_service(&self, name: &str, role: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.role_labels(role)),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.role_labels(role)),
                ports: Some(vec![ServicePort {
                    port: MYSQL_PORT,
                    target_port: Some(IntOrString::Int(MYSQL_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the per-instance database config, keyed as `my.cnf`
    pub fn build_configmap(&self, name: &str, server_id: i32) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert("my.cnf".to_string(), mysql_config(server_id));

        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.instance_labels()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Build the per-instance volume claim (sole data directory)
    pub fn build_pvc(&self, name: &str) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_string(),
            Quantity(self.tang.spec.storage.size.clone()),
        );

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.instance_labels()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                storage_class_name: Some(self.tang.spec.storage.storage_class_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build one instance pod bound to its configmap and volume claim
    ///
    /// The pod starts without a `role` label; the replication topology pass
    /// assigns one, which is what makes the services start selecting it.
    pub fn build_pod(
        &self,
        pod_name: &str,
        pvc_name: &str,
        config_map_name: &str,
        root_password: &str,
    ) -> Pod {
        let spec = &self.tang.spec;

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(spec.resources.requests.cpu.clone()));
        requests.insert(
            "memory".to_string(),
            Quantity(spec.resources.requests.memory.clone()),
        );
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity(spec.resources.limits.cpu.clone()));
        limits.insert(
            "memory".to_string(),
            Quantity(spec.resources.limits.memory.clone()),
        );

        let container = Container {
            name: MYSQL_CONTAINER.to_string(),
            image: Some(spec.image.clone()),
            env: Some(vec![EnvVar {
                name: "MYSQL_ROOT_PASSWORD".to_string(),
                value: Some(root_password.to_string()),
                ..Default::default()
            }]),
            ports: Some(vec![ContainerPort {
                name: Some(MYSQL_CONTAINER.to_string()),
                container_port: MYSQL_PORT,
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "mysql-config".to_string(),
                    mount_path: "/etc/my.cnf".to_string(),
                    sub_path: Some("my.cnf".to_string()),
                    ..Default::default()
                },
                VolumeMount {
                    name: "mysql-data".to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..Default::default()
                },
            ]),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            readiness_probe: spec.readiness_probe.clone(),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.instance_labels()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(vec![
                    Volume {
                        name: "mysql-config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config_map_name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "mysql-data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: pvc_name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
