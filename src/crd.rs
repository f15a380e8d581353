//! Custom Resource Definition for the YellowTang operator
//!
//! This module defines the `YellowTang` CRD describing a desired MySQL
//! primary/replica cluster. The operator watches these resources and drives
//! the observed cluster state toward the declared specification.

use k8s_openapi::api::core::v1::Probe;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Annotation marking a cluster whose bootstrap has completed.
///
/// The transition is monotonic: once set to `"true"` it is never cleared.
pub const INITIALIZED_ANNOTATION: &str = "initialized";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "500m")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(m|Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a Kubernetes service name (RFC 1123 subdomain)
fn validate_service_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes service name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// YellowTang custom resource definition
///
/// Represents a MySQL cluster of one primary and N-1 replicas. The primary
/// is reachable through `masterService`, replicas through `slaveService`;
/// both services select pods by their `role` label so that failover is
/// transparent to connected clients.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "apps.kaxonliu.com",
    version = "v1",
    kind = "YellowTang",
    plural = "yellowtangs",
    shortname = "yt",
    namespaced,
    status = "YellowTangStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Initialized", "type":"string", "jsonPath":".metadata.annotations.initialized"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct YellowTangSpec {
    /// Container image for every database instance
    #[validate(length(min = 1, message = "image must not be empty"))]
    pub image: String,

    /// Desired instance count, primary included (at least 1)
    #[serde(default)]
    #[validate(range(min = 1, message = "replicas must be at least 1"))]
    pub replicas: i32,

    /// Name of the service fronting the primary (`role=master` selector)
    #[validate(custom(function = "validate_service_name"))]
    pub master_service: String,

    /// Name of the service fronting the replicas (`role=slave` selector)
    #[validate(custom(function = "validate_service_name"))]
    pub slave_service: String,

    /// Persistent storage configuration, one volume per instance
    #[validate(nested)]
    pub storage: StorageSpec,

    /// CPU/memory requests and limits applied to every instance
    #[validate(nested)]
    pub resources: ResourcesSpec,

    /// Readiness probe forwarded verbatim to each instance pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub readiness_probe: Option<Probe>,
}

/// Persistent storage configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class backing each instance's volume claim
    pub storage_class_name: String,

    /// Requested volume size (quantity string, e.g. "10Gi")
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,
}

/// CPU and memory amounts for one side of a requests/limits pair
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAmounts {
    /// CPU quantity string (e.g. "500m")
    #[validate(custom(function = "validate_quantity"))]
    pub cpu: String,

    /// Memory quantity string (e.g. "1Gi")
    #[validate(custom(function = "validate_quantity"))]
    pub memory: String,
}

/// Resource requirements for each instance container
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Scheduling requests
    #[validate(nested)]
    pub requests: ResourceAmounts,

    /// Hard limits
    #[validate(nested)]
    pub limits: ResourceAmounts,
}

/// YellowTang observed state
///
/// All observed state is recomputed from the platform on every
/// reconciliation; the bootstrap phase is tracked via the `initialized`
/// annotation on the resource metadata rather than in this subresource.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct YellowTangStatus {}

impl YellowTang {
    /// Whether the cluster has completed its initial bootstrap
    pub fn is_initialized(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(INITIALIZED_ANNOTATION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_spec() -> YellowTangSpec {
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
        }
    }

    #[test]
    fn test_spec_wire_names() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert!(json.get("masterService").is_some());
        assert!(json.get("slaveService").is_some());
        assert!(json["storage"].get("storageClassName").is_some());
        assert!(json["resources"]["requests"].get("cpu").is_some());
    }

    #[test]
    fn test_spec_roundtrip() {
        let input = serde_json::json!({
            "image": "mysql:8.0",
            "replicas": 3,
            "masterService": "master-svc",
            "slaveService": "slave-svc",
            "storage": {"storageClassName": "standard", "size": "10Gi"},
            "resources": {
                "requests": {"cpu": "500m", "memory": "1Gi"},
                "limits": {"cpu": "1", "memory": "2Gi"}
            }
        });
        let spec: YellowTangSpec = serde_json::from_value(input).unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.master_service, "master-svc");
        assert!(spec.readiness_probe.is_none());
    }

    #[test]
    fn test_replicas_default_is_invalid() {
        // Omitted replicas deserializes to 0 and must be rejected before
        // bootstrap runs.
        let input = serde_json::json!({
            "image": "mysql:8.0",
            "masterService": "master-svc",
            "slaveService": "slave-svc",
            "storage": {"storageClassName": "standard", "size": "10Gi"},
            "resources": {
                "requests": {"cpu": "500m", "memory": "1Gi"},
                "limits": {"cpu": "1", "memory": "2Gi"}
            }
        });
        let spec: YellowTangSpec = serde_json::from_value(input).unwrap();
        assert_eq!(spec.replicas, 0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_invalid_quantity_rejected() {
        let mut spec = sample_spec();
        spec.storage.size = "ten gigabytes".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_invalid_service_name_rejected() {
        let mut spec = sample_spec();
        spec.master_service = "Master_Svc".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_is_initialized() {
        let mut tang = YellowTang::new("demo", sample_spec());
        assert!(!tang.is_initialized());

        let mut annotations = BTreeMap::new();
        annotations.insert(INITIALIZED_ANNOTATION.to_string(), "true".to_string());
        tang.metadata.annotations = Some(annotations);
        assert!(tang.is_initialized());
    }
}
