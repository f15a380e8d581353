//! Replica-count reconcile
//!
//! Diffs the desired instance count against the pods observed in the
//! namespace and materializes missing ordinals (configmap, volume claim,
//! pod — in that order). Scale-in is not supported: surplus pods are left
//! untouched.

use crate::crd::YellowTang;
use crate::error::Result;
use crate::facade::{instance_selector, ResourceFacade};
use crate::resources::{instance_name, parse_ordinal};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

/// Ordinals parsed from the observed pod names
pub fn observed_ordinals(pods: &[Pod]) -> Vec<i32> {
    pods.iter()
        .filter_map(|pod| pod.metadata.name.as_deref())
        .filter_map(parse_ordinal)
        .collect()
}

/// Ordinals in `[1..=desired]` with no observed instance
pub fn missing_ordinals(desired: i32, observed: &[i32]) -> Vec<i32> {
    (1..=desired)
        .filter(|ordinal| !observed.contains(ordinal))
        .collect()
}

/// Bring the observed instance count up to the desired replica count.
///
/// Matching counts are a pure observation with no writes, even if the
/// observed ordinals differ from `[1..=desired]`. Each missing instance is
/// created bottom-up and the pod create blocks until readiness, so instances
/// come up strictly in ordinal order.
pub async fn reconcile_replicas(
    tang: &YellowTang,
    facade: &ResourceFacade<'_>,
    root_password: &str,
) -> Result<()> {
    let pods = facade.list_pods(&instance_selector(None)).await?;
    let desired = tang.spec.replicas;
    let actual = pods.len() as i32;
    info!(actual, desired, "checking replica count");

    if actual == desired {
        return Ok(());
    }

    let observed = observed_ordinals(&pods);
    for ordinal in missing_ordinals(desired, &observed) {
        let name = instance_name(ordinal);
        facade.ensure_configmap(&name, ordinal).await?;
        facade.ensure_pvc(&name).await?;
        facade.create_pod(&name, &name, &name, root_password).await?;
        info!(pod = %name, "materialized missing instance");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn named_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_observed_ordinals() {
        let pods = vec![
            named_pod("mysql-01"),
            named_pod("mysql-03"),
            named_pod("unrelated"),
        ];
        assert_eq!(observed_ordinals(&pods), vec![1, 3]);
    }

    #[test]
    fn test_missing_ordinals() {
        assert_eq!(missing_ordinals(3, &[1, 3]), vec![2]);
        assert_eq!(missing_ordinals(3, &[]), vec![1, 2, 3]);
        assert_eq!(missing_ordinals(2, &[1, 2]), Vec::<i32>::new());
    }

    #[test]
    fn test_missing_ordinals_ignores_surplus() {
        // scale-in is unsupported: ordinals above the target are not flagged
        assert_eq!(missing_ordinals(2, &[1, 2, 3, 4]), Vec::<i32>::new());
    }
}
