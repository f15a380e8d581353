//! Failover elector
//!
//! When the primary-facing service has no live backend, the elector scores
//! every healthy replica by replication completeness against the last
//! observed primary GTID snapshot plus its stored data size, and promotes
//! the highest-scoring candidate.

use crate::error::{OperatorError, Result};
use crate::facade::{instance_selector, ResourceFacade};
use crate::mysql::{gtid_coverage, MysqlClient};
use crate::resources::{pod_is_healthy, ROLE_SLAVE};
use tracing::{debug, info};

/// Outcome of a primary election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    /// Instance to promote
    pub new_master: String,
    /// Every other instance that was carrying the replica role, healthy or
    /// not; all of them get re-pointed at the new primary
    pub remaining_slaves: Vec<String>,
}

/// Pick the strictly highest-scoring candidate; ties break to first-seen
pub fn best_candidate(scored: &[(String, f64)]) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for (name, score) in scored {
        let better = match best {
            None => true,
            Some((_, best_score)) => *score > best_score,
        };
        if better {
            best = Some((name.as_str(), *score));
        }
    }
    best.map(|(name, _)| name)
}

/// Elect a new primary among the surviving replicas.
///
/// Candidates are the healthy `role=slave` pods. A freshly bootstrapped
/// cluster has no role labels yet and the initial wiring reuses this
/// election path, so an empty slave listing falls back to every instance
/// pod. Each candidate is scored as the GTID coverage of `snapshot` (a
/// [0,1] ratio, zero when the snapshot is empty or stale) plus its data
/// directory size in raw bytes; byte differences therefore dominate the
/// GTID signal. Scoring probes that fail surface as errors and the election
/// is retried by the controller.
pub async fn elect_new_master(
    facade: &ResourceFacade<'_>,
    mysql: &MysqlClient<'_>,
    snapshot: &str,
) -> Result<Election> {
    let mut slaves = facade
        .list_pods(&instance_selector(Some(ROLE_SLAVE)))
        .await?;
    if slaves.is_empty() {
        slaves = facade.list_pods(&instance_selector(None)).await?;
    }
    let slave_names: Vec<&str> = slaves
        .iter()
        .filter_map(|pod| pod.metadata.name.as_deref())
        .collect();
    info!(slaves = ?slave_names, "electing a new primary");

    let mut scored: Vec<(String, f64)> = Vec::new();
    for pod in &slaves {
        let Some(name) = pod.metadata.name.as_deref() else {
            continue;
        };
        if !pod_is_healthy(pod) {
            debug!(pod = %name, "skipping unhealthy candidate");
            continue;
        }

        let retrieved = mysql.retrieved_gtid_set(name).await?;
        let gtid_score = gtid_coverage(snapshot, &retrieved);
        let data_size = mysql.data_dir_size(name).await?;
        let score = gtid_score + data_size as f64;

        debug!(pod = %name, gtid_score, data_size, score, "scored candidate");
        scored.push((name.to_string(), score));
    }

    let winner = best_candidate(&scored)
        .ok_or(OperatorError::NoPromotionCandidate)?
        .to_string();

    let remaining_slaves = slave_names
        .iter()
        .filter(|name| **name != winner)
        .map(|name| name.to_string())
        .collect();

    info!(new_master = %winner, remaining = ?remaining_slaves, "election complete");

    Ok(Election {
        new_master: winner,
        remaining_slaves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_candidate_highest_wins() {
        let scored = vec![
            ("mysql-02".to_string(), 100.0),
            ("mysql-03".to_string(), 250.0),
            ("mysql-04".to_string(), 50.0),
        ];
        assert_eq!(best_candidate(&scored), Some("mysql-03"));
    }

    #[test]
    fn test_best_candidate_tie_breaks_first_seen() {
        let scored = vec![
            ("mysql-02".to_string(), 100.0),
            ("mysql-03".to_string(), 100.0),
        ];
        assert_eq!(best_candidate(&scored), Some("mysql-02"));
    }

    #[test]
    fn test_best_candidate_empty() {
        assert_eq!(best_candidate(&[]), None);
    }

    #[test]
    fn test_data_size_dominates_gtid_coverage() {
        // 100 MiB with full GTID coverage loses to 200 MiB with partial
        // coverage: the raw byte term swamps the [0,1] ratio.
        let full_coverage = 1.0 + (100 * 1024 * 1024) as f64;
        let partial_coverage = 0.9 + (200 * 1024 * 1024) as f64;
        let scored = vec![
            ("mysql-02".to_string(), full_coverage),
            ("mysql-03".to_string(), partial_coverage),
        ];
        assert_eq!(best_candidate(&scored), Some("mysql-03"));
    }
}
