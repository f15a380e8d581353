//! MySQL client over the exec subresource
//!
//! The operator drives replication state by running the `mysql` command-line
//! client inside instance containers and interpreting its textual output.
//! This module wraps the facade's exec primitive with the SQL command
//! contracts and the parsers for `SHOW SLAVE STATUS \G` style output, the
//! way the operator would wrap a native protocol client.

use crate::error::{OperatorError, Result};
use crate::facade::ResourceFacade;
use crate::resources::DATA_DIR;
use tracing::debug;

/// Replication account provisioned on every primary; replicas authenticate
/// with it when pulling binlog events. Both values are part of the wire
/// contract between primary and replica configuration statements.
pub const REPLICATION_USER: &str = "replica";
/// Password of the replication account
pub const REPLICATION_PASSWORD: &str = "password";

/// Health of one replica's replication threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaHealth {
    /// Both the SQL and IO thread report `Yes`
    Healthy,
    /// Exec failure, or at least one thread not running
    Failed,
}

/// Classify a replica from its `SHOW SLAVE STATUS \G` output.
///
/// Healthy requires BOTH thread fields to be literally present; everything
/// else (including empty output from an unconfigured instance) is failed.
pub fn classify_replica(output: &str) -> ReplicaHealth {
    let sql_running = output.contains("Slave_SQL_Running: Yes");
    let io_running = output.contains("Slave_IO_Running: Yes");
    if sql_running && io_running {
        ReplicaHealth::Healthy
    } else {
        ReplicaHealth::Failed
    }
}

/// Extract a `Field: value` line from `\G`-formatted client output
pub fn field_value(output: &str, field: &str) -> Option<String> {
    let prefix = format!("{}:", field);
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&prefix)
            .map(|rest| rest.trim().to_string())
    })
}

/// Fraction of the snapshot's GTID tokens also present in a replica's
/// retrieved set (exact match over comma-split, whitespace-trimmed tokens).
/// Zero when either side is empty.
pub fn gtid_coverage(snapshot: &str, replica_set: &str) -> f64 {
    if snapshot.is_empty() || replica_set.is_empty() {
        return 0.0;
    }

    let replica_tokens: std::collections::HashSet<&str> =
        replica_set.split(',').map(str::trim).collect();
    let snapshot_tokens: Vec<&str> = snapshot.split(',').map(str::trim).collect();

    let hits = snapshot_tokens
        .iter()
        .filter(|token| replica_tokens.contains(*token))
        .count();

    hits as f64 / snapshot_tokens.len() as f64
}

/// Parse the byte count out of `du -sb <dir>` output
fn parse_du_size(output: &str) -> Option<i64> {
    output.split_whitespace().next()?.parse().ok()
}

/// MySQL control client for the instances of one cluster
pub struct MysqlClient<'a> {
    facade: &'a ResourceFacade<'a>,
    root_password: &'a str,
}

impl<'a> MysqlClient<'a> {
    /// Create a client issuing commands through the given facade
    pub fn new(facade: &'a ResourceFacade<'a>, root_password: &'a str) -> Self {
        Self {
            facade,
            root_password,
        }
    }

    fn sql(&self, statements: &str) -> String {
        format!(
            "mysql -uroot -p{} -e \"{}\"",
            self.root_password, statements
        )
    }

    /// Raw `SHOW SLAVE STATUS \G` output of one instance
    pub async fn show_slave_status(&self, pod_name: &str) -> Result<String> {
        self.facade
            .exec_on_pod(pod_name, &self.sql("SHOW SLAVE STATUS\\G"))
            .await
    }

    /// Classify an instance's replication health; exec failures count as
    /// failed rather than surfacing, so one broken replica does not stall
    /// the health sweep
    pub async fn replica_health(&self, pod_name: &str) -> ReplicaHealth {
        match self.show_slave_status(pod_name).await {
            Ok(output) => classify_replica(&output),
            Err(err) => {
                debug!(pod = %pod_name, error = %err, "slave status probe failed");
                ReplicaHealth::Failed
            }
        }
    }

    /// The GTID set a replica has retrieved from its primary so far
    /// (`Retrieved_Gtid_Set`), empty when replication was never configured
    pub async fn retrieved_gtid_set(&self, pod_name: &str) -> Result<String> {
        let output = self.show_slave_status(pod_name).await?;
        Ok(field_value(&output, "Retrieved_Gtid_Set").unwrap_or_default())
    }

    /// The GTID set a primary has executed (`Executed_Gtid_Set` from
    /// `SHOW MASTER STATUS \G`)
    pub async fn executed_gtid_set(&self, pod_name: &str) -> Result<String> {
        let output = self
            .facade
            .exec_on_pod(pod_name, &self.sql("SHOW MASTER STATUS\\G"))
            .await?;
        Ok(field_value(&output, "Executed_Gtid_Set").unwrap_or_default())
    }

    /// Size in bytes of an instance's data directory (`du -sb`)
    pub async fn data_dir_size(&self, pod_name: &str) -> Result<i64> {
        let command = format!("du -sb {}", DATA_DIR);
        let output = self.facade.exec_on_pod(pod_name, &command).await?;
        parse_du_size(&output).ok_or_else(|| OperatorError::UnexpectedOutput {
            pod: pod_name.to_string(),
            message: format!("cannot parse du output {:?}", output.trim()),
        })
    }

    /// Prepare an instance to act as primary: provision the replication
    /// account and quiesce any replication threads left over from a
    /// previous life as a replica
    pub async fn configure_master(&self, pod_name: &str) -> Result<()> {
        let statements = format!(
            "CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{password}'; \
             GRANT REPLICATION SLAVE ON *.* TO '{user}'@'%'; \
             STOP SLAVE;",
            user = REPLICATION_USER,
            password = REPLICATION_PASSWORD,
        );
        self.facade.exec_on_pod(pod_name, &self.sql(&statements)).await?;
        Ok(())
    }

    /// Point an instance at the primary and restart replication.
    ///
    /// The primary is addressed by its service DNS name, never by pod IP;
    /// `MASTER_AUTO_POSITION=1` resumes from the replica's recorded GTID
    /// position independent of binary-log file names. Together these make
    /// failover transparent to the replica.
    pub async fn configure_replica(&self, pod_name: &str, master_service: &str) -> Result<()> {
        let statements = format!(
            "STOP SLAVE; \
             CHANGE MASTER TO MASTER_HOST='{host}', MASTER_USER='{user}', \
             MASTER_PASSWORD='{password}', MASTER_AUTO_POSITION=1; \
             START SLAVE;",
            host = master_service,
            user = REPLICATION_USER,
            password = REPLICATION_PASSWORD,
        );
        self.facade.exec_on_pod(pod_name, &self.sql(&statements)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTHY_STATUS: &str = "\
*************************** 1. row ***************************
               Slave_IO_State: Waiting for master to send event
                  Master_Host: master-svc
             Slave_IO_Running: Yes
            Slave_SQL_Running: Yes
           Retrieved_Gtid_Set: a1b2c3d4-0000-0000-0000-000000000001:1-100
            Executed_Gtid_Set: a1b2c3d4-0000-0000-0000-000000000001:1-98
";

    #[test]
    fn test_classify_replica_healthy() {
        assert_eq!(classify_replica(HEALTHY_STATUS), ReplicaHealth::Healthy);
    }

    #[test]
    fn test_classify_replica_io_thread_down() {
        let output = HEALTHY_STATUS.replace("Slave_IO_Running: Yes", "Slave_IO_Running: No");
        assert_eq!(classify_replica(&output), ReplicaHealth::Failed);
    }

    #[test]
    fn test_classify_replica_sql_thread_down() {
        let output =
            HEALTHY_STATUS.replace("Slave_SQL_Running: Yes", "Slave_SQL_Running: Connecting");
        assert_eq!(classify_replica(&output), ReplicaHealth::Failed);
    }

    #[test]
    fn test_classify_replica_empty_output() {
        assert_eq!(classify_replica(""), ReplicaHealth::Failed);
    }

    #[test]
    fn test_field_value() {
        assert_eq!(
            field_value(HEALTHY_STATUS, "Retrieved_Gtid_Set").as_deref(),
            Some("a1b2c3d4-0000-0000-0000-000000000001:1-100")
        );
        assert_eq!(
            field_value(HEALTHY_STATUS, "Master_Host").as_deref(),
            Some("master-svc")
        );
        assert_eq!(field_value(HEALTHY_STATUS, "Master_Port"), None);
    }

    #[test]
    fn test_gtid_coverage_full() {
        let snapshot = "uuid-1:1-100,uuid-2:1-50";
        let replica = "uuid-1:1-100, uuid-2:1-50";
        assert_eq!(gtid_coverage(snapshot, replica), 1.0);
    }

    #[test]
    fn test_gtid_coverage_partial() {
        let snapshot = "uuid-1:1-100,uuid-2:1-50";
        let replica = "uuid-1:1-100";
        assert_eq!(gtid_coverage(snapshot, replica), 0.5);
    }

    #[test]
    fn test_gtid_coverage_empty_sides() {
        assert_eq!(gtid_coverage("", "uuid-1:1-100"), 0.0);
        assert_eq!(gtid_coverage("uuid-1:1-100", ""), 0.0);
        assert_eq!(gtid_coverage("", ""), 0.0);
    }

    #[test]
    fn test_parse_du_size() {
        assert_eq!(parse_du_size("104857600\t/var/lib/mysql\n"), Some(104857600));
        assert_eq!(parse_du_size("  42 /var/lib/mysql"), Some(42));
        assert_eq!(parse_du_size("du: cannot access"), None);
        assert_eq!(parse_du_size(""), None);
    }
}
