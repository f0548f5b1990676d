//! Cycle de health check de bout en bout : sélection des nœuds les moins
//! récemment vérifiés, vérification concurrente, écriture des statuts, résumé.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::probe::Probe;
use super::updater::RemoteStatusUpdater;
use super::{CheckTarget, HealthChecker};
use crate::lifecycle::now_timestamp;
use crate::models::HealthStatus;
use crate::store::{RestStore, StoreError, StoreQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoNodes,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckSummary {
    pub status: RunStatus,
    pub checked_count: usize,
    pub online_count: usize,
    pub offline_count: usize,
    pub suspect_count: usize,
    pub unknown_count: usize,
    pub update_success: usize,
    pub update_fail: usize,
    pub skipped: usize,
    /// Nœuds offline ou suspects de ce cycle.
    pub problem_nodes: Vec<ProblemNode>,
    pub duration_seconds: f64,
    pub checked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemNode {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub status: HealthStatus,
    pub error_message: Option<String>,
}

impl HealthCheckSummary {
    fn empty(status: RunStatus, started: Instant, message: Option<String>) -> Self {
        Self {
            status,
            checked_count: 0,
            online_count: 0,
            offline_count: 0,
            suspect_count: 0,
            unknown_count: 0,
            update_success: 0,
            update_fail: 0,
            skipped: 0,
            problem_nodes: Vec::new(),
            duration_seconds: started.elapsed().as_secs_f64(),
            checked_at: now_timestamp(),
            message,
        }
    }
}

/// Répartition des statuts dans le datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub suspect: usize,
    pub unknown: usize,
    pub unchecked: usize,
}

pub struct HealthRunner<P: Probe = super::probe::NetProbe> {
    checker: Arc<HealthChecker<P>>,
    store: Option<RestStore>,
    updater: Option<RemoteStatusUpdater>,
    default_batch: usize,
}

impl<P: Probe> HealthRunner<P> {
    pub fn new(
        checker: Arc<HealthChecker<P>>,
        store: Option<RestStore>,
        update_chunk: usize,
        default_batch: usize,
    ) -> Self {
        let updater = store.clone().map(|s| RemoteStatusUpdater::new(s, update_chunk));
        Self { checker, store, updater, default_batch: default_batch.max(1) }
    }

    pub async fn run_health_check(&self, batch_size: Option<usize>) -> HealthCheckSummary {
        let started = Instant::now();
        let (Some(store), Some(updater)) = (&self.store, &self.updater) else {
            return HealthCheckSummary::empty(
                RunStatus::Error,
                started,
                Some("datastore not configured".into()),
            );
        };

        let limit = batch_size.filter(|b| *b > 0).unwrap_or(self.default_batch);
        let rows = match store.nodes_for_health_check(limit).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[health] failed to select nodes: {}", e);
                return HealthCheckSummary::empty(RunStatus::Error, started, Some(e.to_string()));
            }
        };

        let mut skipped = 0;
        let mut names = Vec::with_capacity(rows.len());
        let targets: Vec<CheckTarget> = rows
            .iter()
            .filter_map(|row| match row.to_node() {
                Ok(node) if node.should_delete => {
                    debug!("[health] row {} is evicted, not checking", row.id);
                    None
                }
                Ok(node) => {
                    let mut target = CheckTarget::from(&node);
                    target.node_id = row.id.clone();
                    names.push(node.name);
                    Some(target)
                }
                Err(e) => {
                    warn!("[health] skipping row {}: {}", row.id, e);
                    skipped += 1;
                    None
                }
            })
            .collect();

        if targets.is_empty() {
            let mut summary = HealthCheckSummary::empty(RunStatus::NoNodes, started, None);
            summary.skipped = skipped;
            return summary;
        }

        let results = self.checker.check_batch(&targets).await;
        let report = updater.update(&results).await;

        let count = |status: HealthStatus| results.iter().filter(|r| r.status == status).count();
        let problem_nodes = results
            .iter()
            .zip(names)
            .filter(|(r, _)| matches!(r.status, HealthStatus::Offline | HealthStatus::Suspect))
            .map(|(r, name)| ProblemNode {
                id: r.node_id.clone(),
                name,
                host: r.host.clone(),
                port: r.port,
                status: r.status,
                error_message: r.error_message.clone(),
            })
            .collect();
        let summary = HealthCheckSummary {
            status: RunStatus::Completed,
            checked_count: results.len(),
            online_count: count(HealthStatus::Online),
            offline_count: count(HealthStatus::Offline),
            suspect_count: count(HealthStatus::Suspect),
            unknown_count: count(HealthStatus::Unknown),
            update_success: report.success,
            update_fail: report.fail,
            skipped,
            problem_nodes,
            duration_seconds: started.elapsed().as_secs_f64(),
            checked_at: now_timestamp(),
            message: None,
        };
        info!(
            "[health] checked {} nodes: {} online, {} offline, {} suspect ({:.1}s)",
            summary.checked_count,
            summary.online_count,
            summary.offline_count,
            summary.suspect_count,
            summary.duration_seconds
        );
        summary
    }

    pub async fn health_stats(&self) -> Result<HealthStats, StoreError> {
        let store = self.store.as_ref().ok_or(StoreError::NotConfigured)?;
        let rows = store
            .select(&StoreQuery { select: Some("id,status".into()), ..Default::default() })
            .await?;

        let mut stats = HealthStats { total: rows.len(), ..Default::default() };
        for row in &rows {
            match row.status.as_deref().and_then(HealthStatus::parse) {
                Some(HealthStatus::Online) => stats.online += 1,
                Some(HealthStatus::Offline) => stats.offline += 1,
                Some(HealthStatus::Suspect) => stats.suspect += 1,
                Some(HealthStatus::Unknown) => stats.unknown += 1,
                None => stats.unchecked += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatastoreConf, HealthConf};
    use serde_json::json;
    use viper_devkit::{probe_targets, MockDatastore};

    fn fast_checker() -> Arc<HealthChecker> {
        let conf = HealthConf {
            tcp_timeout_ms: 1_000,
            http_timeout_ms: 1_000,
            max_retries: 0,
            retry_delay_ms: 1,
            ..Default::default()
        };
        Arc::new(HealthChecker::from_config(&conf).unwrap())
    }

    fn store_for(datastore: &MockDatastore) -> RestStore {
        RestStore::from_config(&DatastoreConf {
            url: Some(datastore.base_url()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_health_check_end_to_end() {
        let listener = probe_targets::spawn_tcp_listener().await.unwrap();
        let refused = probe_targets::refused_port().await.unwrap();

        let datastore = MockDatastore::start().await.unwrap();
        datastore.seed(vec![
            json!({"id": "up", "content": {"protocol": "vmess", "host": "127.0.0.1", "port": listener.port}}),
            json!({"id": "down", "content": {"protocol": "trojan", "host": "127.0.0.1", "port": refused, "name": "JP-02"}}),
            json!({"id": "broken", "content": "{\"port\": 443}"}),
            json!({
                "id": "evicted",
                "status": "offline",
                "content": {"protocol": "vless", "host": "127.0.0.1", "port": listener.port, "should_delete": true}
            }),
        ]);

        let runner = HealthRunner::new(fast_checker(), Some(store_for(&datastore)), 20, 50);
        let summary = runner.run_health_check(None).await;

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.checked_count, 2);
        assert_eq!(summary.online_count, 1);
        assert_eq!(summary.offline_count, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.update_success, 2);
        assert_eq!(summary.update_fail, 0);
        assert_eq!(summary.problem_nodes.len(), 1);
        assert_eq!(summary.problem_nodes[0].id, "down");
        assert_eq!(summary.problem_nodes[0].name.as_deref(), Some("JP-02"));
        assert_eq!(summary.problem_nodes[0].error_message.as_deref(), Some("Connection refused"));

        assert_eq!(datastore.row("up").unwrap()["status"], json!("online"));
        assert_eq!(datastore.row("down").unwrap()["status"], json!("offline"));

        let stats = runner.health_stats().await.unwrap();
        let expected = HealthStats {
            total: 4,
            online: 1,
            offline: 2,
            unchecked: 1,
            ..Default::default()
        };
        assert_eq!(stats, expected);
    }

    #[tokio::test]
    async fn test_no_nodes() {
        let datastore = MockDatastore::start().await.unwrap();
        let runner = HealthRunner::new(fast_checker(), Some(store_for(&datastore)), 20, 50);
        let summary = runner.run_health_check(Some(10)).await;
        assert_eq!(summary.status, RunStatus::NoNodes);
        assert_eq!(summary.checked_count, 0);
    }

    #[tokio::test]
    async fn test_without_datastore() {
        let runner = HealthRunner::new(fast_checker(), None, 20, 50);
        let summary = runner.run_health_check(None).await;
        assert_eq!(summary.status, RunStatus::Error);
        assert!(runner.health_stats().await.is_err());
    }
}
