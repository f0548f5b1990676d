//! Écriture des résultats de santé vers le datastore.
//!
//! Les PATCH d'un chunk partent en parallèle ; les chunks se suivent.

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::HealthCheckResult;
use crate::store::{RestStore, StatusPatch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub success: usize,
    pub fail: usize,
}

pub struct RemoteStatusUpdater {
    store: RestStore,
    chunk_size: usize,
}

impl RemoteStatusUpdater {
    pub fn new(store: RestStore, chunk_size: usize) -> Self {
        Self { store, chunk_size: chunk_size.max(1) }
    }

    pub async fn update(&self, results: &[HealthCheckResult]) -> UpdateReport {
        let mut report = UpdateReport::default();
        for chunk in results.chunks(self.chunk_size) {
            let outcomes = join_all(chunk.iter().map(|result| self.update_one(result))).await;
            for ok in outcomes {
                if ok {
                    report.success += 1;
                } else {
                    report.fail += 1;
                }
            }
        }
        debug!("[updater] {} updated, {} failed", report.success, report.fail);
        report
    }

    async fn update_one(&self, result: &HealthCheckResult) -> bool {
        if result.node_id.is_empty() {
            warn!("[updater] result for {}:{} has no node id", result.host, result.port);
            return false;
        }
        let patch = StatusPatch {
            status: result.status,
            last_health_check: result.checked_at.clone(),
            health_latency: result.latency_ms,
        };
        match self.store.patch_node(&result.node_id, &patch).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[updater] failed to update {}: {}", result.node_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatastoreConf;
    use crate::models::HealthStatus;
    use serde_json::json;
    use viper_devkit::MockDatastore;

    fn result(id: &str, status: HealthStatus) -> HealthCheckResult {
        HealthCheckResult {
            node_id: id.into(),
            host: "h".into(),
            port: 1,
            status,
            tcp_ok: status != HealthStatus::Offline,
            http_ok: status == HealthStatus::Online,
            latency_ms: Some(33),
            error_message: None,
            retry_count: 0,
            checked_at: "2024-06-10T12:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_update_counts_success_and_failures() {
        let datastore = MockDatastore::start().await.unwrap();
        datastore.seed(vec![
            json!({"id": "a", "content": {}}),
            json!({"id": "b", "content": {}}),
            json!({"id": "c", "content": {}}),
        ]);
        datastore.fail_patch_for("b");

        let store = RestStore::from_config(&DatastoreConf {
            url: Some(datastore.base_url()),
            ..Default::default()
        })
        .unwrap();
        let updater = RemoteStatusUpdater::new(store, 2);

        let report = updater
            .update(&[
                result("a", HealthStatus::Online),
                result("b", HealthStatus::Offline),
                result("c", HealthStatus::Suspect),
                result("", HealthStatus::Online),
            ])
            .await;

        assert_eq!(report, UpdateReport { success: 2, fail: 2 });
        assert_eq!(datastore.row("a").unwrap()["status"], json!("online"));
        assert_eq!(datastore.row("c").unwrap()["status"], json!("suspect"));
        assert_eq!(datastore.row("c").unwrap()["last_health_check"], json!("2024-06-10T12:00:00Z"));
        assert!(datastore.row("b").unwrap().get("status").is_none());
    }
}
