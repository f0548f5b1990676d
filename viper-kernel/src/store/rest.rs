//! Client du datastore REST (dialecte PostgREST) : lecture des lignes `nodes`,
//! upserts par lots et PATCH des colonnes de santé.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{StoreError, StoreQuery};
use crate::config::DatastoreConf;
use crate::identity::identity_key;
use crate::models::{latency_from_wire, latency_to_wire, HealthStatus, Node, RecordError};

/// Ligne lue depuis la table `nodes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRow {
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub is_free: Option<bool>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub latency: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_health_check: Option<String>,
    #[serde(default)]
    pub health_latency: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

impl NodeRow {
    /// `content` est un objet JSON, ou sa forme sérialisée en chaîne.
    pub fn content_object(&self) -> Option<Map<String, Value>> {
        match &self.content {
            Value::Object(map) => Some(map.clone()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }

    /// Reconstruit le nœud ; les colonnes de santé de la ligne priment sur `content`.
    pub fn to_node(&self) -> Result<Node, RecordError> {
        let mut content = self.content_object().unwrap_or_default();
        if let Some(link) = &self.link {
            content.entry("link").or_insert_with(|| Value::String(link.clone()));
        }
        if let Some(is_free) = self.is_free {
            content.entry("is_free").or_insert(Value::Bool(is_free));
        }

        let mut node = Node::from_value(&Value::Object(content))?;
        if !self.id.is_empty() {
            node.id = Some(self.id.clone());
        }
        if node.speed.is_none() {
            node.speed = self.speed.filter(|s| *s > 0.0);
        }
        if node.latency_ms.is_none() {
            node.latency_ms = self.latency.and_then(latency_from_wire);
        }
        if let Some(status) = self.status.as_deref().and_then(HealthStatus::parse) {
            node.status = Some(status);
        }
        if self.last_health_check.is_some() {
            node.last_health_check = self.last_health_check.clone();
        }
        if let Some(latency) = self.health_latency.and_then(latency_from_wire) {
            node.health_latency = Some(latency);
        }
        Ok(node)
    }
}

/// Ligne écrite par la sync ; les colonnes de santé n'y figurent pas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUpsert {
    pub id: String,
    pub content: Value,
    pub link: String,
    pub is_free: bool,
    pub speed: f64,
    /// 9999 quand aucune mesure (colonne non-nullable).
    pub latency: u32,
    pub updated_at: String,
}

impl NodeUpsert {
    pub fn from_node(node: &Node, updated_at: &str) -> Option<Self> {
        let id = node.id.clone().or_else(|| identity_key(node))?;
        let content = serde_json::to_value(node).ok()?;
        Some(Self {
            id,
            content,
            link: node.link.clone().unwrap_or_default(),
            is_free: node.is_free.unwrap_or(false),
            speed: node.speed.unwrap_or(0.0),
            latency: latency_to_wire(node.latency_ms),
            updated_at: updated_at.to_string(),
        })
    }
}

/// Colonnes mises à jour après un health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPatch {
    pub status: HealthStatus,
    pub last_health_check: String,
    pub health_latency: Option<u32>,
}

/// Ligne d'un nœud évincé : le contenu porte `should_delete`, le statut passe offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionPatch {
    pub content: Value,
    pub status: HealthStatus,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0
    }
}

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    batch_size: usize,
}

impl RestStore {
    pub fn from_config(conf: &DatastoreConf) -> Result<Self, StoreError> {
        let base = conf.url.as_deref().ok_or(StoreError::NotConfigured)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", base.trim_end_matches('/'), conf.table),
            key: conf.key.clone().unwrap_or_default(),
            batch_size: conf.upsert_batch_size.max(1),
        })
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.client
            .request(method, &self.endpoint)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    pub async fn select(&self, query: &StoreQuery) -> Result<Vec<NodeRow>, StoreError> {
        let response = self.request(Method::GET).query(&query.to_params()).send().await?;
        let response = expect_success(response).await?;
        Ok(response.json::<Vec<NodeRow>>().await?)
    }

    /// Les nœuds jamais vérifiés d'abord, puis les plus anciennement vérifiés.
    pub async fn nodes_for_health_check(&self, limit: usize) -> Result<Vec<NodeRow>, StoreError> {
        let query = StoreQuery {
            select: Some("id,content,status,last_health_check".into()),
            order_by: Some("last_health_check.asc.nullsfirst".into()),
            limit: Some(limit),
            ..Default::default()
        };
        self.select(&query).await
    }

    /// Upsert par lots de `upsert_batch_size` ; un lot en échec n'arrête pas les suivants.
    pub async fn upsert_rows(&self, rows: &[NodeUpsert]) -> UpsertReport {
        let mut report = UpsertReport::default();
        for (index, batch) in rows.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            match self.upsert_batch(batch).await {
                Ok(()) => {
                    debug!("[store] upserted batch {} ({} rows)", index + 1, batch.len());
                    report.rows_written += batch.len();
                }
                Err(e) => {
                    warn!("[store] batch {} failed ({} rows): {}", index + 1, batch.len(), e);
                    report.failed_batches += 1;
                    report.rows_failed += batch.len();
                }
            }
        }
        report
    }

    async fn upsert_batch(&self, batch: &[NodeUpsert]) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(batch)
            .send()
            .await?;
        expect_success(response).await.map(|_| ())
    }

    /// Marque les lignes des nœuds évincés ; renvoie le nombre d'échecs.
    pub async fn mark_evicted(&self, nodes: &[Node], updated_at: &str) -> usize {
        let mut failed = 0;
        for node in nodes {
            let Some(id) = node.id.clone().or_else(|| identity_key(node)) else {
                continue;
            };
            let patch = EvictionPatch {
                content: serde_json::to_value(node).unwrap_or(Value::Null),
                status: HealthStatus::Offline,
                updated_at: updated_at.to_string(),
            };
            if let Err(e) = self.patch_node(&id, &patch).await {
                warn!("[store] failed to mark {} evicted: {}", id, e);
                failed += 1;
            }
        }
        failed
    }

    /// PATCH `?id=eq.{id}` ; succès sur 200 ou 204 uniquement.
    pub async fn patch_node<T: Serialize + ?Sized>(
        &self,
        id: &str,
        patch: &T,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 204 => Ok(()),
            status => Err(StoreError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

async fn expect_success(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use viper_devkit::MockDatastore;

    fn conf_for(datastore: &MockDatastore, batch: usize) -> DatastoreConf {
        DatastoreConf {
            url: Some(datastore.base_url()),
            key: Some("service-key".into()),
            upsert_batch_size: batch,
            ..Default::default()
        }
    }

    fn upsert(i: usize) -> NodeUpsert {
        let mut node = Node::new("vmess", &format!("10.0.0.{i}"), 443);
        node.latency_ms = if i % 2 == 0 { Some(100 + i as u32) } else { None };
        NodeUpsert::from_node(&node, "2024-06-10T12:00:00Z").unwrap()
    }

    #[test]
    fn test_upsert_row_uses_sentinel_and_identity_id() {
        let row = upsert(1);
        assert_eq!(row.id, "vmess://10.0.0.1:443");
        assert_eq!(row.latency, 9999);
        assert!(!row.is_free);
        assert_eq!(row.content["host"], json!("10.0.0.1"));
    }

    #[test]
    fn test_row_to_node_accepts_string_content() {
        let row: NodeRow = serde_json::from_value(json!({
            "id": 42,
            "content": "{\"protocol\":\"trojan\",\"host\":\"t.example\",\"port\":443}",
            "status": "suspect",
            "latency": 9999,
            "health_latency": 210
        }))
        .unwrap();
        let node = row.to_node().unwrap();
        assert_eq!(node.id.as_deref(), Some("42"));
        assert_eq!(node.host, "t.example");
        assert_eq!(node.latency_ms, None);
        assert_eq!(node.status, Some(HealthStatus::Suspect));
        assert_eq!(node.health_latency, Some(210));
    }

    #[test]
    fn test_row_without_host_is_rejected() {
        let row: NodeRow =
            serde_json::from_value(json!({"id": "x", "content": {"port": 1}})).unwrap();
        assert!(row.to_node().is_err());
    }

    #[tokio::test]
    async fn test_upsert_in_batches() {
        let datastore = MockDatastore::start().await.unwrap();
        let store = RestStore::from_config(&conf_for(&datastore, 50)).unwrap();

        let rows: Vec<_> = (0..120).map(upsert).collect();
        let report = store.upsert_rows(&rows).await;

        assert_eq!(report.batches, 3);
        assert!(report.is_complete());
        assert_eq!(report.rows_written, 120);
        assert_eq!(datastore.upsert_requests(), 3);
        assert_eq!(datastore.rows().len(), 120);
        assert_eq!(datastore.last_api_key().as_deref(), Some("service-key"));

        // rejouer le même lot ne duplique rien
        store.upsert_rows(&rows).await;
        assert_eq!(datastore.rows().len(), 120);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_others() {
        let datastore = MockDatastore::start().await.unwrap();
        datastore.fail_next_upserts(1);
        let store = RestStore::from_config(&conf_for(&datastore, 2)).unwrap();

        let rows: Vec<_> = (0..5).map(upsert).collect();
        let report = store.upsert_rows(&rows).await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.rows_failed, 2);
        assert_eq!(report.rows_written, 3);
        assert_eq!(datastore.rows().len(), 3);
    }

    #[tokio::test]
    async fn test_health_selection_puts_unchecked_first() {
        let datastore = MockDatastore::start().await.unwrap();
        datastore.seed(vec![
            json!({"id": "a", "content": {"host": "a", "port": 1}, "last_health_check": "2024-06-02T00:00:00Z"}),
            json!({"id": "b", "content": {"host": "b", "port": 1}, "last_health_check": null}),
            json!({"id": "c", "content": {"host": "c", "port": 1}, "last_health_check": "2024-06-01T00:00:00Z"}),
        ]);
        let store = RestStore::from_config(&conf_for(&datastore, 50)).unwrap();

        let rows = store.nodes_for_health_check(2).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_patch_node() {
        let datastore = MockDatastore::start().await.unwrap();
        datastore.seed(vec![json!({"id": "n1", "content": {"host": "h", "port": 1}})]);
        datastore.fail_patch_for("n2");
        let store = RestStore::from_config(&conf_for(&datastore, 50)).unwrap();

        let patch = StatusPatch {
            status: HealthStatus::Online,
            last_health_check: "2024-06-10T12:00:00Z".into(),
            health_latency: Some(42),
        };
        store.patch_node("n1", &patch).await.unwrap();
        let row = datastore.row("n1").unwrap();
        assert_eq!(row["status"], json!("online"));
        assert_eq!(row["health_latency"], json!(42));

        let err = store.patch_node("n2", &patch).await.unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_mark_evicted() {
        let datastore = MockDatastore::start().await.unwrap();
        datastore.seed(vec![
            json!({"id": "vless://gone.example:443", "status": "online", "content": {"host": "gone.example"}}),
            json!({"id": "n2", "status": "online"}),
        ]);
        datastore.fail_patch_for("n2");
        let store = RestStore::from_config(&conf_for(&datastore, 50)).unwrap();

        let mut gone = Node::new("vless", "gone.example", 443);
        gone.offline_status = true;
        gone.should_delete = true;
        let mut failing = Node::new("vless", "other.example", 443);
        failing.id = Some("n2".into());

        let failed = store.mark_evicted(&[gone, failing], "2024-06-10T12:00:00Z").await;
        assert_eq!(failed, 1);

        let row = datastore.row("vless://gone.example:443").unwrap();
        assert_eq!(row["status"], json!("offline"));
        assert_eq!(row["content"]["should_delete"], json!(true));
        assert_eq!(row["updated_at"], json!("2024-06-10T12:00:00Z"));
        assert_eq!(datastore.row("n2").unwrap()["status"], json!("online"));
    }

    #[test]
    fn test_missing_url_is_not_configured() {
        let err = RestStore::from_config(&DatastoreConf::default()).err();
        assert!(matches!(err, Some(StoreError::NotConfigured)));
    }
}
