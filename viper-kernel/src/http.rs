/**
 * API REST VIPER - Lecture de l'ensemble de travail et déclenchement des cycles
 *
 * RÔLE :
 * Surface HTTP fine au-dessus de l'orchestrateur et du health runner :
 * consultation des nœuds, statistiques, déclenchements manuels, webhook entrant.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum (bind configurable, défaut 0.0.0.0:8002)
 * - Routes : /health, /system/health, /nodes, /nodes/top, /sync, /sync/status,
 *   /sync/verify, /health-check, /health-check/stats, /webhooks/nodes
 * - Les cycles renvoient toujours leur résumé ; l'échec est dans `status`
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /health et /webhooks/{event}
 * - Sans clé configurée, l'API protégée refuse tout
 * - Le webhook est authentifié par signature HMAC + fenêtre de fraîcheur
 */

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;

use crate::health::runner::{HealthCheckSummary, HealthRunner, HealthStats};
use crate::models::Node;
use crate::scoring::{top_by_latency, top_by_speed};
use crate::state::Shared;
use crate::status::{memory_usage_mb, KernelStatus, StatusTracker};
use crate::store::StoreError;
use crate::sync::{SchedulerState, SyncOrchestrator, SyncStatistics, SyncSummary};
use crate::webhook::{authenticate, WebhookPayload, SIGNATURE_HEADER, TIMESTAMP_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub runner: Arc<HealthRunner>,
    pub status: StatusTracker,
    pub scheduler: Shared<SchedulerState>,
    pub auth: Arc<HttpAuth>,
}

/// Secrets de la section `http`.
#[derive(Debug, Clone, Default)]
pub struct HttpAuth {
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
}

impl From<&crate::config::HttpConf> for HttpAuth {
    fn from(conf: &crate::config::HttpConf) -> Self {
        Self {
            api_key: conf.api_key.clone().filter(|k| !k.is_empty()),
            webhook_secret: conf.webhook_secret.clone().filter(|s| !s.is_empty()),
            webhook_tolerance_secs: conf.webhook_tolerance_secs,
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": message.into() })))
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/webhooks/") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.auth.api_key.as_deref() else {
        warn!("[http] api key not configured, denying {}", path);
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected request to {} (bad api key)", path);
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(list_nodes))
        .route("/nodes/top", get(top_nodes))
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
        .route("/sync/verify", post(trigger_verification))
        .route("/health-check", post(trigger_health_check))
        .route("/health-check/stats", get(health_check_stats))
        .route("/webhooks/nodes", post(receive_webhook))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelStatus> {
    Json(KernelStatus {
        uptime_seconds: app.status.uptime_seconds(),
        scheduler: *app.scheduler.lock(),
        phase: app.orchestrator.phase(),
        nodes_tracked: app.orchestrator.working_set().len(),
        datastore_configured: app.orchestrator.has_datastore(),
        upstream_configured: app.orchestrator.has_upstream(),
        memory_usage_mb: memory_usage_mb(),
        last_sync: app.status.last_sync(),
        last_health_check: app.status.last_health(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct NodesQuery {
    limit: Option<usize>,
    is_free: Option<bool>,
    country: Option<String>,
    protocol: Option<String>,
    #[serde(default)]
    include_stale: bool,
}

impl NodesQuery {
    fn matches(&self, node: &Node) -> bool {
        (self.include_stale || !node.is_stale)
            && self.is_free.map_or(true, |free| node.is_free.unwrap_or(false) == free)
            && self.country.as_deref().map_or(true, |c| {
                node.country.as_deref().is_some_and(|nc| nc.eq_ignore_ascii_case(c))
            })
            && self.protocol.as_deref().map_or(true, |p| node.protocol.eq_ignore_ascii_case(p))
    }
}

// GET /nodes
async fn list_nodes(
    State(app): State<AppState>,
    Query(query): Query<NodesQuery>,
) -> Json<Vec<Node>> {
    let nodes = app
        .orchestrator
        .working_set()
        .into_iter()
        .filter(|node| query.matches(node))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    Json(nodes)
}

#[derive(Debug, Deserialize)]
struct TopQuery {
    metric: Option<String>,
    limit: Option<usize>,
}

// GET /nodes/top?metric=latency|speed
async fn top_nodes(
    State(app): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let nodes: Vec<Node> = app
        .orchestrator
        .working_set()
        .into_iter()
        .filter(|n| !n.is_stale && !n.offline_status)
        .collect();
    let limit = query.limit.unwrap_or(10);
    let ranked = match query.metric.as_deref().unwrap_or("latency") {
        "latency" => top_by_latency(&nodes, limit),
        "speed" => top_by_speed(&nodes, limit),
        other => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown metric '{other}'"),
            ))
        }
    };
    Ok(Json(ranked.into_iter().cloned().collect()))
}

// GET /sync/status
async fn sync_status(State(app): State<AppState>) -> Json<SyncStatistics> {
    Json(app.orchestrator.sync_statistics())
}

// POST /sync
async fn trigger_sync(State(app): State<AppState>) -> Json<SyncSummary> {
    let summary = app.orchestrator.run_sync_cycle().await;
    app.status.record_sync(&summary);
    Json(summary)
}

// POST /sync/verify
async fn trigger_verification(State(app): State<AppState>) -> Json<SyncSummary> {
    let summary = app.orchestrator.run_verification_cycle().await;
    app.status.record_sync(&summary);
    Json(summary)
}

#[derive(Debug, Deserialize)]
struct HealthCheckParams {
    batch_size: Option<usize>,
}

// POST /health-check?batch_size=
async fn trigger_health_check(
    State(app): State<AppState>,
    Query(params): Query<HealthCheckParams>,
) -> Json<HealthCheckSummary> {
    let summary = app.runner.run_health_check(params.batch_size).await;
    app.status.record_health(&summary);
    Json(summary)
}

// GET /health-check/stats
async fn health_check_stats(State(app): State<AppState>) -> Result<Json<HealthStats>, ApiError> {
    match app.runner.health_stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(StoreError::NotConfigured) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "datastore not configured",
        )),
        Err(e) => {
            warn!("[http] health stats failed: {}", e);
            Err(api_error(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

// POST /webhooks/nodes
async fn receive_webhook(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncSummary>, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    authenticate(
        app.auth.webhook_secret.as_deref(),
        &body,
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        OffsetDateTime::now_utc(),
        app.auth.webhook_tolerance_secs,
    )
    .map_err(|e| {
        warn!("[http] webhook rejected: {}", e);
        api_error(StatusCode::UNAUTHORIZED, e.to_string())
    })?;

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid payload: {e}")))?;

    tracing::info!(
        "[http] webhook {} with {} nodes",
        payload.event_type.as_deref().unwrap_or("unknown"),
        payload.nodes.len()
    );
    let summary = app
        .orchestrator
        .handle_incoming_batch(payload.nodes, payload.timestamp)
        .await;
    app.status.record_sync(&summary);
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConf;
    use crate::health::HealthChecker;
    use crate::lifecycle::LifecyclePolicy;
    use crate::scoring::ScoringPolicy;
    use crate::state::new_state;
    use crate::store::SnapshotStore;
    use crate::sync::{SyncSettings, SyncStatus};
    use crate::webhook::sign;
    use tempfile::{tempdir, TempDir};
    use tokio::net::TcpListener;
    use viper_devkit::NodeFixture;

    const KEY: &str = "test-key";
    const SECRET: &str = "hook-secret";

    async fn serve() -> (String, TempDir) {
        let dir = tempdir().unwrap();
        let checker = Arc::new(HealthChecker::from_config(&HealthConf::default()).unwrap());
        let orchestrator = SyncOrchestrator::open(
            SyncSettings { lifecycle: LifecyclePolicy::default(), verify_rounds: 1 },
            SnapshotStore::new(dir.path().join("nodes.json")),
            None,
            None,
            checker.clone(),
            ScoringPolicy::default(),
        )
        .await;
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            runner: Arc::new(HealthRunner::new(checker, None, 20, 50)),
            status: StatusTracker::new(),
            scheduler: new_state(SchedulerState::Stopped),
            auth: Arc::new(HttpAuth {
                api_key: Some(KEY.into()),
                webhook_secret: Some(SECRET.into()),
                webhook_tolerance_secs: 300,
            }),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        (format!("http://{addr}"), dir)
    }

    fn webhook_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_type": "nodes_updated",
            "timestamp": "2024-06-10T12:00:00Z",
            "nodes": [
                NodeFixture::new("vmess", "a.example", 443).country("jp").latency(80).build(),
                NodeFixture::new("trojan", "b.example", 443).country("US").free(true).build()
            ],
            "total_count": 2
        }))
        .unwrap()
    }

    async fn post_webhook(base: &str, body: Vec<u8>, secret: &str) -> reqwest::Response {
        let ts = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let signature = sign(secret, &body, &ts).unwrap();
        reqwest::Client::new()
            .post(format!("{base}/webhooks/nodes"))
            .header(TIMESTAMP_HEADER, ts)
            .header(SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_api_key_required_except_health() {
        let (base, _dir) = serve().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "ok");

        let denied = client.get(format!("{base}/nodes")).send().await.unwrap();
        assert_eq!(denied.status(), 401);

        let nodes: Vec<Value> = client
            .get(format!("{base}/nodes"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_signed_webhook_feeds_working_set() {
        let (base, _dir) = serve().await;
        let response = post_webhook(&base, webhook_body(), SECRET).await;
        assert_eq!(response.status(), 200);
        let summary: Value = response.json().await.unwrap();
        assert_eq!(summary["status"], json!("updated"));
        assert_eq!(summary["source"], json!("webhook"));
        assert_eq!(summary["total"], json!(2));

        let client = reqwest::Client::new();
        let japanese: Vec<Value> = client
            .get(format!("{base}/nodes?country=JP"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(japanese.len(), 1);
        assert_eq!(japanese[0]["host"], json!("a.example"));

        let free: Vec<Value> = client
            .get(format!("{base}/nodes?is_free=true"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0]["protocol"], json!("trojan"));

        let top: Vec<Value> = client
            .get(format!("{base}/nodes/top?metric=latency"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(top.len(), 1);

        let stats: Value = client
            .get(format!("{base}/sync/status"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["webhook_received_count"], json!(1));
        assert_eq!(stats["metadata"]["remote_timestamp"], json!("2024-06-10T12:00:00Z"));

        let status: Value = client
            .get(format!("{base}/system/health"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["nodes_tracked"], json!(2));
        assert_eq!(status["scheduler"], json!("stopped"));
        assert_eq!(status["last_sync"]["status"], json!("updated"));
    }

    #[tokio::test]
    async fn test_webhook_rejections() {
        let (base, _dir) = serve().await;

        let forged = post_webhook(&base, webhook_body(), "wrong-secret").await;
        assert_eq!(forged.status(), 401);

        let unsigned = reqwest::Client::new()
            .post(format!("{base}/webhooks/nodes"))
            .body(webhook_body())
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), 401);

        let garbage = post_webhook(&base, b"not json".to_vec(), SECRET).await;
        assert_eq!(garbage.status(), 400);
    }

    #[tokio::test]
    async fn test_triggers_without_backends() {
        let (base, _dir) = serve().await;
        let client = reqwest::Client::new();

        let summary: SyncSummaryView = client
            .post(format!("{base}/sync"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary.status, "error");

        let stats = client
            .get(format!("{base}/health-check/stats"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(stats.status(), 503);

        let bad_metric = client
            .get(format!("{base}/nodes/top?metric=jitter"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_metric.status(), 400);

        let verify: Value = client
            .post(format!("{base}/sync/verify"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(verify["status"], json!(SyncStatus::Unchanged));
    }

    #[derive(Deserialize)]
    struct SyncSummaryView {
        status: String,
    }
}
