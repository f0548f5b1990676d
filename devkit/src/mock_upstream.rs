/*!
Source upstream simulée: sert l'export JSON des nœuds sur `/nodes/export`.
*/

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

struct Export {
    payload: Value,
    failing: usize,
    hits: usize,
}

type SharedExport = Arc<Mutex<Export>>;

fn lock(export: &SharedExport) -> MutexGuard<'_, Export> {
    export.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct MockUpstream {
    addr: SocketAddr,
    export: SharedExport,
}

impl MockUpstream {
    pub async fn start(payload: Value) -> Result<Self> {
        let export = Arc::new(Mutex::new(Export { payload, failing: 0, hits: 0 }));
        let app = Router::new()
            .route("/nodes/export", get(serve_export))
            .with_state(export.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("mock upstream stopped: {}", e);
            }
        });
        Ok(Self { addr, export })
    }

    pub fn url(&self) -> String {
        format!("http://{}/nodes/export?format=json", self.addr)
    }

    pub fn set_payload(&self, payload: Value) {
        lock(&self.export).payload = payload;
    }

    /// Les `count` prochaines requêtes répondent 500.
    pub fn fail_next(&self, count: usize) {
        lock(&self.export).failing = count;
    }

    pub fn hits(&self) -> usize {
        lock(&self.export).hits
    }
}

async fn serve_export(State(export): State<SharedExport>) -> axum::response::Response {
    let mut export = lock(&export);
    export.hits += 1;
    if export.failing > 0 {
        export.failing -= 1;
        let body = Json(json!({ "error": "injected failure" }));
        return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    }
    Json(export.payload.clone()).into_response()
}
