/*!
Datastore REST en mémoire

Sert `/rest/v1/{table}` comme PostgREST le ferait pour le kernel:
- GET: filtres `col=eq.x`, `order=col.asc.nullsfirst`, `limit`, `offset`, `select`
- POST: upsert par `id`, les champs reçus écrasent ceux de la ligne existante
- PATCH `?id=eq.x`: fusion des champs, réponse 204

Les pannes se programment (`fail_next_upserts`, `fail_patch_for`) pour tester
les chemins d'erreur sans serveur réel.
*/

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Table {
    rows: Vec<Value>,
    failing_upserts: usize,
    failing_patch_ids: HashSet<String>,
    upsert_requests: usize,
    last_api_key: Option<String>,
}

type SharedTable = Arc<Mutex<Table>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct MockDatastore {
    addr: SocketAddr,
    table: SharedTable,
}

impl MockDatastore {
    /// Démarre le serveur sur un port libre de 127.0.0.1.
    pub async fn start() -> Result<Self> {
        let table: SharedTable = Arc::new(Mutex::new(Table::default()));
        let app = Router::new()
            .route("/rest/v1/{table}", get(select_rows).post(upsert_rows).patch(patch_rows))
            .with_state(table.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("mock datastore stopped: {}", e);
            }
        });
        log::debug!("mock datastore listening on {}", addr);
        Ok(Self { addr, table })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn seed(&self, rows: Vec<Value>) {
        let mut table = lock(&self.table);
        for row in rows {
            merge_row(&mut table.rows, row);
        }
    }

    pub fn rows(&self) -> Vec<Value> {
        lock(&self.table).rows.clone()
    }

    pub fn row(&self, id: &str) -> Option<Value> {
        lock(&self.table)
            .rows
            .iter()
            .find(|row| row_id(row).as_deref() == Some(id))
            .cloned()
    }

    /// Les `count` prochains POST répondent 500 sans rien écrire.
    pub fn fail_next_upserts(&self, count: usize) {
        lock(&self.table).failing_upserts = count;
    }

    /// Tout PATCH visant cet id répond 500.
    pub fn fail_patch_for(&self, id: &str) {
        lock(&self.table).failing_patch_ids.insert(id.to_string());
    }

    pub fn upsert_requests(&self) -> usize {
        lock(&self.table).upsert_requests
    }

    pub fn last_api_key(&self) -> Option<String> {
        lock(&self.table).last_api_key.clone()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_id(row: &Value) -> Option<String> {
    row.get("id").filter(|v| !v.is_null()).map(render)
}

fn merge_row(rows: &mut Vec<Value>, incoming: Value) {
    let Some(id) = row_id(&incoming) else {
        log::warn!("mock datastore ignoring row without id");
        return;
    };
    match rows.iter_mut().find(|row| row_id(row).as_deref() == Some(id.as_str())) {
        Some(existing) => merge_fields(existing, incoming),
        None => rows.push(incoming),
    }
}

fn merge_fields(target: &mut Value, patch: Value) {
    if let (Some(target), Value::Object(fields)) = (target.as_object_mut(), patch) {
        target.extend(fields);
    }
}

fn record_key(table: &mut Table, headers: &HeaderMap) {
    if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
        table.last_api_key = Some(key.to_string());
    }
}

fn server_error(message: &str) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": message }))).into_response()
}

struct OrderSpec {
    column: String,
    descending: bool,
    nulls_first: bool,
}

impl OrderSpec {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.split('.');
        let column = parts.next().unwrap_or_default().to_string();
        let mut descending = false;
        let mut nulls_first = None;
        for part in parts {
            match part {
                "desc" => descending = true,
                "asc" => descending = false,
                "nullsfirst" => nulls_first = Some(true),
                "nullslast" => nulls_first = Some(false),
                _ => {}
            }
        }
        // Comportement PostgreSQL par défaut: NULL est le plus grand
        Self { column, descending, nulls_first: nulls_first.unwrap_or(descending) }
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let left = a.get(&self.column).filter(|v| !v.is_null());
        let right = b.get(&self.column).filter(|v| !v.is_null());
        match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => if self.nulls_first { Ordering::Less } else { Ordering::Greater },
            (Some(_), None) => if self.nulls_first { Ordering::Greater } else { Ordering::Less },
            (Some(l), Some(r)) => {
                let ordering = match (l.as_f64(), r.as_f64()) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    _ => render(l).cmp(&render(r)),
                };
                if self.descending { ordering.reverse() } else { ordering }
            }
        }
    }
}

async fn select_rows(
    State(table): State<SharedTable>,
    Path(_table_name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let mut table = lock(&table);
    record_key(&mut table, &headers);

    let mut rows = table.rows.clone();
    let mut select = None;
    let mut limit = None;
    let mut offset = 0usize;

    for (key, value) in &params {
        match key.as_str() {
            "select" => select = Some(value.clone()),
            "limit" => limit = value.parse::<usize>().ok(),
            "offset" => offset = value.parse::<usize>().unwrap_or(0),
            "order" => {
                let spec = OrderSpec::parse(value);
                rows.sort_by(|a, b| spec.compare(a, b));
            }
            column => {
                if let Some(expected) = value.strip_prefix("eq.") {
                    rows.retain(|row| row.get(column).map(render).as_deref() == Some(expected));
                }
            }
        }
    }

    let rows: Vec<Value> = rows
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|row| project(row, select.as_deref()))
        .collect();
    Json(rows)
}

fn project(row: Value, select: Option<&str>) -> Value {
    let columns: Vec<&str> = match select {
        None | Some("*") => return row,
        Some(list) => list.split(',').map(str::trim).collect(),
    };
    match row {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(key, _)| columns.contains(&key.as_str()))
                .collect(),
        ),
        other => other,
    }
}

async fn upsert_rows(
    State(table): State<SharedTable>,
    Path(_table_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let mut table = lock(&table);
    record_key(&mut table, &headers);
    table.upsert_requests += 1;

    if table.failing_upserts > 0 {
        table.failing_upserts -= 1;
        return server_error("injected upsert failure");
    }

    let incoming = match body {
        Value::Array(rows) => rows,
        single => vec![single],
    };
    for row in incoming {
        merge_row(&mut table.rows, row);
    }
    StatusCode::CREATED.into_response()
}

async fn patch_rows(
    State(table): State<SharedTable>,
    Path(_table_name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let mut table = lock(&table);
    record_key(&mut table, &headers);

    let Some(id) = params
        .iter()
        .find(|(key, _)| key == "id")
        .and_then(|(_, value)| value.strip_prefix("eq."))
        .map(str::to_string)
    else {
        let body = Json(json!({ "message": "missing id filter" }));
        return (StatusCode::BAD_REQUEST, body).into_response();
    };

    if table.failing_patch_ids.contains(&id) {
        return server_error("injected patch failure");
    }
    for row in table.rows.iter_mut().filter(|row| row_id(row).as_deref() == Some(id.as_str())) {
        merge_fields(row, body.clone());
    }
    StatusCode::NO_CONTENT.into_response()
}
