/*!
Builder d'enregistrements de nœuds tels que la source les publie.
*/

use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// Horodatage RFC3339 (UTC) d'il y a `days` jours.
pub fn days_ago(days: i64) -> String {
    (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct NodeFixture {
    fields: Map<String, Value>,
}

impl NodeFixture {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        let mut fields = Map::new();
        fields.insert("protocol".into(), json!(protocol));
        fields.insert("host".into(), json!(host));
        fields.insert("port".into(), json!(port));
        Self { fields }
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn id(self, id: &str) -> Self {
        self.field("id", json!(id))
    }

    pub fn latency(self, ms: u32) -> Self {
        self.field("latency", json!(ms))
    }

    pub fn speed(self, mbps: f64) -> Self {
        self.field("speed", json!(mbps))
    }

    pub fn country(self, code: &str) -> Self {
        self.field("country", json!(code))
    }

    pub fn free(self, is_free: bool) -> Self {
        self.field("is_free", json!(is_free))
    }

    pub fn link(self, link: &str) -> Self {
        self.field("link", json!(link))
    }

    pub fn first_seen(self, at: &str) -> Self {
        self.field("first_seen_at", json!(at))
    }

    pub fn verified(self, at: &str) -> Self {
        self.field("last_verified_at", json!(at))
    }

    /// Hors ligne depuis `at` (premier échec de vérification).
    pub fn offline_since(self, at: &str) -> Self {
        self.field("offline_status", json!(true))
            .field("verification_failed_at", json!(at))
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}
