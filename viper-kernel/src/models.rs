/**
 * MODELS - Types centraux du pipeline de nœuds proxy
 *
 * RÔLE : Node (enregistrement central), Protocol + ProtocolClass (table unique de
 * classification), HealthStatus, HealthCheckResult, et parsing tolérant des
 * enregistrements venant de l'upstream ou du datastore.
 *
 * FONCTIONNEMENT :
 * - Les attributs qu'une source peut omettre sont des Option (absent ≠ présent)
 * - latency_ms: None = jamais mesuré ; la sentinelle 9999 n'existe qu'aux frontières
 * - Les champs inconnus sont conservés dans `extra` (aplati à la sérialisation)
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::links;

/// Valeur historique "jamais mesuré" des colonnes latency non-nullables.
pub const LATENCY_SENTINEL: u32 = 9999;

/// Champs connus du Node : tout le reste part dans `extra`.
const KNOWN_FIELDS: &[&str] = &[
    "id", "protocol", "host", "port", "name", "country", "link", "url", "is_free",
    "latency_ms", "latency", "speed", "quality_score", "success_rate", "first_seen_at",
    "last_updated_at", "updated_at", "age_days", "needs_verification", "offline_status",
    "verification_failed_at", "last_verified_at", "is_stale", "should_delete", "status",
    "last_health_check", "health_latency",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing host")]
    MissingHost,
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Protocole d'un nœud, ensemble fermé + échappatoire `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    ShadowsocksR,
    Http,
    Https,
    Socks,
    Other(String),
}

/// Classe de protocole : seule source de vérité pour le health check et le scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolClass {
    /// Tunnels qui ne répondent pas en HTTP : la joignabilité TCP fait foi.
    Tunneling,
    /// Un HEAD direct sur l'adresse du nœud a un sens.
    HttpCapable,
    Unknown,
}

impl Protocol {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "vmess" => Self::Vmess,
            "vless" => Self::Vless,
            "trojan" => Self::Trojan,
            "ss" | "shadowsocks" => Self::Shadowsocks,
            "ssr" => Self::ShadowsocksR,
            "http" => Self::Http,
            "https" => Self::Https,
            "socks" | "socks5" => Self::Socks,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "ss",
            Self::ShadowsocksR => "ssr",
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks => "socks5",
            Self::Other(tag) => tag,
        }
    }

    pub fn class(&self) -> ProtocolClass {
        match self {
            Self::Vmess | Self::Vless | Self::Trojan | Self::Shadowsocks | Self::ShadowsocksR => {
                ProtocolClass::Tunneling
            }
            Self::Http | Self::Https => ProtocolClass::HttpCapable,
            Self::Socks | Self::Other(_) => ProtocolClass::Unknown,
        }
    }

    /// Schéma à utiliser pour le HEAD de vérification, si le protocole en accepte un.
    pub fn http_scheme(&self) -> Option<&'static str> {
        match self {
            Self::Http => Some("http"),
            Self::Https => Some("https"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Offline,
    Suspect,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Suspect => "suspect",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "suspect" => Some(Self::Suspect),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Enregistrement central d'un nœud.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub protocol: String,
    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_free: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    /// Signal de classement pour l'UI, jamais un débit mesuré.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<String>,
    #[serde(default)]
    pub age_days: i64,
    #[serde(default)]
    pub needs_verification: bool,
    #[serde(default)]
    pub offline_status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<String>,
    #[serde(default)]
    pub is_stale: bool,
    #[serde(default)]
    pub should_delete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_latency: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.trim().to_ascii_lowercase(),
            host: host.trim().to_ascii_lowercase(),
            port,
            ..Default::default()
        }
    }

    pub fn protocol_kind(&self) -> Protocol {
        Protocol::parse(&self.protocol)
    }

    /// Parsing tolérant d'un enregistrement non fiable.
    ///
    /// Accepte nombres ou chaînes numériques pour port/latency/speed. Sans host/port
    /// explicites, tente une extraction depuis `link`. Rejette l'enregistrement si
    /// aucun host utilisable ou aucun port dans 1..=65535.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;

        let link = str_field(obj, "link").or_else(|| str_field(obj, "url"));
        let endpoint = link.as_deref().and_then(links::extract);

        let host = str_field(obj, "host")
            .map(|h| h.to_ascii_lowercase())
            .or_else(|| endpoint.as_ref().map(|e| e.host.clone()))
            .ok_or(RecordError::MissingHost)?;

        let port = match obj.get("port").filter(|v| !v.is_null()) {
            Some(raw) => parse_port(raw)?,
            None => endpoint
                .as_ref()
                .map(|e| e.port)
                .ok_or_else(|| RecordError::InvalidPort("missing".into()))?,
        };

        let protocol = str_field(obj, "protocol")
            .or_else(|| endpoint.as_ref().map(|e| e.protocol.clone()))
            .unwrap_or_else(|| "unknown".to_string())
            .to_ascii_lowercase();

        let latency_ms = num_field(obj, "latency_ms")
            .or_else(|| num_field(obj, "latency"))
            .and_then(latency_from_wire);

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id: id_field(obj),
            protocol,
            host,
            port,
            name: str_field(obj, "name"),
            country: str_field(obj, "country").map(|c| c.to_ascii_uppercase()),
            link,
            is_free: bool_field(obj, "is_free"),
            latency_ms,
            speed: num_field(obj, "speed").filter(|s| *s >= 0.0),
            quality_score: num_field(obj, "quality_score"),
            success_rate: num_field(obj, "success_rate"),
            first_seen_at: str_field(obj, "first_seen_at"),
            last_updated_at: str_field(obj, "last_updated_at")
                .or_else(|| str_field(obj, "updated_at")),
            age_days: num_field(obj, "age_days").map(|d| d.max(0.0) as i64).unwrap_or(0),
            needs_verification: bool_field(obj, "needs_verification").unwrap_or(false),
            offline_status: bool_field(obj, "offline_status").unwrap_or(false),
            verification_failed_at: str_field(obj, "verification_failed_at"),
            last_verified_at: str_field(obj, "last_verified_at"),
            is_stale: bool_field(obj, "is_stale").unwrap_or(false),
            should_delete: bool_field(obj, "should_delete").unwrap_or(false),
            status: str_field(obj, "status").and_then(|s| HealthStatus::parse(&s)),
            last_health_check: str_field(obj, "last_health_check"),
            health_latency: num_field(obj, "health_latency").and_then(latency_from_wire),
            extra,
        })
    }
}

/// Résultat éphémère d'une vérification de santé.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub status: HealthStatus,
    pub tcp_ok: bool,
    pub http_ok: bool,
    pub latency_ms: Option<u32>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub checked_at: String,
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub nodes: Vec<Node>,
    pub rejected: usize,
}

/// Parse un lot brut : les enregistrements invalides sont écartés et loggés,
/// jamais bloquants pour leurs voisins.
pub fn parse_batch(raw: &[Value]) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for (index, value) in raw.iter().enumerate() {
        match Node::from_value(value) {
            Ok(node) => batch.nodes.push(node),
            Err(e) => {
                warn!("[models] rejected record #{}: {}", index, e);
                batch.rejected += 1;
            }
        }
    }
    batch
}

/// 9999 et les valeurs négatives signifient "pas de mesure".
pub fn latency_from_wire(raw: f64) -> Option<u32> {
    if !raw.is_finite() || raw < 0.0 || raw >= LATENCY_SENTINEL as f64 {
        None
    } else {
        Some(raw.round() as u32)
    }
}

pub fn latency_to_wire(latency: Option<u32>) -> u32 {
    latency.unwrap_or(LATENCY_SENTINEL)
}

fn parse_port(raw: &Value) -> Result<u16, RecordError> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err(RecordError::InvalidPort(raw.to_string())),
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn num_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn id_field(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_classes() {
        for tag in ["vmess", "vless", "trojan", "ss", "shadowsocks", "ssr"] {
            assert_eq!(Protocol::parse(tag).class(), ProtocolClass::Tunneling, "{tag}");
        }
        assert_eq!(Protocol::parse("HTTP").class(), ProtocolClass::HttpCapable);
        assert_eq!(Protocol::parse("https").class(), ProtocolClass::HttpCapable);
        assert_eq!(Protocol::parse("socks5").class(), ProtocolClass::Unknown);
        assert_eq!(Protocol::parse("hysteria2").class(), ProtocolClass::Unknown);
        assert_eq!(Protocol::parse("hysteria2").as_str(), "hysteria2");
    }

    #[test]
    fn test_from_value_tolerates_string_numbers() {
        let node = Node::from_value(&json!({
            "protocol": "VMess",
            "host": " Example.COM ",
            "port": "443",
            "country": "jp",
            "latency": "120",
            "speed": 12.5
        }))
        .unwrap();

        assert_eq!(node.protocol, "vmess");
        assert_eq!(node.host, "example.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.country.as_deref(), Some("JP"));
        assert_eq!(node.latency_ms, Some(120));
        assert_eq!(node.speed, Some(12.5));
    }

    #[test]
    fn test_latency_sentinel_maps_to_none() {
        let node =
            Node::from_value(&json!({"protocol": "trojan", "host": "a.b", "port": 1, "latency": 9999}))
                .unwrap();
        assert_eq!(node.latency_ms, None);

        let node =
            Node::from_value(&json!({"protocol": "trojan", "host": "a.b", "port": 1, "latency": -1}))
                .unwrap();
        assert_eq!(node.latency_ms, None);

        assert_eq!(latency_to_wire(None), LATENCY_SENTINEL);
        assert_eq!(latency_to_wire(Some(5000)), 5000);
    }

    #[test]
    fn test_from_value_rejects_missing_host_or_port() {
        assert_eq!(Node::from_value(&json!({"port": 443})), Err(RecordError::MissingHost));
        assert_eq!(
            Node::from_value(&json!({"host": "", "port": 443})),
            Err(RecordError::MissingHost)
        );
        assert!(matches!(
            Node::from_value(&json!({"host": "a.b", "port": 0})),
            Err(RecordError::InvalidPort(_))
        ));
        assert!(matches!(
            Node::from_value(&json!({"host": "a.b", "port": 70000})),
            Err(RecordError::InvalidPort(_))
        ));
        assert_eq!(Node::from_value(&json!([1, 2])), Err(RecordError::NotAnObject));
    }

    #[test]
    fn test_from_value_falls_back_to_link() {
        let node = Node::from_value(&json!({
            "name": "tokyo-1",
            "link": "trojan://secret@jp.example.net:8443?sni=x#tokyo"
        }))
        .unwrap();
        assert_eq!(node.protocol, "trojan");
        assert_eq!(node.host, "jp.example.net");
        assert_eq!(node.port, 8443);
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let node = Node::from_value(&json!({
            "protocol": "vless", "host": "h", "port": 8080, "mainland_score": 80
        }))
        .unwrap();
        assert_eq!(node.extra.get("mainland_score"), Some(&json!(80)));

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["mainland_score"], json!(80));
        assert!(value.get("latency_ms").is_none());
    }

    #[test]
    fn test_parse_batch_counts_rejections() {
        let raw = vec![
            json!({"protocol": "vmess", "host": "1.1.1.1", "port": 443}),
            json!({"host": "", "port": 0}),
            json!("garbage"),
            json!({"protocol": "ss", "host": "2.2.2.2", "port": 8388}),
        ];
        let batch = parse_batch(&raw);
        assert_eq!(batch.nodes.len(), 2);
        assert_eq!(batch.rejected, 2);
    }
}
