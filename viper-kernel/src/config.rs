/**
 * CONFIG - Configuration du kernel (YAML + variables d'environnement)
 *
 * FONCTIONNEMENT :
 * - Fichier pointé par VIPER_KERNEL_CONFIG (défaut kernel.yaml), sections optionnelles
 * - Fichier absent ou invalide : défauts complets, jamais d'échec au démarrage
 * - Les variables d'environnement (.env inclus via dotenvy) écrasent le YAML ;
 *   les noms historiques SUPABASE_* / SPIDERFLOW_API_URL restent acceptés
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::scoring::ScoringPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub datastore: DatastoreConf,
    pub upstream: UpstreamConf,
    pub sync: SyncConf,
    pub health: HealthConf,
    pub scoring: ScoringPolicy,
    pub http: HttpConf,
}

/// Datastore REST (PostgREST) : table `nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConf {
    pub url: Option<String>,
    pub key: Option<String>,
    pub table: String,
    pub upsert_batch_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for DatastoreConf {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            table: "nodes".into(),
            upsert_batch_size: 50,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConf {
    /// URL complète de l'export JSON, ex: http://host/nodes/export?format=json
    pub source_url: Option<String>,
    pub fetch_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConf {
    fn default() -> Self {
        Self {
            source_url: None,
            fetch_attempts: 3,
            retry_delay_ms: 2000,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConf {
    pub poll_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub ttl_days: i64,
    pub max_offline_days: i64,
    pub snapshot_path: PathBuf,
    /// Connexions TCP par nœud pour le scoring lors de la vérification.
    pub verify_rounds: usize,
}

impl Default for SyncConf {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            verify_interval_secs: 86_400,
            ttl_days: 3,
            max_offline_days: 7,
            snapshot_path: PathBuf::from("./data/verified_nodes.json"),
            verify_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConf {
    pub tcp_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub check_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_concurrent: usize,
    pub batch_size: usize,
    /// 0 = pas de boucle périodique (déclenchement HTTP uniquement).
    pub interval_secs: u64,
}

impl Default for HealthConf {
    fn default() -> Self {
        Self {
            tcp_timeout_ms: 5_000,
            http_timeout_ms: 8_000,
            check_timeout_ms: 30_000,
            max_retries: 2,
            retry_delay_ms: 500,
            max_concurrent: 20,
            batch_size: 50,
            interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8002".into(),
            api_key: None,
            webhook_secret: None,
            webhook_tolerance_secs: 300,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VIPER_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_file(Path::new(&path)).await;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

async fn load_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        info!("[config] no {}, using defaults", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    parse_config(&txt)
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[config] invalid config: {e}");
        KernelConfig::default()
    })
}

/// Premier nom défini et non vide parmi `keys`.
fn first_set(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

pub fn apply_env_overrides(cfg: &mut KernelConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = first_set(&lookup, &["VIPER_DATASTORE_URL", "SUPABASE_URL"]) {
        cfg.datastore.url = Some(url);
    }
    if let Some(key) = first_set(&lookup, &["VIPER_DATASTORE_KEY", "SUPABASE_KEY"]) {
        cfg.datastore.key = Some(key);
    }
    if let Some(source) = first_set(&lookup, &["VIPER_SOURCE_URL"]) {
        cfg.upstream.source_url = Some(source);
    } else if let Some(base) = first_set(&lookup, &["SPIDERFLOW_API_URL"]) {
        cfg.upstream.source_url = Some(format!(
            "{}/nodes/export?format=json",
            base.trim_end_matches('/')
        ));
    }
    if let Some(secret) = first_set(&lookup, &["VIPER_WEBHOOK_SECRET", "WEBHOOK_SECRET"]) {
        cfg.http.webhook_secret = Some(secret);
    }
    if let Some(api_key) = first_set(&lookup, &["VIPER_API_KEY"]) {
        cfg.http.api_key = Some(api_key);
    }
    if let Some(bind) = first_set(&lookup, &["VIPER_BIND"]) {
        cfg.http.bind = bind;
    }
    if let Some(raw) = first_set(&lookup, &["POLL_INTERVAL"]) {
        match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => cfg.sync.poll_interval_secs = secs,
            _ => warn!("[config] ignoring POLL_INTERVAL={raw:?}"),
        }
    }
}
