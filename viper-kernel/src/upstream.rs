//! Client de la source upstream (export JSON des nœuds).
//!
//! Accepte un tableau JSON nu ou un objet `{ "nodes": [...], "last_updated": ... }`.
//! Les enregistrements restent bruts ici ; le parsing tolérant se fait à la réconciliation.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::UpstreamConf;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream source not configured")]
    NotConfigured,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamBatch {
    pub nodes: Vec<Value>,
    pub remote_timestamp: Option<String>,
}

pub fn parse_payload(value: Value) -> Result<UpstreamBatch, FetchError> {
    match value {
        Value::Array(nodes) => Ok(UpstreamBatch { nodes, remote_timestamp: None }),
        Value::Object(mut obj) => {
            let nodes = match obj.remove("nodes") {
                Some(Value::Array(nodes)) => nodes,
                Some(other) => {
                    return Err(FetchError::Payload(format!("`nodes` is {}", kind(&other))))
                }
                None => return Err(FetchError::Payload("missing `nodes`".into())),
            };
            let remote_timestamp = ["last_updated", "timestamp"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str).map(str::to_string));
            Ok(UpstreamBatch { nodes, remote_timestamp })
        }
        other => Err(FetchError::Payload(format!("top-level {}", kind(&other)))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    source_url: String,
    attempts: u32,
    retry_delay: Duration,
}

impl UpstreamClient {
    pub fn from_config(conf: &UpstreamConf) -> Result<Self, FetchError> {
        let source_url = conf.source_url.clone().ok_or(FetchError::NotConfigured)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            source_url,
            attempts: conf.fetch_attempts.max(1),
            retry_delay: Duration::from_millis(conf.retry_delay_ms),
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Jusqu'à `fetch_attempts` essais espacés de `retry_delay`.
    pub async fn fetch_nodes(&self) -> Result<UpstreamBatch, FetchError> {
        let mut attempt = 1;
        loop {
            match self.fetch_once().await {
                Ok(batch) => {
                    info!(
                        "[upstream] fetched {} records from {}",
                        batch.nodes.len(),
                        self.source_url
                    );
                    return Ok(batch);
                }
                Err(e) if attempt < self.attempts => {
                    warn!("[upstream] attempt {}/{} failed: {}", attempt, self.attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!("[upstream] giving up after {} attempts: {}", self.attempts, e);
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(&self) -> Result<UpstreamBatch, FetchError> {
        let response = self.client.get(&self.source_url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        parse_payload(response.json::<Value>().await?)
    }
}
