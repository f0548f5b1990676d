/**
 * STORES - Persistance des nœuds
 *
 * RÔLE :
 * - rest     : datastore distant (API REST style PostgREST, table `nodes`)
 * - snapshot : fichier JSON local, source de vérité de l'orchestrateur
 *
 * Le snapshot local est toujours écrit ; le datastore est optionnel et
 * reçoit les upserts par lots après chaque cycle de sync.
 */

pub mod rest;
pub mod snapshot;

use serde_json::Value;
use std::collections::BTreeMap;

pub use rest::{NodeUpsert, RestStore, StatusPatch, UpsertReport};
pub use snapshot::{Snapshot, SnapshotStore, SyncMetadata};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("datastore returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datastore not configured")]
    NotConfigured,
}

/// Requête de lecture : filtres d'égalité, pagination et tri.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    /// Colonnes à renvoyer (défaut `*`).
    pub select: Option<String>,
    /// Filtres d'égalité colonne → valeur.
    pub filters: BTreeMap<String, Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Syntaxe PostgREST, ex: `last_health_check.asc.nullsfirst`.
    pub order_by: Option<String>,
}

impl StoreQuery {
    pub fn filter(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.insert(column.to_string(), value.into());
        self
    }

    /// Paramètres d'URL dans l'ordre attendu par le datastore.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            self.select.clone().unwrap_or_else(|| "*".to_string()),
        )];
        for (column, value) in &self.filters {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push((column.clone(), format!("eq.{rendered}")));
        }
        if let Some(order) = &self.order_by {
            params.push(("order".into(), order.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".into(), offset.to_string()));
        }
        params
    }
}
