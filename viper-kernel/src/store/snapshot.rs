/**
 * SNAPSHOT - Cache local des nœuds vérifiés et de l'état de sync
 *
 * FONCTIONNEMENT :
 * - Un fichier JSON : { "nodes": [...], "sync": {...} }
 * - Écriture atomique (fichier temporaire puis rename) : un arrêt en pleine
 *   écriture laisse l'ancien snapshot intact
 * - Lecture tolérante : un nœud illisible est écarté, pas le fichier entier
 */

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};

use super::StoreError;
use crate::models::{parse_batch, Node};

/// Métadonnées du dernier cycle qui a modifié l'ensemble.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMetadata {
    pub total_count: usize,
    pub active_count: usize,
    pub stale_count: usize,
    pub evicted_count: usize,
    pub deduplicated: usize,
    pub rejected: usize,
    pub needs_verification: usize,
    pub remote_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub last_sync_hash: Option<String>,
    pub last_synced_at: Option<String>,
    pub last_synced_from: Option<String>,
    pub last_webhook_time: Option<String>,
    pub last_poll_time: Option<String>,
    pub last_verified_at: Option<String>,
    pub webhook_received_count: u64,
    pub poll_received_count: u64,
    pub metadata: SyncMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub sync: SyncState,
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fichier absent : snapshot vide.
    pub async fn load(&self) -> Result<Snapshot, StoreError> {
        if !self.path.exists() {
            info!("[snapshot] no snapshot at {:?}, starting empty", self.path);
            return Ok(Snapshot::default());
        }
        let raw = fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(Snapshot::default());
        }

        let value: Value = serde_json::from_str(&raw)?;
        let records = value
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let parsed = parse_batch(&records);
        if parsed.rejected > 0 {
            warn!("[snapshot] dropped {} unreadable nodes from {:?}", parsed.rejected, self.path);
        }

        let sync = match value.get("sync") {
            Some(sync) => serde_json::from_value(sync.clone()).unwrap_or_else(|e| {
                warn!("[snapshot] unreadable sync state, resetting: {}", e);
                SyncState::default()
            }),
            None => SyncState::default(),
        };

        info!("[snapshot] loaded {} nodes from {:?}", parsed.nodes.len(), self.path);
        Ok(Snapshot { nodes: parsed.nodes, sync })
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
