/**
 * RECONCILE - Déduplication et fusion avec l'état local
 *
 * RÔLE : réduit un lot à un nœud par clé d'identité, puis fusionne le lot
 * distant avec l'ensemble local connu.
 *
 * RÈGLES DE FUSION (merge_records) :
 * - Override : attributs descriptifs et mesures, le plus récent gagne s'il est présent
 * - Preserve-only : first_seen_at (le plus ancien gagne)
 * - Engine-owned : offline_status reste vrai tant qu'une vérification ne l'a pas levé
 * - Recalculés ailleurs : age_days, needs_verification, should_delete, is_stale
 */

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::identity::identity_key;
use crate::models::Node;

/// Fusion typée de deux observations d'un même nœud.
pub fn merge_records(older: &Node, newer: &Node) -> Node {
    let mut extra = older.extra.clone();
    extra.extend(newer.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    Node {
        id: newer.id.clone().or_else(|| older.id.clone()),
        protocol: newer.protocol.clone(),
        host: newer.host.clone(),
        port: newer.port,
        name: newer.name.clone().or_else(|| older.name.clone()),
        country: newer.country.clone().or_else(|| older.country.clone()),
        link: newer.link.clone().or_else(|| older.link.clone()),
        is_free: newer.is_free.or(older.is_free),
        latency_ms: newer.latency_ms.or(older.latency_ms),
        speed: newer.speed.or(older.speed),
        quality_score: newer.quality_score.or(older.quality_score),
        success_rate: newer.success_rate.or(older.success_rate),
        first_seen_at: older.first_seen_at.clone().or_else(|| newer.first_seen_at.clone()),
        last_updated_at: newer.last_updated_at.clone().or_else(|| older.last_updated_at.clone()),
        age_days: older.age_days,
        needs_verification: newer.needs_verification,
        offline_status: older.offline_status || newer.offline_status,
        verification_failed_at: older
            .verification_failed_at
            .clone()
            .or_else(|| newer.verification_failed_at.clone()),
        last_verified_at: newer.last_verified_at.clone().or_else(|| older.last_verified_at.clone()),
        is_stale: newer.is_stale,
        should_delete: false,
        status: newer.status.or(older.status),
        last_health_check: newer
            .last_health_check
            .clone()
            .or_else(|| older.last_health_check.clone()),
        health_latency: newer.health_latency.or(older.health_latency),
        extra,
    }
}

/// Un nœud par clé, ordre de première apparition conservé.
///
/// Les doublons sont fusionnés (la dernière occurrence gagne sur les champs
/// override). Les nœuds sans clé sont écartés avec un warning.
pub fn deduplicate(nodes: Vec<Node>, now: &str) -> Vec<Node> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Node> = Vec::with_capacity(nodes.len());

    for mut node in nodes {
        let Some(key) = identity_key(&node) else {
            warn!("[reconcile] skipping node without identity ({}:{})", node.host, node.port);
            continue;
        };
        match positions.get(&key) {
            Some(&index) => {
                let mut merged = merge_records(&unique[index], &node);
                merged.last_updated_at = Some(now.to_string());
                unique[index] = merged;
            }
            None => {
                if node.first_seen_at.is_none() {
                    node.first_seen_at = Some(now.to_string());
                }
                node.last_updated_at = Some(now.to_string());
                positions.insert(key, unique.len());
                unique.push(node);
            }
        }
    }
    unique
}

/// Fusionne le lot distant avec l'état local.
///
/// Le distant gagne sur les clés communes (first_seen_at local préservé) ; les
/// nœuds locaux absents du distant restent, marqués `is_stale`. Sortie : ordre
/// local, puis nouveaux nœuds distants.
pub fn merge_with_existing(remote: Vec<Node>, local: Vec<Node>, now: &str) -> Vec<Node> {
    let remote = deduplicate(remote, now);
    if local.is_empty() {
        return remote;
    }

    let mut remote_by_key: HashMap<String, Node> = HashMap::with_capacity(remote.len());
    let mut remote_order: Vec<String> = Vec::with_capacity(remote.len());
    for node in remote {
        if let Some(key) = identity_key(&node) {
            remote_order.push(key.clone());
            remote_by_key.insert(key, node);
        }
    }

    let mut merged = Vec::with_capacity(local.len() + remote_by_key.len());
    let mut seen_local: HashSet<String> = HashSet::new();
    for local_node in local {
        let Some(key) = identity_key(&local_node) else {
            warn!(
                "[reconcile] dropping local node without identity ({}:{})",
                local_node.host, local_node.port
            );
            continue;
        };
        if !seen_local.insert(key.clone()) {
            continue;
        }
        match remote_by_key.remove(&key) {
            Some(remote_node) => {
                let mut node = merge_records(&local_node, &remote_node);
                node.is_stale = false;
                node.last_updated_at = Some(now.to_string());
                merged.push(node);
            }
            None => {
                let mut node = local_node;
                node.is_stale = true;
                merged.push(node);
            }
        }
    }

    for key in remote_order {
        if let Some(mut node) = remote_by_key.remove(&key) {
            node.is_stale = false;
            merged.push(node);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthStatus;
    use serde_json::json;

    const NOW: &str = "2024-06-10T12:00:00Z";

    fn node(host: &str, port: u16) -> Node {
        Node::new("vmess", host, port)
    }

    #[test]
    fn test_deduplicate_collapses_case_variants() {
        let mut first = node("A.example", 443);
        first.latency_ms = Some(100);
        first.name = Some("first".into());
        let mut second = node("a.example", 443);
        second.latency_ms = Some(80);

        let out = deduplicate(vec![first, node("b.example", 443), second], NOW);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].latency_ms, Some(80));
        assert_eq!(out[0].name.as_deref(), Some("first"));
        assert_eq!(out[0].first_seen_at.as_deref(), Some(NOW));
        assert_eq!(out[1].host, "b.example");
    }

    #[test]
    fn test_deduplicate_keeps_existing_first_seen() {
        let mut seen_before = node("a", 1);
        seen_before.first_seen_at = Some("2024-01-01T00:00:00Z".into());
        let out = deduplicate(vec![seen_before], NOW);
        assert_eq!(out[0].first_seen_at.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(out[0].last_updated_at.as_deref(), Some(NOW));
    }

    #[test]
    fn test_deduplicate_skips_keyless_nodes() {
        let out = deduplicate(vec![node("", 443), node("a", 0), node("a", 1)], NOW);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let mut first = node("A.example", 443);
        first.name = Some("JP-01".into());
        first.country = Some("JP".into());
        first.link = Some("vmess://old@a.example:443".into());
        first.latency_ms = Some(140);
        first.extra.insert("remark".into(), json!("tokyo"));
        let mut second = node("a.example", 443);
        second.link = Some("vmess://new@a.example:443".into());
        second.speed = Some(12.5);
        second.status = Some(HealthStatus::Online);
        second.health_latency = Some(90);
        let mut other = node("b.example", 8443);
        other.is_free = Some(true);
        other.first_seen_at = Some("2024-05-01T00:00:00Z".into());
        other.quality_score = Some(0.8);

        let blank = |nodes: Vec<Node>| -> Vec<Node> {
            nodes
                .into_iter()
                .map(|mut n| {
                    n.last_updated_at = None;
                    n
                })
                .collect()
        };
        let once = deduplicate(vec![first, other, second], NOW);
        let twice = deduplicate(once.clone(), "2024-06-11T00:00:00Z");

        assert_eq!(once.len(), 2);
        assert_eq!(once[0].link.as_deref(), Some("vmess://new@a.example:443"));
        assert_eq!(blank(twice), blank(once));
    }

    #[test]
    fn test_merge_preserves_first_seen_and_marks_stale() {
        let mut local_a = node("a", 1);
        local_a.first_seen_at = Some("2024-06-01T00:00:00Z".into());
        local_a.latency_ms = Some(300);
        let mut local_b = node("b", 2);
        local_b.first_seen_at = Some("2024-06-02T00:00:00Z".into());

        let mut remote_a = node("a", 1);
        remote_a.latency_ms = Some(120);

        let merged = merge_with_existing(vec![remote_a], vec![local_a, local_b], NOW);
        assert_eq!(merged.len(), 2);

        let a = &merged[0];
        assert_eq!(a.first_seen_at.as_deref(), Some("2024-06-01T00:00:00Z"));
        assert_eq!(a.latency_ms, Some(120));
        assert!(!a.is_stale);

        let b = &merged[1];
        assert!(b.is_stale);
        assert_eq!(b.first_seen_at.as_deref(), Some("2024-06-02T00:00:00Z"));
    }

    #[test]
    fn test_merge_with_empty_local_is_dedup() {
        let remote = vec![node("a", 1), node("a", 1), node("c", 3)];
        let merged = merge_with_existing(remote, vec![], NOW);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|n| !n.is_stale));
        assert!(merged.iter().all(|n| n.first_seen_at.as_deref() == Some(NOW)));
    }

    #[test]
    fn test_merge_appends_new_remote_nodes() {
        let local = vec![node("a", 1)];
        let merged = merge_with_existing(vec![node("z", 9), node("a", 1)], local, NOW);
        let hosts: Vec<_> = merged.iter().map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "z"]);
        assert_eq!(merged[1].first_seen_at.as_deref(), Some(NOW));
    }

    #[test]
    fn test_merge_records_field_categories() {
        let mut older = node("a", 1);
        older.offline_status = true;
        older.verification_failed_at = Some("2024-06-01T00:00:00Z".into());
        older.status = Some(HealthStatus::Offline);
        older.country = Some("JP".into());
        older.extra.insert("mainland_score".into(), json!(50));

        let mut newer = node("a", 1);
        newer.speed = Some(3.5);
        newer.extra.insert("mainland_score".into(), json!(70));

        let merged = merge_records(&older, &newer);
        assert!(merged.offline_status);
        assert_eq!(merged.verification_failed_at.as_deref(), Some("2024-06-01T00:00:00Z"));
        assert_eq!(merged.country.as_deref(), Some("JP"));
        assert_eq!(merged.speed, Some(3.5));
        assert_eq!(merged.status, Some(HealthStatus::Offline));
        assert_eq!(merged.extra["mainland_score"], json!(70));
    }
}
