/**
 * IDENTITY - Clé d'identité et empreinte de contenu des nœuds
 *
 * RÔLE : deux nœuds sont "le même" ssi ils partagent protocol://host:port
 * (insensible à la casse). L'empreinte SHA-256 d'un ensemble de nœuds sert à
 * détecter un cycle de sync sans changement et à sauter l'écriture.
 */

use sha2::{Digest, Sha256};

use crate::models::Node;

/// `protocol://host:port` en minuscules, ou None si host vide / port nul.
pub fn identity_key(node: &Node) -> Option<String> {
    let host = node.host.trim().to_ascii_lowercase();
    if host.is_empty() || node.port == 0 {
        return None;
    }
    let protocol = node.protocol.trim().to_ascii_lowercase();
    let protocol = if protocol.is_empty() { "unknown" } else { protocol.as_str() };
    Some(format!("{}://{}:{}", protocol, host, node.port))
}

/// Empreinte hex indépendante de l'ordre d'entrée.
///
/// Chaque nœud contribue `identité|link|name|country|latency|speed|stale|offline` ;
/// les lignes sont triées par (link, ligne) avant d'être jointes par `\n`. Un lien
/// dont les identifiants changent, ou un nœud qui passe offline, change l'empreinte.
pub fn content_hash(nodes: &[Node]) -> String {
    let mut lines: Vec<(String, String)> = nodes
        .iter()
        .map(|node| (node.link.clone().unwrap_or_default(), summary_line(node)))
        .collect();
    lines.sort();

    let joined = lines
        .iter()
        .map(|(_, line)| line.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

fn summary_line(node: &Node) -> String {
    let identity = identity_key(node)
        .unwrap_or_else(|| format!("{}://{}:{}", node.protocol, node.host, node.port));
    let latency = node.latency_ms.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
    let speed = node.speed.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        identity,
        node.link.as_deref().unwrap_or(""),
        node.name.as_deref().unwrap_or(""),
        node.country.as_deref().unwrap_or(""),
        latency,
        speed,
        u8::from(node.is_stale),
        u8::from(node.offline_status),
    )
}
