/**
 * LIFECYCLE - Âge, TTL de re-vérification et éviction des nœuds
 *
 * RÔLE : calcule l'âge d'un nœud depuis first_seen_at, décide s'il doit être
 * re-vérifié, et retire ceux qui sont offline depuis trop longtemps.
 *
 * FONCTIONNEMENT :
 * - Horodatages stockés en chaînes RFC3339, parsés à la demande
 * - Un horodatage illisible ne fait jamais échouer un cycle (âge 0, pas d'éviction)
 * - Toutes les fonctions prennent `now` explicitement
 */

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

use crate::models::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub ttl_days: i64,
    pub max_offline_days: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self { ttl_days: 3, max_offline_days: 7 }
    }
}

#[derive(Debug, Default)]
pub struct LifecycleOutcome {
    pub kept: Vec<Node>,
    pub evicted: Vec<Node>,
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

/// RFC3339 ("Z" ou offset), sinon forme naïve `YYYY-MM-DDTHH:MM:SS[.fff]` lue en UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let naive_t = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    let naive_space = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(raw, naive_t)
        .or_else(|_| PrimitiveDateTime::parse(raw, naive_space))
        .map(PrimitiveDateTime::assume_utc)
        .ok()
}

/// Jours entiers écoulés depuis first_seen_at, jamais négatif.
pub fn node_age_days(node: &Node, now: OffsetDateTime) -> i64 {
    let Some(raw) = node.first_seen_at.as_deref() else {
        return 0;
    };
    match parse_timestamp(raw) {
        Some(first_seen) => (now - first_seen).whole_days().max(0),
        None => {
            debug!("[lifecycle] unreadable first_seen_at {:?}, age 0", raw);
            0
        }
    }
}

/// Recalcule age_days et needs_verification.
pub fn tag_for_verification(mut node: Node, ttl_days: i64, now: OffsetDateTime) -> Node {
    node.age_days = node_age_days(&node, now);
    node.needs_verification =
        node.age_days >= ttl_days || node.last_verified_at.is_none() || node.offline_status;
    node
}

fn offline_too_long(node: &Node, max_offline_days: i64, now: OffsetDateTime) -> bool {
    if !node.offline_status {
        return false;
    }
    node.verification_failed_at
        .as_deref()
        .and_then(parse_timestamp)
        .map(|failed_at| (now - failed_at).whole_days() > max_offline_days)
        .unwrap_or(false)
}

/// Étiquette chaque nœud puis sépare ceux à garder de ceux à évincer.
///
/// `kept` est le nouvel ensemble ; un nœud évincé n'y figure jamais et sort
/// dans `evicted` avec `should_delete`.
pub fn apply_lifecycle(
    nodes: Vec<Node>,
    policy: &LifecyclePolicy,
    now: OffsetDateTime,
) -> LifecycleOutcome {
    let mut outcome = LifecycleOutcome::default();
    for node in nodes {
        let mut node = tag_for_verification(node, policy.ttl_days, now);
        if offline_too_long(&node, policy.max_offline_days, now) {
            node.should_delete = true;
            outcome.evicted.push(node);
        } else {
            node.should_delete = false;
            outcome.kept.push(node);
        }
    }
    outcome
}

pub fn mark_verified(node: &mut Node, at: &str) {
    node.offline_status = false;
    node.verification_failed_at = None;
    node.last_verified_at = Some(at.to_string());
}

/// verification_failed_at n'est posé qu'au passage online → offline, pour que
/// la fenêtre d'éviction compte depuis le premier échec.
pub fn mark_offline(node: &mut Node, at: &str) {
    if !node.offline_status || node.verification_failed_at.is_none() {
        node.verification_failed_at = Some(at.to_string());
    }
    node.offline_status = true;
    node.last_verified_at = Some(at.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2024-06-10 12:00 UTC);

    fn seen(days_ago: i64) -> Node {
        Node {
            protocol: "vmess".into(),
            host: "h".into(),
            port: 443,
            first_seen_at: Some(format_timestamp(NOW - Duration::days(days_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2024-06-10T12:00:00Z"), Some(NOW));
        assert_eq!(parse_timestamp("2024-06-10T14:00:00+02:00"), Some(NOW));
        assert_eq!(parse_timestamp("2024-06-10T12:00:00"), Some(NOW));
        assert_eq!(
            parse_timestamp("2024-06-10T12:00:00.123456").map(|t| t.date()),
            Some(NOW.date())
        );
        assert_eq!(parse_timestamp("2024-06-10 12:00:00"), Some(NOW));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_node_age_days() {
        assert_eq!(node_age_days(&seen(5), NOW), 5);
        assert_eq!(node_age_days(&seen(-2), NOW), 0);

        let mut garbled = seen(0);
        garbled.first_seen_at = Some("not a date".into());
        assert_eq!(node_age_days(&garbled, NOW), 0);

        let mut missing = seen(0);
        missing.first_seen_at = None;
        assert_eq!(node_age_days(&missing, NOW), 0);

        let mut partial = seen(0);
        partial.first_seen_at = Some(format_timestamp(NOW - Duration::hours(47)));
        assert_eq!(node_age_days(&partial, NOW), 1);
    }

    #[test]
    fn test_tag_for_verification() {
        let mut verified_recently = seen(1);
        verified_recently.last_verified_at = Some(format_timestamp(NOW));
        assert!(!tag_for_verification(verified_recently.clone(), 3, NOW).needs_verification);

        let mut old = seen(4);
        old.last_verified_at = Some(format_timestamp(NOW));
        let tagged = tag_for_verification(old, 3, NOW);
        assert_eq!(tagged.age_days, 4);
        assert!(tagged.needs_verification);

        assert!(tag_for_verification(seen(0), 3, NOW).needs_verification);

        let mut offline = verified_recently;
        offline.offline_status = true;
        assert!(tag_for_verification(offline, 3, NOW).needs_verification);
    }

    #[test]
    fn test_lifecycle_evicts_long_offline_only() {
        let policy = LifecyclePolicy::default();

        let mut gone = seen(30);
        gone.host = "gone".into();
        gone.offline_status = true;
        gone.verification_failed_at = Some(format_timestamp(NOW - Duration::days(8)));

        let mut recent = seen(30);
        recent.host = "recent".into();
        recent.offline_status = true;
        recent.verification_failed_at = Some(format_timestamp(NOW - Duration::days(7)));

        let mut unreadable = seen(30);
        unreadable.host = "unreadable".into();
        unreadable.offline_status = true;
        unreadable.verification_failed_at = Some("??".into());

        let mut online = seen(30);
        online.host = "online".into();
        online.verification_failed_at = Some(format_timestamp(NOW - Duration::days(20)));

        let outcome = apply_lifecycle(vec![gone, recent, unreadable, online], &policy, NOW);
        let kept: Vec<_> = outcome.kept.iter().map(|n| n.host.as_str()).collect();
        assert_eq!(kept, vec!["recent", "unreadable", "online"]);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].host, "gone");
        assert!(outcome.kept.iter().all(|n| !n.should_delete));
    }

    #[test]
    fn test_apply_lifecycle_drops_evicted_and_tags_old() {
        let policy = LifecyclePolicy { ttl_days: 7, max_offline_days: 7 };

        let mut fresh = seen(2);
        fresh.last_verified_at = Some(format_timestamp(NOW - Duration::days(1)));
        let mut old = seen(9);
        old.host = "old".into();
        old.last_verified_at = fresh.last_verified_at.clone();
        let mut gone = seen(30);
        gone.host = "gone".into();
        gone.offline_status = true;
        gone.verification_failed_at = Some(format_timestamp(NOW - Duration::days(10)));

        let kept = apply_lifecycle(vec![fresh, old, gone], &policy, NOW).kept;
        assert_eq!(kept.len(), 2);
        assert!(!kept[0].needs_verification);
        assert_eq!(kept[1].host, "old");
        assert!(kept[1].needs_verification);
    }

    #[test]
    fn test_mark_offline_keeps_first_failure() {
        let mut node = seen(10);
        mark_offline(&mut node, "2024-06-01T00:00:00Z");
        mark_offline(&mut node, "2024-06-05T00:00:00Z");
        assert!(node.offline_status);
        assert_eq!(node.verification_failed_at.as_deref(), Some("2024-06-01T00:00:00Z"));
        assert_eq!(node.last_verified_at.as_deref(), Some("2024-06-05T00:00:00Z"));

        mark_verified(&mut node, "2024-06-06T00:00:00Z");
        assert!(!node.offline_status);
        assert_eq!(node.verification_failed_at, None);
    }
}
