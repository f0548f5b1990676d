/**
 * SCORING - Estimation de vitesse et score de qualité
 *
 * RÔLE : transforme des échantillons de latence TCP en signaux de classement
 * (speed, quality_score, success_rate). La "vitesse" est une heuristique dérivée
 * de la latence, jamais une mesure de débit.
 *
 * FONCTIONNEMENT :
 * - speed = clamp(speed_reference_ms / médiane, min_speed, max_speed)
 * - quality = poids latence × bande + poids stabilité × (100 - pénalité jitter)
 *   + poids succès × taux de succès, borné à [0, 100]
 * - Toutes les constantes vivent dans ScoringPolicy (section `scoring` du YAML)
 */

use serde::{Deserialize, Serialize};

use crate::models::Node;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub max_speed: f64,
    pub min_speed: f64,
    pub speed_reference_ms: f64,
    pub latency_weight: f64,
    pub stability_weight: f64,
    pub success_weight: f64,
    /// Écart absolu médian (ms) qui coûte 100 points de stabilité.
    pub jitter_penalty_ms: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            max_speed: 50.0,
            min_speed: 0.5,
            speed_reference_ms: 1000.0,
            latency_weight: 0.6,
            stability_weight: 0.2,
            success_weight: 0.2,
            jitter_penalty_ms: 200.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyProfile {
    pub median_ms: Option<u32>,
    /// Écart absolu médian autour de la médiane.
    pub jitter_ms: f64,
    pub success_rate: f64,
    pub samples: usize,
}

pub fn median(samples: &[u32]) -> Option<u32> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some(((sorted[mid - 1] as u64 + sorted[mid] as u64 + 1) / 2) as u32)
    }
}

/// Profil d'une série d'essais ; `None` = essai échoué.
pub fn profile(samples: &[Option<u32>]) -> LatencyProfile {
    let ok: Vec<u32> = samples.iter().flatten().copied().collect();
    let median_ms = median(&ok);
    let jitter_ms = match median_ms {
        Some(m) => {
            let deviations: Vec<u32> = ok.iter().map(|v| v.abs_diff(m)).collect();
            median(&deviations).unwrap_or(0) as f64
        }
        None => 0.0,
    };
    let success_rate = if samples.is_empty() {
        0.0
    } else {
        ok.len() as f64 / samples.len() as f64
    };
    LatencyProfile { median_ms, jitter_ms, success_rate, samples: samples.len() }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl ScoringPolicy {
    pub fn estimate_speed(&self, median_ms: Option<u32>) -> Option<f64> {
        let median = median_ms?.max(1) as f64;
        let speed = (self.speed_reference_ms / median).clamp(self.min_speed, self.max_speed);
        Some(round_to(speed, 2))
    }

    /// Score 0-100 par bandes de latence.
    pub fn band_score(&self, latency_ms: u32) -> f64 {
        let l = latency_ms as f64;
        if l < 100.0 {
            100.0
        } else if l < 300.0 {
            100.0 - (l - 100.0) / 200.0 * 20.0
        } else if l < 500.0 {
            80.0 - (l - 300.0) / 200.0 * 20.0
        } else {
            (60.0 - (l - 500.0) / 500.0 * 20.0).max(40.0)
        }
    }

    pub fn quality_score(&self, profile: &LatencyProfile) -> f64 {
        let latency_part = profile.median_ms.map(|m| self.band_score(m)).unwrap_or(0.0);
        let stability = if profile.median_ms.is_some() && self.jitter_penalty_ms > 0.0 {
            (100.0 - profile.jitter_ms / self.jitter_penalty_ms * 100.0).max(0.0)
        } else {
            0.0
        };
        let score = self.latency_weight * latency_part
            + self.stability_weight * stability
            + self.success_weight * profile.success_rate * 100.0;
        round_to(score.clamp(0.0, 100.0), 1)
    }

    /// Applique les échantillons d'un cycle de vérification au nœud.
    pub fn apply(&self, node: &mut Node, samples: &[Option<u32>]) {
        let profile = profile(samples);
        if profile.median_ms.is_some() {
            node.latency_ms = profile.median_ms;
        }
        node.speed = self.estimate_speed(profile.median_ms);
        node.quality_score = Some(self.quality_score(&profile));
        node.success_rate = Some(round_to(profile.success_rate, 2));
    }
}

/// Plus faibles latences d'abord ; les nœuds jamais mesurés sont exclus.
pub fn top_by_latency(nodes: &[Node], limit: usize) -> Vec<&Node> {
    let mut measured: Vec<&Node> = nodes.iter().filter(|n| n.latency_ms.is_some()).collect();
    measured.sort_by_key(|n| n.latency_ms);
    measured.truncate(limit);
    measured
}

/// Plus grandes vitesses d'abord ; les nœuds sans estimation sont exclus.
pub fn top_by_speed(nodes: &[Node], limit: usize) -> Vec<&Node> {
    let mut rated: Vec<&Node> = nodes.iter().filter(|n| n.speed.is_some()).collect();
    rated.sort_by(|a, b| b.speed.unwrap_or(0.0).total_cmp(&a.speed.unwrap_or(0.0)));
    rated.truncate(limit);
    rated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[30, 10, 20]), Some(20));
        assert_eq!(median(&[10, 20]), Some(15));
        assert_eq!(median(&[10, 11]), Some(11));
    }

    #[test]
    fn test_estimate_speed_clamps() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.estimate_speed(None), None);
        assert_eq!(policy.estimate_speed(Some(0)), Some(50.0));
        assert_eq!(policy.estimate_speed(Some(10)), Some(50.0));
        assert_eq!(policy.estimate_speed(Some(200)), Some(5.0));
        assert_eq!(policy.estimate_speed(Some(5000)), Some(0.5));
    }

    #[test]
    fn test_band_score() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.band_score(50), 100.0);
        assert_eq!(policy.band_score(200), 90.0);
        assert_eq!(policy.band_score(300), 80.0);
        assert_eq!(policy.band_score(400), 70.0);
        assert_eq!(policy.band_score(1000), 40.0);
        assert_eq!(policy.band_score(5000), 40.0);
    }

    #[test]
    fn test_quality_score_stays_in_range() {
        let policy = ScoringPolicy::default();

        let perfect = profile(&[Some(40), Some(40), Some(40)]);
        assert_eq!(policy.quality_score(&perfect), 100.0);

        let dead = profile(&[None, None, None]);
        assert_eq!(dead.median_ms, None);
        assert_eq!(policy.quality_score(&dead), 0.0);

        let jittery = profile(&[Some(100), Some(900), None]);
        let score = policy.quality_score(&jittery);
        assert!(score > 0.0 && score < 100.0, "{score}");
    }

    #[test]
    fn test_apply_keeps_latency_when_all_samples_fail() {
        let policy = ScoringPolicy::default();
        let mut node = Node::new("vmess", "h", 1);
        node.latency_ms = Some(250);
        policy.apply(&mut node, &[None, None]);
        assert_eq!(node.latency_ms, Some(250));
        assert_eq!(node.speed, None);
        assert_eq!(node.success_rate, Some(0.0));
    }

    #[test]
    fn test_top_lists_exclude_unmeasured() {
        let mut fast = Node::new("vmess", "fast", 1);
        fast.latency_ms = Some(20);
        fast.speed = Some(50.0);
        let mut slow = Node::new("vmess", "slow", 1);
        slow.latency_ms = Some(800);
        slow.speed = Some(1.25);
        let unknown = Node::new("vmess", "unknown", 1);
        let nodes = vec![slow, unknown, fast];

        let by_latency: Vec<_> = top_by_latency(&nodes, 10)
            .iter()
            .map(|n| n.host.as_str())
            .collect();
        assert_eq!(by_latency, vec!["fast", "slow"]);

        let by_speed: Vec<_> = top_by_speed(&nodes, 1).iter().map(|n| n.host.as_str()).collect();
        assert_eq!(by_speed, vec!["fast"]);
    }
}
