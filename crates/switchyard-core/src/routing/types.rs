//! Types for constrained routing and reward normalization

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::bandit::Arm;
use crate::config::{ConfigSource, RewardConfig, keys};

/// Filters applied to the candidate list before the policy sees it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Drop arms whose known cost exceeds this ceiling
    pub max_cost_usd: Option<f64>,
    /// When set, only these arms are eligible
    pub allowed: Option<BTreeSet<Arm>>,
    /// Known per-call cost by arm; arms without an entry pass the ceiling
    pub arm_costs: HashMap<Arm, f64>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_cost(mut self, max_cost_usd: f64) -> Self {
        self.max_cost_usd = Some(max_cost_usd);
        self
    }

    pub fn with_allowed<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arm>,
    {
        self.allowed = Some(allowed.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cost(mut self, arm: impl Into<Arm>, cost_usd: f64) -> Self {
        self.arm_costs.insert(arm.into(), cost_usd);
        self
    }

    /// Arms that pass, in input order. `ceiling` is the effective cost limit.
    pub fn filter(&self, arms: &[Arm], ceiling: Option<f64>) -> Vec<Arm> {
        arms.iter()
            .filter(|arm| self.allowed.as_ref().is_none_or(|set| set.contains(*arm)))
            .filter(|arm| match (ceiling, self.arm_costs.get(*arm)) {
                (Some(limit), Some(cost)) => *cost <= limit,
                _ => true,
            })
            .cloned()
            .collect()
    }
}

/// Why the router returned the arm it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    /// The policy chose among the filtered candidates
    Policy,
    /// Only one candidate survived filtering
    SingleCandidate,
    /// Bandit routing is switched off; first candidate wins
    KillSwitch,
    /// Constraints removed every candidate; first original arm wins
    FallbackConstraintsEmpty,
    /// The policy failed; first filtered candidate wins
    FallbackPolicyError,
}

impl RoutingReason {
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Self::KillSwitch | Self::FallbackConstraintsEmpty | Self::FallbackPolicyError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::SingleCandidate => "single_candidate",
            Self::KillSwitch => "kill_switch",
            Self::FallbackConstraintsEmpty => "constraints_empty",
            Self::FallbackPolicyError => "policy_error",
        }
    }
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a routing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub arm: Arm,
    pub reason: RoutingReason,
    /// Candidates that survived filtering
    pub candidates: Vec<Arm>,
    /// Policy's point estimate for the chosen arm, when it has one
    pub expected_value: Option<f64>,
}

/// Raw outcome of executing a routed call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSignals {
    pub success: bool,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<f64>,
    /// Caller-supplied quality score in [0, 1]
    pub quality: Option<f64>,
}

impl OutcomeSignals {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Weights for collapsing [`OutcomeSignals`] into a reward in [0, 1]
///
/// ```text
/// success_term = 1 if success else 0
/// quality_term = quality, clamped to [0, 1]
/// cost_term    = 1 / (1 + cost_usd / cost_scale_usd)
/// latency_term = 1 / (1 + latency_ms / latency_scale_ms)
///
/// reward = Σ w_i · term_i / Σ w_i     over the terms that are present
/// ```
///
/// Absent signals drop out and the remaining weights are renormalized. If
/// every present weight is zero the reward is the success term alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub success: f64,
    pub quality: f64,
    pub cost: f64,
    pub latency: f64,
    pub cost_scale_usd: f64,
    pub latency_scale_ms: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        RewardConfig::default().into()
    }
}

impl From<RewardConfig> for RewardWeights {
    fn from(c: RewardConfig) -> Self {
        Self {
            success: c.weight_success,
            quality: c.weight_quality,
            cost: c.weight_cost,
            latency: c.weight_latency,
            cost_scale_usd: c.cost_scale_usd,
            latency_scale_ms: c.latency_scale_ms,
        }
    }
}

impl RewardWeights {
    /// Current weights from a live source, defaults for unset keys
    pub fn from_config(config: &dyn ConfigSource) -> Self {
        let d = Self::default();
        Self {
            success: config.get_f64(keys::WEIGHT_SUCCESS).unwrap_or(d.success),
            quality: config.get_f64(keys::WEIGHT_QUALITY).unwrap_or(d.quality),
            cost: config.get_f64(keys::WEIGHT_COST).unwrap_or(d.cost),
            latency: config.get_f64(keys::WEIGHT_LATENCY).unwrap_or(d.latency),
            cost_scale_usd: config
                .get_f64(keys::COST_SCALE_USD)
                .filter(|s| *s > 0.0)
                .unwrap_or(d.cost_scale_usd),
            latency_scale_ms: config
                .get_f64(keys::LATENCY_SCALE_MS)
                .filter(|s| *s > 0.0)
                .unwrap_or(d.latency_scale_ms),
        }
    }

    pub fn normalize(&self, outcome: &OutcomeSignals) -> f64 {
        let success_term = if outcome.success { 1.0 } else { 0.0 };

        let mut terms = vec![(self.success, success_term)];
        if let Some(q) = outcome.quality.filter(|q| q.is_finite()) {
            terms.push((self.quality, q.clamp(0.0, 1.0)));
        }
        if let Some(c) = outcome.cost_usd.filter(|c| c.is_finite()) {
            terms.push((self.cost, 1.0 / (1.0 + c.max(0.0) / self.cost_scale_usd)));
        }
        if let Some(l) = outcome.latency_ms.filter(|l| l.is_finite()) {
            terms.push((self.latency, 1.0 / (1.0 + l.max(0.0) / self.latency_scale_ms)));
        }

        let total: f64 = terms.iter().map(|(w, _)| w.max(0.0)).sum();
        if total <= 0.0 {
            return success_term;
        }
        let reward: f64 = terms.iter().map(|(w, t)| w.max(0.0) * t).sum::<f64>() / total;
        reward.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn arms(names: &[&str]) -> Vec<Arm> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_allowed_and_cost() {
        let constraints = Constraints::new()
            .with_allowed(["a", "b", "c"])
            .with_cost("a", 0.5)
            .with_cost("b", 0.01);
        let kept = constraints.filter(&arms(&["a", "b", "c", "d"]), Some(0.1));
        assert_eq!(kept, arms(&["b", "c"]));
    }

    #[test]
    fn test_filter_without_ceiling_keeps_costed_arms() {
        let constraints = Constraints::new().with_cost("a", 100.0);
        assert_eq!(constraints.filter(&arms(&["a"]), None), arms(&["a"]));
    }

    #[test]
    fn test_success_only_reward() {
        let w = RewardWeights::default();
        assert_eq!(w.normalize(&OutcomeSignals::success()), 1.0);
        assert_eq!(w.normalize(&OutcomeSignals::failure()), 0.0);
    }

    #[test]
    fn test_cheap_fast_beats_slow_expensive() {
        let w = RewardWeights::default();
        let cheap = OutcomeSignals::success().with_cost(0.001).with_latency(200.0);
        let pricey = OutcomeSignals::success().with_cost(0.5).with_latency(9000.0);
        let (a, b) = (w.normalize(&cheap), w.normalize(&pricey));
        assert!(a > b, "cheap {} should beat pricey {}", a, b);
        assert!((0.0..=1.0).contains(&a) && (0.0..=1.0).contains(&b));
    }

    #[test]
    fn test_renormalizes_over_present_terms() {
        let w = RewardWeights {
            success: 1.0,
            quality: 1.0,
            cost: 0.0,
            latency: 0.0,
            ..Default::default()
        };
        let r = w.normalize(&OutcomeSignals::failure().with_quality(0.6));
        assert!((r - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_fall_back_to_success() {
        let w = RewardWeights {
            success: 0.0,
            quality: 0.0,
            cost: 0.0,
            latency: 0.0,
            ..Default::default()
        };
        assert_eq!(w.normalize(&OutcomeSignals::success().with_quality(0.1)), 1.0);
    }

    #[test]
    fn test_weights_from_live_config() {
        let cfg = MemoryConfig::new()
            .with(keys::WEIGHT_SUCCESS, 2.0)
            .with(keys::COST_SCALE_USD, -1.0);
        let w = RewardWeights::from_config(&cfg);
        assert_eq!(w.success, 2.0);
        assert_eq!(w.cost_scale_usd, RewardWeights::default().cost_scale_usd);
    }
}
