//! Router - constrained selection over one domain's policy
//!
//! The router combines:
//! - Candidate filtering by allowed set and cost ceiling
//! - A global kill switch that bypasses the policy entirely
//! - Graceful fallbacks so callers always get a usable arm
//! - Reward normalization from raw outcome signals
//! - A low-entropy guard for policies that do not monitor themselves

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::types::{Constraints, OutcomeSignals, RewardWeights, RoutingDecision, RoutingReason};
use crate::bandit::{Arm, BanditPolicy, Context, EntropyGuard};
use crate::config::{ConfigSource, EnvConfig, keys};
use crate::error::{Error, Result};
use crate::metrics::{self, SharedMetrics};

/// Router over a single domain's policy
#[derive(Debug)]
pub struct Router {
    domain: String,
    policy: Arc<dyn BanditPolicy>,
    config: Arc<dyn ConfigSource>,
    metrics: SharedMetrics,
    /// Fixed weights; `None` reads them from config on every update
    weights: Option<RewardWeights>,
    guard: EntropyGuard,
}

impl Router {
    /// Router reading live knobs from `SWITCHYARD_*` environment variables
    pub fn new(domain: impl Into<String>, policy: Arc<dyn BanditPolicy>) -> Self {
        let config: Arc<dyn ConfigSource> = Arc::new(EnvConfig::default());
        Self {
            domain: domain.into(),
            policy,
            guard: EntropyGuard::new(config.clone()),
            config,
            metrics: metrics::noop(),
            weights: None,
        }
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.guard = EntropyGuard::new(config.clone());
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Pin reward weights instead of reading them live
    pub fn with_reward_weights(mut self, weights: RewardWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn policy(&self) -> &Arc<dyn BanditPolicy> {
        &self.policy
    }

    fn bandit_enabled(&self) -> bool {
        self.config.get_bool(keys::BANDIT_ENABLED).unwrap_or(true)
    }

    fn cost_ceiling(&self, constraints: &Constraints) -> Option<f64> {
        constraints
            .max_cost_usd
            .or_else(|| self.config.get_f64(keys::COST_CEILING_USD))
    }

    fn decide(
        &self,
        arm: Arm,
        reason: RoutingReason,
        candidates: Vec<Arm>,
    ) -> RoutingDecision {
        let labels = [("domain", self.domain.as_str()), ("arm", arm.as_str())];
        self.metrics.increment("router.selections", &labels, 1);
        if reason.is_fallback() {
            self.metrics.increment(
                "router.fallbacks",
                &[("domain", self.domain.as_str()), ("reason", reason.as_str())],
                1,
            );
        }

        let expected_value = self.policy.expected_values().get(&arm).copied();
        debug!(
            domain = %self.domain,
            arm = %arm,
            reason = %reason,
            candidates = candidates.len(),
            "Routed"
        );
        RoutingDecision {
            arm,
            reason,
            candidates,
            expected_value,
        }
    }

    /// Pick one arm. Only an empty `arms` list is an error; every other
    /// failure degrades to a deterministic fallback.
    pub fn select(
        &self,
        arms: &[Arm],
        context: Option<&Context>,
        constraints: &Constraints,
    ) -> Result<RoutingDecision> {
        let Some(first) = arms.first() else {
            return Err(Error::InvalidArgument("arm set is empty".to_string()));
        };

        let candidates = constraints.filter(arms, self.cost_ceiling(constraints));

        if !self.bandit_enabled() {
            let arm = candidates.first().unwrap_or(first).clone();
            return Ok(self.decide(arm, RoutingReason::KillSwitch, candidates));
        }

        let Some(head) = candidates.first().cloned() else {
            warn!(
                domain = %self.domain,
                arms = arms.len(),
                "Constraints removed every candidate, using first arm"
            );
            return Ok(self.decide(
                first.clone(),
                RoutingReason::FallbackConstraintsEmpty,
                candidates,
            ));
        };

        if candidates.len() == 1 {
            return Ok(self.decide(head, RoutingReason::SingleCandidate, candidates));
        }

        let arm = match self.policy.recommend(&candidates, context) {
            Ok(arm) if candidates.contains(&arm) => arm,
            Ok(arm) => {
                warn!(domain = %self.domain, arm = %arm, "Policy returned an arm outside the candidates");
                return Ok(self.decide(head, RoutingReason::FallbackPolicyError, candidates));
            }
            Err(e) => {
                warn!(
                    domain = %self.domain,
                    error = %e,
                    code = e.code(),
                    "Policy failed, using first candidate"
                );
                return Ok(self.decide(head, RoutingReason::FallbackPolicyError, candidates));
            }
        };

        if !self.policy.monitors_entropy() {
            self.observe_selection(&arm, candidates.len());
        }

        Ok(self.decide(arm, RoutingReason::Policy, candidates))
    }

    fn observe_selection(&self, arm: &str, candidates: usize) {
        let known = self.policy.expected_values().len().max(candidates);
        if let Some(entropy) = self.guard.observe(arm, known) {
            info!(
                domain = %self.domain,
                entropy = entropy,
                kind = %self.policy.kind(),
                "Selection entropy collapsed, resetting policy to prior"
            );
            self.policy.reset_to_prior();
            let kind = self.policy.kind().to_string();
            self.metrics
                .increment("bandit.resets", &[("policy", kind.as_str())], 1);
        }
    }

    /// Convert raw signals into a reward, feed it to the policy, return it
    pub fn update(
        &self,
        arm: &str,
        outcome: &OutcomeSignals,
        context: Option<&Context>,
    ) -> Result<f64> {
        let weights = match &self.weights {
            Some(w) => w.clone(),
            None => RewardWeights::from_config(self.config.as_ref()),
        };
        let reward = weights.normalize(outcome);

        self.policy.update(arm, reward, context)?;
        self.metrics.observe(
            "router.reward",
            &[("domain", self.domain.as_str()), ("arm", arm)],
            reward,
        );

        debug!(
            domain = %self.domain,
            arm = %arm,
            success = outcome.success,
            reward = reward,
            "Recorded routing outcome"
        );
        Ok(reward)
    }
}
