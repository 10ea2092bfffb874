//! Thompson Sampling over Beta-Bernoulli arms
//!
//! Each arm keeps a Beta(α, β) posterior over its success probability.
//!
//! ## Algorithm Overview
//!
//! 1. For each candidate, sample θ ~ Beta(α, β)
//! 2. Select the candidate with the highest sample
//! 3. Observe reward r ∈ [0, 1] and update: α += r, β += (1 - r)
//!
//! Two live-configured safeguards sit on top. The exploration overlay reads
//! `bandit.min_explore_rate` on every call and, with that probability, picks
//! uniformly among the non-argmax candidates. The low-entropy reset watches
//! the last `bandit.reset_window` updated arms and returns every arm to its
//! prior plus last observation once the window's normalized entropy falls
//! under `bandit.reset_entropy_threshold`.

use rand::prelude::*;
use rand_distr::{Beta, Distribution};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::warn;

use super::{
    Arm, ArmTable, BanditPolicy, BetaArmState, Context, EntropyGuard, PolicyKind, PolicySnapshot,
    ensure_arms, normalize_reward,
};
use crate::config::{ConfigSource, keys};
use crate::error::{Error, Result};
use crate::metrics::{self, SharedMetrics};

/// Thompson Sampling bandit
#[derive(Debug)]
pub struct ThompsonSampling {
    prior_alpha: f64,
    prior_beta: f64,
    state: RwLock<ArmTable<BetaArmState>>,
    rng: Mutex<StdRng>,
    config: Arc<dyn ConfigSource>,
    guard: EntropyGuard,
    metrics: SharedMetrics,
}

impl ThompsonSampling {
    /// Uniform Beta(1, 1) prior
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            state: RwLock::new(ArmTable::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            guard: EntropyGuard::new(config.clone()),
            config,
            metrics: metrics::noop(),
        }
    }

    /// Fixed seed for reproducible tests
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn with_prior(mut self, alpha: f64, beta: f64) -> Result<Self> {
        if !(alpha > 0.0 && beta > 0.0) || !alpha.is_finite() || !beta.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "Beta prior must be positive, got ({}, {})",
                alpha, beta
            )));
        }
        self.prior_alpha = alpha;
        self.prior_beta = beta;
        Ok(self)
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn prior_state(&self, arm: &str) -> BetaArmState {
        BetaArmState {
            arm: arm.to_string(),
            alpha: self.prior_alpha,
            beta: self.prior_beta,
            count: 0,
            last_reward: None,
        }
    }

    /// Posterior for one arm, if it has been seen
    pub fn arm_state(&self, arm: &str) -> Option<BetaArmState> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table.get(arm).cloned()
    }

    fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
        if alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }

        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => 0.5,
        }
    }

    fn explore_rate(&self) -> f64 {
        self.config
            .get_f64(keys::MIN_EXPLORE_RATE)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

impl BanditPolicy for ThompsonSampling {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Thompson
    }

    fn recommend(&self, arms: &[Arm], _context: Option<&Context>) -> Result<Arm> {
        ensure_arms(arms)?;
        if arms.len() == 1 {
            return Ok(arms[0].clone());
        }

        let explore_rate = self.explore_rate();
        let params: Vec<(f64, f64)> = {
            let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
            arms.iter()
                .map(|arm| {
                    table
                        .get(arm)
                        .map(|s| (s.alpha, s.beta))
                        .unwrap_or((self.prior_alpha, self.prior_beta))
                })
                .collect()
        };

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best = 0;
        let mut best_sample = f64::NEG_INFINITY;
        for (idx, (alpha, beta)) in params.iter().enumerate() {
            let sample = Self::sample_beta(&mut rng, *alpha, *beta);
            if sample > best_sample {
                best_sample = sample;
                best = idx;
            }
        }

        if explore_rate > 0.0 && rng.r#gen::<f64>() < explore_rate {
            // Uniform over the non-argmax candidates
            let mut pick = rng.gen_range(0..arms.len() - 1);
            if pick >= best {
                pick += 1;
            }
            return Ok(arms[pick].clone());
        }

        Ok(arms[best].clone())
    }

    fn update(&self, arm: &str, reward: f64, _context: Option<&Context>) -> Result<()> {
        let reward = normalize_reward(reward)?;

        let known_arms = {
            let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let stats = table.get_or_insert_with(arm, || self.prior_state(arm));
            stats.alpha += reward;
            stats.beta += 1.0 - reward;
            stats.count += 1;
            stats.last_reward = Some(reward);
            table.len()
        };

        if let Some(entropy) = self.guard.observe(arm, known_arms) {
            warn!(
                entropy = entropy,
                arms = known_arms,
                "Selection entropy collapsed, resetting Thompson posteriors to prior"
            );
            self.reset_to_prior();
            self.metrics
                .increment("bandit.resets", &[("policy", "thompson")], 1);
        }
        Ok(())
    }

    fn state_dict(&self) -> PolicySnapshot {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        PolicySnapshot::Thompson {
            prior_alpha: self.prior_alpha,
            prior_beta: self.prior_beta,
            arms: table.iter().map(|(_, s)| s.clone()).collect(),
        }
    }

    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()> {
        snapshot.expect_kind(self.kind())?;
        snapshot.validate()?;
        if let PolicySnapshot::Thompson { arms, .. } = snapshot {
            let loaded = ArmTable::from_ordered(arms.into_iter().map(|s| (s.arm.clone(), s)));
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = loaded;
            self.guard.clear();
        }
        Ok(())
    }

    fn reset_to_prior(&self) {
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for stats in table.values_mut() {
            let last = stats.last_reward.unwrap_or(0.0);
            let seen = stats.last_reward.is_some();
            stats.alpha = self.prior_alpha + if seen { last } else { 0.0 };
            stats.beta = self.prior_beta + if seen { 1.0 - last } else { 0.0 };
            stats.count = stats.count.min(1);
        }
    }

    fn expected_values(&self) -> BTreeMap<Arm, f64> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .map(|(arm, s)| (arm.clone(), s.expected_value()))
            .collect()
    }

    fn monitors_entropy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::metrics::InMemoryMetrics;

    fn arms(names: &[&str]) -> Vec<Arm> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seeded(seed: u64) -> (ThompsonSampling, Arc<MemoryConfig>) {
        let cfg = Arc::new(MemoryConfig::new());
        (ThompsonSampling::new(cfg.clone()).with_seed(seed), cfg)
    }

    #[test]
    fn test_select_single_candidate() {
        let (bandit, _) = seeded(42);
        assert_eq!(bandit.recommend(&arms(&["only"]), None).unwrap(), "only");
    }

    #[test]
    fn test_untrained_explores_every_arm() {
        let (bandit, _) = seeded(42);
        let candidates = arms(&["a", "b", "c"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(bandit.recommend(&candidates, None).unwrap());
        }
        assert!(seen.len() >= 2, "Expected exploration of multiple arms");
    }

    #[test]
    fn test_update_adds_pseudo_counts() {
        let (bandit, _) = seeded(1);
        bandit.update("a", 0.9, None).unwrap();
        let stats = bandit.arm_state("a").unwrap();
        assert!((stats.alpha - 1.9).abs() < 1e-12);
        assert!((stats.beta - 1.1).abs() < 1e-12);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn test_recommend_does_not_mutate() {
        let (bandit, _) = seeded(3);
        bandit.update("a", 1.0, None).unwrap();
        let before = bandit.state_dict();
        for _ in 0..20 {
            bandit.recommend(&arms(&["a", "b"]), None).unwrap();
        }
        assert_eq!(bandit.state_dict(), before);
    }

    #[test]
    fn test_trained_prefers_fast_over_slow() {
        let (bandit, _) = seeded(42);
        let candidates = arms(&["slow", "fast"]);
        for _ in 0..40 {
            bandit.update("fast", 0.9, None).unwrap();
            bandit.update("slow", 0.1, None).unwrap();
        }

        let fast = (0..100)
            .filter(|_| bandit.recommend(&candidates, None).unwrap() == "fast")
            .count();
        assert!(fast > 60, "Expected fast in majority, got {} of 100", fast);
    }

    #[test]
    fn test_exploration_overlay_is_read_live() {
        let (bandit, cfg) = seeded(5);
        let candidates = arms(&["good", "bad"]);
        for _ in 0..200 {
            bandit.update("good", 1.0, None).unwrap();
            bandit.update("bad", 0.0, None).unwrap();
        }

        let bad_before = (0..200)
            .filter(|_| bandit.recommend(&candidates, None).unwrap() == "bad")
            .count();
        assert!(bad_before < 5, "Converged bandit should rarely pick bad, got {}", bad_before);

        cfg.set(keys::MIN_EXPLORE_RATE, 0.5);
        let bad_after = (0..200)
            .filter(|_| bandit.recommend(&candidates, None).unwrap() == "bad")
            .count();
        assert!(
            bad_after > 60,
            "Overlay should force non-argmax picks, got {} of 200",
            bad_after
        );
    }

    #[test]
    fn test_low_entropy_resets_to_prior_plus_last() {
        let cfg = Arc::new(
            MemoryConfig::new()
                .with(keys::RESET_WINDOW, 10)
                .with(keys::RESET_ENTROPY_THRESHOLD, 0.3),
        );
        let metrics = Arc::new(InMemoryMetrics::new());
        let bandit = ThompsonSampling::new(cfg)
            .with_seed(9)
            .with_metrics(metrics.clone());

        bandit.update("b", 0.2, None).unwrap();
        for _ in 0..10 {
            bandit.update("a", 1.0, None).unwrap();
        }

        let a = bandit.arm_state("a").unwrap();
        assert!((a.alpha - 2.0).abs() < 1e-12, "alpha was {}", a.alpha);
        assert!((a.beta - 1.0).abs() < 1e-12, "beta was {}", a.beta);
        let b = bandit.arm_state("b").unwrap();
        assert!((b.alpha - 1.2).abs() < 1e-12);
        assert_eq!(metrics.counter("bandit.resets", &[("policy", "thompson")]), 1);
    }

    #[test]
    fn test_round_trip_exact() {
        let (bandit, _) = seeded(1);
        bandit.update("a", 0.3, None).unwrap();
        bandit.update("b", 0.8, None).unwrap();
        let snapshot = bandit.state_dict();

        let (fresh, _) = seeded(1);
        fresh.load_state(snapshot.clone()).unwrap();
        assert_eq!(fresh.state_dict(), snapshot);

        // Same seed and same statistics give the same draws
        let (a, _) = seeded(77);
        let (b, _) = seeded(77);
        a.load_state(snapshot.clone()).unwrap();
        b.load_state(snapshot).unwrap();
        let candidates = arms(&["a", "b"]);
        for _ in 0..20 {
            assert_eq!(
                a.recommend(&candidates, None).unwrap(),
                b.recommend(&candidates, None).unwrap()
            );
        }
    }

    #[test]
    fn test_rejects_invalid_prior() {
        let (bandit, _) = seeded(1);
        assert!(bandit.with_prior(0.0, 1.0).is_err());
    }
}
