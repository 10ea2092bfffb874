//! LinUCB with a diagonal design matrix
//!
//! Each arm keeps `A_diag` (ridge plus accumulated squared features) and `b`
//! (reward-weighted features). Memory and update cost are O(d) per arm.
//!
//! ```text
//! theta_i = b_i / A_i
//! score   = x · theta + alpha * sqrt(Σ x_i² / A_i)
//! ```
//!
//! The inverse diagonal and `theta` are cached and updated incrementally.
//! Every `stability_check_every` updates an arm's condition number
//! `max(A_diag) / min(A_diag)` is checked; above `max_condition` the caches
//! are rebuilt exactly from `A_diag` and `b`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{
    Arm, ArmTable, BanditPolicy, Context, LinArmState, PolicyKind, PolicySnapshot, ensure_arms,
    normalize_reward,
};
use crate::error::{Error, Result};
use crate::storage::snapshot_file;

/// LinUCB parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LinUcbConfig {
    /// Context length
    pub dimension: usize,
    /// Ridge prior added to every diagonal entry
    pub ridge: f64,
    /// Width of the confidence bonus
    pub alpha: f64,
    /// Updates between condition-number checks, per arm
    pub stability_check_every: u64,
    /// Condition number above which cached inverses are rebuilt
    pub max_condition: f64,
    /// Fixed order for named contexts
    pub feature_names: Option<Vec<String>>,
}

impl Default for LinUcbConfig {
    fn default() -> Self {
        Self {
            dimension: 3,
            ridge: 1.0,
            alpha: 1.0,
            stability_check_every: 100,
            max_condition: 1e6,
            feature_names: None,
        }
    }
}

impl LinUcbConfig {
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct LinArm {
    stats: LinArmState,
    a_inv: Vec<f64>,
    theta: Vec<f64>,
    since_check: u64,
}

impl LinArm {
    fn prior(arm: &str, dimension: usize, ridge: f64) -> Self {
        Self::from_stats(LinArmState {
            arm: arm.to_string(),
            a_diag: vec![ridge; dimension],
            b: vec![0.0; dimension],
            count: 0,
            last_context: None,
            last_reward: None,
        })
    }

    fn from_stats(stats: LinArmState) -> Self {
        let mut arm = Self {
            a_inv: Vec::new(),
            theta: Vec::new(),
            since_check: 0,
            stats,
        };
        arm.recompute();
        arm
    }

    fn recompute(&mut self) {
        self.a_inv = self.stats.a_diag.iter().map(|a| 1.0 / a).collect();
        self.theta = self
            .stats
            .b
            .iter()
            .zip(&self.a_inv)
            .map(|(b, inv)| b * inv)
            .collect();
        self.since_check = 0;
    }

    fn condition_number(&self) -> f64 {
        let (min, max) = self
            .stats
            .a_diag
            .iter()
            .fold((f64::INFINITY, 0.0f64), |(lo, hi), a| (lo.min(*a), hi.max(*a)));
        if min <= 0.0 { f64::INFINITY } else { max / min }
    }

    fn score(&self, x: &[f64], alpha: f64) -> f64 {
        let mean: f64 = x.iter().zip(&self.theta).map(|(xi, t)| xi * t).sum();
        let var: f64 = x
            .iter()
            .zip(&self.a_inv)
            .map(|(xi, inv)| xi * xi * inv)
            .sum::<f64>()
            .max(0.0);
        mean + alpha * var.sqrt()
    }

    fn observe(&mut self, x: &[f64], reward: f64) {
        for (i, &xi) in x.iter().enumerate() {
            self.stats.a_diag[i] += xi * xi;
            self.stats.b[i] += reward * xi;
            // Scalar Sherman-Morrison on the diagonal
            self.a_inv[i] /= 1.0 + self.a_inv[i] * xi * xi;
            self.theta[i] = self.a_inv[i] * self.stats.b[i];
        }
        self.stats.count += 1;
        self.stats.last_context = Some(x.to_vec());
        self.stats.last_reward = Some(reward);
        self.since_check += 1;
    }
}

/// Contextual UCB over a diagonal design matrix
#[derive(Debug)]
pub struct LinUcb {
    config: LinUcbConfig,
    state: RwLock<ArmTable<LinArm>>,
    path: Option<PathBuf>,
}

impl LinUcb {
    pub fn new(config: LinUcbConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::InvalidArgument(
                "LinUCB dimension must be positive".to_string(),
            ));
        }
        if !config.ridge.is_finite() || config.ridge <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "LinUCB ridge must be positive, got {}",
                config.ridge
            )));
        }
        if !config.alpha.is_finite() || config.alpha < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "LinUCB alpha must be non-negative, got {}",
                config.alpha
            )));
        }
        if let Some(names) = &config.feature_names {
            if names.len() != config.dimension {
                return Err(Error::DimensionMismatch {
                    expected: config.dimension,
                    found: names.len(),
                });
            }
        }
        Ok(Self {
            config,
            state: RwLock::new(ArmTable::default()),
            path: None,
        })
    }

    /// Build a policy bound to a snapshot file, loading it when present.
    ///
    /// A file written for a different dimension is rejected with
    /// [`Error::DimensionMismatch`].
    pub fn load_from(path: impl Into<PathBuf>, config: LinUcbConfig) -> Result<Self> {
        let path = path.into();
        let mut policy = Self::new(config)?;
        policy.restore(&path)?;
        policy.path = Some(path);
        Ok(policy)
    }

    pub fn config(&self) -> &LinUcbConfig {
        &self.config
    }

    /// Snapshot file this policy was opened with
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the current state to `path` atomically
    pub fn persist(&self, path: &Path) -> Result<()> {
        let snapshot = self.state_dict();
        snapshot_file::write_snapshot(path, &snapshot)
    }

    /// Write to the file this policy was opened with
    pub fn persist_default(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.persist(path),
            None => Err(Error::InvalidArgument(
                "LinUCB policy has no snapshot path".to_string(),
            )),
        }
    }

    /// Load state from `path`. Returns `false` when the file does not exist.
    pub fn restore(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            debug!(path = %path.display(), "No LinUCB snapshot on disk, starting fresh");
            return Ok(false);
        }
        let snapshot = snapshot_file::read_snapshot(path)?;
        self.load_state(snapshot)?;
        info!(
            path = %path.display(),
            dimension = self.config.dimension,
            "Restored LinUCB state"
        );
        Ok(true)
    }

    /// Per-arm `A_diag`
    pub fn design_diagonals(&self) -> BTreeMap<Arm, Vec<f64>> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .map(|(arm, s)| (arm.clone(), s.stats.a_diag.clone()))
            .collect()
    }

    fn context_vector(&self, context: Option<&Context>) -> Result<Vec<f64>> {
        match context {
            Some(ctx) => ctx.to_vector(self.config.dimension, self.config.feature_names.as_deref()),
            None => Ok(vec![0.0; self.config.dimension]),
        }
    }

    fn check_stability(&self, arm: &mut LinArm) {
        if self.config.stability_check_every == 0
            || arm.since_check < self.config.stability_check_every
        {
            return;
        }
        let condition = arm.condition_number();
        if condition > self.config.max_condition {
            warn!(
                arm = %arm.stats.arm,
                condition = condition,
                threshold = self.config.max_condition,
                "Design matrix ill-conditioned, recomputing cached inverse"
            );
            arm.recompute();
        } else {
            arm.since_check = 0;
        }
    }
}

impl BanditPolicy for LinUcb {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LinUcb
    }

    fn recommend(&self, arms: &[Arm], context: Option<&Context>) -> Result<Arm> {
        ensure_arms(arms)?;
        let x = self.context_vector(context)?;
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(unseen) = arms
            .iter()
            .find(|arm| table.get(arm).is_none_or(|s| s.stats.count == 0))
        {
            return Ok(unseen.clone());
        }

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, arm) in arms.iter().enumerate() {
            let score = table
                .get(arm)
                .map(|s| s.score(&x, self.config.alpha))
                .unwrap_or(f64::INFINITY);
            if score > best_score {
                best = idx;
                best_score = score;
            }
        }
        Ok(arms[best].clone())
    }

    fn update(&self, arm: &str, reward: f64, context: Option<&Context>) -> Result<()> {
        let reward = normalize_reward(reward)?;
        let x = self.context_vector(context)?;
        let (dimension, ridge) = (self.config.dimension, self.config.ridge);

        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get_or_insert_with(arm, || LinArm::prior(arm, dimension, ridge));
        entry.observe(&x, reward);
        self.check_stability(entry);
        Ok(())
    }

    fn state_dict(&self) -> PolicySnapshot {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        PolicySnapshot::LinUcb {
            dimension: self.config.dimension,
            ridge: self.config.ridge,
            alpha: self.config.alpha,
            arms: table.iter().map(|(_, s)| s.stats.clone()).collect(),
        }
    }

    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()> {
        snapshot.expect_kind(self.kind())?;
        if snapshot.dimension() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                found: snapshot.dimension(),
            });
        }
        snapshot.validate()?;
        if let PolicySnapshot::LinUcb { arms, .. } = snapshot {
            let loaded = ArmTable::from_ordered(
                arms.into_iter()
                    .map(|s| (s.arm.clone(), LinArm::from_stats(s))),
            );
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        }
        Ok(())
    }

    fn reset_to_prior(&self) {
        let ridge = self.config.ridge;
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for arm in table.values_mut() {
            let stats = &mut arm.stats;
            match (&stats.last_context, stats.last_reward) {
                (Some(x), Some(r)) => {
                    stats.a_diag = x.iter().map(|xi| ridge + xi * xi).collect();
                    stats.b = x.iter().map(|xi| r * xi).collect();
                    stats.count = 1;
                }
                _ => {
                    stats.a_diag.iter_mut().for_each(|a| *a = ridge);
                    stats.b.iter_mut().for_each(|b| *b = 0.0);
                    stats.count = 0;
                }
            }
            arm.recompute();
        }
    }

    fn expected_values(&self) -> BTreeMap<Arm, f64> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        // Point estimate at the arm's most recent context
        table
            .iter()
            .map(|(arm, s)| {
                let value = s
                    .stats
                    .last_context
                    .as_ref()
                    .map(|x| x.iter().zip(&s.theta).map(|(xi, t)| xi * t).sum())
                    .unwrap_or(0.0);
                (arm.clone(), value)
            })
            .collect()
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn arms(names: &[&str]) -> Vec<Arm> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ctx(values: &[f64]) -> Context {
        Context::dense(values.to_vec())
    }

    #[test]
    fn test_rejects_bad_construction() {
        assert!(matches!(
            LinUcb::new(LinUcbConfig::with_dimension(0)),
            Err(Error::InvalidArgument(_))
        ));
        let bad_ridge = LinUcbConfig {
            ridge: 0.0,
            ..Default::default()
        };
        assert!(LinUcb::new(bad_ridge).is_err());
    }

    #[test]
    fn test_explores_unseen_in_input_order() {
        let policy = LinUcb::new(LinUcbConfig::with_dimension(2)).unwrap();
        let candidates = arms(&["a", "b", "c"]);
        let x = ctx(&[1.0, 0.0]);
        assert_eq!(policy.recommend(&candidates, Some(&x)).unwrap(), "a");
        policy.update("a", 0.5, Some(&x)).unwrap();
        assert_eq!(policy.recommend(&candidates, Some(&x)).unwrap(), "b");
    }

    #[test]
    fn test_learns_context_dependent_choice() {
        let config = LinUcbConfig {
            dimension: 2,
            alpha: 0.1,
            ..Default::default()
        };
        let policy = LinUcb::new(config).unwrap();
        let left = ctx(&[1.0, 0.0]);
        let right = ctx(&[0.0, 1.0]);
        for _ in 0..30 {
            policy.update("x", 0.9, Some(&left)).unwrap();
            policy.update("x", 0.1, Some(&right)).unwrap();
            policy.update("y", 0.1, Some(&left)).unwrap();
            policy.update("y", 0.9, Some(&right)).unwrap();
        }
        let candidates = arms(&["x", "y"]);
        assert_eq!(policy.recommend(&candidates, Some(&left)).unwrap(), "x");
        assert_eq!(policy.recommend(&candidates, Some(&right)).unwrap(), "y");
    }

    #[test]
    fn test_update_accumulates_squared_features() {
        let policy = LinUcb::new(LinUcbConfig::default()).unwrap();
        let x = ctx(&[1.0, 0.5, -0.2]);
        for _ in 0..5 {
            policy.update("a", 0.9, Some(&x)).unwrap();
        }
        let diag = &policy.design_diagonals()["a"];
        assert!((diag[0] - 6.0).abs() < 1e-12);
        assert!((diag[1] - 2.25).abs() < 1e-12);
        assert!((diag[2] - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_context_length_is_error() {
        let policy = LinUcb::new(LinUcbConfig::default()).unwrap();
        let err = policy
            .recommend(&arms(&["a"]), Some(&ctx(&[1.0, 2.0])))
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("linucb.json");
        let policy = LinUcb::load_from(&path, LinUcbConfig::default()).unwrap();
        let x = ctx(&[1.0, 0.5, -0.2]);
        for _ in 0..5 {
            policy.update("a", 0.9, Some(&x)).unwrap();
        }
        policy.persist_default().unwrap();
        assert!(path.exists());

        let fresh = LinUcb::load_from(&path, LinUcbConfig::default()).unwrap();
        assert!(fresh.design_diagonals()["a"][0] > 1.0);
        assert_eq!(fresh.state_dict(), policy.state_dict());
    }

    #[test]
    fn test_load_rejects_other_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("linucb.json");
        let policy = LinUcb::new(LinUcbConfig::with_dimension(3)).unwrap();
        policy.update("a", 1.0, Some(&ctx(&[1.0, 1.0, 1.0]))).unwrap();
        policy.persist(&path).unwrap();

        let err = LinUcb::load_from(&path, LinUcbConfig::with_dimension(4)).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 4, found: 3 }));
    }

    #[test]
    fn test_stability_check_rebuilds_cache() {
        let config = LinUcbConfig {
            dimension: 2,
            stability_check_every: 5,
            max_condition: 10.0,
            ..Default::default()
        };
        let policy = LinUcb::new(config).unwrap();
        // Feature 1 never varies, so A_diag[1] stays at the ridge
        let x = ctx(&[3.0, 0.0]);
        for _ in 0..5 {
            policy.update("a", 1.0, Some(&x)).unwrap();
        }
        let table = policy.state.read().unwrap();
        let arm = table.get("a").unwrap();
        assert_eq!(arm.since_check, 0);
        assert!((arm.a_inv[0] - 1.0 / 46.0).abs() < 1e-15);
    }

    #[test]
    fn test_reset_keeps_last_observation() {
        let policy = LinUcb::new(LinUcbConfig::with_dimension(2)).unwrap();
        policy.update("a", 0.5, Some(&ctx(&[1.0, 1.0]))).unwrap();
        policy.update("a", 1.0, Some(&ctx(&[2.0, 0.0]))).unwrap();
        policy.reset_to_prior();

        let snap = policy.state_dict();
        let PolicySnapshot::LinUcb { arms, .. } = snap else {
            panic!("expected LinUCB snapshot");
        };
        assert_eq!(arms[0].a_diag, vec![5.0, 1.0]);
        assert_eq!(arms[0].b, vec![2.0, 0.0]);
        assert_eq!(arms[0].count, 1);
    }
}
