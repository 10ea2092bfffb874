//! Bandit policies
//!
//! Every policy implements [`BanditPolicy`]: pick one arm from a non-empty
//! candidate list, learn from scalar rewards, and round-trip its sufficient
//! statistics through a [`PolicySnapshot`].
//!
//! ## Policies
//!
//! - [`EpsilonGreedy`]: running-mean values, uniform exploration with probability ε
//! - [`ThompsonSampling`]: Beta-Bernoulli posterior sampling with a live
//!   exploration floor and a low-entropy reset
//! - [`Ucb1`]: optimism in the face of uncertainty, unseen arms first
//! - [`LinUcb`]: contextual UCB over a diagonal design matrix
//! - [`DoublyRobust`]: direct reward model plus an importance-weighted correction
//!
//! All methods take `&self`. State sits behind a lock that is held only for
//! the in-memory read or mutation, never across I/O.

mod context;
mod doubly_robust;
mod entropy;
mod epsilon;
mod linucb;
mod snapshot;
mod spec;
mod thompson;
mod ucb;

pub use context::Context;
pub use doubly_robust::DoublyRobust;
pub use entropy::{EntropyGuard, normalized_entropy};
pub use epsilon::EpsilonGreedy;
pub use linucb::{LinUcb, LinUcbConfig};
pub use snapshot::{BetaArmState, DrArmState, LinArmState, PolicySnapshot, ValueArmState};
pub use spec::{PolicyKind, PolicySpec};
pub use thompson::ThompsonSampling;
pub use ucb::Ucb1;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// Opaque arm identifier (model name, source id, tool id)
pub type Arm = String;

/// Contract shared by every decision algorithm
pub trait BanditPolicy: Send + Sync + fmt::Debug {
    /// Which algorithm this is
    fn kind(&self) -> PolicyKind;

    /// Pick exactly one arm out of `arms`. Never mutates arm statistics.
    fn recommend(&self, arms: &[Arm], context: Option<&Context>) -> Result<Arm>;

    /// Record an observed reward. Unknown arms start from the prior.
    fn update(&self, arm: &str, reward: f64, context: Option<&Context>) -> Result<()>;

    /// Serializable copy of the sufficient statistics
    fn state_dict(&self) -> PolicySnapshot;

    /// Replace the current state with a snapshot
    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()>;

    /// Return every arm to its prior, keeping only its last observation
    fn reset_to_prior(&self);

    /// Current point estimate per known arm
    fn expected_values(&self) -> BTreeMap<Arm, f64>;

    /// Context length for contextual policies
    fn dimension(&self) -> Option<usize> {
        None
    }

    /// True when the policy runs its own low-entropy guard
    fn monitors_entropy(&self) -> bool {
        false
    }
}

pub(crate) fn ensure_arms(arms: &[Arm]) -> Result<()> {
    if arms.is_empty() {
        return Err(Error::InvalidArgument("arm set is empty".to_string()));
    }
    Ok(())
}

/// Reject non-finite rewards, clamp the rest into [0, 1]
pub(crate) fn normalize_reward(reward: f64) -> Result<f64> {
    if !reward.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "reward must be finite, got {}",
            reward
        )));
    }
    Ok(reward.clamp(0.0, 1.0))
}

/// Per-arm state kept in first-seen order
#[derive(Debug, Clone)]
pub(crate) struct ArmTable<S> {
    order: Vec<Arm>,
    states: HashMap<Arm, S>,
}

impl<S> Default for ArmTable<S> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            states: HashMap::new(),
        }
    }
}

impl<S> ArmTable<S> {
    pub fn get(&self, arm: &str) -> Option<&S> {
        self.states.get(arm)
    }

    pub fn get_or_insert_with(&mut self, arm: &str, prior: impl FnOnce() -> S) -> &mut S {
        if !self.states.contains_key(arm) {
            self.order.push(arm.to_string());
        }
        self.states.entry(arm.to_string()).or_insert_with(prior)
    }

    /// Position in first-seen order; unseen arms sort last
    pub fn rank(&self, arm: &str) -> usize {
        self.order
            .iter()
            .position(|a| a == arm)
            .unwrap_or(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arm, &S)> {
        self.order
            .iter()
            .filter_map(|arm| self.states.get(arm).map(|s| (arm, s)))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.states.values_mut()
    }

    pub fn from_ordered(entries: impl IntoIterator<Item = (Arm, S)>) -> Self {
        let mut table = Self::default();
        for (arm, state) in entries {
            if table.states.insert(arm.clone(), state).is_none() {
                table.order.push(arm);
            }
        }
        table
    }
}

/// Index of the best-scoring arm. Ties go to the arm seen first by the
/// policy, then to input order.
pub(crate) fn argmax_by_rank<S>(
    arms: &[Arm],
    table: &ArmTable<S>,
    score: impl Fn(&str) -> f64,
) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    let mut best_rank = usize::MAX;
    for (idx, arm) in arms.iter().enumerate() {
        let s = score(arm);
        let rank = table.rank(arm);
        if s > best_score || (s == best_score && rank < best_rank) {
            best = idx;
            best_score = s;
            best_rank = rank;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reward() {
        assert_eq!(normalize_reward(1.7).unwrap(), 1.0);
        assert_eq!(normalize_reward(-0.2).unwrap(), 0.0);
        assert!(matches!(
            normalize_reward(f64::NAN),
            Err(Error::InvalidArgument(_))
        ));
        assert!(normalize_reward(f64::INFINITY).is_err());
    }

    #[test]
    fn test_arm_table_keeps_first_seen_order() {
        let mut table: ArmTable<u32> = ArmTable::default();
        *table.get_or_insert_with("b", || 0) += 1;
        *table.get_or_insert_with("a", || 0) += 1;
        *table.get_or_insert_with("b", || 0) += 1;

        let order: Vec<_> = table.iter().map(|(a, s)| (a.clone(), *s)).collect();
        assert_eq!(order, vec![("b".to_string(), 2), ("a".to_string(), 1)]);
        assert_eq!(table.rank("a"), 1);
        assert_eq!(table.rank("zzz"), usize::MAX);
    }

    #[test]
    fn test_argmax_ties_prefer_first_seen() {
        let mut table: ArmTable<f64> = ArmTable::default();
        table.get_or_insert_with("late", || 0.5);
        table.get_or_insert_with("early", || 0.5);
        // "late" was inserted first, so it is the earlier-seen arm
        let arms = vec!["early".to_string(), "late".to_string()];
        let idx = argmax_by_rank(&arms, &table, |_| 0.5);
        assert_eq!(arms[idx], "late");
    }
}
