use rand::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use super::{
    Arm, ArmTable, BanditPolicy, Context, PolicyKind, PolicySnapshot, ValueArmState,
    argmax_by_rank, ensure_arms, normalize_reward,
};
use crate::error::{Error, Result};

/// Greedy on running means, uniform exploration with probability ε
#[derive(Debug)]
pub struct EpsilonGreedy {
    epsilon: f64,
    state: RwLock<ArmTable<ValueArmState>>,
    rng: Mutex<StdRng>,
}

impl EpsilonGreedy {
    /// `epsilon` must lie in [0, 1]; 0 makes selection deterministic
    pub fn new(epsilon: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(Error::InvalidArgument(format!(
                "epsilon must be in [0, 1], got {}",
                epsilon
            )));
        }
        Ok(Self {
            epsilon,
            state: RwLock::new(ArmTable::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Deterministic policy for tests
    pub fn greedy() -> Self {
        Self {
            epsilon: 0.0,
            state: RwLock::new(ArmTable::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl BanditPolicy for EpsilonGreedy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::EpsilonGreedy
    }

    fn recommend(&self, arms: &[Arm], _context: Option<&Context>) -> Result<Arm> {
        ensure_arms(arms)?;

        if self.epsilon > 0.0 && arms.len() > 1 {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if rng.r#gen::<f64>() < self.epsilon {
                return Ok(arms[rng.gen_range(0..arms.len())].clone());
            }
        }

        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let idx = argmax_by_rank(arms, &*table, |arm| {
            // Unseen arms score below any observed mean
            table.get(arm).map(|s| s.q_value).unwrap_or(f64::MIN)
        });
        Ok(arms[idx].clone())
    }

    fn update(&self, arm: &str, reward: f64, _context: Option<&Context>) -> Result<()> {
        let reward = normalize_reward(reward)?;
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        table
            .get_or_insert_with(arm, || ValueArmState::new(arm))
            .observe(reward);
        Ok(())
    }

    fn state_dict(&self) -> PolicySnapshot {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let arms = table.iter().map(|(_, s)| s.clone()).collect();
        PolicySnapshot::EpsilonGreedy {
            epsilon: self.epsilon,
            arms,
        }
    }

    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()> {
        snapshot.expect_kind(self.kind())?;
        snapshot.validate()?;
        if let PolicySnapshot::EpsilonGreedy { arms, .. } = snapshot {
            let table = ArmTable::from_ordered(arms.into_iter().map(|s| (s.arm.clone(), s)));
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = table;
        }
        Ok(())
    }

    fn reset_to_prior(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .for_each(ValueArmState::reset);
    }

    fn expected_values(&self) -> BTreeMap<Arm, f64> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table.iter().map(|(a, s)| (a.clone(), s.q_value)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<Arm> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_arm_set_is_invalid() {
        let policy = EpsilonGreedy::greedy();
        assert!(matches!(
            policy.recommend(&[], None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_bad_epsilon() {
        assert!(EpsilonGreedy::new(1.5).is_err());
        assert!(EpsilonGreedy::new(-0.1).is_err());
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let policy = EpsilonGreedy::greedy();
        let candidates = arms(&["x", "y", "z"]);
        policy.update("y", 0.7, None).unwrap();
        policy.update("z", 0.4, None).unwrap();

        let first = policy.recommend(&candidates, None).unwrap();
        for _ in 0..50 {
            assert_eq!(policy.recommend(&candidates, None).unwrap(), first);
        }
        assert_eq!(first, "y");
    }

    #[test]
    fn test_ties_broken_by_first_seen() {
        let policy = EpsilonGreedy::greedy();
        policy.update("b", 0.5, None).unwrap();
        policy.update("a", 0.5, None).unwrap();
        assert_eq!(policy.recommend(&arms(&["a", "b"]), None).unwrap(), "b");
    }

    #[test]
    fn test_learns_better_arm() {
        let policy = EpsilonGreedy::new(0.1).unwrap().with_seed(11);
        for _ in 0..30 {
            policy.update("good", 0.9, None).unwrap();
            policy.update("bad", 0.1, None).unwrap();
        }
        let candidates = arms(&["bad", "good"]);
        let good = (0..100)
            .filter(|_| policy.recommend(&candidates, None).unwrap() == "good")
            .count();
        assert!(good > 60, "Expected good arm in majority, got {} of 100", good);
    }

    #[test]
    fn test_nan_reward_rejected() {
        let policy = EpsilonGreedy::greedy();
        assert!(policy.update("a", f64::NAN, None).is_err());
        assert!(policy.expected_values().is_empty());
    }

    #[test]
    fn test_round_trip_preserves_choice() {
        let policy = EpsilonGreedy::greedy();
        policy.update("a", 0.2, None).unwrap();
        policy.update("b", 0.6, None).unwrap();
        let snapshot = policy.state_dict();

        let restored = EpsilonGreedy::greedy();
        restored.load_state(snapshot.clone()).unwrap();
        assert_eq!(restored.state_dict(), snapshot);

        let candidates = arms(&["a", "b", "c"]);
        assert_eq!(
            restored.recommend(&candidates, None).unwrap(),
            policy.recommend(&candidates, None).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_other_kind() {
        let policy = EpsilonGreedy::greedy();
        let err = policy
            .load_state(PolicySnapshot::Ucb1 { arms: vec![] })
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotMismatch { .. }));
    }

    #[test]
    fn test_poisoned_lock_still_applies_state() {
        let source = EpsilonGreedy::greedy();
        source.update("a", 0.2, None).unwrap();
        source.update("b", 0.9, None).unwrap();
        source.update("b", 0.7, None).unwrap();

        let policy = EpsilonGreedy::greedy();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = policy.state.write().unwrap();
            panic!("writer died holding the lock");
        }));
        assert!(policy.state.is_poisoned());

        policy.load_state(source.state_dict()).unwrap();
        assert_eq!(policy.state_dict(), source.state_dict());
        assert_eq!(policy.recommend(&arms(&["a", "b"]), None).unwrap(), "b");

        policy.reset_to_prior();
        let PolicySnapshot::EpsilonGreedy { arms: states, .. } = policy.state_dict() else {
            panic!("expected epsilon-greedy snapshot");
        };
        assert!(states.iter().all(|s| s.count <= 1));
        assert!((policy.expected_values()["b"] - 0.7).abs() < 1e-12);
    }
}
