//! Doubly-robust value estimates
//!
//! A direct model (running mean `q`) is corrected by importance-weighted
//! residuals: every update adds `(r - q) / p` to the chosen arm, where `p` is
//! the probability the current ε-greedy policy would have chosen that arm.
//! The value used for selection is `q + Σ corrections / T` over all rounds.

use rand::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use super::{
    Arm, ArmTable, BanditPolicy, Context, DrArmState, PolicyKind, PolicySnapshot,
    argmax_by_rank, ensure_arms, normalize_reward,
};
use crate::error::{Error, Result};

pub const DEFAULT_MIN_PROPENSITY: f64 = 0.05;

#[derive(Debug, Default)]
struct DrTable {
    arms: ArmTable<DrArmState>,
    total_rounds: u64,
}

impl DrTable {
    fn value(&self, state: &DrArmState) -> f64 {
        if self.total_rounds == 0 {
            state.q_value
        } else {
            state.q_value + state.correction_sum / self.total_rounds as f64
        }
    }

    fn greedy_arm(&self) -> Option<&Arm> {
        let mut best: Option<(&Arm, f64)> = None;
        for (arm, state) in self.arms.iter() {
            let v = self.value(state);
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((arm, v));
            }
        }
        best.map(|(arm, _)| arm)
    }
}

/// ε-greedy over doubly-robust value estimates
#[derive(Debug)]
pub struct DoublyRobust {
    epsilon: f64,
    min_propensity: f64,
    state: RwLock<DrTable>,
    rng: Mutex<StdRng>,
}

impl DoublyRobust {
    pub fn new(epsilon: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(Error::InvalidArgument(format!(
                "epsilon must be in [0, 1], got {}",
                epsilon
            )));
        }
        Ok(Self {
            epsilon,
            min_propensity: DEFAULT_MIN_PROPENSITY,
            state: RwLock::new(DrTable::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Lower clip for logging propensities
    pub fn with_min_propensity(mut self, min_propensity: f64) -> Result<Self> {
        if !(min_propensity > 0.0 && min_propensity <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "min_propensity must be in (0, 1], got {}",
                min_propensity
            )));
        }
        self.min_propensity = min_propensity;
        Ok(self)
    }

    /// Probability the current policy picks `arm` among `k` known arms
    fn propensity(&self, is_greedy: bool, k: usize) -> f64 {
        let k = k.max(1) as f64;
        let p = if is_greedy {
            1.0 - self.epsilon + self.epsilon / k
        } else {
            self.epsilon / k
        };
        p.max(self.min_propensity)
    }
}

impl BanditPolicy for DoublyRobust {
    fn kind(&self) -> PolicyKind {
        PolicyKind::DoublyRobust
    }

    fn recommend(&self, arms: &[Arm], _context: Option<&Context>) -> Result<Arm> {
        ensure_arms(arms)?;

        {
            let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(unseen) = arms
                .iter()
                .find(|arm| table.arms.get(arm).is_none_or(|s| s.count == 0))
            {
                return Ok(unseen.clone());
            }
        }

        if self.epsilon > 0.0 && arms.len() > 1 {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if rng.r#gen::<f64>() < self.epsilon {
                return Ok(arms[rng.gen_range(0..arms.len())].clone());
            }
        }

        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let idx = argmax_by_rank(arms, &table.arms, |arm| {
            table
                .arms
                .get(arm)
                .map(|s| table.value(s))
                .unwrap_or(f64::MIN)
        });
        Ok(arms[idx].clone())
    }

    fn update(&self, arm: &str, reward: f64, _context: Option<&Context>) -> Result<()> {
        let reward = normalize_reward(reward)?;
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let is_new = table.arms.get(arm).is_none();
        // `recommend` returns unseen arms unconditionally
        let p = if table.arms.get(arm).is_none_or(|s| s.count == 0) {
            1.0
        } else {
            let is_greedy = table.greedy_arm().is_none_or(|a| a == arm);
            let k = table.arms.len() + usize::from(is_new);
            self.propensity(is_greedy, k)
        };

        table.total_rounds += 1;
        let entry = table.arms.get_or_insert_with(arm, || DrArmState {
            arm: arm.to_string(),
            count: 0,
            q_value: 0.0,
            correction_sum: 0.0,
            last_reward: None,
        });
        entry.correction_sum += (reward - entry.q_value) / p;
        entry.count += 1;
        entry.q_value += (reward - entry.q_value) / entry.count as f64;
        entry.last_reward = Some(reward);
        Ok(())
    }

    fn state_dict(&self) -> PolicySnapshot {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        PolicySnapshot::DoublyRobust {
            epsilon: self.epsilon,
            total_rounds: table.total_rounds,
            arms: table.arms.iter().map(|(_, s)| s.clone()).collect(),
        }
    }

    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()> {
        snapshot.expect_kind(self.kind())?;
        snapshot.validate()?;
        if let PolicySnapshot::DoublyRobust {
            total_rounds, arms, ..
        } = snapshot
        {
            let loaded = DrTable {
                arms: ArmTable::from_ordered(arms.into_iter().map(|s| (s.arm.clone(), s))),
                total_rounds,
            };
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        }
        Ok(())
    }

    fn reset_to_prior(&self) {
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut rounds = 0;
        for state in table.arms.values_mut() {
            state.correction_sum = 0.0;
            match state.last_reward {
                Some(r) => {
                    state.count = 1;
                    state.q_value = r;
                    rounds += 1;
                }
                None => {
                    state.count = 0;
                    state.q_value = 0.0;
                }
            }
        }
        table.total_rounds = rounds;
    }

    fn expected_values(&self) -> BTreeMap<Arm, f64> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table
            .arms
            .iter()
            .map(|(arm, s)| (arm.clone(), table.value(s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<Arm> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unseen_candidates_first() {
        let policy = DoublyRobust::new(0.0).unwrap();
        policy.update("a", 1.0, None).unwrap();
        assert_eq!(policy.recommend(&arms(&["a", "b"]), None).unwrap(), "b");
    }

    #[test]
    fn test_correction_uses_clipped_propensity() {
        let policy = DoublyRobust::new(0.0).unwrap();
        // First pulls are forced by `recommend`, p = 1
        policy.update("a", 0.8, None).unwrap();
        policy.update("b", 0.2, None).unwrap();
        // "b" is now seen but not greedy and epsilon is 0, so p clips to the floor
        policy.update("b", 0.4, None).unwrap();

        let PolicySnapshot::DoublyRobust {
            total_rounds, arms, ..
        } = policy.state_dict()
        else {
            panic!("expected doubly-robust snapshot");
        };
        assert_eq!(total_rounds, 3);
        assert!((arms[0].correction_sum - 0.8).abs() < 1e-12);
        let expected = 0.2 + (0.4 - 0.2) / DEFAULT_MIN_PROPENSITY;
        assert!((arms[1].correction_sum - expected).abs() < 1e-9);
    }

    #[test]
    fn test_better_arm_wins_right_after_warm_up() {
        let policy = DoublyRobust::new(0.0).unwrap();
        let candidates = arms(&["good", "bad"]);
        let reward = |arm: &str| if arm == "good" { 0.8 } else { 0.2 };

        let mut picks = Vec::new();
        for _ in 0..12 {
            let arm = policy.recommend(&candidates, None).unwrap();
            policy.update(&arm, reward(&arm), None).unwrap();
            picks.push(arm);
        }

        assert_eq!(picks[..2], ["good", "bad"]);
        assert!(
            picks[2..].iter().all(|a| a == "good"),
            "picks after warm-up: {:?}",
            &picks[2..]
        );
    }

    #[test]
    fn test_prefers_better_arm() {
        let policy = DoublyRobust::new(0.1).unwrap().with_seed(21);
        for _ in 0..40 {
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
    fn test_round_trip() {
        let policy = DoublyRobust::new(0.0).unwrap();
        for (arm, r) in [("a", 0.3), ("b", 0.7), ("a", 0.5)] {
            policy.update(arm, r, None).unwrap();
        }
        let restored = DoublyRobust::new(0.0).unwrap();
        restored.load_state(policy.state_dict()).unwrap();
        assert_eq!(restored.state_dict(), policy.state_dict());
        assert_eq!(restored.expected_values(), policy.expected_values());
    }

    #[test]
    fn test_reset_clears_corrections() {
        let policy = DoublyRobust::new(0.0).unwrap();
        policy.update("a", 0.2, None).unwrap();
        policy.update("a", 0.6, None).unwrap();
        policy.reset_to_prior();
        let values = policy.expected_values();
        assert!((values["a"] - 0.6).abs() < 1e-12);
    }
}
