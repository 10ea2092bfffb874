use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::{
    Arm, ArmTable, BanditPolicy, Context, PolicyKind, PolicySnapshot, ValueArmState,
    argmax_by_rank, ensure_arms, normalize_reward,
};
use crate::error::Result;

/// UCB1: mean plus `sqrt(2 ln N / n)`. Deterministic.
///
/// Candidates that have never been updated are tried first, in input order.
#[derive(Debug, Default)]
pub struct Ucb1 {
    state: RwLock<ArmTable<ValueArmState>>,
}

impl Ucb1 {
    pub fn new() -> Self {
        Self::default()
    }

    fn total_count(table: &ArmTable<ValueArmState>) -> u64 {
        table.iter().map(|(_, s)| s.count).sum()
    }
}

impl BanditPolicy for Ucb1 {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Ucb1
    }

    fn recommend(&self, arms: &[Arm], _context: Option<&Context>) -> Result<Arm> {
        ensure_arms(arms)?;
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(unseen) = arms
            .iter()
            .find(|arm| table.get(arm).is_none_or(|s| s.count == 0))
        {
            return Ok(unseen.clone());
        }

        let total = Self::total_count(&table).max(1) as f64;
        let idx = argmax_by_rank(arms, &*table, |arm| match table.get(arm) {
            Some(s) => s.q_value + (2.0 * total.ln() / s.count as f64).sqrt(),
            None => f64::INFINITY,
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
        PolicySnapshot::Ucb1 {
            arms: table.iter().map(|(_, s)| s.clone()).collect(),
        }
    }

    fn load_state(&self, snapshot: PolicySnapshot) -> Result<()> {
        snapshot.expect_kind(self.kind())?;
        snapshot.validate()?;
        if let PolicySnapshot::Ucb1 { arms } = snapshot {
            let loaded = ArmTable::from_ordered(arms.into_iter().map(|s| (s.arm.clone(), s)));
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        }
        Ok(())
    }

    fn reset_to_prior(&self) {
        let mut table = self.state.write().unwrap_or_else(PoisonError::into_inner);
        table.values_mut().for_each(ValueArmState::reset);
    }

    fn expected_values(&self) -> BTreeMap<Arm, f64> {
        let table = self.state.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .map(|(arm, s)| (arm.clone(), s.q_value))
            .collect()
    }
}
