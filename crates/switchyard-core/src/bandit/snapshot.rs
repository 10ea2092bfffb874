//! Serializable policy state
//!
//! Only sufficient statistics are stored. Cached derived values (inverse
//! diagonals, coefficient vectors) are rebuilt on load.

use serde::{Deserialize, Serialize};

use super::{Arm, PolicyKind};
use crate::error::{Error, Result};

/// Count plus running mean, shared by value-based policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueArmState {
    pub arm: Arm,
    pub count: u64,
    pub q_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward: Option<f64>,
}

impl ValueArmState {
    pub fn new(arm: &str) -> Self {
        Self {
            arm: arm.to_string(),
            count: 0,
            q_value: 0.0,
            last_reward: None,
        }
    }

    /// Fold one reward into the running mean
    pub fn observe(&mut self, reward: f64) {
        self.count += 1;
        self.q_value += (reward - self.q_value) / self.count as f64;
        self.last_reward = Some(reward);
    }

    pub fn reset(&mut self) {
        match self.last_reward {
            Some(r) => {
                self.count = 1;
                self.q_value = r;
            }
            None => {
                self.count = 0;
                self.q_value = 0.0;
            }
        }
    }
}

/// Beta posterior for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaArmState {
    pub arm: Arm,
    pub alpha: f64,
    pub beta: f64,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward: Option<f64>,
}

impl BetaArmState {
    pub fn expected_value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn uncertainty(&self) -> f64 {
        let sum = self.alpha + self.beta;
        ((self.alpha * self.beta) / (sum.powi(2) * (sum + 1.0))).sqrt()
    }
}

/// Diagonal design accumulator for one contextual arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinArmState {
    pub arm: Arm,
    pub a_diag: Vec<f64>,
    pub b: Vec<f64>,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward: Option<f64>,
}

/// Direct-model estimate plus accumulated importance-weighted correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrArmState {
    pub arm: Arm,
    pub count: u64,
    pub q_value: f64,
    pub correction_sum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward: Option<f64>,
}

/// Snapshot of a policy's sufficient statistics, arms in first-seen order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySnapshot {
    EpsilonGreedy {
        epsilon: f64,
        arms: Vec<ValueArmState>,
    },
    Thompson {
        prior_alpha: f64,
        prior_beta: f64,
        arms: Vec<BetaArmState>,
    },
    Ucb1 {
        arms: Vec<ValueArmState>,
    },
    LinUcb {
        dimension: usize,
        ridge: f64,
        alpha: f64,
        arms: Vec<LinArmState>,
    },
    DoublyRobust {
        epsilon: f64,
        total_rounds: u64,
        arms: Vec<DrArmState>,
    },
}

impl PolicySnapshot {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::EpsilonGreedy { .. } => PolicyKind::EpsilonGreedy,
            Self::Thompson { .. } => PolicyKind::Thompson,
            Self::Ucb1 { .. } => PolicyKind::Ucb1,
            Self::LinUcb { .. } => PolicyKind::LinUcb,
            Self::DoublyRobust { .. } => PolicyKind::DoublyRobust,
        }
    }

    /// Context dimension, 0 for non-contextual policies
    pub fn dimension(&self) -> usize {
        match self {
            Self::LinUcb { dimension, .. } => *dimension,
            _ => 0,
        }
    }

    pub fn arm_count(&self) -> usize {
        match self {
            Self::EpsilonGreedy { arms, .. } | Self::Ucb1 { arms } => arms.len(),
            Self::Thompson { arms, .. } => arms.len(),
            Self::LinUcb { arms, .. } => arms.len(),
            Self::DoublyRobust { arms, .. } => arms.len(),
        }
    }

    /// Fail unless the snapshot belongs to `kind`
    pub fn expect_kind(&self, kind: PolicyKind) -> Result<()> {
        if self.kind() != kind {
            return Err(Error::SnapshotMismatch {
                expected: kind.to_string(),
                found: self.kind().to_string(),
            });
        }
        Ok(())
    }

    /// Check numeric invariants of the stored statistics
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidArgument(msg));
        match self {
            Self::EpsilonGreedy { arms, .. } | Self::Ucb1 { arms } => {
                for a in arms {
                    if !a.q_value.is_finite() {
                        return bad(format!("arm '{}' has a non-finite value", a.arm));
                    }
                }
            }
            Self::Thompson {
                prior_alpha,
                prior_beta,
                arms,
            } => {
                if *prior_alpha <= 0.0 || *prior_beta <= 0.0 {
                    return bad("Beta prior must be positive".to_string());
                }
                for a in arms {
                    let positive = a.alpha.is_finite() && a.beta.is_finite();
                    if !positive || a.alpha <= 0.0 || a.beta <= 0.0 {
                        return bad(format!("arm '{}' has a non-positive Beta parameter", a.arm));
                    }
                }
            }
            Self::LinUcb {
                dimension,
                ridge,
                arms,
                ..
            } => {
                if *dimension == 0 {
                    return bad("dimension must be positive".to_string());
                }
                if ridge.is_nan() || *ridge <= 0.0 {
                    return bad("ridge must be positive".to_string());
                }
                for a in arms {
                    if a.a_diag.len() != *dimension || a.b.len() != *dimension {
                        return Err(Error::DimensionMismatch {
                            expected: *dimension,
                            found: a.a_diag.len().max(a.b.len()),
                        });
                    }
                    let tolerance = ridge * 1e-9;
                    if a.a_diag.iter().any(|v| !v.is_finite() || *v < ridge - tolerance)
                        || a.b.iter().any(|v| !v.is_finite())
                    {
                        return bad(format!(
                            "arm '{}' has a design diagonal below the ridge",
                            a.arm
                        ));
                    }
                }
            }
            Self::DoublyRobust { arms, .. } => {
                for a in arms {
                    if !a.q_value.is_finite() || !a.correction_sum.is_finite() {
                        return bad(format!("arm '{}' has a non-finite estimate", a.arm));
                    }
                }
            }
        }
        Ok(())
    }
}
