use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    BanditPolicy, DoublyRobust, EpsilonGreedy, LinUcb, LinUcbConfig, ThompsonSampling, Ucb1,
};
use crate::config::{ConfigSource, keys};
use crate::error::{Error, Result};
use crate::metrics::SharedMetrics;

/// Available decision algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    EpsilonGreedy,
    #[default]
    Thompson,
    Ucb1,
    LinUcb,
    DoublyRobust,
}

impl PolicyKind {
    pub fn is_contextual(&self) -> bool {
        matches!(self, Self::LinUcb)
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "epsilon_greedy" | "epsilon" => Ok(Self::EpsilonGreedy),
            "thompson" | "thompson_sampling" => Ok(Self::Thompson),
            "ucb1" | "ucb" => Ok(Self::Ucb1),
            "lin_ucb" | "linucb" => Ok(Self::LinUcb),
            "doubly_robust" | "dr" => Ok(Self::DoublyRobust),
            _ => Err(Error::InvalidArgument(format!("Unknown policy kind: {}", s))),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EpsilonGreedy => write!(f, "epsilon_greedy"),
            Self::Thompson => write!(f, "thompson"),
            Self::Ucb1 => write!(f, "ucb1"),
            Self::LinUcb => write!(f, "lin_ucb"),
            Self::DoublyRobust => write!(f, "doubly_robust"),
        }
    }
}

/// Everything needed to build a fresh policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySpec {
    pub kind: PolicyKind,
    pub epsilon: f64,
    pub dimension: usize,
    pub ridge: f64,
    pub alpha: f64,
    pub seed: Option<u64>,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Thompson,
            epsilon: 0.1,
            dimension: 3,
            ridge: 1.0,
            alpha: 1.0,
            seed: None,
        }
    }
}

impl PolicySpec {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Spec seeded from the live config, with the tenant's dimension override applied
    pub fn from_config(kind: PolicyKind, config: &dyn ConfigSource, tenant: Option<&str>) -> Self {
        let defaults = Self::default();
        let dimension = tenant
            .and_then(|t| config.get_usize(&keys::tenant_dimension(t)))
            .or_else(|| config.get_usize(keys::DIMENSION))
            .unwrap_or(defaults.dimension);
        Self {
            kind,
            epsilon: config.get_f64(keys::EPSILON).unwrap_or(defaults.epsilon),
            dimension,
            ridge: config.get_f64(keys::RIDGE).unwrap_or(defaults.ridge),
            alpha: config.get_f64(keys::LINUCB_ALPHA).unwrap_or(defaults.alpha),
            seed: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Dimension used for snapshot keys; 0 for non-contextual kinds
    pub fn key_dimension(&self) -> usize {
        if self.kind.is_contextual() {
            self.dimension
        } else {
            0
        }
    }

    pub fn build(
        &self,
        config: Arc<dyn ConfigSource>,
        metrics: SharedMetrics,
    ) -> Result<Arc<dyn BanditPolicy>> {
        let policy: Arc<dyn BanditPolicy> = match self.kind {
            PolicyKind::EpsilonGreedy => {
                let p = EpsilonGreedy::new(self.epsilon)?;
                Arc::new(match self.seed {
                    Some(seed) => p.with_seed(seed),
                    None => p,
                })
            }
            PolicyKind::Thompson => {
                let p = ThompsonSampling::new(config).with_metrics(metrics);
                Arc::new(match self.seed {
                    Some(seed) => p.with_seed(seed),
                    None => p,
                })
            }
            PolicyKind::Ucb1 => Arc::new(Ucb1::new()),
            PolicyKind::LinUcb => Arc::new(LinUcb::new(LinUcbConfig {
                dimension: self.dimension,
                ridge: self.ridge,
                alpha: self.alpha,
                ..Default::default()
            })?),
            PolicyKind::DoublyRobust => {
                let p = DoublyRobust::new(self.epsilon)?;
                Arc::new(match self.seed {
                    Some(seed) => p.with_seed(seed),
                    None => p,
                })
            }
        };
        Ok(policy)
    }
}
