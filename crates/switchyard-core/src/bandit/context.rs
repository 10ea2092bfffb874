use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Observed features at decision time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Context {
    /// Dense feature vector in a fixed order
    Dense(Vec<f64>),
    /// Feature name to scalar
    Named(BTreeMap<String, f64>),
}

impl Context {
    pub fn dense(values: impl Into<Vec<f64>>) -> Self {
        Self::Dense(values.into())
    }

    pub fn named<K: Into<String>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self::Named(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Dense(v) => v.len(),
            Self::Named(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Project onto a vector of length `dimension`.
    ///
    /// Dense contexts must match the dimension exactly. Named contexts follow
    /// `feature_names` when given (absent features read as 0.0), otherwise
    /// sorted key order, which must then match the dimension. Non-finite
    /// values become 0.0.
    pub fn to_vector(&self, dimension: usize, feature_names: Option<&[String]>) -> Result<Vec<f64>> {
        let raw: Vec<f64> = match (self, feature_names) {
            (Self::Dense(values), _) => {
                if values.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        found: values.len(),
                    });
                }
                values.clone()
            }
            (Self::Named(map), Some(names)) => {
                if names.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        found: names.len(),
                    });
                }
                if let Some(unknown) = map.keys().find(|k| !names.contains(k)) {
                    return Err(Error::InvalidArgument(format!(
                        "unknown context feature '{}'",
                        unknown
                    )));
                }
                names
                    .iter()
                    .map(|n| map.get(n).copied().unwrap_or(0.0))
                    .collect()
            }
            (Self::Named(map), None) => {
                if map.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        found: map.len(),
                    });
                }
                map.values().copied().collect()
            }
        };

        Ok(raw
            .into_iter()
            .map(|v| if v.is_finite() { v } else { 0.0 })
            .collect())
    }
}

impl From<Vec<f64>> for Context {
    fn from(values: Vec<f64>) -> Self {
        Self::Dense(values)
    }
}
