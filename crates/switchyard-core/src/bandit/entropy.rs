//! Low-entropy reset guard
//!
//! Tracks the last `bandit.reset_window` arms and reports when the normalized
//! Shannon entropy of that window drops under `bandit.reset_entropy_threshold`.
//! Both knobs are read from the live config on every observation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ConfigSource, keys};

pub const DEFAULT_RESET_WINDOW: usize = 50;

/// Sliding window of recent arms
#[derive(Debug)]
pub struct EntropyGuard {
    window: Mutex<VecDeque<String>>,
    config: Arc<dyn ConfigSource>,
}

impl EntropyGuard {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn window_len(&self) -> usize {
        self.config
            .get_usize(keys::RESET_WINDOW)
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_RESET_WINDOW)
    }

    fn threshold(&self) -> f64 {
        self.config
            .get_f64(keys::RESET_ENTROPY_THRESHOLD)
            .unwrap_or(0.0)
    }

    /// Record `arm`. Returns the window entropy when a reset is due; the
    /// window is cleared in that case.
    pub fn observe(&self, arm: &str, known_arms: usize) -> Option<f64> {
        let limit = self.window_len();
        let threshold = self.threshold();

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.push_back(arm.to_string());
        while window.len() > limit {
            window.pop_front();
        }

        if threshold <= 0.0 || window.len() < limit {
            return None;
        }

        let entropy = normalized_entropy(window.iter().map(String::as_str), known_arms);
        if entropy < threshold {
            window.clear();
            Some(entropy)
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shannon entropy of the observed arm frequencies divided by `ln(k)`, where
/// `k` is the larger of `known_arms` and the distinct arms observed. Returns
/// 1.0 when fewer than two arms are in play.
pub fn normalized_entropy<'a>(observations: impl Iterator<Item = &'a str>, known_arms: usize) -> f64 {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut total = 0usize;
    for arm in observations {
        *counts.entry(arm).or_default() += 1;
        total += 1;
    }

    let k = known_arms.max(counts.len());
    if k < 2 || total == 0 {
        return 1.0;
    }

    let h: f64 = counts
        .values()
        .map(|c| {
            let p = *c as f64 / total as f64;
            -p * p.ln()
        })
        .sum();
    h / (k as f64).ln()
}
