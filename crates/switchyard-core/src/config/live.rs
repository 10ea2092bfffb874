//! Live configuration sources
//!
//! Every accessor is evaluated at call time. Nothing here caches a value.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use super::Config;

/// Read-only key/value view consulted on every decision
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    /// Raw string value for `key`, if set
    fn get(&self, key: &str) -> Option<String>;

    fn get_f64(&self, key: &str) -> Option<f64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                warn!(key = %key, value = %raw, "Ignoring non-numeric config value");
                None
            }
        }
    }

    fn get_usize(&self, key: &str) -> Option<usize> {
        let raw = self.get(key)?;
        match raw.trim().parse::<usize>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key = %key, value = %raw, "Ignoring non-integer config value");
                None
            }
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        let raw = self.get(key)?;
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                warn!(key = %key, value = %raw, "Ignoring non-boolean config value");
                None
            }
        }
    }
}

/// Environment-backed source: `bandit.min_explore_rate` reads
/// `SWITCHYARD_BANDIT_MIN_EXPLORE_RATE`
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new("SWITCHYARD")
    }
}

impl EnvConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a dotted key
    pub fn var_name(&self, key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| match c {
                '.' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("{}_{}", self.prefix, suffix)
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        env::var(self.var_name(key)).ok()
    }
}

/// In-process mutable source
#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl ToString) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.values.write().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

impl ConfigSource for MemoryConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }
}

/// File configuration shared behind a lock, reloadable at runtime
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Swap in a freshly loaded configuration
    pub fn replace(&self, config: Config) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ConfigSource for SharedConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).lookup(key)
    }
}

/// Ordered list of sources; the first one that knows a key wins
#[derive(Debug, Default, Clone)]
pub struct LayeredConfig {
    layers: Vec<Arc<dyn ConfigSource>>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: Arc<dyn ConfigSource>) -> Self {
        self.layers.push(layer);
        self
    }
}

impl ConfigSource for LayeredConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}
