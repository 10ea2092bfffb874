//! Configuration management with file persistence
//!
//! Two layers live here. [`Config`] is the operator-facing TOML file with
//! dotted-key `get`/`set`/`list`. [`ConfigSource`] is the live key/value view
//! that routers, policies and the scheduler consult on every call, so knobs
//! can change without restarting the process.

mod live;

pub use live::{ConfigSource, EnvConfig, LayeredConfig, MemoryConfig, SharedConfig};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Live configuration keys
pub mod keys {
    pub const BANDIT_ENABLED: &str = "routing.bandit_enabled";
    pub const COST_CEILING_USD: &str = "routing.cost_ceiling_usd";
    pub const DEFAULT_POLICY: &str = "routing.default_policy";

    pub const EPSILON: &str = "bandit.epsilon";
    pub const MIN_EXPLORE_RATE: &str = "bandit.min_explore_rate";
    pub const RESET_ENTROPY_THRESHOLD: &str = "bandit.reset_entropy_threshold";
    pub const RESET_WINDOW: &str = "bandit.reset_window";
    pub const DIMENSION: &str = "bandit.dimension";
    pub const RIDGE: &str = "bandit.ridge";
    pub const LINUCB_ALPHA: &str = "bandit.linucb_alpha";

    pub const WEIGHT_SUCCESS: &str = "reward.weight_success";
    pub const WEIGHT_QUALITY: &str = "reward.weight_quality";
    pub const WEIGHT_COST: &str = "reward.weight_cost";
    pub const WEIGHT_LATENCY: &str = "reward.weight_latency";
    pub const COST_SCALE_USD: &str = "reward.cost_scale_usd";
    pub const LATENCY_SCALE_MS: &str = "reward.latency_scale_ms";

    pub const LEASE_SECS: &str = "queue.lease_secs";
    pub const MAX_ATTEMPTS: &str = "queue.max_attempts";

    pub const POLL_INTERVAL_SECS: &str = "scheduler.poll_interval_secs";
    pub const WATCH_INTERVAL_SECS: &str = "scheduler.watch_interval_secs";

    /// Per-tenant dimension override: `bandit.dimension.<tenant>`
    pub fn tenant_dimension(tenant: &str) -> String {
        format!("{}.{}", DIMENSION, tenant)
    }
}

/// Switchyard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub bandit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_ceiling_usd: Option<f64>,
    pub default_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    pub epsilon: f64,
    pub min_explore_rate: f64,
    pub reset_entropy_threshold: f64,
    pub reset_window: usize,
    pub dimension: usize,
    pub ridge: f64,
    pub linucb_alpha: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimension_overrides: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    pub weight_success: f64,
    pub weight_quality: f64,
    pub weight_cost: f64,
    pub weight_latency: f64,
    pub cost_scale_usd: f64,
    pub latency_scale_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub lease_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub watch_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bandit_enabled: true,
            cost_ceiling_usd: None,
            default_policy: "thompson".to_string(),
        }
    }
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            min_explore_rate: 0.0,
            reset_entropy_threshold: 0.0,
            reset_window: 50,
            dimension: 3,
            ridge: 1.0,
            linucb_alpha: 1.0,
            dimension_overrides: BTreeMap::new(),
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            weight_success: 0.5,
            weight_quality: 0.2,
            weight_cost: 0.15,
            weight_latency: 0.15,
            cost_scale_usd: 0.01,
            latency_scale_ms: 1000.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_secs: 300,
            max_attempts: 3,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            watch_interval_secs: 300,
        }
    }
}

const POLICY_KINDS: [&str; 5] = ["epsilon_greedy", "thompson", "ucb1", "lin_ucb", "doubly_robust"];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SWITCHYARD_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("switchyard")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.bandit.epsilon) {
            return Err(anyhow!("bandit.epsilon must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&self.bandit.min_explore_rate) {
            return Err(anyhow!("bandit.min_explore_rate must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&self.bandit.reset_entropy_threshold) {
            return Err(anyhow!(
                "bandit.reset_entropy_threshold must be between 0.0 and 1.0"
            ));
        }
        if self.bandit.reset_window == 0 {
            return Err(anyhow!("bandit.reset_window must be positive"));
        }
        if self.bandit.dimension == 0 {
            return Err(anyhow!("bandit.dimension must be positive"));
        }
        if self.bandit.ridge <= 0.0 {
            return Err(anyhow!("bandit.ridge must be positive"));
        }
        if self.queue.lease_secs == 0 || self.queue.max_attempts == 0 {
            return Err(anyhow!("queue.lease_secs and queue.max_attempts must be positive"));
        }
        if !POLICY_KINDS.contains(&self.routing.default_policy.as_str()) {
            return Err(anyhow!(
                "Invalid routing.default_policy: {}. Valid options: {}",
                self.routing.default_policy,
                POLICY_KINDS.join(", ")
            ));
        }
        Ok(())
    }

    /// Look up a key, returning `None` for unset optional values
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(tenant) = key.strip_prefix("bandit.dimension.") {
            return self
                .bandit
                .dimension_overrides
                .get(tenant)
                .map(|d| d.to_string());
        }

        let value = match key {
            keys::BANDIT_ENABLED => self.routing.bandit_enabled.to_string(),
            keys::COST_CEILING_USD => return self.routing.cost_ceiling_usd.map(|c| c.to_string()),
            keys::DEFAULT_POLICY => self.routing.default_policy.clone(),

            keys::EPSILON => self.bandit.epsilon.to_string(),
            keys::MIN_EXPLORE_RATE => self.bandit.min_explore_rate.to_string(),
            keys::RESET_ENTROPY_THRESHOLD => self.bandit.reset_entropy_threshold.to_string(),
            keys::RESET_WINDOW => self.bandit.reset_window.to_string(),
            keys::DIMENSION => self.bandit.dimension.to_string(),
            keys::RIDGE => self.bandit.ridge.to_string(),
            keys::LINUCB_ALPHA => self.bandit.linucb_alpha.to_string(),

            keys::WEIGHT_SUCCESS => self.reward.weight_success.to_string(),
            keys::WEIGHT_QUALITY => self.reward.weight_quality.to_string(),
            keys::WEIGHT_COST => self.reward.weight_cost.to_string(),
            keys::WEIGHT_LATENCY => self.reward.weight_latency.to_string(),
            keys::COST_SCALE_USD => self.reward.cost_scale_usd.to_string(),
            keys::LATENCY_SCALE_MS => self.reward.latency_scale_ms.to_string(),

            keys::LEASE_SECS => self.queue.lease_secs.to_string(),
            keys::MAX_ATTEMPTS => self.queue.max_attempts.to_string(),

            keys::POLL_INTERVAL_SECS => self.scheduler.poll_interval_secs.to_string(),
            keys::WATCH_INTERVAL_SECS => self.scheduler.watch_interval_secs.to_string(),

            "storage.database_path" => {
                return self
                    .storage
                    .database_path
                    .as_ref()
                    .map(|p| p.display().to_string());
            }
            _ => return None,
        };
        Some(value)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }
        if Self::is_known_key(key) {
            return Ok("(not set)".to_string());
        }
        Err(anyhow!(
            "Unknown configuration key: {}. Use `switchyard config list` to see available keys.",
            key
        ))
    }

    fn is_known_key(key: &str) -> bool {
        key.starts_with("bandit.dimension.") || Self::list_keys().contains(&key)
    }

    fn list_keys() -> Vec<&'static str> {
        vec![
            keys::BANDIT_ENABLED,
            keys::COST_CEILING_USD,
            keys::DEFAULT_POLICY,
            keys::EPSILON,
            keys::MIN_EXPLORE_RATE,
            keys::RESET_ENTROPY_THRESHOLD,
            keys::RESET_WINDOW,
            keys::DIMENSION,
            keys::RIDGE,
            keys::LINUCB_ALPHA,
            keys::WEIGHT_SUCCESS,
            keys::WEIGHT_QUALITY,
            keys::WEIGHT_COST,
            keys::WEIGHT_LATENCY,
            keys::COST_SCALE_USD,
            keys::LATENCY_SCALE_MS,
            keys::LEASE_SECS,
            keys::MAX_ATTEMPTS,
            keys::POLL_INTERVAL_SECS,
            keys::WATCH_INTERVAL_SECS,
            "storage.database_path",
        ]
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if let Some(tenant) = key.strip_prefix("bandit.dimension.") {
            let dim = parse_positive(key, value)?;
            self.bandit
                .dimension_overrides
                .insert(tenant.to_string(), dim as usize);
            return Ok(());
        }

        match key {
            keys::BANDIT_ENABLED => {
                self.routing.bandit_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid bandit_enabled value: {}", value))?;
            }
            keys::COST_CEILING_USD => {
                if value.is_empty() || value == "none" {
                    self.routing.cost_ceiling_usd = None;
                } else {
                    let ceiling = parse_non_negative(key, value)?;
                    self.routing.cost_ceiling_usd = Some(ceiling);
                }
            }
            keys::DEFAULT_POLICY => {
                if !POLICY_KINDS.contains(&value) {
                    return Err(anyhow!(
                        "Invalid policy: {}. Valid options: {}",
                        value,
                        POLICY_KINDS.join(", ")
                    ));
                }
                self.routing.default_policy = value.to_string();
            }

            keys::EPSILON => self.bandit.epsilon = parse_unit(key, value)?,
            keys::MIN_EXPLORE_RATE => self.bandit.min_explore_rate = parse_unit(key, value)?,
            keys::RESET_ENTROPY_THRESHOLD => {
                self.bandit.reset_entropy_threshold = parse_unit(key, value)?
            }
            keys::RESET_WINDOW => self.bandit.reset_window = parse_positive(key, value)? as usize,
            keys::DIMENSION => self.bandit.dimension = parse_positive(key, value)? as usize,
            keys::RIDGE => {
                let ridge = parse_non_negative(key, value)?;
                if ridge == 0.0 {
                    return Err(anyhow!("{} must be positive", key));
                }
                self.bandit.ridge = ridge;
            }
            keys::LINUCB_ALPHA => self.bandit.linucb_alpha = parse_non_negative(key, value)?,

            keys::WEIGHT_SUCCESS => self.reward.weight_success = parse_non_negative(key, value)?,
            keys::WEIGHT_QUALITY => self.reward.weight_quality = parse_non_negative(key, value)?,
            keys::WEIGHT_COST => self.reward.weight_cost = parse_non_negative(key, value)?,
            keys::WEIGHT_LATENCY => self.reward.weight_latency = parse_non_negative(key, value)?,
            keys::COST_SCALE_USD => self.reward.cost_scale_usd = parse_non_negative(key, value)?,
            keys::LATENCY_SCALE_MS => {
                self.reward.latency_scale_ms = parse_non_negative(key, value)?
            }

            keys::LEASE_SECS => self.queue.lease_secs = parse_positive(key, value)?,
            keys::MAX_ATTEMPTS => self.queue.max_attempts = parse_positive(key, value)? as u32,

            keys::POLL_INTERVAL_SECS => {
                self.scheduler.poll_interval_secs = parse_positive(key, value)?
            }
            keys::WATCH_INTERVAL_SECS => {
                self.scheduler.watch_interval_secs = parse_positive(key, value)?
            }

            "storage.database_path" => {
                self.storage.database_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `switchyard config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut items: Vec<(String, String)> = Self::list_keys()
            .into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect::<anyhow::Result<_>>()?;

        for (tenant, dim) in &self.bandit.dimension_overrides {
            items.push((keys::tenant_dimension(tenant), dim.to_string()));
        }
        Ok(items)
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_unit(key: &str, value: &str) -> anyhow::Result<f64> {
    let parsed: f64 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", key));
    }
    Ok(parsed)
}

fn parse_non_negative(key: &str, value: &str) -> anyhow::Result<f64> {
    let parsed: f64 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(anyhow!("{} must be a non-negative number", key));
    }
    Ok(parsed)
}

fn parse_positive(key: &str, value: &str) -> anyhow::Result<u64> {
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be positive", key));
    }
    Ok(parsed)
}
