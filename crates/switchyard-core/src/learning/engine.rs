use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::PolicyRegistry;
use crate::bandit::{Arm, BanditPolicy, Context, PolicyKind, PolicySnapshot, PolicySpec};
use crate::config::{ConfigSource, keys};
use crate::error::{Error, Result};
use crate::metrics::{self, SharedMetrics};
use crate::storage::{SnapshotKey, SnapshotStore};

/// Central call site for domain decisions
///
/// Policies are created lazily from a per-domain [`PolicySpec`] (or the
/// default spec) on first use. Persistence is best effort: failures are
/// logged and counted, and decisions keep running in memory.
#[derive(Debug)]
pub struct LearningEngine {
    registry: Arc<PolicyRegistry>,
    default_spec: Option<PolicySpec>,
    domain_specs: RwLock<HashMap<String, PolicySpec>>,
    tenant: Option<String>,
    config: Arc<dyn ConfigSource>,
    metrics: SharedMetrics,
    store: Option<SnapshotStore>,
}

impl LearningEngine {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            registry: Arc::new(PolicyRegistry::new()),
            default_spec: None,
            domain_specs: RwLock::new(HashMap::new()),
            tenant: None,
            config,
            metrics: metrics::noop(),
            store: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Scope snapshots and dimension overrides to one tenant
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Spec used for domains without their own
    pub fn with_default_spec(mut self, spec: PolicySpec) -> Self {
        self.default_spec = Some(spec);
        self
    }

    /// Spec for one domain; takes effect when the domain is first used
    pub fn configure_domain(&self, domain: &str, spec: PolicySpec) {
        let mut specs = self
            .domain_specs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        specs.insert(domain.to_string(), spec);
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    fn spec_for(&self, domain: &str) -> PolicySpec {
        let specs = self
            .domain_specs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(spec) = specs.get(domain) {
            return spec.clone();
        }
        if let Some(spec) = &self.default_spec {
            return spec.clone();
        }

        let kind = self
            .config
            .get(keys::DEFAULT_POLICY)
            .and_then(|k| k.parse::<PolicyKind>().ok())
            .unwrap_or_default();
        PolicySpec::from_config(kind, self.config.as_ref(), self.tenant.as_deref())
    }

    /// Policy for `domain`, created on first use
    pub fn policy(&self, domain: &str) -> Result<Arc<dyn BanditPolicy>> {
        self.registry.get_or_insert_with(domain, || {
            self.spec_for(domain)
                .build(self.config.clone(), self.metrics.clone())
        })
    }

    pub fn recommend(&self, domain: &str, arms: &[Arm], context: Option<&Context>) -> Result<Arm> {
        let arm = self.policy(domain)?.recommend(arms, context)?;
        debug!(domain = %domain, arm = %arm, candidates = arms.len(), "Recommended arm");
        Ok(arm)
    }

    pub fn record(
        &self,
        domain: &str,
        arm: &str,
        reward: f64,
        context: Option<&Context>,
    ) -> Result<()> {
        self.policy(domain)?.update(arm, reward, context)?;
        debug!(domain = %domain, arm = %arm, reward = reward, "Recorded reward");
        Ok(())
    }

    /// Current state of a registered domain
    pub fn snapshot(&self, domain: &str) -> Result<PolicySnapshot> {
        self.registry
            .get(domain)
            .map(|p| p.state_dict())
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))
    }

    fn key_for(&self, domain: &str, policy: &dyn BanditPolicy) -> SnapshotKey {
        SnapshotKey {
            domain: domain.to_string(),
            tenant: self.tenant.clone(),
            dimension: policy.dimension().unwrap_or(0),
        }
    }

    fn persistence_failed(&self, domain: &str, error: &Error) {
        warn!(
            domain = %domain,
            error = %error,
            code = error.code(),
            "Policy persistence failed, continuing in memory"
        );
        self.metrics
            .increment("persistence.failures", &[("domain", domain)], 1);
    }

    /// Save one domain. Returns whether a snapshot was written.
    pub async fn persist(&self, domain: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let Some(policy) = self.registry.get(domain) else {
            return false;
        };

        // Snapshot first so no policy lock is held across the write
        let key = self.key_for(domain, policy.as_ref());
        let snapshot = policy.state_dict();
        match store.save(&key, &snapshot).await {
            Ok(()) => true,
            Err(e) => {
                self.persistence_failed(domain, &e);
                false
            }
        }
    }

    /// Save every registered domain in one transaction. Returns the number saved.
    pub async fn persist_all(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let batch: Vec<(SnapshotKey, PolicySnapshot)> = self
            .registry
            .domains()
            .into_iter()
            .filter_map(|domain| {
                let policy = self.registry.get(&domain)?;
                Some((self.key_for(&domain, policy.as_ref()), policy.state_dict()))
            })
            .collect();

        match store.save_all(&batch).await {
            Ok(()) => {
                info!(count = batch.len(), "Persisted policy snapshots");
                batch.len()
            }
            Err(e) => {
                self.persistence_failed("*", &e);
                0
            }
        }
    }

    /// Load the stored snapshot for `domain` into its policy.
    ///
    /// Returns `Ok(false)` when there is no store or no snapshot. A snapshot
    /// whose dimension disagrees with the policy is an error; other storage
    /// failures are logged and treated as "nothing restored".
    pub async fn restore(&self, domain: &str) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let policy = self.policy(domain)?;
        let key = self.key_for(domain, policy.as_ref());

        let snapshot = match store.load(&key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                if policy.dimension().is_some() {
                    if let Ok(other) = store.dimensions(domain, self.tenant.as_deref()).await {
                        if !other.is_empty() {
                            info!(
                                domain = %domain,
                                dimension = key.dimension,
                                stored = ?other,
                                "No snapshot for this dimension; other dimensions left untouched"
                            );
                        }
                    }
                }
                return Ok(false);
            }
            Err(e @ Error::DimensionMismatch { .. }) => return Err(e),
            Err(e) => {
                self.persistence_failed(domain, &e);
                return Ok(false);
            }
        };

        policy.load_state(snapshot)?;
        info!(domain = %domain, key = %key, "Restored policy snapshot");
        Ok(true)
    }
}
