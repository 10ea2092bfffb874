use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::bandit::BanditPolicy;
use crate::error::{Error, Result};

/// Domain name to policy, one policy per domain
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<dyn BanditPolicy>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy for a new domain. Fails if the domain is taken.
    pub fn register(&self, domain: &str, policy: Arc<dyn BanditPolicy>) -> Result<()> {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        if policies.contains_key(domain) {
            return Err(Error::DomainAlreadyRegistered(domain.to_string()));
        }
        debug!(domain = %domain, kind = %policy.kind(), "Registered policy");
        policies.insert(domain.to_string(), policy);
        Ok(())
    }

    /// Swap the policy for `domain`, returning the previous one
    pub fn replace(
        &self,
        domain: &str,
        policy: Arc<dyn BanditPolicy>,
    ) -> Option<Arc<dyn BanditPolicy>> {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        let kind = policy.kind();
        let previous = policies.insert(domain.to_string(), policy);
        info!(
            domain = %domain,
            kind = %kind,
            replaced = previous.is_some(),
            "Replaced domain policy"
        );
        previous
    }

    pub fn get(&self, domain: &str) -> Option<Arc<dyn BanditPolicy>> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        policies.get(domain).cloned()
    }

    /// Existing policy for `domain`, or one built by `factory` and registered.
    ///
    /// The factory runs at most once per domain even under concurrent callers.
    pub fn get_or_insert_with<F>(&self, domain: &str, factory: F) -> Result<Arc<dyn BanditPolicy>>
    where
        F: FnOnce() -> Result<Arc<dyn BanditPolicy>>,
    {
        if let Some(policy) = self.get(domain) {
            return Ok(policy);
        }

        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(policy) = policies.get(domain) {
            return Ok(policy.clone());
        }
        let policy = factory()?;
        debug!(domain = %domain, kind = %policy.kind(), "Lazily registered policy");
        policies.insert(domain.to_string(), policy.clone());
        Ok(policy)
    }

    pub fn remove(&self, domain: &str) -> Option<Arc<dyn BanditPolicy>> {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        policies.remove(domain)
    }

    /// Registered domains, sorted
    pub fn domains(&self) -> Vec<String> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        let mut domains: Vec<String> = policies.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::{EpsilonGreedy, PolicyKind, Ucb1};

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = PolicyRegistry::new();
        registry
            .register("model_selection", Arc::new(Ucb1::new()))
            .unwrap();
        let err = registry
            .register("model_selection", Arc::new(EpsilonGreedy::greedy()))
            .unwrap_err();
        assert!(matches!(err, Error::DomainAlreadyRegistered(d) if d == "model_selection"));
        assert_eq!(
            registry.get("model_selection").unwrap().kind(),
            PolicyKind::Ucb1
        );
    }

    #[test]
    fn test_replace_is_explicit() {
        let registry = PolicyRegistry::new();
        assert!(registry.replace("tools", Arc::new(Ucb1::new())).is_none());
        let old = registry
            .replace("tools", Arc::new(EpsilonGreedy::greedy()))
            .unwrap();
        assert_eq!(old.kind(), PolicyKind::Ucb1);
        assert_eq!(registry.get("tools").unwrap().kind(), PolicyKind::EpsilonGreedy);
    }

    #[test]
    fn test_get_or_insert_runs_factory_once() {
        let registry = PolicyRegistry::new();
        let mut calls = 0;
        registry
            .get_or_insert_with("a", || {
                calls += 1;
                Ok(Arc::new(Ucb1::new()) as Arc<dyn BanditPolicy>)
            })
            .unwrap();
        registry
            .get_or_insert_with("a", || {
                calls += 1;
                Ok(Arc::new(Ucb1::new()) as Arc<dyn BanditPolicy>)
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_factory_error_leaves_domain_empty() {
        let registry = PolicyRegistry::new();
        let result = registry
            .get_or_insert_with("bad", || Err(Error::InvalidArgument("nope".to_string())));
        assert!(result.is_err());
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn test_domains_sorted_and_remove() {
        let registry = PolicyRegistry::new();
        for d in ["zeta", "alpha", "mid"] {
            registry.register(d, Arc::new(Ucb1::new())).unwrap();
        }
        assert_eq!(registry.domains(), vec!["alpha", "mid", "zeta"]);
        assert!(registry.remove("mid").is_some());
        assert_eq!(registry.len(), 2);
    }
}
