//! Named backend registry.
//!
//! Each registered backend gets its own circuit breaker. Registering a name
//! again replaces the store and starts a fresh breaker.

use recall_core::{BackendDefaults, CircuitBreakerConfig, ConfigError, RecallResult};
use recall_storage::{CircuitBreaker, Store, Tier};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// REGISTRATION
// ============================================================================

/// A store plus the overrides that apply when it is the first tier.
#[derive(Clone)]
pub struct BackendRegistration {
    store: Arc<dyn Store>,
    defaults: BackendDefaults,
}

impl BackendRegistration {
    pub fn new(store: impl Store + 'static) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            defaults: BackendDefaults::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.defaults.ttl = Some(ttl);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.defaults.compression = Some(enabled);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn defaults(&self) -> BackendDefaults {
        self.defaults
    }
}

impl std::fmt::Debug for BackendRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistration")
            .field("kind", &self.store.kind())
            .field("defaults", &self.defaults)
            .finish()
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

struct Registered {
    registration: BackendRegistration,
    breaker: Arc<CircuitBreaker>,
}

/// Backends known to one cache context.
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Registered>>,
    breaker_config: CircuitBreakerConfig,
}

impl BackendRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            breaker_config,
        }
    }

    /// Register `registration` under `name`. Returns the replaced one, if any.
    pub fn register(&self, name: impl Into<String>, registration: BackendRegistration) -> Option<BackendRegistration> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), self.breaker_config.clone()));
        let Ok(mut backends) = self.backends.write() else {
            return None;
        };
        backends
            .insert(name, Registered { registration, breaker })
            .map(|previous| previous.registration)
    }

    pub fn remove(&self, name: &str) -> Option<BackendRegistration> {
        self.backends
            .write()
            .ok()
            .and_then(|mut backends| backends.remove(name))
            .map(|removed| removed.registration)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends
            .read()
            .map(|backends| backends.contains_key(name))
            .unwrap_or(false)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .map(|backends| backends.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn defaults(&self, name: &str) -> Option<BackendDefaults> {
        let backends = self.backends.read().ok()?;
        backends.get(name).map(|r| r.registration.defaults())
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let backends = self.backends.read().ok()?;
        backends.get(name).map(|r| Arc::clone(&r.breaker))
    }

    pub fn tier(&self, name: &str) -> RecallResult<Tier> {
        let backends = self.backends.read().map_err(|_| ConfigError::MissingBackend {
            name: name.to_string(),
        })?;
        let registered = backends.get(name).ok_or_else(|| ConfigError::MissingBackend {
            name: name.to_string(),
        })?;
        Ok(Tier::new(
            name,
            Arc::clone(registered.registration.store()),
            Arc::clone(&registered.breaker),
        ))
    }

    /// Every registered backend as a tier, sorted by name.
    pub fn all_tiers(&self) -> Vec<Tier> {
        self.names()
            .iter()
            .filter_map(|name| self.tier(name).ok())
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .field("breaker_config", &self.breaker_config)
            .finish()
    }
}
