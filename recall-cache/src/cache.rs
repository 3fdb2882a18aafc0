//! The process-wide cache context.
//!
//! A [`Cache`] owns everything a call needs: settings, the backend
//! registry, the event bus, the single-flight table and the tag index.
//! It is built once at startup and shared by cloning; clones are cheap
//! handles to the same state.

use crate::registry::{BackendRegistration, BackendRegistry};
use crate::single_flight::SingleFlight;
use crate::tags::TagIndex;
use recall_core::{
    CacheConfig, CacheEvent, CacheKey, CacheSettings, CallOptions, ConfigError, EventKind, OperationId,
    RecallResult, ADMIN_FUNCTION,
};
use recall_events::{EventBus, LoggingSubscriber, StatsCollector};
use recall_storage::{LmdbStore, MemoryStore, TieredRouter};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub(crate) struct CacheInner {
    pub(crate) settings: CacheSettings,
    pub(crate) registry: BackendRegistry,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) stats: Arc<StatsCollector>,
    pub(crate) flights: SingleFlight<CacheKey>,
    /// Keys with a background refresh running.
    pub(crate) refreshing: Mutex<HashSet<CacheKey>>,
    pub(crate) tags: TagIndex,
}

/// Handle to a cache context.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl Cache {
    pub fn builder(settings: CacheSettings) -> CacheBuilder {
        CacheBuilder::new(settings)
    }

    /// Build a context with only the default backend.
    pub fn new(settings: CacheSettings) -> RecallResult<Self> {
        CacheBuilder::new(settings).build()
    }

    /// Build a context from `RECALL_*` environment variables.
    pub fn from_env() -> RecallResult<Self> {
        Self::new(CacheSettings::from_env())
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    /// Register a backend after construction.
    ///
    /// Operations wrapped earlier keep the stores they resolved.
    pub fn register_backend(&self, name: impl Into<String>, registration: BackendRegistration) {
        let name = name.into();
        let kind = registration.store().kind().to_string();
        if self.inner.registry.register(name.clone(), registration).is_some() {
            tracing::info!(backend = %name, kind = %kind, "Replaced backend registration");
        } else {
            tracing::info!(backend = %name, kind = %kind, "Registered backend");
        }
        self.inner
            .bus
            .publish(CacheEvent::new(EventKind::BackendInit, ADMIN_FUNCTION).with_backend(name));
    }

    /// Resolve the configuration of one operation against this context.
    pub fn resolve(&self, operation: &OperationId, options: &CallOptions) -> RecallResult<CacheConfig> {
        let registry = &self.inner.registry;
        CacheConfig::resolve(operation, options, &self.inner.settings, |name| registry.defaults(name))
    }

    /// Router over the tiers named by `config`.
    pub fn router_for(&self, config: &CacheConfig) -> RecallResult<TieredRouter> {
        self.router_over(config.tiers())
    }

    pub(crate) fn router_over(&self, names: &[String]) -> RecallResult<TieredRouter> {
        let tiers = names
            .iter()
            .map(|name| self.inner.registry.tier(name))
            .collect::<RecallResult<Vec<_>>>()?;
        TieredRouter::new(tiers, Arc::clone(&self.inner.bus), self.inner.settings.store_timeout)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("default_backend", &self.inner.settings.default_backend)
            .field("backends", &self.inner.registry)
            .field("in_flight", &self.inner.flights.in_flight())
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for a [`Cache`].
pub struct CacheBuilder {
    settings: CacheSettings,
    backends: Vec<(String, BackendRegistration)>,
    bus: Option<Arc<EventBus>>,
    event_logging: bool,
}

impl CacheBuilder {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            backends: Vec::new(),
            bus: None,
            event_logging: true,
        }
    }

    pub fn backend(mut self, name: impl Into<String>, registration: BackendRegistration) -> Self {
        self.backends.push((name.into(), registration));
        self
    }

    /// Publish on an existing bus instead of a fresh one.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Do not install the subscriber that logs error events.
    pub fn without_event_logging(mut self) -> Self {
        self.event_logging = false;
        self
    }

    pub fn build(self) -> RecallResult<Cache> {
        self.settings.validate()?;

        let bus = self.bus.unwrap_or_default();
        let (stats, _) = StatsCollector::attach(&bus);
        if self.event_logging {
            LoggingSubscriber::errors_only().install(&bus);
        }

        let registry = BackendRegistry::new(self.settings.circuit_breaker.clone());
        let mut names: Vec<String> = Vec::with_capacity(self.backends.len() + 1);
        for (name, registration) in self.backends {
            registry.register(name.clone(), registration);
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let default_backend = self.settings.default_backend.clone();
        if !registry.contains(&default_backend) {
            let registration = builtin_backend(&self.settings)?;
            registry.register(default_backend.clone(), registration);
            names.push(default_backend);
        }

        let cache = Cache {
            inner: Arc::new(CacheInner {
                settings: self.settings,
                registry,
                bus,
                stats,
                flights: SingleFlight::new(),
                refreshing: Mutex::new(HashSet::new()),
                tags: TagIndex::new(),
            }),
        };

        for name in names {
            tracing::debug!(backend = %name, "Backend ready");
            cache
                .inner
                .bus
                .publish(CacheEvent::new(EventKind::BackendInit, ADMIN_FUNCTION).with_backend(name));
        }
        tracing::info!(
            default_backend = %cache.inner.settings.default_backend,
            backends = ?cache.inner.registry.names(),
            "Cache initialized"
        );
        Ok(cache)
    }
}

/// Store for a default backend name that was not registered explicitly.
fn builtin_backend(settings: &CacheSettings) -> RecallResult<BackendRegistration> {
    match settings.default_backend.as_str() {
        "memory" => {
            let store = match settings.max_size {
                Some(max) => MemoryStore::new().with_max_size(max),
                None => MemoryStore::new(),
            };
            Ok(BackendRegistration::new(store))
        }
        "lmdb" => {
            let path = settings.base_path.join("lmdb");
            let store = LmdbStore::open(&path, settings.lmdb_map_size_mb)?;
            Ok(BackendRegistration::new(store))
        }
        other => Err(ConfigError::MissingBackend {
            name: other.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::RecallError;
    use std::time::Duration;

    #[test]
    fn test_default_backend_is_created() {
        let cache = Cache::new(CacheSettings::default()).expect("cache should build");
        assert_eq!(cache.backends().names(), vec!["memory".to_string()]);
        assert_eq!(cache.inner.stats.snapshot().backends_open, 1);
    }

    #[test]
    fn test_unknown_default_backend_fails() {
        let settings = CacheSettings {
            default_backend: "redis".to_string(),
            ..CacheSettings::default()
        };
        let err = Cache::new(settings).expect_err("unknown default backend should fail");
        assert_eq!(
            err,
            RecallError::Config(ConfigError::MissingBackend {
                name: "redis".to_string()
            })
        );
    }

    #[test]
    fn test_explicit_default_backend_is_used() {
        let settings = CacheSettings {
            default_backend: "redis".to_string(),
            ..CacheSettings::default()
        };
        let cache = Cache::builder(settings)
            .backend("redis", BackendRegistration::new(MemoryStore::new()))
            .build()
            .expect("cache should build");
        assert_eq!(cache.backends().names(), vec!["redis".to_string()]);
    }

    #[test]
    fn test_invalid_settings_fail_build() {
        let settings = CacheSettings {
            store_timeout: Duration::ZERO,
            ..CacheSettings::default()
        };
        assert!(Cache::new(settings).is_err());
    }

    #[test]
    fn test_lmdb_default_backend() {
        let dir = tempfile::TempDir::new().expect("tempdir should be created");
        let settings = CacheSettings {
            default_backend: "lmdb".to_string(),
            base_path: dir.path().to_path_buf(),
            lmdb_map_size_mb: 10,
            ..CacheSettings::default()
        };
        let cache = Cache::new(settings).expect("cache should build");
        assert!(cache.backends().contains("lmdb"));
        assert!(dir.path().join("lmdb").exists());
    }

    #[test]
    fn test_resolve_and_router() {
        let cache = Cache::builder(CacheSettings::default())
            .backend("disk", BackendRegistration::new(MemoryStore::new()).with_ttl(Duration::from_secs(9)))
            .build()
            .expect("cache should build");
        let op = OperationId::new("tests", "f");
        let config = cache
            .resolve(&op, &CallOptions::new().with_tiers(["memory", "disk"]))
            .expect("resolve should succeed");
        let router = cache.router_for(&config).expect("router should build");
        assert_eq!(router.len(), 2);

        let err = cache
            .resolve(&op, &CallOptions::new().with_backend("missing"))
            .expect_err("missing backend should fail");
        assert_eq!(err.type_name(), "ConfigError");
    }

    #[test]
    fn test_register_backend_publishes_init() {
        let cache = Cache::new(CacheSettings::default()).expect("cache should build");
        cache.register_backend("extra", BackendRegistration::new(MemoryStore::new()));
        assert!(cache.backends().contains("extra"));
        assert_eq!(cache.inner.stats.snapshot().backends_open, 2);
    }
}
