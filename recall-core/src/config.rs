//! Configuration types for recall
//!
//! Three layers feed a call's [`CacheConfig`]:
//!
//! 1. [`CallOptions`] given when an operation is wrapped
//! 2. [`BackendDefaults`] registered alongside the backend of the first tier
//! 3. Global [`CacheSettings`]
//!
//! The first layer that sets a value wins. Resolution happens once, at wrap
//! time, so an unknown backend is reported before any call is made.

use crate::key::{KeyBuilder, KeyPolicy, OperationId, DEFAULT_KEY_PREFIX};
use crate::{ConfigError, RecallError, RecallResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BACKEND: &str = "memory";
pub const DEFAULT_TTL_SECS: u64 = 3600;
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_STAMPEDE_WINDOW: f64 = 0.1;
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 256;
pub const DEFAULT_BASE_PATH: &str = ".cache/recall";

// ============================================================================
// CIRCUIT BREAKER CONFIG
// ============================================================================

/// Circuit breaker tuning, shared by every backend's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            timeout: Duration::from_secs(DEFAULT_CIRCUIT_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
        }
    }

    /// Read `RECALL_CIRCUIT_BREAKER_THRESHOLD` and `RECALL_CIRCUIT_BREAKER_TIMEOUT` (seconds).
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).map(|s| s.trim().to_string());
        Self {
            failure_threshold: parsed("RECALL_CIRCUIT_BREAKER_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CIRCUIT_FAILURE_THRESHOLD),
            timeout: Duration::from_secs(
                parsed("RECALL_CIRCUIT_BREAKER_TIMEOUT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CIRCUIT_TIMEOUT_SECS),
            ),
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        if self.failure_threshold == 0 {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "circuit_breaker.failure_threshold".to_string(),
                value: self.failure_threshold.to_string(),
                reason: "failure_threshold must be greater than 0".to_string(),
            }));
        }
        if self.timeout.is_zero() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "circuit_breaker.timeout".to_string(),
                value: format!("{:?}", self.timeout),
                reason: "timeout must be positive".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// STAMPEDE CONFIG
// ============================================================================

/// Probabilistic early refresh of entries close to expiry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StampedeConfig {
    pub enabled: bool,
    /// Final fraction of the TTL during which hits may trigger a refresh.
    pub window: f64,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: DEFAULT_STAMPEDE_WINDOW,
        }
    }
}

impl StampedeConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            window: DEFAULT_STAMPEDE_WINDOW,
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        if !(0.0..=1.0).contains(&self.window) {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "stampede.window".to_string(),
                value: self.window.to_string(),
                reason: "window must be between 0.0 and 1.0".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// GLOBAL SETTINGS
// ============================================================================

/// Process-wide defaults, usually read from `RECALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub default_backend: String,
    /// `None` means entries never expire.
    pub ttl: Option<Duration>,
    pub key_prefix: String,
    /// Entry limit for the in-memory backend.
    pub max_size: Option<usize>,
    pub compression: bool,
    /// Root directory for disk-backed stores.
    pub base_path: PathBuf,
    pub lmdb_map_size_mb: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub lock_timeout: Duration,
    /// Deadline applied to every individual store call.
    pub store_timeout: Duration,
    pub stampede: StampedeConfig,
    pub log_level: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_backend: DEFAULT_BACKEND.to_string(),
            ttl: Some(Duration::from_secs(DEFAULT_TTL_SECS)),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_size: None,
            compression: false,
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
            circuit_breaker: CircuitBreakerConfig::default(),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            stampede: StampedeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl CacheSettings {
    /// Load settings from `RECALL_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).map(|s| s.trim().to_string());

        let ttl = match parsed("RECALL_TTL").as_deref() {
            Some("0") | Some("none") | Some("never") => None,
            Some(raw) => raw
                .parse()
                .ok()
                .map(Duration::from_secs)
                .or(defaults.ttl),
            None => defaults.ttl,
        };

        let circuit_breaker = CircuitBreakerConfig::from_lookup(&lookup);

        let stampede = StampedeConfig {
            enabled: parsed("RECALL_STAMPEDE")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.stampede.enabled),
            window: parsed("RECALL_STAMPEDE_WINDOW")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stampede.window),
        };

        Self {
            default_backend: parsed("RECALL_BACKEND").unwrap_or(defaults.default_backend),
            ttl,
            key_prefix: parsed("RECALL_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_size: parsed("RECALL_MAX_SIZE").and_then(|s| s.parse().ok()),
            compression: parsed("RECALL_COMPRESSION")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.compression),
            base_path: parsed("RECALL_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),
            lmdb_map_size_mb: parsed("RECALL_LMDB_MAP_SIZE_MB")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lmdb_map_size_mb),
            circuit_breaker,
            lock_timeout: parsed("RECALL_LOCK_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            store_timeout: parsed("RECALL_STORE_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            stampede,
            log_level: parsed("RECALL_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        if self.default_backend.is_empty() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "default_backend".to_string(),
                value: String::new(),
                reason: "default_backend must not be empty".to_string(),
            }));
        }
        if let Some(ttl) = self.ttl {
            if ttl.is_zero() {
                return Err(RecallError::Config(ConfigError::InvalidValue {
                    field: "ttl".to_string(),
                    value: format!("{:?}", ttl),
                    reason: "ttl must be positive; use None for entries that never expire".to_string(),
                }));
            }
        }
        if self.max_size == Some(0) {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "max_size".to_string(),
                value: "0".to_string(),
                reason: "max_size must be greater than 0".to_string(),
            }));
        }
        if self.lmdb_map_size_mb == 0 {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "lmdb_map_size_mb must be greater than 0".to_string(),
            }));
        }
        if self.lock_timeout.is_zero() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: format!("{:?}", self.lock_timeout),
                reason: "lock_timeout must be positive".to_string(),
            }));
        }
        if self.store_timeout.is_zero() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "store_timeout".to_string(),
                value: format!("{:?}", self.store_timeout),
                reason: "store_timeout must be positive".to_string(),
            }));
        }
        self.circuit_breaker.validate()?;
        self.stampede.validate()?;
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// PER-CALL OPTIONS
// ============================================================================

/// Options given when an operation is wrapped. Every field is optional.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub ttl: Option<Duration>,
    /// Store entries without expiry regardless of other layers.
    pub no_expiry: bool,
    pub backend: Option<String>,
    /// Ordered tier list, fastest first. Takes precedence over `backend`.
    pub tiers: Option<Vec<String>>,
    pub key_prefix: Option<String>,
    pub exclude: BTreeSet<String>,
    pub signature: Vec<String>,
    pub key_builder: Option<Arc<dyn KeyBuilder>>,
    pub tags: BTreeSet<String>,
    pub compression: Option<bool>,
    pub distributed_lock: Option<bool>,
    pub lock_timeout: Option<Duration>,
    pub stampede: Option<StampedeConfig>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn without_expiry(mut self) -> Self {
        self.no_expiry = true;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_tiers<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tiers = Some(tiers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Name the parameters by position so positional arguments can be excluded.
    pub fn with_signature<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signature = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    pub fn with_key_builder(mut self, builder: impl KeyBuilder + 'static) -> Self {
        self.key_builder = Some(Arc::new(builder));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = Some(enabled);
        self
    }

    pub fn with_distributed_lock(mut self, timeout: Duration) -> Self {
        self.distributed_lock = Some(true);
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_stampede(mut self, stampede: StampedeConfig) -> Self {
        self.stampede = Some(stampede);
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("ttl", &self.ttl)
            .field("no_expiry", &self.no_expiry)
            .field("backend", &self.backend)
            .field("tiers", &self.tiers)
            .field("key_prefix", &self.key_prefix)
            .field("exclude", &self.exclude)
            .field("signature", &self.signature)
            .field("custom_key_builder", &self.key_builder.is_some())
            .field("tags", &self.tags)
            .field("compression", &self.compression)
            .field("distributed_lock", &self.distributed_lock)
            .field("lock_timeout", &self.lock_timeout)
            .field("stampede", &self.stampede)
            .finish()
    }
}

/// Overrides registered alongside a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendDefaults {
    pub ttl: Option<Duration>,
    pub compression: Option<bool>,
}

// ============================================================================
// RESOLVED CONFIG
// ============================================================================

/// Immutable configuration for one wrapped operation.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    ttl: Option<Duration>,
    tiers: Vec<String>,
    key: KeyPolicy,
    tags: BTreeSet<String>,
    compression: bool,
    distributed_lock: bool,
    lock_timeout: Duration,
    stampede: StampedeConfig,
}

impl CacheConfig {
    /// Merge options, backend defaults and settings.
    ///
    /// `lookup` answers whether a backend name is registered and with which
    /// defaults. Every tier must be registered.
    pub fn resolve<F>(
        operation: &OperationId,
        options: &CallOptions,
        settings: &CacheSettings,
        lookup: F,
    ) -> RecallResult<Self>
    where
        F: Fn(&str) -> Option<BackendDefaults>,
    {
        let tiers: Vec<String> = match (&options.tiers, &options.backend) {
            (Some(tiers), _) => tiers.clone(),
            (None, Some(backend)) => vec![backend.clone()],
            (None, None) => vec![settings.default_backend.clone()],
        };
        if tiers.is_empty() {
            return Err(RecallError::Config(ConfigError::NoTiers {
                function: operation.to_string(),
            }));
        }
        let unique: BTreeSet<&String> = tiers.iter().collect();
        if unique.len() != tiers.len() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "tiers".to_string(),
                value: tiers.join(","),
                reason: "a backend may appear only once in a tier list".to_string(),
            }));
        }

        let mut first_defaults = None;
        for name in &tiers {
            let defaults = lookup(name)
                .ok_or_else(|| ConfigError::MissingBackend { name: name.clone() })?;
            first_defaults.get_or_insert(defaults);
        }
        let backend_defaults = first_defaults.unwrap_or_default();

        if let Some(ttl) = options.ttl {
            if ttl.is_zero() {
                return Err(RecallError::Config(ConfigError::InvalidValue {
                    field: "ttl".to_string(),
                    value: format!("{:?}", ttl),
                    reason: "ttl must be positive".to_string(),
                }));
            }
        }
        let ttl = if options.no_expiry {
            None
        } else {
            options.ttl.or(backend_defaults.ttl).or(settings.ttl)
        };

        let stampede = options.stampede.unwrap_or(settings.stampede);
        stampede.validate()?;

        let lock_timeout = options.lock_timeout.unwrap_or(settings.lock_timeout);
        if lock_timeout.is_zero() {
            return Err(RecallError::Config(ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: format!("{:?}", lock_timeout),
                reason: "lock_timeout must be positive".to_string(),
            }));
        }

        Ok(Self {
            ttl,
            tiers,
            key: KeyPolicy {
                prefix: options
                    .key_prefix
                    .clone()
                    .unwrap_or_else(|| settings.key_prefix.clone()),
                exclusions: options.exclude.clone(),
                signature: options.signature.clone(),
                builder: options.key_builder.clone(),
            },
            tags: options.tags.clone(),
            compression: options
                .compression
                .or(backend_defaults.compression)
                .unwrap_or(settings.compression),
            distributed_lock: options.distributed_lock.unwrap_or(false),
            lock_timeout,
            stampede,
        })
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Backend names, tier 0 first.
    pub fn tiers(&self) -> &[String] {
        &self.tiers
    }

    pub fn key_policy(&self) -> &KeyPolicy {
        &self.key
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn distributed_lock(&self) -> bool {
        self.distributed_lock
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn stampede(&self) -> StampedeConfig {
        self.stampede
    }
}
