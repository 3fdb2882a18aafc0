//! Recall Core - Shared Types
//!
//! Cache keys, errors, settings and event payloads used by every other
//! recall crate. Nothing in here performs I/O.

mod circuit;
mod config;
mod error;
mod event;
mod key;

pub use circuit::CircuitState;
pub use config::{
    BackendDefaults, CacheConfig, CacheSettings, CallOptions, CircuitBreakerConfig, StampedeConfig,
    DEFAULT_BACKEND, DEFAULT_BASE_PATH, DEFAULT_CIRCUIT_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_TIMEOUT_SECS,
    DEFAULT_LMDB_MAP_SIZE_MB, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_STAMPEDE_WINDOW, DEFAULT_STORE_TIMEOUT_MS,
    DEFAULT_TTL_SECS,
};
pub use error::{
    BackendError, CircuitOpenError, ConfigError, EventError, KeyGenerationError, LockError, RecallError,
    RecallResult, StoreOp,
};
pub use event::{CacheEvent, EventKind, ADMIN_FUNCTION};
pub use key::{
    canonical_key, generate_key, ArgValue, Args, CacheKey, KeyBuilder, KeyPolicy, OperationId, DEFAULT_KEY_PREFIX,
};
