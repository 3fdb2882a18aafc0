//! Recall - Call-Level Result Caching
//!
//! Wraps async or blocking operations so repeated calls with equal
//! arguments are answered from a cache instead of being recomputed.
//!
//! # Key Types
//!
//! - `Cache`: process-wide context holding backends, event bus and
//!   in-flight computations
//! - `Cached`: an operation bound to a `Cache` with resolved configuration
//! - `BackendRegistration`: a named store plus its TTL and compression defaults
//! - `SingleFlight`: per-key deduplication of concurrent computations
//!
//! # Call path
//!
//! 1. Derive the key from the operation identity and its arguments
//! 2. Join a running computation for the key, or start one
//! 3. Probe the tiers in order; a hit in a slower tier is copied forward
//! 4. On a miss, execute the operation and write the result through
//!
//! Cache-layer failures are published as `cache_error` events and the
//! operation runs directly. Errors from the operation itself are returned
//! unchanged.

mod admin;
mod cache;
mod orchestrator;
mod registry;
mod single_flight;
pub mod stampede;
mod tags;
pub mod telemetry;
mod wrap;

pub use cache::{Cache, CacheBuilder};
pub use registry::{BackendRegistration, BackendRegistry};
pub use single_flight::SingleFlight;
pub use tags::TagIndex;
pub use wrap::{BlockingFn, CallArgs, Cached};

pub use recall_core::{
    operation_id, ArgValue, Args, CacheConfig, CacheEvent, CacheKey, CacheSettings, CallOptions,
    CircuitBreakerConfig, CircuitState, EventKind, KeyBuilder, OperationId, RecallError, RecallResult,
    StampedeConfig,
};
pub use recall_events::{EventBus, StatsSnapshot};
pub use recall_storage::{LmdbStore, MemoryStore, Store, StoreStats, TierReport};
