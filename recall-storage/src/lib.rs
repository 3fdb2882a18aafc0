//! Recall Storage - Stores and Tier Routing
//!
//! # Key Types
//!
//! - `Store`: byte-level key/value store implemented by every backend
//! - `MemoryStore`: in-process store with TTL, LRU capacity and lease locks
//! - `LmdbStore`: persistent store on LMDB
//! - `CircuitBreaker`: per-backend failure isolation
//! - `TieredRouter`: read-through promotion and write-through across tiers
//! - `CacheEntry`: binary envelope carrying creation time, TTL and tags

mod breaker;
pub mod codec;
mod entry;
mod lmdb;
mod memory;
mod store;
mod tiered;

pub use breaker::{BreakerPermit, CircuitBreaker};
pub use entry::{CacheEntry, EntryHeader, ENTRY_MAGIC, ENTRY_VERSION};
pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::MemoryStore;
pub use store::{Store, StoreLock, StoreStats};
pub use tiered::{Tier, TierFailure, TierHit, TierLock, TierReport, TieredRouter};
