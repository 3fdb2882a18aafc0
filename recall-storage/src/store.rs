//! Store trait implemented by every cache backend.
//!
//! A store maps keys to opaque byte values with an optional TTL. It knows
//! nothing about serialization, tiers or circuit breaking; those live above
//! it in the router.

use async_trait::async_trait;
use recall_core::{BackendError, CacheKey, LockError, RecallResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters reported by a store about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of lookups that found a live value.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
    /// Approximate size of held values in bytes.
    pub size_bytes: u64,
    /// Number of entries dropped to respect a capacity limit.
    pub evictions: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Byte-level key/value store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short name of the store implementation, e.g. `memory`.
    fn kind(&self) -> &str;

    /// Fetch a value. Expired values are reported as absent.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store a value. `None` TTL means the value never expires.
    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError>;

    /// Remove every value.
    async fn clear(&self) -> Result<(), BackendError>;

    /// Take an exclusive lock on `key`, waiting up to `timeout`.
    ///
    /// Stores without lock support keep the default, which reports
    /// [`LockError::Unsupported`].
    async fn acquire_lock(&self, key: &CacheKey, timeout: Duration) -> RecallResult<Box<dyn StoreLock>> {
        let _ = (key, timeout);
        Err(LockError::Unsupported {
            backend: self.kind().to_string(),
        }
        .into())
    }

    /// Drop expired values. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, BackendError> {
        Ok(0)
    }

    async fn stats(&self) -> Result<StoreStats, BackendError> {
        Ok(StoreStats::default())
    }

    /// Release resources. The store is not used afterwards.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A held lock. Dropping it without calling `release` leaves the lock to
/// expire on its own lease.
#[async_trait]
pub trait StoreLock: Send + Sync {
    fn key(&self) -> &CacheKey;

    async fn release(self: Box<Self>) -> Result<(), BackendError>;
}
