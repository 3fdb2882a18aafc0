//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped
//! key/value file that survives restarts and is shared by every process
//! opening the same directory.
//!
//! # Value Format
//!
//! ```text
//! [expires_at ms: i64 LE, 0 = never][value bytes]
//! ```
//!
//! Expired values are hidden on read and physically removed by
//! [`Store::purge_expired`].

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use recall_core::{BackendError, CacheKey, RecallError, StoreOp};

use crate::store::{Store, StoreStats};

const STORE_KIND: &str = "lmdb";
const EXPIRY_LEN: usize = 8;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored value is shorter than its expiry prefix.
    #[error("Malformed value: {0}")]
    Malformed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmdbStoreError {
    fn during(self, operation: StoreOp) -> BackendError {
        BackendError::OperationFailed {
            backend: STORE_KIND.to_string(),
            operation,
            reason: self.to_string(),
        }
    }
}

/// Convert LmdbStoreError to RecallError.
impl From<LmdbStoreError> for RecallError {
    fn from(e: LmdbStoreError) -> Self {
        RecallError::Backend(e.during(StoreOp::Open))
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Persistent store in an LMDB environment.
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    stats: RwLock<StoreStats>,
}

impl LmdbStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(StoreStats::default()),
        })
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
        let expires_at = ttl
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .map_or(0, |at| at.timestamp_millis());
        let mut out = Vec::with_capacity(EXPIRY_LEN + value.len());
        out.extend_from_slice(&expires_at.to_le_bytes());
        out.extend_from_slice(value);
        out
    }

    /// Split a stored value into its expiry and payload.
    fn decode(bytes: &[u8]) -> Result<(i64, &[u8]), LmdbStoreError> {
        if bytes.len() < EXPIRY_LEN {
            return Err(LmdbStoreError::Malformed(format!(
                "{} bytes, expected at least {EXPIRY_LEN}",
                bytes.len()
            )));
        }
        let mut expiry = [0u8; EXPIRY_LEN];
        expiry.copy_from_slice(&bytes[..EXPIRY_LEN]);
        Ok((i64::from_le_bytes(expiry), &bytes[EXPIRY_LEN..]))
    }

    fn is_expired(expires_at: i64, now: i64) -> bool {
        expires_at != 0 && now >= expires_at
    }

    fn record(&self, hit: bool) {
        if let Ok(mut stats) = self.stats.write() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
    }

    fn delete_raw(&self, key: &[u8]) -> Result<bool, LmdbStoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    fn expired_keys(&self) -> Result<Vec<Vec<u8>>, LmdbStoreError> {
        let now = Self::now_millis();
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let Ok((key, value)) = result else { continue };
            match Self::decode(value) {
                Ok((expires_at, _)) if Self::is_expired(expires_at, now) => keys.push(key.to_vec()),
                Ok(_) => {}
                Err(_) => keys.push(key.to_vec()),
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Store for LmdbStore {
    fn kind(&self) -> &str {
        STORE_KIND
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError> {
        let found = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| txn_err(e).during(StoreOp::Get))?;
            match self.db.get(&rtxn, key.as_bytes()) {
                Ok(Some(bytes)) => {
                    let (expires_at, value) = Self::decode(bytes).map_err(|e| e.during(StoreOp::Get))?;
                    if Self::is_expired(expires_at, Self::now_millis()) {
                        None
                    } else {
                        Some(value.to_vec())
                    }
                }
                Ok(None) => None,
                Err(e) => return Err(txn_err(e).during(StoreOp::Get)),
            }
        };
        self.record(found.is_some());
        Ok(found)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        let full_bytes = Self::encode(&value, ttl);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| txn_err(e).during(StoreOp::Set))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &full_bytes)
            .map_err(|e| txn_err(e).during(StoreOp::Set))?;
        wtxn.commit().map_err(|e| txn_err(e).during(StoreOp::Set))?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
        self.delete_raw(key.as_bytes())
            .map(|_| ())
            .map_err(|e| e.during(StoreOp::Delete))
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| txn_err(e).during(StoreOp::Clear))?;
        self.db
            .clear(&mut wtxn)
            .map_err(|e| txn_err(e).during(StoreOp::Clear))?;
        wtxn.commit().map_err(|e| txn_err(e).during(StoreOp::Clear))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, BackendError> {
        let keys = self.expired_keys().map_err(|e| e.during(StoreOp::Delete))?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| txn_err(e).during(StoreOp::Delete))?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).unwrap_or(false) {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(|e| txn_err(e).during(StoreOp::Delete))?;
        Ok(deleted)
    }

    async fn stats(&self) -> Result<StoreStats, BackendError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| txn_err(e).during(StoreOp::Get))?;
        let entry_count = self.db.len(&rtxn).map_err(|e| txn_err(e).during(StoreOp::Get))?;
        let mut stats = self.stats.read().map(|s| s.clone()).unwrap_or_default();
        stats.entry_count = entry_count;
        Ok(stats)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.env
            .force_sync()
            .map_err(|e| txn_err(e).during(StoreOp::Close))
    }
}
