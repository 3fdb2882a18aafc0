//! In-process store with TTL, optional LRU capacity and lease locks.

use crate::store::{Store, StoreLock, StoreStats};
use async_trait::async_trait;
use recall_core::{BackendError, CacheKey, LockError, RecallResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

const STORE_KIND: &str = "memory";
const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(5);

struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    last_access: u64,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct MemoryState {
    slots: HashMap<CacheKey, Slot>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> u64 {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        (before - self.slots.len()) as u64
    }

    /// Drop the least recently used entry. Returns `false` when empty.
    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                self.slots.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<CacheKey, Lease>>>;

/// Store backed by a `HashMap` inside the current process.
pub struct MemoryStore {
    max_size: Option<usize>,
    lock_lease: Duration,
    lock_poll: Duration,
    state: Mutex<MemoryState>,
    leases: LeaseTable,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            max_size: None,
            lock_lease: DEFAULT_LOCK_LEASE,
            lock_poll: DEFAULT_LOCK_POLL,
            state: Mutex::new(MemoryState::default()),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keep at most `max_size` entries, evicting the least recently used.
    ///
    /// A capacity of zero makes every `set` a no-op.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// How long an unreleased lock stays held.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.state.lock().map_err(|_| BackendError::LockPoisoned {
            backend: STORE_KIND.to_string(),
        })
    }

    fn try_take_lease(&self, key: &CacheKey) -> Result<Option<Uuid>, BackendError> {
        let mut leases = self.leases.lock().map_err(|_| BackendError::LockPoisoned {
            backend: STORE_KIND.to_string(),
        })?;
        let now = Instant::now();
        if leases.get(key).is_some_and(|lease| lease.expires_at > now) {
            return Ok(None);
        }
        let token = Uuid::now_v7();
        leases.insert(
            key.clone(),
            Lease {
                token,
                expires_at: now + self.lock_lease,
            },
        );
        Ok(Some(token))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn kind(&self) -> &str {
        STORE_KIND
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let now = Instant::now();
        let tick = state.next_tick();
        let found = match state.slots.get(key).map(|slot| slot.is_expired(now)) {
            Some(true) => {
                state.slots.remove(key);
                None
            }
            Some(false) => state.slots.get_mut(key).map(|slot| {
                slot.last_access = tick;
                slot.value.clone()
            }),
            None => None,
        };
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        Ok(found)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut state = self.state()?;
        let now = Instant::now();
        if let Some(max_size) = self.max_size {
            if max_size == 0 {
                return Ok(());
            }
            if !state.slots.contains_key(key) && state.slots.len() >= max_size {
                state.purge_expired(now);
                while state.slots.len() >= max_size && state.evict_lru() {}
            }
        }
        let tick = state.next_tick();
        state.slots.insert(
            key.clone(),
            Slot {
                value,
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                last_access: tick,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
        self.state()?.slots.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.state()?.slots.clear();
        Ok(())
    }

    async fn acquire_lock(&self, key: &CacheKey, timeout: Duration) -> RecallResult<Box<dyn StoreLock>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.try_take_lease(key)? {
                return Ok(Box::new(MemoryLock {
                    key: key.clone(),
                    token,
                    leases: Arc::clone(&self.leases),
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    timeout,
                }
                .into());
            }
            tokio::time::sleep(self.lock_poll.min(deadline - now)).await;
        }
    }

    async fn purge_expired(&self) -> Result<u64, BackendError> {
        Ok(self.state()?.purge_expired(Instant::now()))
    }

    async fn stats(&self) -> Result<StoreStats, BackendError> {
        let state = self.state()?;
        Ok(StoreStats {
            hits: state.hits,
            misses: state.misses,
            entry_count: state.slots.len() as u64,
            size_bytes: state.slots.values().map(|s| s.value.len() as u64).sum(),
            evictions: state.evictions,
        })
    }
}

struct MemoryLock {
    key: CacheKey,
    token: Uuid,
    leases: LeaseTable,
}

#[async_trait]
impl StoreLock for MemoryLock {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<(), BackendError> {
        let mut leases = self.leases.lock().map_err(|_| BackendError::LockPoisoned {
            backend: STORE_KIND.to_string(),
        })?;
        // A lease that expired and was re-taken belongs to someone else now.
        if leases.get(&self.key).is_some_and(|lease| lease.token == self.token) {
            leases.remove(&self.key);
        }
        Ok(())
    }
}
