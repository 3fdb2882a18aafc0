//! Ordered multi-tier routing across stores.
//!
//! Tier 0 is the fastest. Reads check tiers in order and copy a value found
//! in a slower tier into every faster one. Writes go front to back; only a
//! failure of tier 0 fails the write. Deletes and clears visit every tier and
//! collect failures instead of stopping at the first one.
//!
//! Every store call goes through the tier's circuit breaker and a deadline.
//! An open circuit makes its tier behave as a miss on reads.

use crate::breaker::CircuitBreaker;
use crate::entry::EntryHeader;
use crate::store::{Store, StoreLock};
use chrono::Utc;
use recall_core::{
    BackendError, CacheEvent, CacheKey, ConfigError, EventKind, LockError, RecallError, RecallResult, StoreOp,
};
use recall_events::EventBus;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One tier: a registered backend name, its store and its breaker.
#[derive(Clone)]
pub struct Tier {
    name: String,
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
}

impl Tier {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            name: name.into(),
            store,
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier")
            .field("name", &self.name)
            .field("kind", &self.store.kind())
            .field("breaker", &self.breaker)
            .finish()
    }
}

/// A value found while reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHit {
    pub tier: usize,
    pub backend: String,
    pub value: Vec<u8>,
}

/// A failure on one tier during a multi-tier operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: usize,
    pub backend: String,
    pub error: RecallError,
}

/// Outcome of an operation that visits every tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierReport {
    pub attempted: usize,
    pub failures: Vec<TierFailure>,
}

impl TierReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: TierReport) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }

    /// First failure as an error, if any.
    pub fn into_result(self) -> RecallResult<()> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }
}

/// A lock held on one tier.
pub struct TierLock {
    tier: usize,
    backend: String,
    inner: Box<dyn StoreLock>,
}

impl TierLock {
    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn key(&self) -> &CacheKey {
        self.inner.key()
    }
}

/// Routes cache traffic across an ordered list of tiers.
pub struct TieredRouter {
    tiers: Vec<Tier>,
    bus: Arc<EventBus>,
    store_timeout: Duration,
}

impl TieredRouter {
    pub fn new(tiers: Vec<Tier>, bus: Arc<EventBus>, store_timeout: Duration) -> RecallResult<Self> {
        if tiers.is_empty() {
            return Err(ConfigError::NoTiers {
                function: "router".to_string(),
            }
            .into());
        }
        Ok(Self {
            tiers,
            bus,
            store_timeout,
        })
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Run one store call behind the tier's breaker and deadline.
    async fn guarded<T, Fut>(&self, idx: usize, operation: StoreOp, call: Fut) -> RecallResult<T>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let tier = &self.tiers[idx];
        let permit = tier.breaker.try_acquire()?;
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(e.into())
            }
            Err(_) => {
                permit.failure();
                Err(BackendError::DeadlineExceeded {
                    backend: tier.name.clone(),
                    operation,
                    timeout: self.store_timeout,
                }
                .into())
            }
        }
    }

    fn report_error(
        &self,
        function: &str,
        key: Option<&CacheKey>,
        idx: usize,
        operation: StoreOp,
        error: &RecallError,
    ) {
        let backend = &self.tiers[idx].name;
        tracing::warn!(
            function = function,
            backend = %backend,
            tier = idx,
            operation = %operation,
            error = %error,
            "Store call failed"
        );
        let mut event = CacheEvent::new(EventKind::CacheError, function)
            .with_backend(backend.clone())
            .with_tier(idx)
            .with_operation(operation)
            .with_error(error);
        if let Some(key) = key {
            event = event.with_key(key);
        }
        self.bus.publish(event);
    }

    /// Probe tiers in order. Failures and open circuits count as misses.
    pub async fn read(&self, function: &str, key: &CacheKey) -> Option<TierHit> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            match self.guarded(idx, StoreOp::Get, tier.store.get(key)).await {
                Ok(Some(value)) => {
                    if idx > 0 {
                        self.promote(function, key, idx, &value).await;
                    }
                    return Some(TierHit {
                        tier: idx,
                        backend: tier.name.clone(),
                        value,
                    });
                }
                Ok(None) => {}
                Err(RecallError::CircuitOpen(_)) => {
                    tracing::debug!(backend = %tier.name, tier = idx, "Skipping tier with open circuit");
                }
                Err(e) => self.report_error(function, Some(key), idx, StoreOp::Get, &e),
            }
        }
        None
    }

    /// Copy a value found in tier `found_at` into every faster tier.
    async fn promote(&self, function: &str, key: &CacheKey, found_at: usize, value: &[u8]) {
        let now = Utc::now();
        let ttl = match EntryHeader::peek(key, value) {
            Ok(header) if header.is_expired_at(now) => return,
            Ok(header) => header.remaining_ttl(now),
            // Left for the caller to report; spreading it would not help.
            Err(_) => return,
        };
        for idx in 0..found_at {
            let tier = &self.tiers[idx];
            match self
                .guarded(idx, StoreOp::Set, tier.store.set(key, value.to_vec(), ttl))
                .await
            {
                Ok(()) => {
                    tracing::debug!(backend = %tier.name, tier = idx, from_tier = found_at, "Promoted entry");
                }
                Err(e) => self.report_error(function, Some(key), idx, StoreOp::Set, &e),
            }
        }
    }

    /// Write through every tier, front to back.
    ///
    /// A failure on tier 0 fails the write and stops it. Failures on later
    /// tiers are reported as events only.
    pub async fn write(
        &self,
        function: &str,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> RecallResult<()> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            if let Err(e) = self
                .guarded(idx, StoreOp::Set, tier.store.set(key, value.clone(), ttl))
                .await
            {
                self.report_error(function, Some(key), idx, StoreOp::Set, &e);
                if idx == 0 {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, function: &str, key: &CacheKey) -> TierReport {
        let mut report = TierReport::default();
        for (idx, tier) in self.tiers.iter().enumerate() {
            report.attempted += 1;
            if let Err(error) = self.guarded(idx, StoreOp::Delete, tier.store.delete(key)).await {
                self.report_error(function, Some(key), idx, StoreOp::Delete, &error);
                report.failures.push(TierFailure {
                    tier: idx,
                    backend: tier.name.clone(),
                    error,
                });
            }
        }
        report
    }

    pub async fn clear(&self, function: &str) -> TierReport {
        let mut report = TierReport::default();
        for (idx, tier) in self.tiers.iter().enumerate() {
            report.attempted += 1;
            if let Err(error) = self.guarded(idx, StoreOp::Clear, tier.store.clear()).await {
                self.report_error(function, None, idx, StoreOp::Clear, &error);
                report.failures.push(TierFailure {
                    tier: idx,
                    backend: tier.name.clone(),
                    error,
                });
            }
        }
        report
    }

    /// Lock `key` on the first tier that supports locking.
    ///
    /// Returns [`LockError::Unsupported`] when no tier does, and
    /// [`LockError::Timeout`] when the lock stays held past `timeout`.
    pub async fn acquire_lock(&self, function: &str, key: &CacheKey, timeout: Duration) -> RecallResult<TierLock> {
        let mut skipped: Option<RecallError> = None;
        for (idx, tier) in self.tiers.iter().enumerate() {
            let permit = match tier.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    skipped = Some(open.into());
                    continue;
                }
            };
            let attempt = tokio::time::timeout(timeout + self.store_timeout, tier.store.acquire_lock(key, timeout)).await;
            match attempt {
                Ok(Ok(inner)) => {
                    permit.success();
                    return Ok(TierLock {
                        tier: idx,
                        backend: tier.name.clone(),
                        inner,
                    });
                }
                Ok(Err(RecallError::Lock(LockError::Unsupported { .. }))) => {
                    permit.success();
                }
                Ok(Err(e @ RecallError::Lock(LockError::Timeout { .. }))) => {
                    permit.success();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    permit.failure();
                    self.report_error(function, Some(key), idx, StoreOp::Lock, &e);
                    return Err(e);
                }
                Err(_) => {
                    permit.failure();
                    let e: RecallError = BackendError::DeadlineExceeded {
                        backend: tier.name.clone(),
                        operation: StoreOp::Lock,
                        timeout: timeout + self.store_timeout,
                    }
                    .into();
                    self.report_error(function, Some(key), idx, StoreOp::Lock, &e);
                    return Err(e);
                }
            }
        }
        Err(skipped.unwrap_or_else(|| {
            LockError::Unsupported {
                backend: self
                    .tiers
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            }
            .into()
        }))
    }

    /// Release a lock taken by [`acquire_lock`](Self::acquire_lock).
    /// Failures are reported, never returned.
    pub async fn release_lock(&self, function: &str, lock: TierLock) {
        let TierLock { tier, inner, .. } = lock;
        let key = inner.key().clone();
        if tier >= self.tiers.len() {
            return;
        }
        if let Err(e) = self.guarded(tier, StoreOp::Lock, inner.release()).await {
            self.report_error(function, Some(&key), tier, StoreOp::Lock, &e);
        }
    }

    /// Close every tier's store, bypassing breakers.
    pub async fn close(&self, function: &str) -> TierReport {
        let mut report = TierReport::default();
        for (idx, tier) in self.tiers.iter().enumerate() {
            report.attempted += 1;
            let error: Option<RecallError> = match tokio::time::timeout(self.store_timeout, tier.store.close()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.into()),
                Err(_) => Some(
                    BackendError::DeadlineExceeded {
                        backend: tier.name.clone(),
                        operation: StoreOp::Close,
                        timeout: self.store_timeout,
                    }
                    .into(),
                ),
            };
            if let Some(error) = error {
                self.report_error(function, None, idx, StoreOp::Close, &error);
                report.failures.push(TierFailure {
                    tier: idx,
                    backend: tier.name.clone(),
                    error,
                });
            }
        }
        report
    }
}

impl std::fmt::Debug for TieredRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredRouter")
            .field("tiers", &self.tiers)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use recall_core::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Memory store whose calls can be switched to fail.
    #[derive(Default)]
    struct Switchable {
        inner: MemoryStore,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl Switchable {
        fn check(&self, operation: StoreOp) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::OperationFailed {
                    backend: "switchable".to_string(),
                    operation,
                    reason: "switched off".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for Switchable {
        fn kind(&self) -> &str {
            "switchable"
        }

        async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError> {
            self.check(StoreOp::Get)?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
            self.check(StoreOp::Set)?;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
            self.check(StoreOp::Delete)?;
            self.inner.delete(key).await
        }

        async fn clear(&self) -> Result<(), BackendError> {
            self.check(StoreOp::Clear)?;
            self.inner.clear().await
        }
    }

    struct Fixture {
        stores: Vec<Arc<Switchable>>,
        router: TieredRouter,
        errors: Arc<Mutex<Vec<CacheEvent>>>,
    }

    fn fixture(tiers: usize, threshold: u32) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        bus.subscribe_fn(EventKind::CacheError, move |event| {
            sink.lock().expect("sink lock should not be poisoned").push(event.clone());
            Ok(())
        });

        let stores: Vec<Arc<Switchable>> = (0..tiers).map(|_| Arc::new(Switchable::default())).collect();
        let tier_list = stores
            .iter()
            .enumerate()
            .map(|(idx, store)| {
                let name = format!("t{idx}");
                let breaker = Arc::new(CircuitBreaker::new(
                    name.clone(),
                    CircuitBreakerConfig::new(threshold, Duration::from_secs(60)),
                ));
                Tier::new(name, Arc::clone(store) as Arc<dyn Store>, breaker)
            })
            .collect();
        let router = TieredRouter::new(tier_list, bus, Duration::from_secs(1)).expect("router should build");
        Fixture { stores, router, errors }
    }

    fn entry_bytes(key: &CacheKey, ttl: Option<Duration>) -> Vec<u8> {
        CacheEntry::new(key.clone(), b"42".to_vec(), ttl)
            .encode()
            .expect("encode should succeed")
    }

    #[tokio::test]
    async fn test_empty_tier_list_is_rejected() {
        let result = TieredRouter::new(Vec::new(), Arc::new(EventBus::new()), Duration::from_secs(1));
        assert!(matches!(result, Err(RecallError::Config(ConfigError::NoTiers { .. }))));
    }

    #[tokio::test]
    async fn test_read_promotes_into_faster_tiers() {
        let fx = fixture(3, 5);
        let key = CacheKey::new("recall:promote");
        let bytes = entry_bytes(&key, Some(Duration::from_secs(60)));
        fx.stores[2]
            .inner
            .set(&key, bytes.clone(), None)
            .await
            .expect("seed should succeed");

        let hit = fx.router.read("f", &key).await.expect("value should be found");
        assert_eq!(hit.tier, 2);
        assert_eq!(hit.backend, "t2");

        for store in &fx.stores[..2] {
            assert_eq!(
                store.inner.get(&key).await.expect("get should succeed"),
                Some(bytes.clone())
            );
        }
        let again = fx.router.read("f", &key).await.expect("value should be found");
        assert_eq!(again.tier, 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_promoted() {
        let fx = fixture(2, 5);
        let key = CacheKey::new("recall:stale");
        let stale = CacheEntry::new(key.clone(), b"1".to_vec(), Some(Duration::from_secs(1)))
            .with_created_at(Utc::now() - chrono::TimeDelta::seconds(10))
            .encode()
            .expect("encode should succeed");
        fx.stores[1].inner.set(&key, stale, None).await.expect("seed should succeed");

        assert!(fx.router.read("f", &key).await.is_some());
        assert_eq!(fx.stores[0].inner.get(&key).await.expect("get should succeed"), None);
    }

    #[tokio::test]
    async fn test_failing_tier_reads_as_miss_and_reports() {
        let fx = fixture(2, 5);
        let key = CacheKey::new("recall:k");
        fx.stores[0].failing.store(true, Ordering::SeqCst);
        fx.stores[1]
            .inner
            .set(&key, entry_bytes(&key, None), None)
            .await
            .expect("seed should succeed");

        let hit = fx.router.read("f", &key).await.expect("tier 1 should answer");
        assert_eq!(hit.tier, 1);
        let errors = fx.errors.lock().expect("errors lock should not be poisoned");
        assert!(errors
            .iter()
            .any(|e| e.tier == Some(0) && e.operation == Some(StoreOp::Get)));
    }

    #[tokio::test]
    async fn test_write_fails_only_when_first_tier_fails() {
        let fx = fixture(2, 5);
        let key = CacheKey::new("recall:w");

        fx.stores[1].failing.store(true, Ordering::SeqCst);
        fx.router
            .write("f", &key, vec![1], None)
            .await
            .expect("second tier failure should not fail the write");

        fx.stores[1].failing.store(false, Ordering::SeqCst);
        fx.stores[0].failing.store(true, Ordering::SeqCst);
        let err = fx
            .router
            .write("f", &key, vec![2], None)
            .await
            .expect_err("first tier failure should fail the write");
        assert_eq!(err.type_name(), "BackendError");
    }

    #[tokio::test]
    async fn test_delete_collects_all_failures() {
        let fx = fixture(3, 5);
        fx.stores[0].failing.store(true, Ordering::SeqCst);
        fx.stores[2].failing.store(true, Ordering::SeqCst);
        let report = fx.router.delete("f", &CacheKey::new("recall:d")).await;
        assert_eq!(report.attempted, 3);
        let failed: Vec<usize> = report.failures.iter().map(|f| f.tier).collect();
        assert_eq!(failed, vec![0, 2]);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_open_circuit_skips_store() {
        let fx = fixture(1, 2);
        let key = CacheKey::new("recall:c");
        fx.stores[0].failing.store(true, Ordering::SeqCst);
        fx.router.read("f", &key).await;
        fx.router.read("f", &key).await;
        assert_eq!(fx.router.tiers()[0].breaker().state(), CircuitState::Open);

        let calls_before = fx.stores[0].calls.load(Ordering::SeqCst);
        assert!(fx.router.read("f", &key).await.is_none());
        assert_eq!(fx.stores[0].calls.load(Ordering::SeqCst), calls_before);

        let err = fx.router.write("f", &key, vec![1], None).await.expect_err("write should fail");
        assert_eq!(err.type_name(), "CircuitOpenError");
    }

    #[tokio::test]
    async fn test_lock_unsupported_without_capable_tier() {
        let fx = fixture(2, 5);
        let err = fx
            .router
            .acquire_lock("f", &CacheKey::new("recall:l"), Duration::from_millis(10))
            .await
            .err()
            .expect("no tier supports locks");
        assert_eq!(err.type_name(), "LockUnsupported");
    }

    #[tokio::test]
    async fn test_lock_uses_first_capable_tier() {
        let bus = Arc::new(EventBus::new());
        let breaker = |name: &str| Arc::new(CircuitBreaker::new(name, CircuitBreakerConfig::default()));
        let router = TieredRouter::new(
            vec![
                Tier::new("plain", Arc::new(Switchable::default()) as Arc<dyn Store>, breaker("plain")),
                Tier::new("mem", Arc::new(MemoryStore::new()) as Arc<dyn Store>, breaker("mem")),
            ],
            bus,
            Duration::from_secs(1),
        )
        .expect("router should build");

        let key = CacheKey::new("recall:l");
        let lock = router
            .acquire_lock("f", &key, Duration::from_millis(50))
            .await
            .expect("memory tier should lock");
        assert_eq!(lock.tier(), 1);
        assert_eq!(lock.backend(), "mem");

        let contended = router.acquire_lock("f", &key, Duration::from_millis(20)).await;
        assert!(matches!(contended, Err(RecallError::Lock(LockError::Timeout { .. }))));

        router.release_lock("f", lock).await;
        assert!(router.acquire_lock("f", &key, Duration::from_millis(20)).await.is_ok());
    }
}
