//! Recall Test Utilities
//!
//! Shared test infrastructure for the recall workspace:
//! - Fault-injecting and call-counting stores
//! - An event handler that records what was published
//! - Proptest generators for argument values and keys

pub use recall_core::{ArgValue, Args, BackendError, CacheEvent, CacheKey, EventKind, RecallResult, StoreOp};
pub use recall_storage::{MemoryStore, Store, StoreLock, StoreStats};

use async_trait::async_trait;
use recall_core::EventError;
use recall_events::{EventBus, EventHandler, SubscriptionId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FAULT-INJECTING STORE
// ============================================================================

/// Memory store whose calls can be made to fail or stall.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_all: AtomicBool,
    fail_next: AtomicU32,
    delay_ms: AtomicU64,
    calls: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that fails every call.
    pub fn broken() -> Self {
        let store = Self::new();
        store.fail_all(true);
        store
    }

    pub fn fail_all(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then behave normally.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Sleep before answering every call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls that reached this store, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    async fn enter(&self, operation: StoreOp) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let scheduled = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled || self.fail_all.load(Ordering::SeqCst) {
            return Err(BackendError::OperationFailed {
                backend: "flaky".to_string(),
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError> {
        self.enter(StoreOp::Get).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.enter(StoreOp::Set).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
        self.enter(StoreOp::Delete).await?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.enter(StoreOp::Clear).await?;
        self.inner.clear().await
    }

    async fn acquire_lock(&self, key: &CacheKey, timeout: Duration) -> RecallResult<Box<dyn StoreLock>> {
        self.enter(StoreOp::Lock).await?;
        self.inner.acquire_lock(key, timeout).await
    }
}

// ============================================================================
// COUNTING STORE
// ============================================================================

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: u64,
    pub set: u64,
    pub delete: u64,
    pub clear: u64,
    pub lock: u64,
}

/// Wraps a store and counts calls per operation.
pub struct CountingStore {
    inner: Arc<dyn Store>,
    counts: Mutex<CallCounts>,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            counts: Mutex::new(CallCounts::default()),
        }
    }

    /// Counting wrapper around a fresh [`MemoryStore`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn counts(&self) -> CallCounts {
        self.counts.lock().map(|c| *c).unwrap_or_default()
    }

    fn bump(&self, op: StoreOp) {
        if let Ok(mut counts) = self.counts.lock() {
            match op {
                StoreOp::Get => counts.get += 1,
                StoreOp::Set => counts.set += 1,
                StoreOp::Delete => counts.delete += 1,
                StoreOp::Clear => counts.clear += 1,
                StoreOp::Lock => counts.lock += 1,
                StoreOp::Open | StoreOp::Close | StoreOp::Key | StoreOp::Route => {}
            }
        }
    }
}

#[async_trait]
impl Store for CountingStore {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, BackendError> {
        self.bump(StoreOp::Get);
        self.inner.get(key).await
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.bump(StoreOp::Set);
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
        self.bump(StoreOp::Delete);
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.bump(StoreOp::Clear);
        self.inner.clear().await
    }

    async fn acquire_lock(&self, key: &CacheKey, timeout: Duration) -> RecallResult<Box<dyn StoreLock>> {
        self.bump(StoreOp::Lock);
        self.inner.acquire_lock(key, timeout).await
    }

    async fn purge_expired(&self) -> Result<u64, BackendError> {
        self.inner.purge_expired().await
    }

    async fn stats(&self) -> Result<StoreStats, BackendError> {
        self.inner.stats().await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }
}

// ============================================================================
// EVENT RECORDING
// ============================================================================

/// Captures published events in delivery order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<CacheEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a new recorder to `kinds` on `bus`.
    pub fn attach(bus: &EventBus, kinds: &[EventKind]) -> (Arc<Self>, Vec<(EventKind, SubscriptionId)>) {
        let recorder = Arc::new(Self::new());
        let ids = bus.subscribe_many(kinds, Arc::clone(&recorder) as Arc<dyn EventHandler>);
        (recorder, ids)
    }

    /// Subscribe a new recorder to every kind.
    pub fn attach_all(bus: &EventBus) -> Arc<Self> {
        Self::attach(bus, &EventKind::ALL).0
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// Kinds of events concerning `function`, in order.
    pub fn kinds_for(&self, function: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|e| e.function == function)
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &CacheEvent) -> Result<(), EventError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for argument values and keys.

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Scalar argument values. Floats are always finite.
    pub fn arb_scalar() -> impl Strategy<Value = ArgValue> {
        prop_oneof![
            Just(ArgValue::Unit),
            any::<bool>().prop_map(ArgValue::Bool),
            any::<i64>().prop_map(ArgValue::Int),
            any::<u64>().prop_map(ArgValue::UInt),
            (-1.0e12f64..1.0e12).prop_map(ArgValue::Float),
            "[a-zA-Z0-9 _-]{0,24}".prop_map(ArgValue::Str),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(ArgValue::Bytes),
        ]
    }

    /// Any keyable argument value, nested up to three levels.
    pub fn arb_arg_value() -> impl Strategy<Value = ArgValue> {
        arb_scalar().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(ArgValue::List),
                prop::collection::btree_map("[a-z]{1,8}", inner.clone(), 0..6).prop_map(ArgValue::Map),
                prop::collection::vec(inner, 0..6).prop_map(ArgValue::Set),
            ]
        })
    }

    /// Named arguments only.
    pub fn arb_named_args() -> impl Strategy<Value = BTreeMap<String, ArgValue>> {
        prop::collection::btree_map("[a-z]{1,8}", arb_arg_value(), 0..6)
    }

    /// A full argument set.
    pub fn arb_args() -> impl Strategy<Value = Args> {
        (prop::collection::vec(arb_arg_value(), 0..6), arb_named_args()).prop_map(|(positional, named)| {
            let args = positional.into_iter().fold(Args::new(), |acc, v| acc.arg(v));
            named.into_iter().fold(args, |acc, (k, v)| acc.named(k, v))
        })
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        "[a-z]{1,8}:[0-9a-f]{64}".prop_map(CacheKey::new)
    }

    /// TTLs between one second and one day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }
}
