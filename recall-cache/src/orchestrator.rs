//! Call orchestration.
//!
//! `run` derives the key, then hands the lookup-execute-store sequence to
//! the single-flight table so concurrent callers for one key share a single
//! execution. Failures of the cache layer never reach the caller: they are
//! published as `cache_error` events and the operation runs directly. The
//! operation's own error is returned unchanged.

use crate::cache::{Cache, CacheInner};
use crate::stampede;
use chrono::Utc;
use recall_core::{
    generate_key, Args, CacheConfig, CacheEvent, CacheKey, EventKind, LockError, OperationId, RecallError,
    StoreOp,
};
use recall_events::EventBus;
use recall_storage::{codec, CacheEntry, EntryHeader, TierLock, TieredRouter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

impl Cache {
    /// Run `op` through the cache.
    ///
    /// The tiers named by `config` are looked up in this context on every
    /// call. [`Cache::wrap`](crate::Cache::wrap) resolves them once instead.
    pub async fn run<T, E, F, Fut>(&self, operation: &OperationId, args: &Args, config: &CacheConfig, op: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Display + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let router = match self.router_for(config) {
            Ok(router) => Arc::new(router),
            Err(e) => {
                let function = operation.to_string();
                tracing::warn!(function = %function, error = %e, "Backend lookup failed, executing without cache");
                publish_cache_error(&self.inner.bus, &function, None, StoreOp::Route, &e);
                return invoke(&self.inner.bus, &function, None, counts(args), op).await;
            }
        };
        self.run_routed(operation, args, Arc::new(config.clone()), router, op)
            .await
    }

    pub(crate) async fn run_routed<T, E, F, Fut>(
        &self,
        operation: &OperationId,
        args: &Args,
        config: Arc<CacheConfig>,
        router: Arc<TieredRouter>,
        op: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Display + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let function = operation.to_string();
        let key = match generate_key(operation, args, config.key_policy()) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(function = %function, error = %e, "Key generation failed, executing without cache");
                publish_cache_error(&self.inner.bus, &function, None, StoreOp::Key, &e.into());
                return invoke(&self.inner.bus, &function, None, counts(args), op).await;
            }
        };

        let call = Call {
            inner: Arc::clone(&self.inner),
            function,
            key: key.clone(),
            config,
            router,
            counts: counts(args),
        };
        self.inner
            .flights
            .execute(&key, move || call.resolve(op))
            .await
    }
}

fn counts(args: &Args) -> (usize, usize) {
    (args.positional_count(), args.named_count())
}

fn publish_cache_error(bus: &EventBus, function: &str, key: Option<&CacheKey>, operation: StoreOp, error: &RecallError) {
    let mut event = CacheEvent::new(EventKind::CacheError, function)
        .with_operation(operation)
        .with_error(error);
    if let Some(key) = key {
        event = event.with_key(key);
    }
    bus.publish(event);
}

/// Execute the wrapped operation, bracketed by call events.
async fn invoke<T, E, F, Fut>(
    bus: &EventBus,
    function: &str,
    key: Option<&CacheKey>,
    (positional, named): (usize, usize),
    op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut start = CacheEvent::new(EventKind::FunctionCallStart, function).with_arg_counts(positional, named);
    if let Some(key) = key {
        start = start.with_key(key);
    }
    bus.publish(start);

    let started = Instant::now();
    let outcome = op().await;
    let elapsed = started.elapsed();

    let mut end = match &outcome {
        Ok(_) => CacheEvent::new(EventKind::FunctionCallEnd, function),
        Err(e) => {
            tracing::debug!(function = function, error = %e, "Wrapped operation failed");
            CacheEvent::new(EventKind::FunctionError, function)
                .with_error_message(std::any::type_name::<E>(), e.to_string())
        }
    }
    .with_duration(elapsed);
    if let Some(key) = key {
        end = end.with_key(key);
    }
    bus.publish(end);
    outcome
}

/// A value read back from the tiers.
struct Found<T> {
    value: T,
    header: EntryHeader,
    tier: usize,
    backend: String,
}

/// One keyed call, owned by the single-flight computation.
#[derive(Clone)]
struct Call {
    inner: Arc<CacheInner>,
    function: String,
    key: CacheKey,
    config: Arc<CacheConfig>,
    router: Arc<TieredRouter>,
    counts: (usize, usize),
}

impl Call {
    async fn resolve<T, E, F, Fut>(self, op: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(found) = self.lookup::<T>().await {
            self.publish_hit(&found);
            let Found { value, header, .. } = found;
            self.maybe_refresh(header, op);
            return Ok(value);
        }

        tracing::debug!(function = %self.function, key = %self.key, "Cache miss");
        self.inner
            .bus
            .publish(CacheEvent::new(EventKind::CacheMiss, &self.function).with_key(&self.key));

        let lock = self.lock().await;
        if lock.is_some() {
            // Another process may have stored the value while the lock was held.
            if let Some(found) = self.lookup::<T>().await {
                self.publish_hit(&found);
                self.release(lock).await;
                return Ok(found.value);
            }
        }

        let outcome = self.execute(op).await;
        if let Ok(value) = &outcome {
            self.store(value).await;
        }
        self.release(lock).await;
        outcome
    }

    fn publish_hit<T>(&self, found: &Found<T>) {
        tracing::debug!(
            function = %self.function,
            key = %self.key,
            backend = %found.backend,
            tier = found.tier,
            "Cache hit"
        );
        self.inner.bus.publish(
            CacheEvent::new(EventKind::CacheHit, &self.function)
                .with_key(&self.key)
                .with_backend(found.backend.clone())
                .with_tier(found.tier),
        );
    }

    fn cache_error(&self, backend: Option<&str>, operation: StoreOp, error: &RecallError) {
        let mut event = CacheEvent::new(EventKind::CacheError, &self.function)
            .with_key(&self.key)
            .with_operation(operation)
            .with_error(error);
        if let Some(backend) = backend {
            event = event.with_backend(backend);
        }
        self.inner.bus.publish(event);
    }

    /// Read and decode. Anything unusable counts as a miss.
    async fn lookup<T: DeserializeOwned>(&self) -> Option<Found<T>> {
        let hit = self.router.read(&self.function, &self.key).await?;
        let entry = match CacheEntry::decode(&self.key, &hit.value) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %self.key, backend = %hit.backend, error = %e, "Discarding undecodable entry");
                self.cache_error(Some(&hit.backend), StoreOp::Get, &e.into());
                return None;
            }
        };
        if entry.is_expired_at(Utc::now()) {
            tracing::debug!(key = %self.key, backend = %hit.backend, "Entry expired");
            return None;
        }
        match codec::decode_value::<T>(&entry.payload, entry.header.compressed) {
            Ok(value) => Some(Found {
                value,
                header: entry.header,
                tier: hit.tier,
                backend: hit.backend,
            }),
            Err(e) => {
                tracing::warn!(key = %self.key, backend = %hit.backend, error = %e, "Cached value does not decode");
                self.cache_error(Some(&hit.backend), StoreOp::Get, &e.into());
                None
            }
        }
    }

    async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        invoke(&self.inner.bus, &self.function, Some(&self.key), self.counts, op).await
    }

    /// Write a fresh value through every tier. Failures are only reported.
    async fn store<T: Serialize>(&self, value: &T) {
        let compression = self.config.compression();
        let encoded = codec::encode_value(value, compression).and_then(|payload| {
            CacheEntry::new(self.key.clone(), payload, self.config.ttl())
                .with_tags(self.config.tags().clone())
                .with_compressed(compression)
                .encode()
        });
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(function = %self.function, key = %self.key, error = %e, "Result cannot be serialized");
                self.cache_error(None, StoreOp::Set, &e.into());
                return;
            }
        };

        match self
            .router
            .write(&self.function, &self.key, bytes, self.config.ttl())
            .await
        {
            Ok(()) => {
                let mut event = CacheEvent::new(EventKind::CacheSet, &self.function)
                    .with_key(&self.key)
                    .with_ttl(self.config.ttl());
                if let Some(first) = self.config.tiers().first() {
                    event = event.with_backend(first.clone());
                }
                self.inner.bus.publish(event);
                self.inner
                    .tags
                    .record(self.config.tags(), &self.key, self.config.tiers(), self.config.ttl());
            }
            Err(e) => {
                tracing::error!(function = %self.function, key = %self.key, error = %e, "Failed to store result");
            }
        }
    }

    /// Take the cross-process lock when the operation asks for one.
    ///
    /// Any failure degrades to process-local coordination.
    async fn lock(&self) -> Option<TierLock> {
        if !self.config.distributed_lock() {
            return None;
        }
        match self
            .router
            .acquire_lock(&self.function, &self.key, self.config.lock_timeout())
            .await
        {
            Ok(lock) => Some(lock),
            Err(RecallError::Lock(LockError::Unsupported { backend })) => {
                tracing::debug!(function = %self.function, backend = %backend, "No tier supports locking");
                None
            }
            Err(e @ RecallError::Lock(LockError::Timeout { .. })) => {
                tracing::warn!(
                    function = %self.function,
                    key = %self.key,
                    error = %e,
                    "Lock wait timed out, executing locally"
                );
                self.cache_error(None, StoreOp::Lock, &e);
                None
            }
            Err(e) => {
                tracing::debug!(function = %self.function, error = %e, "Lock unavailable, executing locally");
                None
            }
        }
    }

    async fn release(&self, lock: Option<TierLock>) {
        if let Some(lock) = lock {
            self.router.release_lock(&self.function, lock).await;
        }
    }

    /// Maybe recompute an entry close to expiry in the background.
    ///
    /// At most one refresh per key runs at a time. The caller is never made
    /// to wait for it.
    fn maybe_refresh<T, E, F, Fut>(&self, header: EntryHeader, op: F)
    where
        T: Serialize + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if !stampede::should_refresh(&self.config.stampede(), &header, Utc::now(), rand::random::<f64>()) {
            return;
        }
        match self.inner.refreshing.lock() {
            Ok(mut refreshing) => {
                if !refreshing.insert(self.key.clone()) {
                    return;
                }
            }
            Err(_) => return,
        }

        tracing::debug!(function = %self.function, key = %self.key, "Refreshing entry ahead of expiry");
        let call = self.clone();
        tokio::spawn(async move {
            let _refresh = RefreshGuard {
                inner: Arc::clone(&call.inner),
                key: call.key.clone(),
            };
            if let Ok(value) = call.execute(op).await {
                call.store(&value).await;
            }
        });
    }
}

/// Clears a key's refresh marker when the refresh ends.
struct RefreshGuard {
    inner: Arc<CacheInner>,
    key: CacheKey,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Ok(mut refreshing) = self.inner.refreshing.lock() {
            refreshing.remove(&self.key);
        }
    }
}
