//! Publish/subscribe dispatch of cache lifecycle events
//!
//! Synchronous handlers run inline on the publishing task, in subscription
//! order. Asynchronous handlers each own a queue drained by a dedicated Tokio
//! task, so they observe events in publish order without blocking the
//! publisher. [`EventBus::subscribe_async`] queues without limit and never
//! drops; [`EventBus::subscribe_async_bounded`] caps the queue and drops (and
//! logs) events a lagging handler has no room for.
//!
//! A failing or panicking handler is logged and skipped. Nothing a handler
//! does can reach the caller of a cached operation.

use async_trait::async_trait;
use futures_util::FutureExt;
use recall_core::{CacheEvent, EventError, EventKind};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Handler invoked inline for each matching event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CacheEvent) -> Result<(), EventError>;
}

impl<F> EventHandler for F
where
    F: Fn(&CacheEvent) -> Result<(), EventError> + Send + Sync,
{
    fn handle(&self, event: &CacheEvent) -> Result<(), EventError> {
        self(event)
    }
}

/// Handler run on its own Tokio task.
#[async_trait]
pub trait AsyncEventHandler: Send + Sync {
    async fn handle(&self, event: CacheEvent) -> Result<(), EventError>;
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Dispatch {
    Inline(Arc<dyn EventHandler>),
    Queued(mpsc::UnboundedSender<CacheEvent>),
    Bounded(mpsc::Sender<CacheEvent>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    dispatch: Dispatch,
}

/// Registry of handlers keyed by event kind.
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
    enabled: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            enabled: AtomicBool::new(true),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, kind: EventKind, subscription: Subscription) {
        match self.subscriptions.write() {
            Ok(mut subs) => subs.entry(kind).or_default().push(subscription),
            Err(poisoned) => poisoned.into_inner().entry(kind).or_default().push(subscription),
        }
    }

    /// Register an inline handler for `kind`.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.insert(
            kind,
            Subscription {
                id,
                dispatch: Dispatch::Inline(handler),
            },
        );
        id
    }

    pub fn subscribe_fn<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(handler))
    }

    /// Register one inline handler for several kinds.
    pub fn subscribe_many(
        &self,
        kinds: &[EventKind],
        handler: Arc<dyn EventHandler>,
    ) -> Vec<(EventKind, SubscriptionId)> {
        kinds
            .iter()
            .map(|kind| (*kind, self.subscribe(*kind, Arc::clone(&handler))))
            .collect()
    }

    /// Register an async handler for `kind`.
    ///
    /// Must be called from within a Tokio runtime; the handler's worker task
    /// is spawned on the current one. Every event is delivered, so a handler
    /// slower than the publish rate grows its queue.
    pub fn subscribe_async(
        &self,
        kind: EventKind,
        handler: Arc<dyn AsyncEventHandler>,
    ) -> Result<SubscriptionId, EventError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EventError::NoRuntime)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                run_async_handler(handler.as_ref(), event).await;
            }
        });
        Ok(self.insert_queued(kind, Dispatch::Queued(tx)))
    }

    /// Register an async handler whose queue holds at most `capacity` events.
    ///
    /// Events published while the queue is full are dropped for this handler
    /// and logged. A `capacity` of zero is treated as one.
    pub fn subscribe_async_bounded(
        &self,
        kind: EventKind,
        handler: Arc<dyn AsyncEventHandler>,
        capacity: usize,
    ) -> Result<SubscriptionId, EventError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EventError::NoRuntime)?;
        let (tx, mut rx) = mpsc::channel::<CacheEvent>(capacity.max(1));
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                run_async_handler(handler.as_ref(), event).await;
            }
        });
        Ok(self.insert_queued(kind, Dispatch::Bounded(tx)))
    }

    fn insert_queued(&self, kind: EventKind, dispatch: Dispatch) -> SubscriptionId {
        let id = self.next_id();
        self.insert(kind, Subscription { id, dispatch });
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscriptions.write() else {
            return false;
        };
        let Some(list) = subs.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    /// Remove all subscriptions for `kind`, or every subscription when `None`.
    pub fn unsubscribe_all(&self, kind: Option<EventKind>) {
        if let Ok(mut subs) = self.subscriptions.write() {
            match kind {
                Some(kind) => {
                    subs.remove(&kind);
                }
                None => subs.clear(),
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .map(|subs| subs.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Stop delivering events. Subscriptions are kept.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Deliver `event` to every handler subscribed to its kind.
    pub fn publish(&self, event: CacheEvent) {
        if !self.is_enabled() {
            return;
        }

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Subscription> = match self.subscriptions.read() {
            Ok(subs) => subs.get(&event.kind).cloned().unwrap_or_default(),
            Err(_) => return,
        };

        for (idx, subscription) in handlers.into_iter().enumerate() {
            match subscription.dispatch {
                Dispatch::Inline(handler) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(
                                handler_index = idx,
                                event_kind = %event.kind,
                                error = %e,
                                "Event handler failed"
                            );
                        }
                        Err(_) => {
                            tracing::warn!(
                                handler_index = idx,
                                event_kind = %event.kind,
                                "Event handler panicked"
                            );
                        }
                    }
                }
                Dispatch::Queued(tx) => {
                    if tx.send(event.clone()).is_err() {
                        tracing::warn!(
                            handler_index = idx,
                            event_kind = %event.kind,
                            "Async event handler worker is gone"
                        );
                    }
                }
                Dispatch::Bounded(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            handler_index = idx,
                            event_kind = %event.kind,
                            "Async event handler lagging, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::warn!(
                            handler_index = idx,
                            event_kind = %event.kind,
                            "Async event handler worker is gone"
                        );
                    }
                },
            }
        }
    }
}

async fn run_async_handler(handler: &dyn AsyncEventHandler, event: CacheEvent) {
    let kind = event.kind;
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(event_kind = %kind, error = %e, "Async event handler failed");
        }
        Err(_) => {
            tracing::warn!(event_kind = %kind, "Async event handler panicked");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventKind, usize> = self
            .subscriptions
            .read()
            .map(|subs| subs.iter().map(|(k, v)| (*k, v.len())).collect())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .field("subscriptions", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Arc<dyn EventHandler>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |label: &str| -> Arc<dyn EventHandler> {
            let log = Arc::clone(&log_for_factory);
            let label = label.to_string();
            Arc::new(move |event: &CacheEvent| {
                log.lock()
                    .expect("log lock should not be poisoned")
                    .push(format!("{label}:{}", event.kind));
                Ok(())
            })
        };
        (log, factory)
    }

    #[test]
    fn test_handlers_fire_in_subscription_order() {
        let bus = EventBus::new();
        let (log, handler) = recorder();
        bus.subscribe(EventKind::CacheHit, handler("first"));
        bus.subscribe(EventKind::CacheHit, handler("second"));
        bus.subscribe(EventKind::CacheMiss, handler("other"));

        bus.publish(CacheEvent::new(EventKind::CacheHit, "f"));

        let log = log.lock().expect("log lock should not be poisoned");
        assert_eq!(*log, vec!["first:cache_hit".to_string(), "second:cache_hit".to_string()]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::new();
        let (log, handler) = recorder();
        bus.subscribe_fn(EventKind::CacheSet, |_| {
            Err(EventError::HandlerFailed {
                reason: "boom".to_string(),
            })
        });
        bus.subscribe_fn(EventKind::CacheSet, |_| panic!("handler exploded"));
        bus.subscribe(EventKind::CacheSet, handler("survivor"));

        bus.publish(CacheEvent::new(EventKind::CacheSet, "f"));

        let log = log.lock().expect("log lock should not be poisoned");
        assert_eq!(*log, vec!["survivor:cache_set".to_string()]);
    }

    #[test]
    fn test_unsubscribe_and_disable() {
        let bus = EventBus::new();
        let (log, handler) = recorder();
        let id = bus.subscribe(EventKind::CacheHit, handler("a"));
        bus.subscribe(EventKind::CacheHit, handler("b"));

        assert!(bus.unsubscribe(EventKind::CacheHit, id));
        assert!(!bus.unsubscribe(EventKind::CacheHit, id));
        bus.publish(CacheEvent::new(EventKind::CacheHit, "f"));

        bus.disable();
        bus.publish(CacheEvent::new(EventKind::CacheHit, "f"));
        bus.enable();

        bus.unsubscribe_all(Some(EventKind::CacheHit));
        bus.publish(CacheEvent::new(EventKind::CacheHit, "f"));

        let log = log.lock().expect("log lock should not be poisoned");
        assert_eq!(*log, vec!["b:cache_hit".to_string()]);
        assert_eq!(bus.subscriber_count(EventKind::CacheHit), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe_fn(EventKind::BackendInit, move |_| {
            inner.subscribe_fn(EventKind::BackendClose, |_| Ok(()));
            Ok(())
        });
        bus.publish(CacheEvent::new(EventKind::BackendInit, "f"));
        assert_eq!(bus.subscriber_count(EventKind::BackendClose), 1);
    }

    #[test]
    fn test_subscribe_async_requires_runtime() {
        struct Noop;
        #[async_trait]
        impl AsyncEventHandler for Noop {
            async fn handle(&self, _event: CacheEvent) -> Result<(), EventError> {
                Ok(())
            }
        }
        let bus = EventBus::new();
        assert_eq!(
            bus.subscribe_async(EventKind::CacheHit, Arc::new(Noop)),
            Err(EventError::NoRuntime)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_handler_receives_events_in_order() {
        struct Forward(mpsc::UnboundedSender<String>);
        #[async_trait]
        impl AsyncEventHandler for Forward {
            async fn handle(&self, event: CacheEvent) -> Result<(), EventError> {
                self.0
                    .send(event.function)
                    .map_err(|e| EventError::HandlerFailed { reason: e.to_string() })
            }
        }

        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_async(EventKind::CacheMiss, Arc::new(Forward(tx)))
            .expect("subscribe_async should succeed inside a runtime");

        for i in 0..5 {
            bus.publish(CacheEvent::new(EventKind::CacheMiss, format!("f{i}")));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let name = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event should arrive")
                .expect("channel should stay open");
            seen.push(name);
        }
        assert_eq!(seen, vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_async_handler_drops_when_lagging() {
        struct Gated {
            gate: Arc<tokio::sync::Semaphore>,
            seen: mpsc::UnboundedSender<String>,
        }
        #[async_trait]
        impl AsyncEventHandler for Gated {
            async fn handle(&self, event: CacheEvent) -> Result<(), EventError> {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| EventError::HandlerFailed { reason: e.to_string() })?;
                permit.forget();
                self.seen
                    .send(event.function)
                    .map_err(|e| EventError::HandlerFailed { reason: e.to_string() })
            }
        }

        let bus = EventBus::new();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_async_bounded(
            EventKind::CacheMiss,
            Arc::new(Gated {
                gate: Arc::clone(&gate),
                seen: tx,
            }),
            2,
        )
        .expect("subscribe_async_bounded should succeed inside a runtime");

        for i in 0..10 {
            bus.publish(CacheEvent::new(EventKind::CacheMiss, format!("f{i}")));
        }
        gate.add_permits(10);

        let mut seen = Vec::new();
        while let Ok(Some(name)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            seen.push(name);
        }
        // The queue holds two; the worker may already hold a third.
        assert!(seen.len() >= 2 && seen.len() <= 3, "unexpected deliveries: {seen:?}");
        assert_eq!(seen[0], "f0");
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }
}
