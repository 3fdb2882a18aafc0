//! Hit/miss accounting built from published events

use crate::bus::{EventBus, EventHandler, SubscriptionId};
use recall_core::{CacheEvent, EventError, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counters for one function, or for all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub clears: u64,
    pub cache_errors: u64,
    pub calls: u64,
    pub function_errors: u64,
    pub call_time: Duration,
}

impl CacheCounters {
    /// Fraction of lookups that were hits, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn apply(&mut self, event: &CacheEvent) {
        match event.kind {
            EventKind::CacheHit => self.hits += 1,
            EventKind::CacheMiss => self.misses += 1,
            EventKind::CacheSet => self.sets += 1,
            EventKind::CacheDelete => self.deletes += 1,
            EventKind::CacheClear => self.clears += 1,
            EventKind::CacheError => self.cache_errors += 1,
            EventKind::FunctionCallEnd => {
                self.calls += 1;
                self.call_time += event.duration.unwrap_or_default();
            }
            EventKind::FunctionError => {
                self.calls += 1;
                self.function_errors += 1;
                self.call_time += event.duration.unwrap_or_default();
            }
            EventKind::FunctionCallStart | EventKind::BackendInit | EventKind::BackendClose => {}
        }
    }
}

/// Point-in-time copy of collected statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub totals: CacheCounters,
    pub functions: HashMap<String, CacheCounters>,
    pub backends_open: u64,
}

impl StatsSnapshot {
    pub fn function(&self, name: &str) -> Option<&CacheCounters> {
        self.functions.get(name)
    }
}

#[derive(Default)]
struct StatsInner {
    totals: CacheCounters,
    functions: HashMap<String, CacheCounters>,
    backends_open: u64,
}

/// Event subscriber that keeps running totals.
#[derive(Default)]
pub struct StatsCollector {
    inner: Mutex<StatsInner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector subscribed to every event kind on `bus`.
    pub fn attach(bus: &EventBus) -> (Arc<Self>, Vec<(EventKind, SubscriptionId)>) {
        let collector = Arc::new(Self::new());
        let ids = bus.subscribe_many(&EventKind::ALL, Arc::clone(&collector) as Arc<dyn EventHandler>);
        (collector, ids)
    }

    pub fn record(&self, event: &CacheEvent) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match event.kind {
            EventKind::BackendInit => inner.backends_open += 1,
            EventKind::BackendClose => inner.backends_open = inner.backends_open.saturating_sub(1),
            _ => {}
        }
        inner.totals.apply(event);
        if !matches!(event.kind, EventKind::BackendInit | EventKind::BackendClose) {
            inner
                .functions
                .entry(event.function.clone())
                .or_default()
                .apply(event);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .lock()
            .map(|inner| StatsSnapshot {
                totals: inner.totals.clone(),
                functions: inner.functions.clone(),
                backends_open: inner.backends_open,
            })
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let backends_open = inner.backends_open;
            *inner = StatsInner {
                backends_open,
                ..StatsInner::default()
            };
        }
    }
}

impl EventHandler for StatsCollector {
    fn handle(&self, event: &CacheEvent) -> Result<(), EventError> {
        self.record(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_function_and_total() {
        let bus = EventBus::new();
        let (stats, _) = StatsCollector::attach(&bus);

        bus.publish(CacheEvent::new(EventKind::CacheMiss, "square"));
        bus.publish(CacheEvent::new(EventKind::FunctionCallEnd, "square").with_duration(Duration::from_millis(4)));
        bus.publish(CacheEvent::new(EventKind::CacheSet, "square"));
        bus.publish(CacheEvent::new(EventKind::CacheHit, "square"));
        bus.publish(CacheEvent::new(EventKind::CacheHit, "cube"));

        let snapshot = stats.snapshot();
        let square = snapshot.function("square").expect("square should have counters");
        assert_eq!(square.hits, 1);
        assert_eq!(square.misses, 1);
        assert_eq!(square.sets, 1);
        assert_eq!(square.calls, 1);
        assert_eq!(square.call_time, Duration::from_millis(4));
        assert!((square.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.totals.hits, 2);
    }

    #[test]
    fn test_backend_lifecycle_and_reset() {
        let stats = StatsCollector::new();
        stats.record(&CacheEvent::new(EventKind::BackendInit, "memory"));
        stats.record(&CacheEvent::new(EventKind::BackendInit, "lmdb"));
        stats.record(&CacheEvent::new(EventKind::BackendClose, "lmdb"));
        stats.record(&CacheEvent::new(EventKind::CacheError, "f"));
        assert_eq!(stats.snapshot().backends_open, 1);
        assert!(stats.snapshot().function("memory").is_none());

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.totals, CacheCounters::default());
        assert_eq!(snapshot.backends_open, 1);
    }

    #[test]
    fn test_hit_rate_without_lookups_is_zero() {
        assert_eq!(CacheCounters::default().hit_rate(), 0.0);
    }
}
