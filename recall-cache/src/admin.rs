//! Administrative operations for tooling.
//!
//! Thin callers of the router and registry. Events they publish use
//! [`ADMIN_FUNCTION`] as the function name.

use crate::cache::Cache;
use recall_core::{CacheEvent, CacheKey, CircuitState, EventKind, RecallResult, StoreOp, ADMIN_FUNCTION};
use recall_events::StatsSnapshot;
use recall_storage::{StoreStats, TierReport, TieredRouter};
use std::collections::BTreeMap;
use std::sync::Arc;

impl Cache {
    /// Router over every registered backend, or `None` when there are none.
    fn router_over_all(&self) -> Option<TieredRouter> {
        let tiers = self.inner.registry.all_tiers();
        TieredRouter::new(tiers, Arc::clone(&self.inner.bus), self.inner.settings.store_timeout).ok()
    }

    /// Clear every registered backend.
    pub async fn clear_all(&self) -> TierReport {
        let Some(router) = self.router_over_all() else {
            return TierReport::default();
        };
        let report = router.clear(ADMIN_FUNCTION).await;
        self.inner.tags.clear();
        for tier in router.tiers() {
            self.inner
                .bus
                .publish(CacheEvent::new(EventKind::CacheClear, ADMIN_FUNCTION).with_backend(tier.name()));
        }
        tracing::info!(backends = report.attempted, failures = report.failures.len(), "Cleared all backends");
        report
    }

    /// Delete one key from every registered backend.
    pub async fn delete_key(&self, key: &CacheKey) -> TierReport {
        let Some(router) = self.router_over_all() else {
            return TierReport::default();
        };
        self.delete_with(&router, key).await
    }

    /// Delete one key from the named backends only.
    pub async fn delete_key_in(&self, backends: &[String], key: &CacheKey) -> RecallResult<TierReport> {
        let router = self.router_over(backends)?;
        Ok(self.delete_with(&router, key).await)
    }

    async fn delete_with(&self, router: &TieredRouter, key: &CacheKey) -> TierReport {
        let report = router.delete(ADMIN_FUNCTION, key).await;
        self.inner.tags.forget(key);
        self.inner
            .bus
            .publish(CacheEvent::new(EventKind::CacheDelete, ADMIN_FUNCTION).with_key(key));
        report
    }

    /// Delete every entry this process wrote with `tag`.
    pub async fn invalidate_tag(&self, tag: &str) -> TierReport {
        let mut report = TierReport::default();
        let entries = self.inner.tags.take(tag);
        let count = entries.len();
        for (key, backends) in entries {
            match self.router_over(&backends) {
                Ok(router) => report.merge(self.delete_with(&router, &key).await),
                Err(e) => {
                    tracing::warn!(tag = tag, key = %key, error = %e, "Tagged entry's backend is gone");
                    self.inner.bus.publish(
                        CacheEvent::new(EventKind::CacheError, ADMIN_FUNCTION)
                            .with_key(&key)
                            .with_operation(StoreOp::Delete)
                            .with_error(&e),
                    );
                }
            }
        }
        tracing::debug!(tag = tag, keys = count, "Invalidated tag");
        report
    }

    /// Drop expired entries from every backend and the tag index.
    /// Returns the number of store entries removed.
    pub async fn purge_expired(&self) -> u64 {
        let unlinked = self.inner.tags.prune_expired();
        tracing::debug!(tag_links = unlinked, "Pruned expired tag links");
        let mut purged = 0;
        for tier in self.inner.registry.all_tiers() {
            match tier.store().purge_expired().await {
                Ok(n) => purged += n,
                Err(e) => {
                    tracing::warn!(backend = %tier.name(), error = %e, "Purge failed");
                    self.inner.bus.publish(
                        CacheEvent::new(EventKind::CacheError, ADMIN_FUNCTION)
                            .with_backend(tier.name())
                            .with_error(&e.into()),
                    );
                }
            }
        }
        purged
    }

    /// Counters collected from the event bus.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Per-backend store statistics. Backends that fail to answer are left out.
    pub async fn backend_stats(&self) -> BTreeMap<String, StoreStats> {
        let mut out = BTreeMap::new();
        for tier in self.inner.registry.all_tiers() {
            match tier.store().stats().await {
                Ok(stats) => {
                    out.insert(tier.name().to_string(), stats);
                }
                Err(e) => tracing::warn!(backend = %tier.name(), error = %e, "Stats unavailable"),
            }
        }
        out
    }

    pub fn circuit_state(&self, backend: &str) -> Option<CircuitState> {
        self.inner.registry.breaker(backend).map(|b| b.state())
    }

    /// Close every backend and publish `backend_close` for each.
    pub async fn shutdown(&self) -> TierReport {
        let Some(router) = self.router_over_all() else {
            return TierReport::default();
        };
        let report = router.close(ADMIN_FUNCTION).await;
        for tier in router.tiers() {
            self.inner
                .bus
                .publish(CacheEvent::new(EventKind::BackendClose, ADMIN_FUNCTION).with_backend(tier.name()));
        }
        tracing::info!(backends = report.attempted, "Cache shut down");
        report
    }
}
