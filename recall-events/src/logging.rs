//! Subscriber that forwards cache events to `tracing`

use crate::bus::{EventBus, EventHandler, SubscriptionId};
use recall_core::{CacheEvent, EventError, EventKind};
use std::sync::Arc;

/// Logs errors at warn level and everything else at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSubscriber {
    verbose: bool,
}

impl LoggingSubscriber {
    /// Only error events are logged.
    pub fn errors_only() -> Self {
        Self { verbose: false }
    }

    /// Every event kind is logged.
    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        if self.verbose {
            EventKind::ALL.to_vec()
        } else {
            vec![EventKind::CacheError, EventKind::FunctionError]
        }
    }

    pub fn install(self, bus: &EventBus) -> Vec<(EventKind, SubscriptionId)> {
        let kinds = self.kinds();
        bus.subscribe_many(&kinds, Arc::new(self))
    }
}

impl EventHandler for LoggingSubscriber {
    fn handle(&self, event: &CacheEvent) -> Result<(), EventError> {
        let key = event.key.as_ref().map(|k| k.as_str()).unwrap_or("-");
        match event.kind {
            EventKind::CacheError => {
                tracing::warn!(
                    function = %event.function,
                    key = key,
                    backend = event.backend.as_deref().unwrap_or("-"),
                    operation = ?event.operation,
                    error_type = event.error_type.as_deref().unwrap_or("-"),
                    error = event.error.as_deref().unwrap_or("-"),
                    "Cache operation failed"
                );
            }
            EventKind::FunctionError => {
                tracing::warn!(
                    function = %event.function,
                    key = key,
                    duration_ms = event.duration.map(|d| d.as_millis() as u64),
                    error = event.error.as_deref().unwrap_or("-"),
                    "Cached function failed"
                );
            }
            kind => {
                tracing::debug!(
                    event_kind = %kind,
                    function = %event.function,
                    key = key,
                    backend = event.backend.as_deref().unwrap_or("-"),
                    tier = event.tier,
                    "Cache event"
                );
            }
        }
        Ok(())
    }
}
