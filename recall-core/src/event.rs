//! Cache lifecycle event kinds and payloads

use crate::{CacheKey, RecallError, StoreOp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Function name carried by events that come from administrative calls.
pub const ADMIN_FUNCTION: &str = "recall::admin";

/// Kinds of lifecycle events the cache publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CacheHit,
    CacheMiss,
    CacheSet,
    CacheDelete,
    CacheClear,
    CacheError,
    FunctionCallStart,
    FunctionCallEnd,
    FunctionError,
    BackendInit,
    BackendClose,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::CacheHit,
        EventKind::CacheMiss,
        EventKind::CacheSet,
        EventKind::CacheDelete,
        EventKind::CacheClear,
        EventKind::CacheError,
        EventKind::FunctionCallStart,
        EventKind::FunctionCallEnd,
        EventKind::FunctionError,
        EventKind::BackendInit,
        EventKind::BackendClose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::CacheSet => "cache_set",
            EventKind::CacheDelete => "cache_delete",
            EventKind::CacheClear => "cache_clear",
            EventKind::CacheError => "cache_error",
            EventKind::FunctionCallStart => "function_call_start",
            EventKind::FunctionCallEnd => "function_call_end",
            EventKind::FunctionError => "function_error",
            EventKind::BackendInit => "backend_init",
            EventKind::BackendClose => "backend_close",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        EventKind::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to event handlers.
///
/// Every event names its kind, the function it concerns and when it was
/// raised. The remaining fields are filled where they apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub function: String,
    pub timestamp: DateTime<Utc>,
    pub key: Option<CacheKey>,
    pub backend: Option<String>,
    /// Tier index within a tiered configuration.
    pub tier: Option<usize>,
    pub operation: Option<StoreOp>,
    pub duration: Option<Duration>,
    pub ttl: Option<Duration>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub positional_args: Option<usize>,
    pub named_args: Option<usize>,
}

impl CacheEvent {
    pub fn new(kind: EventKind, function: impl Into<String>) -> Self {
        Self {
            kind,
            function: function.into(),
            timestamp: Utc::now(),
            key: None,
            backend: None,
            tier: None,
            operation: None,
            duration: None,
            ttl: None,
            error: None,
            error_type: None,
            positional_args: None,
            named_args: None,
        }
    }

    pub fn with_key(mut self, key: &CacheKey) -> Self {
        self.key = Some(key.clone());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_tier(mut self, tier: usize) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_operation(mut self, operation: StoreOp) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_error(mut self, error: &RecallError) -> Self {
        self.error = Some(error.to_string());
        self.error_type = Some(error.type_name().to_string());
        self
    }

    /// Attach an error that did not come from the cache layer.
    pub fn with_error_message(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_arg_counts(mut self, positional: usize, named: usize) -> Self {
        self.positional_args = Some(positional);
        self.named_args = Some(named);
        self
    }
}
