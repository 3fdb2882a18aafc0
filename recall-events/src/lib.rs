//! Recall Events - Lifecycle Event Bus
//!
//! The cache publishes an event at every step of a call: lookups, writes,
//! executions and failures. This crate owns the dispatch and two built-in
//! subscribers.
//!
//! # Key Types
//!
//! - `EventBus`: subscription registry and dispatcher
//! - `EventHandler` / `AsyncEventHandler`: inline and queued handlers
//! - `StatsCollector`: hit/miss counters per function
//! - `LoggingSubscriber`: forwards events to `tracing`

mod bus;
mod logging;
mod stats;

pub use bus::{AsyncEventHandler, EventBus, EventHandler, SubscriptionId};
pub use logging::LoggingSubscriber;
pub use stats::{CacheCounters, StatsCollector, StatsSnapshot};
