//! Error types for recall operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Cache-layer operation that produced a failure.
///
/// `Key` marks key derivation and `Route` marks resolving an operation's
/// tiers against the registered backends. Both happen before any store is
/// touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Open,
    Get,
    Set,
    Delete,
    Clear,
    Lock,
    Close,
    Key,
    Route,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Open => "open",
            StoreOp::Get => "get",
            StoreOp::Set => "set",
            StoreOp::Delete => "delete",
            StoreOp::Clear => "clear",
            StoreOp::Lock => "lock",
            StoreOp::Close => "close",
            StoreOp::Key => "key",
            StoreOp::Route => "route",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while deriving a cache key from call arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyGenerationError {
    #[error("Argument {argument} of {function} cannot be keyed: {reason}")]
    NonDeterministic {
        function: String,
        argument: String,
        reason: String,
    },

    #[error("Custom key builder for {function} failed: {reason}")]
    BuilderFailed { function: String, reason: String },

    #[error("Failed to canonicalize arguments of {function}: {reason}")]
    Canonicalization { function: String, reason: String },
}

/// Store (backend) errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {backend} failed during {operation}: {reason}")]
    OperationFailed {
        backend: String,
        operation: StoreOp,
        reason: String,
    },

    #[error("Backend {backend} exceeded its {timeout:?} deadline during {operation}")]
    DeadlineExceeded {
        backend: String,
        operation: StoreOp,
        timeout: Duration,
    },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Corrupt cache entry for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Backend {backend} lock poisoned")]
    LockPoisoned { backend: String },
}

/// Returned instead of calling a store whose circuit is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit open for backend {backend}")]
pub struct CircuitOpenError {
    pub backend: String,
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock on {key}")]
    Timeout { key: String, timeout: Duration },

    #[error("Backend {backend} does not support distributed locks")]
    Unsupported { backend: String },
}

/// Configuration errors. These fail at wrap time, never during a call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No backend registered under name {name}")]
    MissingBackend { name: String },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("No storage tiers resolved for {function}")]
    NoTiers { function: String },
}

/// Event bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Event handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("Async event handlers require a running Tokio runtime")]
    NoRuntime,
}

/// Master error type for all recall errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecallError {
    #[error("Key generation error: {0}")]
    Key(#[from] KeyGenerationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),
}

impl RecallError {
    /// Short type name carried in `error_type` of event payloads.
    pub fn type_name(&self) -> &'static str {
        match self {
            RecallError::Key(_) => "KeyGenerationError",
            RecallError::Backend(BackendError::Serialization { .. }) => "SerializationError",
            RecallError::Backend(BackendError::DeadlineExceeded { .. }) => "DeadlineExceeded",
            RecallError::Backend(_) => "BackendError",
            RecallError::CircuitOpen(_) => "CircuitOpenError",
            RecallError::Lock(LockError::Timeout { .. }) => "LockTimeoutError",
            RecallError::Lock(LockError::Unsupported { .. }) => "LockUnsupported",
            RecallError::Config(_) => "ConfigError",
            RecallError::Event(_) => "EventError",
        }
    }
}

/// Result type for recall operations.
pub type RecallResult<T> = Result<T, RecallError>;
