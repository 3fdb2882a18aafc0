//! Per-backend circuit breaker.
//!
//! Closed: calls pass, consecutive failures are counted. Reaching the
//! threshold opens the circuit. Open: calls are rejected until the timeout
//! has elapsed since opening, then exactly one caller is let through as a
//! half-open trial. The trial's success closes the circuit, its failure
//! re-opens it and restarts the timeout.

use recall_core::{CircuitBreakerConfig, CircuitOpenError, CircuitState};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Circuit breaker guarding one backend identity.
pub struct CircuitBreaker {
    backend: String,
    state: AtomicU8,
    failure_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            config,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            backend: self.backend.clone(),
        }
    }

    fn timeout_elapsed(&self) -> bool {
        match self.opened_at.read() {
            Ok(guard) => guard.map_or(true, |at| at.elapsed() >= self.config.timeout),
            Err(_) => true,
        }
    }

    /// Ask permission for one backend call.
    ///
    /// The returned permit must be settled with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. An unsettled trial permit counts as a
    /// failure when dropped.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        match self.state() {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                if self.timeout_elapsed()
                    && self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                {
                    tracing::debug!(backend = %self.backend, "Circuit half-open, allowing trial call");
                    return Ok(BreakerPermit::new(self, true));
                }
                Err(self.open_error())
            }
            CircuitState::HalfOpen => Err(self.open_error()),
        }
    }

    fn on_success(&self, trial: bool) {
        self.failure_count.store(0, Ordering::SeqCst);
        if trial {
            self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
            tracing::info!(backend = %self.backend, "Circuit closed after successful trial");
        }
    }

    fn on_failure(&self, trial: bool) {
        if trial {
            self.trip();
            tracing::warn!(backend = %self.backend, "Trial call failed, circuit re-opened");
            return;
        }
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.failure_threshold && self.state() == CircuitState::Closed {
            self.trip();
            tracing::warn!(
                backend = %self.backend,
                failures = count,
                timeout_secs = self.config.timeout.as_secs(),
                "Circuit opened"
            );
        }
    }

    fn trip(&self) {
        // Timestamp first, so anyone observing Open reads the new time.
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = Some(Instant::now());
        }
        self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = None;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Permission for a single call through a [`CircuitBreaker`].
#[must_use = "a permit must be settled with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}
