//! Tracing subscriber setup.
//!
//! Libraries normally leave subscriber installation to the application.
//! [`init_tracing`] is a convenience for binaries and tests that want the
//! cache's logs without wiring `tracing-subscriber` themselves.

use recall_core::{CacheSettings, ConfigError, RecallResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "RECALL_LOG";

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter directives used when neither `RECALL_LOG` nor `RUST_LOG` is set
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Read `RECALL_LOG_LEVEL` and `RECALL_LOG_FORMAT` (`json` or `text`).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filter: std::env::var("RECALL_LOG_LEVEL").unwrap_or(defaults.filter),
            json: std::env::var("RECALL_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json),
            with_target: defaults.with_target,
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            filter: settings.log_level.clone(),
            ..Self::default()
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn env_filter(&self) -> RecallResult<EnvFilter> {
        let from_env = std::env::var(LOG_ENV_VAR)
            .ok()
            .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok());
        if let Some(directives) = from_env {
            if let Ok(filter) = EnvFilter::try_new(&directives) {
                return Ok(filter);
            }
        }
        EnvFilter::try_new(&self.filter).map_err(|e| {
            ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.filter.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Install a global `fmt` subscriber.
///
/// Returns `Ok` without changes when a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> RecallResult<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(filter = %config.filter, json = config.json, "Telemetry initialized");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Tracing subscriber already installed");
        }
    }
    Ok(())
}
