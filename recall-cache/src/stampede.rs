//! Early refresh of entries close to expiry.
//!
//! Refresh probability is a linear ramp over the final `window` fraction of
//! an entry's TTL: zero before the window opens, one at expiry. Entries
//! without a TTL are never refreshed early.

use chrono::{DateTime, Utc};
use recall_core::StampedeConfig;
use recall_storage::EntryHeader;

/// Probability in `[0.0, 1.0]` that a hit at `now` should trigger a refresh.
pub fn refresh_probability(header: &EntryHeader, now: DateTime<Utc>, window: f64) -> f64 {
    let Some(ttl) = header.ttl else {
        return 0.0;
    };
    if ttl.is_zero() || window <= 0.0 {
        return 0.0;
    }
    let elapsed = header.age(now).as_secs_f64() / ttl.as_secs_f64();
    let opens_at = 1.0 - window.min(1.0);
    if elapsed <= opens_at {
        return 0.0;
    }
    ((elapsed - opens_at) / window.min(1.0)).min(1.0)
}

/// Decide with a caller-supplied roll in `[0.0, 1.0)`.
pub fn should_refresh(config: &StampedeConfig, header: &EntryHeader, now: DateTime<Utc>, roll: f64) -> bool {
    config.enabled && roll < refresh_probability(header, now, config.window)
}
