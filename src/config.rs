use std::time::Duration;

use crate::limits::{MAX_HOLD_TTL_MS, MIN_HOLD_TTL_MS};
use crate::model::Ms;

/// Per-engine policy. Every tenant engine gets a copy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL applied to a hold when the caller does not ask for one.
    pub hold_ttl_ms: Ms,
    /// How long an operation waits for a trip's lock before giving up with `Conflict`.
    pub lock_wait: Duration,
    /// Period of the expiry sweeper.
    pub sweep_interval: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Settled holds older than this are dropped when the WAL is compacted.
    pub history_retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 600_000,
            lock_wait: Duration::from_millis(2_000),
            sweep_interval: Duration::from_millis(5_000),
            compact_threshold: 1_000,
            history_retention_ms: 7 * 24 * 3_600_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Defaults overridden by any `SEATD_*` variables that are set and parse.
    /// Fails if the default hold TTL is outside the range acquire accepts.
    pub fn from_env() -> Result<Self, String> {
        let d = Self::default();
        let hold_ttl_ms = match env_parse::<Ms>("SEATD_HOLD_TTL_SECS") {
            Some(secs) => hold_ttl_from_secs(secs)?,
            None => d.hold_ttl_ms,
        };
        Ok(Self {
            hold_ttl_ms,
            lock_wait: env_parse("SEATD_LOCK_WAIT_MS")
                .map_or(d.lock_wait, Duration::from_millis),
            sweep_interval: env_parse("SEATD_SWEEP_INTERVAL_MS")
                .map_or(d.sweep_interval, Duration::from_millis),
            compact_threshold: env_parse("SEATD_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            history_retention_ms: env_parse("SEATD_HISTORY_RETENTION_MS")
                .unwrap_or(d.history_retention_ms),
        })
    }
}

fn hold_ttl_from_secs(secs: Ms) -> Result<Ms, String> {
    secs.checked_mul(1000)
        .filter(|ms| (MIN_HOLD_TTL_MS..=MAX_HOLD_TTL_MS).contains(ms))
        .ok_or_else(|| {
            format!(
                "SEATD_HOLD_TTL_SECS={secs} is outside 1..={} seconds",
                MAX_HOLD_TTL_MS / 1000
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_checkout_policy() {
        let c = EngineConfig::default();
        assert_eq!(c.hold_ttl_ms, 600_000);
        assert_eq!(c.sweep_interval, Duration::from_secs(5));
        assert_eq!(c.compact_threshold, 1_000);
    }

    #[test]
    fn hold_ttl_must_fit_acquire_bounds() {
        assert_eq!(hold_ttl_from_secs(900), Ok(900_000));
        assert_eq!(hold_ttl_from_secs(MAX_HOLD_TTL_MS / 1000), Ok(MAX_HOLD_TTL_MS));
        assert!(hold_ttl_from_secs(0).is_err());
        assert!(hold_ttl_from_secs(-30).is_err());
        assert!(hold_ttl_from_secs(MAX_HOLD_TTL_MS / 1000 + 1).is_err());
        assert!(hold_ttl_from_secs(Ms::MAX).is_err());
    }

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(env_parse::<u64>("SEATD_TEST_SURELY_UNSET_VAR"), None);
    }
}
