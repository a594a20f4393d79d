use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recognized configuration (spec.md §6.2), loaded from environment
/// variables the way `bpmn-lite-server`'s `main.rs` reads `DATABASE_URL`.
///
/// `AllocatorConfig::from_env()` reads `dotenvy`-loaded environment
/// variables, falling back to the documented defaults for anything unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Fixed period of the allocate task.
    pub allocator_period: Duration,
    /// Max span below top importance considered in one scan.
    pub allocator_importance_span: i64,
    /// Fixed period of the expiry task.
    pub keepalive_expiry_period: Duration,
    /// Cron expression for the tombstone task.
    pub history_schedule: String,
    /// Minimum age before a dead job is tombstoned.
    pub history_grace_period: Duration,
    /// Fixed triad depth. Always 3.
    pub triad_depth: i32,
    /// Cap on live-job scan per quota-sweep pass.
    pub max_quota_check_batch: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            allocator_period: Duration::from_secs(5),
            allocator_importance_span: 10,
            keepalive_expiry_period: Duration::from_secs(30),
            history_schedule: "0 0 3 * * *".to_string(),
            history_grace_period: Duration::from_secs(24 * 60 * 60),
            triad_depth: 3,
            max_quota_check_batch: 100_000,
        }
    }
}

impl AllocatorConfig {
    /// Read configuration from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allocator_period: env_secs("ALLOCATOR_PERIOD_SECS", defaults.allocator_period),
            allocator_importance_span: env_i64(
                "ALLOCATOR_IMPORTANCE_SPAN",
                defaults.allocator_importance_span,
            ),
            keepalive_expiry_period: env_secs(
                "KEEPALIVE_EXPIRY_PERIOD_SECS",
                defaults.keepalive_expiry_period,
            ),
            history_schedule: std::env::var("HISTORY_SCHEDULE")
                .unwrap_or(defaults.history_schedule),
            history_grace_period: env_secs(
                "HISTORY_GRACE_PERIOD_SECS",
                defaults.history_grace_period,
            ),
            triad_depth: defaults.triad_depth,
            max_quota_check_batch: env_usize(
                "MAX_QUOTA_CHECK_BATCH",
                defaults.max_quota_check_batch,
            ),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AllocatorConfig::default();
        assert_eq!(cfg.max_quota_check_batch, 100_000);
        assert_eq!(cfg.triad_depth, 3);
    }
}
