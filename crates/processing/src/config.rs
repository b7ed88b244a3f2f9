//! Pipeline configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs for the command-processing pipeline.
///
/// Reads from environment variables:
/// - `COMMAND_EXECUTOR_COUNT`: permits for commands reaching an idle mailbox (default: `64`)
/// - `WAITING_EXECUTOR_COUNT`: permits for commands that queued behind another (default: `64`)
/// - `RETRY_EXECUTOR_COUNT`: retry queue workers (default: `1`)
/// - `RETRY_INTERVAL_MS`: retry queue drain interval (default: `50`)
/// - `MAX_RETRIES`: conflict retries before giving up (default: `3`)
/// - `MAILBOX_DEPTH`: queued commands per aggregate (default: `1000`)
/// - `MAILBOX_IDLE_TIMEOUT_MS`: idle time before a mailbox retires (default: `30000`)
/// - `PUBLISH_RETRY_BASE_MS` / `PUBLISH_RETRY_MAX_MS`: publish backoff bounds (default: `100` / `10000`)
/// - `SNAPSHOT_INTERVAL`: snapshot every N versions, `0` disables (default: `0`)
/// - `COMMAND_TIMEOUT_MS`: default caller timeout, unset waits forever
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub command_executor_count: usize,
    pub waiting_executor_count: usize,
    pub retry_executor_count: usize,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub mailbox_depth: usize,
    pub mailbox_idle_timeout: Duration,
    pub publish_retry_base_delay: Duration,
    pub publish_retry_max_delay: Duration,
    pub snapshot_interval: u64,
    pub default_command_timeout: Option<Duration>,
}

impl ProcessingConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            command_executor_count: env_or("COMMAND_EXECUTOR_COUNT", defaults.command_executor_count),
            waiting_executor_count: env_or("WAITING_EXECUTOR_COUNT", defaults.waiting_executor_count),
            retry_executor_count: env_or("RETRY_EXECUTOR_COUNT", defaults.retry_executor_count),
            retry_interval: env_millis("RETRY_INTERVAL_MS").unwrap_or(defaults.retry_interval),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            mailbox_depth: env_or("MAILBOX_DEPTH", defaults.mailbox_depth),
            mailbox_idle_timeout: env_millis("MAILBOX_IDLE_TIMEOUT_MS")
                .unwrap_or(defaults.mailbox_idle_timeout),
            publish_retry_base_delay: env_millis("PUBLISH_RETRY_BASE_MS")
                .unwrap_or(defaults.publish_retry_base_delay),
            publish_retry_max_delay: env_millis("PUBLISH_RETRY_MAX_MS")
                .unwrap_or(defaults.publish_retry_max_delay),
            snapshot_interval: env_or("SNAPSHOT_INTERVAL", defaults.snapshot_interval),
            default_command_timeout: env_millis("COMMAND_TIMEOUT_MS"),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            command_executor_count: 64,
            waiting_executor_count: 64,
            retry_executor_count: 1,
            retry_interval: Duration::from_millis(50),
            max_retries: 3,
            mailbox_depth: 1000,
            mailbox_idle_timeout: Duration::from_secs(30),
            publish_retry_base_delay: Duration::from_millis(100),
            publish_retry_max_delay: Duration::from_secs(10),
            snapshot_interval: 0,
            default_command_timeout: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ProcessingConfig::default();
        assert_eq!(config.retry_executor_count, 1);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.mailbox_depth, 1000);
        assert_eq!(config.snapshot_interval, 0);
        assert!(config.default_command_timeout.is_none());
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        assert_eq!(env_or("PROCESSING_TEST_UNSET_KEY", 7usize), 7);
        assert!(env_millis("PROCESSING_TEST_UNSET_KEY").is_none());
    }
}
