//! Engine tuning knobs.

use std::str::FromStr;
use std::time::Duration;

use crate::{EngineError, models::RetryConfig};

/// Runtime configuration for [`crate::WorkflowEngine`] and its workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Jobs processed concurrently by one worker process.
    pub worker_concurrency: usize,
    /// Sleep between queue polls when the queue is empty.
    pub poll_interval: Duration,
    /// DELAY nodes at or below this block the worker; longer ones are deferred.
    pub inline_delay_threshold: Duration,
    /// Retry settings used when neither node nor workflow specify them.
    pub default_retry: RetryConfig,
    /// Wall-clock limit for sandboxed CUSTOM plugins.
    pub sandbox_timeout: Duration,
    /// TTL of cached API_PROXY GET responses.
    pub api_cache_ttl: Duration,
    /// Per-request timeout of API_PROXY calls.
    pub http_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
    /// How long a claimed job may stay unacknowledged before it is handed
    /// out again. Must exceed the longest plugin run.
    pub job_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            poll_interval: Duration::from_millis(200),
            inline_delay_threshold: Duration::from_millis(5_000),
            default_retry: RetryConfig::default(),
            sandbox_timeout: Duration::from_millis(30_000),
            api_cache_ttl: Duration::from_secs(300),
            http_timeout: Duration::from_secs(30),
            event_buffer: 1024,
            job_lease: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `DAGRUN_*` environment variables:
    ///
    /// | variable                          | unit |
    /// |-----------------------------------|------|
    /// | `DAGRUN_WORKER_CONCURRENCY`       |      |
    /// | `DAGRUN_POLL_INTERVAL_MS`         | ms   |
    /// | `DAGRUN_INLINE_DELAY_THRESHOLD_MS`| ms   |
    /// | `DAGRUN_RETRY_MAX_ATTEMPTS`       |      |
    /// | `DAGRUN_RETRY_BACKOFF_MS`         | ms   |
    /// | `DAGRUN_RETRY_BACKOFF_MULTIPLIER` |      |
    /// | `DAGRUN_SANDBOX_TIMEOUT_MS`       | ms   |
    /// | `DAGRUN_API_CACHE_TTL_SECS`       | s    |
    /// | `DAGRUN_HTTP_TIMEOUT_MS`          | ms   |
    /// | `DAGRUN_JOB_LEASE_SECS`           | s    |
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, EngineError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<T>()
                        .map_err(|_| EngineError::Config(format!("{key} has an invalid value '{raw}'")))
                })
                .transpose()
        }

        let mut config = Self::default();
        if let Some(n) = parse::<usize>(&lookup, "DAGRUN_WORKER_CONCURRENCY")? {
            if n == 0 {
                return Err(EngineError::Config("DAGRUN_WORKER_CONCURRENCY must be at least 1".into()));
            }
            config.worker_concurrency = n;
        }
        if let Some(ms) = parse(&lookup, "DAGRUN_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "DAGRUN_INLINE_DELAY_THRESHOLD_MS")? {
            config.inline_delay_threshold = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "DAGRUN_RETRY_MAX_ATTEMPTS")? {
            config.default_retry.max_attempts = n;
        }
        if let Some(ms) = parse(&lookup, "DAGRUN_RETRY_BACKOFF_MS")? {
            config.default_retry.backoff_ms = ms;
        }
        if let Some(m) = parse(&lookup, "DAGRUN_RETRY_BACKOFF_MULTIPLIER")? {
            config.default_retry.backoff_multiplier = m;
        }
        if let Some(ms) = parse(&lookup, "DAGRUN_SANDBOX_TIMEOUT_MS")? {
            config.sandbox_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "DAGRUN_API_CACHE_TTL_SECS")? {
            config.api_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "DAGRUN_HTTP_TIMEOUT_MS")? {
            config.http_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "DAGRUN_JOB_LEASE_SECS")? {
            if secs == 0 {
                return Err(EngineError::Config("DAGRUN_JOB_LEASE_SECS must be at least 1".into()));
            }
            config.job_lease = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn environment_overrides_defaults() {
        let env = HashMap::from([
            ("DAGRUN_WORKER_CONCURRENCY", "2"),
            ("DAGRUN_RETRY_BACKOFF_MULTIPLIER", "3.5"),
            ("DAGRUN_INLINE_DELAY_THRESHOLD_MS", "100"),
            ("DAGRUN_JOB_LEASE_SECS", "45"),
        ]);
        let config = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.default_retry.backoff_multiplier, 3.5);
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.inline_delay_threshold, Duration::from_millis(100));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.job_lease, Duration::from_secs(45));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = EngineConfig::from_lookup(|k| (k == "DAGRUN_HTTP_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DAGRUN_HTTP_TIMEOUT_MS"));

        assert!(EngineConfig::from_lookup(|k| (k == "DAGRUN_WORKER_CONCURRENCY").then(|| "0".into())).is_err());
    }
}
