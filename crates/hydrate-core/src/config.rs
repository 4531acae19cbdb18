//! Runtime configuration.
//!
//! `HydrationConfig::default()` is usable as-is for development and tests;
//! deployments override individual values through `HYDRATE_*` variables.

use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HydrationConfig {
    /// Outbox queue / delivery namespace for hydration jobs.
    pub queue_name: String,
    pub default_max_attempts: u32,
    pub worker_count: usize,
    /// How long a worker blocks on an empty queue before re-checking shutdown.
    pub poll_timeout: Duration,
    /// Hard timeout around each generation call.
    pub generation_timeout: Duration,
    pub reconcile_interval: Duration,
    pub lock_name: String,
    /// A reconciliation lock older than this may be taken over.
    pub lock_ttl: Duration,
    /// Running jobs without output whose claim is older than this are reaped.
    pub stale_claim_after: Duration,
    /// Pending jobs with no live delivery intent for this long get a new one.
    pub requeue_after: Duration,
    pub reaper_interval: Duration,
    pub publish_interval: Duration,
    pub publish_batch: usize,
    pub kill_switch_ttl: Duration,
    pub store_retry: RetryPolicy,
    pub evidence_retry: RetryPolicy,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            queue_name: "hydration".to_string(),
            default_max_attempts: 3,
            worker_count: 4,
            poll_timeout: Duration::from_millis(500),
            generation_timeout: Duration::from_secs(90),
            reconcile_interval: Duration::from_secs(5),
            lock_name: "hydration_reconciler".to_string(),
            lock_ttl: Duration::from_secs(300),
            stale_claim_after: Duration::from_secs(600),
            requeue_after: Duration::from_secs(120),
            reaper_interval: Duration::from_secs(30),
            publish_interval: Duration::from_millis(250),
            publish_batch: 100,
            kill_switch_ttl: Duration::from_secs(5),
            store_retry: RetryPolicy::store_writes(),
            evidence_retry: RetryPolicy::evidence(),
        }
    }
}

impl HydrationConfig {
    /// Defaults overridden by `HYDRATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(queue) = lookup("HYDRATE_QUEUE") {
            config.queue_name = queue;
        }
        if let Some(v) = parse::<u32>(&lookup, "HYDRATE_MAX_ATTEMPTS")? {
            config.default_max_attempts = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "HYDRATE_WORKERS")? {
            config.worker_count = v;
        }
        if let Some(v) = millis(&lookup, "HYDRATE_GENERATION_TIMEOUT_MS")? {
            config.generation_timeout = v;
        }
        if let Some(v) = millis(&lookup, "HYDRATE_RECONCILE_INTERVAL_MS")? {
            config.reconcile_interval = v;
        }
        if let Some(v) = secs(&lookup, "HYDRATE_LOCK_TTL_SECS")? {
            config.lock_ttl = v;
        }
        if let Some(v) = secs(&lookup, "HYDRATE_STALE_CLAIM_SECS")? {
            config.stale_claim_after = v;
        }
        if let Some(v) = secs(&lookup, "HYDRATE_REQUEUE_SECS")? {
            config.requeue_after = v;
        }
        if let Some(v) = millis(&lookup, "HYDRATE_KILL_SWITCH_TTL_MS")? {
            config.kill_switch_ttl = v;
        }

        if config.default_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "HYDRATE_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = after;
        self
    }

    pub fn with_requeue_after(mut self, after: Duration) -> Self {
        self.requeue_after = after;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_kill_switch_ttl(mut self, ttl: Duration) -> Self {
        self.kill_switch_ttl = ttl;
        self
    }

    pub fn with_evidence_retry(mut self, policy: RetryPolicy) -> Self {
        self.evidence_retry = policy;
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_secs))
}
