//! Job queue configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid job queue configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Per-queue overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Worker pool size; falls back to `default_concurrency`.
    pub concurrency: Option<usize>,
    /// Start with buffering active for this queue.
    pub buffering: bool,
    #[serde(with = "option_duration_ms")]
    pub job_timeout: Option<Duration>,
}

/// Settings of the job queue engine.
///
/// Durations are written in milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Retries given to jobs added without an explicit count.
    pub default_retries: u32,
    pub default_concurrency: usize,
    /// Pause between claim attempts on an empty queue.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Grace period for in-flight jobs on stop.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// A RUNNING job without a heartbeat for this long is considered abandoned.
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "option_duration_ms")]
    pub job_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    /// Upper bound of the backoff applied when the store is unreachable.
    #[serde(with = "duration_ms")]
    pub store_backoff_max: Duration,
    pub queues: HashMap<String, QueueOptions>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            default_retries: 0,
            default_concurrency: 1,
            poll_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            job_timeout: None,
            retry_policy: RetryPolicy::default(),
            store_backoff_max: Duration::from_secs(30),
            queues: HashMap::new(),
        }
    }
}

impl JobQueueConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue(mut self, name: impl Into<String>, options: QueueOptions) -> Self {
        self.queues.insert(name.into(), options);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "default_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .queues
            .iter()
            .find(|(_, opts)| opts.concurrency == Some(0))
        {
            return Err(ConfigError::Invalid(format!(
                "queue '{name}' has a concurrency of 0"
            )));
        }
        if self.poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval and sweep_interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.stale_after {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval ({:?}) must be non-zero and shorter than stale_after ({:?})",
                self.heartbeat_interval, self.stale_after
            )));
        }
        Ok(())
    }

    pub fn concurrency_for(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .and_then(|q| q.concurrency)
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    pub fn job_timeout_for(&self, queue_name: &str) -> Option<Duration> {
        self.queues
            .get(queue_name)
            .and_then(|q| q.job_timeout)
            .or(self.job_timeout)
    }

    /// Queues configured to start out buffering.
    pub fn buffered_queues(&self) -> impl Iterator<Item = &str> {
        self.queues
            .iter()
            .filter(|(_, opts)| opts.buffering)
            .map(|(name, _)| name.as_str())
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis().min(u64::MAX as u128) as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BackoffStrategy;

    #[test]
    fn defaults_are_valid() {
        let config = JobQueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_retries, 0);
        assert_eq!(config.concurrency_for("anything"), 1);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.job_timeout_for("anything"), None);
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = JobQueueConfig::from_json(
            r#"{
                "default_retries": 3,
                "job_timeout": 30000,
                "retry_policy": { "strategy": "linear", "base_delay": 500 },
                "queues": {
                    "send-email": { "concurrency": 4, "buffering": true },
                    "asset-preview": { "job_timeout": 5000 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_retries, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_policy.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry_policy.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry_policy.max_delay, Duration::from_secs(60));
        assert_eq!(config.concurrency_for("send-email"), 4);
        assert_eq!(config.job_timeout_for("send-email"), Some(Duration::from_secs(30)));
        assert_eq!(config.job_timeout_for("asset-preview"), Some(Duration::from_secs(5)));
        assert_eq!(config.buffered_queues().collect::<Vec<_>>(), vec!["send-email"]);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = JobQueueConfig::from_json(r#"{ "queues": { "q": { "concurrency": 0 } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_heartbeat_slower_than_staleness() {
        let config = JobQueueConfig {
            heartbeat_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            JobQueueConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
