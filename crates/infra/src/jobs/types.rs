//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firelancer_core::{DomainError, JobId};

use crate::config::duration_ms;

/// Lifecycle state of a job record.
///
/// ```text
/// PENDING -> RUNNING -> COMPLETED
///               |-----> PENDING   (failed, attempts left)
///               |-----> FAILED    (failed, attempts exhausted)
///               '-----> CANCELLED
/// PENDING -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker and executing
    Running,
    /// Processor returned a result
    Completed,
    /// Exhausted all attempts
    Failed,
    /// Cancelled before (or cooperatively during) execution
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states; a settled job is never touched again by the engine.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(DomainError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How long a failed job waits before it may be claimed again.
///
/// The number of attempts is a property of each job (`retries`); this policy
/// only decides the spacing between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// Base delay between retries
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) to spread out retries of jobs failing together
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Retry as soon as a worker is free.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Largest accepted `retries`; `retries + 1` attempts must fit a Postgres INTEGER.
pub const MAX_RETRIES: u32 = i32::MAX as u32 - 1;

/// Everything needed to create a job record.
///
/// This is also what the buffer stores, so it must stay serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue_name: String,
    pub data: serde_json::Value,
    /// Extra attempts allowed after the first one fails.
    pub retries: u32,
}

impl NewJob {
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            data,
            retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    /// `retry_delay` applies only if the job has attempts left.
    Failed { error: String, retry_delay: Duration },
    Cancelled,
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retry_delay: Duration::ZERO,
        }
    }
}

/// A state change that the job's current state does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} job {id} in state {from}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobState,
    pub action: &'static str,
}

/// A persisted unit of background work (`job_record`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub state: JobState,
    /// 0..=100
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    /// Message of the most recent failure.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub is_settled: bool,
    pub retries: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Also serves as the heartbeat of a RUNNING job.
    pub updated_at: DateTime<Utc>,
    /// A retried job is not claimable before this instant.
    pub retry_at: Option<DateTime<Utc>>,
    pub buffer_id: Option<String>,
    pub buffer_ordinal: Option<i64>,
    /// Set when cancellation of a RUNNING job was requested. The process
    /// executing the job picks it up on its next heartbeat.
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue_name: job.queue_name,
            data: job.data,
            state: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
            started_at: None,
            settled_at: None,
            is_settled: false,
            retries: job.retries,
            attempts: 0,
            created_at: now,
            updated_at: now,
            retry_at: None,
            buffer_id: None,
            buffer_ordinal: None,
            cancel_requested_at: None,
        }
    }

    /// A live job promoted from the buffer, tagged with its provenance.
    pub fn from_buffer(entry: &BufferedJob) -> Self {
        let mut record = Self::new(entry.job.clone());
        record.buffer_id = Some(entry.buffer_id.clone());
        record.buffer_ordinal = Some(entry.id);
        record
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.retries.saturating_add(1)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Time spent on the current (or last) attempt.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.settled_at.unwrap_or(self.updated_at) - started)
    }

    /// Claim the job for execution.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.ensure(JobState::Pending, "claim")?;
        self.state = JobState::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.retry_at = None;
        self.cancel_requested_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_progress(&mut self, percent: u8, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.ensure(JobState::Running, "update progress of")?;
        self.progress = percent.min(100);
        self.updated_at = now;
        Ok(())
    }

    /// Apply the outcome of the current attempt.
    ///
    /// A failure with attempts left sends the job back to PENDING instead of
    /// settling it, unless cancellation was requested meanwhile.
    pub fn settle(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        match outcome {
            JobOutcome::Completed(result) => {
                self.ensure(JobState::Running, "complete")?;
                self.result = Some(result);
                self.progress = 100;
                self.finish(JobState::Completed, now);
            }
            JobOutcome::Failed { error, retry_delay } => {
                self.ensure(JobState::Running, "fail")?;
                self.error = Some(error);
                if self.is_cancel_requested() {
                    self.finish(JobState::Cancelled, now);
                } else if self.has_attempts_left() {
                    self.state = JobState::Pending;
                    self.retry_at = Some(now + to_chrono(retry_delay));
                    self.updated_at = now;
                } else {
                    self.finish(JobState::Failed, now);
                }
            }
            JobOutcome::Cancelled => {
                if self.is_settled {
                    return Err(self.invalid("cancel"));
                }
                self.finish(JobState::Cancelled, now);
            }
        }
        Ok(())
    }

    /// Cancel a job.
    ///
    /// A PENDING job settles CANCELLED and `true` is returned. A RUNNING job
    /// only has the request recorded (`false`); it settles once its processor
    /// gives up.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match self.state {
            JobState::Pending => {
                self.finish(JobState::Cancelled, now);
                Ok(true)
            }
            JobState::Running => {
                self.cancel_requested_at.get_or_insert(now);
                Ok(false)
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// Reclaim a RUNNING job whose worker stopped sending heartbeats.
    pub fn requeue_abandoned(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.ensure(JobState::Running, "requeue")?;
        if self.is_cancel_requested() {
            self.finish(JobState::Cancelled, now);
        } else if self.has_attempts_left() {
            self.state = JobState::Pending;
            self.retry_at = None;
            self.updated_at = now;
        } else {
            self.error = Some("job abandoned by worker".to_string());
            self.finish(JobState::Failed, now);
        }
        Ok(())
    }

    fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.is_settled = true;
        self.settled_at = Some(now);
        self.retry_at = None;
        self.updated_at = now;
    }

    fn ensure(&self, expected: JobState, action: &'static str) -> Result<(), InvalidTransition> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            id: self.id,
            from: self.state,
            action,
        }
    }
}

/// A job held back while buffering is active (`job_record_buffer`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedJob {
    /// Insertion ordinal; increases monotonically across all buffers.
    pub id: i64,
    pub buffer_id: String,
    pub job: NewJob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for listing job records.
#[derive(Debug, Clone)]
pub struct JobListOptions {
    /// Empty means all queues.
    pub queue_names: Vec<String>,
    pub state: Option<JobState>,
    pub settled: Option<bool>,
    pub limit: usize,
}

impl Default for JobListOptions {
    fn default() -> Self {
        Self {
            queue_names: Vec::new(),
            state: None,
            settled: None,
            limit: 100,
        }
    }
}

impl JobListOptions {
    pub fn matches(&self, job: &JobRecord) -> bool {
        (self.queue_names.is_empty() || self.queue_names.contains(&job.queue_name))
            && self.state.is_none_or(|s| s == job.state)
            && self.settled.is_none_or(|s| s == job.is_settled)
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
