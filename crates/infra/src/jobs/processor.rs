//! Job processors and the context handed to them.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use firelancer_core::JobId;

use super::store::JobStore;
use super::types::JobRecord;

/// Why a processor gave up on an attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    /// The processor observed a cancellation request and stopped.
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("invalid job data: {err}"))
    }
}

/// Handles the jobs of one queue.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Run one attempt. The returned value is stored as the job result.
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Processor backed by an async closure. See [`processor_fn`].
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a [`JobProcessor`].
///
/// ```ignore
/// queue.register_processor("send-email", processor_fn(|ctx| async move {
///     let to: String = ctx.data_as()?;
///     Ok(serde_json::json!({ "sent": to }))
/// }))?;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        (self.0)(ctx).await
    }
}

/// What a processor sees of the job it is running.
#[derive(Clone)]
pub struct JobContext {
    job: JobRecord,
    store: Arc<dyn JobStore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("queue", &self.job.queue_name)
            .field("attempt", &self.job.attempts)
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(job: JobRecord, store: Arc<dyn JobStore>, cancel: CancellationToken) -> Self {
        Self { job, store, cancel }
    }

    /// Snapshot of the record as claimed.
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.job.data.clone())?)
    }

    /// 1 on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// Report progress (clamped to 100). Failures are logged, not raised.
    pub async fn set_progress(&self, percent: u8) {
        if let Err(err) = self.store.update_progress(self.job.id, percent).await {
            warn!(job_id = %self.job.id, error = %err, "failed to record job progress");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation of this job is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
