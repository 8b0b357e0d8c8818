//! The job queue engine.
//!
//! One claim loop per registered queue pulls jobs from the store and runs
//! them on tokio tasks, at most `concurrency` at a time. Two housekeeping
//! tasks run alongside: a heartbeat that keeps this process's RUNNING jobs
//! fresh, and a sweeper that reclaims jobs whose worker went silent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use firelancer_core::JobId;
use firelancer_events::EventBus;

use crate::config::{ConfigError, JobQueueConfig};

use super::buffer::JobBuffer;
use super::events::{JobRetryScheduledEvent, JobSettledEvent};
use super::processor::{JobContext, JobError, JobProcessor};
use super::store::{JobBufferStore, JobStore, JobStoreError};
use super::types::{
    BufferedJob, JobListOptions, JobOutcome, JobRecord, JobState, NewJob, RetryPolicy, MAX_RETRIES,
};

/// Attempts at persisting an outcome before the job is left to the sweeper.
const SETTLE_ATTEMPTS: u32 = 3;

/// Storage backing a [`JobQueueService`].
pub trait JobStorage: JobStore + JobBufferStore + 'static {}

impl<T: JobStore + JobBufferStore + 'static> JobStorage for T {}

/// Queue engine error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("a processor is already registered for queue '{0}'")]
    DuplicateProcessor(String),
    #[error("job queue is already started")]
    AlreadyStarted,
    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),
    #[error("retries must be at most {MAX_RETRIES}, got {0}")]
    RetriesOutOfRange(u32),
    #[error("failed to flush buffer '{buffer_id}': {source}")]
    BufferFlush {
        buffer_id: String,
        #[source]
        source: JobStoreError,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Options for [`JobQueueService::add`].
#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    /// Overrides `default_retries` from the configuration.
    pub retries: Option<u32>,
}

impl AddJobOptions {
    pub fn retries(retries: u32) -> Self {
        Self {
            retries: Some(retries),
        }
    }
}

/// Where an added job ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedJob {
    Queued(JobRecord),
    Buffered(BufferedJob),
}

impl SubmittedJob {
    /// Buffered jobs get an id only when flushed.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SubmittedJob::Queued(job) => Some(job.id),
            SubmittedJob::Buffered(_) => None,
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, SubmittedJob::Buffered(_))
    }
}

struct InFlightJob {
    cancel: CancellationToken,
    aborts: Vec<AbortHandle>,
}

/// State shared between the service and its background tasks.
struct Shared<S> {
    store: Arc<S>,
    config: JobQueueConfig,
    bus: Option<EventBus>,
    in_flight: Mutex<HashMap<JobId, InFlightJob>>,
    job_added: Notify,
}

struct Runtime {
    shutdown: CancellationToken,
    loops: JoinSet<()>,
    jobs: TaskTracker,
}

/// Persistent job queue with per-queue worker pools.
pub struct JobQueueService<S> {
    shared: Arc<Shared<S>>,
    processors: RwLock<HashMap<String, Arc<dyn JobProcessor>>>,
    buffer: JobBuffer,
    runtime: Mutex<Option<Runtime>>,
    running: AtomicBool,
}

impl<S: JobStorage> JobQueueService<S> {
    pub fn new(store: S, config: JobQueueConfig) -> Result<Self, QueueError> {
        Self::build(store, config, None)
    }

    /// Like [`new`](Self::new), publishing job events on `bus` after every settlement.
    pub fn with_event_bus(store: S, config: JobQueueConfig, bus: EventBus) -> Result<Self, QueueError> {
        Self::build(store, config, Some(bus))
    }

    fn build(store: S, config: JobQueueConfig, bus: Option<EventBus>) -> Result<Self, QueueError> {
        config.validate()?;
        let buffer = JobBuffer::new(config.buffered_queues());
        Ok(Self {
            shared: Arc::new(Shared {
                store: Arc::new(store),
                config,
                bus,
                in_flight: Mutex::new(HashMap::new()),
                job_added: Notify::new(),
            }),
            processors: RwLock::new(HashMap::new()),
            buffer,
            runtime: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.shared.config
    }

    /// Whether claim loops are active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register the processor for a queue. Must happen before [`start`](Self::start).
    pub fn register_processor<P: JobProcessor>(
        &self,
        queue_name: impl Into<String>,
        processor: P,
    ) -> Result<(), QueueError> {
        let queue_name = queue_name.into();
        validate_queue_name(&queue_name)?;
        if self.lock_runtime().is_some() {
            return Err(QueueError::AlreadyStarted);
        }

        let mut processors = self.processors.write().unwrap_or_else(|e| e.into_inner());
        if processors.contains_key(&queue_name) {
            return Err(QueueError::DuplicateProcessor(queue_name));
        }
        debug!(queue = %queue_name, "processor registered");
        processors.insert(queue_name, Arc::new(processor));
        Ok(())
    }

    pub fn registered_queues(&self) -> Vec<String> {
        let processors = self.processors.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = processors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Persist a job (or buffer it, when its queue is buffering). Does not
    /// wait for the job to run.
    pub async fn add(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: AddJobOptions,
    ) -> Result<SubmittedJob, QueueError> {
        validate_queue_name(queue_name)?;
        let retries = options.retries.unwrap_or(self.shared.config.default_retries);
        if retries > MAX_RETRIES {
            return Err(QueueError::RetriesOutOfRange(retries));
        }
        let job = NewJob::new(queue_name, data).with_retries(retries);

        if self.buffer.is_buffering(queue_name) {
            let entry = self
                .shared
                .store
                .add(JobBuffer::buffer_id(queue_name), job)
                .await?;
            debug!(queue = queue_name, ordinal = entry.id, "job buffered");
            return Ok(SubmittedJob::Buffered(entry));
        }

        let record = self.shared.store.create(job).await?;
        debug!(queue = queue_name, job_id = %record.id, retries, "job added");
        self.shared.job_added.notify_waiters();
        Ok(SubmittedJob::Queued(record))
    }

    /// Start one claim loop per registered queue plus the heartbeat and
    /// sweeper tasks. Must be called within a Tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() {
            return Err(QueueError::AlreadyStarted);
        }

        let processors: Vec<(String, Arc<dyn JobProcessor>)> = {
            let processors = self.processors.read().unwrap_or_else(|e| e.into_inner());
            processors
                .iter()
                .map(|(name, p)| (name.clone(), Arc::clone(p)))
                .collect()
        };

        let shutdown = CancellationToken::new();
        let jobs = TaskTracker::new();
        let mut loops = JoinSet::new();
        for (queue, processor) in &processors {
            loops.spawn(claim_loop(
                Arc::clone(&self.shared),
                queue.clone(),
                Arc::clone(processor),
                shutdown.clone(),
                jobs.clone(),
            ));
        }
        loops.spawn(sweep_loop(Arc::clone(&self.shared), shutdown.clone()));
        loops.spawn(heartbeat_loop(Arc::clone(&self.shared), shutdown.clone()));

        *runtime = Some(Runtime {
            shutdown,
            loops,
            jobs,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(queues = processors.len(), "job queue started");
        Ok(())
    }

    /// Stop claiming and wait up to `shutdown_timeout` for in-flight jobs.
    ///
    /// Jobs still running after the grace period are aborted and stay
    /// RUNNING until a sweeper reclaims them. Returns how many were aborted.
    pub async fn stop(&self) -> usize {
        let Some(mut runtime) = self.lock_runtime().take() else {
            return 0;
        };
        self.running.store(false, Ordering::SeqCst);
        runtime.shutdown.cancel();

        while let Some(joined) = runtime.loops.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(error = %err, "job queue task panicked");
                }
            }
        }

        runtime.jobs.close();
        let grace = self.shared.config.shutdown_timeout;
        let abandoned = match tokio::time::timeout(grace, runtime.jobs.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = self.shared.abort_in_flight();
                warn!(
                    abandoned,
                    grace_ms = grace.as_millis() as u64,
                    "shutdown grace period elapsed; aborted in-flight jobs"
                );
                runtime.jobs.wait().await;
                abandoned
            }
        };

        info!(abandoned, "job queue stopped");
        abandoned
    }

    /// Cancel a job.
    ///
    /// A PENDING job is settled CANCELLED. For a RUNNING job the request is
    /// persisted; the owning process fires the job's cancellation token (at
    /// once when that is this process, otherwise on its next heartbeat) and
    /// the job settles once the processor returns.
    pub async fn cancel(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let record = self.shared.store.cancel(id).await?;
        if record.state == JobState::Running {
            if self.shared.signal_cancel(id) {
                info!(queue = %record.queue_name, job_id = %id, "cancellation requested for running job");
            } else {
                debug!(queue = %record.queue_name, job_id = %id, "cancellation recorded for job running elsewhere");
            }
        } else {
            info!(queue = %record.queue_name, job_id = %id, "job cancelled");
            self.shared.publish_settlement(&record);
        }
        Ok(record)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.shared.store.get(id).await?)
    }

    pub async fn list_jobs(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self.shared.store.list(options).await?)
    }

    /// Delete settled jobs older than `older_than`.
    pub async fn remove_settled_jobs(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let removed = self.shared.store.remove_settled(queue_names, older_than).await?;
        if removed > 0 {
            info!(removed, "removed settled jobs");
        }
        Ok(removed)
    }

    // -- buffering --

    /// Divert new jobs of `queue_name` into the buffer (or stop doing so).
    pub fn set_buffering(&self, queue_name: &str, active: bool) {
        if self.buffer.set_buffering(queue_name, active) {
            info!(queue = queue_name, active, "job buffering changed");
        }
    }

    pub fn is_buffering(&self, queue_name: &str) -> bool {
        self.buffer.is_buffering(queue_name)
    }

    /// Queues currently diverting new jobs into the buffer, sorted by name.
    pub fn buffering_queues(&self) -> Vec<String> {
        self.buffer.buffering_queues()
    }

    /// Buffered entry counts; empty `buffer_ids` means all non-empty buffers.
    pub async fn buffer_sizes(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, QueueError> {
        Ok(self.shared.store.size(buffer_ids).await?)
    }

    /// Promote a buffer's entries to live jobs, in insertion order.
    ///
    /// On failure the buffer is left untouched and the flush can be retried.
    pub async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, QueueError> {
        let created = self
            .shared
            .store
            .flush(buffer_id)
            .await
            .map_err(|source| QueueError::BufferFlush {
                buffer_id: buffer_id.to_string(),
                source,
            })?;
        if !created.is_empty() {
            info!(buffer_id, jobs = created.len(), "flushed job buffer");
            self.shared.job_added.notify_waiters();
        }
        Ok(created)
    }

    /// Flush every buffer that has entries.
    pub async fn flush_all(&self) -> Result<Vec<JobRecord>, QueueError> {
        let sizes = self.shared.store.size(&[]).await?;
        let mut buffer_ids: Vec<_> = sizes
            .into_iter()
            .filter(|(_, size)| *size > 0)
            .map(|(id, _)| id)
            .collect();
        buffer_ids.sort();

        let mut created = Vec::new();
        for buffer_id in buffer_ids {
            created.extend(self.flush(&buffer_id).await?);
        }
        Ok(created)
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S> Drop for JobQueueService<S> {
    fn drop(&mut self) {
        let runtime = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(runtime) = runtime.take() {
            runtime.shutdown.cancel();
        }
    }
}

fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.trim().is_empty() {
        return Err(QueueError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

impl<S: JobStorage> Shared<S> {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<JobId, InFlightJob>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, id: JobId, cancel: CancellationToken) {
        self.lock_in_flight().insert(
            id,
            InFlightJob {
                cancel,
                aborts: Vec::new(),
            },
        );
    }

    /// No-op when the job already finished.
    fn add_abort_handle(&self, id: JobId, handle: AbortHandle) {
        if let Some(job) = self.lock_in_flight().get_mut(&id) {
            job.aborts.push(handle);
        }
    }

    fn untrack(&self, id: JobId) {
        self.lock_in_flight().remove(&id);
    }

    fn in_flight_ids(&self) -> Vec<JobId> {
        self.lock_in_flight().keys().copied().collect()
    }

    fn signal_cancel(&self, id: JobId) -> bool {
        match self.lock_in_flight().get(&id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn abort_in_flight(&self) -> usize {
        let jobs: Vec<_> = self.lock_in_flight().drain().collect();
        for (id, job) in &jobs {
            debug!(job_id = %id, "aborting in-flight job");
            for handle in &job.aborts {
                handle.abort();
            }
        }
        jobs.len()
    }

    fn failure(&self, error: impl Into<String>, attempt: u32) -> JobOutcome {
        JobOutcome::Failed {
            error: error.into(),
            retry_delay: self.config.retry_policy.delay_for_attempt(attempt),
        }
    }

    fn publish_settlement(&self, record: &JobRecord) {
        let Some(bus) = &self.bus else {
            return;
        };
        let published = if record.is_settled {
            bus.publish(JobSettledEvent::new(record.clone()))
        } else {
            bus.publish(JobRetryScheduledEvent::new(record.clone()))
        };
        if let Err(err) = published {
            warn!(job_id = %record.id, error = %err, "job event subscribers failed");
        }
    }
}

/// Exponential pause after store errors, reset on the next success.
struct StoreBackoff {
    policy: RetryPolicy,
    failures: u32,
}

impl StoreBackoff {
    fn new(config: &JobQueueConfig) -> Self {
        Self {
            policy: RetryPolicy::exponential(config.poll_interval, config.store_backoff_max),
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for_attempt(self.failures)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

async fn claim_loop<S: JobStorage>(
    shared: Arc<Shared<S>>,
    queue: String,
    processor: Arc<dyn JobProcessor>,
    shutdown: CancellationToken,
    jobs: TaskTracker,
) {
    let concurrency = shared.config.concurrency_for(&queue);
    let timeout = shared.config.job_timeout_for(&queue);
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut backoff = StoreBackoff::new(&shared.config);

    info!(queue = %queue, concurrency, "claim loop started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match shared.store.claim_next(&queue).await {
            Ok(Some(job)) => {
                backoff.reset();
                spawn_job(&shared, &jobs, job, Arc::clone(&processor), timeout, permit);
            }
            Ok(None) => {
                backoff.reset();
                drop(permit);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = shared.job_added.notified() => {}
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
            Err(JobStoreError::ClaimConflict(_)) => {
                drop(permit);
                tokio::task::yield_now().await;
            }
            Err(err) => {
                drop(permit);
                let delay = backoff.next_delay();
                warn!(
                    queue = %queue,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "failed to claim job; backing off"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(queue = %queue, "claim loop stopped");
}

fn spawn_job<S: JobStorage>(
    shared: &Arc<Shared<S>>,
    jobs: &TaskTracker,
    job: JobRecord,
    processor: Arc<dyn JobProcessor>,
    timeout: Option<Duration>,
    permit: OwnedSemaphorePermit,
) {
    let id = job.id;
    let cancel = CancellationToken::new();
    shared.track(id, cancel.clone());

    let task_shared = Arc::clone(shared);
    let handle = jobs.spawn(async move {
        let _permit = permit;
        run_job(&task_shared, job, processor, timeout, cancel).await;
        task_shared.untrack(id);
    });
    shared.add_abort_handle(id, handle.abort_handle());
}

async fn run_job<S: JobStorage>(
    shared: &Arc<Shared<S>>,
    job: JobRecord,
    processor: Arc<dyn JobProcessor>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let id = job.id;
    let attempt = job.attempts;
    let queue = job.queue_name.clone();
    debug!(queue = %queue, job_id = %id, attempt, "job started");

    let store: Arc<dyn JobStore> = shared.store.clone();
    let ctx = JobContext::new(job, store, cancel.clone());
    // The handler runs on its own task so that panics surface as a JoinError
    // and a timeout can abort it.
    let mut handler = tokio::spawn(async move { processor.process(ctx).await });
    shared.add_abort_handle(id, handler.abort_handle());

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handler).await {
            Ok(joined) => joined,
            Err(_) => {
                handler.abort();
                warn!(
                    queue = %queue,
                    job_id = %id,
                    attempt,
                    timeout_ms = limit.as_millis() as u64,
                    "job timed out"
                );
                let outcome = if cancel.is_cancelled() {
                    JobOutcome::Cancelled
                } else {
                    shared.failure("timeout", attempt)
                };
                settle(shared, id, &queue, outcome).await;
                return;
            }
        },
        None => (&mut handler).await,
    };

    let outcome = match joined {
        Ok(Ok(result)) => JobOutcome::Completed(result),
        Ok(Err(JobError::Cancelled)) => JobOutcome::Cancelled,
        Ok(Err(_)) if cancel.is_cancelled() => JobOutcome::Cancelled,
        Ok(Err(JobError::Failed(message))) => shared.failure(message, attempt),
        Err(err) if err.is_panic() => {
            let message = panic_message(&*err.into_panic());
            error!(queue = %queue, job_id = %id, attempt, panic = %message, "job processor panicked");
            if cancel.is_cancelled() {
                JobOutcome::Cancelled
            } else {
                shared.failure(format!("processor panicked: {message}"), attempt)
            }
        }
        Err(_) => {
            // Aborted by stop(); the record stays RUNNING for the sweeper.
            debug!(queue = %queue, job_id = %id, "job aborted");
            return;
        }
    };

    settle(shared, id, &queue, outcome).await;
}

async fn settle<S: JobStorage>(shared: &Shared<S>, id: JobId, queue: &str, outcome: JobOutcome) {
    let mut backoff = StoreBackoff::new(&shared.config);

    for attempt in 1..=SETTLE_ATTEMPTS {
        match shared.store.settle(id, outcome.clone()).await {
            Ok(record) => {
                log_settlement(&record);
                shared.publish_settlement(&record);
                return;
            }
            Err(err) if err.is_transient() && attempt < SETTLE_ATTEMPTS => {
                let delay = backoff.next_delay();
                warn!(queue, job_id = %id, error = %err, retry_in_ms = delay.as_millis() as u64, "failed to settle job; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(queue, job_id = %id, error = %err, "failed to settle job");
                return;
            }
        }
    }
}

fn log_settlement(job: &JobRecord) {
    let error = job.error.as_deref().unwrap_or_default();
    match job.state {
        JobState::Completed => {
            info!(queue = %job.queue_name, job_id = %job.id, attempt = job.attempts, "job completed")
        }
        JobState::Failed => warn!(
            queue = %job.queue_name,
            job_id = %job.id,
            attempt = job.attempts,
            error,
            "job failed"
        ),
        JobState::Cancelled => {
            info!(queue = %job.queue_name, job_id = %job.id, attempt = job.attempts, "job cancelled")
        }
        JobState::Pending => info!(
            queue = %job.queue_name,
            job_id = %job.id,
            attempt = job.attempts,
            error,
            retry_at = ?job.retry_at,
            "job failed; retry scheduled"
        ),
        JobState::Running => {}
    }
}

async fn sweep_loop<S: JobStorage>(shared: Arc<Shared<S>>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now() - super::types::to_chrono(shared.config.stale_after);
        match shared.store.requeue_stale(cutoff).await {
            Ok(reclaimed) if reclaimed.is_empty() => {}
            Ok(reclaimed) => {
                for job in &reclaimed {
                    warn!(
                        queue = %job.queue_name,
                        job_id = %job.id,
                        attempt = job.attempts,
                        state = %job.state,
                        "reclaimed abandoned job"
                    );
                    if job.is_settled {
                        shared.publish_settlement(job);
                    }
                }
                shared.job_added.notify_waiters();
            }
            Err(err) => warn!(error = %err, "stale job sweep failed"),
        }
    }
}

async fn heartbeat_loop<S: JobStorage>(shared: Arc<Shared<S>>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ids = shared.in_flight_ids();
        if ids.is_empty() {
            continue;
        }
        match shared.store.heartbeat(&ids).await {
            Ok(cancel_requested) => {
                for id in cancel_requested {
                    if shared.signal_cancel(id) {
                        info!(job_id = %id, "cancellation requested for running job");
                    }
                }
            }
            Err(err) => warn!(jobs = ids.len(), error = %err, "job heartbeat failed"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::QueueOptions;
    use crate::jobs::processor::processor_fn;
    use crate::jobs::store::InMemoryJobStore;

    fn test_config() -> JobQueueConfig {
        JobQueueConfig {
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(30),
            retry_policy: RetryPolicy::immediate(),
            store_backoff_max: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn service(config: JobQueueConfig) -> JobQueueService<Arc<InMemoryJobStore>> {
        JobQueueService::new(InMemoryJobStore::arc(), config).unwrap()
    }

    async fn add(queue: &JobQueueService<impl JobStorage>, name: &str, data: serde_json::Value, retries: u32) -> JobId {
        queue
            .add(name, data, AddJobOptions::retries(retries))
            .await
            .unwrap()
            .job_id()
            .unwrap()
    }

    async fn wait_for<S: JobStorage>(
        queue: &JobQueueService<S>,
        id: JobId,
        pred: impl Fn(&JobRecord) -> bool,
    ) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = queue.get_job(id).await.unwrap() {
                if pred(&job) {
                    return job;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for job {id}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_settled<S: JobStorage>(queue: &JobQueueService<S>, id: JobId) -> JobRecord {
        wait_for(queue, id, |j| j.is_settled).await
    }

    #[tokio::test]
    async fn retries_until_the_processor_succeeds() {
        let queue = service(test_config());
        queue
            .register_processor(
                "flaky",
                processor_fn(|ctx| async move {
                    if ctx.attempt() < 3 {
                        Err(JobError::failed(format!("attempt {} failed", ctx.attempt())))
                    } else {
                        Ok(json!({ "attempt": ctx.attempt() }))
                    }
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "flaky", json!({}), 2).await;
        let job = wait_settled(&queue, id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({ "attempt": 3 })));
        queue.stop().await;
    }

    #[tokio::test]
    async fn failure_without_retries_settles_failed() {
        let queue = service(test_config());
        queue
            .register_processor("q", processor_fn(|_| async { Err(JobError::failed("boom")) }))
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        let job = wait_settled(&queue, id).await;

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.settled_at.is_some());
        queue.stop().await;
    }

    #[tokio::test]
    async fn default_retries_come_from_config() {
        let queue = service(JobQueueConfig {
            default_retries: 1,
            ..test_config()
        });
        let submitted = queue.add("q", json!(1), AddJobOptions::default()).await.unwrap();
        let SubmittedJob::Queued(job) = submitted else {
            panic!("expected a queued job");
        };
        assert_eq!(job.retries, 1);
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let config = test_config().with_queue(
            "slow",
            QueueOptions {
                job_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let queue = service(config);
        queue
            .register_processor(
                "slow",
                processor_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!(null))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "slow", json!(null), 0).await;
        let job = wait_settled(&queue, id).await;

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("timeout"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn panicking_processor_fails_the_job() {
        let queue = service(test_config());
        queue
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    if ctx.data().is_null() {
                        panic!("no payload");
                    }
                    Ok(json!(null))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        let job = wait_settled(&queue, id).await;

        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("no payload"));
        assert!(queue.is_running());
        queue.stop().await;
    }

    #[tokio::test]
    async fn concurrency_is_bounded_per_queue() {
        let config = test_config().with_queue(
            "pool",
            QueueOptions {
                concurrency: Some(2),
                ..Default::default()
            },
        );
        let queue = service(config);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let (current, peak) = (current.clone(), peak.clone());
            queue
                .register_processor(
                    "pool",
                    processor_fn(move |_| {
                        let (current, peak) = (current.clone(), peak.clone());
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(json!(null))
                        }
                    }),
                )
                .unwrap();
        }

        let mut ids = Vec::new();
        for n in 0..6 {
            ids.push(add(&queue, "pool", json!(n), 0).await);
        }
        queue.start().unwrap();
        for id in ids {
            assert_eq!(wait_settled(&queue, id).await.state, JobState::Completed);
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
        queue.stop().await;
    }

    #[tokio::test]
    async fn registration_rules() {
        let queue = service(test_config());
        let noop = || processor_fn(|_| async { Ok(json!(null)) });

        queue.register_processor("q", noop()).unwrap();
        assert!(matches!(
            queue.register_processor("q", noop()),
            Err(QueueError::DuplicateProcessor(name)) if name == "q"
        ));
        assert!(matches!(
            queue.register_processor("", noop()),
            Err(QueueError::InvalidQueueName(_))
        ));

        queue.start().unwrap();
        assert!(matches!(queue.start(), Err(QueueError::AlreadyStarted)));
        assert!(matches!(
            queue.register_processor("other", noop()),
            Err(QueueError::AlreadyStarted)
        ));
        assert_eq!(queue.registered_queues(), vec!["q"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn empty_queue_name_is_rejected_on_add() {
        let queue = service(test_config());
        let err = queue.add("  ", json!(null), AddJobOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));
    }

    #[tokio::test]
    async fn retries_beyond_storable_range_are_rejected() {
        let queue = service(test_config());
        let err = queue
            .add("q", json!(null), AddJobOptions::retries(u32::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::RetriesOutOfRange(u32::MAX)));

        let accepted = queue
            .add("q", json!(null), AddJobOptions::retries(MAX_RETRIES))
            .await
            .unwrap();
        assert!(!accepted.is_buffered());
    }

    #[tokio::test]
    async fn buffered_jobs_run_only_after_flush() {
        let queue = service(test_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            queue
                .register_processor(
                    "digest",
                    processor_fn(move |ctx| {
                        let seen = seen.clone();
                        async move {
                            seen.lock().unwrap().push(ctx.data().clone());
                            Ok(json!(null))
                        }
                    }),
                )
                .unwrap();
        }
        queue.set_buffering("digest", true);
        assert_eq!(queue.buffering_queues(), vec!["digest"]);
        queue.start().unwrap();

        for n in 1..=3 {
            let submitted = queue.add("digest", json!(n), AddJobOptions::default()).await.unwrap();
            assert!(submitted.is_buffered());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(queue.buffer_sizes(&["digest".to_string()]).await.unwrap()["digest"], 3);

        queue.set_buffering("digest", false);
        assert!(queue.buffering_queues().is_empty());
        let created = queue.flush_all().await.unwrap();
        assert_eq!(created.len(), 3);
        for job in &created {
            wait_settled(&queue, job.id).await;
        }

        let mut payloads = seen.lock().unwrap().clone();
        payloads.sort_by_key(|v| v.as_i64());
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
        assert!(queue.flush("digest").await.unwrap().is_empty());
        queue.stop().await;
    }

    #[tokio::test]
    async fn cancelled_pending_job_never_runs() {
        let queue = service(test_config());
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            queue
                .register_processor(
                    "q",
                    processor_fn(move |_| {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!(null))
                        }
                    }),
                )
                .unwrap();
        }

        let id = add(&queue, "q", json!(null), 0).await;
        let cancelled = queue.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        queue.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(matches!(
            queue.cancel(id).await,
            Err(QueueError::Store(JobStoreError::InvalidTransition(_)))
        ));
        queue.stop().await;
    }

    #[tokio::test]
    async fn running_job_is_cancelled_cooperatively() {
        let queue = service(test_config());
        queue
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    ctx.cancelled().await;
                    Err(JobError::Cancelled)
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 3).await;
        wait_for(&queue, id, |j| j.state == JobState::Running).await;

        let record = queue.cancel(id).await.unwrap();
        assert_eq!(record.state, JobState::Running);

        let job = wait_settled(&queue, id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn cancel_from_another_process_reaches_the_running_job() {
        let store = InMemoryJobStore::arc();
        let worker = JobQueueService::new(Arc::clone(&store), test_config()).unwrap();
        let web = JobQueueService::new(store, test_config()).unwrap();
        worker
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    for _ in 0..100 {
                        if ctx.is_cancelled() {
                            return Err(JobError::Cancelled);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(json!("ran to completion"))
                }),
            )
            .unwrap();
        worker.start().unwrap();

        let id = add(&web, "q", json!(null), 2).await;
        wait_for(&web, id, |j| j.state == JobState::Running).await;

        let record = web.cancel(id).await.unwrap();
        assert_eq!(record.state, JobState::Running);
        assert!(record.is_cancel_requested());

        let job = wait_settled(&web, id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, None);
        worker.stop().await;
    }

    #[tokio::test]
    async fn cancelled_job_that_times_out_is_not_retried() {
        let config = test_config().with_queue(
            "slow",
            QueueOptions {
                job_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );
        let queue = service(config);
        queue
            .register_processor(
                "slow",
                processor_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!(null))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "slow", json!(null), 2).await;
        wait_for(&queue, id, |j| j.state == JobState::Running).await;
        queue.cancel(id).await.unwrap();

        let job = wait_settled(&queue, id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn cancelled_job_that_panics_is_not_retried() {
        let queue = service(test_config());
        queue
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    ctx.cancelled().await;
                    if ctx.is_cancelled() {
                        panic!("cleanup failed");
                    }
                    Ok(json!(null))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 2).await;
        wait_for(&queue, id, |j| j.state == JobState::Running).await;
        queue.cancel(id).await.unwrap();

        let job = wait_settled(&queue, id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn progress_is_recorded() {
        let queue = service(test_config());
        queue
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    ctx.set_progress(40).await;
                    Err(JobError::failed("stopped at 40%"))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        let job = wait_settled(&queue, id).await;
        assert_eq!(job.progress, 40);
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let queue = service(test_config());
        queue
            .register_processor(
                "q",
                processor_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("finished"))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        wait_for(&queue, id, |j| j.state == JobState::Running).await;

        assert_eq!(queue.stop().await, 0);
        assert!(!queue.is_running());
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn stop_aborts_jobs_after_grace_period() {
        let queue = service(JobQueueConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..test_config()
        });
        queue
            .register_processor(
                "q",
                processor_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!(null))
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        wait_for(&queue, id, |j| j.state == JobState::Running).await;

        assert_eq!(queue.stop().await, 1);
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_reclaimed() {
        let store = InMemoryJobStore::arc();
        let queue = JobQueueService::new(
            store.clone(),
            JobQueueConfig {
                stale_after: Duration::from_millis(50),
                ..test_config()
            },
        )
        .unwrap();

        // Claimed by a worker that then died.
        let id = add(&queue, "q", json!(null), 1).await;
        store.claim_next("q").await.unwrap().unwrap();

        queue
            .register_processor("q", processor_fn(|_| async { Ok(json!("recovered")) }))
            .unwrap();
        queue.start().unwrap();

        let job = wait_settled(&queue, id).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        queue.stop().await;
    }

    #[tokio::test]
    async fn settlement_events_are_published() {
        let bus = EventBus::new();
        let mut settled = bus.of_type::<JobSettledEvent>();
        let mut retried = bus.of_type::<JobRetryScheduledEvent>();

        let queue =
            JobQueueService::with_event_bus(InMemoryJobStore::arc(), test_config(), bus).unwrap();
        queue
            .register_processor(
                "q",
                processor_fn(|ctx| async move {
                    if ctx.attempt() == 1 {
                        Err(JobError::failed("first try"))
                    } else {
                        Ok(json!(null))
                    }
                }),
            )
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 1).await;
        wait_settled(&queue, id).await;

        let within = Duration::from_secs(5);
        let retry = tokio::time::timeout(within, retried.recv()).await.unwrap().unwrap();
        assert_eq!(retry.job.id, id);
        assert_eq!(retry.job.state, JobState::Pending);
        let done = tokio::time::timeout(within, settled.recv()).await.unwrap().unwrap();
        assert_eq!(done.job.state, JobState::Completed);
        queue.stop().await;
    }

    /// Fails the first `failures` claims as if the database were down.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn create(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
            self.inner.create(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list(options).await
        }

        async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(JobStoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.claim_next(queue_name).await
        }

        async fn update_progress(&self, id: JobId, percent: u8) -> Result<(), JobStoreError> {
            self.inner.update_progress(id, percent).await
        }

        async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobStoreError> {
            self.inner.heartbeat(ids).await
        }

        async fn settle(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord, JobStoreError> {
            self.inner.settle(id, outcome).await
        }

        async fn cancel(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
            self.inner.cancel(id).await
        }

        async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.requeue_stale(cutoff).await
        }

        async fn remove_settled(
            &self,
            queue_names: &[String],
            older_than: DateTime<Utc>,
        ) -> Result<u64, JobStoreError> {
            self.inner.remove_settled(queue_names, older_than).await
        }
    }

    #[async_trait]
    impl JobBufferStore for FlakyStore {
        async fn add(&self, buffer_id: &str, job: NewJob) -> Result<BufferedJob, JobStoreError> {
            self.inner.add(buffer_id, job).await
        }

        async fn size(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, JobStoreError> {
            self.inner.size(buffer_ids).await
        }

        async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.flush(buffer_id).await
        }
    }

    #[tokio::test]
    async fn claim_loop_survives_store_outage() {
        let store = FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: AtomicUsize::new(3),
        };
        let queue = JobQueueService::new(store, test_config()).unwrap();
        queue
            .register_processor("q", processor_fn(|_| async { Ok(json!("ok")) }))
            .unwrap();
        queue.start().unwrap();

        let id = add(&queue, "q", json!(null), 0).await;
        let job = wait_settled(&queue, id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(queue.store().failures.load(Ordering::SeqCst), 0);
        queue.stop().await;
    }
}
