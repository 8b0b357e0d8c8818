//! Job storage abstractions and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use firelancer_core::JobId;

use super::types::{BufferedJob, InvalidTransition, JobListOptions, JobOutcome, JobRecord, JobState, NewJob};

/// Durable storage of job records.
///
/// Implementations must make `claim_next` atomic: two concurrent claimers
/// never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job.
    async fn create(&self, job: NewJob) -> Result<JobRecord, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Jobs matching the filters, newest first.
    async fn list(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Claim the oldest claimable job of a queue, moving it to RUNNING.
    async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>, JobStoreError>;

    /// Record progress (clamped to 100) of a RUNNING job.
    async fn update_progress(&self, id: JobId, percent: u8) -> Result<(), JobStoreError>;

    /// Refresh `updated_at` of the RUNNING jobs among `ids`. Returns those
    /// whose cancellation has been requested.
    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobStoreError>;

    /// Apply the outcome of the current attempt of a RUNNING job.
    async fn settle(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord, JobStoreError>;

    /// Cancel a PENDING job. For a RUNNING job the request is recorded in
    /// `cancel_requested_at` and the job stays RUNNING.
    async fn cancel(&self, id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Requeue (or fail, when exhausted) RUNNING jobs not heard from since `cutoff`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Delete settled jobs settled before `older_than`. Empty `queue_names` means all queues.
    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;
}

/// Holding area for jobs submitted while buffering is active.
#[async_trait]
pub trait JobBufferStore: Send + Sync {
    async fn add(&self, buffer_id: &str, job: NewJob) -> Result<BufferedJob, JobStoreError>;

    /// Entry counts per buffer. Empty `buffer_ids` means every non-empty buffer.
    async fn size(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, JobStoreError>;

    /// Atomically move every entry of a buffer into the live queue, in
    /// insertion order. Entries already promoted by an earlier flush are
    /// skipped. Returns the created jobs.
    async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("claim conflict: {0}")]
    ClaimConflict(String),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobStoreError {
    /// Worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobStoreError::ClaimConflict(_) | JobStoreError::Unavailable(_)
        )
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    buffer: BTreeMap<i64, BufferedJob>,
    next_buffer_ordinal: i64,
}

/// In-memory job store for tests/dev.
///
/// A single lock guards jobs and buffer so that a flush is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, InvalidTransition>,
    ) -> Result<T, JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        Ok(f(job)?)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let record = JobRecord::new(job);
        self.write()?.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, JobStoreError> {
        let state = self.read()?;
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|j| options.matches(j))
            .cloned()
            .collect();

        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(options.limit);
        Ok(result)
    }

    async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let mut state = self.write()?;
        let now = Utc::now();

        // Oldest claimable job first
        let next = state
            .jobs
            .values()
            .filter(|j| j.queue_name == queue_name && j.is_claimable(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.mark_running(now)?;
        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, id: JobId, percent: u8) -> Result<(), JobStoreError> {
        self.with_job(id, |job| job.set_progress(percent, Utc::now()))
    }

    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobStoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut cancel_requested = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.state == JobState::Running {
                    job.updated_at = now;
                    if job.is_cancel_requested() {
                        cancel_requested.push(*id);
                    }
                }
            }
        }
        Ok(cancel_requested)
    }

    async fn settle(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord, JobStoreError> {
        self.with_job(id, |job| {
            job.settle(outcome, Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn cancel(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.with_job(id, |job| {
            job.cancel(Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            if job.state == JobState::Running && job.updated_at < cutoff {
                job.requeue_abandoned(now)?;
                requeued.push(job.clone());
            }
        }
        Ok(requeued)
    }

    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            let in_scope = queue_names.is_empty() || queue_names.contains(&job.queue_name);
            let expired = job.settled_at.is_some_and(|at| at < older_than);
            !(in_scope && job.is_settled && expired)
        });
        Ok((before - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl JobBufferStore for InMemoryJobStore {
    async fn add(&self, buffer_id: &str, job: NewJob) -> Result<BufferedJob, JobStoreError> {
        let mut state = self.write()?;
        state.next_buffer_ordinal += 1;
        let now = Utc::now();
        let entry = BufferedJob {
            id: state.next_buffer_ordinal,
            buffer_id: buffer_id.to_string(),
            job,
            created_at: now,
            updated_at: now,
        };
        state.buffer.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn size(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, JobStoreError> {
        let state = self.read()?;
        let mut sizes: HashMap<String, usize> =
            buffer_ids.iter().map(|id| (id.clone(), 0)).collect();
        for entry in state.buffer.values() {
            if buffer_ids.is_empty() || buffer_ids.contains(&entry.buffer_id) {
                *sizes.entry(entry.buffer_id.clone()).or_default() += 1;
            }
        }
        Ok(sizes)
    }

    async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut state = self.write()?;
        let entries: Vec<BufferedJob> = state
            .buffer
            .values()
            .filter(|e| e.buffer_id == buffer_id)
            .cloned()
            .collect();

        let mut created = Vec::with_capacity(entries.len());
        for entry in &entries {
            let already_promoted = state.jobs.values().any(|j| {
                j.buffer_id.as_deref() == Some(buffer_id) && j.buffer_ordinal == Some(entry.id)
            });
            if !already_promoted {
                let record = JobRecord::from_buffer(entry);
                state.jobs.insert(record.id, record.clone());
                created.push(record);
            }
            state.buffer.remove(&entry.id);
        }
        Ok(created)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn list(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(options).await
    }

    async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).claim_next(queue_name).await
    }

    async fn update_progress(&self, id: JobId, percent: u8) -> Result<(), JobStoreError> {
        (**self).update_progress(id, percent).await
    }

    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobStoreError> {
        (**self).heartbeat(ids).await
    }

    async fn settle(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord, JobStoreError> {
        (**self).settle(id, outcome).await
    }

    async fn cancel(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        (**self).cancel(id).await
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).requeue_stale(cutoff).await
    }

    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).remove_settled(queue_names, older_than).await
    }
}

#[async_trait]
impl<S: JobBufferStore + ?Sized> JobBufferStore for Arc<S> {
    async fn add(&self, buffer_id: &str, job: NewJob) -> Result<BufferedJob, JobStoreError> {
        (**self).add(buffer_id, job).await
    }

    async fn size(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, JobStoreError> {
        (**self).size(buffer_ids).await
    }

    async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).flush(buffer_id).await
    }
}
