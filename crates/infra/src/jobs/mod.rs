//! Persistent background job queue.
//!
//! ## Design
//!
//! - Jobs live in a store shared by every process (`job_record`)
//! - Claims are atomic; a job runs on at most one worker at a time
//! - Failed attempts are retried with backoff until `retries` is exhausted
//! - Buffering holds jobs back (`job_record_buffer`) until an explicit flush
//!
//! ## Components
//!
//! - `JobRecord`: the persisted job and its state machine
//! - `JobStore` / `JobBufferStore`: persistence (in-memory or Postgres)
//! - `JobQueueService`: claim loops, worker pools, settlement
//! - `JobProcessor`: user code handling the jobs of one queue

pub mod buffer;
pub mod events;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod store;
pub mod types;

pub use buffer::JobBuffer;
pub use events::{JobRetryScheduledEvent, JobSettledEvent};
pub use postgres::PostgresJobStore;
pub use processor::{processor_fn, FnProcessor, JobContext, JobError, JobProcessor};
pub use queue::{AddJobOptions, JobQueueService, JobStorage, QueueError, SubmittedJob};
pub use store::{InMemoryJobStore, JobBufferStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, BufferedJob, InvalidTransition, JobListOptions, JobOutcome, JobRecord,
    JobState, NewJob, RetryPolicy, MAX_RETRIES,
};
