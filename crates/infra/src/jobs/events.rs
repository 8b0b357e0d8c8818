//! Events published by the queue engine when a bus is attached.

use chrono::{DateTime, Utc};

use firelancer_core::RequestContext;
use firelancer_events::impl_event;

use super::types::JobRecord;

/// A job reached COMPLETED, FAILED or CANCELLED.
#[derive(Debug, Clone)]
pub struct JobSettledEvent {
    pub ctx: RequestContext,
    pub job: JobRecord,
    pub created_at: DateTime<Utc>,
}

impl JobSettledEvent {
    pub fn new(job: JobRecord) -> Self {
        Self {
            ctx: RequestContext::empty(),
            job,
            created_at: Utc::now(),
        }
    }
}

impl_event!(JobSettledEvent, "job.settled");

/// A failed attempt sent the job back to PENDING.
#[derive(Debug, Clone)]
pub struct JobRetryScheduledEvent {
    pub ctx: RequestContext,
    pub job: JobRecord,
    pub created_at: DateTime<Utc>,
}

impl JobRetryScheduledEvent {
    pub fn new(job: JobRecord) -> Self {
        Self {
            ctx: RequestContext::empty(),
            job,
            created_at: Utc::now(),
        }
    }
}

impl_event!(JobRetryScheduledEvent, "job.retry-scheduled");
