//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` moves a job to RUNNING with a single statement:
//!
//! ```sql
//! UPDATE job_record SET state = 'RUNNING', ...
//! WHERE id = (SELECT id ... ORDER BY "createdAt", id LIMIT 1 FOR UPDATE SKIP LOCKED)
//! ```
//!
//! Concurrent claimers skip rows locked by each other instead of blocking, so
//! any number of workers can poll the same queue and none receives a job twice.
//!
//! ## Transitions
//!
//! Settling, cancelling and sweeping lock the row (`FOR UPDATE`), apply the
//! transition with [`JobRecord`]'s own state machine and write the mutable
//! columns back in the same transaction.
//!
//! Cancelling a RUNNING job only stamps `"cancelRequestedAt"`. The worker
//! running it learns about the request from `heartbeat`, which returns the
//! flagged ids.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (serialization failure / deadlock) | `40001`, `40P01` | `ClaimConflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut, PoolClosed, Io, Tls, WorkerCrashed | N/A | `Unavailable` |
//! | Decode, ColumnDecode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};

use firelancer_core::JobId;

use super::store::{JobBufferStore, JobStore, JobStoreError};
use super::types::{
    BufferedJob, InvalidTransition, JobListOptions, JobOutcome, JobRecord, JobState, NewJob,
    MAX_RETRIES,
};

macro_rules! job_columns {
    () => {
        r#"id, "queueName", data, state, progress, result, error, "startedAt", "settledAt", "isSettled", retries, attempts, "createdAt", "updatedAt", "retryAt", "bufferId", "bufferOrdinal", "cancelRequestedAt""#
    };
}

/// Postgres-backed [`JobStore`] and [`JobBufferStore`].
///
/// Tables are created by the `0001_job_queue` migration (see [`crate::db`]).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Lock one row, apply `f` and write the record back.
    async fn transition<T: Send>(
        &self,
        operation: &'static str,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, InvalidTransition> + Send,
    ) -> Result<(T, JobRecord), JobStoreError> {
        let mut tx = self.begin(operation).await?;

        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_record WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(JobStoreError::NotFound(id))?;

        let mut job = job_from_row(&row)?;
        let value = f(&mut job)?;
        write_back(&mut tx, &job, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((value, job))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue_name), err)]
    async fn create(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let record = JobRecord::new(job);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("create", e))?;
        insert_job(&mut *conn, &record, "create").await?;
        Ok(record)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM job_record WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, options: &JobListOptions) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut query = QueryBuilder::<Postgres>::new(concat!(
            "SELECT ",
            job_columns!(),
            " FROM job_record WHERE TRUE"
        ));
        if !options.queue_names.is_empty() {
            query
                .push(r#" AND "queueName" = ANY("#)
                .push_bind(options.queue_names.clone())
                .push(")");
        }
        if let Some(state) = options.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(settled) = options.settled {
            query.push(r#" AND "isSettled" = "#).push_bind(settled);
        }
        query
            .push(r#" ORDER BY "createdAt" DESC, id DESC LIMIT "#)
            .push_bind(i64::try_from(options.limit).unwrap_or(i64::MAX));

        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %queue_name), err)]
    async fn claim_next(&self, queue_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE job_record
            SET state = 'RUNNING',
                attempts = attempts + 1,
                "startedAt" = $2,
                "updatedAt" = $2,
                "retryAt" = NULL,
                "cancelRequestedAt" = NULL
            WHERE id = (
                SELECT id FROM job_record
                WHERE "queueName" = $1
                  AND state = 'PENDING'
                  AND ("retryAt" IS NULL OR "retryAt" <= $2)
                ORDER BY "createdAt", id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            job_columns!()
        ))
        .bind(queue_name)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, attempt = job.attempts, "claimed job");
        }
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_progress(&self, id: JobId, percent: u8) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_record
            SET progress = $2, "updatedAt" = $3
            WHERE id = $1 AND state = 'RUNNING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(i32::from(percent.min(100)))
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Explain why nothing was updated.
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM job_record WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_progress", e))?;
        match state {
            None => Err(JobStoreError::NotFound(id)),
            Some(state) => Err(InvalidTransition {
                id,
                from: parse_state(&state)?,
                action: "update progress of",
            }
            .into()),
        }
    }

    #[instrument(skip(self, ids), fields(jobs = ids.len()), err)]
    async fn heartbeat(&self, ids: &[JobId]) -> Result<Vec<JobId>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let flagged: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            WITH touched AS (
                UPDATE job_record
                SET "updatedAt" = $2
                WHERE id = ANY($1) AND state = 'RUNNING'
                RETURNING id, "cancelRequestedAt"
            )
            SELECT id FROM touched WHERE "cancelRequestedAt" IS NOT NULL
            "#,
        )
        .bind(ids)
        .bind(Utc::now())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(flagged.into_iter().map(JobId::from_uuid).collect())
    }

    #[instrument(skip(self, outcome), fields(job_id = %id), err)]
    async fn settle(&self, id: JobId, outcome: JobOutcome) -> Result<JobRecord, JobStoreError> {
        let ((), job) = self
            .transition("settle", id, |job| job.settle(outcome, Utc::now()))
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn cancel(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        let (_, job) = self
            .transition("cancel", id, |job| job.cancel(Utc::now()))
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut tx = self.begin("requeue_stale").await?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#" FROM job_record WHERE state = 'RUNNING' AND "updatedAt" < $1 FOR UPDATE SKIP LOCKED"#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let now = Utc::now();
        let mut requeued = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            job.requeue_abandoned(now)?;
            write_back(&mut tx, &job, "requeue_stale").await?;
            requeued.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", e))?;
        Ok(requeued)
    }

    #[instrument(skip(self), err)]
    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_record
            WHERE "isSettled"
              AND "settledAt" < $1
              AND (cardinality($2::varchar[]) = 0 OR "queueName" = ANY($2))
            "#,
        )
        .bind(older_than)
        .bind(queue_names)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_settled", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobBufferStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(buffer_id = %buffer_id), err)]
    async fn add(&self, buffer_id: &str, job: NewJob) -> Result<BufferedJob, JobStoreError> {
        let payload =
            serde_json::to_string(&job).map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        let now = Utc::now();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_record_buffer ("bufferId", job, "createdAt", "updatedAt")
            VALUES ($1, $2, $3, $3)
            RETURNING id
            "#,
        )
        .bind(buffer_id)
        .bind(payload)
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("buffer_add", e))?;

        Ok(BufferedJob {
            id,
            buffer_id: buffer_id.to_string(),
            job,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self), err)]
    async fn size(&self, buffer_ids: &[String]) -> Result<HashMap<String, usize>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT "bufferId", COUNT(*) AS size
            FROM job_record_buffer
            WHERE cardinality($1::varchar[]) = 0 OR "bufferId" = ANY($1)
            GROUP BY "bufferId"
            "#,
        )
        .bind(buffer_ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("buffer_size", e))?;

        let mut sizes: HashMap<String, usize> =
            buffer_ids.iter().map(|id| (id.clone(), 0)).collect();
        for row in rows {
            let buffer_id: String = row
                .try_get("bufferId")
                .map_err(|e| map_sqlx_error("buffer_size", e))?;
            let size: i64 = row
                .try_get("size")
                .map_err(|e| map_sqlx_error("buffer_size", e))?;
            sizes.insert(buffer_id, size.max(0) as usize);
        }
        Ok(sizes)
    }

    #[instrument(skip(self), fields(buffer_id = %buffer_id), err)]
    async fn flush(&self, buffer_id: &str) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut tx = self.begin("buffer_flush").await?;

        let rows = sqlx::query(
            r#"
            SELECT id, "bufferId", job, "createdAt", "updatedAt"
            FROM job_record_buffer
            WHERE "bufferId" = $1
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(buffer_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("buffer_flush", e))?;

        let mut flushed_ids = Vec::with_capacity(rows.len());
        let mut created = Vec::with_capacity(rows.len());
        for row in &rows {
            // Any error drops `tx`, rolling back every insert of this flush.
            let entry = buffered_job_from_row(row)?;
            let record = JobRecord::from_buffer(&entry);
            let inserted = insert_job(&mut *tx, &record, "buffer_flush").await?;
            if inserted {
                created.push(record);
            } else {
                debug!(ordinal = entry.id, "buffered job already promoted; skipping");
            }
            flushed_ids.push(entry.id);
        }

        sqlx::query("DELETE FROM job_record_buffer WHERE id = ANY($1)")
            .bind(flushed_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("buffer_flush", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("buffer_flush", e))?;
        Ok(created)
    }
}

/// Insert a job record. Returns `false` when a job with the same buffer
/// provenance already exists.
async fn insert_job(
    conn: &mut PgConnection,
    job: &JobRecord,
    operation: &str,
) -> Result<bool, JobStoreError> {
    if job.retries > MAX_RETRIES {
        return Err(JobStoreError::Serialization(format!(
            "retries {} exceeds the maximum of {MAX_RETRIES}",
            job.retries
        )));
    }

    let result = sqlx::query(concat!(
        "INSERT INTO job_record (",
        job_columns!(),
        r#") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT ("bufferId", "bufferOrdinal") DO NOTHING"#
    ))
    .bind(job.id.as_uuid())
    .bind(&job.queue_name)
    .bind(&job.data)
    .bind(job.state.as_str())
    .bind(i32::from(job.progress))
    .bind(&job.result)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.settled_at)
    .bind(job.is_settled)
    .bind(to_i32(job.retries)?)
    .bind(to_i32(job.attempts)?)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.retry_at)
    .bind(&job.buffer_id)
    .bind(job.buffer_ordinal)
    .bind(job.cancel_requested_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(result.rows_affected() == 1)
}

/// Persist the columns a state transition may change.
async fn write_back(
    tx: &mut Transaction<'_, Postgres>,
    job: &JobRecord,
    operation: &str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE job_record
        SET state = $2,
            progress = $3,
            result = $4,
            error = $5,
            "startedAt" = $6,
            "settledAt" = $7,
            "isSettled" = $8,
            attempts = $9,
            "updatedAt" = $10,
            "retryAt" = $11,
            "cancelRequestedAt" = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.state.as_str())
    .bind(i32::from(job.progress))
    .bind(&job.result)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.settled_at)
    .bind(job.is_settled)
    .bind(to_i32(job.attempts)?)
    .bind(job.updated_at)
    .bind(job.retry_at)
    .bind(job.cancel_requested_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn to_i32(value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Serialization(format!("counter {value} exceeds INTEGER range")))
}

fn parse_state(state: &str) -> Result<JobState, JobStoreError> {
    state
        .parse()
        .map_err(|e: firelancer_core::DomainError| JobStoreError::Serialization(e.to_string()))
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let job = JobRecordRow::try_from_row(row).map_err(|e| {
        JobStoreError::Serialization(format!("failed to deserialize job row: {e}"))
    })?;
    job.try_into()
}

fn buffered_job_from_row(row: &PgRow) -> Result<BufferedJob, JobStoreError> {
    let read = |e: sqlx::Error| {
        JobStoreError::Serialization(format!("failed to deserialize buffer row: {e}"))
    };
    let payload: String = row.try_get("job").map_err(read)?;
    let job: NewJob = serde_json::from_str(&payload)
        .map_err(|e| JobStoreError::Serialization(format!("invalid buffered job payload: {e}")))?;

    Ok(BufferedJob {
        id: row.try_get("id").map_err(read)?,
        buffer_id: row.try_get("bufferId").map_err(read)?,
        job,
        created_at: row.try_get("createdAt").map_err(read)?,
        updated_at: row.try_get("updatedAt").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock: another worker won the race
                Some("40001") | Some("40P01") => JobStoreError::ClaimConflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => {
            JobStoreError::Unavailable(format!("{} failed: {}", operation, err))
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            JobStoreError::Serialization(format!("{} failed: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRecordRow {
    id: uuid::Uuid,
    queue_name: String,
    data: serde_json::Value,
    state: String,
    progress: i32,
    result: Option<serde_json::Value>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
    is_settled: bool,
    retries: i32,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    retry_at: Option<DateTime<Utc>>,
    buffer_id: Option<String>,
    buffer_ordinal: Option<i64>,
    cancel_requested_at: Option<DateTime<Utc>>,
}

impl JobRecordRow {
    fn try_from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queueName")?,
            data: row.try_get("data")?,
            state: row.try_get("state")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            started_at: row.try_get("startedAt")?,
            settled_at: row.try_get("settledAt")?,
            is_settled: row.try_get("isSettled")?,
            retries: row.try_get("retries")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
            retry_at: row.try_get("retryAt")?,
            buffer_id: row.try_get("bufferId")?,
            buffer_ordinal: row.try_get("bufferOrdinal")?,
            cancel_requested_at: row.try_get("cancelRequestedAt")?,
        })
    }
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            queue_name: row.queue_name,
            data: row.data,
            state: parse_state(&row.state)?,
            progress: row.progress.clamp(0, 100) as u8,
            result: row.result,
            error: row.error,
            started_at: row.started_at,
            settled_at: row.settled_at,
            is_settled: row.is_settled,
            retries: row.retries.max(0) as u32,
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            retry_at: row.retry_at,
            buffer_id: row.buffer_id,
            buffer_ordinal: row.buffer_ordinal,
            cancel_requested_at: row.cancel_requested_at,
        })
    }
}
