//! OCR job repository implementation.
//!
//! Job aggregates are never incremented in place. Every path that changes
//! document state ends by recomputing counts from `ocr_documents` inside the
//! same transaction that locks the job row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use uuid::Uuid;

use chatvault_core::{
    new_v7, CreateOcrJobRequest, Error, OcrJob, OcrJobCounts, OcrJobRepository, OcrJobStatus,
    OcrJobSummary, Result, SkipReason,
};

pub(crate) const JOB_COLUMNS: &str = "id, mode::text AS mode, group_id, requested_by, \
     status::text AS status, total_items, processed_items, succeeded_items, failed_items, \
     skipped_items, last_error, created_at, started_at, finished_at, updated_at";

/// PostgreSQL implementation of [`OcrJobRepository`].
#[derive(Clone)]
pub struct PgOcrJobRepository {
    pool: Pool<Postgres>,
}

impl PgOcrJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: PgRow) -> Result<OcrJob> {
        Ok(OcrJob {
            id: row.get("id"),
            mode: row.get::<String, _>("mode").parse()?,
            group_id: row.get("group_id"),
            requested_by: row.get("requested_by"),
            status: row.get::<String, _>("status").parse()?,
            total_items: row.get("total_items"),
            processed_items: row.get("processed_items"),
            succeeded_items: row.get("succeeded_items"),
            failed_items: row.get("failed_items"),
            skipped_items: row.get("skipped_items"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn lock_job(conn: &mut PgConnection, job_id: Uuid) -> Result<OcrJob> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ocr_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::JobNotFound(job_id))?;
        Self::parse_job_row(row)
    }
}

/// Live per-status counts of the documents currently attached to a job.
pub(crate) async fn fetch_counts(conn: &mut PgConnection, job_id: Uuid) -> Result<OcrJobCounts> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'skipped') AS skipped
         FROM ocr_documents
         WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(Error::Database)?;

    Ok(OcrJobCounts {
        total: row.get("total"),
        queued: row.get("queued"),
        processing: row.get("processing"),
        succeeded: row.get("succeeded"),
        failed: row.get("failed"),
        skipped: row.get("skipped"),
    })
}

/// Recompute and persist aggregates for a job already locked by the caller.
async fn store_aggregates(
    conn: &mut PgConnection,
    job: &OcrJob,
    now: DateTime<Utc>,
) -> Result<OcrJobSummary> {
    let counts = fetch_counts(conn, job.id).await?;
    let status = counts.resolve_status(job.status);

    let last_error: Option<String> = sqlx::query_scalar(
        "SELECT error_message FROM ocr_documents
         WHERE job_id = $1 AND error_message IS NOT NULL
         ORDER BY updated_at DESC
         LIMIT 1",
    )
    .bind(job.id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let started_at = match (job.started_at, status) {
        (None, OcrJobStatus::Running) => Some(now),
        (started, _) => started,
    };
    let finished_at = if status == OcrJobStatus::Completed && job.status != OcrJobStatus::Completed
    {
        Some(now)
    } else {
        job.finished_at
    };

    let row = sqlx::query(&format!(
        "UPDATE ocr_jobs
         SET status = $2::ocr_job_status, total_items = $3, processed_items = $4,
             succeeded_items = $5, failed_items = $6, skipped_items = $7,
             last_error = $8, started_at = $9, finished_at = $10, updated_at = $11
         WHERE id = $1
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(job.id)
    .bind(status.as_str())
    .bind(counts.total)
    .bind(counts.processed())
    .bind(counts.succeeded)
    .bind(counts.failed)
    .bind(counts.skipped)
    .bind(last_error)
    .bind(started_at)
    .bind(finished_at)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(Error::Database)?;

    Ok(OcrJobSummary {
        job: PgOcrJobRepository::parse_job_row(row)?,
        counts,
    })
}

#[async_trait]
impl OcrJobRepository for PgOcrJobRepository {
    async fn create(&self, req: &CreateOcrJobRequest) -> Result<OcrJob> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO ocr_jobs (id, mode, group_id, requested_by, status, created_at, updated_at)
             VALUES ($1, $2::ocr_job_mode, $3, $4, 'queued'::ocr_job_status, $5, $5)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.mode.as_str())
        .bind(req.group_id)
        .bind(&req.requested_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(row)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<OcrJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM ocr_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<OcrJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ocr_jobs
             ORDER BY created_at DESC, id DESC
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn counts(&self, job_id: Uuid) -> Result<OcrJobCounts> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        fetch_counts(&mut conn, job_id).await
    }

    async fn refresh(&self, job_id: Uuid) -> Result<OcrJobSummary> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let job = Self::lock_job(&mut tx, job_id).await?;
        let summary = store_aggregates(&mut tx, &job, now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(summary)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if !job.status.is_active() {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(job);
        }

        sqlx::query(
            "UPDATE ocr_documents
             SET status = 'skipped'::ocr_document_status, error_message = $2,
                 next_attempt_at = NULL, finished_at = $3, updated_at = $3
             WHERE job_id = $1
               AND status IN ('queued'::ocr_document_status, 'processing'::ocr_document_status)",
        )
        .bind(job_id)
        .bind(SkipReason::JobCancelled.message())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE ocr_jobs
             SET status = 'cancelled'::ocr_job_status, finished_at = $2, updated_at = $2
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        job.status = OcrJobStatus::Cancelled;
        job.finished_at = Some(now);
        let summary = store_aggregates(&mut tx, &job, now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(summary.job)
    }

    async fn retry_failed(&self, job_id: Uuid) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if job.status == OcrJobStatus::Cancelled {
            return Err(Error::InvalidInput(format!(
                "OCR job {job_id} is cancelled"
            )));
        }

        let retried = sqlx::query(
            "UPDATE ocr_documents
             SET status = 'queued'::ocr_document_status, attempts = 0, next_attempt_at = NULL,
                 error_message = NULL, text = NULL, result_json = NULL, provider = NULL,
                 language = NULL, started_at = NULL, finished_at = NULL, updated_at = $2
             WHERE job_id = $1 AND status = 'failed'::ocr_document_status",
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected() as i64;

        if retried > 0 && job.status == OcrJobStatus::Completed {
            // Reopen: clear finished_at so the next completion stamps it again.
            job.status = OcrJobStatus::Running;
            job.finished_at = None;
        }
        store_aggregates(&mut tx, &job, now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(retried)
    }
}
