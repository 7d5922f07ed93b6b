//! OCR document repository implementation.
//!
//! `ocr_documents` is the synchronization point between pollers. Claims use
//! `FOR UPDATE SKIP LOCKED` and hand out one document per bundle; skip and
//! failure writes only apply while the row is still `processing`, so a cancel
//! or a bundle success that got there first is never undone.
//!
//! Statements that lock several rows lock them in `id` order.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use chatvault_core::{
    new_v7, Error, MediaType, OcrDocument, OcrDocumentRepository, OcrDocumentStatus, OcrJobMode,
    OcrSuccess, Result, RetryDecision, RetryPolicy, SkipReason, StaleRecovery,
    STALE_PROCESSING_ERROR,
};

const DOCUMENT_COLUMNS: &str = "id, job_id, media_id, status::text AS status, attempts, \
     next_attempt_at, error_message, provider, language, text, result_json, created_at, \
     started_at, finished_at, updated_at";

/// Inserts a queued document per media id; existing documents are left alone.
const INSERT_MISSING_SQL: &str = "INSERT INTO ocr_documents
         (id, job_id, media_id, status, attempts, created_at, updated_at)
     SELECT t.id, $3, t.media_id, 'queued'::ocr_document_status, 0, $4, $4
     FROM UNNEST($1::uuid[], $2::uuid[]) AS t(id, media_id)
     ON CONFLICT (media_id) DO NOTHING";

/// Candidates read per claimed slot, so a large bundle at the head of the
/// queue does not shrink the batch to a single document.
const CLAIM_OVERSCAN: i64 = 4;

fn bundleable_types() -> Vec<String> {
    [MediaType::Image, MediaType::Sticker]
        .iter()
        .map(|t| t.as_str().to_string())
        .collect()
}

/// Keep the first candidate of every bundle key, preserving order.
/// Candidates without a key are always kept.
pub(crate) fn first_per_bundle<I>(candidates: I) -> Vec<Uuid>
where
    I: IntoIterator<Item = (Uuid, Option<String>)>,
{
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|(id, key)| match key {
            Some(key) if !seen.insert(key.clone()) => None,
            _ => Some(id),
        })
        .collect()
}

/// Write a retry decision to a locked `processing` row.
async fn apply_decision(
    conn: &mut PgConnection,
    document_id: Uuid,
    decision: RetryDecision,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    match decision {
        RetryDecision::Retry {
            attempts,
            next_attempt_at,
        } => {
            sqlx::query(
                "UPDATE ocr_documents
                 SET status = 'queued'::ocr_document_status, attempts = $2,
                     error_message = $3, next_attempt_at = $4, started_at = NULL,
                     updated_at = $5
                 WHERE id = $1",
            )
            .bind(document_id)
            .bind(attempts)
            .bind(error)
            .bind(next_attempt_at)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        }
        RetryDecision::GiveUp { attempts } => {
            sqlx::query(
                "UPDATE ocr_documents
                 SET status = 'failed'::ocr_document_status, attempts = $2,
                     error_message = $3, next_attempt_at = NULL, finished_at = $4,
                     updated_at = $4
                 WHERE id = $1",
            )
            .bind(document_id)
            .bind(attempts)
            .bind(error)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        }
    }
    Ok(())
}

/// PostgreSQL implementation of [`OcrDocumentRepository`].
#[derive(Clone)]
pub struct PgOcrDocumentRepository {
    pool: Pool<Postgres>,
}

impl PgOcrDocumentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_document_row(row: PgRow) -> Result<OcrDocument> {
        Ok(OcrDocument {
            id: row.get("id"),
            job_id: row.get("job_id"),
            media_id: row.get("media_id"),
            status: row.get::<String, _>("status").parse()?,
            attempts: row.get("attempts"),
            next_attempt_at: row.get("next_attempt_at"),
            error_message: row.get("error_message"),
            provider: row.get("provider"),
            language: row.get("language"),
            text: row.get("text"),
            result_json: row.get("result_json"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_rows(rows: Vec<PgRow>) -> Result<Vec<OcrDocument>> {
        rows.into_iter().map(Self::parse_document_row).collect()
    }
}

#[async_trait]
impl OcrDocumentRepository for PgOcrDocumentRepository {
    async fn enqueue(&self, job_id: Uuid, mode: OcrJobMode, media_ids: &[Uuid]) -> Result<i64> {
        if media_ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let ids: Vec<Uuid> = media_ids.iter().map(|_| new_v7()).collect();

        let queued = match mode {
            OcrJobMode::Missing => sqlx::query(INSERT_MISSING_SQL)
                .bind(&ids)
                .bind(media_ids)
                .bind(job_id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?
                .rows_affected(),
            OcrJobMode::All => sqlx::query(
                "INSERT INTO ocr_documents
                     (id, job_id, media_id, status, attempts, created_at, updated_at)
                 SELECT t.id, $3, t.media_id, 'queued'::ocr_document_status, 0, $4, $4
                 FROM UNNEST($1::uuid[], $2::uuid[]) AS t(id, media_id)
                 ON CONFLICT (media_id) DO UPDATE
                 SET job_id = EXCLUDED.job_id, status = 'queued'::ocr_document_status,
                     attempts = 0, next_attempt_at = NULL, error_message = NULL,
                     provider = NULL, language = NULL, text = NULL, result_json = NULL,
                     started_at = NULL, finished_at = NULL, updated_at = EXCLUDED.updated_at",
            )
            .bind(&ids)
            .bind(media_ids)
            .bind(job_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected(),
            OcrJobMode::Failed => {
                let mut tx = self.pool.begin().await.map_err(Error::Database)?;

                let inserted = sqlx::query(INSERT_MISSING_SQL)
                    .bind(&ids)
                    .bind(media_ids)
                    .bind(job_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?
                    .rows_affected();

                let reset = sqlx::query(
                    "UPDATE ocr_documents
                     SET job_id = $2, status = 'queued'::ocr_document_status, attempts = 0,
                         next_attempt_at = NULL, error_message = NULL, started_at = NULL,
                         finished_at = NULL, updated_at = $3
                     WHERE media_id = ANY($1) AND status = 'failed'::ocr_document_status",
                )
                .bind(media_ids)
                .bind(job_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?
                .rows_affected();

                tx.commit().await.map_err(Error::Database)?;
                inserted + reset
            }
        };

        debug!(
            subsystem = "db",
            component = "ocr_documents",
            op = "enqueue",
            job_id = %job_id,
            mode = %mode,
            candidates = media_ids.len(),
            queued,
            "Enqueued OCR documents"
        );
        Ok(queued as i64)
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<OcrDocument>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // SKIP LOCKED lets concurrent pollers partition the queue instead of
        // waiting on each other. Bundles with a member in flight are left
        // alone; the member's success covers them.
        let candidates: Vec<(Uuid, Option<String>)> = sqlx::query_as(
            "SELECT d.id,
                    CASE WHEN m.media_type = ANY($3) THEN m.message_id END AS bundle_key
             FROM ocr_documents d
             JOIN ocr_jobs j ON j.id = d.job_id
             LEFT JOIN media m ON m.id = d.media_id
             WHERE d.status = 'queued'::ocr_document_status
               AND j.status IN ('queued'::ocr_job_status, 'running'::ocr_job_status)
               AND (d.next_attempt_at IS NULL OR d.next_attempt_at <= $1)
               AND NOT EXISTS (
                   SELECT 1 FROM ocr_documents p
                   JOIN media pm ON pm.id = p.media_id
                   WHERE p.status = 'processing'::ocr_document_status
                     AND m.media_type = ANY($3)
                     AND pm.media_type = ANY($3)
                     AND pm.message_id = m.message_id
               )
             ORDER BY d.created_at ASC, d.id ASC
             LIMIT $2
             FOR UPDATE OF d SKIP LOCKED",
        )
        .bind(now)
        .bind(limit.saturating_mul(CLAIM_OVERSCAN))
        .bind(bundleable_types())
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let scanned = candidates.len();
        let mut ids = first_per_bundle(candidates);
        ids.truncate(limit as usize);
        if ids.is_empty() {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "UPDATE ocr_documents
             SET status = 'processing'::ocr_document_status, started_at = $1, updated_at = $1
             WHERE id = ANY($2)
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(now)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "ocr_documents",
            op = "claim_batch",
            scanned,
            claimed = rows.len(),
            "Claimed OCR documents"
        );

        // RETURNING order is unspecified.
        let mut claimed = Self::parse_rows(rows)?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<OcrDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM ocr_documents WHERE id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_document_row).transpose()
    }

    async fn get_by_media(&self, media_id: Uuid) -> Result<Option<OcrDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM ocr_documents WHERE media_id = $1"
        ))
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_document_row).transpose()
    }

    async fn list_for_job(
        &self,
        job_id: Uuid,
        status: Option<OcrDocumentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OcrDocument>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM ocr_documents
             WHERE job_id = $1 AND ($2::text IS NULL OR status::text = $2)
             ORDER BY created_at ASC, id ASC
             LIMIT $3 OFFSET $4"
        ))
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn has_succeeded_sibling(
        &self,
        message_id: &str,
        exclude_document_id: Uuid,
    ) -> Result<bool> {
        let bundleable = bundleable_types();

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM ocr_documents d
                 JOIN media m ON m.id = d.media_id
                 WHERE m.message_id = $1
                   AND m.media_type = ANY($2)
                   AND d.id <> $3
                   AND d.status = 'succeeded'::ocr_document_status
             )",
        )
        .bind(message_id)
        .bind(&bundleable)
        .bind(exclude_document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }

    async fn mark_skipped(&self, document_id: Uuid, reason: SkipReason) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE ocr_documents
             SET status = 'skipped'::ocr_document_status, error_message = $2,
                 next_attempt_at = NULL, finished_at = $3, updated_at = $3
             WHERE id = $1 AND status = 'processing'::ocr_document_status",
        )
        .bind(document_id)
        .bind(reason.message())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_succeeded(&self, document_id: Uuid, success: &OcrSuccess) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let extraction = &success.extraction;
        let payload = success.result_json();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Lock the whole bundle up front so two successes for one bundle
        // queue behind each other instead of deadlocking.
        sqlx::query(
            "SELECT id FROM ocr_documents
             WHERE id = $1 OR media_id = ANY($2)
             ORDER BY id
             FOR UPDATE",
        )
        .bind(document_id)
        .bind(&success.media_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let row = sqlx::query(
            "UPDATE ocr_documents
             SET status = 'succeeded'::ocr_document_status, text = $2, provider = $3,
                 language = $4, result_json = $5, error_message = NULL,
                 next_attempt_at = NULL, finished_at = $6, updated_at = $6
             WHERE id = $1
             RETURNING job_id, media_id",
        )
        .bind(document_id)
        .bind(&extraction.text)
        .bind(&extraction.provider)
        .bind(&extraction.language)
        .bind(&payload)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("OCR document {document_id}")))?;

        let own_job: Option<Uuid> = row.get("job_id");
        let own_media: Uuid = row.get("media_id");
        let mut job_ids: Vec<Uuid> = own_job.into_iter().collect();

        let mut siblings: Vec<Uuid> = success
            .media_ids
            .iter()
            .copied()
            .filter(|id| *id != own_media)
            .collect();
        siblings.sort();
        siblings.dedup();

        if !siblings.is_empty() {
            let ids: Vec<Uuid> = siblings.iter().map(|_| new_v7()).collect();
            // New sibling rows join the claimed document's job; existing rows
            // keep the job they belong to.
            let sibling_jobs: Vec<Option<Uuid>> = sqlx::query_scalar(
                "INSERT INTO ocr_documents
                     (id, job_id, media_id, status, attempts, text, provider, language,
                      result_json, created_at, started_at, finished_at, updated_at)
                 SELECT t.id, $3, t.media_id, 'succeeded'::ocr_document_status, 0, $4, $5, $6,
                        $7, $8, $8, $8, $8
                 FROM UNNEST($1::uuid[], $2::uuid[]) AS t(id, media_id)
                 ON CONFLICT (media_id) DO UPDATE
                 SET status = 'succeeded'::ocr_document_status, text = EXCLUDED.text,
                     provider = EXCLUDED.provider, language = EXCLUDED.language,
                     result_json = EXCLUDED.result_json, error_message = NULL,
                     next_attempt_at = NULL, finished_at = EXCLUDED.finished_at,
                     updated_at = EXCLUDED.updated_at
                 RETURNING job_id",
            )
            .bind(&ids)
            .bind(&siblings)
            .bind(own_job)
            .bind(&extraction.text)
            .bind(&extraction.provider)
            .bind(&extraction.language)
            .bind(&payload)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Database)?;

            job_ids.extend(sibling_jobs.into_iter().flatten());
        }

        tx.commit().await.map_err(Error::Database)?;

        job_ids.sort();
        job_ids.dedup();
        Ok(job_ids)
    }

    async fn record_failure(
        &self,
        document_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryDecision>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let attempts: Option<i32> = sqlx::query_scalar(
            "SELECT attempts FROM ocr_documents
             WHERE id = $1 AND status = 'processing'::ocr_document_status
             FOR UPDATE",
        )
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(prior) = attempts else {
            return Ok(None);
        };

        let decision = policy.decide(prior, now);
        apply_decision(&mut *tx, document_id, decision, error, now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(Some(decision))
    }

    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<StaleRecovery> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let stale: Vec<(Uuid, Option<Uuid>, i32)> = sqlx::query_as(
            "SELECT id, job_id, attempts FROM ocr_documents
             WHERE status = 'processing'::ocr_document_status AND started_at < $1
             ORDER BY id
             FOR UPDATE SKIP LOCKED",
        )
        .bind(started_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut recovery = StaleRecovery::default();
        for (document_id, job_id, prior) in stale {
            let decision = policy.decide(prior, now);
            apply_decision(&mut *tx, document_id, decision, STALE_PROCESSING_ERROR, now).await?;
            if decision.is_final() {
                warn!(
                    subsystem = "db",
                    component = "ocr_documents",
                    op = "requeue_stale",
                    document_id = %document_id,
                    attempts = decision.attempts(),
                    "Stale OCR document exhausted its attempts"
                );
                recovery.failed += 1;
                recovery.failed_job_ids.extend(job_id);
            } else {
                recovery.requeued += 1;
            }
        }

        tx.commit().await.map_err(Error::Database)?;

        recovery.failed_job_ids.sort();
        recovery.failed_job_ids.dedup();
        Ok(recovery)
    }
}
