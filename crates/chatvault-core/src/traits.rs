//! Core traits for repositories and external collaborators.
//!
//! The queue engine only talks to these seams; `chatvault-db` provides the
//! PostgreSQL and in-memory implementations, `chatvault-ocr` the providers and
//! file store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::{EventActor, ServerEvent};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::{
    CreateOcrJobRequest, MediaItem, OcrDocument, OcrDocumentStatus, OcrExtraction, OcrJob,
    OcrJobCounts, OcrJobMode, OcrJobSummary, OcrSuccess, Result, SkipReason, StaleRecovery,
};

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Read access to media records written by the ingestion adapter.
#[async_trait]
pub trait MediaRepository: Send + Sync {
    /// Fetch a single media item.
    async fn get(&self, media_id: Uuid) -> Result<Option<MediaItem>>;

    /// OCR-eligible media (image, document, sticker) of monitored groups,
    /// optionally restricted to one group.
    async fn find_ocr_candidates(&self, group_id: Option<Uuid>) -> Result<Vec<MediaItem>>;

    /// All image/sticker media that arrived with the given message.
    async fn find_bundle_by_message(&self, message_id: &str) -> Result<Vec<MediaItem>>;
}

/// Monitored-group predicate.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn is_monitored(&self, group_id: Uuid) -> Result<bool>;
}

/// Byte-level access to stored media files.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn exists(&self, path: &str) -> bool;

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
}

/// Pluggable text-extraction backend.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Identifier recorded on documents this provider processed.
    fn name(&self) -> &str;

    /// Whether the provider can handle the given input.
    fn supports(&self, mime_type: &str, filename: &str) -> bool;

    /// Extract text from raw file data.
    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        filename: &str,
        language: &str,
    ) -> Result<OcrExtraction>;
}

/// Fire-and-forget destination for progress events.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, audience: &str, event: ServerEvent);

    /// Publish an event caused by `actor`. Sinks without attribution drop it.
    fn publish_as(&self, audience: &str, event: ServerEvent, actor: EventActor) {
        let _ = actor;
        self.publish(audience, event);
    }
}

// =============================================================================
// OCR REPOSITORIES
// =============================================================================

/// Persistence for OCR jobs and their aggregate projection.
#[async_trait]
pub trait OcrJobRepository: Send + Sync {
    /// Insert a new job in `queued` status.
    async fn create(&self, req: &CreateOcrJobRequest) -> Result<OcrJob>;

    async fn get(&self, job_id: Uuid) -> Result<Option<OcrJob>>;

    /// Jobs newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<OcrJob>>;

    /// Live counts from the documents currently attached to the job.
    async fn counts(&self, job_id: Uuid) -> Result<OcrJobCounts>;

    /// Recompute the job's stored aggregates and status from its documents.
    ///
    /// Idempotent. Never changes a `cancelled` status; sets `finished_at`
    /// only on the transition into `completed`.
    async fn refresh(&self, job_id: Uuid) -> Result<OcrJobSummary>;

    /// Cancel the job and skip its queued/processing documents.
    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob>;

    /// Requeue the job's failed documents with attempts reset; reopens a
    /// completed job. Returns the number of documents requeued.
    async fn retry_failed(&self, job_id: Uuid) -> Result<i64>;
}

/// Persistence and state machine for OCR documents.
#[async_trait]
pub trait OcrDocumentRepository: Send + Sync {
    /// Queue documents for the given media according to the job mode.
    /// Returns how many documents were inserted or reset.
    async fn enqueue(&self, job_id: Uuid, mode: OcrJobMode, media_ids: &[Uuid]) -> Result<i64>;

    /// Atomically claim up to `limit` eligible queued documents, oldest first,
    /// moving them to `processing`. Concurrent callers never receive the same row.
    ///
    /// At most one document per bundle is claimed, and none while another
    /// member of its bundle is already `processing`.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<OcrDocument>>;

    async fn get(&self, document_id: Uuid) -> Result<Option<OcrDocument>>;

    async fn get_by_media(&self, media_id: Uuid) -> Result<Option<OcrDocument>>;

    async fn list_for_job(
        &self,
        job_id: Uuid,
        status: Option<OcrDocumentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OcrDocument>>;

    /// Whether another image document of the same message already succeeded.
    async fn has_succeeded_sibling(&self, message_id: &str, exclude_document_id: Uuid)
        -> Result<bool>;

    /// Move a `processing` document to `skipped`. Returns false when the
    /// document was no longer processing.
    async fn mark_skipped(&self, document_id: Uuid, reason: SkipReason) -> Result<bool>;

    /// Write a success to the claimed document and every other bundled media
    /// document. Returns the distinct job ids whose documents changed.
    async fn mark_succeeded(&self, document_id: Uuid, success: &OcrSuccess) -> Result<Vec<Uuid>>;

    /// Apply the retry policy to a failed `processing` document. Returns
    /// `None` when the document was no longer processing.
    async fn record_failure(
        &self,
        document_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryDecision>>;

    /// Recover documents stuck in `processing` since before `started_before`.
    /// Each recovery counts as an attempt under `policy`: documents with
    /// attempts left are requeued with backoff, the rest are failed.
    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<StaleRecovery>;
}
