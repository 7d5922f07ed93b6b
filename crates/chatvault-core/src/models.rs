//! Domain models for the OCR job queue.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::Error;

// =============================================================================
// MEDIA (external, read-only)
// =============================================================================

/// Kind of media attachment as recorded by the ingestion adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Document,
    Sticker,
    Audio,
    Video,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Document => "document",
            MediaType::Sticker => "sticker",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Other => "other",
        }
    }

    /// Whether media of this type is ever queued for OCR.
    pub fn is_ocr_eligible(&self) -> bool {
        matches!(
            self,
            MediaType::Image | MediaType::Document | MediaType::Sticker
        )
    }

    /// Whether media of this type can be stacked into a bundle composite.
    pub fn is_bundleable(&self) -> bool {
        matches!(self, MediaType::Image | MediaType::Sticker)
    }

    /// Media types eligible for OCR, as stored in the database.
    pub fn ocr_eligible_strs() -> Vec<String> {
        [MediaType::Image, MediaType::Document, MediaType::Sticker]
            .iter()
            .map(|t| t.as_str().to_string())
            .collect()
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "document" => Ok(MediaType::Document),
            "sticker" => Ok(MediaType::Sticker),
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            "other" => Ok(MediaType::Other),
            other => Err(Error::InvalidInput(format!("unknown media type: {other}"))),
        }
    }
}

/// A stored media attachment belonging to a chat group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub group_id: Uuid,
    /// WhatsApp message the attachment arrived with, if known.
    pub message_id: Option<String>,
    pub file_path: String,
    pub mime_type: Option<String>,
    pub media_type: MediaType,
}

impl MediaItem {
    /// File name component of the stored path, used as a provider hint.
    pub fn filename(&self) -> String {
        Path::new(&self.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string()
    }

    /// Mime type with a generic fallback for untyped attachments.
    pub fn mime_or_default(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }

    /// Key shared by every member of this item's multi-image bundle: the
    /// message id of an image or sticker. `None` when it cannot be bundled.
    pub fn bundle_key(&self) -> Option<&str> {
        if self.media_type.is_bundleable() {
            self.message_id.as_deref()
        } else {
            None
        }
    }
}

// =============================================================================
// OCR JOBS
// =============================================================================

/// How a job selects and (re)queues documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrJobMode {
    /// Only media that has never been queued.
    Missing,
    /// Every candidate, resetting prior results.
    All,
    /// Never-queued media plus documents that previously failed.
    Failed,
}

impl OcrJobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrJobMode::Missing => "missing",
            OcrJobMode::All => "all",
            OcrJobMode::Failed => "failed",
        }
    }
}

impl fmt::Display for OcrJobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcrJobMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(OcrJobMode::Missing),
            "all" => Ok(OcrJobMode::All),
            "failed" => Ok(OcrJobMode::Failed),
            other => Err(Error::InvalidInput(format!("unknown OCR job mode: {other}"))),
        }
    }
}

/// Lifecycle state of an OCR job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrJobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
}

impl OcrJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrJobStatus::Queued => "queued",
            OcrJobStatus::Running => "running",
            OcrJobStatus::Completed => "completed",
            OcrJobStatus::Cancelled => "cancelled",
        }
    }

    /// Documents of active jobs are eligible for claiming.
    pub fn is_active(&self) -> bool {
        matches!(self, OcrJobStatus::Queued | OcrJobStatus::Running)
    }
}

impl fmt::Display for OcrJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcrJobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OcrJobStatus::Queued),
            "running" => Ok(OcrJobStatus::Running),
            "completed" => Ok(OcrJobStatus::Completed),
            "cancelled" => Ok(OcrJobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown OCR job status: {other}"))),
        }
    }
}

/// An operator-initiated batch of OCR documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJob {
    pub id: Uuid,
    pub mode: OcrJobMode,
    pub group_id: Option<Uuid>,
    pub requested_by: String,
    pub status: OcrJobStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub succeeded_items: i64,
    pub failed_items: i64,
    pub skipped_items: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Live per-status document counts of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrJobCounts {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl OcrJobCounts {
    /// Documents in a terminal state.
    pub fn processed(&self) -> i64 {
        self.succeeded + self.failed + self.skipped
    }

    /// Add one document in the given status to the tally.
    pub fn record(&mut self, status: OcrDocumentStatus) {
        self.total += 1;
        match status {
            OcrDocumentStatus::Queued => self.queued += 1,
            OcrDocumentStatus::Processing => self.processing += 1,
            OcrDocumentStatus::Succeeded => self.succeeded += 1,
            OcrDocumentStatus::Failed => self.failed += 1,
            OcrDocumentStatus::Skipped => self.skipped += 1,
        }
    }

    /// Whether nothing remains to be done for the job.
    pub fn is_settled(&self) -> bool {
        self.total == 0
            || (self.processed() >= self.total && self.processing == 0 && self.queued == 0)
    }

    /// Job status implied by these counts. `cancelled` is never overwritten.
    pub fn resolve_status(&self, current: OcrJobStatus) -> OcrJobStatus {
        if current == OcrJobStatus::Cancelled {
            OcrJobStatus::Cancelled
        } else if self.is_settled() {
            OcrJobStatus::Completed
        } else {
            OcrJobStatus::Running
        }
    }
}

/// A job together with its live document counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJobSummary {
    #[serde(flatten)]
    pub job: OcrJob,
    pub counts: OcrJobCounts,
}

/// Request to create a new OCR job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOcrJobRequest {
    pub requested_by: String,
    pub mode: OcrJobMode,
    /// Restrict the job to a single group.
    #[serde(default)]
    pub group_id: Option<Uuid>,
}

/// Result of creating an OCR job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedOcrJob {
    pub job_id: Uuid,
    pub queued_count: i64,
    pub job: OcrJob,
}

// =============================================================================
// OCR DOCUMENTS
// =============================================================================

/// Lifecycle state of an OCR document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrDocumentStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Skipped,
}

impl OcrDocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrDocumentStatus::Queued => "queued",
            OcrDocumentStatus::Processing => "processing",
            OcrDocumentStatus::Succeeded => "succeeded",
            OcrDocumentStatus::Failed => "failed",
            OcrDocumentStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OcrDocumentStatus::Succeeded | OcrDocumentStatus::Failed | OcrDocumentStatus::Skipped
        )
    }
}

impl fmt::Display for OcrDocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcrDocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OcrDocumentStatus::Queued),
            "processing" => Ok(OcrDocumentStatus::Processing),
            "succeeded" => Ok(OcrDocumentStatus::Succeeded),
            "failed" => Ok(OcrDocumentStatus::Failed),
            "skipped" => Ok(OcrDocumentStatus::Skipped),
            other => Err(Error::InvalidInput(format!(
                "unknown OCR document status: {other}"
            ))),
        }
    }
}

/// One OCR work unit, tied 1:1 to a media item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrDocument {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub media_id: Uuid,
    pub status: OcrDocumentStatus,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider: Option<String>,
    pub language: Option<String>,
    pub text: Option<String>,
    pub result_json: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OcrDocument {
    /// Media ids recorded in the result payload of a bundled success.
    pub fn bundled_media_ids(&self) -> Vec<Uuid> {
        self.result_json
            .as_ref()
            .and_then(|v| v.get("bundled_media_ids"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Why a document was moved straight to `skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BundledElsewhere,
    GroupNotMonitored,
    ExceedsSizeLimit,
    UnsupportedType,
    MediaNotFound,
    JobCancelled,
}

impl SkipReason {
    pub fn message(&self) -> &'static str {
        match self {
            SkipReason::BundledElsewhere => "bundled by another result",
            SkipReason::GroupNotMonitored => "group no longer monitored",
            SkipReason::ExceedsSizeLimit => "exceeds size limit",
            SkipReason::UnsupportedType => "unsupported file type",
            SkipReason::MediaNotFound => "media not found",
            SkipReason::JobCancelled => "job cancelled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

// =============================================================================
// OCR RESULTS
// =============================================================================

/// Output of a text-extraction provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrExtraction {
    pub text: String,
    /// Provider-specific response, kept for traceability.
    pub raw_result: JsonValue,
    pub provider: String,
    pub language: String,
}

/// A successful extraction to be written to one or more documents.
#[derive(Debug, Clone)]
pub struct OcrSuccess {
    pub extraction: OcrExtraction,
    /// Every media id whose bytes contributed to the extraction.
    pub media_ids: Vec<Uuid>,
}

impl OcrSuccess {
    /// Payload stored in `result_json` of every document the success covers.
    pub fn result_json(&self) -> JsonValue {
        json!({
            "provider": self.extraction.provider,
            "language": self.extraction.language,
            "bundled": self.media_ids.len() > 1,
            "bundled_media_ids": self.media_ids,
            "raw": self.extraction.raw_result,
        })
    }
}

/// Error recorded on documents failed by stale-claim recovery.
pub const STALE_PROCESSING_ERROR: &str = "processing timed out";

/// Outcome of returning stale `processing` claims to the queue.
///
/// A stale claim counts as an attempt, so a document that repeatedly kills
/// its worker ends up `failed` instead of looping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Documents put back to `queued`.
    pub requeued: i64,
    /// Documents that exhausted their attempts and were failed.
    pub failed: i64,
    /// Distinct jobs owning the failed documents.
    pub failed_job_ids: Vec<Uuid>,
}

impl StaleRecovery {
    pub fn total(&self) -> i64 {
        self.requeued + self.failed
    }
}
