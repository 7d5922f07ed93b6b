//! Structured logging field names shared by every chatvault crate.
//!
//! Use these as `tracing` field keys so log aggregation can query the same
//! names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job creation and completion |
//! | DEBUG | Claims, skips, retry decisions, config choices |
//! | TRACE | Per-tick iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "ocr", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "queue", "poller", "bundle", "tesseract", "azure", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim_batch", "process", "refresh_job", "extract"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// OCR job UUID.
pub const JOB_ID: &str = "job_id";

/// OCR document UUID.
pub const DOCUMENT_ID: &str = "document_id";

/// Media UUID the document covers.
pub const MEDIA_ID: &str = "media_id";

/// Chat group UUID.
pub const GROUP_ID: &str = "group_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Documents claimed in one tick.
pub const CLAIMED: &str = "claimed";

/// Attempt count after a failure.
pub const ATTEMPTS: &str = "attempts";

/// Size of an OCR input in bytes.
pub const INPUT_BYTES: &str = "input_bytes";

/// Number of images stacked into one bundle.
pub const BUNDLE_SIZE: &str = "bundle_size";

// ─── Provider fields ───────────────────────────────────────────────────────

/// OCR provider identifier.
pub const PROVIDER: &str = "provider";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Reason a document was skipped.
pub const SKIP_REASON: &str = "skip_reason";
