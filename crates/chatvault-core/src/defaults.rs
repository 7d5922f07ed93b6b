//! Centralized default constants for the chatvault OCR queue.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs read environment overrides and fall back to these.

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for job and document listings.
pub const PAGE_LIMIT: i64 = 50;

/// Upper bound on a single listing page.
pub const PAGE_LIMIT_MAX: i64 = 500;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;

// =============================================================================
// EVENTS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Audience role that receives OCR progress events.
pub const PROGRESS_AUDIENCE: &str = "admin";

// =============================================================================
// OCR QUEUE
// =============================================================================

/// Documents processed concurrently within one tick.
pub const OCR_CONCURRENCY: usize = 2;

/// Attempts before a document is marked failed.
pub const OCR_MAX_ATTEMPTS: i32 = 3;

/// Linear retry backoff step in seconds (delay = attempts * step).
pub const OCR_RETRY_BACKOFF_SECS: u64 = 60;

/// Largest accepted backoff step in seconds (one day).
pub const OCR_RETRY_BACKOFF_MAX_SECS: u64 = 86_400;

/// Poller interval in milliseconds.
pub const OCR_POLL_INTERVAL_MS: u64 = 5_000;

/// Shortest accepted poller interval in milliseconds.
pub const OCR_POLL_INTERVAL_MIN_MS: u64 = 10;

/// Largest OCR input accepted, in bytes (20 MiB).
pub const OCR_MAX_FILE_BYTES: usize = 20 * 1024 * 1024;

/// Language hint passed to providers.
pub const OCR_DEFAULT_LANGUAGE: &str = "eng";

/// Age after which a `processing` document is considered abandoned.
pub const OCR_STALE_AFTER_SECS: u64 = 1_800;

/// Largest accepted stale threshold in seconds (one week).
pub const OCR_STALE_AFTER_MAX_SECS: u64 = 604_800;

/// Default primary provider identifier.
pub const OCR_PROVIDER: &str = "tesseract";

// =============================================================================
// PROVIDERS
// =============================================================================

/// Default tesseract executable.
pub const TESSERACT_CMD: &str = "tesseract";

/// Timeout for a single tesseract invocation in seconds.
pub const TESSERACT_TIMEOUT_SECS: u64 = 120;

/// Azure Read API version path segment.
pub const AZURE_READ_API_PATH: &str = "vision/v3.2/read/analyze";

/// Interval between Azure operation status polls in milliseconds.
pub const AZURE_POLL_INTERVAL_MS: u64 = 1_000;

/// Give up on an Azure read operation after this many seconds.
pub const AZURE_OPERATION_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// ENVIRONMENT VARIABLES
// =============================================================================

pub const ENV_OCR_ENABLED: &str = "OCR_ENABLED";
pub const ENV_OCR_PROVIDER: &str = "OCR_PROVIDER";
pub const ENV_OCR_FALLBACK_PROVIDER: &str = "OCR_FALLBACK_PROVIDER";
pub const ENV_OCR_CONCURRENCY: &str = "OCR_CONCURRENCY";
pub const ENV_OCR_BATCH_SIZE: &str = "OCR_BATCH_SIZE";
pub const ENV_OCR_MAX_ATTEMPTS: &str = "OCR_MAX_ATTEMPTS";
pub const ENV_OCR_RETRY_BACKOFF_SECS: &str = "OCR_RETRY_BACKOFF_SECS";
pub const ENV_OCR_POLL_INTERVAL_MS: &str = "OCR_POLL_INTERVAL_MS";
pub const ENV_OCR_MAX_FILE_BYTES: &str = "OCR_MAX_FILE_BYTES";
pub const ENV_OCR_DEFAULT_LANGUAGE: &str = "OCR_DEFAULT_LANGUAGE";
pub const ENV_OCR_STALE_AFTER_SECS: &str = "OCR_STALE_AFTER_SECS";
pub const ENV_TESSERACT_CMD: &str = "TESSERACT_CMD";
pub const ENV_AZURE_VISION_ENDPOINT: &str = "AZURE_VISION_ENDPOINT";
pub const ENV_AZURE_VISION_KEY: &str = "AZURE_VISION_KEY";
pub const ENV_MEDIA_ROOT: &str = "MEDIA_ROOT";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults_match_documented_values() {
        assert_eq!(OCR_CONCURRENCY, 2);
        assert_eq!(OCR_MAX_ATTEMPTS, 3);
        assert_eq!(OCR_RETRY_BACKOFF_SECS, 60);
        assert_eq!(OCR_POLL_INTERVAL_MS, 5_000);
    }

    #[test]
    fn test_stale_threshold_exceeds_provider_timeouts() {
        assert!(OCR_STALE_AFTER_SECS > AZURE_OPERATION_TIMEOUT_SECS);
        assert!(OCR_STALE_AFTER_SECS > TESSERACT_TIMEOUT_SECS);
    }

    #[test]
    fn test_bounds_contain_defaults() {
        assert!(OCR_RETRY_BACKOFF_SECS <= OCR_RETRY_BACKOFF_MAX_SECS);
        assert!(OCR_POLL_INTERVAL_MS >= OCR_POLL_INTERVAL_MIN_MS);
        assert!(OCR_STALE_AFTER_SECS <= OCR_STALE_AFTER_MAX_SECS);
    }

    #[test]
    fn test_page_limits_are_ordered() {
        assert!(PAGE_LIMIT <= PAGE_LIMIT_MAX);
        assert_eq!(PAGE_OFFSET, 0);
    }
}
