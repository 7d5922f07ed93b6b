//! OCR queue configuration.

use std::path::PathBuf;
use std::time::Duration;

use chatvault_core::defaults::*;
use chatvault_core::RetryPolicy;

fn clamp_backoff(backoff: Duration) -> Duration {
    backoff.min(Duration::from_secs(OCR_RETRY_BACKOFF_MAX_SECS))
}

fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(OCR_POLL_INTERVAL_MIN_MS))
}

fn clamp_stale_after(stale_after: Duration) -> Duration {
    stale_after.min(Duration::from_secs(OCR_STALE_AFTER_MAX_SECS))
}

/// Configuration for the OCR queue engine and its providers.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Whether the poller runs at all. Job API calls work either way.
    pub enabled: bool,
    /// Primary provider identifier (see [`crate::ProviderRegistry`]).
    pub provider: String,
    /// Provider tried when the primary fails or cannot handle the input.
    pub fallback_provider: Option<String>,
    /// Documents processed concurrently within one tick.
    pub concurrency: usize,
    /// Documents claimed per tick.
    pub batch_size: usize,
    pub max_attempts: i32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub max_file_bytes: usize,
    pub default_language: String,
    /// Documents left in `processing` longer than this are requeued.
    pub stale_after: Duration,
    pub tesseract_cmd: String,
    pub tesseract_timeout: Duration,
    pub azure_endpoint: Option<String>,
    pub azure_key: Option<String>,
    /// Base directory for relative media paths.
    pub media_root: Option<PathBuf>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: OCR_PROVIDER.to_string(),
            fallback_provider: None,
            concurrency: OCR_CONCURRENCY,
            batch_size: OCR_CONCURRENCY,
            max_attempts: OCR_MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(OCR_RETRY_BACKOFF_SECS),
            poll_interval: Duration::from_millis(OCR_POLL_INTERVAL_MS),
            max_file_bytes: OCR_MAX_FILE_BYTES,
            default_language: OCR_DEFAULT_LANGUAGE.to_string(),
            stale_after: Duration::from_secs(OCR_STALE_AFTER_SECS),
            tesseract_cmd: TESSERACT_CMD.to_string(),
            tesseract_timeout: Duration::from_secs(TESSERACT_TIMEOUT_SECS),
            azure_endpoint: None,
            azure_key: None,
            media_root: None,
        }
    }
}

impl OcrConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `OCR_ENABLED` | `true` | Enable/disable the poller |
    /// | `OCR_PROVIDER` | `tesseract` | Primary provider id |
    /// | `OCR_FALLBACK_PROVIDER` | unset | Fallback provider id |
    /// | `OCR_CONCURRENCY` | `2` | Documents processed concurrently per tick |
    /// | `OCR_BATCH_SIZE` | concurrency | Documents claimed per tick |
    /// | `OCR_MAX_ATTEMPTS` | `3` | Attempts before a document fails |
    /// | `OCR_RETRY_BACKOFF_SECS` | `60` | Linear backoff step (at most one day) |
    /// | `OCR_POLL_INTERVAL_MS` | `5000` | Poller interval (at least 10ms) |
    /// | `OCR_MAX_FILE_BYTES` | `20971520` | Largest OCR input |
    /// | `OCR_DEFAULT_LANGUAGE` | `eng` | Language hint for providers |
    /// | `OCR_STALE_AFTER_SECS` | `1800` | Stale `processing` threshold (at most one week) |
    /// | `TESSERACT_CMD` | `tesseract` | Tesseract executable |
    /// | `AZURE_VISION_ENDPOINT` | unset | Azure AI Vision endpoint |
    /// | `AZURE_VISION_KEY` | unset | Azure AI Vision key |
    /// | `MEDIA_ROOT` | unset | Base directory for relative media paths |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unparseable values fall
    /// back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());

        let enabled = text(ENV_OCR_ENABLED)
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let concurrency = number(ENV_OCR_CONCURRENCY)
            .map(|v| v as usize)
            .unwrap_or(OCR_CONCURRENCY)
            .max(1);

        let batch_size = number(ENV_OCR_BATCH_SIZE)
            .map(|v| v as usize)
            .unwrap_or(concurrency)
            .max(1);

        let max_attempts = text(ENV_OCR_MAX_ATTEMPTS)
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(OCR_MAX_ATTEMPTS)
            .max(1);

        Self {
            enabled,
            provider: text(ENV_OCR_PROVIDER)
                .map(|v| v.to_lowercase())
                .unwrap_or_else(|| OCR_PROVIDER.to_string()),
            fallback_provider: text(ENV_OCR_FALLBACK_PROVIDER).map(|v| v.to_lowercase()),
            concurrency,
            batch_size,
            max_attempts,
            retry_backoff: clamp_backoff(Duration::from_secs(
                number(ENV_OCR_RETRY_BACKOFF_SECS).unwrap_or(OCR_RETRY_BACKOFF_SECS),
            )),
            poll_interval: clamp_poll_interval(Duration::from_millis(
                number(ENV_OCR_POLL_INTERVAL_MS).unwrap_or(OCR_POLL_INTERVAL_MS),
            )),
            max_file_bytes: number(ENV_OCR_MAX_FILE_BYTES)
                .map(|v| v as usize)
                .unwrap_or(OCR_MAX_FILE_BYTES),
            default_language: text(ENV_OCR_DEFAULT_LANGUAGE)
                .unwrap_or_else(|| OCR_DEFAULT_LANGUAGE.to_string()),
            stale_after: clamp_stale_after(Duration::from_secs(
                number(ENV_OCR_STALE_AFTER_SECS).unwrap_or(OCR_STALE_AFTER_SECS),
            )),
            tesseract_cmd: text(ENV_TESSERACT_CMD)
                .unwrap_or_else(|| TESSERACT_CMD.to_string()),
            tesseract_timeout: Duration::from_secs(TESSERACT_TIMEOUT_SECS),
            azure_endpoint: text(ENV_AZURE_VISION_ENDPOINT),
            azure_key: text(ENV_AZURE_VISION_KEY),
            media_root: text(ENV_MEDIA_ROOT).map(PathBuf::from),
        }
    }

    /// Retry policy derived from the attempt and backoff settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_backoff)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_fallback_provider(mut self, provider: impl Into<String>) -> Self {
        self.fallback_provider = Some(provider.into());
        self
    }

    /// Set concurrency. Batch size follows unless set afterwards.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.batch_size = self.concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = clamp_backoff(backoff);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = clamp_poll_interval(interval);
        self
    }

    pub fn with_max_file_bytes(mut self, max: usize) -> Self {
        self.max_file_bytes = max;
        self
    }

    pub fn with_default_language(mut self, language: impl Into<String>) -> Self {
        self.default_language = language.into();
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = clamp_stale_after(stale_after);
        self
    }

    pub fn with_media_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.media_root = Some(root.into());
        self
    }

    pub fn with_azure(mut self, endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        self.azure_endpoint = Some(endpoint.into());
        self.azure_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OcrConfig::default();
        assert!(config.enabled);
        assert_eq!(config.provider, "tesseract");
        assert!(config.fallback_provider.is_none());
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(5000));
        assert_eq!(config.max_file_bytes, 20 * 1024 * 1024);
        assert_eq!(config.default_language, "eng");
    }

    #[test]
    fn test_empty_lookup_matches_default() {
        let config = OcrConfig::from_lookup(|_| None);
        let default = OcrConfig::default();
        assert_eq!(config.enabled, default.enabled);
        assert_eq!(config.provider, default.provider);
        assert_eq!(config.concurrency, default.concurrency);
        assert_eq!(config.batch_size, default.batch_size);
        assert_eq!(config.stale_after, default.stale_after);
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let config = OcrConfig::from_lookup(lookup(&[
            ("OCR_ENABLED", "false"),
            ("OCR_PROVIDER", "Azure"),
            ("OCR_FALLBACK_PROVIDER", "tesseract"),
            ("OCR_CONCURRENCY", "4"),
            ("OCR_MAX_ATTEMPTS", "5"),
            ("OCR_RETRY_BACKOFF_SECS", "30"),
            ("OCR_POLL_INTERVAL_MS", "250"),
            ("OCR_MAX_FILE_BYTES", "1024"),
            ("OCR_DEFAULT_LANGUAGE", "deu"),
            ("AZURE_VISION_ENDPOINT", "https://example.cognitiveservices.azure.com"),
            ("AZURE_VISION_KEY", "secret"),
            ("MEDIA_ROOT", "/srv/media"),
        ]));

        assert!(!config.enabled);
        assert_eq!(config.provider, "azure");
        assert_eq!(config.fallback_provider.as_deref(), Some("tesseract"));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_file_bytes, 1024);
        assert_eq!(config.default_language, "deu");
        assert_eq!(config.azure_key.as_deref(), Some("secret"));
        assert_eq!(config.media_root, Some(PathBuf::from("/srv/media")));
    }

    #[test]
    fn test_batch_size_independent_of_concurrency() {
        let config = OcrConfig::from_lookup(lookup(&[
            ("OCR_CONCURRENCY", "2"),
            ("OCR_BATCH_SIZE", "10"),
        ]));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = OcrConfig::from_lookup(lookup(&[
            ("OCR_CONCURRENCY", "lots"),
            ("OCR_MAX_ATTEMPTS", "0"),
            ("OCR_PROVIDER", "  "),
        ]));
        assert_eq!(config.concurrency, OCR_CONCURRENCY);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.provider, "tesseract");
    }

    #[test]
    fn test_enabled_accepts_zero_as_false() {
        let config = OcrConfig::from_lookup(lookup(&[("OCR_ENABLED", "0")]));
        assert!(!config.enabled);
        let config = OcrConfig::from_lookup(lookup(&[("OCR_ENABLED", "yes")]));
        assert!(config.enabled);
    }

    #[test]
    fn test_builder_methods() {
        let config = OcrConfig::default()
            .with_concurrency(0)
            .with_max_attempts(4)
            .with_retry_backoff(Duration::from_secs(1))
            .with_fallback_provider("mock");

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.fallback_provider.as_deref(), Some("mock"));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff_step, Duration::from_secs(1));
    }

    #[test]
    fn test_out_of_range_durations_are_clamped() {
        let config = OcrConfig::from_lookup(lookup(&[
            ("OCR_RETRY_BACKOFF_SECS", "18446744073709551615"),
            ("OCR_POLL_INTERVAL_MS", "0"),
            ("OCR_STALE_AFTER_SECS", "18446744073709551615"),
        ]));
        assert_eq!(config.retry_backoff, Duration::from_secs(86_400));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.stale_after, Duration::from_secs(604_800));

        // A clamped step still yields a finite retry time.
        let decision = config.retry_policy().decide(1, chrono::Utc::now());
        assert!(!decision.is_final());
    }

    #[test]
    fn test_builders_clamp_durations() {
        let config = OcrConfig::default()
            .with_poll_interval(Duration::ZERO)
            .with_retry_backoff(Duration::from_secs(u64::MAX))
            .with_stale_after(Duration::MAX);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.retry_backoff, Duration::from_secs(86_400));
        assert_eq!(config.stale_after, Duration::from_secs(604_800));
    }
}
