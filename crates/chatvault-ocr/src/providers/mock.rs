//! Mock OCR provider for deterministic testing and dry runs.
//!
//! ## Usage
//!
//! ```rust
//! use chatvault_ocr::MockOcrProvider;
//!
//! let provider = MockOcrProvider::new()
//!     .with_text("Invoice 2026-041")
//!     .failing_first(2);
//! assert_eq!(provider.call_count(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use chatvault_core::{Error, OcrExtraction, OcrProvider, Result};

/// Mock provider that records every call.
#[derive(Clone)]
pub struct MockOcrProvider {
    config: Arc<MockConfig>,
    state: Arc<MockState>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    name: String,
    text: String,
    /// Mime prefixes accepted; empty accepts everything.
    supported: Vec<String>,
    latency: Duration,
    fail_first: usize,
    always_fail: Option<String>,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub mime_type: String,
    pub filename: String,
    pub language: String,
    pub input_bytes: usize,
    pub timestamp: Instant,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            text: "Mock OCR text".to_string(),
            supported: Vec::new(),
            latency: Duration::ZERO,
            fail_first: 0,
            always_fail: None,
        }
    }
}

impl Default for MockOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockOcrProvider {
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            state: Arc::new(MockState::default()),
        }
    }

    /// Name recorded as the provider on extractions.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).name = name.into();
        self
    }

    /// Text returned by every successful extraction.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).text = text.into();
        self
    }

    /// Only accept mime types starting with one of `prefixes`.
    pub fn with_supported(mut self, prefixes: &[&str]) -> Self {
        Arc::make_mut(&mut self.config).supported =
            prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Simulated extraction latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.config).latency = latency;
        self
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_first(mut self, n: usize) -> Self {
        Arc::make_mut(&mut self.config).fail_first = n;
        self
    }

    /// Fail every call with `message`.
    pub fn always_failing(mut self, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).always_fail = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Highest number of extractions observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrProvider for MockOcrProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports(&self, mime_type: &str, _filename: &str) -> bool {
        self.config.supported.is_empty()
            || self
                .config
                .supported
                .iter()
                .any(|prefix| mime_type.starts_with(prefix.as_str()))
    }

    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        filename: &str,
        language: &str,
    ) -> Result<OcrExtraction> {
        let call_index = {
            let mut calls = self
                .state
                .calls
                .lock()
                .map_err(|_| Error::Internal("mock call log poisoned".into()))?;
            calls.push(MockCall {
                mime_type: mime_type.to_string(),
                filename: filename.to_string(),
                language: language.to_string(),
                input_bytes: data.len(),
                timestamp: Instant::now(),
            });
            calls.len() - 1
        };

        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.state.in_flight);
        self.state.peak.fetch_max(running, Ordering::SeqCst);

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        if let Some(message) = &self.config.always_fail {
            return Err(Error::Provider(message.clone()));
        }
        if call_index < self.config.fail_first {
            return Err(Error::Provider(format!(
                "mock failure {} of {}",
                call_index + 1,
                self.config.fail_first
            )));
        }

        Ok(OcrExtraction {
            text: self.config.text.clone(),
            raw_result: json!({
                "engine": "mock",
                "call": call_index + 1,
                "input_bytes": data.len(),
            }),
            provider: self.config.name.clone(),
            language: language.to_string(),
        })
    }
}
