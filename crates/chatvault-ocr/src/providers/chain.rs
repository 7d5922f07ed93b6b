//! Primary provider with an optional fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use chatvault_core::{Error, OcrExtraction, OcrProvider, Result};

/// Tries the primary provider, then the fallback when the primary fails or
/// cannot handle the input.
#[derive(Clone)]
pub struct ProviderChain {
    primary: Arc<dyn OcrProvider>,
    fallback: Option<Arc<dyn OcrProvider>>,
}

impl ProviderChain {
    pub fn new(primary: Arc<dyn OcrProvider>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn OcrProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> Option<&str> {
        self.fallback.as_deref().map(|f| f.name())
    }

    fn usable_fallback(&self, mime_type: &str, filename: &str) -> Option<&Arc<dyn OcrProvider>> {
        self.fallback
            .as_ref()
            .filter(|f| f.supports(mime_type, filename))
    }
}

#[async_trait]
impl OcrProvider for ProviderChain {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn supports(&self, mime_type: &str, filename: &str) -> bool {
        self.primary.supports(mime_type, filename)
            || self.usable_fallback(mime_type, filename).is_some()
    }

    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        filename: &str,
        language: &str,
    ) -> Result<OcrExtraction> {
        let fallback = self.usable_fallback(mime_type, filename);

        if !self.primary.supports(mime_type, filename) {
            return match fallback {
                Some(fallback) => fallback.extract(data, mime_type, filename, language).await,
                None => Err(Error::Provider(format!(
                    "no OCR provider supports {} ({})",
                    mime_type, filename
                ))),
            };
        }

        let primary_err = match self
            .primary
            .extract(data, mime_type, filename, language)
            .await
        {
            Ok(extraction) => return Ok(extraction),
            Err(e) => e,
        };

        let Some(fallback) = fallback else {
            return Err(primary_err);
        };

        warn!(
            subsystem = "ocr",
            component = "providers",
            primary = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "Primary OCR provider failed, trying fallback"
        );

        fallback
            .extract(data, mime_type, filename, language)
            .await
            .map_err(|fallback_err| {
                Error::Provider(format!(
                    "{}: {}; {}: {}",
                    self.primary.name(),
                    primary_err,
                    fallback.name(),
                    fallback_err
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockOcrProvider;

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = MockOcrProvider::new().with_name("primary");
        let fallback = MockOcrProvider::new().with_name("fallback");
        let chain = ProviderChain::new(Arc::new(primary.clone()))
            .with_fallback(Arc::new(fallback.clone()));

        let result = chain.extract(b"x", "image/png", "a.png", "eng").await.unwrap();
        assert_eq!(result.provider, "primary");
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_primary_error() {
        let primary = MockOcrProvider::new()
            .with_name("primary")
            .always_failing("boom");
        let fallback = MockOcrProvider::new().with_name("fallback");
        let chain =
            ProviderChain::new(Arc::new(primary.clone())).with_fallback(Arc::new(fallback));

        let result = chain.extract(b"x", "image/png", "a.png", "eng").await.unwrap();
        assert_eq!(result.provider, "fallback");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_when_primary_unsupported() {
        let primary = MockOcrProvider::new()
            .with_name("primary")
            .with_supported(&["image/"]);
        let fallback = MockOcrProvider::new().with_name("fallback");
        let chain =
            ProviderChain::new(Arc::new(primary.clone())).with_fallback(Arc::new(fallback));

        assert!(chain.supports("application/pdf", "scan.pdf"));
        let result = chain
            .extract(b"x", "application/pdf", "scan.pdf", "eng")
            .await
            .unwrap();
        assert_eq!(result.provider, "fallback");
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_both_failing_reports_both_errors() {
        let chain = ProviderChain::new(Arc::new(
            MockOcrProvider::new().with_name("primary").always_failing("first"),
        ))
        .with_fallback(Arc::new(
            MockOcrProvider::new().with_name("fallback").always_failing("second"),
        ));

        let err = chain
            .extract(b"x", "image/png", "a.png", "eng")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn test_unsupported_without_fallback() {
        let chain = ProviderChain::new(Arc::new(
            MockOcrProvider::new().with_supported(&["image/"]),
        ));
        assert!(!chain.supports("audio/ogg", "voice.ogg"));
        assert_eq!(chain.fallback_name(), None);
        assert_eq!(chain.primary_name(), "mock");
    }
}
