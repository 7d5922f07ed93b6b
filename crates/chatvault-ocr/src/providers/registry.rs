//! Provider registry: maps configuration identifiers to provider factories.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use chatvault_core::{Error, OcrProvider, Result};

use super::{AzureReadProvider, MockOcrProvider, ProviderChain, TesseractProvider};
use crate::config::OcrConfig;

/// Builds a provider from the queue configuration.
pub type ProviderFactory = Arc<dyn Fn(&OcrConfig) -> Result<Arc<dyn OcrProvider>> + Send + Sync>;

/// Registry of provider factories keyed by identifier.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `tesseract` and `azure` providers, plus
    /// `mock` when built with the `mock-provider` feature.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("tesseract", |config| {
            Ok(Arc::new(TesseractProvider::new(
                config.tesseract_cmd.clone(),
                config.tesseract_timeout,
            )) as Arc<dyn OcrProvider>)
        });
        registry.register("azure", |config| {
            Ok(Arc::new(AzureReadProvider::new(
                config.azure_endpoint.clone(),
                config.azure_key.clone(),
            )) as Arc<dyn OcrProvider>)
        });
        #[cfg(feature = "mock-provider")]
        registry.register_mock();
        registry
    }

    /// Register the deterministic `mock` provider, for tests and dry runs.
    pub fn register_mock(&mut self) {
        self.register("mock", |_| {
            Ok(Arc::new(MockOcrProvider::new()) as Arc<dyn OcrProvider>)
        });
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&OcrConfig) -> Result<Arc<dyn OcrProvider>> + Send + Sync + 'static,
    {
        self.factories
            .insert(id.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn has_provider(&self, id: &str) -> bool {
        self.factories.contains_key(&id.to_ascii_lowercase())
    }

    /// Registered identifiers, sorted.
    pub fn available_providers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Instantiate the provider registered under `id`.
    pub fn create(&self, id: &str, config: &OcrConfig) -> Result<Arc<dyn OcrProvider>> {
        let factory = self.factories.get(&id.to_ascii_lowercase()).ok_or_else(|| {
            Error::Config(format!(
                "unknown OCR provider '{}' (available: {})",
                id,
                self.available_providers().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Build the primary/fallback chain named by the configuration.
    pub fn build_chain(&self, config: &OcrConfig) -> Result<ProviderChain> {
        let mut chain = ProviderChain::new(self.create(&config.provider, config)?);
        if let Some(fallback) = config
            .fallback_provider
            .as_deref()
            .filter(|f| !f.eq_ignore_ascii_case(&config.provider))
        {
            chain = chain.with_fallback(self.create(fallback, config)?);
        }

        info!(
            subsystem = "ocr",
            component = "providers",
            primary = chain.primary_name(),
            fallback = chain.fallback_name().unwrap_or("(none)"),
            "OCR provider chain configured"
        );
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "mock-provider"))]
    fn test_defaults_exclude_mock() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.available_providers(), vec!["azure", "tesseract"]);
        assert!(registry.has_provider("Tesseract"));
        assert!(!registry.has_provider("mock"));

        let err = registry
            .build_chain(&OcrConfig::default().with_provider("mock"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_register_mock_on_request() {
        let mut registry = ProviderRegistry::with_defaults();
        registry.register_mock();
        assert_eq!(
            registry.available_providers(),
            vec!["azure", "mock", "tesseract"]
        );
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let registry = ProviderRegistry::with_defaults();
        let err = registry
            .create("google", &OcrConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("google"));
    }

    #[test]
    fn test_build_chain_with_fallback() {
        let registry = ProviderRegistry::with_defaults();
        let config = OcrConfig::default()
            .with_provider("azure")
            .with_fallback_provider("tesseract");
        let chain = registry.build_chain(&config).unwrap();
        assert_eq!(chain.primary_name(), "azure");
        assert_eq!(chain.fallback_name(), Some("tesseract"));
    }

    #[test]
    fn test_fallback_equal_to_primary_is_ignored() {
        let mut registry = ProviderRegistry::with_defaults();
        registry.register_mock();
        let config = OcrConfig::default()
            .with_provider("mock")
            .with_fallback_provider("MOCK");
        let chain = registry.build_chain(&config).unwrap();
        assert_eq!(chain.fallback_name(), None);
    }

    #[test]
    fn test_register_custom_factory() {
        let mut registry = ProviderRegistry::new();
        registry.register("scanner", |_| {
            Ok(Arc::new(MockOcrProvider::new().with_name("scanner")) as Arc<dyn OcrProvider>)
        });
        let provider = registry.create("SCANNER", &OcrConfig::default()).unwrap();
        assert_eq!(provider.name(), "scanner");
    }
}
