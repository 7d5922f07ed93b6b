//! Text-extraction providers.
//!
//! Each provider implements [`chatvault_core::OcrProvider`]. The
//! [`ProviderRegistry`] maps configuration identifiers to factories and
//! assembles the primary/fallback [`ProviderChain`] the queue uses.

pub mod azure;
pub mod chain;
pub mod mock;
pub mod registry;
pub mod tesseract;

pub use azure::AzureReadProvider;
pub use chain::ProviderChain;
pub use mock::{MockCall, MockOcrProvider};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use tesseract::TesseractProvider;

use std::path::Path;

/// Lowercased file extension of `filename`, if any.
pub(crate) fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Mime type without parameters, lowercased.
pub(crate) fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
