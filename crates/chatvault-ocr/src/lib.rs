//! # chatvault-ocr
//!
//! OCR job queue engine for chatvault.
//!
//! This crate provides:
//! - Job lifecycle: create, cancel, retry-failed, progress queries
//! - A periodic poller claiming documents with bounded per-tick concurrency
//! - Linear retry backoff and stale-claim recovery
//! - Multi-image bundling of WhatsApp messages into one composite
//! - Pluggable providers (tesseract, Azure AI Vision, mock) with fallback
//! - Progress events through the core event bus
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use chatvault_ocr::{OcrConfig, OcrQueue, CreateOcrJobRequest, OcrJobMode, EventBus};
//! use chatvault_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//! let events = EventBus::default();
//!
//! let queue = OcrQueue::builder(OcrConfig::from_env())
//!     .with_database(&db)
//!     .with_progress_sink(Arc::new(events.clone()))
//!     .build()?;
//!
//! let handle = queue.start();
//! let created = queue
//!     .create_job(CreateOcrJobRequest {
//!         requested_by: "admin".into(),
//!         mode: OcrJobMode::Missing,
//!         group_id: None,
//!     })
//!     .await?;
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod bundle;
pub mod config;
pub mod files;
pub mod poller;
mod processor;
pub mod providers;
pub mod queue;

// Re-export core types
pub use chatvault_core::*;

pub use bundle::{stack_vertically, BundleBuilder, OcrInput};
pub use config::OcrConfig;
pub use files::LocalFileStore;
pub use poller::{QueueHandle, TickOutcome};
pub use providers::{
    AzureReadProvider, MockCall, MockOcrProvider, ProviderChain, ProviderFactory,
    ProviderRegistry, TesseractProvider,
};
pub use queue::{OcrQueue, OcrQueueBuilder};
