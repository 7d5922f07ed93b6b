//! # chatvault-core
//!
//! Domain types, traits, and shared infrastructure for the chatvault OCR queue.
//!
//! The storage crate (`chatvault-db`) and the engine crate (`chatvault-ocr`)
//! both depend on the types and seams defined here.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventActor, EventBus, EventEnvelope, ServerEvent};
pub use models::*;
pub use retry::{RetryDecision, RetryPolicy};
pub use traits::*;
pub use uuid_utils::new_v7;
