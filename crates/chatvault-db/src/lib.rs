//! # chatvault-db
//!
//! PostgreSQL storage for the chatvault OCR queue.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for OCR jobs and documents
//! - Read-only repositories over ingested media and chat groups
//! - An in-memory store with the same semantics, for tests and dry runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use chatvault_db::{Database, OcrJobRepository};
//!
//! let db = Database::connect("postgres://localhost/chatvault").await?;
//! let jobs = db.ocr_jobs.list(50, 0).await?;
//! ```

pub mod media;
pub mod memory;
pub mod ocr_documents;
pub mod ocr_jobs;
pub mod pool;

// Always compiled so integration tests (in tests/) can use the fixtures.
pub mod test_fixtures;

// Re-export core types
pub use chatvault_core::*;

pub use media::{PgGroupDirectory, PgMediaRepository};
pub use memory::{MemoryDocuments, MemoryGroups, MemoryJobs, MemoryMedia, MemoryStore};
pub use ocr_documents::PgOcrDocumentRepository;
pub use ocr_jobs::PgOcrJobRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub ocr_jobs: PgOcrJobRepository,
    pub ocr_documents: PgOcrDocumentRepository,
    pub media: PgMediaRepository,
    pub groups: PgGroupDirectory,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            ocr_jobs: PgOcrJobRepository::new(pool.clone()),
            ocr_documents: PgOcrDocumentRepository::new(pool.clone()),
            media: PgMediaRepository::new(pool.clone()),
            groups: PgGroupDirectory::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
