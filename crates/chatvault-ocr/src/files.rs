//! Local filesystem access to stored media.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use chatvault_core::{Error, FileStore, Result};

/// [`FileStore`] backed by the local filesystem.
///
/// Relative media paths are resolved against `root` when one is configured;
/// absolute paths are used as-is.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore {
    root: Option<PathBuf>,
}

impl LocalFileStore {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve(path);
        tokio::fs::read(&resolved).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", resolved.display(), e),
            ))
        })
    }
}
