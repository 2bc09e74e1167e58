//! Blob storage for live-state snapshots, stage logs and analysis results.
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::{KeelDatabaseError, KeelDatabaseResult};

#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> KeelDatabaseResult<Vec<u8>>;
    async fn put(&self, path: &str, content: &[u8]) -> KeelDatabaseResult;
    async fn delete(&self, path: &str) -> KeelDatabaseResult;
    /// Relative paths of every object stored under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> KeelDatabaseResult<Vec<String>>;
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> KeelDatabaseResult<PathBuf> {
        let rel = Path::new(path);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "invalid file store path {:?}",
                path
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn get(&self, path: &str) -> KeelDatabaseResult<Vec<u8>> {
        let file = self.resolve(path)?;
        match fs::read(&file).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                KeelDatabaseError::NotFound(format!("file {} was not found", path)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, content: &[u8]) -> KeelDatabaseResult {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never observe a partial object.
        let tmp = file.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &file).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> KeelDatabaseResult {
        let file = self.resolve(path)?;
        match fs::remove_file(&file).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self, prefix: &str) -> KeelDatabaseResult<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
