use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::store::StorageError;

/// Directory holding the uploaded image bytes, one file per record.
#[derive(Debug, Clone)]
pub struct PayloadDir {
    root: PathBuf,
}

impl PayloadDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    /// Maps a record filename to its path. Names that are not a single plain
    /// path component never leave the upload directory.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(filename)),
            _ => Err(StorageError::UnsafeName(filename.to_string())),
        }
    }

    pub async fn write(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.resolve(filename)?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(path)
    }

    /// Deletes a payload. Returns `false` when it was already gone.
    pub async fn remove(&self, filename: &str) -> Result<bool, StorageError> {
        let path = self.resolve(filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// Names of plain files not modified for at least `min_age`, skipping
    /// every name `keep` accepts.
    pub async fn stale_files(
        &self,
        min_age: Duration,
        keep: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))?;

        let mut stale = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.root, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if keep(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let old_enough = meta
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= min_age);
            if meta.is_file() && old_enough {
                stale.push(name);
            }
        }
        Ok(stale)
    }

    /// Best-effort delete used by request and sweep paths; failures are logged.
    pub async fn purge(&self, filename: &str, reason: &str) -> bool {
        match self.remove(filename).await {
            Ok(true) => {
                tracing::info!("removed {} image: {}", reason, filename);
                true
            }
            Ok(false) => {
                tracing::debug!("{} image {} already gone", reason, filename);
                true
            }
            Err(e) => {
                tracing::warn!("failed to remove {} image {}: {}", reason, filename, e);
                false
            }
        }
    }
}
