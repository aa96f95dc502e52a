use chrono::NaiveDateTime;
use snapwall_common::{ImageRecord, Lifetime};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("collection file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode collection: {0}")]
    Encode(serde_json::Error),
    #[error("refusing unsafe payload name {0:?}")]
    UnsafeName(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The persisted image collection, oldest first.
///
/// Every read-modify-write cycle runs under `gate`, so concurrent uploads and
/// the reaper never overwrite each other's changes. Plain `load` skips the
/// gate: saves go through a rename, so readers always see a whole document.
pub struct RetentionStore {
    path: PathBuf,
    max_images: usize,
    lifetime: Lifetime,
    gate: Mutex<()>,
}

impl RetentionStore {
    pub fn new(path: PathBuf, max_images: usize, lifetime: Lifetime) -> Self {
        Self {
            path,
            max_images,
            lifetime,
            gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub async fn load(&self) -> Result<Vec<ImageRecord>, StorageError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        serde_json::from_slice(&data).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, records: &[ImageRecord]) -> Result<(), StorageError> {
        let _guard = self.gate.lock().await;
        self.write(records).await
    }

    /// Appends `record` at the tail and returns whatever fell off the head to
    /// get back under capacity. Normally that is at most one record; more if
    /// `max_images` was lowered since the file was written.
    pub async fn append(&self, record: ImageRecord) -> Result<Vec<ImageRecord>, StorageError> {
        let _guard = self.gate.lock().await;
        let mut records = self.load().await?;
        records.push(record);

        let overflow = records.len().saturating_sub(self.max_images);
        let evicted: Vec<ImageRecord> = records.drain(..overflow).collect();

        self.write(&records).await?;
        Ok(evicted)
    }

    /// Drops every record older than the lifetime as of `now` and returns the
    /// dropped records so their payloads can be deleted.
    pub async fn remove_expired(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<ImageRecord>, StorageError> {
        let _guard = self.gate.lock().await;
        let records = self.load().await?;

        let (purged, kept): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| self.lifetime.is_past(now, record.timestamp));

        if !purged.is_empty() {
            self.write(&kept).await?;
        }
        Ok(purged)
    }

    /// Puts back records whose payload could not be deleted, ahead of the
    /// current ones, so the next sweep retries them. Returns whatever no
    /// longer fits under capacity.
    pub async fn restore(
        &self,
        mut records: Vec<ImageRecord>,
    ) -> Result<Vec<ImageRecord>, StorageError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.gate.lock().await;
        records.extend(self.load().await?);

        let overflow = records.len().saturating_sub(self.max_images);
        let dropped: Vec<ImageRecord> = records.drain(..overflow).collect();

        self.write(&records).await?;
        Ok(dropped)
    }

    /// Startup check. A collection file that no longer parses is moved aside
    /// to `<file>.corrupt` and the wall starts empty. Returns the number of
    /// records currently stored.
    pub async fn recover(&self) -> Result<usize, StorageError> {
        let _guard = self.gate.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        match self.load().await {
            Ok(records) => Ok(records.len()),
            Err(StorageError::Corrupt { path, source }) => {
                let aside = sibling(&path, "corrupt");
                tokio::fs::rename(&path, &aside)
                    .await
                    .map_err(|e| StorageError::io(&path, e))?;
                tracing::warn!(
                    "collection file {:?} was corrupt ({}), moved to {:?} and starting empty",
                    path,
                    source,
                    aside
                );
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, records: &[ImageRecord]) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(records).map_err(StorageError::Encode)?;
        let tmp = sibling(&self.path, "tmp");

        let result = self.replace_with(&tmp, &json).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&tmp).await
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!("failed to remove temp file {:?}: {}", tmp, e);
            }
        }
        result
    }

    async fn replace_with(&self, tmp: &Path, json: &[u8]) -> Result<(), StorageError> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| StorageError::io(tmp, e))?;
        file.write_all(json)
            .await
            .map_err(|e| StorageError::io(tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(tmp, e))?;
        drop(file);

        tokio::fs::rename(tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn record(n: usize, at: NaiveDateTime) -> ImageRecord {
        ImageRecord::new(format!("img{n}.png"), format!("#{n}"), at)
    }

    fn store(dir: &TempDir, max_images: usize) -> RetentionStore {
        RetentionStore::new(
            dir.path().join("data.json"),
            max_images,
            Lifetime::from_secs(5, 10),
        )
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir, 10).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        std::fs::write(store.path(), "[{").unwrap();
        assert!(matches!(
            store.load().await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn recover_moves_corrupt_file_aside() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        std::fs::write(store.path(), "garbage").unwrap();

        assert_eq!(store.recover().await.unwrap(), 0);
        assert!(store.load().await.unwrap().is_empty());
        let aside = dir.path().join("data.json.corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "garbage");
    }

    #[tokio::test]
    async fn recover_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = RetentionStore::new(
            dir.path().join("state").join("data.json"),
            10,
            Lifetime::from_secs(5, 10),
        );
        assert_eq!(store.recover().await.unwrap(), 0);
        store.append(record(0, t0())).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_never_exceeds_capacity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        for n in 0..10 {
            store.append(record(n, t0())).await.unwrap();
            assert!(store.load().await.unwrap().len() <= 3);
        }
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        for n in 0..3 {
            assert!(store.append(record(n, t0())).await.unwrap().is_empty());
        }

        let evicted = store.append(record(3, t0())).await.unwrap();
        assert_eq!(evicted, vec![record(0, t0())]);

        let names: Vec<_> = store
            .load()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, ["img1.png", "img2.png", "img3.png"]);
    }

    #[tokio::test]
    async fn lowered_capacity_drains_the_backlog() {
        let dir = TempDir::new().unwrap();
        store(&dir, 10)
            .save(&(0..5).map(|n| record(n, t0())).collect::<Vec<_>>())
            .await
            .unwrap();

        let evicted = store(&dir, 2).append(record(5, t0())).await.unwrap();
        assert_eq!(evicted.len(), 4);
        assert_eq!(evicted[0].filename, "img0.png");
        assert_eq!(store(&dir, 2).load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_expired_partitions_by_age() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        let now = t0() + TimeDelta::seconds(100);
        store
            .save(&[
                record(0, now - TimeDelta::seconds(30)),
                record(1, now - TimeDelta::seconds(15)),
                record(2, now - TimeDelta::seconds(1)),
            ])
            .await
            .unwrap();

        let purged = store.remove_expired(now).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].filename, "img0.png");

        let kept = store.load().await.unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].filename, "img1.png");
    }

    #[tokio::test]
    async fn remove_expired_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        let now = t0() + TimeDelta::seconds(100);
        store
            .save(&[record(0, t0()), record(1, now)])
            .await
            .unwrap();

        assert_eq!(store.remove_expired(now).await.unwrap().len(), 1);
        assert!(store.remove_expired(now).await.unwrap().is_empty());
        assert_eq!(store.load().await.unwrap(), vec![record(1, now)]);
    }

    #[tokio::test]
    async fn save_of_load_keeps_content() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        store
            .save(&[record(0, t0()), record(1, t0() + TimeDelta::microseconds(1))])
            .await
            .unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let records = store.load().await.unwrap();
        store.save(&records).await.unwrap();

        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert!(!dir.path().join("data.json.tmp").exists());
    }

    #[tokio::test]
    async fn concurrent_appends_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 100));

        let tasks: Vec<_> = (0..24)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.append(record(n, t0())).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.load().await.unwrap().len(), 24);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_survive_concurrent_expiry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 1000));
        let now = t0() + TimeDelta::hours(1);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for n in 0..40 {
                    store.append(record(n, now)).await.unwrap();
                    // something for the reaper to purge on every pass
                    store
                        .append(record(1000 + n, now - TimeDelta::minutes(5)))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        while !writer.is_finished() {
            store.remove_expired(now).await.unwrap();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        store.remove_expired(now).await.unwrap();

        let mut fresh: Vec<_> = store
            .load()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        fresh.sort();
        let mut expected: Vec<_> = (0..40).map(|n| format!("img{n}.png")).collect();
        expected.sort();
        assert_eq!(fresh, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_never_sees_a_partial_document() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 1000));

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for round in 0..150 {
                    let records: Vec<_> = (0..(round % 40) + 1).map(|n| record(n, t0())).collect();
                    store.save(&records).await.unwrap();
                }
            })
        };

        loop {
            if let Err(e) = store.load().await {
                panic!("load raced a save: {e}");
            }
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), (149 % 40) + 1);
        assert!(!dir.path().join("data.json.tmp").exists());
    }

    #[tokio::test]
    async fn restore_puts_records_back_at_the_head() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3);
        store.save(&[record(1, t0()), record(2, t0())]).await.unwrap();

        let dropped = store
            .restore(vec![record(0, t0() - TimeDelta::minutes(1))])
            .await
            .unwrap();
        assert!(dropped.is_empty());
        let names: Vec<_> = store
            .load()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, ["img0.png", "img1.png", "img2.png"]);

        let dropped = store.restore(vec![record(9, t0())]).await.unwrap();
        assert_eq!(dropped, vec![record(9, t0())]);
        assert_eq!(store.load().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_save_removes_its_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10);
        // a non-empty directory where the collection file should be makes the rename fail
        std::fs::create_dir(store.path()).unwrap();
        std::fs::write(store.path().join("keep"), b"x").unwrap();

        assert!(matches!(
            store.save(&[record(0, t0())]).await,
            Err(StorageError::Io { .. })
        ));
        assert!(!dir.path().join("data.json.tmp").exists());
    }
}
