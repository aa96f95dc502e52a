use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::payload::PayloadDir;
use crate::store::{RetentionStore, StorageError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub failed_deletes: usize,
    /// Unreferenced payloads removed by the orphan scan.
    pub orphans: usize,
}

/// One expiry pass: drop expired records, then delete their payloads.
///
/// A record whose payload could not be deleted goes back into the collection
/// so the next pass retries it. Payloads no record points at (an eviction
/// whose delete failed, a crash between write and append) are removed once
/// they are older than an image's whole lifetime.
pub async fn sweep(
    store: &RetentionStore,
    payloads: &PayloadDir,
    now: NaiveDateTime,
) -> Result<SweepReport, StorageError> {
    let purged = store.remove_expired(now).await?;

    let mut report = SweepReport {
        purged: purged.len(),
        ..SweepReport::default()
    };
    let mut undeleted = Vec::new();
    for record in purged {
        if !payloads.purge(&record.filename, "expired").await {
            undeleted.push(record);
        }
    }
    report.failed_deletes = undeleted.len();

    let dropped = store.restore(undeleted).await?;
    if !dropped.is_empty() {
        tracing::warn!(
            "{} undeletable records no longer fit, leaving them to the orphan scan",
            dropped.len()
        );
    }

    report.orphans = match remove_orphans(store, payloads).await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!("orphan scan of {:?} failed: {}", payloads.root(), e);
            0
        }
    };
    Ok(report)
}

async fn remove_orphans(store: &RetentionStore, payloads: &PayloadDir) -> Result<usize, StorageError> {
    let referenced: HashSet<String> = store
        .load()
        .await?
        .into_iter()
        .map(|record| record.filename)
        .collect();
    let min_age = store
        .lifetime()
        .total()
        .to_std()
        .unwrap_or(Duration::MAX);

    // the collection file and its temp/corrupt siblings may share the directory
    let store_name = match store.path().parent() {
        Some(parent) if parent == payloads.root() => store
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string),
        _ => None,
    };
    let keep = |name: &str| {
        referenced.contains(name)
            || store_name
                .as_deref()
                .is_some_and(|store_name| name.starts_with(store_name))
    };

    let mut removed = 0;
    for name in payloads.stale_files(min_age, keep).await? {
        if payloads.purge(&name, "orphaned").await {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Background expiry task. Owned by `main`, started once at boot and stopped
/// after the HTTP server has drained.
pub struct Reaper {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn start(store: Arc<RetentionStore>, payloads: PayloadDir, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(cleanup_loop(store, payloads, interval, stop_rx));
        Self { stop_tx, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("reaper task ended abnormally: {}", e);
        }
    }
}

async fn cleanup_loop(
    store: Arc<RetentionStore>,
    payloads: PayloadDir,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    tracing::info!("reaper started, sweeping every {:?}", interval);
    loop {
        if *stop_rx.borrow() {
            break;
        }

        match sweep(&store, &payloads, snapwall_common::local_now()).await {
            Ok(report) if report != SweepReport::default() => {
                tracing::debug!(
                    "sweep purged {} records, {} payload deletes failed, {} orphans removed",
                    report.purged,
                    report.failed_deletes,
                    report.orphans
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("sweep failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                // Reaper dropped without stop()
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("reaper stopped");
}
