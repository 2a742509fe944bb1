use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    models::BatchStatus,
    repository::{BatchSnapshot, BatchStore, ProgressAck, ProgressDelta},
};

const SNAPSHOT_PREFIX: &str = "batch-";
const SNAPSHOT_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    position: Option<i64>,
    processed: i64,
    failed: i64,
}

/// Where the terminal snapshot of a run ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Persisted(BatchSnapshot),
    /// The record had already reached a terminal status; nothing was written.
    Superseded(BatchSnapshot),
    /// The store was unreachable; the snapshot waits on disk for `replay_spilled`.
    Spilled { snapshot: BatchSnapshot, path: PathBuf },
}

impl FinalizeOutcome {
    pub fn snapshot(&self) -> &BatchSnapshot {
        match self {
            FinalizeOutcome::Persisted(snapshot)
            | FinalizeOutcome::Superseded(snapshot)
            | FinalizeOutcome::Spilled { snapshot, .. } => snapshot,
        }
    }
}

/// Records how far each run has got and writes its final snapshot.
///
/// An in-memory copy of every live run's counters is kept next to the store,
/// so finalize does not depend on reading the store back.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn BatchStore>,
    cache: Arc<Mutex<HashMap<Uuid, Counters>>>,
    snapshot_dir: PathBuf,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn BatchStore>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self { store, cache: Arc::default(), snapshot_dir: snapshot_dir.into() }
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Seed the cache with the counters a resumed record already holds.
    pub fn track(&self, batch_key: Uuid, position: Option<i64>, processed: i64, failed: i64) -> Result<()> {
        self.cache()?.insert(batch_key, Counters { position, processed, failed });
        Ok(())
    }

    /// Stop tracking a run that ends without a terminal snapshot (paused or canceled).
    pub fn forget(&self, batch_key: Uuid) -> Result<()> {
        self.cache()?.remove(&batch_key);
        Ok(())
    }

    /// Persist the furthest completed position and add to the counters.
    /// Calls for a position the run has already passed are no-ops.
    pub async fn record_progress(
        &self,
        batch_key: Uuid,
        position: i64,
        processed: i64,
        failed: i64,
    ) -> Result<ProgressAck> {
        let delta = ProgressDelta { position, processed, failed };
        let ack = self.store.record_progress(batch_key, &delta, Utc::now()).await?;

        if ack.applied {
            let mut cache = self.cache()?;
            let counters = cache.entry(batch_key).or_default();
            counters.position = Some(position);
            counters.processed += processed;
            counters.failed += failed;
        } else {
            tracing::debug!(batch_key = %batch_key, position, "Progress already past position");
        }
        Ok(ack)
    }

    /// Write the terminal row of a run. If the store refuses the write, the
    /// snapshot is spilled to `snapshot_dir` instead of being lost.
    pub async fn finalize(
        &self,
        batch_key: Uuid,
        status: BatchStatus,
        error_detail: Option<String>,
        retry_increment: i32,
    ) -> Result<FinalizeOutcome> {
        let cached = self.cache()?.remove(&batch_key);
        let counters = match cached {
            Some(counters) => counters,
            None => {
                let record = self
                    .store
                    .find_by_key(batch_key)
                    .await?
                    .ok_or_else(|| anyhow!("batch {} not found", batch_key))?;
                Counters {
                    position: record.last_processed_position,
                    processed: record.processed_count,
                    failed: record.failed_count,
                }
            }
        };

        let snapshot = BatchSnapshot {
            batch_key,
            status,
            end_time: Utc::now(),
            last_processed_position: counters.position,
            processed_count: counters.processed,
            failed_count: counters.failed,
            error_detail,
            retry_increment,
        };

        match self.store.finalize(&snapshot).await {
            Ok(true) => Ok(FinalizeOutcome::Persisted(snapshot)),
            Ok(false) => {
                tracing::warn!(batch_key = %batch_key, status = %status, "Batch already terminal, final state not written");
                Ok(FinalizeOutcome::Superseded(snapshot))
            }
            Err(err) => {
                tracing::warn!(
                    batch_key = %batch_key,
                    error = ?err,
                    "Failed to persist final batch state, spilling snapshot to disk"
                );
                let path = self.spill(&snapshot).await?;
                Ok(FinalizeOutcome::Spilled { snapshot, path })
            }
        }
    }

    async fn spill(&self, snapshot: &BatchSnapshot) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.snapshot_dir.display()))?;
        let path = self
            .snapshot_dir
            .join(format!("{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}", snapshot.batch_key));
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        Ok(path)
    }

    /// Replay spilled snapshots into the store, deleting each one that lands
    /// or that a newer terminal state has made obsolete. Unreadable files are
    /// left in place. Returns how many were written.
    pub async fn replay_spilled(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.snapshot_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut replayed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_SUFFIX))
                .unwrap_or(false);
            if !is_snapshot {
                continue;
            }

            let body = tokio::fs::read(&path).await?;
            let snapshot: BatchSnapshot = match serde_json::from_slice(&body) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = ?err, "Skipping unreadable snapshot");
                    continue;
                }
            };
            let applied = self.store.finalize(&snapshot).await?;
            tokio::fs::remove_file(&path).await?;

            if applied {
                tracing::info!(batch_key = %snapshot.batch_key, "Replayed spilled snapshot");
                replayed += 1;
            } else {
                tracing::warn!(batch_key = %snapshot.batch_key, "Discarded snapshot of a batch that already finished");
            }
        }
        Ok(replayed)
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Counters>>> {
        self.cache.lock().map_err(|_| anyhow!("progress cache mutex poisoned"))
    }
}
