use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BatchLogEntry, BatchRecord, BatchStatus, LockStatus, StageType};

pub mod batch_record;
pub mod memory;
pub mod warehouse;

pub use batch_record::PgBatchStore;
pub use memory::InMemoryBatchStore;

/// Which record a lock acquisition is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockClaim {
    /// Create a new RUNNING record that holds the lock.
    New { batch_key: Uuid, stage_type: StageType },
    /// Re-enter an existing non-terminal record (paused, or crashed while running).
    Resume { batch_key: Uuid },
}

impl LockClaim {
    pub fn batch_key(&self) -> Uuid {
        match self {
            LockClaim::New { batch_key, .. } | LockClaim::Resume { batch_key } => *batch_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub lock_key: String,
    /// Age after which an unreleased lock is presumed abandoned.
    pub lease: chrono::Duration,
    pub claim: LockClaim,
}

/// Work completed since the previous progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressDelta {
    pub position: i64,
    pub processed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressAck {
    /// False when the position did not move forward and nothing was written.
    pub applied: bool,
    /// Status currently persisted, so the owner notices external pause/cancel.
    pub status: BatchStatus,
}

/// Terminal state of a run, as written by finalize or spilled to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_key: Uuid,
    pub status: BatchStatus,
    pub end_time: DateTime<Utc>,
    pub last_processed_position: Option<i64>,
    pub processed_count: i64,
    pub failed_count: i64,
    pub error_detail: Option<String>,
    pub retry_increment: i32,
}

/// Durable store of batch records.
///
/// Lock and progress fields are only mutated through `acquire_lock`,
/// `release_lock`, `record_progress` and `finalize`; every implementation
/// must make each of those a single atomic read-modify-write.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Grant the lock named in `request` unless a holder exists whose
    /// `lock_time + lease` is still in the future. Expired holders are
    /// reclaimed. Returns the record now holding the lock, or `None` when the
    /// caller must defer.
    async fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>>;

    async fn release_lock(
        &self,
        batch_key: Uuid,
        lock_status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Advance the record's position and counters. Positions only move
    /// forward: a delta at or behind the stored position is a no-op.
    async fn record_progress(
        &self,
        batch_key: Uuid,
        delta: &ProgressDelta,
        now: DateTime<Utc>,
    ) -> Result<ProgressAck>;

    async fn set_target_position(&self, batch_key: Uuid, target: i64) -> Result<()>;

    /// Write the terminal snapshot of a run, unless the record is already
    /// terminal. Position and counters never move backwards. Returns false
    /// when the record was already terminal and nothing was written.
    async fn finalize(&self, snapshot: &BatchSnapshot) -> Result<bool>;

    /// Move record `id` to `to` if its status is one of `from`. Terminal
    /// targets also stamp `end_time`. Returns `None` when no record matched.
    async fn transition(
        &self,
        id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>>;

    async fn append_log(&self, batch_key: Uuid, entry: &BatchLogEntry) -> Result<()>;

    async fn find_by_id(&self, id: i64) -> Result<Option<BatchRecord>>;

    async fn find_by_key(&self, batch_key: Uuid) -> Result<Option<BatchRecord>>;

    async fn latest(&self, stage_type: StageType) -> Result<Option<BatchRecord>>;

    async fn latest_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>>;

    /// Most recent RUNNING or PAUSED record of the stage.
    async fn latest_non_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>>;

    /// Furthest position any run of the stage has persisted.
    async fn last_position(&self, stage_type: StageType) -> Result<Option<i64>>;
}

pub(crate) const EXPIRED_LEASE_DETAIL: &str = "lock lease expired";

pub(crate) fn terminal_statuses() -> [BatchStatus; 4] {
    [BatchStatus::Success, BatchStatus::Failed, BatchStatus::Completed, BatchStatus::Canceled]
}

pub(crate) fn resumable_statuses() -> [BatchStatus; 2] {
    [BatchStatus::Running, BatchStatus::Paused]
}
