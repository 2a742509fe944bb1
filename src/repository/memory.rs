use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    BatchSnapshot, BatchStore, LockClaim, LockRequest, ProgressAck, ProgressDelta,
    EXPIRED_LEASE_DETAIL,
};
use crate::models::{BatchLogEntry, BatchRecord, BatchStatus, LockStatus, StageType};

#[derive(Default)]
struct State {
    records: Vec<BatchRecord>,
    next_id: i64,
}

/// Process-local batch store, used for dry runs and tests.
///
/// Every operation holds one mutex for its whole read-modify-write, which
/// gives the same atomicity the Postgres store gets from its transactions.
#[derive(Default)]
pub struct InMemoryBatchStore {
    state: Mutex<State>,
    fail_finalize: AtomicBool,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `finalize` fail as if the database were unreachable.
    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a record's lock timestamp, e.g. to age a lock past its lease.
    pub fn set_lock_time(&self, batch_key: Uuid, lock_time: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let record = find_mut(&mut state, batch_key)?;
        record.lock_time = Some(lock_time);
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<BatchRecord>> {
        Ok(self.lock()?.records.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("batch store mutex poisoned"))
    }
}

fn find_mut(state: &mut State, batch_key: Uuid) -> Result<&mut BatchRecord> {
    state
        .records
        .iter_mut()
        .find(|record| record.batch_key == batch_key)
        .ok_or_else(|| anyhow!("batch {} not found", batch_key))
}

fn latest_matching(
    state: &State,
    stage_type: StageType,
    matches: impl Fn(&BatchRecord) -> bool,
) -> Option<BatchRecord> {
    state
        .records
        .iter()
        .filter(|record| record.stage_type == stage_type && matches(record))
        .max_by_key(|record| record.id)
        .cloned()
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn acquire_lock(
        &self,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>> {
        let mut state = self.lock()?;

        let holders_live = state.records.iter().any(|record| {
            record.lock_key == request.lock_key && record.holds_live_lock(now, request.lease)
        });
        if holders_live {
            return Ok(None);
        }

        let claimed = request.claim.batch_key();
        for record in state.records.iter_mut().filter(|record| {
            record.lock_key == request.lock_key
                && record.lock_status == LockStatus::Locked
                && record.batch_key != claimed
        }) {
            record.lock_status = LockStatus::Failed;
            record.lock_time = Some(now);
            if record.status == BatchStatus::Running {
                record.status = BatchStatus::Failed;
                record.end_time = Some(now);
                record.error_detail = Some(EXPIRED_LEASE_DETAIL.to_string());
            }
        }

        match request.claim {
            LockClaim::New { batch_key, stage_type } => {
                state.next_id += 1;
                let mut record = BatchRecord::started(state.next_id, batch_key, stage_type, now);
                record.lock_key = request.lock_key.clone();
                state.records.push(record.clone());
                Ok(Some(record))
            }
            LockClaim::Resume { batch_key } => {
                let record = find_mut(&mut state, batch_key)?;
                if record.status.is_terminal() {
                    return Err(anyhow!(
                        "batch {} is {} and cannot be resumed",
                        batch_key,
                        record.status
                    ));
                }
                if record.status == BatchStatus::Running {
                    record.retry_count += 1;
                }
                record.status = BatchStatus::Running;
                record.lock_key = request.lock_key.clone();
                record.lock_status = LockStatus::Locked;
                record.lock_time = Some(now);
                record.end_time = None;
                Ok(Some(record.clone()))
            }
        }
    }

    async fn release_lock(
        &self,
        batch_key: Uuid,
        lock_status: LockStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let record = find_mut(&mut state, batch_key)?;
        record.lock_status = lock_status;
        record.lock_time = Some(now);
        Ok(())
    }

    async fn record_progress(
        &self,
        batch_key: Uuid,
        delta: &ProgressDelta,
        now: DateTime<Utc>,
    ) -> Result<ProgressAck> {
        let mut state = self.lock()?;
        let record = find_mut(&mut state, batch_key)?;

        let advances = record.lock_status == LockStatus::Locked
            && record.last_processed_position.map(|current| current < delta.position).unwrap_or(true);
        if advances {
            record.processed_count += delta.processed;
            record.failed_count += delta.failed;
            record.last_processed_position = Some(delta.position);
            record.lock_time = Some(now);
        }
        Ok(ProgressAck { applied: advances, status: record.status })
    }

    async fn set_target_position(&self, batch_key: Uuid, target: i64) -> Result<()> {
        let mut state = self.lock()?;
        find_mut(&mut state, batch_key)?.target_position = Some(target);
        Ok(())
    }

    async fn finalize(&self, snapshot: &BatchSnapshot) -> Result<bool> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let mut state = self.lock()?;
        let record = find_mut(&mut state, snapshot.batch_key)?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = snapshot.status;
        record.end_time = Some(snapshot.end_time);
        record.processed_count = record.processed_count.max(snapshot.processed_count);
        record.failed_count = record.failed_count.max(snapshot.failed_count);
        record.last_processed_position =
            record.last_processed_position.max(snapshot.last_processed_position);
        record.error_detail = snapshot.error_detail.clone();
        record.retry_count += snapshot.retry_increment;
        Ok(true)
    }

    async fn transition(
        &self,
        id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRecord>> {
        let mut state = self.lock()?;
        let Some(record) =
            state.records.iter_mut().find(|record| record.id == id && from.contains(&record.status))
        else {
            return Ok(None);
        };
        record.status = to;
        record.end_time = to.is_terminal().then_some(now);
        Ok(Some(record.clone()))
    }

    async fn append_log(&self, batch_key: Uuid, entry: &BatchLogEntry) -> Result<()> {
        let mut state = self.lock()?;
        find_mut(&mut state, batch_key)?.logs.push(entry.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<BatchRecord>> {
        Ok(self.lock()?.records.iter().find(|record| record.id == id).cloned())
    }

    async fn find_by_key(&self, batch_key: Uuid) -> Result<Option<BatchRecord>> {
        Ok(self.lock()?.records.iter().find(|record| record.batch_key == batch_key).cloned())
    }

    async fn latest(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        Ok(latest_matching(&*self.lock()?, stage_type, |_| true))
    }

    async fn latest_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        Ok(latest_matching(&*self.lock()?, stage_type, |record| record.status.is_terminal()))
    }

    async fn latest_non_terminal(&self, stage_type: StageType) -> Result<Option<BatchRecord>> {
        Ok(latest_matching(&*self.lock()?, stage_type, |record| !record.status.is_terminal()))
    }

    async fn last_position(&self, stage_type: StageType) -> Result<Option<i64>> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|record| record.stage_type == stage_type)
            .filter_map(|record| record.last_processed_position)
            .max())
    }
}
