use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    models::{BatchRecord, LockStatus},
    repository::{BatchStore, LockClaim, LockRequest},
};

/// Grants and releases the named lock that keeps a stage to one active run.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn BatchStore>,
    lease: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn BatchStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Try to take `lock_key` for `claim`. A holder older than the lease is
    /// presumed crashed and is reclaimed. `None` means another run is live
    /// and this one must defer without touching any state.
    pub async fn acquire(&self, lock_key: &str, claim: LockClaim) -> Result<Option<BatchRecord>> {
        let request = LockRequest {
            lock_key: lock_key.to_string(),
            lease: chrono::Duration::from_std(self.lease)?,
            claim,
        };
        let granted = self.store.acquire_lock(&request, Utc::now()).await?;

        match &granted {
            Some(record) => tracing::info!(
                lock_key,
                batch_key = %record.batch_key,
                "Lock acquired"
            ),
            None => tracing::info!(lock_key, "Lock held by another run, deferring"),
        }
        Ok(granted)
    }

    pub async fn release(&self, batch_key: Uuid, success: bool) -> Result<()> {
        let status = if success { LockStatus::Unlocked } else { LockStatus::Failed };
        self.store.release_lock(batch_key, status, Utc::now()).await?;
        tracing::debug!(batch_key = %batch_key, lock_status = %status, "Lock released");
        Ok(())
    }
}
