use std::sync::Arc;

use chrono::Utc;

use crate::{
    error::{BatchError, BatchResult},
    models::{BatchRecord, BatchStatus, StageType},
    repository::{resumable_statuses, BatchStore},
};

/// Operator-facing queries and state transitions on batch records.
#[derive(Clone)]
pub struct BatchControl {
    store: Arc<dyn BatchStore>,
}

impl BatchControl {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    /// The stage's in-progress record if there is one, else its latest record.
    pub async fn last_run(&self, stage_type: StageType) -> BatchResult<BatchRecord> {
        if let Some(record) = self.store.latest_non_terminal(stage_type).await? {
            return Ok(record);
        }
        self.store
            .latest(stage_type)
            .await?
            .ok_or_else(|| BatchError::NotFound(format!("for stage {}", stage_type)))
    }

    /// Ask a running batch to stop after its current chunk group.
    pub async fn pause(&self, id: i64) -> BatchResult<BatchRecord> {
        self.guarded_transition(id, &[BatchStatus::Running], BatchStatus::Paused, "RUNNING")
            .await
    }

    /// Terminate a batch that has not finished yet.
    pub async fn cancel(&self, id: i64) -> BatchResult<BatchRecord> {
        self.guarded_transition(id, &resumable_statuses(), BatchStatus::Canceled, "RUNNING or PAUSED")
            .await
    }

    async fn guarded_transition(
        &self,
        id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
        expected: &'static str,
    ) -> BatchResult<BatchRecord> {
        if let Some(record) = self.store.transition(id, from, to, Utc::now()).await? {
            tracing::info!(batch_id = id, status = %to, "Batch status changed");
            return Ok(record);
        }

        // Nothing matched: report whether the record is missing or in the wrong state.
        match self.store.find_by_id(id).await? {
            Some(record) => {
                Err(BatchError::InvalidTransition { id, status: record.status, expected })
            }
            None => Err(BatchError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryBatchStore, LockClaim, LockRequest};
    use uuid::Uuid;

    async fn running(store: &InMemoryBatchStore, stage_type: StageType) -> BatchRecord {
        let request = LockRequest {
            lock_key: stage_type.lock_key(),
            lease: chrono::Duration::seconds(60),
            claim: LockClaim::New { batch_key: Uuid::new_v4(), stage_type },
        };
        store.acquire_lock(&request, Utc::now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let store = Arc::new(InMemoryBatchStore::new());
        let control = BatchControl::new(store.clone());
        let record = running(&store, StageType::Extract).await;

        let paused = control.pause(record.id).await.unwrap();
        assert_eq!(paused.status, BatchStatus::Paused);
        assert!(paused.end_time.is_none());

        let err = control.pause(record.id).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::InvalidTransition { status: BatchStatus::Paused, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let store = Arc::new(InMemoryBatchStore::new());
        let control = BatchControl::new(store.clone());
        let record = running(&store, StageType::Transform).await;

        control.pause(record.id).await.unwrap();
        let canceled = control.cancel(record.id).await.unwrap();
        assert_eq!(canceled.status, BatchStatus::Canceled);
        assert!(canceled.end_time.is_some());

        assert!(control.cancel(record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let control = BatchControl::new(Arc::new(InMemoryBatchStore::new()));
        assert!(matches!(control.pause(42).await, Err(BatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_last_run_prefers_in_progress_record() {
        let store = Arc::new(InMemoryBatchStore::new());
        let control = BatchControl::new(store.clone());
        assert!(matches!(
            control.last_run(StageType::Extract).await,
            Err(BatchError::NotFound(_))
        ));

        let record = running(&store, StageType::Extract).await;
        let shown = control.last_run(StageType::Extract).await.unwrap();
        assert_eq!(shown.batch_key, record.batch_key);
        assert_eq!(shown.status, BatchStatus::Running);
    }
}
