use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    batch::{Keyed, UnitRange},
    models::StageType,
    types::{RpcHeader, SignedBlock},
};

/// The capabilities a pipeline stage plugs into the batch runner.
///
/// The runner owns locking, progress, chunking and retries; a stage only
/// knows how to list, process and store its own work.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Unit: Keyed + Clone + Send + Sync + 'static;
    type Output: Keyed + Send + Sync + 'static;

    fn stage_type(&self) -> StageType;

    fn lock_key(&self) -> String {
        self.stage_type().lock_key()
    }

    /// Newest position currently available to this stage.
    async fn latest_position(&self) -> Result<i64>;

    /// Oldest position the stage can process.
    async fn earliest_position(&self) -> Result<i64> {
        Ok(0)
    }

    /// Work units for every available position in `range`, in ascending order.
    async fn fetch_units(&self, range: UnitRange) -> Result<Vec<Self::Unit>>;

    async fn process_unit(&self, unit: Self::Unit) -> Result<Self::Output>;

    /// Persist one sorted group of outputs in a single transaction.
    async fn save_batch(&self, outputs: &[Self::Output]) -> Result<()>;

    /// Unix milliseconds of `position`. Needed for lookback ranges.
    async fn timestamp_at(&self, position: i64) -> Result<i64> {
        Err(anyhow!(
            "stage {} cannot map position {} to a timestamp",
            self.stage_type(),
            position
        ))
    }
}

/// Read access to a chain node.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Header of the current best block.
    async fn get_header(&self) -> Result<RpcHeader>;

    async fn get_block_hash(&self, height: i64) -> Result<String>;

    async fn get_block(&self, block_hash: &str) -> Result<SignedBlock>;

    /// Unix milliseconds stored in the timestamp pallet at `block_hash`.
    async fn get_block_timestamp(&self, block_hash: &str) -> Result<i64>;
}
