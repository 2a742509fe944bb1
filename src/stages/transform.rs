use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;

use crate::{
    batch::UnitRange,
    db::DbPool,
    models::{date_key, FactBlockModel, StageType, StagedBlockModel},
    repository::warehouse::{
        get_max_staged_height, get_min_staged_height, get_previous_timestamp, get_staged_block, get_staged_heights,
        get_staged_timestamp, insert_fact_blocks,
    },
    traits::Stage,
};

/// Turns staged blocks into `fact_blocks` rows and their `dim_dates` entries.
pub struct TransformStage {
    chain_name: String,
    db: Arc<DbPool>,
}

impl TransformStage {
    pub fn new(chain_name: impl Into<String>, db: Arc<DbPool>) -> Self {
        Self { chain_name: chain_name.into(), db }
    }
}

/// Fact row for `staged`; `previous_timestamp_ms` is the staged block just below it.
pub fn fact_block(staged: &StagedBlockModel, previous_timestamp_ms: Option<i64>) -> Result<FactBlockModel> {
    let block_time = DateTime::from_timestamp_millis(staged.timestamp_ms)
        .ok_or_else(|| anyhow!("Invalid timestamp {} at height {}", staged.timestamp_ms, staged.height))?;

    Ok(FactBlockModel {
        chain: staged.chain.clone(),
        height: staged.height,
        block_hash: staged.block_hash.clone(),
        date_key: date_key(block_time.date_naive()),
        block_time,
        extrinsics_count: staged.extrinsics_count,
        block_interval_ms: previous_timestamp_ms.map(|previous| staged.timestamp_ms - previous),
    })
}

#[async_trait]
impl Stage for TransformStage {
    type Unit = i64;
    type Output = FactBlockModel;

    fn stage_type(&self) -> StageType {
        StageType::Transform
    }

    /// Highest staged height, or -1 while nothing is staged.
    async fn latest_position(&self) -> Result<i64> {
        Ok(get_max_staged_height(&self.db, &self.chain_name).await?.unwrap_or(-1))
    }

    async fn earliest_position(&self) -> Result<i64> {
        Ok(get_min_staged_height(&self.db, &self.chain_name).await?.unwrap_or(0))
    }

    async fn fetch_units(&self, range: UnitRange) -> Result<Vec<i64>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        get_staged_heights(&self.db, &self.chain_name, range.start, range.end).await
    }

    async fn process_unit(&self, height: i64) -> Result<FactBlockModel> {
        let staged = get_staged_block(&self.db, &self.chain_name, height)
            .await?
            .ok_or_else(|| anyhow!("Block {} is not staged", height))?;
        let previous = get_previous_timestamp(&self.db, &self.chain_name, height).await?;
        fact_block(&staged, previous)
    }

    async fn save_batch(&self, outputs: &[FactBlockModel]) -> Result<()> {
        insert_fact_blocks(self.db.clone(), outputs).await.context("Failed to insert fact blocks")
    }

    async fn timestamp_at(&self, position: i64) -> Result<i64> {
        get_staged_timestamp(&self.db, &self.chain_name, position)
            .await?
            .ok_or_else(|| anyhow!("Block {} is not staged", position))
    }
}
