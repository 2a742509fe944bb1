use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::{
    batch::UnitRange,
    db::DbPool,
    models::{StageType, StagedBlockModel},
    repository::warehouse::insert_staged_blocks,
    traits::{ChainSource, Stage},
    types::SignedBlock,
};

/// Pulls blocks from a chain node into `staging_blocks`, one unit per height.
pub struct ExtractStage {
    chain: Arc<dyn ChainSource>,
    chain_name: String,
    db: Arc<DbPool>,
}

impl ExtractStage {
    pub fn new(chain: Arc<dyn ChainSource>, chain_name: impl Into<String>, db: Arc<DbPool>) -> Self {
        Self { chain, chain_name: chain_name.into(), db }
    }
}

pub fn staged_block(
    chain: &str,
    height: i64,
    block_hash: String,
    block: &SignedBlock,
    timestamp_ms: i64,
) -> Result<StagedBlockModel> {
    Ok(StagedBlockModel {
        chain: chain.to_string(),
        height,
        block_hash,
        parent_hash: block.block.header.parent_hash.clone(),
        timestamp_ms,
        extrinsics_count: i32::try_from(block.block.extrinsics.len())?,
        payload: serde_json::to_value(block)?,
    })
}

#[async_trait]
impl Stage for ExtractStage {
    type Unit = i64;
    type Output = StagedBlockModel;

    fn stage_type(&self) -> StageType {
        StageType::Extract
    }

    async fn latest_position(&self) -> Result<i64> {
        let header = self.chain.get_header().await.context("Failed to fetch best header")?;
        header.height()
    }

    async fn fetch_units(&self, range: UnitRange) -> Result<Vec<i64>> {
        Ok(range.positions().collect())
    }

    async fn process_unit(&self, height: i64) -> Result<StagedBlockModel> {
        let hash = self.chain.get_block_hash(height).await?;
        let block = self
            .chain
            .get_block(&hash)
            .await
            .with_context(|| format!("Failed to fetch block {}", height))?;
        let timestamp = self
            .chain
            .get_block_timestamp(&hash)
            .await
            .with_context(|| format!("Failed to fetch timestamp of block {}", height))?;

        let fetched_height = block.block.header.height()?;
        if fetched_height != height {
            return Err(anyhow::anyhow!(
                "Node returned block {} when asked for {}",
                fetched_height,
                height
            ));
        }
        staged_block(&self.chain_name, height, hash, &block, timestamp)
    }

    async fn save_batch(&self, outputs: &[StagedBlockModel]) -> Result<()> {
        insert_staged_blocks(self.db.clone(), outputs)
            .await
            .context("Failed to insert staged blocks")
    }

    async fn timestamp_at(&self, position: i64) -> Result<i64> {
        let hash = self.chain.get_block_hash(position).await?;
        self.chain.get_block_timestamp(&hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RpcBlock, RpcHeader};

    fn block(height: i64, extrinsics: usize) -> SignedBlock {
        SignedBlock {
            block: RpcBlock {
                header: RpcHeader {
                    parent_hash: format!("0xparent{height}"),
                    number: format!("0x{height:x}"),
                    state_root: "0x00".into(),
                    extrinsics_root: "0x00".into(),
                },
                extrinsics: vec!["0x04".to_string(); extrinsics],
            },
        }
    }

    #[test]
    fn test_staged_block_from_rpc_block() {
        let staged =
            staged_block("polkadot", 300, "0xhash".into(), &block(300, 3), 1_700_000_000_000)
                .unwrap();

        assert_eq!(staged.height, 300);
        assert_eq!(staged.parent_hash, "0xparent300");
        assert_eq!(staged.extrinsics_count, 3);
        assert_eq!(staged.payload["block"]["header"]["number"], "0x12c");
    }
}
