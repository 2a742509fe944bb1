use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::{
    traits::ChainSource,
    types::{decode_scale_u64, RpcHeader, SignedBlock},
};

use super::Client;

/// Storage key of `Timestamp.Now` (twox128("Timestamp") ++ twox128("Now")).
pub const TIMESTAMP_NOW_KEY: &str =
    "0xf0c365c3cf59d671eb72da0e7a4113c49f1f0515f462cdcf84e0f1d6045dfcbb";

#[async_trait]
impl ChainSource for Client {
    // chain_getHeader()
    async fn get_header(&self) -> Result<RpcHeader> {
        self.call("chain_getHeader", json!([])).await
    }

    // chain_getBlockHash(height)
    async fn get_block_hash(&self, height: i64) -> Result<String> {
        self.call("chain_getBlockHash", json!([height]))
            .await
            .with_context(|| format!("No block hash for height {}", height))
    }

    // chain_getBlock(hash)
    async fn get_block(&self, block_hash: &str) -> Result<SignedBlock> {
        self.call("chain_getBlock", json!([block_hash])).await
    }

    // state_getStorage(Timestamp.Now, hash)
    async fn get_block_timestamp(&self, block_hash: &str) -> Result<i64> {
        let encoded: String =
            self.call("state_getStorage", json!([TIMESTAMP_NOW_KEY, block_hash])).await?;
        decode_scale_u64(&encoded)
    }
}
