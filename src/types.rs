use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    pub parent_hash: String,
    /// Block number as a `0x`-prefixed hex string.
    pub number: String,
    pub state_root: String,
    pub extrinsics_root: String,
}

impl RpcHeader {
    pub fn height(&self) -> Result<i64> {
        parse_hex_i64(&self.number).with_context(|| format!("Invalid block number {}", self.number))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcBlock {
    pub header: RpcHeader,
    /// SCALE-encoded extrinsics, hex strings.
    pub extrinsics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub block: RpcBlock,
}

pub fn parse_hex_i64(value: &str) -> Result<i64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    Ok(i64::from_str_radix(digits, 16)?)
}

/// Decode a SCALE little-endian `u64` such as the value of `Timestamp.Now`.
pub fn decode_scale_u64(value: &str) -> Result<i64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.len() != 16 {
        return Err(anyhow!("Expected 8 encoded bytes, got '{}'", value));
    }
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
            .with_context(|| format!("Invalid hex in '{}'", value))?;
    }
    i64::try_from(u64::from_le_bytes(bytes)).context("Timestamp out of range")
}
