pub mod block;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    network::Network,
    types::{RpcRequest, RpcResponse},
};

/// Default timeout applied to every node request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC client for a Substrate node.
#[derive(Debug)]
pub struct Client {
    inner: reqwest::Client, // The inner HTTP client used for requests.
    rpc_url: Url,
    network: Network,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(network: Network) -> Result<Self> {
        Self::with_timeout(network, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(network: Network, timeout: Duration) -> Result<Self> {
        let rpc_url = Url::parse(&network.rpc_url())
            .with_context(|| format!("Invalid RPC url for {}", network))?;
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { inner, rpc_url, network, next_id: AtomicU64::new(1) })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Call `method` and decode its `result`. A JSON-RPC error or a null
    /// result is returned as an error.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        tracing::trace!(method, id = request.id, "RPC request");

        let response = self
            .inner
            .post(self.rpc_url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned HTTP status {}", method, status));
        }

        let body: RpcResponse<T> =
            response.json().await.with_context(|| format!("Invalid {} response", method))?;
        if let Some(error) = body.error {
            return Err(anyhow!("{} failed with code {}: {}", method, error.code, error.message));
        }
        body.result.ok_or_else(|| anyhow!("{} returned no result", method))
    }
}
