use std::{env, fmt, str::FromStr};

use anyhow::anyhow;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Network {
    Local,
    Westend,
    Kusama,
    Polkadot,
    /// An explicit RPC endpoint, labelled with the chain name stored in the warehouse.
    Custom { url: String, chain: String },
}

impl Network {
    /// Returns the JSON-RPC endpoint of the network. Well-known chains can be
    /// pointed elsewhere through `<CHAIN>_RPC_URL`.
    pub fn rpc_url(&self) -> String {
        match self {
            Network::Local => {
                env::var("LOCAL_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:9944".to_owned())
            }
            Network::Westend => env::var("WESTEND_RPC_URL")
                .unwrap_or_else(|_| "https://westend-rpc.polkadot.io".to_owned()),
            Network::Kusama => env::var("KUSAMA_RPC_URL")
                .unwrap_or_else(|_| "https://kusama-rpc.polkadot.io".to_owned()),
            Network::Polkadot => env::var("POLKADOT_RPC_URL")
                .unwrap_or_else(|_| "https://rpc.polkadot.io".to_owned()),
            Network::Custom { url, .. } => url.clone(),
        }
    }

    pub fn chain(&self) -> &str {
        match self {
            Network::Local => "local",
            Network::Westend => "westend",
            Network::Kusama => "kusama",
            Network::Polkadot => "polkadot",
            Network::Custom { chain, .. } => chain,
        }
    }

    /// Use `url` instead of the default endpoint, keeping the chain label.
    pub fn with_url(self, url: impl Into<String>) -> Self {
        let chain = self.chain().to_string();
        Network::Custom { url: url.into(), chain }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Polkadot
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.chain())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Network::Local),
            "westend" => Ok(Network::Westend),
            "kusama" => Ok(Network::Kusama),
            "polkadot" => Ok(Network::Polkadot),
            other => Err(anyhow!("Unknown chain '{}', set rpc_url for custom chains", other)),
        }
    }
}
