//! Bitcoin Core JSON-RPC integration.
//!
//! API: HTTP POST to the node's RPC port (default 8332).
//! Auth: HTTP basic auth (`rpcuser` / `rpcpassword`).
//! Lookups use `getrawtransaction <txid> 2`, which requires `txindex=1`
//! for confirmed transactions outside the wallet and includes `prevout`
//! data for every input.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{verbose, ChainDataProvider, ProviderError, ProviderHealth, RpcResponse};
use crate::types::Transaction;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const PROVIDER_NAME: &str = "bitcoind";

/// Verbosity level that adds `prevout` to every input.
const VERBOSITY_WITH_PREVOUT: u8 = 2;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BitcoinRpcClient {
    http: Client,
    url: String,
    user: String,
    password: SecretString,
    next_id: AtomicU64,
}

impl BitcoinRpcClient {
    pub fn new(url: &str, user: &str, password: SecretString, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .user_agent("satoshi-tracer/0.1")
            .build()
            .context("Failed to build Bitcoin Core HTTP client")?;

        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });
        debug!(method, id, "Bitcoin Core request");

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = %status, "Bitcoin Core rejected credentials");
            return Err(ProviderError::Unavailable(format!("authentication failed ({status})")));
        }

        // Core answers RPC errors with HTTP 404/500 and a JSON body.
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to read response: {e}")))?;

        match serde_json::from_str::<RpcResponse>(&text) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => {
                Err(ProviderError::Unavailable(format!("HTTP {status}: {text}")))
            }
            Err(e) => Err(ProviderError::Unavailable(format!("malformed response: {e}"))),
        }
    }
}

#[async_trait]
impl ChainDataProvider for BitcoinRpcClient {
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError> {
        let value = self
            .call("getrawtransaction", json!([txid, VERBOSITY_WITH_PREVOUT]))
            .await?;
        verbose::decode(value).map(Arc::new)
    }

    async fn health(&self) -> ProviderHealth {
        match self.call("getblockchaininfo", json!([])).await {
            Ok(info) => ProviderHealth {
                provider: PROVIDER_NAME.to_string(),
                healthy: true,
                detail: format!(
                    "chain={} blocks={}",
                    info["chain"].as_str().unwrap_or("?"),
                    info["blocks"].as_u64().unwrap_or_default(),
                ),
            },
            Err(e) => ProviderHealth {
                provider: PROVIDER_NAME.to_string(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
