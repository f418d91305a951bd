//! Chain data providers.
//!
//! Defines the `ChainDataProvider` trait used by the traversal engine and
//! the concrete backends: an Electrum/electrs TCP client, a Bitcoin Core
//! HTTP JSON-RPC client, and an in-memory fixture chain. `CachedProvider`
//! wraps any of them with a shared read-through cache.

pub mod bitcoind;
pub mod cache;
pub mod electrs;
pub mod memory;
pub mod verbose;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;
use tracing::info;

use crate::config::{AppConfig, ProviderConfig, ProviderKind};
use crate::types::{Transaction, TraceError};

pub use bitcoind::BitcoinRpcClient;
pub use cache::CachedProvider;
pub use electrs::ElectrsClient;
pub use memory::MemoryChain;

/// Failure of a single provider lookup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The transaction does not exist. Never retried.
    #[error("transaction not found: {0}")]
    NotFound(String),

    /// Transport or backend failure. Transient; callers may retry.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl From<ProviderError> for TraceError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(m) => TraceError::ProviderNotFound(m),
            ProviderError::Unavailable(m) => TraceError::ProviderUnavailable(m),
        }
    }
}

/// Result of a provider health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub healthy: bool,
    pub detail: String,
}

/// Read-only access to confirmed and mempool transactions.
///
/// Lookups are idempotent and safe to retry. Implementations must be
/// shareable across concurrently running sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Fetch and decode a transaction by id.
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError>;

    /// Probe the backend.
    async fn health(&self) -> ProviderHealth;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Build the configured provider, wrapped in the shared cache.
pub async fn build_provider(config: &ProviderConfig, cache_entries: usize) -> Result<Arc<dyn ChainDataProvider>> {
    let inner: Arc<dyn ChainDataProvider> = match config.kind {
        ProviderKind::Electrs => {
            let c = &config.electrs;
            Arc::new(ElectrsClient::new(&c.host, c.port, config.timeout_secs).with_pool_size(c.pool_size))
        }
        ProviderKind::Bitcoind => {
            let c = &config.bitcoind;
            let password = AppConfig::resolve_env(&c.password_env)
                .context("Bitcoin Core RPC password missing")?;
            Arc::new(BitcoinRpcClient::new(
                &c.url,
                &c.user,
                SecretString::new(password),
                config.timeout_secs,
            )?)
        }
        ProviderKind::Fixture => {
            let path = &config.fixture.path;
            let chain = MemoryChain::load(path)
                .await
                .with_context(|| format!("Failed to load fixture chain from {path}"))?;
            info!(transactions = chain.len(), path = %path, "Fixture chain loaded");
            Arc::new(chain)
        }
    };

    info!(provider = inner.name(), cache_entries, "Chain data provider configured");
    Ok(Arc::new(CachedProvider::new(inner, cache_entries)))
}

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

/// Response envelope shared by the Electrum and Bitcoin Core protocols.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct RpcResponse {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Split into the result value or a classified provider error.
    pub fn into_result(self) -> Result<serde_json::Value, ProviderError> {
        match self.error {
            Some(error) if !error.is_null() => Err(classify_rpc_error(&error)),
            _ => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Map a JSON-RPC error object (or bare string) to a provider error.
///
/// Code -5 is "no such transaction" and -8 an invalid txid parameter;
/// Electrum servers wrap daemon errors in a message string.
pub(crate) fn classify_rpc_error(error: &serde_json::Value) -> ProviderError {
    let code = error.get("code").and_then(serde_json::Value::as_i64);
    let message = error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let lower = message.to_lowercase();

    if matches!(code, Some(-5) | Some(-8))
        || lower.contains("no such")
        || lower.contains("not found")
    {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Unavailable(message)
    }
}
