//! In-memory chain for fixture replays and tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{ChainDataProvider, ProviderError, ProviderHealth};
use crate::types::Transaction;

/// A fixed set of transactions keyed by txid.
///
/// Fixture files are a JSON array of transactions in the crate's own
/// serialised form.
#[derive(Default)]
pub struct MemoryChain {
    txs: RwLock<HashMap<String, Arc<Transaction>>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(txs: impl IntoIterator<Item = Transaction>) -> Self {
        let chain = Self::new();
        for tx in txs {
            chain.insert(tx);
        }
        chain
    }

    /// Load a fixture file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read fixture file: {}", path.display()))?;
        let txs: Vec<Transaction> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture file: {}", path.display()))?;
        Ok(Self::from_transactions(txs))
    }

    pub fn insert(&self, tx: Transaction) {
        if let Ok(mut txs) = self.txs.write() {
            txs.insert(tx.txid.clone(), Arc::new(tx));
        }
    }

    pub fn len(&self) -> usize {
        self.txs.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChainDataProvider for MemoryChain {
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError> {
        let txs = self
            .txs
            .read()
            .map_err(|_| ProviderError::Unavailable("fixture chain lock poisoned".to_string()))?;
        txs.get(txid)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(txid.to_string()))
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            provider: self.name().to_string(),
            healthy: true,
            detail: format!("{} transactions", self.len()),
        }
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScriptType, TxOutput};

    fn make_tx(txid: &str) -> Transaction {
        Transaction {
            txid: txid.to_string(),
            inputs: vec![],
            outputs: vec![TxOutput {
                index: 0,
                value: 1_000,
                address: Some("1Miner".to_string()),
                script_type: ScriptType::P2pkh,
            }],
            block_time: None,
        }
    }

    #[tokio::test]
    async fn test_lookup_and_not_found() {
        let chain = MemoryChain::from_transactions(vec![make_tx("aa"), make_tx("bb")]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get_transaction("aa").await.unwrap().txid, "aa");
        assert!(matches!(
            chain.get_transaction("cc").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        assert!(MemoryChain::load("/nonexistent/fixture.json").await.is_err());
    }
}
