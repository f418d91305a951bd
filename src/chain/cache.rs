//! Shared read-through transaction cache.
//!
//! Transactions are immutable by txid, so entries never expire; the cache
//! is bounded and evicts the oldest insertion once full. Concurrent misses
//! for the same txid may both fetch; the last insert wins.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{ChainDataProvider, ProviderError, ProviderHealth};
use crate::types::Transaction;

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Arc<Transaction>>,
    order: VecDeque<String>,
}

pub struct CachedProvider {
    inner: Arc<dyn ChainDataProvider>,
    cache: RwLock<CacheInner>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn ChainDataProvider>, max_entries: usize) -> Self {
        Self {
            inner,
            cache: RwLock::new(CacheInner::default()),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lookup(&self, txid: &str) -> Option<Arc<Transaction>> {
        self.cache.read().ok()?.entries.get(txid).cloned()
    }

    fn store(&self, tx: Arc<Transaction>) {
        if self.max_entries == 0 {
            return;
        }
        let Ok(mut cache) = self.cache.write() else {
            return;
        };
        if cache.entries.insert(tx.txid.clone(), tx.clone()).is_none() {
            cache.order.push_back(tx.txid.clone());
        }
        while cache.entries.len() > self.max_entries {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChainDataProvider for CachedProvider {
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError> {
        if let Some(tx) = self.lookup(txid) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(txid, "Transaction cache hit");
            return Ok(tx);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let tx = self.inner.get_transaction(txid).await?;
        self.store(tx.clone());
        Ok(tx)
    }

    async fn health(&self) -> ProviderHealth {
        let mut health = self.inner.health().await;
        health.detail = format!(
            "{} [cache entries={} hits={} misses={}]",
            health.detail,
            self.len(),
            self.hits(),
            self.misses(),
        );
        health
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
