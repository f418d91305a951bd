//! Mock chain for integration testing.
//!
//! Builders for deterministic transaction graphs plus a `FlakyChain`
//! wrapper that injects latency and transient failures in front of an
//! in-memory chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use satoshi_tracer::chain::{ChainDataProvider, MemoryChain, ProviderError, ProviderHealth};
use satoshi_tracer::types::{OutputRef, ScriptType, Transaction, TxInput, TxOutput, NULL_TXID};

/// Deterministic 64-hex txid for test transaction `n`.
pub fn txid(n: u32) -> String {
    format!("{:064x}", 0xabc0_0000_u64 + n as u64)
}

pub fn outpoint(n: u32) -> OutputRef {
    OutputRef::new(txid(n), 0)
}

/// A transaction `n` spending output 0 of each of `spends`, with one
/// output per entry of `values`. No spends means coinbase.
pub fn make_tx(n: u32, spends: &[u32], values: &[u64], address: Option<&str>) -> Transaction {
    let inputs = if spends.is_empty() {
        vec![TxInput::new(NULL_TXID, u32::MAX)]
    } else {
        spends.iter().map(|&p| TxInput::new(txid(p), 0)).collect()
    };
    Transaction {
        txid: txid(n),
        inputs,
        outputs: values
            .iter()
            .enumerate()
            .map(|(i, &value)| TxOutput {
                index: i as u32,
                value,
                address: address.map(str::to_string),
                script_type: ScriptType::P2wpkh,
            })
            .collect(),
        block_time: None,
    }
}

/// `len` transactions where `n` spends `n - 1` and transaction 1 is a
/// coinbase. The root is `outpoint(len)`.
pub fn linear_chain(len: u32) -> MemoryChain {
    MemoryChain::from_transactions((1..=len).map(|n| {
        let spends: Vec<u32> = if n == 1 { vec![] } else { vec![n - 1] };
        make_tx(n, &spends, &[50_000], None)
    }))
}

/// `root(10) <- 11 <- mix(12) <- 20..=24 <- coinbases 30..=34`. The mix
/// has five inputs and five equal outputs. The root is `outpoint(10)`.
pub fn mixing_chain() -> MemoryChain {
    let mut txs = vec![
        make_tx(10, &[11], &[400_000], None),
        make_tx(11, &[12], &[450_000], None),
        make_tx(12, &[20, 21, 22, 23, 24], &[100_000; 5], None),
    ];
    for i in 0..5 {
        txs.push(make_tx(20 + i, &[30 + i], &[120_000], None));
        txs.push(make_tx(30 + i, &[], &[130_000], None));
    }
    MemoryChain::from_transactions(txs)
}

/// `root(10)` consolidates 11 and 12, which both spend `13:0`, funded by
/// coinbase 14. The second path into 13 becomes a join edge.
pub fn diamond_chain() -> MemoryChain {
    MemoryChain::from_transactions(vec![
        make_tx(10, &[11, 12], &[90_000], Some("bc1qroot")),
        make_tx(11, &[13], &[50_000], Some("bc1qleft")),
        make_tx(12, &[13], &[45_000], Some("bc1qright")),
        make_tx(13, &[14], &[98_000], Some("bc1qsource")),
        make_tx(14, &[], &[100_000], Some("bc1qminer")),
    ])
}

/// Wraps a chain with per-call latency and a number of transient failures
/// per txid before lookups succeed.
pub struct FlakyChain {
    inner: MemoryChain,
    delay: Duration,
    failures_per_txid: usize,
    attempts: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl FlakyChain {
    pub fn new(inner: MemoryChain) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            failures_per_txid: 0,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failures(mut self, failures_per_txid: usize) -> Self {
        self.failures_per_txid = failures_per_txid;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainDataProvider for FlakyChain {
    async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(txid.to_string()).or_default();
            *count += 1;
            *count
        };
        if attempt <= self.failures_per_txid {
            return Err(ProviderError::Unavailable(format!("injected failure {attempt}")));
        }
        self.inner.get_transaction(txid).await
    }

    async fn health(&self) -> ProviderHealth {
        self.inner.health().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
