//! Provenance traversal.
//!
//! `candidates` turns one transaction into weighted predecessor edges,
//! `frontier` orders pending work, `graph` holds the explored subgraph and
//! `engine` drives the best-first loop for one session.

pub mod candidates;
pub mod engine;
pub mod frontier;
pub mod graph;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{OutputRef, SessionId, TraceError, MAX_DEPTH_LIMIT};

pub use candidates::{Candidate, CandidateConfig, CandidateGenerator, CandidateSet};
pub use engine::{EngineConfig, TraversalEngine};
pub use graph::SessionGraph;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Validated inputs of one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceParams {
    pub root: OutputRef,
    pub depth_limit: u32,
    pub confidence_cutoff: f64,
}

impl TraceParams {
    pub fn new(root: OutputRef, depth_limit: u32, confidence_cutoff: f64) -> Result<Self, TraceError> {
        if !crate::types::is_valid_txid(&root.txid) {
            return Err(TraceError::InvalidParameter(
                "txid must be exactly 64 hexadecimal characters".to_string(),
            ));
        }
        if depth_limit == 0 || depth_limit > MAX_DEPTH_LIMIT {
            return Err(TraceError::InvalidParameter(format!(
                "depth limit must be between 1 and {MAX_DEPTH_LIMIT}, got {depth_limit}"
            )));
        }
        if !confidence_cutoff.is_finite() || !(0.0..1.0).contains(&confidence_cutoff) {
            return Err(TraceError::InvalidParameter(format!(
                "confidence cutoff must be in [0, 1), got {confidence_cutoff}"
            )));
        }
        Ok(Self {
            root,
            depth_limit,
            confidence_cutoff,
        })
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between a session and its owner.
/// Waiters parked in `cancelled()` wake as soon as it is set.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<watch::Sender<bool>>);

impl Default for CancelFlag {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Per-session event sequence. Shared so a supervisor can append the
/// terminal event if the engine task dies.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    /// Next sequence number; the first call returns 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// State of one trace, owned exclusively by its engine task.
pub struct TraceSession {
    pub id: SessionId,
    pub params: TraceParams,
    /// Visited set and explored subgraph.
    pub graph: SessionGraph,
    pub cancel: CancelFlag,
    pub seq: SequenceCounter,
}

impl TraceSession {
    pub fn new(id: SessionId, params: TraceParams, cancel: CancelFlag, seq: SequenceCounter) -> Self {
        Self {
            id,
            params,
            graph: SessionGraph::new(),
            cancel,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> OutputRef {
        OutputRef::new("ab".repeat(32), 0)
    }

    #[test]
    fn test_params_validation() {
        assert!(TraceParams::new(root(), 20, 0.0).is_ok());
        assert!(TraceParams::new(root(), 100, 0.99).is_ok());
        assert!(TraceParams::new(root(), 0, 0.0).is_err());
        assert!(TraceParams::new(root(), 101, 0.0).is_err());
        assert!(TraceParams::new(root(), 5, 1.0).is_err());
        assert!(TraceParams::new(root(), 5, -0.1).is_err());
        assert!(TraceParams::new(root(), 5, f64::NAN).is_err());
        assert!(TraceParams::new(OutputRef::new("xyz", 0), 5, 0.0).is_err());
    }

    #[test]
    fn test_sequence_counter_starts_at_one() {
        let seq = SequenceCounter::default();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.clone().next(), 2);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = tokio::spawn({
            let flag = flag.clone();
            async move { flag.cancelled().await }
        });
        tokio::task::yield_now().await;
        flag.cancel();
        tokio_test::assert_ok!(tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await);
        // already set: resolves at once
        flag.cancelled().await;
    }
}
