//! Confidence-ordered frontier of pending outputs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::types::OutputRef;

/// A pending output and the path that reached it.
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub confidence: f64,
    pub depth: u32,
    /// Insertion order; assigned by the frontier.
    pub seq: u64,
    pub output: OutputRef,
    /// Nodes from the root down to the discovering node, inclusive.
    pub path: Arc<[OutputRef]>,
    /// Discovering child and the local weight of that edge.
    pub via: Option<(OutputRef, f64)>,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher confidence, then shallower, then earlier.
impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.confidence
            .total_cmp(&other.confidence)
            .then_with(|| other.depth.cmp(&self.depth))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct Frontier {
    heap: BinaryHeap<FrontierEntry>,
    next_seq: u64,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry, stamping its insertion sequence.
    pub fn push(&mut self, mut entry: FrontierEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<FrontierEntry> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
