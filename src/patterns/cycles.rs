//! Incremental cycle detection over the explored subgraph.
//!
//! Three detectors feed one de-duplicated stream of cycles:
//! - address recurrence along a node's own discovery path,
//! - closed walks created by join edges,
//! - periodic strongly connected component sweeps.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::trace::SessionGraph;
use crate::types::{Cycle, CycleId, CycleKind, CycleShape, Edge, Node, OutputRef};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Longest cycle searched for by the path-based detectors.
    pub max_cycle_length: usize,
    /// Smallest member count reported by the path-based detectors.
    pub min_cycle_members: usize,
    /// Nodes plus edges added between strongly-connected sweeps.
    pub scc_batch_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_cycle_length: 15,
            min_cycle_members: 2,
            scc_batch_size: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct CycleDetector {
    config: DetectorConfig,
    next_id: u32,
    /// Sorted member sets already reported, per kind.
    reported: HashSet<(CycleKind, Vec<OutputRef>)>,
    /// Sorted member sets already reported under any kind.
    reported_sets: HashSet<Vec<OutputRef>>,
    cycles: Vec<Cycle>,
    growth_since_sweep: usize,
}

impl CycleDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            next_id: 1,
            reported: HashSet::new(),
            reported_sets: HashSet::new(),
            cycles: Vec::new(),
            growth_since_sweep: 0,
        }
    }

    /// Address recurrence: `node` shares an address with an ancestor on
    /// `path` (root first, discovering node last).
    pub fn on_node(&mut self, graph: &SessionGraph, node: &Node, path: &[OutputRef]) -> Vec<Cycle> {
        let mut found = Vec::new();
        if node.addresses.is_empty() {
            return found;
        }

        let mut pending: HashSet<&str> = node.addresses.iter().map(String::as_str).collect();
        let window = path.len().min(self.config.max_cycle_length);
        let start = path.len() - window;

        for i in (start..path.len()).rev() {
            if pending.is_empty() {
                break;
            }
            let Some(ancestor) = graph.node(&path[i]) else {
                continue;
            };
            let shared: Vec<&str> = ancestor
                .addresses
                .iter()
                .map(String::as_str)
                .filter(|a| pending.contains(a))
                .collect();
            if shared.is_empty() {
                continue;
            }

            // Too short to report: keep looking further up.
            let members = path[i..].to_vec();
            if members.len() < self.config.min_cycle_members {
                continue;
            }
            for a in &shared {
                pending.remove(a);
            }
            if let Some(cycle) = self.build(graph, CycleKind::AddressRecurrence, members, Some(node.output.clone())) {
                found.push(cycle);
            }
        }
        found
    }

    /// Closed walk: a join edge `s → t` closes a cycle if `t ⇝ s` already.
    pub fn on_edge(&mut self, graph: &SessionGraph, edge: &Edge) -> Vec<Cycle> {
        if !edge.join {
            return Vec::new();
        }
        let Some(members) = graph.shortest_path(&edge.parent, &edge.child, self.config.max_cycle_length) else {
            return Vec::new();
        };
        if members.len() < self.config.min_cycle_members {
            return Vec::new();
        }
        self.build(graph, CycleKind::ClosedWalk, members, None)
            .into_iter()
            .collect()
    }

    /// Count graph growth and sweep for components once a batch is reached.
    pub fn on_growth(&mut self, graph: &SessionGraph, added: usize) -> Vec<Cycle> {
        self.growth_since_sweep += added;
        if self.growth_since_sweep < self.config.scc_batch_size.max(1) {
            return Vec::new();
        }
        self.sweep(graph)
    }

    /// Strongly connected components not yet reported under any kind.
    pub fn sweep(&mut self, graph: &SessionGraph) -> Vec<Cycle> {
        self.growth_since_sweep = 0;
        let components = graph.strongly_connected();
        debug!(components = components.len(), "Strongly connected sweep");

        components
            .into_iter()
            .filter_map(|members| {
                let key = sorted(&members);
                if self.reported_sets.contains(&key) {
                    return None;
                }
                self.build(graph, CycleKind::StronglyConnected, members, None)
            })
            .collect()
    }

    /// Store the final (scored) form of an emitted cycle.
    pub fn record(&mut self, cycle: Cycle) {
        self.cycles.push(cycle);
    }

    /// All recorded cycles in emission order.
    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    fn build(
        &mut self,
        graph: &SessionGraph,
        kind: CycleKind,
        members: Vec<OutputRef>,
        trigger: Option<OutputRef>,
    ) -> Option<Cycle> {
        let key = sorted(&members);
        if !self.reported.insert((kind, key.clone())) {
            return None;
        }
        self.reported_sets.insert(key);

        let nodes: Vec<&Node> = members.iter().filter_map(|m| graph.node(m)).collect();
        if nodes.len() != members.len() {
            return None;
        }

        let addresses: BTreeSet<String> = nodes.iter().flat_map(|n| n.addresses.iter().cloned()).collect();
        let aggregate_value = nodes.iter().map(|n| n.value).sum();
        let confidence = nodes.iter().map(|n| n.confidence).fold(1.0, f64::min);

        let id = CycleId(self.next_id);
        self.next_id += 1;

        Some(Cycle {
            id,
            kind,
            shape: CycleShape::from_len(members.len()),
            members,
            addresses,
            aggregate_value,
            risk_score: 0.0,
            confidence,
            trigger,
            detected_at: Utc::now(),
        })
    }
}

fn sorted(members: &[OutputRef]) -> Vec<OutputRef> {
    let mut key = members.to_vec();
    key.sort();
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
