//! Cycle risk scoring.
//!
//! Each cycle is scored from eight normalised factors combined by a fixed
//! weight vector. Scoring is deterministic: the same cycle, graph and
//! address list always produce the same score.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::reputation::AddressReputation;
use crate::trace::SessionGraph;
use crate::types::{Cycle, Node, ScriptType};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Number of script families counted for full diversity.
const SCRIPT_FAMILIES: f64 = 4.0;

/// Addresses per transaction at which complexity saturates.
const COMPLEXITY_SATURATION: f64 = 3.0;

const HOUR_SECS: f64 = 3_600.0;
const DAY_SECS: f64 = 86_400.0;

/// Cycles scoring above this are reported as high risk.
pub const HIGH_RISK_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub cycle_length: f64,
    pub complexity: f64,
    pub value_concentration: f64,
    pub timing: f64,
    pub address_diversity: f64,
    pub known_services: f64,
    pub fresh_addresses: f64,
    pub equal_outputs: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            cycle_length: 0.15,
            complexity: 0.20,
            value_concentration: 0.15,
            timing: 0.10,
            address_diversity: 0.15,
            known_services: 0.10,
            fresh_addresses: 0.10,
            equal_outputs: 0.05,
        }
    }
}

impl RiskWeights {
    pub fn total(&self) -> f64 {
        self.cycle_length
            + self.complexity
            + self.value_concentration
            + self.timing
            + self.address_diversity
            + self.known_services
            + self.fresh_addresses
            + self.equal_outputs
    }
}

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

/// Normalised factor vector, each in `[0,1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskFactors {
    pub cycle_length: f64,
    pub complexity: f64,
    pub value_concentration: f64,
    pub timing: f64,
    pub address_diversity: f64,
    pub known_services: f64,
    pub fresh_addresses: f64,
    pub equal_outputs: f64,
}

impl RiskFactors {
    pub fn dot(&self, w: &RiskWeights) -> f64 {
        let score = self.cycle_length * w.cycle_length
            + self.complexity * w.complexity
            + self.value_concentration * w.value_concentration
            + self.timing * w.timing
            + self.address_diversity * w.address_diversity
            + self.known_services * w.known_services
            + self.fresh_addresses * w.fresh_addresses
            + self.equal_outputs * w.equal_outputs;
        score.clamp(0.0, 1.0)
    }
}

pub struct RiskScorer {
    weights: RiskWeights,
    reputation: Arc<dyn AddressReputation>,
}

impl RiskScorer {
    pub fn new(weights: RiskWeights, reputation: Arc<dyn AddressReputation>) -> Self {
        Self { weights, reputation }
    }

    pub fn score(&self, cycle: &Cycle, graph: &SessionGraph) -> f64 {
        self.factors(cycle, graph).dot(&self.weights)
    }

    pub fn factors(&self, cycle: &Cycle, graph: &SessionGraph) -> RiskFactors {
        let members: Vec<&Node> = cycle.members.iter().filter_map(|m| graph.node(m)).collect();
        if members.is_empty() {
            return RiskFactors::default();
        }

        RiskFactors {
            cycle_length: length_factor(members.len()),
            complexity: complexity_factor(cycle, &members),
            value_concentration: concentration_factor(&members),
            timing: timing_factor(&members),
            address_diversity: diversity_factor(&members),
            known_services: if cycle.addresses.iter().any(|a| self.reputation.is_known_mixer(a)) {
                1.0
            } else {
                0.0
            },
            fresh_addresses: fresh_factor(cycle, graph),
            equal_outputs: equal_output_factor(&members),
        }
    }
}

fn length_factor(len: usize) -> f64 {
    match len {
        0..=3 => 0.9,
        4..=5 => 0.7,
        6..=8 => 0.5,
        _ => 0.3,
    }
}

fn complexity_factor(cycle: &Cycle, members: &[&Node]) -> f64 {
    let transactions: HashSet<&str> = members.iter().map(|n| n.txid()).collect();
    let ratio = cycle.addresses.len() as f64 / transactions.len() as f64;
    (ratio / COMPLEXITY_SATURATION).min(1.0)
}

fn concentration_factor(members: &[&Node]) -> f64 {
    if members.len() < 2 {
        return 0.0;
    }
    let values: Vec<f64> = members.iter().map(|n| n.value as f64).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
}

fn timing_factor(members: &[&Node]) -> f64 {
    let mut times: Vec<i64> = members
        .iter()
        .filter_map(|n| n.block_time.map(|t| t.timestamp()))
        .collect();
    if times.len() < 2 {
        return 0.0;
    }
    times.sort_unstable();

    let intervals: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let std_dev = (intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64).sqrt();

    if std_dev < HOUR_SECS {
        0.8
    } else if std_dev < DAY_SECS {
        0.5
    } else {
        0.2
    }
}

fn diversity_factor(members: &[&Node]) -> f64 {
    let mut types: HashSet<ScriptType> = HashSet::new();
    for node in members {
        if node.script_type.is_known() {
            types.insert(node.script_type);
        } else {
            types.extend(
                node.addresses
                    .iter()
                    .map(|a| ScriptType::from_address(a))
                    .filter(ScriptType::is_known),
            );
        }
    }
    (types.len() as f64 / SCRIPT_FAMILIES).min(1.0)
}

fn fresh_factor(cycle: &Cycle, graph: &SessionGraph) -> f64 {
    if cycle.addresses.is_empty() {
        return 0.0;
    }
    let fresh = cycle
        .addresses
        .iter()
        .filter(|a| graph.address_occurrences(a) == 1)
        .count();
    fresh as f64 / cycle.addresses.len() as f64
}

fn equal_output_factor(members: &[&Node]) -> f64 {
    if members.len() < 2 {
        return 0.0;
    }
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for n in members {
        *counts.entry(n.value).or_default() += 1;
    }
    let equal = members.iter().filter(|n| counts[&n.value] > 1).count();
    equal as f64 / members.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
