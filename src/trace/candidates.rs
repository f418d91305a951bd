//! Predecessor candidate generation.
//!
//! Given the transaction that created an output, decide which of its
//! inputs plausibly funded that output and with what local confidence.
//! Weights always sum to at most 1.0; any mass that cannot be attributed
//! is reported as residual rather than dropped.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::types::{OutputRef, ScriptType, Transaction, TxInput, TxOutput};

// ---------------------------------------------------------------------------
// Configuration (defaults; overridden by config.toml at runtime)
// ---------------------------------------------------------------------------

/// Signal weights of the mixing score.
const EQUAL_OUTPUT_WEIGHT: f64 = 0.40;
const IO_BALANCE_WEIGHT: f64 = 0.25;
const ROUND_AMOUNT_WEIGHT: f64 = 0.15;
const FEE_SHARE_WEIGHT: f64 = 0.20;

/// Bonus applied to an input's base weight per matching signal.
const SCRIPT_MATCH_BONUS: f64 = 0.5;
const VALUE_COVER_BONUS: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Mixing score at or above which a transaction is treated as mixing.
    pub mixing_threshold: f64,
    /// Maximum candidates emitted per transaction.
    pub max_candidates: usize,
    /// Amounts divisible by this many satoshis count as round.
    pub round_unit_sats: u64,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            mixing_threshold: 0.5,
            max_candidates: 64,
            round_unit_sats: 100_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// One plausible predecessor.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub parent: OutputRef,
    /// Local confidence in `(0, 1]`.
    pub weight: f64,
}

/// Individual mixing signals, each in `[0,1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MixingSignals {
    pub equal_outputs: f64,
    pub io_balance: f64,
    pub round_amounts: f64,
    /// Only computed when every input value is known.
    pub fee_shares: Option<f64>,
    pub score: f64,
}

/// Ordered candidates plus the mass that could not be attributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    pub candidates: Vec<Candidate>,
    pub residual: f64,
    pub mixing: Option<MixingSignals>,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.candidates.iter().map(|c| c.weight).sum()
    }
}

pub struct CandidateGenerator {
    config: CandidateConfig,
}

impl CandidateGenerator {
    pub fn new(config: CandidateConfig) -> Self {
        Self { config }
    }

    /// Candidates for the output at `index` of `tx`, strongest first.
    pub fn generate(&self, tx: &Transaction, index: u32) -> CandidateSet {
        if tx.is_coinbase() {
            return CandidateSet::default();
        }

        let inputs: Vec<(usize, &TxInput)> = tx
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.is_null())
            .collect();

        if inputs.len() == 1 {
            return CandidateSet {
                candidates: vec![Candidate {
                    parent: inputs[0].1.prev_output(),
                    weight: 1.0,
                }],
                residual: 0.0,
                mixing: None,
            };
        }

        let resolved = tx.output(index);
        let signals = self.mixing_signals(tx);

        let raw: Vec<(usize, &TxInput, f64)> = match &signals {
            Some(s) if s.score >= self.config.mixing_threshold => {
                debug!(txid = %tx.txid, score = s.score, inputs = inputs.len(), "Mixing transaction");
                inputs
                    .iter()
                    .map(|&(pos, input)| (pos, input, mixing_input_strength(input, resolved)))
                    .collect()
            }
            _ => consolidation_weights(&inputs, resolved),
        };

        self.finish(raw, signals)
    }

    /// Normalise, merge duplicate prevouts, order, cap, and compute residual.
    fn finish(&self, raw: Vec<(usize, &TxInput, f64)>, mixing: Option<MixingSignals>) -> CandidateSet {
        let total: f64 = raw.iter().map(|(_, _, w)| *w).sum();
        if total <= 0.0 {
            return CandidateSet {
                candidates: Vec::new(),
                residual: 1.0,
                mixing,
            };
        }

        let mut merged: Vec<(usize, OutputRef, f64)> = Vec::with_capacity(raw.len());
        let mut seen: HashMap<OutputRef, usize> = HashMap::new();
        for (pos, input, w) in raw {
            let parent = input.prev_output();
            match seen.get(&parent) {
                Some(&slot) => merged[slot].2 += w / total,
                None => {
                    seen.insert(parent.clone(), merged.len());
                    merged.push((pos, parent, w / total));
                }
            }
        }

        merged.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        merged.truncate(self.config.max_candidates);

        let candidates: Vec<Candidate> = merged
            .into_iter()
            .map(|(_, parent, weight)| Candidate { parent, weight })
            .collect();
        let kept: f64 = candidates.iter().map(|c| c.weight).sum();

        CandidateSet {
            candidates,
            residual: (1.0 - kept).max(0.0),
            mixing,
        }
    }

    /// Combine the mixing signals of a multi-input, multi-output transaction.
    pub fn mixing_signals(&self, tx: &Transaction) -> Option<MixingSignals> {
        let inputs = tx.inputs.iter().filter(|i| !i.is_null()).count();
        let outputs: Vec<&TxOutput> = tx
            .outputs
            .iter()
            .filter(|o| o.value > 0 && o.script_type != ScriptType::Nulldata)
            .collect();
        if inputs < 2 || outputs.len() < 2 {
            return None;
        }

        let mut counts: HashMap<u64, usize> = HashMap::new();
        for o in &outputs {
            *counts.entry(o.value).or_default() += 1;
        }
        let (denomination, equal_count) = counts
            .iter()
            .map(|(&value, &count)| (value, count))
            .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
            .unwrap_or((0, 0));

        let n = outputs.len() as f64;
        let equal_outputs = if equal_count >= 2 { equal_count as f64 / n } else { 0.0 };

        let io_balance = inputs.min(outputs.len()) as f64 / inputs.max(outputs.len()) as f64;

        let round_unit = self.config.round_unit_sats.max(1);
        let round_count = outputs.iter().filter(|o| o.value % round_unit == 0).count();
        let round_amounts = if round_count >= 2 { round_count as f64 / n } else { 0.0 };

        let fee_shares = if equal_count >= 2 {
            fee_share_similarity(tx, denomination)
        } else {
            None
        };

        let (weighted, weight_total) = match fee_shares {
            Some(f) => (
                EQUAL_OUTPUT_WEIGHT * equal_outputs
                    + IO_BALANCE_WEIGHT * io_balance
                    + ROUND_AMOUNT_WEIGHT * round_amounts
                    + FEE_SHARE_WEIGHT * f,
                EQUAL_OUTPUT_WEIGHT + IO_BALANCE_WEIGHT + ROUND_AMOUNT_WEIGHT + FEE_SHARE_WEIGHT,
            ),
            None => (
                EQUAL_OUTPUT_WEIGHT * equal_outputs
                    + IO_BALANCE_WEIGHT * io_balance
                    + ROUND_AMOUNT_WEIGHT * round_amounts,
                EQUAL_OUTPUT_WEIGHT + IO_BALANCE_WEIGHT + ROUND_AMOUNT_WEIGHT,
            ),
        };

        Some(MixingSignals {
            equal_outputs,
            io_balance,
            round_amounts,
            fee_shares,
            score: (weighted / weight_total).clamp(0.0, 1.0),
        })
    }
}

/// Base weight 1.0 raised by signals tying an input to the resolved output.
fn mixing_input_strength(input: &TxInput, resolved: Option<&TxOutput>) -> f64 {
    let Some(output) = resolved else {
        return 1.0;
    };
    let mut strength = 1.0;
    if input.prev_script_type.is_some_and(|s| s.is_known() && s == output.script_type) {
        strength += SCRIPT_MATCH_BONUS;
    }
    if input.prev_value.is_some_and(|v| v >= output.value) {
        strength += VALUE_COVER_BONUS;
    }
    strength
}

/// Weights for a non-mixing multi-input transaction.
fn consolidation_weights<'a>(
    inputs: &[(usize, &'a TxInput)],
    resolved: Option<&TxOutput>,
) -> Vec<(usize, &'a TxInput, f64)> {
    if let Some(output) = resolved {
        let covering: Vec<&(usize, &TxInput)> = inputs
            .iter()
            .filter(|(_, i)| i.prev_value.is_some_and(|v| v >= output.value))
            .collect();
        if let [only] = covering.as_slice() {
            return vec![(only.0, only.1, 1.0)];
        }
    }

    let values: Option<Vec<u64>> = inputs.iter().map(|(_, i)| i.prev_value).collect();
    match values {
        Some(values) if values.iter().sum::<u64>() > 0 => inputs
            .iter()
            .zip(values)
            .filter(|(_, v)| *v > 0)
            .map(|(&(pos, input), v)| (pos, input, v as f64))
            .collect(),
        _ => inputs.iter().map(|&(pos, input)| (pos, input, 1.0)).collect(),
    }
}

/// Similarity of per-participant excess over the common denomination.
fn fee_share_similarity(tx: &Transaction, denomination: u64) -> Option<f64> {
    let values: Option<Vec<u64>> = tx
        .inputs
        .iter()
        .filter(|i| !i.is_null())
        .map(|i| i.prev_value)
        .collect();
    let excess: Vec<f64> = values?
        .into_iter()
        .filter(|&v| v >= denomination)
        .map(|v| (v - denomination) as f64)
        .collect();
    if excess.len() < 2 {
        return None;
    }

    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    if mean == 0.0 {
        return Some(1.0);
    }
    let variance = excess.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / excess.len() as f64;
    Some((1.0 - variance.sqrt() / mean).clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
