//! Circular-pattern detection and risk scoring.

pub mod cycles;
pub mod reputation;
pub mod risk;

pub use cycles::{CycleDetector, DetectorConfig};
pub use reputation::{AddressList, AddressReputation};
pub use risk::{RiskFactors, RiskScorer, RiskWeights, HIGH_RISK_THRESHOLD};
