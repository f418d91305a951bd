//! Shared types for the tracer.
//!
//! These types form the data model used across all modules: chain data
//! returned by providers, the nodes/edges/cycles of a trace session, and
//! the event records streamed to consumers. They are kept free of engine
//! logic so that providers, patterns and the session layer can depend on
//! them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// The all-zero txid used by coinbase inputs as their null prevout.
pub const NULL_TXID: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Maximum accepted discovery depth for a session.
pub const MAX_DEPTH_LIMIT: u32 = 100;

/// Default discovery depth for a session.
pub const DEFAULT_DEPTH_LIMIT: u32 = 20;

// ---------------------------------------------------------------------------
// Output references
// ---------------------------------------------------------------------------

/// Identifies one transaction output: the graph node key of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub txid: String,
    pub index: u32,
}

impl OutputRef {
    pub fn new(txid: impl Into<String>, index: u32) -> Self {
        Self {
            txid: txid.into(),
            index,
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Parse the `txid:vout` form used on the CLI and in logs.
impl std::str::FromStr for OutputRef {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s.trim().rsplit_once(':').ok_or_else(|| {
            TraceError::InvalidParameter(format!("expected <txid>:<vout>, got '{s}'"))
        })?;
        if !is_valid_txid(txid) {
            return Err(TraceError::InvalidParameter(
                "txid must be exactly 64 hexadecimal characters".to_string(),
            ));
        }
        let index = index.parse::<u32>().map_err(|_| {
            TraceError::InvalidParameter(format!("vout must be a non-negative integer, got '{index}'"))
        })?;
        Ok(OutputRef::new(txid.to_lowercase(), index))
    }
}

/// Whether a string is a well-formed transaction id (64 hex characters).
pub fn is_valid_txid(txid: &str) -> bool {
    txid.len() == 64 && txid.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Script / address types
// ---------------------------------------------------------------------------

/// Output script template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Nulldata,
    #[default]
    Unknown,
}

impl ScriptType {
    /// Map the `scriptPubKey.type` names reported by node RPC interfaces.
    pub fn from_rpc_name(name: &str) -> Self {
        match name {
            "pubkeyhash" => ScriptType::P2pkh,
            "scripthash" => ScriptType::P2sh,
            "witness_v0_keyhash" => ScriptType::P2wpkh,
            "witness_v0_scripthash" => ScriptType::P2wsh,
            "witness_v1_taproot" => ScriptType::P2tr,
            "nulldata" => ScriptType::Nulldata,
            _ => ScriptType::Unknown,
        }
    }

    /// Classify a raw `scriptPubKey` given as hex.
    pub fn from_script_hex(hex: &str) -> Self {
        let hex = hex.to_ascii_lowercase();
        match hex.len() {
            50 if hex.starts_with("76a914") && hex.ends_with("88ac") => ScriptType::P2pkh,
            46 if hex.starts_with("a914") && hex.ends_with("87") => ScriptType::P2sh,
            44 if hex.starts_with("0014") => ScriptType::P2wpkh,
            68 if hex.starts_with("0020") => ScriptType::P2wsh,
            68 if hex.starts_with("5120") => ScriptType::P2tr,
            _ if hex.starts_with("6a") => ScriptType::Nulldata,
            _ => ScriptType::Unknown,
        }
    }

    /// Classify an encoded address by its prefix (mainnet and testnet).
    pub fn from_address(address: &str) -> Self {
        let lower = address.to_ascii_lowercase();
        let witness = ["bc1", "tb1", "bcrt1"]
            .iter()
            .find_map(|hrp| lower.strip_prefix(hrp));

        if let Some(program) = witness {
            return match (program.chars().next(), address.len()) {
                (Some('q'), 42) | (Some('q'), 43) | (Some('q'), 44) => ScriptType::P2wpkh,
                (Some('q'), _) => ScriptType::P2wsh,
                (Some('p'), _) => ScriptType::P2tr,
                _ => ScriptType::Unknown,
            };
        }

        match address.chars().next() {
            Some('1') | Some('m') | Some('n') => ScriptType::P2pkh,
            Some('3') | Some('2') => ScriptType::P2sh,
            _ => ScriptType::Unknown,
        }
    }

    /// Whether this is a spendable, recognised template.
    pub fn is_known(&self) -> bool {
        !matches!(self, ScriptType::Unknown | ScriptType::Nulldata)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2wsh => "p2wsh",
            ScriptType::P2tr => "p2tr",
            ScriptType::Nulldata => "nulldata",
            ScriptType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Chain data
// ---------------------------------------------------------------------------

/// A transaction input: a reference to the previous output it consumes.
///
/// The `prev_*` fields are filled in when the provider can resolve the
/// spent output without another lookup (e.g. `prevout` in verbose RPC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_txid: String,
    pub prev_index: u32,
    #[serde(default)]
    pub prev_value: Option<u64>,
    #[serde(default)]
    pub prev_script_type: Option<ScriptType>,
    #[serde(default)]
    pub prev_address: Option<String>,
}

impl TxInput {
    pub fn new(prev_txid: impl Into<String>, prev_index: u32) -> Self {
        Self {
            prev_txid: prev_txid.into(),
            prev_index,
            prev_value: None,
            prev_script_type: None,
            prev_address: None,
        }
    }

    /// The output this input consumes.
    pub fn prev_output(&self) -> OutputRef {
        OutputRef::new(self.prev_txid.clone(), self.prev_index)
    }

    /// Coinbase inputs carry the null prevout.
    pub fn is_null(&self) -> bool {
        self.prev_txid == NULL_TXID
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    /// Value in satoshis.
    pub value: u64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub script_type: ScriptType,
}

/// A decoded transaction as returned by a chain data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub block_time: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Block-reward transactions have no funding predecessor.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.iter().all(TxInput::is_null)
    }

    /// Look up an output by its index.
    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.iter().find(|o| o.index == index)
    }
}

// ---------------------------------------------------------------------------
// Trace graph
// ---------------------------------------------------------------------------

/// Why a node was recorded without being expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// The node sits at the session's depth limit.
    DepthLimit,
    /// Cumulative confidence fell below the session cutoff.
    BelowConfidence,
    /// The provider stayed unavailable after all retries.
    ProviderUnavailable,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::DepthLimit => write!(f, "depth limit"),
            UnresolvedReason::BelowConfidence => write!(f, "below confidence cutoff"),
            UnresolvedReason::ProviderUnavailable => write!(f, "provider unavailable"),
        }
    }
}

/// Terminal annotation of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeStatus {
    /// Predecessor candidates were pushed onto the frontier.
    Expanded,
    /// The owning transaction is a coinbase: issuance reached.
    Coinbase,
    /// The provider reports the transaction or output does not exist.
    NotFound,
    /// A leaf that could have been expanded further.
    Unresolved { reason: UnresolvedReason },
}

impl NodeStatus {
    pub fn unresolved(reason: UnresolvedReason) -> Self {
        NodeStatus::Unresolved { reason }
    }
}

/// One explored output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub output: OutputRef,
    pub addresses: Vec<String>,
    /// Discovery depth; the root is 0.
    pub depth: u32,
    /// Product of edge weights along the discovering path, in `[0,1]`.
    pub confidence: f64,
    /// Value in satoshis (0 when the output could not be fetched).
    pub value: u64,
    pub script_type: ScriptType,
    pub block_time: Option<DateTime<Utc>>,
    /// The shallower node that first reached this one.
    pub discovered_from: Option<OutputRef>,
    pub status: NodeStatus,
    /// Candidate mass that could not be attributed to any predecessor.
    pub untraced_mass: f64,
    /// Highest risk of any cycle containing this node.
    pub risk: f64,
}

impl Node {
    /// Id of the transaction that created this output.
    pub fn txid(&self) -> &str {
        &self.output.txid
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} depth={} conf={:.3} value={} addrs=[{}]",
            self.output,
            self.depth,
            self.confidence,
            self.value,
            self.addresses.join(","),
        )
    }
}

/// Directed link `child → parent`: the parent output was consumed by the
/// transaction that created the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub child: OutputRef,
    pub parent: OutputRef,
    /// Local confidence weight from the candidate generator.
    pub weight: f64,
    /// Set when the parent had already been discovered through another child.
    #[serde(default)]
    pub join: bool,
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// How a cycle was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleKind {
    AddressRecurrence,
    ClosedWalk,
    StronglyConnected,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::AddressRecurrence => write!(f, "address-recurrence"),
            CycleKind::ClosedWalk => write!(f, "closed-walk"),
            CycleKind::StronglyConnected => write!(f, "strongly-connected"),
        }
    }
}

/// Length class of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleShape {
    ImmediateReturn,
    Short,
    Medium,
    Long,
}

impl CycleShape {
    pub fn from_len(len: usize) -> Self {
        match len {
            0..=3 => CycleShape::ImmediateReturn,
            4..=6 => CycleShape::Short,
            7..=10 => CycleShape::Medium,
            _ => CycleShape::Long,
        }
    }
}

/// Session-scoped cycle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(pub u32);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{:04}", self.0)
    }
}

/// A closed pattern within the explored subgraph. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub kind: CycleKind,
    /// Member nodes in walk order.
    pub members: Vec<OutputRef>,
    pub addresses: BTreeSet<String>,
    /// Sum of member values in satoshis.
    pub aggregate_value: u64,
    pub risk_score: f64,
    /// Lowest cumulative confidence among the members.
    pub confidence: f64,
    pub shape: CycleShape,
    /// The node whose arrival confirmed the closure, when it is not a member.
    pub trigger: Option<OutputRef>,
    pub detected_at: DateTime<Utc>,
}

impl Cycle {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} len={} value={} risk={:.2}",
            self.id,
            self.kind,
            self.members.len(),
            self.aggregate_value,
            self.risk_score,
        )
    }
}

// ---------------------------------------------------------------------------
// Sessions & events
// ---------------------------------------------------------------------------

/// Identifier of one trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| TraceError::InvalidParameter(format!("invalid session id: {s}")))
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a risk update refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RiskTarget {
    Node(OutputRef),
    Cycle(CycleId),
}

/// Aggregate statistics attached to the terminal event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub nodes: usize,
    pub edges: usize,
    pub cycles: usize,
    pub high_risk_cycles: usize,
    pub average_risk: f64,
    /// Sum of aggregate values over all cycles, in satoshis.
    pub total_circular_value: u64,
    pub unique_addresses: usize,
    pub coinbase_leaves: usize,
    pub not_found_leaves: usize,
    pub unresolved_leaves: usize,
    pub max_depth: u32,
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nodes={} edges={} cycles={} (high-risk={}) coinbase={} unresolved={} not-found={}",
            self.nodes,
            self.edges,
            self.cycles,
            self.high_risk_cycles,
            self.coinbase_leaves,
            self.unresolved_leaves,
            self.not_found_leaves,
        )
    }
}

/// Payload of a session event. Closed set so consumers can match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    NodeDiscovered { node: Node },
    EdgeAdded { edge: Edge },
    CyclePattern { cycle: Cycle },
    RiskUpdate { target: RiskTarget, score: f64 },
    SessionTerminal {
        status: SessionStatus,
        reason: Option<String>,
        summary: TraceSummary,
    },
}

impl EventPayload {
    /// Short event name, used for SSE event types and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::NodeDiscovered { .. } => "node_discovered",
            EventPayload::EdgeAdded { .. } => "edge_added",
            EventPayload::CyclePattern { .. } => "cycle_pattern",
            EventPayload::RiskUpdate { .. } => "risk_update",
            EventPayload::SessionTerminal { .. } => "session_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::SessionTerminal { .. })
    }
}

/// One record of a session's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub session_id: SessionId,
    /// Strictly increasing within a session, starting at 1.
    pub seq: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain error taxonomy of the tracer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Chain data provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Not found on chain: {0}")]
    ProviderNotFound(String),

    #[error("Session cancelled")]
    SessionCancelled,

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
