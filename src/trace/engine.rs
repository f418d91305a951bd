//! Best-first provenance traversal for one session.
//!
//! The engine pops the most confident pending output, fetches its owning
//! transaction, records the node, runs cycle detection and scoring on the
//! grown subgraph, and pushes the weighted predecessors. Every observable
//! step is emitted as an event in order; the bounded event channel applies
//! backpressure before the next provider fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::candidates::{CandidateConfig, CandidateGenerator, CandidateSet};
use super::frontier::{Frontier, FrontierEntry};
use super::{CancelFlag, TraceSession};
use crate::chain::{ChainDataProvider, ProviderError};
use crate::patterns::{CycleDetector, DetectorConfig, RiskScorer, HIGH_RISK_THRESHOLD};
use crate::types::{
    Cycle, Edge, EventPayload, Node, NodeStatus, OutputRef, RiskTarget, ScriptType, SessionStatus,
    TraceError, TraceEvent, TraceSummary, Transaction, UnresolvedReason,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries after the first attempt when the provider is unavailable.
    pub max_retries: u32,
    /// Base delay for exponential backoff (ms).
    pub base_backoff_ms: u64,
    pub candidates: CandidateConfig,
    pub detector: DetectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 250,
            candidates: CandidateConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

/// Why the traversal loop stopped early.
#[derive(Debug)]
enum Halt {
    Cancelled,
    /// Nobody is left to receive events.
    Disconnected,
    Failed(String),
}

impl From<TraceError> for Halt {
    fn from(e: TraceError) -> Self {
        match e {
            TraceError::SessionCancelled => Halt::Cancelled,
            TraceError::InternalInvariant(m) => Halt::Failed(m),
            other => Halt::Failed(other.to_string()),
        }
    }
}

impl Halt {
    fn into_terminal(self) -> (SessionStatus, Option<String>) {
        match self {
            Halt::Cancelled => (SessionStatus::Cancelled, Some("cancelled by request".to_string())),
            Halt::Disconnected => (SessionStatus::Cancelled, Some("event channel closed".to_string())),
            Halt::Failed(m) => (SessionStatus::Failed, Some(m)),
        }
    }
}

/// Outcome of fetching an owning transaction.
enum Lookup {
    Found(Arc<Transaction>),
    NotFound,
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TraversalEngine {
    provider: Arc<dyn ChainDataProvider>,
    generator: CandidateGenerator,
    detector: CycleDetector,
    scorer: RiskScorer,
    max_retries: u32,
    base_backoff_ms: u64,
    events: mpsc::Sender<TraceEvent>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl TraversalEngine {
    pub fn new(
        provider: Arc<dyn ChainDataProvider>,
        config: EngineConfig,
        scorer: RiskScorer,
        events: mpsc::Sender<TraceEvent>,
        status: Arc<watch::Sender<SessionStatus>>,
    ) -> Self {
        Self {
            provider,
            generator: CandidateGenerator::new(config.candidates),
            detector: CycleDetector::new(config.detector),
            scorer,
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            events,
            status,
        }
    }

    /// Run the session to completion and emit its terminal event.
    pub async fn run(mut self, mut session: TraceSession) -> SessionStatus {
        let started = Instant::now();
        self.status.send_replace(SessionStatus::Running);
        info!(
            session = %session.id,
            root = %session.params.root,
            depth_limit = session.params.depth_limit,
            cutoff = session.params.confidence_cutoff,
            provider = self.provider.name(),
            "Trace started"
        );

        let outcome = match self.traverse(&mut session).await {
            Ok(()) => self.final_sweep(&mut session).await,
            Err(halt) => Err(halt),
        };
        let (status, reason) = match outcome {
            Ok(()) => (SessionStatus::Completed, None),
            Err(halt) => halt.into_terminal(),
        };

        let summary = self.summary(&session);
        self.status.send_replace(status);
        info!(
            session = %session.id,
            status = %status,
            nodes = summary.nodes,
            edges = summary.edges,
            cycles = summary.cycles,
            high_risk = summary.high_risk_cycles,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Trace finished"
        );

        let terminal = EventPayload::SessionTerminal {
            status,
            reason,
            summary,
        };
        if self.emit_terminal(&session, terminal).await.is_err() {
            debug!(session = %session.id, "Terminal event dropped, no listeners");
        }
        status
    }

    async fn traverse(&mut self, session: &mut TraceSession) -> Result<(), Halt> {
        let mut frontier = Frontier::new();
        frontier.push(FrontierEntry {
            confidence: 1.0,
            depth: 0,
            seq: 0,
            output: session.params.root.clone(),
            path: Arc::from(Vec::new()),
            via: None,
        });

        loop {
            if session.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let Some(entry) = frontier.pop() else {
                return Ok(());
            };

            if session.graph.contains(&entry.output) {
                if let Some((child, weight)) = &entry.via {
                    self.record_join(session, child, &entry.output, *weight).await?;
                }
                continue;
            }

            self.visit(session, &mut frontier, entry).await?;
        }
    }

    /// Fetch, record and expand one newly dequeued output.
    async fn visit(
        &mut self,
        session: &mut TraceSession,
        frontier: &mut Frontier,
        entry: FrontierEntry,
    ) -> Result<(), Halt> {
        let lookup = self.fetch(&session.cancel, &entry.output.txid).await?;

        let mut node = Node {
            output: entry.output.clone(),
            addresses: Vec::new(),
            depth: entry.depth,
            confidence: entry.confidence,
            value: 0,
            script_type: ScriptType::Unknown,
            block_time: None,
            discovered_from: entry.via.as_ref().map(|(child, _)| child.clone()),
            status: NodeStatus::NotFound,
            untraced_mass: 0.0,
            risk: 0.0,
        };
        let mut candidates = CandidateSet::default();

        match lookup {
            Lookup::Found(tx) => {
                node.block_time = tx.block_time;
                if let Some(out) = tx.output(entry.output.index) {
                    node.addresses = out.address.iter().cloned().collect();
                    node.value = out.value;
                    node.script_type = out.script_type;
                    node.status = if tx.is_coinbase() {
                        NodeStatus::Coinbase
                    } else if entry.depth >= session.params.depth_limit {
                        NodeStatus::unresolved(UnresolvedReason::DepthLimit)
                    } else if entry.confidence < session.params.confidence_cutoff {
                        NodeStatus::unresolved(UnresolvedReason::BelowConfidence)
                    } else {
                        candidates = self.generator.generate(&tx, entry.output.index);
                        node.untraced_mass = candidates.residual;
                        NodeStatus::Expanded
                    };
                }
            }
            Lookup::NotFound => {}
            Lookup::Unavailable(error) => {
                warn!(session = %session.id, output = %entry.output, error = %error, "Branch unresolved, provider unavailable");
                node.status = NodeStatus::unresolved(UnresolvedReason::ProviderUnavailable);
            }
        }

        session.graph.insert_node(node.clone())?;
        debug!(
            session = %session.id,
            output = %node.output,
            depth = node.depth,
            confidence = node.confidence,
            status = ?node.status,
            candidates = candidates.candidates.len(),
            "Node discovered"
        );
        self.emit(session, EventPayload::NodeDiscovered { node: node.clone() }).await?;

        let mut growth = 1;
        if let Some((child, weight)) = &entry.via {
            let edge = Edge {
                child: child.clone(),
                parent: node.output.clone(),
                weight: *weight,
                join: false,
            };
            if session.graph.add_edge(edge.clone())? {
                self.emit(session, EventPayload::EdgeAdded { edge }).await?;
                growth += 1;
            }
        }

        let recurrences = self.detector.on_node(&session.graph, &node, &entry.path);
        self.publish(session, recurrences).await?;
        let components = self.detector.on_growth(&session.graph, growth);
        self.publish(session, components).await?;

        if !candidates.is_empty() {
            let mut path = entry.path.to_vec();
            path.push(node.output.clone());
            let path: Arc<[OutputRef]> = Arc::from(path);

            for candidate in candidates.candidates {
                frontier.push(FrontierEntry {
                    confidence: entry.confidence * candidate.weight,
                    depth: entry.depth + 1,
                    seq: 0,
                    output: candidate.parent,
                    path: path.clone(),
                    via: Some((node.output.clone(), candidate.weight)),
                });
            }
        }

        Ok(())
    }

    /// A visited output was reached again through another child.
    async fn record_join(
        &mut self,
        session: &mut TraceSession,
        child: &OutputRef,
        parent: &OutputRef,
        weight: f64,
    ) -> Result<(), Halt> {
        let edge = Edge {
            child: child.clone(),
            parent: parent.clone(),
            weight,
            join: true,
        };
        if !session.graph.add_edge(edge.clone())? {
            return Ok(());
        }
        debug!(session = %session.id, child = %child, parent = %parent, "Join edge");
        self.emit(session, EventPayload::EdgeAdded { edge: edge.clone() }).await?;

        let walks = self.detector.on_edge(&session.graph, &edge);
        self.publish(session, walks).await?;
        let components = self.detector.on_growth(&session.graph, 1);
        self.publish(session, components).await
    }

    async fn final_sweep(&mut self, session: &mut TraceSession) -> Result<(), Halt> {
        let components = self.detector.sweep(&session.graph);
        self.publish(session, components).await
    }

    /// Score, record and emit new cycles with their risk updates.
    async fn publish(&mut self, session: &mut TraceSession, cycles: Vec<Cycle>) -> Result<(), Halt> {
        for mut cycle in cycles {
            cycle.risk_score = self.scorer.score(&cycle, &session.graph);
            info!(
                session = %session.id,
                cycle = %cycle.id,
                kind = %cycle.kind,
                members = cycle.len(),
                value = cycle.aggregate_value,
                risk = cycle.risk_score,
                "Circular pattern detected"
            );

            let id = cycle.id;
            let score = cycle.risk_score;
            let members = cycle.members.clone();
            self.detector.record(cycle.clone());

            self.emit(session, EventPayload::CyclePattern { cycle }).await?;
            self.emit(session, EventPayload::RiskUpdate { target: RiskTarget::Cycle(id), score }).await?;

            for member in members {
                if session.graph.raise_risk(&member, score) {
                    self.emit(session, EventPayload::RiskUpdate { target: RiskTarget::Node(member), score })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Fetch with retry + backoff. `NotFound` is final. Cancellation cuts
    /// a backoff short but never an in-flight lookup.
    async fn fetch(&self, cancel: &CancelFlag, txid: &str) -> Result<Lookup, Halt> {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                if cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                let delay = self.base_backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
                debug!(txid, attempt, delay_ms = delay, "Retrying transaction lookup");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Halt::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }

            match self.provider.get_transaction(txid).await {
                Ok(tx) => return Ok(Lookup::Found(tx)),
                Err(ProviderError::NotFound(_)) => return Ok(Lookup::NotFound),
                Err(ProviderError::Unavailable(e)) => {
                    warn!(txid, attempt, error = %e, "Chain data provider unavailable");
                    last_error = e;
                }
            }
        }

        Ok(Lookup::Unavailable(last_error))
    }

    /// Emit a progress event. Waiting for channel capacity gives way to
    /// cancellation, so a stalled consumer cannot pin the loop.
    async fn emit(&self, session: &TraceSession, payload: EventPayload) -> Result<(), Halt> {
        let permit = tokio::select! {
            biased;
            permit = self.events.reserve() => permit.map_err(|_| Halt::Disconnected)?,
            _ = session.cancel.cancelled() => return Err(Halt::Cancelled),
        };
        permit.send(TraceEvent {
            session_id: session.id,
            seq: session.seq.next(),
            payload,
        });
        Ok(())
    }

    async fn emit_terminal(&self, session: &TraceSession, payload: EventPayload) -> Result<(), Halt> {
        let event = TraceEvent {
            session_id: session.id,
            seq: session.seq.next(),
            payload,
        };
        self.events.send(event).await.map_err(|_| Halt::Disconnected)
    }

    fn summary(&self, session: &TraceSession) -> TraceSummary {
        let mut summary = session.graph.summary();
        let cycles = self.detector.cycles();
        summary.cycles = cycles.len();
        summary.high_risk_cycles = cycles.iter().filter(|c| c.risk_score > HIGH_RISK_THRESHOLD).count();
        summary.total_circular_value = cycles.iter().map(|c| c.aggregate_value).sum();
        if !cycles.is_empty() {
            summary.average_risk = cycles.iter().map(|c| c.risk_score).sum::<f64>() / cycles.len() as f64;
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
