//! End-to-end trace scenarios driven through `SessionManager`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use satoshi_tracer::chain::{ChainDataProvider, MemoryChain};
use satoshi_tracer::patterns::{AddressList, RiskWeights};
use satoshi_tracer::session::{EventStream, SessionConfig, SessionManager};
use satoshi_tracer::trace::EngineConfig;
use satoshi_tracer::types::{
    Cycle, CycleKind, Edge, EventPayload, Node, NodeStatus, OutputRef, SessionStatus, TraceEvent,
    TraceSummary, UnresolvedReason,
};

use crate::mock_chain::{diamond_chain, linear_chain, make_tx, mixing_chain, outpoint, FlakyChain};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_manager(provider: Arc<dyn ChainDataProvider>, max_retries: u32) -> SessionManager {
    make_manager_with(provider, max_retries, SessionConfig::default())
}

fn make_manager_with(
    provider: Arc<dyn ChainDataProvider>,
    max_retries: u32,
    config: SessionConfig,
) -> SessionManager {
    SessionManager::new(
        provider,
        Arc::new(AddressList::default()),
        RiskWeights::default(),
        EngineConfig {
            max_retries,
            base_backoff_ms: 1,
            ..EngineConfig::default()
        },
        config,
    )
}

async fn drain(mut stream: EventStream) -> Vec<TraceEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

fn nodes(events: &[TraceEvent]) -> Vec<&Node> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::NodeDiscovered { node } => Some(node),
            _ => None,
        })
        .collect()
}

fn edges(events: &[TraceEvent]) -> Vec<&Edge> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::EdgeAdded { edge } => Some(edge),
            _ => None,
        })
        .collect()
}

fn cycles(events: &[TraceEvent]) -> Vec<&Cycle> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CyclePattern { cycle } => Some(cycle),
            _ => None,
        })
        .collect()
}

fn terminal(events: &[TraceEvent]) -> (SessionStatus, &TraceSummary) {
    match &events.last().expect("no events").payload {
        EventPayload::SessionTerminal { status, summary, .. } => (*status, summary),
        other => panic!("last event is not terminal: {}", other.kind()),
    }
}

fn assert_well_ordered(events: &[TraceEvent]) {
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
    let terminals = events.iter().filter(|e| e.payload.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().payload.is_terminal());
}

/// Structural properties every completed trace must satisfy.
fn assert_trace_invariants(events: &[TraceEvent]) {
    let found = nodes(events);
    let by_ref: HashMap<&OutputRef, &Node> = found.iter().map(|n| (&n.output, *n)).collect();
    assert_eq!(by_ref.len(), found.len(), "an output was discovered twice");

    let discovery: HashMap<(&OutputRef, &OutputRef), f64> = edges(events)
        .into_iter()
        .filter(|e| !e.join)
        .map(|e| ((&e.child, &e.parent), e.weight))
        .collect();

    for node in &found {
        let Some(child) = &node.discovered_from else {
            assert_eq!(node.depth, 0, "only the root lacks a discovering node");
            continue;
        };
        let from = by_ref[child];
        assert_eq!(node.depth, from.depth + 1, "depth of {}", node.output);

        let weight = discovery[&(child, &node.output)];
        assert!(weight > 0.0 && weight <= 1.0);
        assert!(
            node.confidence <= from.confidence * weight + 1e-9,
            "confidence of {} exceeds its discovering path",
            node.output
        );
    }

    for edge in edges(events) {
        assert!(by_ref.contains_key(&edge.child) && by_ref.contains_key(&edge.parent));
    }
    for cycle in cycles(events) {
        assert!(cycle.members.iter().all(|m| by_ref.contains_key(m)), "{cycle}");
    }
}

/// Node and edge payloads in emission order.
fn topology(events: &[TraceEvent]) -> Vec<EventPayload> {
    events
        .iter()
        .filter(|e| {
            matches!(
                e.payload,
                EventPayload::NodeDiscovered { .. } | EventPayload::EdgeAdded { .. }
            )
        })
        .map(|e| e.payload.clone())
        .collect()
}

fn recurrence_chain() -> MemoryChain {
    // A(X) <- B(Y) <- C(Z) <- D(X, coinbase)
    MemoryChain::from_transactions(vec![
        make_tx(1, &[2], &[90_000], Some("bc1qrecurring")),
        make_tx(2, &[3], &[95_000], Some("bc1qhopone")),
        make_tx(3, &[4], &[98_000], Some("bc1qhoptwo")),
        make_tx(4, &[], &[100_000], Some("bc1qrecurring")),
    ])
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_root_funded_by_coinbase() {
    let chain = MemoryChain::from_transactions(vec![
        make_tx(1, &[], &[625_000_000], Some("bc1qminer")),
        make_tx(2, &[1], &[600_000_000], Some("bc1qpayee")),
    ]);
    let manager = make_manager(Arc::new(chain), 0);
    let (_, stream) = manager.start_attached(outpoint(2), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 2);
    assert_eq!(found[1].depth, 1);
    assert_eq!(found[1].status, NodeStatus::Coinbase);
    assert_eq!(edges(&events).len(), 1);
    assert!(cycles(&events).is_empty());

    let (status, summary) = terminal(&events);
    assert_eq!(status, SessionStatus::Completed);
    assert_eq!(summary.nodes, 2);
    assert_eq!(summary.edges, 1);
    assert_eq!(summary.coinbase_leaves, 1);
}

#[tokio::test]
async fn test_mixing_transaction_splits_confidence_breadth_first() {
    let manager = make_manager(Arc::new(mixing_chain()), 0);
    let (_, stream) = manager.start_attached(outpoint(10), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 13);

    let depths: Vec<u32> = found.iter().map(|n| n.depth).collect();
    assert_eq!(depths, vec![0, 1, 2, 3, 3, 3, 3, 3, 4, 4, 4, 4, 4]);
    for node in &found[3..8] {
        assert!((node.confidence - 0.2).abs() < 1e-9);
        assert_eq!(node.discovered_from, Some(outpoint(12)));
    }
    for node in &found[8..] {
        assert_eq!(node.status, NodeStatus::Coinbase);
    }
    assert_eq!(terminal(&events).0, SessionStatus::Completed);
}

#[tokio::test]
async fn test_address_recurrence_reports_path_members() {
    let manager = make_manager(Arc::new(recurrence_chain()), 0);
    let (_, stream) = manager.start_attached(outpoint(1), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = cycles(&events);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, CycleKind::AddressRecurrence);

    let members: HashSet<_> = found[0].members.iter().cloned().collect();
    let expected: HashSet<_> = [outpoint(1), outpoint(2), outpoint(3)].into_iter().collect();
    assert_eq!(members, expected);
    assert_eq!(found[0].trigger, Some(outpoint(4)));
    assert!(found[0].addresses.contains("bc1qrecurring"));

    let (status, summary) = terminal(&events);
    assert_eq!(status, SessionStatus::Completed);
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.total_circular_value, 90_000 + 95_000 + 98_000);

    // the cycle's risk reaches each member node
    let risk_updates = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::RiskUpdate { .. }))
        .count();
    assert!(risk_updates >= 1);
}

#[tokio::test]
async fn test_depth_limit_on_linear_chain() {
    let manager = make_manager(Arc::new(linear_chain(10)), 0);
    let (_, stream) = manager.start_attached(outpoint(10), Some(3), None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 4);
    assert_eq!(found.iter().map(|n| n.depth).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(found[3].status, NodeStatus::unresolved(UnresolvedReason::DepthLimit));

    let (status, summary) = terminal(&events);
    assert_eq!(status, SessionStatus::Completed);
    assert_eq!(summary.unresolved_leaves, 1);
    assert_eq!(summary.max_depth, 3);
}

#[tokio::test]
async fn test_cancel_mid_traversal() {
    let provider = FlakyChain::new(linear_chain(200)).with_delay(Duration::from_millis(5));
    let manager = make_manager(Arc::new(provider), 0);
    let (id, mut stream) = manager.start_attached(outpoint(200), Some(100), None).unwrap();

    let mut events = Vec::new();
    let mut seen_nodes = 0;
    while let Some(event) = stream.recv().await {
        if matches!(event.payload, EventPayload::NodeDiscovered { .. }) {
            seen_nodes += 1;
        }
        events.push(event);
        if seen_nodes == 3 {
            manager.cancel(id).unwrap();
            break;
        }
    }
    events.extend(drain(stream).await);

    assert_well_ordered(&events);
    let (status, _) = terminal(&events);
    assert_eq!(status, SessionStatus::Cancelled);
    assert!(nodes(&events).len() < 100);
    assert_eq!(manager.wait(id).await.unwrap(), SessionStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_with_stalled_subscriber() {
    let config = SessionConfig {
        event_buffer: 1,
        subscriber_buffer: 1,
        ..SessionConfig::default()
    };
    let provider = FlakyChain::new(linear_chain(200)).with_delay(Duration::from_millis(1));
    let manager = make_manager_with(Arc::new(provider), 0, config);

    // held but never read
    let (id, mut stalled) = manager.start_attached(outpoint(200), Some(100), None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.status(id).unwrap(), SessionStatus::Running);

    manager.cancel(id).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), manager.wait(id))
        .await
        .expect("cancellation blocked by a stalled subscriber")
        .unwrap();
    assert_eq!(status, SessionStatus::Cancelled);

    let recent = manager.recent_events(id).unwrap();
    assert!(recent.last().unwrap().payload.is_terminal());

    // the stalled stream was cut off and now ends
    let leftover = tokio::time::timeout(Duration::from_secs(1), async {
        let mut n = 0;
        while stalled.recv().await.is_some() {
            n += 1;
        }
        n
    })
    .await
    .unwrap();
    assert!(leftover <= 1);
}

// ---------------------------------------------------------------------------
// Trace invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_is_deterministic() {
    for chain in [mixing_chain, diamond_chain] {
        let manager = make_manager(Arc::new(chain()), 0);
        let (first, a) = manager.start_attached(outpoint(10), None, None).unwrap();
        let events_a = drain(a).await;
        let (second, b) = manager.start_attached(outpoint(10), None, None).unwrap();
        let events_b = drain(b).await;

        assert_ne!(first, second);
        assert!(!topology(&events_a).is_empty());
        assert_eq!(topology(&events_a), topology(&events_b));
        assert_eq!(terminal(&events_a).1.nodes, terminal(&events_b).1.nodes);
    }
}

#[tokio::test]
async fn test_invariants_hold_across_fixtures() {
    let fixtures = [
        (mixing_chain(), outpoint(10)),
        (diamond_chain(), outpoint(10)),
        (recurrence_chain(), outpoint(1)),
        (linear_chain(12), outpoint(12)),
    ];
    for (chain, root) in fixtures {
        let manager = make_manager(Arc::new(chain), 0);
        let (_, stream) = manager.start_attached(root, None, None).unwrap();
        let events = drain(stream).await;

        assert_well_ordered(&events);
        assert_eq!(terminal(&events).0, SessionStatus::Completed);
        assert_trace_invariants(&events);
    }
}

#[tokio::test]
async fn test_diamond_records_join_edge() {
    let manager = make_manager(Arc::new(diamond_chain()), 0);
    let (_, stream) = manager.start_attached(outpoint(10), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 5);
    let shared: Vec<&Node> = found.iter().copied().filter(|n| n.output == outpoint(13)).collect();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].depth, 2);
    assert!((shared[0].confidence - 0.5).abs() < 1e-9);

    let joins: Vec<&Edge> = edges(&events).into_iter().filter(|e| e.join).collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].parent, outpoint(13));
    assert_eq!(terminal(&events).1.edges, 5);
}

// ---------------------------------------------------------------------------
// Provider failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let provider = Arc::new(FlakyChain::new(linear_chain(4)).with_failures(2));
    let manager = make_manager(provider.clone(), 3);
    let (_, stream) = manager.start_attached(outpoint(4), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 4);
    assert_eq!(found[3].status, NodeStatus::Coinbase);
    assert_eq!(provider.calls(), 4 * 3);
}

#[tokio::test]
async fn test_exhausted_retries_complete_with_unresolved_leaf() {
    let provider = FlakyChain::new(linear_chain(4)).with_failures(10);
    let manager = make_manager(Arc::new(provider), 2);
    let (_, stream) = manager.start_attached(outpoint(4), None, None).unwrap();
    let events = drain(stream).await;

    assert_well_ordered(&events);
    let found = nodes(&events);
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].status,
        NodeStatus::unresolved(UnresolvedReason::ProviderUnavailable)
    );

    let (status, summary) = terminal(&events);
    assert_eq!(status, SessionStatus::Completed);
    assert_eq!(summary.unresolved_leaves, 1);
    assert_eq!(summary.coinbase_leaves, 0);
}

// ---------------------------------------------------------------------------
// Session isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let chain: Arc<dyn ChainDataProvider> = Arc::new(linear_chain(6));
    let manager = make_manager(chain, 0);

    let (a, stream_a) = manager.start_attached(outpoint(6), None, None).unwrap();
    let (b, stream_b) = manager.start_attached(outpoint(3), None, None).unwrap();
    let (events_a, events_b) = tokio::join!(drain(stream_a), drain(stream_b));

    assert_well_ordered(&events_a);
    assert_well_ordered(&events_b);
    assert!(events_a.iter().all(|e| e.session_id == a));
    assert!(events_b.iter().all(|e| e.session_id == b));
    assert_eq!(nodes(&events_a).len(), 6);
    assert_eq!(nodes(&events_b).len(), 3);
}

#[tokio::test]
async fn test_late_subscriber_after_completion() {
    let manager = make_manager(Arc::new(linear_chain(2)), 0);
    let id = manager.start(outpoint(2), None, None).unwrap();
    assert_eq!(manager.wait(id).await.unwrap(), SessionStatus::Completed);

    // hub has shut down: a fresh subscription ends at once
    let mut late = manager.events(id).unwrap();
    assert!(late.recv().await.is_none());

    let recent = manager.recent_events(id).unwrap();
    assert!(recent.last().unwrap().payload.is_terminal());
}
