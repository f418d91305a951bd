//! Explored subgraph of a session.
//!
//! Nodes are stored in a `petgraph` directed graph keyed by `OutputRef`,
//! with edges pointing from child to parent. Node indices follow discovery
//! order, which keeps every derived listing deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::types::{Edge, Node, NodeStatus, OutputRef, TraceError, TraceSummary};

#[derive(Debug, Default)]
pub struct SessionGraph {
    graph: DiGraph<Node, Edge>,
    index: HashMap<OutputRef, NodeIndex>,
    /// Number of nodes each address appears on.
    address_counts: HashMap<String, usize>,
}

impl SessionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly discovered node. Each output may be inserted once.
    pub fn insert_node(&mut self, node: Node) -> Result<(), TraceError> {
        if self.index.contains_key(&node.output) {
            return Err(TraceError::InternalInvariant(format!(
                "node {} discovered twice",
                node.output
            )));
        }
        let distinct: HashSet<&String> = node.addresses.iter().collect();
        for address in distinct {
            *self.address_counts.entry(address.clone()).or_default() += 1;
        }
        let key = node.output.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(key, idx);
        Ok(())
    }

    /// Add a child → parent edge. Returns `false` if the pair already exists.
    pub fn add_edge(&mut self, edge: Edge) -> Result<bool, TraceError> {
        let (Some(&child), Some(&parent)) = (self.index.get(&edge.child), self.index.get(&edge.parent)) else {
            return Err(TraceError::InternalInvariant(format!(
                "edge {} -> {} references an unvisited node",
                edge.child, edge.parent
            )));
        };
        if self.graph.contains_edge(child, parent) {
            return Ok(false);
        }
        self.graph.add_edge(child, parent, edge);
        Ok(true)
    }

    pub fn contains(&self, output: &OutputRef) -> bool {
        self.index.contains_key(output)
    }

    pub fn node(&self, output: &OutputRef) -> Option<&Node> {
        self.index.get(output).map(|&i| &self.graph[i])
    }

    /// Raise a node's risk annotation. Returns `true` if it increased.
    pub fn raise_risk(&mut self, output: &OutputRef, risk: f64) -> bool {
        match self.index.get(output) {
            Some(&i) if risk > self.graph[i].risk => {
                self.graph[i].risk = risk;
                true
            }
            _ => false,
        }
    }

    /// Nodes in discovery order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// How many nodes carry `address`.
    pub fn address_occurrences(&self, address: &str) -> usize {
        self.address_counts.get(address).copied().unwrap_or_default()
    }

    /// Shortest directed path `from ⇝ to` with at most `max_nodes` nodes.
    pub fn shortest_path(&self, from: &OutputRef, to: &OutputRef, max_nodes: usize) -> Option<Vec<OutputRef>> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;

        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([(start, 1usize)]);
        let mut seen = HashSet::from([start]);

        while let Some((current, len)) = queue.pop_front() {
            if current == goal {
                let mut path = vec![self.graph[current].output.clone()];
                let mut cursor = current;
                while let Some(&p) = prev.get(&cursor) {
                    path.push(self.graph[p].output.clone());
                    cursor = p;
                }
                path.reverse();
                return Some(path);
            }
            if len >= max_nodes {
                continue;
            }
            for edge in self.graph.edges_directed(current, Direction::Outgoing) {
                let next = edge.target();
                if seen.insert(next) {
                    prev.insert(next, current);
                    queue.push_back((next, len + 1));
                }
            }
        }
        None
    }

    /// Strongly connected components with more than one member, each in
    /// discovery order, ordered by their earliest member.
    pub fn strongly_connected(&self) -> Vec<Vec<OutputRef>> {
        let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|c| c.len() > 1)
            .collect();
        for c in &mut components {
            c.sort();
        }
        components.sort_by_key(|c| c[0]);
        components
            .into_iter()
            .map(|c| c.into_iter().map(|i| self.graph[i].output.clone()).collect())
            .collect()
    }

    /// Graph-level portion of the terminal summary.
    pub fn summary(&self) -> TraceSummary {
        let mut summary = TraceSummary {
            nodes: self.node_count(),
            edges: self.edge_count(),
            unique_addresses: self.address_counts.len(),
            ..TraceSummary::default()
        };
        for node in self.nodes() {
            summary.max_depth = summary.max_depth.max(node.depth);
            match node.status {
                NodeStatus::Coinbase => summary.coinbase_leaves += 1,
                NodeStatus::NotFound => summary.not_found_leaves += 1,
                NodeStatus::Unresolved { .. } => summary.unresolved_leaves += 1,
                NodeStatus::Expanded => {}
            }
        }
        summary
    }
}
