//! Process graph template - immutable workflow definitions
//!
//! A [`ProcessGraph`] is the declarative template the engine executes:
//! ordered nodes, ordered edges, a non-empty entry set and a terminal set.
//! Templates are identified by `(graph_id, version)` and never mutated after
//! publication; running instances pin the version they started with.
//!
//! [`ProcessGraph::validate`] enforces the structural invariants; the
//! [`GraphBuilder`] runs validation as part of `build()` so an invalid
//! template never escapes construction.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::edge::Edge;
use crate::error::{CoreError, Result};
use crate::node::Node;

/// Publication status of a graph template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraphStatus {
    /// Under authoring; not executable
    Draft,
    /// Published and executable
    Published,
    /// Still executable for running instances, not for new ones
    Deprecated,
    /// Retired
    Archived,
}

/// An immutable process graph template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGraph {
    /// Template identifier
    pub graph_id: String,
    /// Template version; instances pin the version they started with
    pub version: u32,
    /// Ordered node set
    pub nodes: Vec<Node>,
    /// Ordered edge set
    pub edges: Vec<Edge>,
    /// Entry node ids; non-empty, disjoint from terminals
    pub entry_nodes: BTreeSet<String>,
    /// Terminal node ids; no edge may originate here
    pub terminal_nodes: BTreeSet<String>,
    /// Publication status
    pub status: GraphStatus,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProcessGraph {
    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a node by id, erroring when absent
    pub fn require_node(&self, id: &str) -> Result<&Node> {
        self.node(id).ok_or_else(|| CoreError::NodeNotFound(id.to_string()))
    }

    /// Look up an edge by id
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Look up an edge by id, erroring when absent
    pub fn require_edge(&self, id: &str) -> Result<&Edge> {
        self.edge(id).ok_or_else(|| CoreError::EdgeNotFound(id.to_string()))
    }

    /// Outbound edges of a node, in declaration order
    pub fn outbound_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// Inbound edges of a node, in declaration order
    pub fn inbound_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    /// True when the node id is a terminal
    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.terminal_nodes.contains(node_id)
    }

    /// Nodes subscribing to an event type
    pub fn subscribers(&self, event_type: &str) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.subscribes_to(event_type)).collect()
    }

    /// Validate structural invariants
    ///
    /// - node and edge ids are unique
    /// - every edge references existing nodes
    /// - no edge originates from a terminal node
    /// - the entry set is non-empty and disjoint from the terminal set
    /// - every entry reaches at least one terminal
    pub fn validate(&self) -> Result<()> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(CoreError::Validation(format!("duplicate node id '{}'", node.id)));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(CoreError::Validation(format!("duplicate edge id '{}'", edge.id)));
            }
            if !node_ids.contains(edge.source.as_str()) {
                return Err(CoreError::Validation(format!(
                    "edge '{}' references missing source '{}'",
                    edge.id, edge.source
                )));
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(CoreError::Validation(format!(
                    "edge '{}' references missing target '{}'",
                    edge.id, edge.target
                )));
            }
            if self.terminal_nodes.contains(&edge.source) {
                return Err(CoreError::Validation(format!(
                    "edge '{}' originates from terminal node '{}'",
                    edge.id, edge.source
                )));
            }
        }

        if self.entry_nodes.is_empty() {
            return Err(CoreError::Validation("entry node set is empty".to_string()));
        }
        for entry in &self.entry_nodes {
            if !node_ids.contains(entry.as_str()) {
                return Err(CoreError::Validation(format!("entry node '{}' does not exist", entry)));
            }
            if self.terminal_nodes.contains(entry) {
                return Err(CoreError::Validation(format!(
                    "node '{}' is both entry and terminal",
                    entry
                )));
            }
        }
        for terminal in &self.terminal_nodes {
            if !node_ids.contains(terminal.as_str()) {
                return Err(CoreError::Validation(format!(
                    "terminal node '{}' does not exist",
                    terminal
                )));
            }
        }

        for entry in &self.entry_nodes {
            if !self.reaches_terminal(entry) {
                return Err(CoreError::Validation(format!(
                    "entry node '{}' cannot reach any terminal",
                    entry
                )));
            }
        }

        Ok(())
    }

    fn reaches_terminal(&self, from: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if self.terminal_nodes.contains(id) {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            for edge in self.outbound_edges(id) {
                queue.push_back(edge.target.as_str());
            }
        }
        false
    }

    /// Builder for incremental construction
    pub fn builder(graph_id: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(graph_id)
    }
}

/// Fluent builder for [`ProcessGraph`]
///
/// `build()` validates the assembled template, so callers can rely on any
/// [`ProcessGraph`] obtained from the builder being structurally sound.
///
/// ```rust
/// use cpg_core::edge::Edge;
/// use cpg_core::graph::ProcessGraph;
/// use cpg_core::node::{ActionSpec, Node};
///
/// let graph = ProcessGraph::builder("onboarding")
///     .node(Node::new("intake", ActionSpec::system("intake")))
///     .node(Node::new("done", ActionSpec::wait()))
///     .edge(Edge::new("e1", "intake", "done"))
///     .entry("intake")
///     .terminal("done")
///     .build()
///     .unwrap();
/// assert_eq!(graph.nodes.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: ProcessGraph,
}

impl GraphBuilder {
    /// Start building a published version-1 graph
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self {
            graph: ProcessGraph {
                graph_id: graph_id.into(),
                version: 1,
                nodes: Vec::new(),
                edges: Vec::new(),
                entry_nodes: BTreeSet::new(),
                terminal_nodes: BTreeSet::new(),
                status: GraphStatus::Published,
                metadata: HashMap::new(),
            },
        }
    }

    /// Set the template version
    pub fn version(mut self, version: u32) -> Self {
        self.graph.version = version;
        self
    }

    /// Set the publication status
    pub fn status(mut self, status: GraphStatus) -> Self {
        self.graph.status = status;
        self
    }

    /// Add a node
    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.push(node);
        self
    }

    /// Add an edge
    pub fn edge(mut self, edge: Edge) -> Self {
        self.graph.edges.push(edge);
        self
    }

    /// Mark a node id as an entry
    pub fn entry(mut self, node_id: impl Into<String>) -> Self {
        self.graph.entry_nodes.insert(node_id.into());
        self
    }

    /// Mark a node id as a terminal
    pub fn terminal(mut self, node_id: impl Into<String>) -> Self {
        self.graph.terminal_nodes.insert(node_id.into());
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.graph.metadata.insert(key.into(), value);
        self
    }

    /// Validate and finish building
    pub fn build(self) -> Result<ProcessGraph> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ActionSpec;

    fn linear() -> GraphBuilder {
        ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("b", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::new("e1", "a", "b"))
            .edge(Edge::new("e2", "b", "t"))
            .entry("a")
            .terminal("t")
    }

    #[test]
    fn valid_linear_graph_builds() {
        let graph = linear().build().unwrap();
        assert_eq!(graph.outbound_edges("a").len(), 1);
        assert_eq!(graph.inbound_edges("t").len(), 1);
        assert!(graph.is_terminal("t"));
        assert!(graph.node("b").is_some());
    }

    #[test]
    fn dangling_edge_rejected() {
        let err = linear().edge(Edge::new("e3", "b", "ghost")).build().unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn edge_from_terminal_rejected() {
        let err = linear().edge(Edge::new("e3", "t", "a")).build().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("terminal"), "unexpected message: {msg}");
    }

    #[test]
    fn empty_entry_set_rejected() {
        let err = ProcessGraph::builder("g")
            .node(Node::new("t", ActionSpec::wait()))
            .terminal("t")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("entry"));
    }

    #[test]
    fn entry_terminal_overlap_rejected() {
        let err = ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::new("e1", "a", "t"))
            .entry("a")
            .entry("t")
            .terminal("t")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("both entry and terminal"));
    }

    #[test]
    fn unreachable_terminal_rejected() {
        let err = ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .entry("a")
            .terminal("t")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cannot reach"));
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let err = linear().node(Node::new("a", ActionSpec::wait())).build().unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn subscribers_found_by_event_type() {
        let graph = ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::builder("b").subscribe("Ping").build())
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::new("e1", "a", "b"))
            .edge(Edge::new("e2", "b", "t"))
            .entry("a")
            .terminal("t")
            .build()
            .unwrap();
        let subs = graph.subscribers("Ping");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, "b");
    }
}
