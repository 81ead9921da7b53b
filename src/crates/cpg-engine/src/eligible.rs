//! Eligible space assembly
//!
//! The first half of every step: which nodes *could* execute right now?
//! With nothing active, the candidates are the entry nodes not yet
//! completed. Otherwise they are the currently active nodes plus the
//! targets of pending edges whose join requirement is now satisfied. Every
//! candidate carries its full availability evaluation so the selector and
//! the trace see exactly why a node was in or out.

use serde_json::{Map, Value};

use cpg_core::edge::{Edge, ExecutionSemantics, JoinPolicy};
use cpg_core::eval::{EvaluatorKernel, NodeEvaluation};
use cpg_core::graph::ProcessGraph;
use cpg_core::instance::ProcessInstance;
use cpg_core::trace::NodeConsideration;

/// How a candidate entered the eligible space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// Entry node of a freshly started instance
    Entry,
    /// Activated by a traversed edge
    EdgeTraversal,
    /// Activated by an event subscription
    EventActivation,
    /// Pending edge whose join requirement is now satisfied
    PendingJoin,
}

/// One node that could execute this step
#[derive(Debug, Clone)]
pub struct CandidateNode {
    /// Node id
    pub node_id: String,
    /// Selection priority; edge-derived candidates carry the maximum
    /// weight of their traversed inbound edges
    pub priority: i64,
    /// How the candidate got here
    pub origin: CandidateOrigin,
    /// True when the candidate arrived over parallel-semantics edges
    pub parallel: bool,
    /// Availability evaluation
    pub evaluation: NodeEvaluation,
}

/// The assembled eligible space for one step
#[derive(Debug, Clone, Default)]
pub struct EligibleSpace {
    /// Candidates, available or blocked
    pub candidates: Vec<CandidateNode>,
}

impl EligibleSpace {
    /// Trace rows for every considered node
    pub fn considerations(&self) -> Vec<NodeConsideration> {
        self.candidates
            .iter()
            .map(|c| NodeConsideration {
                node_id: c.node_id.clone(),
                available: c.evaluation.available,
                reason: c.evaluation.reason(),
            })
            .collect()
    }
}

/// Whether a subscribed node may activate
///
/// A node subscribing to events is gated on them: it does not activate off
/// an inbound edge until at least one subscribed event type has been
/// delivered. Nodes without subscriptions are always open.
pub fn event_gate_open(node: &cpg_core::node::Node, instance: &ProcessInstance) -> bool {
    node.event_config.subscribes.is_empty()
        || node
            .event_config
            .subscribes
            .iter()
            .any(|s| instance.context.has_event(&s.event_type))
}

/// Whether a pending edge set satisfies the target's join policy
///
/// The join policy is read from the target's inbound parallel edges; a
/// target without parallel inbound edges joins on any single pending edge.
pub fn join_satisfied(graph: &ProcessGraph, instance: &ProcessInstance, target: &str) -> bool {
    let inbound = graph.inbound_edges(target);
    let parallel: Vec<&&Edge> = inbound
        .iter()
        .filter(|e| e.semantics.is_parallel())
        .collect();

    let pending_inbound = inbound
        .iter()
        .filter(|e| instance.pending_edge_ids.contains(&e.id))
        .count();

    if parallel.is_empty() {
        return pending_inbound >= 1;
    }

    let pending_parallel = parallel
        .iter()
        .filter(|e| instance.pending_edge_ids.contains(&e.id))
        .count();
    let policy = match parallel[0].semantics {
        ExecutionSemantics::Parallel { join } => join,
        _ => JoinPolicy::All,
    };

    match policy {
        JoinPolicy::All => pending_parallel == parallel.len(),
        JoinPolicy::Any => pending_parallel >= 1,
        JoinPolicy::NOfM { n } => pending_parallel >= n as usize,
    }
}

fn inbound_priority(graph: &ProcessGraph, instance: &ProcessInstance, node_id: &str) -> (i64, bool) {
    let mut priority = 0i64;
    let mut parallel = false;
    for edge in graph.inbound_edges(node_id) {
        let relevant = instance.traversed_edge_ids.contains(&edge.id)
            || instance.pending_edge_ids.contains(&edge.id);
        if relevant {
            priority = priority.max(edge.priority.weight as i64);
            parallel = parallel || edge.semantics.is_parallel();
        }
    }
    (priority, parallel)
}

/// Assemble the eligible space for one step
pub async fn build(
    graph: &ProcessGraph,
    instance: &ProcessInstance,
    kernel: &EvaluatorKernel,
    scope: &Map<String, Value>,
) -> EligibleSpace {
    let mut space = EligibleSpace::default();
    let completed = instance.completed_node_ids();

    if instance.active_node_ids.is_empty() {
        // no active work: entry nodes not already completed are candidates
        for entry in &graph.entry_nodes {
            if completed.contains(entry.as_str()) {
                continue;
            }
            let Some(node) = graph.node(entry) else { continue };
            let evaluation = kernel.evaluate_node(node, scope).await;
            space.candidates.push(CandidateNode {
                node_id: entry.clone(),
                priority: 0,
                origin: CandidateOrigin::Entry,
                parallel: false,
                evaluation,
            });
        }
    } else {
        // active nodes carry the weight of the edges that activated them
        for node_id in &instance.active_node_ids {
            let Some(node) = graph.node(node_id) else { continue };
            let evaluation = kernel.evaluate_node(node, scope).await;
            let (priority, parallel) = inbound_priority(graph, instance, node_id);
            space.candidates.push(CandidateNode {
                node_id: node_id.clone(),
                priority,
                origin: CandidateOrigin::EdgeTraversal,
                parallel,
                evaluation,
            });
        }
    }

    // pending-edge targets whose join requirement is now satisfied
    let mut pending_targets: Vec<&str> = instance
        .pending_edge_ids
        .iter()
        .filter_map(|edge_id| graph.edge(edge_id).map(|e| e.target.as_str()))
        .collect();
    pending_targets.sort_unstable();
    pending_targets.dedup();

    for target in pending_targets {
        if instance.active_node_ids.contains(target)
            || completed.contains(target)
            || space.candidates.iter().any(|c| c.node_id == target)
        {
            continue;
        }
        if !join_satisfied(graph, instance, target) {
            continue;
        }
        let Some(node) = graph.node(target) else { continue };
        if !event_gate_open(node, instance) {
            continue;
        }
        let evaluation = kernel.evaluate_node(node, scope).await;
        let (priority, parallel) = inbound_priority(graph, instance, target);
        space.candidates.push(CandidateNode {
            node_id: target.to_string(),
            priority,
            origin: CandidateOrigin::PendingJoin,
            parallel,
            evaluation,
        });
    }

    space
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpg_core::context::ExecutionContext;
    use cpg_core::edge::{Edge, JoinPolicy};
    use cpg_core::node::{ActionSpec, Node};
    use cpg_core::shim::{
        DecisionBackedPolicyEvaluator, DecisionBackedRuleEvaluator, PathExpressionEvaluator,
        TableDecisionEvaluator,
    };
    use std::sync::Arc;

    fn kernel() -> EvaluatorKernel {
        let decisions = Arc::new(TableDecisionEvaluator::new());
        EvaluatorKernel::new(
            Arc::new(PathExpressionEvaluator::new()),
            Arc::new(DecisionBackedPolicyEvaluator::new(decisions.clone())),
            Arc::new(DecisionBackedRuleEvaluator::new(decisions)),
        )
    }

    fn fan_in_graph() -> ProcessGraph {
        ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("b", ActionSpec::wait()))
            .node(Node::new("c", ActionSpec::wait()))
            .node(Node::new("d", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::builder("a-b", "a", "b").parallel(JoinPolicy::All).build())
            .edge(Edge::builder("a-c", "a", "c").parallel(JoinPolicy::All).build())
            .edge(Edge::builder("b-d", "b", "d").parallel(JoinPolicy::All).build())
            .edge(Edge::builder("c-d", "c", "d").parallel(JoinPolicy::All).build())
            .edge(Edge::new("d-t", "d", "t"))
            .entry("a")
            .terminal("t")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_instance_yields_entry_candidates() {
        let graph = fan_in_graph();
        let instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        let space = build(&graph, &instance, &kernel(), &instance.context.scope()).await;

        assert_eq!(space.candidates.len(), 1);
        assert_eq!(space.candidates[0].node_id, "a");
        assert_eq!(space.candidates[0].origin, CandidateOrigin::Entry);
        assert!(space.candidates[0].evaluation.available);
    }

    #[tokio::test]
    async fn active_nodes_are_candidates() {
        let graph = fan_in_graph();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.active_node_ids.insert("b".to_string());
        instance.active_node_ids.insert("c".to_string());
        instance.traversed_edge_ids.push("a-b".to_string());
        instance.traversed_edge_ids.push("a-c".to_string());

        let space = build(&graph, &instance, &kernel(), &instance.context.scope()).await;
        let ids: Vec<&str> = space.candidates.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(space.candidates.iter().all(|c| c.parallel));
    }

    #[tokio::test]
    async fn all_join_waits_for_every_parallel_edge() {
        let graph = fan_in_graph();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        // b finished and its edge to d is pending; c not yet
        instance.active_node_ids.insert("c".to_string());
        instance.pending_edge_ids.insert("b-d".to_string());

        assert!(!join_satisfied(&graph, &instance, "d"));

        instance.pending_edge_ids.insert("c-d".to_string());
        assert!(join_satisfied(&graph, &instance, "d"));
    }

    #[tokio::test]
    async fn satisfied_join_target_becomes_candidate() {
        let graph = fan_in_graph();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.record_execution(cpg_core::instance::NodeExecution::completed(
            "b",
            chrono::Utc::now(),
            serde_json::json!({}),
        ));
        instance.pending_edge_ids.insert("b-d".to_string());
        instance.pending_edge_ids.insert("c-d".to_string());

        let space = build(&graph, &instance, &kernel(), &instance.context.scope()).await;
        let candidate = space
            .candidates
            .iter()
            .find(|c| c.node_id == "d")
            .expect("d is a candidate");
        assert_eq!(candidate.origin, CandidateOrigin::PendingJoin);
        assert!(candidate.parallel);
    }

    #[tokio::test]
    async fn completed_entries_are_not_candidates() {
        let graph = fan_in_graph();
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.record_execution(cpg_core::instance::NodeExecution::completed(
            "a",
            chrono::Utc::now(),
            serde_json::json!({}),
        ));

        let space = build(&graph, &instance, &kernel(), &instance.context.scope()).await;
        assert!(space.candidates.is_empty());
    }
}
