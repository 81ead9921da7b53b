//! Edge traversability evaluation and deterministic selection

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::edge::{Edge, ExecutionSemantics};
use crate::instance::NodeExecution;
use crate::ports::ExpressionEvaluator;

/// Why an edge is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeBlockKind {
    /// A context expression evaluated falsy
    Context,
    /// A rule-outcome condition did not match
    RuleOutcome,
    /// A policy-outcome condition did not match
    PolicyOutcome,
    /// An event condition did not match
    Event,
    /// The expression port errored
    EvaluatorError,
}

/// Result of evaluating an edge's traversability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvaluation {
    /// Edge id
    pub edge_id: String,
    /// Whether the edge may be traversed
    pub traversable: bool,
    /// Block category when not traversable
    #[serde(default)]
    pub block: Option<EdgeBlockKind>,
    /// Block detail
    #[serde(default)]
    pub detail: Option<String>,
}

impl EdgeEvaluation {
    fn traversable(edge_id: &str) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            traversable: true,
            block: None,
            detail: None,
        }
    }

    fn blocked(edge_id: &str, kind: EdgeBlockKind, detail: impl Into<String>) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            traversable: false,
            block: Some(kind),
            detail: Some(detail.into()),
        }
    }

    /// One-line reason for traces
    pub fn reason(&self) -> String {
        match (&self.block, &self.detail) {
            (Some(kind), Some(detail)) => format!("{:?}: {}", kind, detail),
            _ => "traversable".to_string(),
        }
    }
}

pub(super) fn evaluate_edge(
    edge: &Edge,
    scope: &Map<String, Value>,
    source_execution: Option<&NodeExecution>,
    context: &ExecutionContext,
    expressions: &dyn ExpressionEvaluator,
) -> EdgeEvaluation {
    // group 1: context expressions
    match expressions.evaluate_all_truthy(&edge.guards.context_exprs, scope) {
        Ok(true) => {}
        Ok(false) => {
            return EdgeEvaluation::blocked(&edge.id, EdgeBlockKind::Context, "context guard not satisfied");
        }
        Err(err) => {
            return EdgeEvaluation::blocked(&edge.id, EdgeBlockKind::EvaluatorError, err.to_string());
        }
    }

    // group 2: rule outcomes of the source's latest execution
    if !edge.guards.rule_outcomes.is_empty() {
        let Some(execution) = source_execution else {
            return EdgeEvaluation::blocked(
                &edge.id,
                EdgeBlockKind::RuleOutcome,
                "source has not executed",
            );
        };
        for condition in &edge.guards.rule_outcomes {
            match execution.rule_outputs.get(&condition.output_key) {
                Some(value) if *value == condition.equals => {}
                Some(value) => {
                    return EdgeEvaluation::blocked(
                        &edge.id,
                        EdgeBlockKind::RuleOutcome,
                        format!("'{}' is {}, expected {}", condition.output_key, value, condition.equals),
                    );
                }
                None => {
                    return EdgeEvaluation::blocked(
                        &edge.id,
                        EdgeBlockKind::RuleOutcome,
                        format!("'{}' not produced by source", condition.output_key),
                    );
                }
            }
        }
    }

    // group 3: policy outcomes of the source's latest execution
    if !edge.guards.policy_outcomes.is_empty() {
        let Some(execution) = source_execution else {
            return EdgeEvaluation::blocked(
                &edge.id,
                EdgeBlockKind::PolicyOutcome,
                "source has not executed",
            );
        };
        for condition in &edge.guards.policy_outcomes {
            match execution.policy_outcomes.get(&condition.decision) {
                Some(outcome) if *outcome == condition.outcome => {}
                Some(outcome) => {
                    return EdgeEvaluation::blocked(
                        &edge.id,
                        EdgeBlockKind::PolicyOutcome,
                        format!("'{}' is {:?}, expected {:?}", condition.decision, outcome, condition.outcome),
                    );
                }
                None => {
                    return EdgeEvaluation::blocked(
                        &edge.id,
                        EdgeBlockKind::PolicyOutcome,
                        format!("no outcome recorded for '{}'", condition.decision),
                    );
                }
            }
        }
    }

    // group 4: event occurrence, must-have-occurred XOR absence
    for condition in &edge.guards.event_conditions {
        let occurred = context.has_event(&condition.event_type);
        if occurred != condition.must_have_occurred {
            let detail = if condition.must_have_occurred {
                format!("event '{}' has not occurred", condition.event_type)
            } else {
                format!("event '{}' has occurred", condition.event_type)
            };
            return EdgeEvaluation::blocked(&edge.id, EdgeBlockKind::Event, detail);
        }
    }

    EdgeEvaluation::traversable(&edge.id)
}

/// Outcome of forward edge selection at one source node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSelection {
    /// Selected edge ids, in deterministic order
    pub selected: Vec<String>,
    /// Traversable edges passed over, with the reason
    pub passed_over: Vec<(String, String)>,
}

/// Select among a source node's traversable outbound edges
///
/// Compensating edges are never candidates here; they are chosen only by
/// the compensation handler. The input carries the evaluation for each
/// outbound edge; blocked edges are ignored.
pub fn select_edges<'a>(edges: &[(&'a Edge, &EdgeEvaluation)]) -> EdgeSelection {
    let mut selection = EdgeSelection::default();

    let mut candidates: Vec<&Edge> = edges
        .iter()
        .filter(|(edge, eval)| eval.traversable && !edge.semantics.is_compensating())
        .map(|(edge, _)| *edge)
        .collect();
    if candidates.is_empty() {
        return selection;
    }

    // exclusive edges dominate the whole candidate set
    if candidates.iter().any(|e| e.priority.exclusive) {
        let (exclusive, dominated): (Vec<&Edge>, Vec<&Edge>) =
            candidates.into_iter().partition(|e| e.priority.exclusive);
        for edge in dominated {
            selection
                .passed_over
                .push((edge.id.clone(), "exclusive-dominance".to_string()));
        }
        candidates = exclusive;
    }

    // weight breaks ties within the exclusivity tier
    let max_weight = candidates.iter().map(|e| e.priority.weight).max().unwrap_or(0);
    let (winners, lighter): (Vec<&Edge>, Vec<&Edge>) = candidates
        .into_iter()
        .partition(|e| e.priority.weight == max_weight);
    for edge in lighter {
        selection
            .passed_over
            .push((edge.id.clone(), "lower-weight".to_string()));
    }

    if winners.len() == 1 {
        selection.selected.push(winners[0].id.clone());
        return selection;
    }

    // parallel tied set traverses whole; sequential picks rank then id
    if winners.iter().all(|e| e.semantics.is_parallel()) {
        let mut ids: Vec<String> = winners.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        selection.selected = ids;
        return selection;
    }

    let mut ordered = winners;
    ordered.sort_by(|a, b| {
        a.priority
            .rank
            .cmp(&b.priority.rank)
            .then_with(|| a.id.cmp(&b.id))
    });
    let (first, rest) = ordered.split_first().expect("non-empty winners");
    selection.selected.push(first.id.clone());
    for edge in rest {
        selection
            .passed_over
            .push((edge.id.clone(), "higher-rank".to_string()));
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::JoinPolicy;
    use crate::event::{CorrelationMethod, ProcessEvent, ReceivedEvent};
    use crate::instance::NodeExecution;
    use crate::ports::PolicyOutcome;
    use crate::shim::PathExpressionEvaluator;
    use chrono::Utc;
    use serde_json::json;

    fn scope(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn eval(edge: &Edge, scope_value: Value, source: Option<&NodeExecution>, ctx: &ExecutionContext) -> EdgeEvaluation {
        evaluate_edge(edge, &scope(scope_value), source, ctx, &PathExpressionEvaluator::new())
    }

    #[test]
    fn unguarded_edge_is_traversable() {
        let edge = Edge::new("e", "a", "b");
        let result = eval(&edge, json!({}), None, &ExecutionContext::default());
        assert!(result.traversable);
        assert_eq!(result.reason(), "traversable");
    }

    #[test]
    fn falsy_context_guard_blocks() {
        let edge = Edge::builder("e", "a", "b").guard("state.ready").build();
        let result = eval(&edge, json!({"state": {"ready": false}}), None, &ExecutionContext::default());
        assert_eq!(result.block, Some(EdgeBlockKind::Context));
    }

    #[test]
    fn rule_outcome_guard_reads_source_execution() {
        let edge = Edge::builder("e", "a", "b")
            .rule_outcome("creditTier", json!("gold"))
            .build();

        let mut execution = NodeExecution::completed("a", Utc::now(), json!({}));
        execution.rule_outputs.insert("creditTier".to_string(), json!("gold"));
        let ok = eval(&edge, json!({}), Some(&execution), &ExecutionContext::default());
        assert!(ok.traversable);

        execution.rule_outputs.insert("creditTier".to_string(), json!("bronze"));
        let blocked = eval(&edge, json!({}), Some(&execution), &ExecutionContext::default());
        assert_eq!(blocked.block, Some(EdgeBlockKind::RuleOutcome));

        let unsourced = eval(&edge, json!({}), None, &ExecutionContext::default());
        assert_eq!(unsourced.block, Some(EdgeBlockKind::RuleOutcome));
    }

    #[test]
    fn policy_outcome_guard_reads_source_execution() {
        let edge = Edge::builder("e", "a", "b")
            .policy_outcome("risk.approve", PolicyOutcome::Passed)
            .build();

        let mut execution = NodeExecution::completed("a", Utc::now(), json!({}));
        execution
            .policy_outcomes
            .insert("risk.approve".to_string(), PolicyOutcome::Passed);
        assert!(eval(&edge, json!({}), Some(&execution), &ExecutionContext::default()).traversable);

        execution
            .policy_outcomes
            .insert("risk.approve".to_string(), PolicyOutcome::Waived);
        let blocked = eval(&edge, json!({}), Some(&execution), &ExecutionContext::default());
        assert_eq!(blocked.block, Some(EdgeBlockKind::PolicyOutcome));
    }

    #[test]
    fn event_guard_is_xor_on_occurrence() {
        let must = Edge::builder("e1", "a", "b").event_occurred("Cleared").build();
        let must_not = Edge::builder("e2", "a", "b").event_absent("Cleared").build();

        let empty = ExecutionContext::default();
        assert_eq!(
            eval(&must, json!({}), None, &empty).block,
            Some(EdgeBlockKind::Event)
        );
        assert!(eval(&must_not, json!({}), None, &empty).traversable);

        let mut with_event = ExecutionContext::default();
        with_event.record_event(ReceivedEvent::now(
            ProcessEvent::from_node("Cleared", "x", Map::new()),
            CorrelationMethod::EventType,
        ));
        assert!(eval(&must, json!({}), None, &with_event).traversable);
        assert_eq!(
            eval(&must_not, json!({}), None, &with_event).block,
            Some(EdgeBlockKind::Event)
        );
    }

    fn traversable(edge: &Edge) -> EdgeEvaluation {
        EdgeEvaluation::traversable(&edge.id)
    }

    #[test]
    fn exclusive_edge_dominates_heavier_peer() {
        let heavy = Edge::builder("to-y", "x", "y").weight(100).build();
        let exclusive = Edge::builder("to-z", "x", "z").weight(50).exclusive().build();
        let evals = [traversable(&heavy), traversable(&exclusive)];

        let selection = select_edges(&[(&heavy, &evals[0]), (&exclusive, &evals[1])]);
        assert_eq!(selection.selected, vec!["to-z".to_string()]);
        assert_eq!(
            selection.passed_over,
            vec![("to-y".to_string(), "exclusive-dominance".to_string())]
        );
    }

    #[test]
    fn weight_breaks_ties_within_tier() {
        let light = Edge::builder("e-light", "x", "y").weight(1).build();
        let heavy = Edge::builder("e-heavy", "x", "z").weight(9).build();
        let evals = [traversable(&light), traversable(&heavy)];

        let selection = select_edges(&[(&light, &evals[0]), (&heavy, &evals[1])]);
        assert_eq!(selection.selected, vec!["e-heavy".to_string()]);
        assert_eq!(selection.passed_over[0].1, "lower-weight");
    }

    #[test]
    fn sequential_ties_resolve_by_rank_then_id() {
        let b = Edge::builder("e-b", "x", "b").rank(1).build();
        let a = Edge::builder("e-a", "x", "a").rank(1).build();
        let c = Edge::builder("e-c", "x", "c").rank(0).build();
        let evals = [traversable(&b), traversable(&a), traversable(&c)];

        let selection = select_edges(&[(&b, &evals[0]), (&a, &evals[1]), (&c, &evals[2])]);
        assert_eq!(selection.selected, vec!["e-c".to_string()]);

        // without the rank-0 edge the lexicographically smaller id wins
        let selection = select_edges(&[(&b, &evals[0]), (&a, &evals[1])]);
        assert_eq!(selection.selected, vec!["e-a".to_string()]);
    }

    #[test]
    fn parallel_tied_set_selected_whole() {
        let left = Edge::builder("e-l", "a", "b").parallel(JoinPolicy::All).build();
        let right = Edge::builder("e-r", "a", "c").parallel(JoinPolicy::All).build();
        let evals = [traversable(&left), traversable(&right)];

        let selection = select_edges(&[(&left, &evals[0]), (&right, &evals[1])]);
        assert_eq!(selection.selected, vec!["e-l".to_string(), "e-r".to_string()]);
        assert!(selection.passed_over.is_empty());
    }

    #[test]
    fn compensating_edges_never_selected_forward() {
        let normal = Edge::new("e-n", "a", "b");
        let comp = Edge::builder("e-c", "a", "undo").compensating().build();
        let evals = [traversable(&normal), traversable(&comp)];

        let selection = select_edges(&[(&normal, &evals[0]), (&comp, &evals[1])]);
        assert_eq!(selection.selected, vec!["e-n".to_string()]);
    }

    #[test]
    fn blocked_edges_are_not_candidates() {
        let edge = Edge::new("e", "a", "b");
        let blocked = EdgeEvaluation::blocked("e", EdgeBlockKind::Context, "guard");
        let selection = select_edges(&[(&edge, &blocked)]);
        assert!(selection.selected.is_empty());
    }
}
