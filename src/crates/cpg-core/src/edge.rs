//! Edge definitions - guarded transitions between nodes
//!
//! An [`Edge`] is a permissible transition. Whether it may be traversed is
//! decided by four guard groups (context expressions, rule outcomes, policy
//! outcomes, event occurrence), and *which* traversable edge wins is decided
//! by priority: an exclusive edge dominates its non-exclusive peers, weight
//! breaks ties within an exclusivity tier, and rank plus lexicographic id
//! ordering keep sequential selection deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::PolicyOutcome;

/// Condition on a rule output of the edge source's latest execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcomeCondition {
    /// Key into the merged rule outputs
    pub output_key: String,
    /// Required value
    pub equals: Value,
}

/// Condition on a policy gate outcome of the edge source's latest execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcomeCondition {
    /// Decision reference of the gate
    pub decision: String,
    /// Required outcome
    pub outcome: PolicyOutcome,
}

/// Condition on the instance event history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCondition {
    /// Event type looked up in the history
    pub event_type: String,
    /// When true the event must have occurred; when false it must not have
    pub must_have_occurred: bool,
}

/// The four guard groups of an edge; all must pass for traversal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardConditions {
    /// Expressions over the runtime scope
    #[serde(default)]
    pub context_exprs: Vec<String>,
    /// Conditions on the source's rule outputs
    #[serde(default)]
    pub rule_outcomes: Vec<RuleOutcomeCondition>,
    /// Conditions on the source's policy outcomes
    #[serde(default)]
    pub policy_outcomes: Vec<PolicyOutcomeCondition>,
    /// Conditions on the event history
    #[serde(default)]
    pub event_conditions: Vec<EventCondition>,
}

impl GuardConditions {
    /// True when every group is empty (the edge is always traversable)
    pub fn is_empty(&self) -> bool {
        self.context_exprs.is_empty()
            && self.rule_outcomes.is_empty()
            && self.policy_outcomes.is_empty()
            && self.event_conditions.is_empty()
    }
}

/// Join policy for parallel inbound edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "join")]
pub enum JoinPolicy {
    /// Every parallel inbound edge must have been traversed
    All,
    /// Any single traversal suffices
    Any,
    /// At least `n` traversals out of the parallel inbound set
    NOfM {
        /// Required traversal count
        n: u32,
    },
}

/// Execution semantics of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ExecutionSemantics {
    /// Single-successor transition
    Sequential,
    /// Concurrent fan-out; the target joins per its inbound join policy
    Parallel {
        /// Join policy applied at the target
        #[serde(flatten)]
        join: JoinPolicy,
    },
    /// Recovery transition; never chosen by forward selection
    Compensating,
}

impl ExecutionSemantics {
    /// True for parallel edges
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel { .. })
    }

    /// True for compensating edges
    pub fn is_compensating(&self) -> bool {
        matches!(self, Self::Compensating)
    }
}

/// Selection priority of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgePriority {
    /// Weight; higher wins within an exclusivity tier
    pub weight: u32,
    /// Rank; lower wins among equal-weight sequential candidates
    pub rank: u32,
    /// Exclusive edges dominate non-exclusive peers when traversable
    pub exclusive: bool,
}

impl Default for EdgePriority {
    fn default() -> Self {
        Self {
            weight: 0,
            rank: 0,
            exclusive: false,
        }
    }
}

/// Events that activate or re-evaluate an edge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTriggers {
    /// Event types that evaluate this edge even after its source completed
    #[serde(default)]
    pub activating: Vec<String>,
    /// Event types that re-evaluate this edge while it is pending
    #[serde(default)]
    pub reevaluation: Vec<String>,
}

/// Recovery strategy attached to an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompensationStrategy {
    /// Retry the failed node
    Retry,
    /// Walk back and traverse the compensating edge
    Rollback,
    /// Route to an alternate path
    Alternate,
    /// Escalate to an operator
    Escalate,
}

/// Edge-level compensation semantics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSemantics {
    /// Strategy applied during the rollback walk
    pub strategy: CompensationStrategy,
    /// Retry budget for the `retry` strategy
    #[serde(default)]
    pub max_retries: u32,
    /// Compensating edge traversed for the `rollback` strategy
    #[serde(default)]
    pub compensating_edge: Option<String>,
}

/// A guarded transition between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique edge id within the graph
    pub id: String,
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
    /// Guard condition groups
    #[serde(default)]
    pub guards: GuardConditions,
    /// Sequential, parallel, or compensating semantics
    pub semantics: ExecutionSemantics,
    /// Selection priority
    #[serde(default)]
    pub priority: EdgePriority,
    /// Activating and re-evaluation event triggers
    #[serde(default)]
    pub triggers: EventTriggers,
    /// Optional compensation semantics
    #[serde(default)]
    pub compensation: Option<CompensationSemantics>,
}

impl Edge {
    /// Create a sequential edge with empty guards
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            guards: GuardConditions::default(),
            semantics: ExecutionSemantics::Sequential,
            priority: EdgePriority::default(),
            triggers: EventTriggers::default(),
            compensation: None,
        }
    }

    /// Builder for incremental construction
    pub fn builder(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> EdgeBuilder {
        EdgeBuilder {
            edge: Edge::new(id, source, target),
        }
    }
}

/// Fluent builder for [`Edge`]
#[derive(Debug, Clone)]
pub struct EdgeBuilder {
    edge: Edge,
}

impl EdgeBuilder {
    /// Add a context guard expression
    pub fn guard(mut self, expr: impl Into<String>) -> Self {
        self.edge.guards.context_exprs.push(expr.into());
        self
    }

    /// Add a rule-outcome guard
    pub fn rule_outcome(mut self, output_key: impl Into<String>, equals: Value) -> Self {
        self.edge.guards.rule_outcomes.push(RuleOutcomeCondition {
            output_key: output_key.into(),
            equals,
        });
        self
    }

    /// Add a policy-outcome guard
    pub fn policy_outcome(mut self, decision: impl Into<String>, outcome: PolicyOutcome) -> Self {
        self.edge.guards.policy_outcomes.push(PolicyOutcomeCondition {
            decision: decision.into(),
            outcome,
        });
        self
    }

    /// Add an event guard
    pub fn event_occurred(mut self, event_type: impl Into<String>) -> Self {
        self.edge.guards.event_conditions.push(EventCondition {
            event_type: event_type.into(),
            must_have_occurred: true,
        });
        self
    }

    /// Add a negative event guard
    pub fn event_absent(mut self, event_type: impl Into<String>) -> Self {
        self.edge.guards.event_conditions.push(EventCondition {
            event_type: event_type.into(),
            must_have_occurred: false,
        });
        self
    }

    /// Set parallel semantics with a join policy
    pub fn parallel(mut self, join: JoinPolicy) -> Self {
        self.edge.semantics = ExecutionSemantics::Parallel { join };
        self
    }

    /// Mark as a compensating edge
    pub fn compensating(mut self) -> Self {
        self.edge.semantics = ExecutionSemantics::Compensating;
        self
    }

    /// Set the selection weight
    pub fn weight(mut self, weight: u32) -> Self {
        self.edge.priority.weight = weight;
        self
    }

    /// Set the sequential rank
    pub fn rank(mut self, rank: u32) -> Self {
        self.edge.priority.rank = rank;
        self
    }

    /// Mark as exclusive
    pub fn exclusive(mut self) -> Self {
        self.edge.priority.exclusive = true;
        self
    }

    /// Add a re-evaluation trigger event type
    pub fn reevaluate_on(mut self, event_type: impl Into<String>) -> Self {
        self.edge.triggers.reevaluation.push(event_type.into());
        self
    }

    /// Add an activating trigger event type
    pub fn activate_on(mut self, event_type: impl Into<String>) -> Self {
        self.edge.triggers.activating.push(event_type.into());
        self
    }

    /// Attach compensation semantics
    pub fn compensation(mut self, semantics: CompensationSemantics) -> Self {
        self.edge.compensation = Some(semantics);
        self
    }

    /// Rollback compensation via a compensating edge
    pub fn rollback_via(mut self, compensating_edge: impl Into<String>) -> Self {
        self.edge.compensation = Some(CompensationSemantics {
            strategy: CompensationStrategy::Rollback,
            max_retries: 0,
            compensating_edge: Some(compensating_edge.into()),
        });
        self
    }

    /// Finish building
    pub fn build(self) -> Edge {
        self.edge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_assembles_edge() {
        let edge = Edge::builder("e1", "a", "b")
            .guard("state.status = \"OK\"")
            .rule_outcome("creditTier", json!("gold"))
            .event_occurred("Cleared")
            .weight(10)
            .exclusive()
            .build();

        assert_eq!(edge.source, "a");
        assert_eq!(edge.priority.weight, 10);
        assert!(edge.priority.exclusive);
        assert!(!edge.guards.is_empty());
        assert_eq!(edge.semantics, ExecutionSemantics::Sequential);
    }

    #[test]
    fn parallel_edge_carries_join_policy() {
        let edge = Edge::builder("e2", "a", "join")
            .parallel(JoinPolicy::NOfM { n: 2 })
            .build();

        match edge.semantics {
            ExecutionSemantics::Parallel { join: JoinPolicy::NOfM { n } } => assert_eq!(n, 2),
            other => panic!("unexpected semantics: {:?}", other),
        }
        assert!(edge.semantics.is_parallel());
    }

    #[test]
    fn empty_guards_reported_empty() {
        let edge = Edge::new("e3", "x", "y");
        assert!(edge.guards.is_empty());
        assert!(!edge.semantics.is_compensating());
    }
}
