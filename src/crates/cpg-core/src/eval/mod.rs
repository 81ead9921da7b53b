//! Evaluator kernel - node and edge availability
//!
//! The kernel answers two questions with no side effects: may this node
//! execute, and may this edge be traversed? Both are pure functions over
//! `(graph element, runtime scope)`; evaluation failures from the underlying
//! ports are converted into typed blocks, never panics or engine aborts.
//!
//! Edge *selection* (which traversable edges actually win) also lives here
//! because its determinism rules are part of the kernel contract: exclusive
//! dominance, weight, then rank plus lexicographic edge id.

mod edge;
mod node;

pub use edge::{select_edges, EdgeBlockKind, EdgeEvaluation, EdgeSelection};
pub use node::{camel_case_key, rule_output_key, BlockKind, NodeBlock, NodeEvaluation};

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::edge::Edge;
use crate::instance::NodeExecution;
use crate::node::Node;
use crate::ports::{ExpressionEvaluator, PolicyEvaluator, RuleEvaluator};

/// The evaluator kernel, bundling the three evaluation ports
#[derive(Clone)]
pub struct EvaluatorKernel {
    expressions: Arc<dyn ExpressionEvaluator>,
    policies: Arc<dyn PolicyEvaluator>,
    rules: Arc<dyn RuleEvaluator>,
}

impl EvaluatorKernel {
    /// Bundle the evaluation ports into a kernel
    pub fn new(
        expressions: Arc<dyn ExpressionEvaluator>,
        policies: Arc<dyn PolicyEvaluator>,
        rules: Arc<dyn RuleEvaluator>,
    ) -> Self {
        Self {
            expressions,
            policies,
            rules,
        }
    }

    /// The expression port
    pub fn expressions(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.expressions
    }

    /// Evaluate a node's availability against a runtime scope
    pub async fn evaluate_node(&self, node: &Node, scope: &Map<String, Value>) -> NodeEvaluation {
        node::evaluate_node(node, scope, &*self.expressions, &*self.policies, &*self.rules).await
    }

    /// Evaluate an edge's traversability
    ///
    /// `source_execution` is the most recent execution of the edge source,
    /// consulted by the rule-outcome and policy-outcome guard groups.
    pub fn evaluate_edge(
        &self,
        edge: &Edge,
        scope: &Map<String, Value>,
        source_execution: Option<&NodeExecution>,
        context: &ExecutionContext,
    ) -> EdgeEvaluation {
        edge::evaluate_edge(edge, scope, source_execution, context, &*self.expressions)
    }
}
