//! Node availability evaluation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::node::{Node, RuleCategory};
use crate::ports::{ExpressionEvaluator, PolicyEvaluator, PolicyOutcome, RuleEvaluator};

/// Why a node is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    /// A precondition evaluated falsy
    Preconditions,
    /// A policy gate missed its expected outcome
    Policy,
    /// A business rule failed to evaluate
    Rule,
    /// An evaluation port errored
    EvaluatorError,
}

/// A typed block with detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBlock {
    /// Block category
    pub kind: BlockKind,
    /// What specifically blocked
    pub detail: String,
}

/// Result of evaluating a node's availability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvaluation {
    /// Node id
    pub node_id: String,
    /// Whether the node may execute
    pub available: bool,
    /// Block reason when unavailable
    #[serde(default)]
    pub block: Option<NodeBlock>,
    /// Merged business-rule outputs, inputs to edges and the handler
    #[serde(default)]
    pub rule_outputs: Map<String, Value>,
    /// Gate outcomes keyed by decision reference
    #[serde(default)]
    pub policy_outcomes: HashMap<String, PolicyOutcome>,
}

impl NodeEvaluation {
    fn available(node_id: &str, rule_outputs: Map<String, Value>, policy_outcomes: HashMap<String, PolicyOutcome>) -> Self {
        Self {
            node_id: node_id.to_string(),
            available: true,
            block: None,
            rule_outputs,
            policy_outcomes,
        }
    }

    fn blocked(node_id: &str, kind: BlockKind, detail: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            available: false,
            block: Some(NodeBlock {
                kind,
                detail: detail.into(),
            }),
            rule_outputs: Map::new(),
            policy_outcomes: HashMap::new(),
        }
    }

    /// One-line reason for traces
    pub fn reason(&self) -> String {
        match &self.block {
            Some(block) => format!("{:?}: {}", block.kind, block.detail),
            None => "available".to_string(),
        }
    }
}

/// camelCase a rule name: `credit-limit_check` becomes `creditLimitCheck`
pub fn camel_case_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == ' ' || ch == '.' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Key under which a scalar rule output is stored
pub fn rule_output_key(name: &str, category: RuleCategory) -> String {
    match category {
        RuleCategory::ExecutionParameter | RuleCategory::Derivation => camel_case_key(name),
        RuleCategory::Obligation => format!("obligation_{}", name),
        RuleCategory::Sla => format!("sla_{}", name),
    }
}

pub(super) async fn evaluate_node(
    node: &Node,
    scope: &Map<String, Value>,
    expressions: &dyn ExpressionEvaluator,
    policies: &dyn PolicyEvaluator,
    rules: &dyn RuleEvaluator,
) -> NodeEvaluation {
    // 1. preconditions, client scope then domain scope
    for (label, exprs) in [
        ("client", &node.preconditions.client_scope),
        ("domain", &node.preconditions.domain_scope),
    ] {
        match expressions.evaluate_all_truthy(exprs, scope) {
            Ok(true) => {}
            Ok(false) => {
                return NodeEvaluation::blocked(
                    &node.id,
                    BlockKind::Preconditions,
                    format!("{} precondition not satisfied", label),
                );
            }
            Err(err) => {
                return NodeEvaluation::blocked(&node.id, BlockKind::EvaluatorError, err.to_string());
            }
        }
    }

    // 2. policy gates must return their expected outcome
    let mut policy_outcomes = HashMap::new();
    for gate in &node.policy_gates {
        let outcome = policies.evaluate(gate, scope).await;
        policy_outcomes.insert(gate.decision.clone(), outcome);
        if outcome == PolicyOutcome::Error {
            return NodeEvaluation::blocked(
                &node.id,
                BlockKind::EvaluatorError,
                format!("policy gate '{}' errored", gate.decision),
            );
        }
        if outcome != gate.expected_outcome {
            return NodeEvaluation::blocked(
                &node.id,
                BlockKind::Policy,
                format!(
                    "policy gate '{}' returned {:?}, expected {:?}",
                    gate.decision, outcome, gate.expected_outcome
                ),
            );
        }
    }

    // 3. business rules; any evaluation failure blocks the node
    let mut rule_outputs = Map::new();
    for rule in &node.business_rules {
        match rules.evaluate(rule, scope).await {
            Ok(Value::Object(map)) => {
                for (key, value) in map {
                    rule_outputs.insert(key, value);
                }
            }
            Ok(scalar) => {
                rule_outputs.insert(rule_output_key(&rule.name, rule.category), scalar);
            }
            Err(err) => {
                return NodeEvaluation::blocked(
                    &node.id,
                    BlockKind::Rule,
                    format!("rule '{}' failed: {}", rule.name, err),
                );
            }
        }
    }

    NodeEvaluation::available(&node.id, rule_outputs, policy_outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::node::{BusinessRule, PolicyGate};
    use crate::shim::PathExpressionEvaluator;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedPolicy(PolicyOutcome);

    #[async_trait]
    impl PolicyEvaluator for FixedPolicy {
        async fn evaluate(&self, _gate: &PolicyGate, _scope: &Map<String, Value>) -> PolicyOutcome {
            self.0
        }
    }

    struct FixedRule(std::result::Result<Value, String>);

    #[async_trait]
    impl RuleEvaluator for FixedRule {
        async fn evaluate(
            &self,
            rule: &BusinessRule,
            _scope: &Map<String, Value>,
        ) -> crate::error::Result<Value> {
            self.0
                .clone()
                .map_err(|message| CoreError::decision(rule.decision.clone(), message))
        }
    }

    fn scope(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn node_without_gates_is_available() {
        let node = Node::builder("a").build();
        let eval = evaluate_node(
            &node,
            &Map::new(),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Passed),
            &FixedRule(Ok(json!({}))),
        )
        .await;
        assert!(eval.available);
        assert_eq!(eval.reason(), "available");
    }

    #[tokio::test]
    async fn falsy_precondition_blocks_with_typed_reason() {
        let node = Node::builder("a").precondition_client("client.vip").build();
        let eval = evaluate_node(
            &node,
            &scope(json!({"client": {"vip": false}})),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Passed),
            &FixedRule(Ok(json!({}))),
        )
        .await;
        assert!(!eval.available);
        assert_eq!(eval.block.unwrap().kind, BlockKind::Preconditions);
    }

    #[tokio::test]
    async fn unexpected_policy_outcome_blocks() {
        let node = Node::builder("a")
            .policy_gate(PolicyGate::passing("risk.approve", "compliance"))
            .build();
        let eval = evaluate_node(
            &node,
            &Map::new(),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Failed),
            &FixedRule(Ok(json!({}))),
        )
        .await;
        assert_eq!(eval.block.unwrap().kind, BlockKind::Policy);
    }

    #[tokio::test]
    async fn policy_error_blocks_as_evaluator_error() {
        let node = Node::builder("a")
            .policy_gate(PolicyGate::passing("risk.approve", "compliance"))
            .build();
        let eval = evaluate_node(
            &node,
            &Map::new(),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Error),
            &FixedRule(Ok(json!({}))),
        )
        .await;
        assert_eq!(eval.block.unwrap().kind, BlockKind::EvaluatorError);
    }

    #[tokio::test]
    async fn rule_failure_blocks_with_rule_reason() {
        let node = Node::builder("a")
            .business_rule("limit", "limits.check", RuleCategory::Derivation)
            .build();
        let eval = evaluate_node(
            &node,
            &Map::new(),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Passed),
            &FixedRule(Err("no such decision".to_string())),
        )
        .await;
        assert_eq!(eval.block.unwrap().kind, BlockKind::Rule);
    }

    #[tokio::test]
    async fn map_rule_outputs_merge_scalar_outputs_keyed() {
        let node = Node::builder("a")
            .business_rule("credit-tier", "tiers.lookup", RuleCategory::Derivation)
            .build();
        let eval = evaluate_node(
            &node,
            &Map::new(),
            &PathExpressionEvaluator::new(),
            &FixedPolicy(PolicyOutcome::Passed),
            &FixedRule(Ok(json!("gold"))),
        )
        .await;
        assert!(eval.available);
        assert_eq!(eval.rule_outputs["creditTier"], json!("gold"));
    }

    #[test]
    fn camel_case_handles_separators() {
        assert_eq!(camel_case_key("credit-limit"), "creditLimit");
        assert_eq!(camel_case_key("credit_limit_check"), "creditLimitCheck");
        assert_eq!(camel_case_key("simple"), "simple");
        assert_eq!(camel_case_key("-leading"), "leading");
    }

    #[test]
    fn scalar_keys_follow_category() {
        assert_eq!(rule_output_key("kyc-refresh", RuleCategory::Obligation), "obligation_kyc-refresh");
        assert_eq!(rule_output_key("respond", RuleCategory::Sla), "sla_respond");
        assert_eq!(rule_output_key("batch-size", RuleCategory::ExecutionParameter), "batchSize");
    }
}
