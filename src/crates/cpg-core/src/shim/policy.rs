//! Policy and rule evaluators layered over the decision port
//!
//! The conventional wiring: a policy gate or business rule names a decision,
//! the decision port evaluates it against the runtime scope, and the raw
//! result is mapped onto the gate/rule contract. Gate outcomes map through
//! [`PolicyOutcome::from_decision_value`]; rule results pass through as-is
//! and are keyed by the kernel.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::node::{BusinessRule, PolicyGate};
use crate::ports::{DecisionEvaluator, PolicyEvaluator, PolicyOutcome, RuleEvaluator};

/// Policy evaluation backed by a decision evaluator
#[derive(Clone)]
pub struct DecisionBackedPolicyEvaluator {
    decisions: Arc<dyn DecisionEvaluator>,
}

impl DecisionBackedPolicyEvaluator {
    /// Layer over a decision evaluator
    pub fn new(decisions: Arc<dyn DecisionEvaluator>) -> Self {
        Self { decisions }
    }
}

#[async_trait]
impl PolicyEvaluator for DecisionBackedPolicyEvaluator {
    async fn evaluate(&self, gate: &PolicyGate, scope: &Map<String, Value>) -> PolicyOutcome {
        match self.decisions.evaluate(&gate.decision, scope).await {
            Ok(value) => PolicyOutcome::from_decision_value(&value),
            Err(err) => {
                warn!(decision = %gate.decision, error = %err, "policy gate evaluation errored");
                PolicyOutcome::Error
            }
        }
    }
}

/// Rule evaluation backed by a decision evaluator
#[derive(Clone)]
pub struct DecisionBackedRuleEvaluator {
    decisions: Arc<dyn DecisionEvaluator>,
}

impl DecisionBackedRuleEvaluator {
    /// Layer over a decision evaluator
    pub fn new(decisions: Arc<dyn DecisionEvaluator>) -> Self {
        Self { decisions }
    }
}

#[async_trait]
impl RuleEvaluator for DecisionBackedRuleEvaluator {
    async fn evaluate(&self, rule: &BusinessRule, scope: &Map<String, Value>) -> Result<Value> {
        self.decisions.evaluate(&rule.decision, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RuleCategory;
    use crate::shim::TableDecisionEvaluator;
    use serde_json::json;

    fn gate(decision: &str) -> PolicyGate {
        PolicyGate::passing(decision, "compliance")
    }

    #[tokio::test]
    async fn gate_outcome_maps_from_decision_value() {
        let table = TableDecisionEvaluator::new();
        table.register_fixed("ok", json!("approved"));
        table.register_fixed("no", json!({"outcome": "denied"}));
        let policies = DecisionBackedPolicyEvaluator::new(Arc::new(table));

        assert_eq!(policies.evaluate(&gate("ok"), &Map::new()).await, PolicyOutcome::Passed);
        assert_eq!(policies.evaluate(&gate("no"), &Map::new()).await, PolicyOutcome::Failed);
    }

    #[tokio::test]
    async fn gate_evaluation_error_maps_to_error_outcome() {
        let policies = DecisionBackedPolicyEvaluator::new(Arc::new(TableDecisionEvaluator::new()));
        assert_eq!(
            policies.evaluate(&gate("missing"), &Map::new()).await,
            PolicyOutcome::Error
        );
    }

    #[tokio::test]
    async fn rule_results_pass_through() {
        let table = TableDecisionEvaluator::new();
        table.register_fixed("limits", json!({"maxAmount": 500}));
        let rules = DecisionBackedRuleEvaluator::new(Arc::new(table));

        let rule = BusinessRule {
            name: "limits".to_string(),
            decision: "limits".to_string(),
            category: RuleCategory::Derivation,
        };
        let result = rules.evaluate(&rule, &Map::new()).await.unwrap();
        assert_eq!(result, json!({"maxAmount": 500}));
    }
}
