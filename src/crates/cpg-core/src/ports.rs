//! Port traits - the seams between the engine and its collaborators
//!
//! The engine depends on abstract evaluators and handlers only:
//!
//! - [`ExpressionEvaluator`] - pure, synchronous, thread-safe expression
//!   evaluation over a JSON scope
//! - [`DecisionEvaluator`] - named decision evaluation (`decision` or
//!   `model.decision` references)
//! - [`PolicyEvaluator`] - gate evaluation to a [`PolicyOutcome`],
//!   conventionally layered over the decision port
//! - [`RuleEvaluator`] - business rule evaluation producing outputs merged
//!   into rule results
//! - [`ActionHandler`] - node action execution
//! - [`EventPublisher`] - lifecycle and configured event emission
//!
//! Default implementations for all of these live in [`crate::shim`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::Result;
use crate::node::{ActionSpec, BusinessRule, PolicyGate};

/// Outcome of a policy gate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyOutcome {
    /// The gate allows execution
    Passed,
    /// The gate denies execution
    Failed,
    /// The gate was explicitly waived
    Waived,
    /// A human review is outstanding
    PendingReview,
    /// The underlying evaluation errored
    Error,
}

impl PolicyOutcome {
    /// Map a raw decision result onto a policy outcome
    ///
    /// Strings map case-insensitively (`passed|approved|allowed|yes|true`,
    /// `failed|rejected|denied|no|false`, `waived|exempt|skip`,
    /// `pending|review`); booleans map to passed/failed; objects are read
    /// through their `outcome`, `result`, or `status` key. Anything
    /// unrecognized maps to `Failed`.
    pub fn from_decision_value(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Self::Passed,
            Value::Bool(false) => Self::Failed,
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "passed" | "approved" | "allowed" | "yes" | "true" => Self::Passed,
                "failed" | "rejected" | "denied" | "no" | "false" => Self::Failed,
                "waived" | "exempt" | "skip" => Self::Waived,
                "pending" | "review" => Self::PendingReview,
                _ => Self::Failed,
            },
            Value::Object(map) => ["outcome", "result", "status"]
                .iter()
                .find_map(|key| map.get(*key))
                .map(Self::from_decision_value)
                .unwrap_or(Self::Failed),
            _ => Self::Failed,
        }
    }
}

/// Pure expression evaluation over a JSON scope
///
/// Implementations must be thread-safe and side-effect free: the kernel
/// calls them from concurrent instance steps with shared references.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate an expression to a value
    fn evaluate(&self, expr: &str, scope: &Map<String, Value>) -> Result<Value>;

    /// True when every expression evaluates truthy
    ///
    /// Truthiness: `null`, `false`, `0`, `""`, and empty arrays/objects are
    /// falsy; everything else is truthy.
    fn evaluate_all_truthy(&self, exprs: &[String], scope: &Map<String, Value>) -> Result<bool> {
        for expr in exprs {
            if !is_truthy(&self.evaluate(expr, scope)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Truthiness used by guard and precondition evaluation
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Named decision evaluation
///
/// `decision_ref` is either a bare decision name resolved against the
/// default model, or `model.decision`.
#[async_trait]
pub trait DecisionEvaluator: Send + Sync {
    /// Evaluate a decision against the given inputs
    async fn evaluate(&self, decision_ref: &str, inputs: &Map<String, Value>) -> Result<Value>;
}

/// Policy gate evaluation
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate a gate against the runtime scope
    ///
    /// Never errors: evaluation failures surface as
    /// [`PolicyOutcome::Error`].
    async fn evaluate(&self, gate: &PolicyGate, scope: &Map<String, Value>) -> PolicyOutcome;
}

/// Business rule evaluation
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    /// Evaluate a rule against the runtime scope
    ///
    /// Map results are merged into the rule outputs as-is; scalar results
    /// are stored under a key derived from the rule category.
    async fn evaluate(&self, rule: &BusinessRule, scope: &Map<String, Value>) -> Result<Value>;
}

/// Error reported by an action handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    /// Handler-defined error kind, matched against remediation routes
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// Result of one action handler invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the invocation succeeded
    pub success: bool,
    /// Output merged into accumulated state on success
    pub output: Value,
    /// Whether a failure may be retried
    pub retryable: bool,
    /// Failure detail
    #[serde(default)]
    pub error: Option<ActionError>,
}

impl ActionResult {
    /// A successful result
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            retryable: false,
            error: None,
        }
    }

    /// A failed result
    pub fn fail(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            output: Value::Null,
            retryable,
            error: Some(ActionError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

/// Everything a handler needs to execute a node action
#[derive(Debug, Clone)]
pub struct ActionRequest {
    /// Instance the action belongs to
    pub instance_id: String,
    /// Node being executed
    pub node_id: String,
    /// The action specification
    pub action: ActionSpec,
    /// Read-only runtime scope at execution time
    pub scope: Map<String, Value>,
    /// Merged rule outputs from availability evaluation
    pub rule_outputs: Map<String, Value>,
    /// 0-based attempt counter (0 = first attempt)
    pub attempt: u32,
    /// Flips to `true` when the instance is cancelled; handlers are
    /// contractually required to observe it promptly
    pub cancelled: watch::Receiver<bool>,
}

/// Node action execution
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action
    ///
    /// Failures are returned inside [`ActionResult`], not as `Err`: the
    /// engine routes them through compensation. `Err` is reserved for
    /// handler-infrastructure faults and is treated as a non-retryable
    /// failure of kind `unknown`.
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult>;
}

/// Event publication
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event, awaiting delivery to the transport
    async fn publish(&self, event: crate::event::ProcessEvent) -> Result<()>;

    /// Publish without awaiting delivery
    fn publish_async(&self, event: crate::event::ProcessEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_outcomes_map_per_convention() {
        for s in ["passed", "APPROVED", "allowed", "yes", "true"] {
            assert_eq!(PolicyOutcome::from_decision_value(&json!(s)), PolicyOutcome::Passed);
        }
        for s in ["failed", "rejected", "DENIED", "no", "false"] {
            assert_eq!(PolicyOutcome::from_decision_value(&json!(s)), PolicyOutcome::Failed);
        }
        for s in ["waived", "exempt", "skip"] {
            assert_eq!(PolicyOutcome::from_decision_value(&json!(s)), PolicyOutcome::Waived);
        }
        for s in ["pending", "review"] {
            assert_eq!(
                PolicyOutcome::from_decision_value(&json!(s)),
                PolicyOutcome::PendingReview
            );
        }
    }

    #[test]
    fn boolean_outcomes_map_to_pass_fail() {
        assert_eq!(PolicyOutcome::from_decision_value(&json!(true)), PolicyOutcome::Passed);
        assert_eq!(PolicyOutcome::from_decision_value(&json!(false)), PolicyOutcome::Failed);
    }

    #[test]
    fn map_outcomes_read_conventional_keys() {
        assert_eq!(
            PolicyOutcome::from_decision_value(&json!({"outcome": "approved"})),
            PolicyOutcome::Passed
        );
        assert_eq!(
            PolicyOutcome::from_decision_value(&json!({"result": false})),
            PolicyOutcome::Failed
        );
        assert_eq!(
            PolicyOutcome::from_decision_value(&json!({"status": "review"})),
            PolicyOutcome::PendingReview
        );
    }

    #[test]
    fn unknown_outcomes_fail_closed() {
        assert_eq!(
            PolicyOutcome::from_decision_value(&json!("maybe")),
            PolicyOutcome::Failed
        );
        assert_eq!(PolicyOutcome::from_decision_value(&json!(42)), PolicyOutcome::Failed);
        assert_eq!(
            PolicyOutcome::from_decision_value(&json!({"unrelated": true})),
            PolicyOutcome::Failed
        );
        assert_eq!(PolicyOutcome::from_decision_value(&Value::Null), PolicyOutcome::Failed);
    }

    #[test]
    fn truthiness_covers_all_value_shapes() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));

        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1.5)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
        assert!(is_truthy(&json!({"k": null})));
    }

    #[test]
    fn action_result_constructors() {
        let ok = ActionResult::ok(json!({"done": true}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let fail = ActionResult::fail("NetworkError", "connection reset", true);
        assert!(!fail.success);
        assert!(fail.retryable);
        assert_eq!(fail.error.unwrap().kind, "NetworkError");
    }
}
