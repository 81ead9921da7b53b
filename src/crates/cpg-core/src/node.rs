//! Node definitions - governed decision points
//!
//! A [`Node`] is the unit of work in a process graph. Beyond an action it
//! carries everything the engine needs to decide *whether* the work may run:
//! preconditions over the client and domain context, policy gates matched
//! against required outcomes, business rules whose outputs feed downstream
//! edge guards, event subscriptions and emissions, and exception routes that
//! drive the compensation machinery when the action fails.
//!
//! All records here are plain value types; behavior lives in the evaluator
//! kernel ([`crate::eval`]) and the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ports::PolicyOutcome;

/// Preconditions evaluated before a node becomes available
///
/// Two expression lists with distinct scopes: `client_scope` expressions see
/// the caller-supplied client context, `domain_scope` expressions see the
/// business domain context. Both lists must evaluate truthy in full.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preconditions {
    /// Expressions over the client compartment
    #[serde(default)]
    pub client_scope: Vec<String>,
    /// Expressions over the domain compartment
    #[serde(default)]
    pub domain_scope: Vec<String>,
}

impl Preconditions {
    /// True when there is nothing to evaluate
    pub fn is_empty(&self) -> bool {
        self.client_scope.is_empty() && self.domain_scope.is_empty()
    }

    /// All expressions, client scope first
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.client_scope.iter().chain(self.domain_scope.iter())
    }
}

/// A declarative check whose outcome is matched against a required value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyGate {
    /// Decision reference (`decision` or `model.decision`)
    pub decision: String,
    /// Outcome the gate must produce for the node to be available
    pub expected_outcome: PolicyOutcome,
    /// Policy classification (informational, carried into traces)
    pub policy_type: String,
}

impl PolicyGate {
    /// Gate requiring the decision to pass
    pub fn passing(decision: impl Into<String>, policy_type: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            expected_outcome: PolicyOutcome::Passed,
            policy_type: policy_type.into(),
        }
    }
}

/// Category of a business rule, controlling how scalar outputs are keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    /// Parameters consumed by the action handler
    ExecutionParameter,
    /// Obligations tracked in the execution context
    Obligation,
    /// Service-level targets
    Sla,
    /// Derived values merged into accumulated state
    Derivation,
}

/// A declarative computation producing outputs merged into rule results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    /// Rule name, used to derive the output key for scalar results
    pub name: String,
    /// Decision reference backing the rule
    pub decision: String,
    /// Category controlling output key derivation
    pub category: RuleCategory,
}

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    /// Invoke an external system
    SystemInvocation,
    /// Assign a task to a person
    HumanTask,
    /// Delegate to an agent
    AgentAssisted,
    /// Evaluate a decision and store the outcome
    Decision,
    /// Send a notification
    Notification,
    /// Do nothing; the node exists to gate on events or time
    Wait,
}

/// Execution configuration for a node action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Whether the handler may complete out of band
    #[serde(default)]
    pub asynchronous: bool,
    /// Per-invocation timeout; `None` uses the engine default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Consecutive retries granted to retryable failures
    #[serde(default)]
    pub retry_count: u32,
    /// Expression resolving the assignee for human tasks
    #[serde(default)]
    pub assignee_expr: Option<String>,
    /// Form reference for human tasks
    #[serde(default)]
    pub form_ref: Option<String>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            asynchronous: false,
            timeout_secs: None,
            retry_count: 0,
            assignee_expr: None,
            form_ref: None,
        }
    }
}

/// The action a node performs when executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action kind
    pub action_type: ActionType,
    /// Handler reference resolved by the engine's handler registry
    #[serde(default)]
    pub handler_ref: Option<String>,
    /// Execution configuration
    #[serde(default)]
    pub config: ActionConfig,
}

impl ActionSpec {
    /// A wait action with no handler
    pub fn wait() -> Self {
        Self {
            action_type: ActionType::Wait,
            handler_ref: None,
            config: ActionConfig::default(),
        }
    }

    /// A system invocation bound to a named handler
    pub fn system(handler_ref: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::SystemInvocation,
            handler_ref: Some(handler_ref.into()),
            config: ActionConfig::default(),
        }
    }
}

/// Subscription to an external event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Event type to subscribe to
    pub event_type: String,
    /// Optional correlation expression evaluated against the event scope
    #[serde(default)]
    pub correlation_expr: Option<String>,
}

/// When a configured emission fires relative to the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmitTiming {
    /// Before the handler is invoked
    OnStart,
    /// After the handler succeeds
    OnComplete,
    /// When the node fails or compensation starts
    OnFailure,
}

/// A configured event emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEmission {
    /// Event type to publish
    pub event_type: String,
    /// Emission timing
    pub timing: EmitTiming,
    /// Optional expression producing the event payload
    #[serde(default)]
    pub payload_expr: Option<String>,
}

/// Event wiring for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Event types this node subscribes to
    #[serde(default)]
    pub subscribes: Vec<EventSubscription>,
    /// Events this node emits
    #[serde(default)]
    pub emits: Vec<EventEmission>,
}

impl EventConfig {
    /// Subscription entry for an event type, if any
    pub fn subscription(&self, event_type: &str) -> Option<&EventSubscription> {
        self.subscribes.iter().find(|s| s.event_type == event_type)
    }

    /// Emissions configured for a timing
    pub fn emissions(&self, timing: EmitTiming) -> impl Iterator<Item = &EventEmission> {
        self.emits.iter().filter(move |e| e.timing == timing)
    }
}

/// Remediation strategy applied when an action fails with a matching error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum RemediationStrategy {
    /// Retry the action up to `max_retries` consecutive times
    Retry {
        /// Upper bound on consecutive retries
        max_retries: u32,
    },
    /// Emit on-failure events and traverse the named compensating edge
    Compensate {
        /// Compensating edge id
        compensating_edge: String,
    },
    /// Switch execution to another node, preserving merged rule outputs
    Alternate {
        /// Replacement node id
        node: String,
    },
    /// Treat the node as completed with empty output
    Skip,
    /// Terminal failure for the node
    Fail,
}

/// Remediation route keyed by error kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRoute {
    /// Error kind this route matches (handler-reported, e.g. `NetworkError`)
    pub error_kind: String,
    /// Strategy to apply
    pub strategy: RemediationStrategy,
}

/// Escalation route with an SLA budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRoute {
    /// Error kind this route matches; `None` matches any
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Minutes before the escalation is considered breached
    pub sla_minutes: u32,
    /// Node activated when the route fires
    pub escalation_node: String,
}

/// Exception handling configuration for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRoutes {
    /// Remediations tried in declaration order, first match wins
    #[serde(default)]
    pub remediations: Vec<RemediationRoute>,
    /// Escalations tried after remediations and retries are exhausted
    #[serde(default)]
    pub escalations: Vec<EscalationRoute>,
}

impl ExceptionRoutes {
    /// First remediation matching an error kind
    pub fn remediation(&self, error_kind: &str) -> Option<&RemediationRoute> {
        self.remediations.iter().find(|r| r.error_kind == error_kind)
    }

    /// First escalation matching an error kind
    pub fn escalation(&self, error_kind: &str) -> Option<&EscalationRoute> {
        self.escalations
            .iter()
            .find(|e| e.error_kind.as_deref().map_or(true, |k| k == error_kind))
    }
}

/// A governed decision point in a process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id within the graph
    pub id: String,
    /// Node revision
    pub version: u32,
    /// Availability preconditions
    #[serde(default)]
    pub preconditions: Preconditions,
    /// Policy gates that must return their expected outcome
    #[serde(default)]
    pub policy_gates: Vec<PolicyGate>,
    /// Business rules evaluated on availability checks
    #[serde(default)]
    pub business_rules: Vec<BusinessRule>,
    /// The action performed on execution
    pub action: ActionSpec,
    /// Event subscriptions and emissions
    #[serde(default)]
    pub event_config: EventConfig,
    /// Exception routes consulted on failure
    #[serde(default)]
    pub exception_routes: ExceptionRoutes,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Node {
    /// Create a node with defaults and the given action
    pub fn new(id: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            version: 1,
            preconditions: Preconditions::default(),
            policy_gates: Vec::new(),
            business_rules: Vec::new(),
            action,
            event_config: EventConfig::default(),
            exception_routes: ExceptionRoutes::default(),
            metadata: HashMap::new(),
        }
    }

    /// Whether this node subscribes to an event type
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_config.subscription(event_type).is_some()
    }

    /// Builder for incremental construction
    pub fn builder(id: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(id)
    }
}

/// Fluent builder for [`Node`]
///
/// ```rust
/// use cpg_core::node::{ActionSpec, Node};
///
/// let node = Node::builder("approve")
///     .precondition_client("client.tier = \"gold\"")
///     .subscribe("ReviewCompleted")
///     .action(ActionSpec::system("approval-service"))
///     .build();
/// assert_eq!(node.id, "approve");
/// ```
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// Start building a node; the action defaults to `wait`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            node: Node::new(id, ActionSpec::wait()),
        }
    }

    /// Set the action
    pub fn action(mut self, action: ActionSpec) -> Self {
        self.node.action = action;
        self
    }

    /// Add a client-scope precondition expression
    pub fn precondition_client(mut self, expr: impl Into<String>) -> Self {
        self.node.preconditions.client_scope.push(expr.into());
        self
    }

    /// Add a domain-scope precondition expression
    pub fn precondition_domain(mut self, expr: impl Into<String>) -> Self {
        self.node.preconditions.domain_scope.push(expr.into());
        self
    }

    /// Add a policy gate
    pub fn policy_gate(mut self, gate: PolicyGate) -> Self {
        self.node.policy_gates.push(gate);
        self
    }

    /// Add a business rule
    pub fn business_rule(
        mut self,
        name: impl Into<String>,
        decision: impl Into<String>,
        category: RuleCategory,
    ) -> Self {
        self.node.business_rules.push(BusinessRule {
            name: name.into(),
            decision: decision.into(),
            category,
        });
        self
    }

    /// Subscribe to an event type without a correlation expression
    pub fn subscribe(mut self, event_type: impl Into<String>) -> Self {
        self.node.event_config.subscribes.push(EventSubscription {
            event_type: event_type.into(),
            correlation_expr: None,
        });
        self
    }

    /// Subscribe with a correlation expression
    pub fn subscribe_correlated(
        mut self,
        event_type: impl Into<String>,
        correlation_expr: impl Into<String>,
    ) -> Self {
        self.node.event_config.subscribes.push(EventSubscription {
            event_type: event_type.into(),
            correlation_expr: Some(correlation_expr.into()),
        });
        self
    }

    /// Add a configured emission
    pub fn emit(mut self, event_type: impl Into<String>, timing: EmitTiming) -> Self {
        self.node.event_config.emits.push(EventEmission {
            event_type: event_type.into(),
            timing,
            payload_expr: None,
        });
        self
    }

    /// Add a remediation route
    pub fn remediation(mut self, error_kind: impl Into<String>, strategy: RemediationStrategy) -> Self {
        self.node.exception_routes.remediations.push(RemediationRoute {
            error_kind: error_kind.into(),
            strategy,
        });
        self
    }

    /// Add an escalation route
    pub fn escalation(mut self, route: EscalationRoute) -> Self {
        self.node.exception_routes.escalations.push(route);
        self
    }

    /// Set the retry count on the action config
    pub fn retry_count(mut self, retries: u32) -> Self {
        self.node.action.config.retry_count = retries;
        self
    }

    /// Set the action timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.node.action.config.timeout_secs = Some(secs);
        self
    }

    /// Finish building
    pub fn build(self) -> Node {
        self.node
    }
}
