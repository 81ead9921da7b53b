//! Decision traces - the immutable per-step audit record
//!
//! Every engine step produces exactly one [`DecisionTrace`], appended
//! atomically with the instance commit and never mutated afterwards. A trace
//! captures why the step did what it did: which nodes and edges were
//! considered and why each was blocked or chosen, what was selected and by
//! which criterion, what governance decided, and how the step ended. Traces
//! are totally ordered within an instance by `(timestamp, trace_id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionContext;

/// Kind of engine step the trace records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceType {
    /// Edge selection and target activation
    Navigation,
    /// A node action was executed
    Execution,
    /// No node was selectable; the instance is waiting
    Wait,
    /// An event was delivered
    Event,
    /// Governance rejected the selected node
    GovernanceReject,
    /// A retry was scheduled
    Retry,
    /// Compensation ran
    Compensate,
    /// The instance reached a terminal status
    Terminal,
}

/// Bounded summary of the execution context at step time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Top-level accumulated-state keys
    pub state_keys: Vec<String>,
    /// Delivered event count
    pub event_count: usize,
    /// Tracked obligation count
    pub obligation_count: usize,
}

impl ContextSnapshot {
    /// Summarize a context without copying its values
    pub fn of(context: &ExecutionContext) -> Self {
        Self {
            state_keys: context.accumulated_state.keys().cloned().collect(),
            event_count: context.event_history.len(),
            obligation_count: context.obligations.len(),
        }
    }
}

/// Why a considered node was blocked or chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConsideration {
    /// Node id
    pub node_id: String,
    /// Whether the node was available
    pub available: bool,
    /// Block or choice reason
    pub reason: String,
}

/// Why a considered edge was blocked or chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConsideration {
    /// Edge id
    pub edge_id: String,
    /// Whether the edge was traversable and selected
    pub selected: bool,
    /// Block or choice reason
    pub reason: String,
}

/// Which nodes and edges were considered during the step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSnapshot {
    /// Considered nodes
    pub nodes: Vec<NodeConsideration>,
    /// Considered edges
    pub edges: Vec<EdgeConsideration>,
}

/// What was selected and by which criterion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    /// Selected node ids
    pub selected: Vec<String>,
    /// Selection criterion (e.g. `highest-priority`, `entry`, `wait`)
    pub criterion: String,
    /// Available alternatives that were not selected
    pub alternatives: Vec<String>,
}

/// Governance verdict for the step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceSnapshot {
    /// Whether all checks passed
    pub approved: bool,
    /// Check that rejected (`idempotency`, `authorization`, `policy`)
    #[serde(default)]
    pub rejected_by: Option<String>,
    /// Rejection detail
    #[serde(default)]
    pub detail: Option<String>,
}

impl GovernanceSnapshot {
    /// An approving snapshot
    pub fn approved() -> Self {
        Self {
            approved: true,
            rejected_by: None,
            detail: None,
        }
    }

    /// A rejecting snapshot
    pub fn rejected(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            approved: false,
            rejected_by: Some(check.into()),
            detail: Some(detail.into()),
        }
    }
}

/// How the step ended
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSnapshot {
    /// Outcome kind (`executed`, `wait`, `retry-scheduled`, `failed`, ...)
    pub kind: String,
    /// Free-form detail
    #[serde(default)]
    pub detail: Option<String>,
    /// Error message when the step failed
    #[serde(default)]
    pub error: Option<String>,
}

/// One immutable audit record per engine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Unique trace id
    pub trace_id: String,
    /// Step timestamp; traces order by `(instance_id, timestamp, trace_id)`
    pub timestamp: DateTime<Utc>,
    /// Owning instance
    pub instance_id: String,
    /// Step kind
    pub trace_type: TraceType,
    /// Bounded context summary
    pub context: ContextSnapshot,
    /// Considered nodes and edges
    pub evaluation: EvaluationSnapshot,
    /// Selection result
    pub decision: DecisionSnapshot,
    /// Governance verdict, when governance ran
    #[serde(default)]
    pub governance: Option<GovernanceSnapshot>,
    /// Step outcome
    pub outcome: OutcomeSnapshot,
}

impl DecisionTrace {
    /// Create a trace stamped now
    pub fn new(instance_id: impl Into<String>, trace_type: TraceType) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
            trace_type,
            context: ContextSnapshot::default(),
            evaluation: EvaluationSnapshot::default(),
            decision: DecisionSnapshot::default(),
            governance: None,
            outcome: OutcomeSnapshot::default(),
        }
    }

    /// Attach a context summary
    pub fn with_context(mut self, snapshot: ContextSnapshot) -> Self {
        self.context = snapshot;
        self
    }

    /// Attach the evaluation snapshot
    pub fn with_evaluation(mut self, snapshot: EvaluationSnapshot) -> Self {
        self.evaluation = snapshot;
        self
    }

    /// Attach the decision snapshot
    pub fn with_decision(mut self, snapshot: DecisionSnapshot) -> Self {
        self.decision = snapshot;
        self
    }

    /// Attach the governance snapshot
    pub fn with_governance(mut self, snapshot: GovernanceSnapshot) -> Self {
        self.governance = Some(snapshot);
        self
    }

    /// Attach the outcome snapshot
    pub fn with_outcome(mut self, kind: impl Into<String>, detail: Option<String>) -> Self {
        self.outcome = OutcomeSnapshot {
            kind: kind.into(),
            detail,
            error: None,
        };
        self
    }

    /// Attach a failing outcome
    pub fn with_failure(mut self, kind: impl Into<String>, error: impl Into<String>) -> Self {
        self.outcome = OutcomeSnapshot {
            kind: kind.into(),
            detail: None,
            error: Some(error.into()),
        };
        self
    }
}
