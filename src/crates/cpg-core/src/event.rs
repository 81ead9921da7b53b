//! Process events - external signals and engine lifecycle notifications
//!
//! A [`ProcessEvent`] is deep-immutable after creation: the engine never
//! mutates a payload once the event id is minted. Delivered events are
//! wrapped in [`ReceivedEvent`] records carrying the delivery timestamp and
//! the correlation method that matched them to an instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where an event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Emitted by a node during execution
    Node,
    /// Delivered from outside the engine
    External,
    /// Emitted by the engine itself
    System,
    /// Raised on behalf of a user
    User,
}

/// Event source: kind plus an identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    /// Source kind
    pub kind: SourceKind,
    /// Source identifier (node id, system name, user id, ...)
    pub id: String,
}

/// An immutable process event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Unique event id
    pub event_id: String,
    /// Event type, dotted lowercase for engine events
    pub event_type: String,
    /// Origin of the event
    pub source: EventSource,
    /// Optional correlation id for instance matching
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Immutable payload
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl ProcessEvent {
    /// Create an event with a fresh id and the current timestamp
    pub fn new(event_type: impl Into<String>, source: EventSource, payload: Map<String, Value>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source,
            correlation_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// An external event with a correlation id
    pub fn external(
        event_type: impl Into<String>,
        source_id: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        let mut event = Self::new(
            event_type,
            EventSource {
                kind: SourceKind::External,
                id: source_id.into(),
            },
            payload,
        );
        event.correlation_id = Some(correlation_id.into());
        event
    }

    /// An event emitted by a node
    pub fn from_node(
        event_type: impl Into<String>,
        node_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::new(
            event_type,
            EventSource {
                kind: SourceKind::Node,
                id: node_id.into(),
            },
            payload,
        )
    }

    /// An engine lifecycle event
    pub fn from_system(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self::new(
            event_type,
            EventSource {
                kind: SourceKind::System,
                id: "engine".to_string(),
            },
            payload,
        )
    }

    /// Attach a correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// How an event was matched to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationMethod {
    /// Matched on the event correlation id
    CorrelationId,
    /// Matched by a subscription correlation expression
    Expression,
    /// Type-only fan-out
    EventType,
}

/// A delivered event in an instance's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    /// The immutable event
    pub event: ProcessEvent,
    /// When the dispatcher delivered it to this instance
    pub received_at: DateTime<Utc>,
    /// How the event was matched
    pub matched_by: CorrelationMethod,
}

impl ReceivedEvent {
    /// Record a delivery at the current time
    pub fn now(event: ProcessEvent, matched_by: CorrelationMethod) -> Self {
        Self {
            event,
            received_at: Utc::now(),
            matched_by,
        }
    }
}

/// Event types published by the engine itself
pub mod lifecycle {
    /// Instance created and started
    pub const PROCESS_STARTED: &str = "process.started";
    /// Instance reached a terminal node and closed
    pub const PROCESS_COMPLETED: &str = "process.completed";
    /// Instance failed terminally
    pub const PROCESS_FAILED: &str = "process.failed";
    /// Instance suspended by request
    pub const PROCESS_SUSPENDED: &str = "process.suspended";
    /// Instance resumed by request
    pub const PROCESS_RESUMED: &str = "process.resumed";
    /// Instance cancelled by request
    pub const PROCESS_CANCELLED: &str = "process.cancelled";
    /// Node handler invocation began
    pub const NODE_STARTED: &str = "node.started";
    /// Node executed successfully
    pub const NODE_EXECUTED: &str = "node.executed";
    /// Node failed
    pub const NODE_FAILED: &str = "node.failed";
    /// Node skipped by remediation
    pub const NODE_SKIPPED: &str = "node.skipped";
    /// Edge traversed during advancement
    pub const EDGE_TRAVERSED: &str = "edge.traversed";
}
