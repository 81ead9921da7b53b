//! Process instances - the long-lived aggregate the engine drives
//!
//! A [`ProcessInstance`] pins a graph version and accumulates execution
//! history: an append-only list of [`NodeExecution`] records, the set of
//! currently active node ids, the set of pending edge ids, and the ordered
//! list of traversed edges the compensation walk uses. The `version` field
//! is the optimistic-concurrency token: every store save compares it and a
//! mismatch forces the engine to re-read and re-step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::ports::PolicyOutcome;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// Actively stepping or waiting for events
    Running,
    /// Explicitly suspended; steps are rejected until resume
    Suspended,
    /// Reached a terminal node with nothing active or pending
    Completed,
    /// Failed terminally
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl InstanceStatus {
    /// True for completed, failed, and cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of one node execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// Scheduled but not started
    Pending,
    /// Handler invocation in flight
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
    /// Skipped by remediation
    Skipped,
}

/// One execution of a node; repeated executions append further records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Node id
    pub node_id: String,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// When the execution finished
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal status of this record
    pub status: ExecutionStatus,
    /// Handler output for successful executions
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message for failed executions
    #[serde(default)]
    pub error: Option<String>,
    /// Merged rule outputs computed at availability evaluation
    #[serde(default)]
    pub rule_outputs: Map<String, Value>,
    /// Policy gate outcomes computed at availability evaluation
    #[serde(default)]
    pub policy_outcomes: HashMap<String, PolicyOutcome>,
}

impl NodeExecution {
    /// A completed record
    pub fn completed(node_id: impl Into<String>, started_at: DateTime<Utc>, result: Value) -> Self {
        Self {
            node_id: node_id.into(),
            started_at,
            completed_at: Some(Utc::now()),
            status: ExecutionStatus::Completed,
            result: Some(result),
            error: None,
            rule_outputs: Map::new(),
            policy_outcomes: HashMap::new(),
        }
    }

    /// A failed record
    pub fn failed(node_id: impl Into<String>, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            started_at,
            completed_at: Some(Utc::now()),
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
            rule_outputs: Map::new(),
            policy_outcomes: HashMap::new(),
        }
    }

    /// A skipped record with empty output
    pub fn skipped(node_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            started_at,
            completed_at: Some(Utc::now()),
            status: ExecutionStatus::Skipped,
            result: Some(Value::Object(Map::new())),
            error: None,
            rule_outputs: Map::new(),
            policy_outcomes: HashMap::new(),
        }
    }

    /// Attach evaluation outputs to the record
    pub fn with_evaluation(
        mut self,
        rule_outputs: Map<String, Value>,
        policy_outcomes: HashMap<String, PolicyOutcome>,
    ) -> Self {
        self.rule_outputs = rule_outputs;
        self.policy_outcomes = policy_outcomes;
        self
    }
}

/// The aggregate root for one run of a process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Instance id
    pub instance_id: String,
    /// Graph template id
    pub graph_id: String,
    /// Pinned graph version
    pub graph_version: u32,
    /// Optional business correlation id
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// When the instance started
    pub started_at: DateTime<Utc>,
    /// When the instance reached a terminal status
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution context compartments
    pub context: ExecutionContext,
    /// Append-only execution history
    #[serde(default)]
    pub node_executions: Vec<NodeExecution>,
    /// Node ids activated but not yet executed
    #[serde(default)]
    pub active_node_ids: BTreeSet<String>,
    /// Traversable edges whose target has not yet activated
    #[serde(default)]
    pub pending_edge_ids: BTreeSet<String>,
    /// Ordered edge ids traversed so far, newest last
    #[serde(default)]
    pub traversed_edge_ids: Vec<String>,
    /// Optimistic concurrency token, bumped by every store save
    pub version: u64,
}

impl ProcessInstance {
    /// Create a running instance with a fresh id
    pub fn new(graph_id: impl Into<String>, graph_version: u32, context: ExecutionContext) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            graph_id: graph_id.into(),
            graph_version,
            correlation_id: None,
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            context,
            node_executions: Vec::new(),
            active_node_ids: BTreeSet::new(),
            pending_edge_ids: BTreeSet::new(),
            traversed_edge_ids: Vec::new(),
            version: 0,
        }
    }

    /// Attach a business correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Node ids with at least one completed execution
    pub fn completed_node_ids(&self) -> BTreeSet<&str> {
        self.node_executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed || e.status == ExecutionStatus::Skipped)
            .map(|e| e.node_id.as_str())
            .collect()
    }

    /// Number of executions recorded for a node
    pub fn execution_count(&self, node_id: &str) -> usize {
        self.node_executions.iter().filter(|e| e.node_id == node_id).count()
    }

    /// Most recent execution record for a node
    pub fn latest_execution(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.iter().rev().find(|e| e.node_id == node_id)
    }

    /// Most recent completed execution record for a node
    pub fn latest_completed_execution(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions
            .iter()
            .rev()
            .find(|e| e.node_id == node_id && e.status == ExecutionStatus::Completed)
    }

    /// Append an execution record and drop the node from the active set
    pub fn record_execution(&mut self, execution: NodeExecution) {
        self.active_node_ids.remove(&execution.node_id);
        self.node_executions.push(execution);
    }

    /// Move to a terminal status and stamp the completion time
    pub fn close(&mut self, status: InstanceStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
    }

    #[test]
    fn record_execution_clears_active_set() {
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.active_node_ids.insert("a".to_string());

        instance.record_execution(NodeExecution::completed("a", Utc::now(), json!({})));

        assert!(instance.active_node_ids.is_empty());
        assert_eq!(instance.execution_count("a"), 1);
        assert!(instance.completed_node_ids().contains("a"));
    }

    #[test]
    fn latest_execution_prefers_newest() {
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.record_execution(NodeExecution::failed("a", Utc::now(), "boom"));
        instance.record_execution(NodeExecution::completed("a", Utc::now(), json!({"ok": true})));

        let latest = instance.latest_execution("a").unwrap();
        assert_eq!(latest.status, ExecutionStatus::Completed);
        assert_eq!(instance.execution_count("a"), 2);
        // latest completed skips failed records
        assert!(instance.latest_completed_execution("a").is_some());
    }

    #[test]
    fn skipped_counts_as_completed_for_progress() {
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.record_execution(NodeExecution::skipped("a", Utc::now()));
        assert!(instance.completed_node_ids().contains("a"));
    }

    #[test]
    fn close_stamps_completion() {
        let mut instance = ProcessInstance::new("g", 1, ExecutionContext::default());
        instance.close(InstanceStatus::Cancelled);
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        assert!(instance.completed_at.is_some());
    }
}
