//! Compensation and retry - what happens when an action fails
//!
//! Resolution order on a failure, per node configuration:
//!
//! 1. Remediation routes matching the error kind, in declaration order. A
//!    `retry` route applies while its budget lasts, then resolution moves
//!    to the next matching route.
//! 2. Retryable failures retry up to the action's `retry_count` with
//!    exponential backoff (base 1 s, cap 60 s, factor 2, full jitter).
//! 3. A matching escalation route activates its escalation node.
//! 4. Otherwise the node fails terminally and the rollback walk runs:
//!    newest-first over the traversed-edge chain, traversing each
//!    `rollback` compensating edge once.
//!
//! Counters track *consecutive* failures per `(instance, node)`; any
//! success resets them. Compensation paths never trigger further
//! compensation.

use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use cpg_core::edge::CompensationStrategy;
use cpg_core::graph::ProcessGraph;
use cpg_core::instance::ProcessInstance;
use cpg_core::node::{Node, RemediationStrategy};
use cpg_core::ports::ActionError;

/// Retry backoff base
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Retry backoff cap
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// What the engine should do about a failed action
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationDecision {
    /// Schedule a retry after the given backoff delay
    Retry {
        /// Full-jitter backoff delay
        delay: Duration,
    },
    /// Switch execution to another node, preserving rule outputs
    Alternate {
        /// Replacement node id
        node_id: String,
    },
    /// Treat the node as completed with empty output
    Skip,
    /// Emit failure events and traverse the named compensating edge
    Compensate {
        /// Compensating edge id
        edge_id: String,
    },
    /// Activate the matching escalation node
    Escalate {
        /// Escalation node id
        node_id: String,
    },
    /// Terminal failure for the node; the rollback walk follows
    FailNode,
}

/// Full-jitter exponential backoff for the given 0-based attempt
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let cap = exp.min(BACKOFF_CAP);
    let jittered = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
    Duration::from_millis(jittered)
}

/// Consecutive-failure counters per `(instance, node)`
#[derive(Default)]
pub struct FailureTracker {
    counters: DashMap<(String, String), u32>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; returns the new consecutive count
    pub fn record_failure(&self, instance_id: &str, node_id: &str) -> u32 {
        let mut entry = self
            .counters
            .entry((instance_id.to_string(), node_id.to_string()))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    /// Reset the counter after a success
    pub fn reset(&self, instance_id: &str, node_id: &str) {
        self.counters
            .remove(&(instance_id.to_string(), node_id.to_string()));
    }

    /// Current consecutive count
    pub fn count(&self, instance_id: &str, node_id: &str) -> u32 {
        self.counters
            .get(&(instance_id.to_string(), node_id.to_string()))
            .map(|entry| *entry)
            .unwrap_or(0)
    }
}

/// Resolve what to do about a failed action
///
/// `consecutive_failures` includes the failure being resolved.
pub fn resolve(node: &Node, error: &ActionError, retryable: bool, consecutive_failures: u32) -> CompensationDecision {
    // remediation routes win; a retry route falls through to the next
    // matching route once its budget is spent
    for route in &node.exception_routes.remediations {
        if route.error_kind != error.kind {
            continue;
        }
        match &route.strategy {
            RemediationStrategy::Retry { max_retries } => {
                if consecutive_failures <= *max_retries {
                    debug!(
                        node = %node.id,
                        attempt = consecutive_failures,
                        max_retries,
                        "remediation retry"
                    );
                    return CompensationDecision::Retry {
                        delay: backoff_delay(consecutive_failures.saturating_sub(1)),
                    };
                }
            }
            RemediationStrategy::Alternate { node: alternate } => {
                return CompensationDecision::Alternate {
                    node_id: alternate.clone(),
                };
            }
            RemediationStrategy::Skip => return CompensationDecision::Skip,
            RemediationStrategy::Compensate { compensating_edge } => {
                return CompensationDecision::Compensate {
                    edge_id: compensating_edge.clone(),
                };
            }
            RemediationStrategy::Fail => return CompensationDecision::FailNode,
        }
    }

    // flagged-retryable actions get the configured retry budget
    if retryable && consecutive_failures <= node.action.config.retry_count {
        return CompensationDecision::Retry {
            delay: backoff_delay(consecutive_failures.saturating_sub(1)),
        };
    }

    if let Some(route) = node.exception_routes.escalation(&error.kind) {
        return CompensationDecision::Escalate {
            node_id: route.escalation_node.clone(),
        };
    }

    CompensationDecision::FailNode
}

/// Compensating edges to traverse for a terminal node failure
///
/// Walks the traversed-edge chain newest-first; every edge whose
/// compensation strategy is `rollback` contributes its compensating edge
/// once. Single pass: an edge id already collected is not collected again.
pub fn rollback_targets(graph: &ProcessGraph, instance: &ProcessInstance) -> Vec<String> {
    let mut targets = Vec::new();
    for edge_id in instance.traversed_edge_ids.iter().rev() {
        let Some(edge) = graph.edge(edge_id) else { continue };
        let Some(compensation) = &edge.compensation else { continue };
        if compensation.strategy != CompensationStrategy::Rollback {
            continue;
        }
        if let Some(compensating_edge) = &compensation.compensating_edge {
            if !targets.contains(compensating_edge) {
                targets.push(compensating_edge.clone());
            }
        }
    }
    targets
}
