//! Error types for graph construction and evaluation
//!
//! This module defines all errors that can occur while building, validating,
//! or evaluating a process graph. All errors implement `std::error::Error`
//! via the `thiserror` crate.
//!
//! Evaluator-level failures (expression, decision, rule, policy) are never
//! allowed to crash the engine: the evaluator kernel converts them into
//! typed *blocked* results, and only surfaces a `CoreError` when the caller
//! itself misuses the API (unknown node, invalid graph, bad serialization).

use thiserror::Error;

/// Convenience result type using [`CoreError`]
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the domain model and evaluator kernel
#[derive(Error, Debug)]
pub enum CoreError {
    /// Graph structure validation failed
    ///
    /// Raised by [`ProcessGraph::validate`](crate::graph::ProcessGraph::validate)
    /// and by `GraphBuilder::build` when the template violates a structural
    /// invariant (dangling edge endpoint, edge out of a terminal node,
    /// unreachable terminal, overlapping entry/terminal sets).
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node id was referenced that does not exist in the graph
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// An edge id was referenced that does not exist in the graph
    #[error("edge not found: {0}")]
    EdgeNotFound(String),

    /// An expression could not be evaluated
    ///
    /// Carries the offending expression text so traces can show what was
    /// being evaluated when the port failed.
    #[error("expression '{expression}' failed: {message}")]
    Expression {
        /// Expression source text
        expression: String,
        /// Error reported by the evaluator port
        message: String,
    },

    /// A decision reference could not be resolved or evaluated
    #[error("decision '{decision}' failed: {message}")]
    Decision {
        /// Decision reference (`decision` or `model.decision`)
        decision: String,
        /// Error reported by the decision port
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Create an expression error with context
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create a decision error with context
    pub fn decision(decision: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decision {
            decision: decision.into(),
            message: message.into(),
        }
    }
}
