//! Store error types

use thiserror::Error;

/// Convenience result type using [`StoreError`]
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by graph, instance, and trace stores
#[derive(Error, Debug)]
pub enum StoreError {
    /// No graph with the requested id (and version, when given)
    #[error("graph not found: {graph_id}{}", version.map(|v| format!(" v{}", v)).unwrap_or_default())]
    GraphNotFound {
        /// Requested graph id
        graph_id: String,
        /// Requested version, when one was specified
        version: Option<u32>,
    },

    /// No instance with the requested id
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// No trace with the requested id
    #[error("trace not found: {0}")]
    TraceNotFound(String),

    /// Optimistic concurrency check failed on save
    ///
    /// The caller read `expected` but the store holds `actual`; re-read the
    /// instance and re-apply the step.
    #[error("version conflict on instance {instance_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Instance id
        instance_id: String,
        /// Version the caller read at step start
        expected: u64,
        /// Version currently in the store
        actual: u64,
    },

    /// Encoding or decoding a stored record failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create a graph-not-found error
    pub fn graph_not_found(graph_id: impl Into<String>, version: Option<u32>) -> Self {
        Self::GraphNotFound {
            graph_id: graph_id.into(),
            version,
        }
    }
}
