//! # cpg-engine - Governed orchestration for contextualized process graphs
//!
//! The runtime that drives [`cpg_core`] graphs: a per-instance step loop
//! (assemble scope → eligible space → select → govern → execute → commit →
//! advance → trace), an event correlator and dispatcher, a compensation and
//! retry state machine, and a bounded work queue with per-instance
//! exclusive execution.
//!
//! ## Shape
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Orchestrator                                               │
//! │   start / step / signal / suspend / resume / cancel        │
//! │                                                            │
//! │  ┌──────────┐   ┌──────────┐   ┌────────────┐              │
//! │  │ eligible │──▶│ selector │──▶│ governance │──┐           │
//! │  └──────────┘   └──────────┘   └────────────┘  │           │
//! │        ▲                                       ▼           │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │ dispatcher │   │ compensation │◀──│   executor   │      │
//! │  └────────────┘   └──────────────┘   └──────────────┘      │
//! │        ▲                  │                 │              │
//! │        │                  ▼                 ▼              │
//! │   Signal(event)     commit + advance + one trace per step  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every step commits atomically to the instance store (optimistic
//! compare-and-swap) and appends exactly one decision trace before the
//! instance lock is released. Handler failures never abort the engine;
//! they route through the compensation machinery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cpg_core::edge::Edge;
//! use cpg_core::graph::ProcessGraph;
//! use cpg_core::node::{ActionSpec, Node};
//! use cpg_engine::{Orchestrator, StartOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = ProcessGraph::builder("hello")
//!         .node(Node::new("greet", ActionSpec::system("greeter")))
//!         .node(Node::new("done", ActionSpec::wait()))
//!         .edge(Edge::new("e1", "greet", "done"))
//!         .entry("greet")
//!         .terminal("done")
//!         .build()?;
//!
//!     let engine = Orchestrator::builder().build().await;
//!     engine.put_graph(graph).await?;
//!
//!     let receipt = engine
//!         .start("hello", StartOptions::new().context(json!({"client": {}})))
//!         .await?;
//!     let status = engine.run_to_quiescence(&receipt.instance_id).await?;
//!     println!("instance finished as {:?}", status);
//!     Ok(())
//! }
//! ```

pub mod compensation;
pub mod config;
pub mod dispatcher;
pub mod eligible;
pub mod executor;
pub mod governance;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod selector;

use thiserror::Error;

use cpg_core::error::CoreError;
use cpg_core::instance::InstanceStatus;
use cpg_store::StoreError;

pub use config::{EngineConfig, GovernanceConfig};
pub use orchestrator::{
    InstanceHistory, InstanceStatusView, Orchestrator, OrchestratorBuilder, StartOptions,
    StartReceipt,
};
pub use runtime::SystemState;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the engine's public operations
///
/// Evaluator and handler failures never surface here - they become typed
/// blocks and compensation paths. These are the caller-facing errors: bad
/// references, bad lifecycle transitions, and resource pressure.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No such graph template
    #[error("graph not found: {graph_id}{}", version.map(|v| format!(" v{}", v)).unwrap_or_default())]
    GraphNotFound {
        /// Requested graph id
        graph_id: String,
        /// Requested version, when one was specified
        version: Option<u32>,
    },

    /// No such instance
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The operation is not valid in the instance's current status
    #[error("instance {instance_id} is {status:?}; cannot {operation}")]
    InvalidState {
        /// Instance id
        instance_id: String,
        /// Current status
        status: InstanceStatus,
        /// Rejected operation
        operation: String,
    },

    /// Cancel was called on an already-terminal instance
    #[error("instance {instance_id} is already terminal ({status:?})")]
    AlreadyTerminal {
        /// Instance id
        instance_id: String,
        /// Terminal status
        status: InstanceStatus,
    },

    /// The initial context was not a JSON object
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// The work queue stayed full past the enqueue deadline
    #[error("work queue full; retry later")]
    Backpressure,

    /// Store failure other than a missing record
    #[error("store error: {0}")]
    Store(StoreError),

    /// Domain-model failure (validation, unknown node or edge)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Programming error; fatal to the current step only
    #[error("unknown engine error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Create an invalid-state error
    pub fn invalid_state(
        instance_id: impl Into<String>,
        status: InstanceStatus,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            instance_id: instance_id.into(),
            status,
            operation: operation.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::GraphNotFound { graph_id, version } => {
                Self::GraphNotFound { graph_id, version }
            }
            StoreError::InstanceNotFound(id) => Self::InstanceNotFound(id),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_engine_variants() {
        let err: EngineError = StoreError::graph_not_found("g", Some(2)).into();
        assert!(matches!(err, EngineError::GraphNotFound { .. }));

        let err: EngineError = StoreError::InstanceNotFound("i".to_string()).into();
        assert!(matches!(err, EngineError::InstanceNotFound(_)));

        let err: EngineError = StoreError::VersionConflict {
            instance_id: "i".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
