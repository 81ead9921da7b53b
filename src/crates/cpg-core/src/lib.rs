//! # cpg-core - Domain model and evaluator kernel for process graphs
//!
//! Core building blocks for executing *contextualized process graphs*:
//! workflows whose transitions depend on evaluated context rather than fixed
//! control flow.
//!
//! ## What lives here
//!
//! - **Domain model** - [`graph::ProcessGraph`] templates made of
//!   [`node::Node`]s (governed decision points: preconditions, policy gates,
//!   business rules, an action, event wiring, exception routes) and
//!   [`edge::Edge`]s (guarded transitions with priority and compensation);
//!   [`instance::ProcessInstance`] aggregates with their
//!   [`context::ExecutionContext`] compartments;
//!   [`event::ProcessEvent`]s; immutable [`trace::DecisionTrace`] records.
//! - **Evaluator kernel** - [`eval::EvaluatorKernel`]: pure node and edge
//!   availability evaluation plus deterministic edge selection.
//! - **Ports** - [`ports`]: the traits the engine consumes for expressions,
//!   decisions, policies, rules, actions, and event publication.
//! - **Shims** - [`shim`]: default port implementations for tests and
//!   simple deployments.
//!
//! The orchestration loop, stores, and scheduling live in the `cpg-engine`
//! and `cpg-store` crates; this crate has no side effects and owns no state.
//!
//! ## Example
//!
//! ```rust
//! use cpg_core::edge::Edge;
//! use cpg_core::graph::ProcessGraph;
//! use cpg_core::node::{ActionSpec, Node};
//!
//! let graph = ProcessGraph::builder("loan-intake")
//!     .node(Node::new("receive", ActionSpec::system("intake-service")))
//!     .node(Node::new("done", ActionSpec::wait()))
//!     .edge(Edge::new("e-receive-done", "receive", "done"))
//!     .entry("receive")
//!     .terminal("done")
//!     .build()
//!     .expect("structurally valid graph");
//!
//! assert_eq!(graph.outbound_edges("receive").len(), 1);
//! ```

pub mod context;
pub mod edge;
pub mod error;
pub mod eval;
pub mod event;
pub mod graph;
pub mod instance;
pub mod node;
pub mod ports;
pub mod shim;
pub mod trace;

pub use context::ExecutionContext;
pub use error::{CoreError, Result};
pub use eval::EvaluatorKernel;
pub use event::ProcessEvent;
pub use graph::ProcessGraph;
pub use instance::{InstanceStatus, ProcessInstance};
pub use ports::{
    ActionHandler, ActionRequest, ActionResult, DecisionEvaluator, EventPublisher,
    ExpressionEvaluator, PolicyEvaluator, PolicyOutcome, RuleEvaluator,
};
pub use trace::DecisionTrace;
