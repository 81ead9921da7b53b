//! Default port implementations
//!
//! None of these are required in production: each satisfies the matching
//! port contract so tests and simple embedders work out of the box, and a
//! real expression or decision engine can replace them without touching the
//! kernel.

mod decision;
mod expr;
mod handler;
mod policy;
mod publisher;

pub use decision::TableDecisionEvaluator;
pub use expr::PathExpressionEvaluator;
pub use handler::DiagnosticActionHandler;
pub use policy::{DecisionBackedPolicyEvaluator, DecisionBackedRuleEvaluator};
pub use publisher::BroadcastEventPublisher;
