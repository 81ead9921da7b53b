//! Default decision evaluator - an in-process decision table
//!
//! [`TableDecisionEvaluator`] resolves decision references against a
//! registry of closures. References are either a bare decision name
//! (resolved in the default model) or `model.decision`. Useful for tests
//! and embedders that do not run a full decision engine.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::ports::DecisionEvaluator;

type DecisionFn = dyn Fn(&Map<String, Value>) -> Result<Value> + Send + Sync;

/// In-process decision registry
#[derive(Clone, Default)]
pub struct TableDecisionEvaluator {
    decisions: Arc<DashMap<String, Arc<DecisionFn>>>,
}

impl TableDecisionEvaluator {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decision under a reference
    ///
    /// The reference is stored verbatim: register `credit.approve` to serve
    /// `credit.approve`, or a bare name to serve default-model lookups.
    pub fn register<F>(&self, decision_ref: impl Into<String>, decision: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.decisions.insert(decision_ref.into(), Arc::new(decision));
    }

    /// Register a decision returning a fixed value
    pub fn register_fixed(&self, decision_ref: impl Into<String>, value: Value) {
        self.register(decision_ref, move |_| Ok(value.clone()));
    }

    fn resolve(&self, decision_ref: &str) -> Option<Arc<DecisionFn>> {
        if let Some(found) = self.decisions.get(decision_ref) {
            return Some(found.value().clone());
        }
        // `model.decision` falls back to the bare decision name
        decision_ref
            .rsplit_once('.')
            .and_then(|(_, bare)| self.decisions.get(bare).map(|f| f.value().clone()))
    }
}

#[async_trait]
impl DecisionEvaluator for TableDecisionEvaluator {
    async fn evaluate(&self, decision_ref: &str, inputs: &Map<String, Value>) -> Result<Value> {
        match self.resolve(decision_ref) {
            Some(decision) => decision(inputs),
            None => Err(CoreError::decision(decision_ref, "decision not registered")),
        }
    }
}
