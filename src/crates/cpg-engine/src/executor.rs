//! Action execution - handler resolution and timeout enforcement
//!
//! Handlers are resolved from `(action type, handler ref)`. An unresolved
//! reference falls back to the diagnostic handler so a graph with unbound
//! handlers still advances. The per-action timeout is enforced here: a
//! handler that overruns produces a synthetic failure of kind `timeout`,
//! which the orchestrator routes through compensation like any other
//! action failure.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use cpg_core::instance::ProcessInstance;
use cpg_core::node::{ActionType, Node};
use cpg_core::ports::{ActionHandler, ActionRequest, ActionResult};
use cpg_core::shim::DiagnosticActionHandler;

/// Error kind of a synthetic timeout failure
pub const TIMEOUT_ERROR_KIND: &str = "timeout";

/// Registry resolving `(action type, handler ref)` to handlers
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
}

impl HandlerRegistry {
    /// Create a registry with the diagnostic fallback
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: Arc::new(DiagnosticActionHandler::new()),
        }
    }

    /// Replace the fallback handler
    pub fn with_fallback(mut self, fallback: Arc<dyn ActionHandler>) -> Self {
        self.fallback = fallback;
        self
    }

    fn key(action_type: ActionType, handler_ref: &str) -> String {
        format!("{:?}:{}", action_type, handler_ref)
    }

    /// Bind a handler to `(action type, handler ref)`
    pub fn register(
        &self,
        action_type: ActionType,
        handler_ref: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.handlers
            .insert(Self::key(action_type, &handler_ref.into()), handler);
    }

    /// Bind a handler to every ref of an action type
    pub fn register_for_type(&self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(Self::key(action_type, "*"), handler);
    }

    /// Resolve the handler for a node's action
    pub fn resolve(&self, action_type: ActionType, handler_ref: Option<&str>) -> Arc<dyn ActionHandler> {
        if let Some(handler_ref) = handler_ref {
            if let Some(handler) = self.handlers.get(&Self::key(action_type, handler_ref)) {
                return handler.value().clone();
            }
        }
        if let Some(handler) = self.handlers.get(&Self::key(action_type, "*")) {
            return handler.value().clone();
        }
        debug!(
            ?action_type,
            handler_ref = handler_ref.unwrap_or("<none>"),
            "falling back to diagnostic handler"
        );
        self.fallback.clone()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke a node's action with timeout enforcement
///
/// Handler `Err` returns are mapped to non-retryable failures of kind
/// `unknown`; overruns to retryable failures of kind `timeout`. The engine
/// itself never aborts on a handler failure.
pub async fn invoke_action(
    registry: &HandlerRegistry,
    instance: &ProcessInstance,
    node: &Node,
    scope: Map<String, Value>,
    rule_outputs: Map<String, Value>,
    attempt: u32,
    cancelled: watch::Receiver<bool>,
    default_timeout: Duration,
) -> ActionResult {
    let handler = registry.resolve(node.action.action_type, node.action.handler_ref.as_deref());
    let timeout = node
        .action
        .config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let request = ActionRequest {
        instance_id: instance.instance_id.clone(),
        node_id: node.id.clone(),
        action: node.action.clone(),
        scope,
        rule_outputs,
        attempt,
        cancelled,
    };

    match tokio::time::timeout(timeout, handler.execute(request)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(node = %node.id, error = %err, "handler infrastructure fault");
            ActionResult::fail("unknown", err.to_string(), false)
        }
        Err(_) => {
            warn!(node = %node.id, ?timeout, "action timed out");
            ActionResult::fail(
                TIMEOUT_ERROR_KIND,
                format!("action exceeded {}s", timeout.as_secs()),
                true,
            )
        }
    }
}
