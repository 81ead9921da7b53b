//! Default action handler - the diagnostic fallback
//!
//! Resolves every action to a success carrying a diagnostic output naming
//! the unresolved handler. Wait actions get an empty output. The engine's
//! handler registry falls back to this when `(action type, handler ref)`
//! resolves to nothing, so a graph with unbound handlers still advances.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::node::ActionType;
use crate::ports::{ActionHandler, ActionRequest, ActionResult};

/// Fallback handler succeeding with a diagnostic output
#[derive(Debug, Clone, Default)]
pub struct DiagnosticActionHandler;

impl DiagnosticActionHandler {
    /// Create the handler
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionHandler for DiagnosticActionHandler {
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult> {
        if request.action.action_type == ActionType::Wait {
            return Ok(ActionResult::ok(json!({})));
        }

        debug!(
            node = %request.node_id,
            action_type = ?request.action.action_type,
            handler_ref = request.action.handler_ref.as_deref().unwrap_or("<none>"),
            "no handler bound, returning diagnostic output"
        );
        Ok(ActionResult::ok(json!({
            "diagnostic": {
                "unresolvedHandler": request.action.handler_ref,
                "actionType": format!("{:?}", request.action.action_type),
                "node": request.node_id,
            }
        })))
    }
}
