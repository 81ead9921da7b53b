//! Execution context - the five compartments of instance state
//!
//! [`ExecutionContext`] splits instance state into `client_context`,
//! `domain_context`, `accumulated_state`, `event_history`, and
//! `obligations`. Expressions see a single read-only scope built by
//! [`ExecutionContext::scope`]: the nested compartment keys (`client`,
//! `domain`, `state`, `events`, `obligations`) are laid down first, then
//! flattened convenience keys from the first three compartments are overlaid
//! *without* shadowing the nested keys - on a name collision the nested form
//! is authoritative.
//!
//! Accumulated state grows by [`deep_merge`]: nested objects merge key-wise
//! while scalars and arrays are replaced, which keeps merges idempotent when
//! a handler retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::ReceivedEvent;

/// Status of a tracked obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObligationStatus {
    /// Outstanding
    Pending,
    /// Satisfied
    Fulfilled,
    /// Deadline passed without fulfillment
    Breached,
    /// Explicitly waived
    Waived,
}

/// An obligation registered by a business rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    /// Obligation id, derived from the registering rule
    pub id: String,
    /// Optional deadline
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Current status
    pub status: ObligationStatus,
}

/// The per-instance execution context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller-supplied client compartment
    #[serde(default)]
    pub client_context: Map<String, Value>,
    /// Business domain compartment
    #[serde(default)]
    pub domain_context: Map<String, Value>,
    /// State accumulated from action outputs and rule derivations
    #[serde(default)]
    pub accumulated_state: Map<String, Value>,
    /// Append-only delivered event history
    #[serde(default)]
    pub event_history: Vec<ReceivedEvent>,
    /// Tracked obligations
    #[serde(default)]
    pub obligations: Vec<Obligation>,
}

impl ExecutionContext {
    /// Create a context from initial client and domain compartments
    pub fn new(client_context: Map<String, Value>, domain_context: Map<String, Value>) -> Self {
        Self {
            client_context,
            domain_context,
            ..Default::default()
        }
    }

    /// Merge an action output into accumulated state
    pub fn merge_state(&mut self, output: &Map<String, Value>) {
        for (key, value) in output {
            match self.accumulated_state.get_mut(key) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    self.accumulated_state.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Append a delivered event to the history
    pub fn record_event(&mut self, received: ReceivedEvent) {
        self.event_history.push(received);
    }

    /// True when an event of this type has been delivered
    pub fn has_event(&self, event_type: &str) -> bool {
        self.event_history.iter().any(|r| r.event.event_type == event_type)
    }

    /// Register a pending obligation; existing ids are left untouched
    pub fn add_obligation(&mut self, id: impl Into<String>, deadline: Option<DateTime<Utc>>) {
        let id = id.into();
        if self.obligations.iter().any(|o| o.id == id) {
            return;
        }
        self.obligations.push(Obligation {
            id,
            deadline,
            status: ObligationStatus::Pending,
        });
    }

    /// Update an obligation's status
    pub fn set_obligation_status(&mut self, id: &str, status: ObligationStatus) -> bool {
        match self.obligations.iter_mut().find(|o| o.id == id) {
            Some(obligation) => {
                obligation.status = status;
                true
            }
            None => false,
        }
    }

    /// Build the read-only expression scope
    ///
    /// Nested compartment keys first, then flattened aliases from client,
    /// domain, and state. Aliases never shadow: a flattened key that collides
    /// with an existing key (nested or an earlier alias) is dropped.
    pub fn scope(&self) -> Map<String, Value> {
        let mut scope = Map::new();
        scope.insert("client".to_string(), Value::Object(self.client_context.clone()));
        scope.insert("domain".to_string(), Value::Object(self.domain_context.clone()));
        scope.insert("state".to_string(), Value::Object(self.accumulated_state.clone()));
        scope.insert(
            "events".to_string(),
            Value::Array(
                self.event_history
                    .iter()
                    .map(|r| {
                        let mut entry = Map::new();
                        entry.insert("type".to_string(), Value::String(r.event.event_type.clone()));
                        entry.insert("id".to_string(), Value::String(r.event.event_id.clone()));
                        entry.insert(
                            "receivedAt".to_string(),
                            Value::String(r.received_at.to_rfc3339()),
                        );
                        entry.insert("payload".to_string(), Value::Object(r.event.payload.clone()));
                        Value::Object(entry)
                    })
                    .collect(),
            ),
        );
        scope.insert(
            "obligations".to_string(),
            serde_json::to_value(&self.obligations)
                .unwrap_or(Value::Array(Vec::new())),
        );

        for compartment in [&self.client_context, &self.domain_context, &self.accumulated_state] {
            for (key, value) in compartment {
                if !scope.contains_key(key) {
                    scope.insert(key.clone(), value.clone());
                }
            }
        }

        scope
    }
}

/// Merge `other` into `base`
///
/// Objects merge key-wise; any other pairing replaces `base` with a clone of
/// `other`. Arrays are replaced, not concatenated.
pub fn deep_merge(base: &mut Value, other: &Value) {
    match (base, other) {
        (Value::Object(base_map), Value::Object(other_map)) => {
            for (key, other_value) in other_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, other_value),
                    None => {
                        base_map.insert(key.clone(), other_value.clone());
                    }
                }
            }
        }
        (base, other) => {
            *base = other.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CorrelationMethod, ProcessEvent};
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn deep_merge_merges_nested_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": "keep"});
        deep_merge(&mut base, &json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": "keep"}));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let mut base = json!({"items": [1, 2, 3]});
        deep_merge(&mut base, &json!({"items": [4]}));
        assert_eq!(base, json!({"items": [4]}));
    }

    #[test]
    fn deep_merge_is_idempotent() {
        let update = json!({"a": {"x": [1, 2]}, "b": 7});
        let mut once = json!({"a": {"x": [0], "y": true}});
        deep_merge(&mut once, &update);
        let mut twice = once.clone();
        deep_merge(&mut twice, &update);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_state_accumulates() {
        let mut ctx = ExecutionContext::default();
        ctx.merge_state(&map(json!({"order": {"total": 10}})));
        ctx.merge_state(&map(json!({"order": {"status": "paid"}})));
        assert_eq!(
            Value::Object(ctx.accumulated_state.clone()),
            json!({"order": {"total": 10, "status": "paid"}})
        );
    }

    #[test]
    fn scope_exposes_nested_and_flattened_keys() {
        let ctx = ExecutionContext::new(
            map(json!({"principal": "alice"})),
            map(json!({"amount": 100})),
        );
        let scope = ctx.scope();

        assert_eq!(scope["client"]["principal"], json!("alice"));
        assert_eq!(scope["domain"]["amount"], json!(100));
        // flattened aliases
        assert_eq!(scope["principal"], json!("alice"));
        assert_eq!(scope["amount"], json!(100));
    }

    #[test]
    fn flattened_keys_never_shadow_nested_keys() {
        // a client key named "state" must not clobber the state compartment
        let mut ctx = ExecutionContext::new(map(json!({"state": "texas"})), Map::new());
        ctx.merge_state(&map(json!({"status": "OK"})));
        let scope = ctx.scope();

        assert_eq!(scope["state"], json!({"status": "OK"}));
        assert_eq!(scope["status"], json!("OK"));
    }

    #[test]
    fn flattened_collision_between_compartments_keeps_first() {
        let ctx = ExecutionContext::new(
            map(json!({"region": "client-side"})),
            map(json!({"region": "domain-side"})),
        );
        let scope = ctx.scope();
        assert_eq!(scope["region"], json!("client-side"));
        assert_eq!(scope["domain"]["region"], json!("domain-side"));
    }

    #[test]
    fn event_history_visible_in_scope() {
        let mut ctx = ExecutionContext::default();
        ctx.record_event(ReceivedEvent::now(
            ProcessEvent::from_node("step.done", "a", Map::new()),
            CorrelationMethod::CorrelationId,
        ));
        assert!(ctx.has_event("step.done"));
        assert!(!ctx.has_event("step.other"));

        let scope = ctx.scope();
        assert_eq!(scope["events"][0]["type"], json!("step.done"));
    }

    #[test]
    fn obligations_register_once_and_update() {
        let mut ctx = ExecutionContext::default();
        ctx.add_obligation("kyc-refresh", None);
        ctx.add_obligation("kyc-refresh", None);
        assert_eq!(ctx.obligations.len(), 1);

        assert!(ctx.set_obligation_status("kyc-refresh", ObligationStatus::Fulfilled));
        assert_eq!(ctx.obligations[0].status, ObligationStatus::Fulfilled);
        assert!(!ctx.set_obligation_status("missing", ObligationStatus::Waived));
    }
}
