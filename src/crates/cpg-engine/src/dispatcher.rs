//! Event correlation - matching external events to instances
//!
//! Three correlation methods, tried in order:
//!
//! 1. **correlation-id** - the event's correlation id equals the instance
//!    id or the instance's business correlation id.
//! 2. **expression** - a node subscription carries a correlation
//!    expression; it is evaluated against a scope combining the event and
//!    the instance. This is the only place external input drives expression
//!    evaluation, so the expression port sits behind the engine's timeout
//!    discipline and sees a frozen scope.
//! 3. **event-type** - type-only fan-out to subscriptions without a
//!    correlation expression, applied only to events that carry no
//!    correlation id of their own.
//!
//! Delivery itself happens in the orchestrator under the instance lock;
//! this module only decides who is matched.

use serde_json::{Map, Value};
use tracing::debug;

use cpg_core::event::{CorrelationMethod, ProcessEvent};
use cpg_core::graph::ProcessGraph;
use cpg_core::instance::ProcessInstance;
use cpg_core::ports::{is_truthy, ExpressionEvaluator};

/// An event matched to one instance
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationMatch {
    /// Matched instance
    pub instance_id: String,
    /// How it matched
    pub method: CorrelationMethod,
    /// Subscribed nodes the match applies to
    pub nodes: Vec<String>,
}

/// Scope for a subscription correlation expression
///
/// Nested `event` and `instance` keys first, then the event payload and the
/// instance context overlaid without shadowing them.
pub fn correlation_scope(event: &ProcessEvent, instance: &ProcessInstance) -> Map<String, Value> {
    let mut scope = Map::new();

    let mut event_obj = Map::new();
    event_obj.insert("type".to_string(), Value::String(event.event_type.clone()));
    event_obj.insert("id".to_string(), Value::String(event.event_id.clone()));
    event_obj.insert(
        "correlationId".to_string(),
        event
            .correlation_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    event_obj.insert("payload".to_string(), Value::Object(event.payload.clone()));
    scope.insert("event".to_string(), Value::Object(event_obj));

    let mut instance_obj = Map::new();
    instance_obj.insert("id".to_string(), Value::String(instance.instance_id.clone()));
    instance_obj.insert(
        "correlationId".to_string(),
        instance
            .correlation_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    instance_obj.insert("graphId".to_string(), Value::String(instance.graph_id.clone()));
    scope.insert("instance".to_string(), Value::Object(instance_obj));

    for (key, value) in &event.payload {
        if !scope.contains_key(key) {
            scope.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in instance.context.scope() {
        if !scope.contains_key(&key) {
            scope.insert(key, value);
        }
    }

    scope
}

/// Match an event against one instance
pub fn correlate(
    event: &ProcessEvent,
    instance: &ProcessInstance,
    graph: &ProcessGraph,
    expressions: &dyn ExpressionEvaluator,
) -> Option<CorrelationMatch> {
    let subscribers = graph.subscribers(&event.event_type);

    // 1. correlation id against instance id or business correlation id
    if let Some(correlation_id) = event.correlation_id.as_deref().filter(|c| !c.is_empty()) {
        if correlation_id == instance.instance_id
            || instance.correlation_id.as_deref() == Some(correlation_id)
        {
            return Some(CorrelationMatch {
                instance_id: instance.instance_id.clone(),
                method: CorrelationMethod::CorrelationId,
                nodes: subscribers.iter().map(|n| n.id.clone()).collect(),
            });
        }
    }

    // 2. subscription correlation expressions
    let mut expression_matches = Vec::new();
    for node in &subscribers {
        let Some(subscription) = node.event_config.subscription(&event.event_type) else {
            continue;
        };
        let Some(expr) = &subscription.correlation_expr else {
            continue;
        };
        let scope = correlation_scope(event, instance);
        match expressions.evaluate(expr, &scope) {
            Ok(value) if is_truthy(&value) => expression_matches.push(node.id.clone()),
            Ok(_) => {}
            Err(err) => {
                debug!(
                    node = %node.id,
                    event_type = %event.event_type,
                    error = %err,
                    "correlation expression errored; treated as no match"
                );
            }
        }
    }
    if !expression_matches.is_empty() {
        return Some(CorrelationMatch {
            instance_id: instance.instance_id.clone(),
            method: CorrelationMethod::Expression,
            nodes: expression_matches,
        });
    }

    // 3. type-only fan-out for untargeted events
    if event.correlation_id.as_deref().map_or(true, str::is_empty) {
        let plain: Vec<String> = subscribers
            .iter()
            .filter(|n| {
                n.event_config
                    .subscription(&event.event_type)
                    .map_or(false, |s| s.correlation_expr.is_none())
            })
            .map(|n| n.id.clone())
            .collect();
        if !plain.is_empty() {
            return Some(CorrelationMatch {
                instance_id: instance.instance_id.clone(),
                method: CorrelationMethod::EventType,
                nodes: plain,
            });
        }
    }

    None
}
