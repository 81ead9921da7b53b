//! Runtime scope assembly
//!
//! Each step sees one read-only scope: the instance's execution context
//! compartments plus the engine's operational context. Expressions reach
//! the operational state as `operational.systemState`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cpg_core::instance::ProcessInstance;

/// Engine-wide operational state consulted by governance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemState {
    /// Normal operation
    Normal,
    /// Degraded but executing
    Degraded,
    /// Execution vetoed by governance
    Emergency,
    /// Execution vetoed by governance
    Maintenance,
}

impl SystemState {
    /// True when governance must reject all executions
    pub fn blocks_execution(&self) -> bool {
        matches!(self, Self::Emergency | Self::Maintenance)
    }

    /// Scope representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Emergency => "emergency",
            Self::Maintenance => "maintenance",
        }
    }
}

/// Build the runtime scope for one step of an instance
pub fn runtime_scope(instance: &ProcessInstance, system_state: SystemState) -> Map<String, Value> {
    let mut scope = instance.context.scope();

    let mut operational = Map::new();
    operational.insert(
        "systemState".to_string(),
        Value::String(system_state.as_str().to_string()),
    );
    scope.insert("operational".to_string(), Value::Object(operational));

    let mut inst = Map::new();
    inst.insert("id".to_string(), Value::String(instance.instance_id.clone()));
    inst.insert("graphId".to_string(), Value::String(instance.graph_id.clone()));
    if let Some(correlation_id) = &instance.correlation_id {
        inst.insert(
            "correlationId".to_string(),
            Value::String(correlation_id.clone()),
        );
    }
    scope.insert("instance".to_string(), Value::Object(inst));

    scope
}
