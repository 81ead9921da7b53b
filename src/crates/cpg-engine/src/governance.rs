//! Execution governance - the checks between selection and invocation
//!
//! Three checks run immediately before a handler is invoked, each
//! individually disableable:
//!
//! 1. **Idempotency** - the key `instance|node|execution-count|state-hash`
//!    must not have been recorded before; duplicates are skipped.
//! 2. **Authorization** - the principal from `client.principal` (default
//!    `SYSTEM`) must hold the permission the action type requires.
//! 3. **Policy** - the operational system state must not be `emergency` or
//!    `maintenance`; gate outcomes were already verified by the kernel
//!    during availability evaluation.
//!
//! A rejection short-circuits execution and is recorded as a
//! `governance-reject` trace by the orchestrator.

use dashmap::DashSet;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

use cpg_core::instance::ProcessInstance;
use cpg_core::node::{ActionType, Node};

use crate::config::GovernanceConfig;
use crate::runtime::SystemState;

/// Principal assumed when the client context names none
pub const SYSTEM_PRINCIPAL: &str = "SYSTEM";

/// Which governance check rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceCheck {
    /// Duplicate execution
    Idempotency,
    /// Missing permission
    Authorization,
    /// Policy or operational veto
    Policy,
}

impl GovernanceCheck {
    /// Trace label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idempotency => "idempotency",
            Self::Authorization => "authorization",
            Self::Policy => "policy",
        }
    }
}

/// A governance rejection with its reason
#[derive(Debug, Clone)]
pub struct GovernanceRejection {
    /// The rejecting check
    pub check: GovernanceCheck,
    /// Why it rejected
    pub reason: String,
}

/// Permission an action type requires from the principal
pub fn required_permission(action_type: ActionType) -> Option<&'static str> {
    match action_type {
        ActionType::SystemInvocation => Some("action:invoke"),
        ActionType::HumanTask => Some("task:execute"),
        ActionType::AgentAssisted => Some("agent:invoke"),
        ActionType::Decision => Some("decision:evaluate"),
        ActionType::Notification => Some("notification:send"),
        ActionType::Wait => None,
    }
}

/// Stable hash of a JSON map, key-order independent
fn state_hash(state: &Map<String, Value>) -> u64 {
    fn feed(value: &Value, hasher: &mut DefaultHasher) {
        match value {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => (1u8, b).hash(hasher),
            Value::Number(n) => (2u8, n.to_string()).hash(hasher),
            Value::String(s) => (3u8, s).hash(hasher),
            Value::Array(items) => {
                4u8.hash(hasher);
                for item in items {
                    feed(item, hasher);
                }
            }
            Value::Object(map) => {
                5u8.hash(hasher);
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    key.hash(hasher);
                    feed(&map[key], hasher);
                }
            }
        }
    }

    let mut hasher = DefaultHasher::new();
    feed(&Value::Object(state.clone()), &mut hasher);
    hasher.finish()
}

/// The execution governor
pub struct ExecutionGovernor {
    config: GovernanceConfig,
    recorded: DashSet<String>,
}

impl ExecutionGovernor {
    /// Create a governor with the given toggles
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            recorded: DashSet::new(),
        }
    }

    /// Idempotency key for the upcoming execution of a node
    pub fn idempotency_key(instance: &ProcessInstance, node_id: &str) -> String {
        format!(
            "{}|{}|{}|{:016x}",
            instance.instance_id,
            node_id,
            instance.execution_count(node_id),
            state_hash(&instance.context.accumulated_state),
        )
    }

    /// Run the checks; `None` means approved
    pub fn review(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        system_state: SystemState,
    ) -> Option<GovernanceRejection> {
        if self.config.idempotency_enabled {
            let key = Self::idempotency_key(instance, &node.id);
            if self.recorded.contains(&key) {
                debug!(node = %node.id, "duplicate execution skipped");
                return Some(GovernanceRejection {
                    check: GovernanceCheck::Idempotency,
                    reason: "duplicate".to_string(),
                });
            }
        }

        if self.config.authorization_enabled {
            if let Some(rejection) = self.authorize(instance, node) {
                return Some(rejection);
            }
        }

        if self.config.policy_enabled && system_state.blocks_execution() {
            return Some(GovernanceRejection {
                check: GovernanceCheck::Policy,
                reason: format!("system state is {}", system_state.as_str()),
            });
        }

        None
    }

    fn authorize(&self, instance: &ProcessInstance, node: &Node) -> Option<GovernanceRejection> {
        let principal = instance
            .context
            .client_context
            .get("principal")
            .and_then(Value::as_str)
            .unwrap_or(SYSTEM_PRINCIPAL);

        if principal == SYSTEM_PRINCIPAL {
            return None;
        }
        let Some(required) = required_permission(node.action.action_type) else {
            return None;
        };

        let granted = instance
            .context
            .client_context
            .get("permissions")
            .and_then(Value::as_array)
            .map(|perms| perms.iter().any(|p| p.as_str() == Some(required)))
            .unwrap_or(false);

        if granted {
            None
        } else {
            Some(GovernanceRejection {
                check: GovernanceCheck::Authorization,
                reason: format!("principal '{}' lacks permission '{}'", principal, required),
            })
        }
    }

    /// Record an execution key; returns false when it was already recorded
    ///
    /// Called exactly once per committed execution, which is what bounds
    /// `record` to at-most-once per `(instance, node, execution-count)`.
    pub fn record_execution(&self, key: String) -> bool {
        self.recorded.insert(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpg_core::context::ExecutionContext;
    use cpg_core::node::ActionSpec;
    use serde_json::json;

    fn instance_with_client(client: Value) -> ProcessInstance {
        let context = ExecutionContext::new(client.as_object().cloned().unwrap(), Map::new());
        ProcessInstance::new("g", 1, context)
    }

    fn governor() -> ExecutionGovernor {
        ExecutionGovernor::new(GovernanceConfig::default())
    }

    #[test]
    fn system_principal_is_always_authorized() {
        let instance = instance_with_client(json!({}));
        let node = Node::new("n", ActionSpec::system("svc"));
        assert!(governor().review(&instance, &node, SystemState::Normal).is_none());
    }

    #[test]
    fn named_principal_needs_the_permission() {
        let node = Node::new("n", ActionSpec::system("svc"));

        let denied = instance_with_client(json!({"principal": "alice", "permissions": []}));
        let rejection = governor().review(&denied, &node, SystemState::Normal).unwrap();
        assert_eq!(rejection.check, GovernanceCheck::Authorization);

        let granted = instance_with_client(
            json!({"principal": "alice", "permissions": ["action:invoke"]}),
        );
        assert!(governor().review(&granted, &node, SystemState::Normal).is_none());
    }

    #[test]
    fn wait_actions_need_no_permission() {
        let instance = instance_with_client(json!({"principal": "alice", "permissions": []}));
        let node = Node::new("n", ActionSpec::wait());
        assert!(governor().review(&instance, &node, SystemState::Normal).is_none());
    }

    #[test]
    fn emergency_and_maintenance_veto_execution() {
        let instance = instance_with_client(json!({}));
        let node = Node::new("n", ActionSpec::wait());

        for state in [SystemState::Emergency, SystemState::Maintenance] {
            let rejection = governor().review(&instance, &node, state).unwrap();
            assert_eq!(rejection.check, GovernanceCheck::Policy);
        }
        assert!(governor().review(&instance, &node, SystemState::Degraded).is_none());
    }

    #[test]
    fn recorded_key_rejects_duplicates() {
        let governor = governor();
        let instance = instance_with_client(json!({}));
        let node = Node::new("n", ActionSpec::wait());

        let key = ExecutionGovernor::idempotency_key(&instance, "n");
        assert!(governor.record_execution(key.clone()));
        assert!(!governor.record_execution(key));

        let rejection = governor.review(&instance, &node, SystemState::Normal).unwrap();
        assert_eq!(rejection.check, GovernanceCheck::Idempotency);
        assert_eq!(rejection.reason, "duplicate");
    }

    #[test]
    fn key_changes_with_execution_count_and_state() {
        let mut instance = instance_with_client(json!({}));
        let base = ExecutionGovernor::idempotency_key(&instance, "n");

        instance.record_execution(cpg_core::instance::NodeExecution::completed(
            "n",
            chrono::Utc::now(),
            json!({}),
        ));
        let after_execution = ExecutionGovernor::idempotency_key(&instance, "n");
        assert_ne!(base, after_execution);

        instance
            .context
            .merge_state(json!({"k": 1}).as_object().unwrap());
        let after_state = ExecutionGovernor::idempotency_key(&instance, "n");
        assert_ne!(after_execution, after_state);
    }

    #[test]
    fn state_hash_is_key_order_independent() {
        let a = json!({"x": 1, "y": {"b": 2, "a": 3}}).as_object().cloned().unwrap();
        let b = json!({"y": {"a": 3, "b": 2}, "x": 1}).as_object().cloned().unwrap();
        assert_eq!(state_hash(&a), state_hash(&b));
        let c = json!({"x": 2, "y": {"a": 3, "b": 2}}).as_object().cloned().unwrap();
        assert_ne!(state_hash(&a), state_hash(&c));
    }

    #[test]
    fn disabled_checks_are_skipped() {
        let governor = ExecutionGovernor::new(GovernanceConfig {
            idempotency_enabled: false,
            authorization_enabled: false,
            policy_enabled: false,
        });
        let instance = instance_with_client(json!({"principal": "mallory", "permissions": []}));
        let node = Node::new("n", ActionSpec::system("svc"));
        assert!(governor.review(&instance, &node, SystemState::Emergency).is_none());
    }
}
