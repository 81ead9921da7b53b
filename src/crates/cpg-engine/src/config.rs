//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Toggles for the three governance checks
///
/// All checks are on by default; each can be disabled independently for
/// embedders that enforce the concern elsewhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Skip duplicate executions via idempotency keys
    pub idempotency_enabled: bool,
    /// Check the principal's permissions against the action
    pub authorization_enabled: bool,
    /// Enforce policy gates and the operational system state
    pub policy_enabled: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            idempotency_enabled: true,
            authorization_enabled: true,
            policy_enabled: true,
        }
    }
}

/// Engine runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Background worker count; 0 disables background driving so callers
    /// step instances explicitly
    pub workers: usize,
    /// Bounded work queue capacity
    pub queue_capacity: usize,
    /// How long an enqueue may block before returning a backpressure error
    pub enqueue_deadline_ms: u64,
    /// Action timeout applied when a node does not configure one
    pub default_action_timeout_secs: u64,
    /// Upper bound on steps per drive, a guard against graph cycles
    pub max_steps_per_drive: u32,
    /// Governance check toggles
    pub governance: GovernanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            enqueue_deadline_ms: 5_000,
            default_action_timeout_secs: 300,
            max_steps_per_drive: 100,
            governance: GovernanceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the work queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the enqueue deadline
    pub fn with_enqueue_deadline_ms(mut self, ms: u64) -> Self {
        self.enqueue_deadline_ms = ms;
        self
    }

    /// Set the default action timeout
    pub fn with_default_action_timeout_secs(mut self, secs: u64) -> Self {
        self.default_action_timeout_secs = secs;
        self
    }

    /// Set the per-drive step bound
    pub fn with_max_steps_per_drive(mut self, steps: u32) -> Self {
        self.max_steps_per_drive = steps;
        self
    }

    /// Replace the governance toggles
    pub fn with_governance(mut self, governance: GovernanceConfig) -> Self {
        self.governance = governance;
        self
    }

    /// Enqueue deadline as a [`Duration`]
    pub fn enqueue_deadline(&self) -> Duration {
        Duration::from_millis(self.enqueue_deadline_ms)
    }

    /// Default action timeout as a [`Duration`]
    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_secs(self.default_action_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.workers > 0);
        assert!(config.queue_capacity > 0);
        assert!(config.governance.idempotency_enabled);
    }

    #[test]
    fn builders_chain() {
        let config = EngineConfig::default()
            .with_workers(0)
            .with_queue_capacity(8)
            .with_enqueue_deadline_ms(10)
            .with_governance(GovernanceConfig {
                idempotency_enabled: false,
                authorization_enabled: true,
                policy_enabled: true,
            });

        assert_eq!(config.workers, 0);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.enqueue_deadline(), Duration::from_millis(10));
        assert!(!config.governance.idempotency_enabled);
    }
}
