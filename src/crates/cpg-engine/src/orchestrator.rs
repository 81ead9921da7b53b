//! The orchestrator - public operations and the per-instance step loop
//!
//! One logical step: assemble the runtime scope, build the eligible space,
//! select deterministically, run governance, invoke the action handler,
//! commit the state delta, advance over outbound edges, and append exactly
//! one decision trace. All of it happens under the instance's exclusive
//! lock, and the commit is an optimistic compare-and-swap: a version
//! conflict re-reads and re-steps.
//!
//! Failures take the compensation path (§ `compensation`); events arrive
//! through [`Orchestrator::signal`] and are correlated and delivered under
//! the same lock discipline.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cpg_core::context::ExecutionContext;
use cpg_core::eval::{select_edges, EvaluatorKernel, NodeEvaluation};
use cpg_core::event::{lifecycle, ProcessEvent, ReceivedEvent};
use cpg_core::graph::ProcessGraph;
use cpg_core::instance::{InstanceStatus, NodeExecution, ProcessInstance};
use cpg_core::node::{EmitTiming, Node, RuleCategory};
use cpg_core::ports::{ActionError, EventPublisher};
use cpg_core::shim::{
    BroadcastEventPublisher, DecisionBackedPolicyEvaluator, DecisionBackedRuleEvaluator,
    PathExpressionEvaluator, TableDecisionEvaluator,
};
use cpg_core::trace::{
    ContextSnapshot, DecisionSnapshot, DecisionTrace, EdgeConsideration, EvaluationSnapshot,
    GovernanceSnapshot, TraceType,
};
use cpg_store::{
    GraphStore, InMemoryGraphStore, InMemoryInstanceStore, InMemoryTraceStore, InstanceStore,
    StoreError, TraceStore,
};

use crate::compensation::{self, CompensationDecision, FailureTracker};
use crate::config::EngineConfig;
use crate::dispatcher::correlate;
use crate::eligible::{self, event_gate_open, join_satisfied};
use crate::executor::{invoke_action, HandlerRegistry};
use crate::governance::ExecutionGovernor;
use crate::runtime::{runtime_scope, SystemState};
use crate::scheduler::{Scheduler, WorkItem, WorkReason};
use crate::selector::{self, SelectionDecision};
use crate::{EngineError, Result};

/// Options for [`Orchestrator::start`]
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Graph version; `None` selects the latest published
    pub graph_version: Option<u32>,
    /// Business correlation id
    pub correlation_id: Option<String>,
    /// Initial context: an object whose `client` and `domain` keys seed
    /// those compartments; other top-level keys land in the domain
    /// compartment
    pub context: Value,
}

impl StartOptions {
    /// Empty options
    pub fn new() -> Self {
        Self {
            graph_version: None,
            correlation_id: None,
            context: Value::Null,
        }
    }

    /// Pin a graph version
    pub fn graph_version(mut self, version: u32) -> Self {
        self.graph_version = Some(version);
        self
    }

    /// Set the business correlation id
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the initial context
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl Default for StartOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`Orchestrator::start`]
#[derive(Debug, Clone)]
pub struct StartReceipt {
    /// Freshly created instance id
    pub instance_id: String,
    /// Initial status, always `Running`
    pub status: InstanceStatus,
}

/// Result of [`Orchestrator::status`]
#[derive(Debug, Clone)]
pub struct InstanceStatusView {
    /// Instance id
    pub instance_id: String,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Currently active node ids
    pub active_node_ids: BTreeSet<String>,
    /// Currently pending edge ids
    pub pending_edge_ids: BTreeSet<String>,
}

/// Result of [`Orchestrator::history`]
#[derive(Debug, Clone)]
pub struct InstanceHistory {
    /// Ordered node executions
    pub executions: Vec<NodeExecution>,
    /// Ordered decision traces
    pub traces: Vec<DecisionTrace>,
}

struct StepReport {
    status: InstanceStatus,
    progressed: bool,
}

enum FailureOutcome {
    RetryScheduled,
    AlternateActivated(String),
    Skipped,
    Compensated(String),
    Escalated(String),
    NodeFailed,
}

/// Builder for [`Orchestrator`]
///
/// Defaults to in-memory stores and the shim evaluators, so a bare
/// `Orchestrator::builder().build().await` is a fully working engine.
pub struct OrchestratorBuilder {
    graphs: Option<Arc<dyn GraphStore>>,
    instances: Option<Arc<dyn InstanceStore>>,
    traces: Option<Arc<dyn TraceStore>>,
    kernel: Option<EvaluatorKernel>,
    registry: Option<Arc<HandlerRegistry>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    config: EngineConfig,
}

impl OrchestratorBuilder {
    fn new() -> Self {
        Self {
            graphs: None,
            instances: None,
            traces: None,
            kernel: None,
            registry: None,
            publisher: None,
            config: EngineConfig::default(),
        }
    }

    /// Use a specific graph store
    pub fn graph_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.graphs = Some(store);
        self
    }

    /// Use a specific instance store
    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instances = Some(store);
        self
    }

    /// Use a specific trace store
    pub fn trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(store);
        self
    }

    /// Use a specific evaluator kernel
    pub fn kernel(mut self, kernel: EvaluatorKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Use a specific handler registry
    pub fn handlers(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a specific event publisher
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Use a specific engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine and spawn its worker pool
    pub async fn build(self) -> Arc<Orchestrator> {
        let kernel = self.kernel.unwrap_or_else(|| {
            let decisions = Arc::new(TableDecisionEvaluator::new());
            EvaluatorKernel::new(
                Arc::new(PathExpressionEvaluator::new()),
                Arc::new(DecisionBackedPolicyEvaluator::new(decisions.clone())),
                Arc::new(DecisionBackedRuleEvaluator::new(decisions)),
            )
        });
        let config = self.config;
        let scheduler = Scheduler::new(
            config.queue_capacity,
            config.enqueue_deadline(),
            config.workers > 0,
        );

        let orchestrator = Arc::new(Orchestrator {
            graphs: self.graphs.unwrap_or_else(|| Arc::new(InMemoryGraphStore::new())),
            instances: self
                .instances
                .unwrap_or_else(|| Arc::new(InMemoryInstanceStore::new())),
            traces: self.traces.unwrap_or_else(|| Arc::new(InMemoryTraceStore::new())),
            kernel,
            registry: self.registry.unwrap_or_else(|| Arc::new(HandlerRegistry::new())),
            governor: ExecutionGovernor::new(config.governance),
            failures: FailureTracker::new(),
            publisher: self
                .publisher
                .unwrap_or_else(|| Arc::new(BroadcastEventPublisher::default())),
            scheduler,
            system_state: parking_lot::RwLock::new(SystemState::Normal),
            config,
        });

        if orchestrator.config.workers > 0 {
            let weak = Arc::downgrade(&orchestrator);
            orchestrator
                .scheduler
                .start_workers(orchestrator.config.workers, move |item| {
                    let weak = weak.clone();
                    async move {
                        if let Some(engine) = weak.upgrade() {
                            engine.process_work(item).await;
                        }
                    }
                })
                .await;
        }

        orchestrator
    }
}

/// The governed process orchestration engine
pub struct Orchestrator {
    graphs: Arc<dyn GraphStore>,
    instances: Arc<dyn InstanceStore>,
    traces: Arc<dyn TraceStore>,
    kernel: EvaluatorKernel,
    registry: Arc<HandlerRegistry>,
    governor: ExecutionGovernor,
    failures: FailureTracker,
    publisher: Arc<dyn EventPublisher>,
    scheduler: Scheduler,
    system_state: parking_lot::RwLock<SystemState>,
    config: EngineConfig,
}

impl Orchestrator {
    /// Start building an engine
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Store a graph template (authoring convenience)
    pub async fn put_graph(&self, graph: ProcessGraph) -> Result<()> {
        graph.validate()?;
        self.graphs.put(graph).await?;
        Ok(())
    }

    /// Set the operational system state consulted by governance
    pub fn set_system_state(&self, state: SystemState) {
        *self.system_state.write() = state;
    }

    /// Start a new instance of a graph
    pub async fn start(&self, graph_id: &str, options: StartOptions) -> Result<StartReceipt> {
        let graph = self.graphs.get(graph_id, options.graph_version).await?;
        let context = parse_context(options.context)?;

        let mut instance = ProcessInstance::new(graph.graph_id.clone(), graph.version, context);
        if let Some(correlation_id) = options.correlation_id {
            instance = instance.with_correlation(correlation_id);
        }
        let instance_id = instance.instance_id.clone();
        instance.version = self.instances.save(&instance).await?;

        if self
            .scheduler
            .enqueue(WorkItem {
                instance_id: instance_id.clone(),
                reason: WorkReason::Start,
            })
            .await
            .is_err()
        {
            // no hidden state on error: the half-started instance goes away
            let _ = self.instances.remove(&instance_id).await;
            return Err(EngineError::Backpressure);
        }

        info!(instance = %instance_id, graph = %graph.graph_id, "instance started");
        self.publish_lifecycle(lifecycle::PROCESS_STARTED, &instance, None).await;
        Ok(StartReceipt {
            instance_id,
            status: InstanceStatus::Running,
        })
    }

    /// Execute one step of an instance
    pub async fn step(&self, instance_id: &str) -> Result<InstanceStatus> {
        let lock = self.scheduler.lock_for(instance_id);
        let _guard = lock.lock().await;
        let report = self.step_locked(instance_id).await?;
        Ok(report.status)
    }

    /// Drive an instance until it waits, finishes, or hits the step bound
    pub async fn run_to_quiescence(&self, instance_id: &str) -> Result<InstanceStatus> {
        let lock = self.scheduler.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut status = InstanceStatus::Running;
        for _ in 0..self.config.max_steps_per_drive {
            let report = self.step_locked(instance_id).await?;
            status = report.status;
            if !report.progressed || status != InstanceStatus::Running {
                return Ok(status);
            }
        }
        warn!(instance = %instance_id, "step bound reached; yielding");
        Ok(status)
    }

    /// Deliver an external event; returns the affected instance ids
    pub async fn signal(&self, event: ProcessEvent) -> Result<Vec<String>> {
        let mut affected = Vec::new();
        for instance_id in self.instances.list_ids().await? {
            let lock = self.scheduler.lock_for(&instance_id);
            let _guard = lock.lock().await;
            if self.deliver_to(&event, &instance_id).await? {
                affected.push(instance_id);
            }
        }
        Ok(affected)
    }

    /// Suspend a running instance (idempotent)
    pub async fn suspend(&self, instance_id: &str) -> Result<InstanceStatus> {
        let lock = self.scheduler.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.instances.load(instance_id).await?;
        match instance.status {
            InstanceStatus::Suspended => Ok(InstanceStatus::Suspended),
            InstanceStatus::Running => {
                instance.status = InstanceStatus::Suspended;
                self.instances.save(&instance).await?;
                self.append_trace(
                    DecisionTrace::new(instance_id, TraceType::Navigation)
                        .with_context(ContextSnapshot::of(&instance.context))
                        .with_outcome("suspended", None),
                )
                .await;
                self.publish_lifecycle(lifecycle::PROCESS_SUSPENDED, &instance, None).await;
                Ok(InstanceStatus::Suspended)
            }
            status => Err(EngineError::invalid_state(instance_id, status, "suspend")),
        }
    }

    /// Resume a suspended instance
    pub async fn resume(&self, instance_id: &str) -> Result<InstanceStatus> {
        let lock = self.scheduler.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.instances.load(instance_id).await?;
        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::invalid_state(instance_id, instance.status, "resume"));
        }
        // the pinned graph must still resolve
        self.graphs
            .get(&instance.graph_id, Some(instance.graph_version))
            .await?;

        instance.status = InstanceStatus::Running;
        self.instances.save(&instance).await?;
        self.append_trace(
            DecisionTrace::new(instance_id, TraceType::Navigation)
                .with_context(ContextSnapshot::of(&instance.context))
                .with_outcome("resumed", None),
        )
        .await;
        self.publish_lifecycle(lifecycle::PROCESS_RESUMED, &instance, None).await;

        if self
            .scheduler
            .enqueue(WorkItem {
                instance_id: instance_id.to_string(),
                reason: WorkReason::Resume,
            })
            .await
            .is_err()
        {
            return Err(EngineError::Backpressure);
        }
        Ok(InstanceStatus::Running)
    }

    /// Cancel an instance
    pub async fn cancel(&self, instance_id: &str) -> Result<InstanceStatus> {
        // signal before taking the lock so an in-flight handler can observe
        // cancellation while the step still holds the instance
        self.scheduler.signal_cancel(instance_id);

        let lock = self.scheduler.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.instances.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                instance_id: instance_id.to_string(),
                status: instance.status,
            });
        }

        instance.close(InstanceStatus::Cancelled);
        self.instances.save(&instance).await?;
        self.append_trace(
            DecisionTrace::new(instance_id, TraceType::Terminal)
                .with_context(ContextSnapshot::of(&instance.context))
                .with_outcome("cancelled", None),
        )
        .await;
        self.publish_lifecycle(lifecycle::PROCESS_CANCELLED, &instance, None).await;
        self.scheduler.forget(instance_id);
        info!(instance = %instance_id, "instance cancelled");
        Ok(InstanceStatus::Cancelled)
    }

    /// Current status with the active and pending sets
    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatusView> {
        let instance = self.instances.load(instance_id).await?;
        Ok(InstanceStatusView {
            instance_id: instance.instance_id.clone(),
            status: instance.status,
            active_node_ids: instance.active_node_ids.clone(),
            pending_edge_ids: instance.pending_edge_ids.clone(),
        })
    }

    /// Event types that could unblock the instance's progress
    pub async fn available_events(&self, instance_id: &str) -> Result<Vec<String>> {
        let instance = self.instances.load(instance_id).await?;
        let graph = self
            .graphs
            .get(&instance.graph_id, Some(instance.graph_version))
            .await?;

        let completed = instance.completed_node_ids();
        let mut types = BTreeSet::new();

        for node in &graph.nodes {
            if completed.contains(node.id.as_str()) {
                continue;
            }
            for subscription in &node.event_config.subscribes {
                types.insert(subscription.event_type.clone());
            }
        }
        for edge_id in &instance.pending_edge_ids {
            let Some(edge) = graph.edge(edge_id) else { continue };
            for condition in &edge.guards.event_conditions {
                if condition.must_have_occurred && !instance.context.has_event(&condition.event_type) {
                    types.insert(condition.event_type.clone());
                }
            }
            for trigger in &edge.triggers.reevaluation {
                types.insert(trigger.clone());
            }
        }
        for edge in &graph.edges {
            if !edge.triggers.activating.is_empty()
                && completed.contains(edge.source.as_str())
                && !instance.traversed_edge_ids.contains(&edge.id)
            {
                for trigger in &edge.triggers.activating {
                    types.insert(trigger.clone());
                }
            }
        }

        Ok(types.into_iter().collect())
    }

    /// Ordered node executions and decision traces
    pub async fn history(&self, instance_id: &str) -> Result<InstanceHistory> {
        let instance = self.instances.load(instance_id).await?;
        let traces = self.traces.for_instance(instance_id).await?;
        Ok(InstanceHistory {
            executions: instance.node_executions,
            traces,
        })
    }

    /// Decision traces of an instance (audit read)
    pub async fn traces_for(&self, instance_id: &str) -> Result<Vec<DecisionTrace>> {
        Ok(self.traces.for_instance(instance_id).await?)
    }

    // ---- internal: work processing ------------------------------------

    async fn process_work(&self, item: WorkItem) {
        match self.run_to_quiescence(&item.instance_id).await {
            Ok(status) => {
                debug!(instance = %item.instance_id, ?status, reason = ?item.reason, "drive finished")
            }
            Err(EngineError::InvalidState { .. }) | Err(EngineError::InstanceNotFound(_)) => {
                // suspended, cancelled, or removed between enqueue and pickup
            }
            Err(err) => warn!(instance = %item.instance_id, error = %err, "drive failed"),
        }
    }

    // ---- internal: the step pipeline ----------------------------------

    async fn step_locked(&self, instance_id: &str) -> Result<StepReport> {
        for attempt in 0..3 {
            let mut instance = self.instances.load(instance_id).await?;
            match instance.status {
                InstanceStatus::Running => {}
                status => {
                    return Err(EngineError::invalid_state(instance_id, status, "step"));
                }
            }
            let graph = self
                .graphs
                .get(&instance.graph_id, Some(instance.graph_version))
                .await?;
            let system_state = *self.system_state.read();
            let scope = runtime_scope(&instance, system_state);

            let space = eligible::build(&graph, &instance, &self.kernel, &scope).await;
            let considerations = space.considerations();
            let decision = selector::select(&space);
            let decision_snapshot = decision.snapshot();

            let candidates = match decision {
                SelectionDecision::Wait => {
                    self.append_trace(
                        DecisionTrace::new(instance_id, TraceType::Wait)
                            .with_context(ContextSnapshot::of(&instance.context))
                            .with_evaluation(EvaluationSnapshot {
                                nodes: considerations,
                                edges: Vec::new(),
                            })
                            .with_decision(decision_snapshot)
                            .with_outcome("wait", None),
                    )
                    .await;
                    return Ok(StepReport {
                        status: instance.status,
                        progressed: false,
                    });
                }
                SelectionDecision::Execute { nodes, .. } => nodes,
            };

            // governance runs per selected node, before any invocation
            let mut approved = Vec::new();
            let mut rejection = None;
            for candidate in &candidates {
                let node = graph.require_node(&candidate.node_id)?;
                match self.governor.review(&instance, node, system_state) {
                    None => approved.push(candidate),
                    Some(found) => {
                        warn!(
                            instance = %instance_id,
                            node = %candidate.node_id,
                            check = found.check.as_str(),
                            reason = %found.reason,
                            "governance rejected execution"
                        );
                        rejection.get_or_insert((candidate.node_id.clone(), found));
                    }
                }
            }

            if approved.is_empty() {
                let (node_id, found) = rejection.expect("rejection present when nothing approved");
                self.append_trace(
                    DecisionTrace::new(instance_id, TraceType::GovernanceReject)
                        .with_context(ContextSnapshot::of(&instance.context))
                        .with_evaluation(EvaluationSnapshot {
                            nodes: considerations,
                            edges: Vec::new(),
                        })
                        .with_decision(decision_snapshot)
                        .with_governance(GovernanceSnapshot::rejected(
                            found.check.as_str(),
                            format!("{}: {}", node_id, found.reason),
                        ))
                        .with_outcome("governance-reject", Some(found.reason)),
                )
                .await;
                return Ok(StepReport {
                    status: instance.status,
                    progressed: false,
                });
            }

            // execute the approved group concurrently
            let started_at = Utc::now();
            for candidate in &approved {
                let node = graph.require_node(&candidate.node_id)?;
                self.emit_node_emissions(&instance, node, EmitTiming::OnStart, &scope).await;
                self.publish_lifecycle(lifecycle::NODE_STARTED, &instance, Some(&candidate.node_id))
                    .await;
            }
            let invocations = approved.iter().map(|candidate| {
                let node = graph
                    .node(&candidate.node_id)
                    .expect("approved node exists")
                    .clone();
                let scope = scope.clone();
                let rule_outputs = candidate.evaluation.rule_outputs.clone();
                let cancelled = self.scheduler.cancellation(instance_id);
                let attempt = self.failures.count(instance_id, &candidate.node_id);
                let instance_ref = &instance;
                async move {
                    let result = invoke_action(
                        &self.registry,
                        instance_ref,
                        &node,
                        scope,
                        rule_outputs,
                        attempt,
                        cancelled,
                        self.config.default_action_timeout(),
                    )
                    .await;
                    (node.id.clone(), result)
                }
            });
            let results = join_all(invocations).await;

            // commit
            let mut advance_from = Vec::new();
            let mut step_type = TraceType::Execution;
            let mut outcome_kind = "executed".to_string();
            let mut outcome_error = None;

            for (node_id, result) in results {
                let node = graph.require_node(&node_id)?.clone();
                let evaluation = approved
                    .iter()
                    .find(|c| c.node_id == node_id)
                    .map(|c| c.evaluation.clone())
                    .expect("executed candidate present");

                if result.success {
                    self.commit_success(&mut instance, &node, &evaluation, result.output, started_at);
                    self.emit_node_emissions(&instance, &node, EmitTiming::OnComplete, &scope).await;
                    self.publish_lifecycle(lifecycle::NODE_EXECUTED, &instance, Some(&node_id)).await;
                    advance_from.push(node_id);
                } else {
                    let error = result.error.clone().unwrap_or(ActionError {
                        kind: "unknown".to_string(),
                        message: "handler reported failure without detail".to_string(),
                    });
                    outcome_error = Some(format!("{}: {}", error.kind, error.message));
                    let outcome = self
                        .handle_failure(
                            &mut instance,
                            &graph,
                            &node,
                            &evaluation,
                            error,
                            result.retryable,
                            &scope,
                            started_at,
                        )
                        .await;
                    match outcome {
                        FailureOutcome::RetryScheduled => {
                            step_type = TraceType::Retry;
                            outcome_kind = "retry".to_string();
                        }
                        FailureOutcome::AlternateActivated(alternate) => {
                            step_type = TraceType::Compensate;
                            outcome_kind = "alternate".to_string();
                            debug!(instance = %instance_id, node = %node_id, %alternate, "alternate route taken");
                        }
                        FailureOutcome::Skipped => {
                            step_type = TraceType::Compensate;
                            outcome_kind = "skip".to_string();
                            advance_from.push(node_id);
                        }
                        FailureOutcome::Compensated(edge_id) => {
                            step_type = TraceType::Compensate;
                            outcome_kind = "compensate".to_string();
                            debug!(instance = %instance_id, node = %node_id, edge = %edge_id, "compensating edge traversed");
                        }
                        FailureOutcome::Escalated(escalation) => {
                            step_type = TraceType::Compensate;
                            outcome_kind = "escalate".to_string();
                            debug!(instance = %instance_id, node = %node_id, %escalation, "escalation activated");
                        }
                        FailureOutcome::NodeFailed => {
                            step_type = TraceType::Terminal;
                            outcome_kind = "failed".to_string();
                        }
                    }
                }
            }

            // advance over outbound edges of everything that completed
            let mut edge_considerations = Vec::new();
            for node_id in &advance_from {
                self.advance_from(&mut instance, &graph, node_id, &scope, &mut edge_considerations)
                    .await;
            }

            // terminal closure: a completed terminal node and nothing left
            if instance.status == InstanceStatus::Running {
                let completed = instance.completed_node_ids();
                let terminal_done = graph
                    .terminal_nodes
                    .iter()
                    .any(|t| completed.contains(t.as_str()));
                if terminal_done
                    && instance.active_node_ids.is_empty()
                    && instance.pending_edge_ids.is_empty()
                {
                    instance.close(InstanceStatus::Completed);
                    step_type = TraceType::Terminal;
                    outcome_kind = "completed".to_string();
                }
            }

            match self.instances.save(&instance).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict { .. }) if attempt < 2 => {
                    debug!(instance = %instance_id, "version conflict; re-stepping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let mut trace = DecisionTrace::new(instance_id, step_type)
                .with_context(ContextSnapshot::of(&instance.context))
                .with_evaluation(EvaluationSnapshot {
                    nodes: considerations,
                    edges: edge_considerations,
                })
                .with_decision(decision_snapshot)
                .with_governance(GovernanceSnapshot::approved());
            trace = match outcome_error {
                Some(error) => trace.with_failure(outcome_kind, error),
                None => trace.with_outcome(outcome_kind, None),
            };
            self.append_trace(trace).await;

            if instance.status == InstanceStatus::Completed {
                self.publish_lifecycle(lifecycle::PROCESS_COMPLETED, &instance, None).await;
                self.scheduler.forget(instance_id);
                info!(instance = %instance_id, "instance completed");
            }

            return Ok(StepReport {
                status: instance.status,
                progressed: true,
            });
        }

        Err(EngineError::Unknown(format!(
            "instance {} kept conflicting during commit",
            instance_id
        )))
    }

    fn commit_success(
        &self,
        instance: &mut ProcessInstance,
        node: &Node,
        evaluation: &NodeEvaluation,
        output: Value,
        started_at: DateTime<Utc>,
    ) {
        // at-most-once: the key is computed against the pre-commit state,
        // matching what governance reviewed
        let key = ExecutionGovernor::idempotency_key(instance, &node.id);
        self.governor.record_execution(key);
        self.failures.reset(&instance.instance_id, &node.id);

        if let Value::Object(map) = &output {
            instance.context.merge_state(map);
        }
        // rule outputs are state too; obligations additionally register
        instance.context.merge_state(&evaluation.rule_outputs);
        for rule in &node.business_rules {
            if rule.category == RuleCategory::Obligation {
                instance.context.add_obligation(rule.name.clone(), None);
            }
        }

        instance.record_execution(
            NodeExecution::completed(&node.id, started_at, output)
                .with_evaluation(evaluation.rule_outputs.clone(), evaluation.policy_outcomes.clone()),
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        node: &Node,
        evaluation: &NodeEvaluation,
        error: ActionError,
        retryable: bool,
        scope: &Map<String, Value>,
        started_at: DateTime<Utc>,
    ) -> FailureOutcome {
        let consecutive = self.failures.record_failure(&instance.instance_id, &node.id);
        let decision = compensation::resolve(node, &error, retryable, consecutive);
        let error_text = format!("{}: {}", error.kind, error.message);
        warn!(
            instance = %instance.instance_id,
            node = %node.id,
            error = %error_text,
            consecutive,
            ?decision,
            "action failed"
        );

        let failed_record = || {
            NodeExecution::failed(&node.id, started_at, error_text.clone())
                .with_evaluation(evaluation.rule_outputs.clone(), evaluation.policy_outcomes.clone())
        };

        match decision {
            CompensationDecision::Retry { delay } => {
                instance.record_execution(failed_record());
                // stays active so the next step re-executes it
                instance.active_node_ids.insert(node.id.clone());
                self.scheduler.schedule_wake(&instance.instance_id, delay);
                FailureOutcome::RetryScheduled
            }
            CompensationDecision::Alternate { node_id } => {
                instance.record_execution(failed_record());
                // the alternate sees the failed node's rule outputs
                instance.context.merge_state(&evaluation.rule_outputs);
                instance.active_node_ids.insert(node_id.clone());
                self.failures.reset(&instance.instance_id, &node.id);
                self.publish_lifecycle(lifecycle::NODE_FAILED, instance, Some(&node.id)).await;
                FailureOutcome::AlternateActivated(node_id)
            }
            CompensationDecision::Skip => {
                instance.record_execution(
                    NodeExecution::skipped(&node.id, started_at)
                        .with_evaluation(evaluation.rule_outputs.clone(), evaluation.policy_outcomes.clone()),
                );
                self.failures.reset(&instance.instance_id, &node.id);
                self.publish_lifecycle(lifecycle::NODE_SKIPPED, instance, Some(&node.id)).await;
                FailureOutcome::Skipped
            }
            CompensationDecision::Compensate { edge_id } => {
                instance.record_execution(failed_record());
                self.emit_node_emissions(instance, node, EmitTiming::OnFailure, scope).await;
                self.publish_lifecycle(lifecycle::NODE_FAILED, instance, Some(&node.id)).await;
                self.traverse_compensating_edge(instance, graph, &edge_id, scope).await;
                FailureOutcome::Compensated(edge_id)
            }
            CompensationDecision::Escalate { node_id } => {
                instance.record_execution(failed_record());
                self.publish_lifecycle(lifecycle::NODE_FAILED, instance, Some(&node.id)).await;
                instance.active_node_ids.insert(node_id.clone());
                FailureOutcome::Escalated(node_id)
            }
            CompensationDecision::FailNode => {
                instance.record_execution(failed_record());
                self.emit_node_emissions(instance, node, EmitTiming::OnFailure, scope).await;
                self.publish_lifecycle(lifecycle::NODE_FAILED, instance, Some(&node.id)).await;
                for edge_id in compensation::rollback_targets(graph, instance) {
                    self.traverse_compensating_edge(instance, graph, &edge_id, scope).await;
                }
                instance.close(InstanceStatus::Failed);
                self.publish_lifecycle(lifecycle::PROCESS_FAILED, instance, Some(&node.id)).await;
                self.scheduler.forget(&instance.instance_id);
                FailureOutcome::NodeFailed
            }
        }
    }

    /// Traverse a compensating edge and execute its target once
    ///
    /// Compensation paths never trigger further compensation: a failure
    /// here is recorded and logged, nothing else.
    async fn traverse_compensating_edge(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        edge_id: &str,
        scope: &Map<String, Value>,
    ) {
        let Some(edge) = graph.edge(edge_id) else {
            warn!(instance = %instance.instance_id, edge = %edge_id, "compensating edge missing");
            return;
        };
        let Some(node) = graph.node(&edge.target) else {
            warn!(instance = %instance.instance_id, node = %edge.target, "compensation target missing");
            return;
        };

        instance.traversed_edge_ids.push(edge.id.clone());
        self.publish_edge_traversed(instance, edge.id.as_str()).await;

        let evaluation = self.kernel.evaluate_node(node, scope).await;
        let started_at = Utc::now();
        let result = invoke_action(
            &self.registry,
            instance,
            node,
            scope.clone(),
            evaluation.rule_outputs.clone(),
            0,
            self.scheduler.cancellation(&instance.instance_id),
            self.config.default_action_timeout(),
        )
        .await;

        if result.success {
            if let Value::Object(map) = &result.output {
                instance.context.merge_state(map);
            }
            instance.record_execution(
                NodeExecution::completed(&node.id, started_at, result.output.clone())
                    .with_evaluation(evaluation.rule_outputs, evaluation.policy_outcomes),
            );
            self.publish_lifecycle(lifecycle::NODE_EXECUTED, instance, Some(&node.id)).await;
        } else {
            let message = result
                .error
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|| "compensation failed".to_string());
            warn!(instance = %instance.instance_id, node = %node.id, %message, "compensation execution failed");
            instance.record_execution(NodeExecution::failed(&node.id, started_at, message));
        }
    }

    /// Advance over the outbound edges of a completed node
    async fn advance_from(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        node_id: &str,
        scope: &Map<String, Value>,
        considerations: &mut Vec<EdgeConsideration>,
    ) {
        let source_execution = instance.latest_execution(node_id).cloned();
        let outbound = graph.outbound_edges(node_id);
        let evaluations: Vec<_> = outbound
            .iter()
            .map(|edge| {
                self.kernel
                    .evaluate_edge(edge, scope, source_execution.as_ref(), &instance.context)
            })
            .collect();
        let pairs: Vec<_> = outbound.iter().copied().zip(evaluations.iter()).collect();
        let selection = select_edges(&pairs);

        for (edge, evaluation) in &pairs {
            if !evaluation.traversable {
                considerations.push(EdgeConsideration {
                    edge_id: edge.id.clone(),
                    selected: false,
                    reason: evaluation.reason(),
                });
            }
        }
        for (edge_id, reason) in &selection.passed_over {
            considerations.push(EdgeConsideration {
                edge_id: edge_id.clone(),
                selected: false,
                reason: reason.clone(),
            });
        }
        for edge_id in &selection.selected {
            considerations.push(EdgeConsideration {
                edge_id: edge_id.clone(),
                selected: true,
                reason: "selected".to_string(),
            });
        }

        let completed = instance
            .completed_node_ids()
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>();
        for edge_id in &selection.selected {
            let Some(edge) = graph.edge(edge_id) else { continue };
            instance.traversed_edge_ids.push(edge_id.clone());
            self.publish_edge_traversed(instance, edge_id).await;

            if instance.active_node_ids.contains(&edge.target) || completed.contains(&edge.target) {
                // late arrival at an any-join target that already ran
                continue;
            }
            instance.pending_edge_ids.insert(edge_id.clone());
            self.try_activate(instance, graph, &edge.target, scope).await;
        }
    }

    /// Activate a target whose join, event gate, and preconditions allow it
    async fn try_activate(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        target: &str,
        scope: &Map<String, Value>,
    ) {
        if !join_satisfied(graph, instance, target) {
            return;
        }
        let Some(node) = graph.node(target) else { return };
        if !event_gate_open(node, instance) {
            return;
        }
        let evaluation = self.kernel.evaluate_node(node, scope).await;
        if !evaluation.available {
            debug!(
                instance = %instance.instance_id,
                node = %target,
                reason = %evaluation.reason(),
                "target not yet available; edge stays pending"
            );
            return;
        }

        instance.active_node_ids.insert(target.to_string());
        for edge in graph.inbound_edges(target) {
            instance.pending_edge_ids.remove(&edge.id);
        }
    }

    // ---- internal: event delivery -------------------------------------

    /// Deliver one event to one instance under its lock; true when matched
    async fn deliver_to(&self, event: &ProcessEvent, instance_id: &str) -> Result<bool> {
        for attempt in 0..3 {
            let Ok(mut instance) = self.instances.load(instance_id).await else {
                return Ok(false);
            };
            if instance.status.is_terminal() {
                return Ok(false);
            }
            let graph = self
                .graphs
                .get(&instance.graph_id, Some(instance.graph_version))
                .await?;
            let Some(matched) =
                correlate(event, &instance, &graph, &**self.kernel.expressions())
            else {
                return Ok(false);
            };

            instance
                .context
                .record_event(ReceivedEvent::now(event.clone(), matched.method));
            let system_state = *self.system_state.read();
            let scope = runtime_scope(&instance, system_state);

            let completed: BTreeSet<String> = instance
                .completed_node_ids()
                .iter()
                .map(|s| s.to_string())
                .collect();
            let mut activated = Vec::new();

            // subscribed nodes not already executed or active
            for node_id in &matched.nodes {
                if instance.active_node_ids.contains(node_id) || completed.contains(node_id) {
                    continue;
                }
                let Some(node) = graph.node(node_id) else { continue };
                let evaluation = self.kernel.evaluate_node(node, &scope).await;
                if evaluation.available {
                    instance.active_node_ids.insert(node_id.clone());
                    for edge in graph.inbound_edges(node_id) {
                        instance.pending_edge_ids.remove(&edge.id);
                    }
                    activated.push(node_id.clone());
                }
            }

            // pending edges re-evaluated on their trigger
            for edge in &graph.edges {
                if !instance.pending_edge_ids.contains(&edge.id) {
                    continue;
                }
                if !edge.triggers.reevaluation.iter().any(|t| t == &event.event_type) {
                    continue;
                }
                let source_execution = instance.latest_execution(&edge.source).cloned();
                let evaluation = self.kernel.evaluate_edge(
                    edge,
                    &scope,
                    source_execution.as_ref(),
                    &instance.context,
                );
                if evaluation.traversable {
                    self.try_activate(&mut instance, &graph, &edge.target, &scope).await;
                }
            }

            // activating triggers on edges out of completed sources
            for edge in &graph.edges {
                if !edge.triggers.activating.iter().any(|t| t == &event.event_type) {
                    continue;
                }
                if !completed.contains(&edge.source) || instance.traversed_edge_ids.contains(&edge.id)
                {
                    continue;
                }
                let source_execution = instance.latest_execution(&edge.source).cloned();
                let evaluation = self.kernel.evaluate_edge(
                    edge,
                    &scope,
                    source_execution.as_ref(),
                    &instance.context,
                );
                if evaluation.traversable {
                    instance.traversed_edge_ids.push(edge.id.clone());
                    self.publish_edge_traversed(&instance, &edge.id).await;
                    if !instance.active_node_ids.contains(&edge.target)
                        && !completed.contains(&edge.target)
                    {
                        instance.pending_edge_ids.insert(edge.id.clone());
                        self.try_activate(&mut instance, &graph, &edge.target, &scope).await;
                    }
                }
            }

            match self.instances.save(&instance).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict { .. }) if attempt < 2 => continue,
                Err(err) => return Err(err.into()),
            }

            self.append_trace(
                DecisionTrace::new(instance_id, TraceType::Event)
                    .with_context(ContextSnapshot::of(&instance.context))
                    .with_decision(DecisionSnapshot {
                        selected: activated,
                        criterion: "event-activation".to_string(),
                        alternatives: Vec::new(),
                    })
                    .with_outcome("event-delivered", Some(event.event_type.clone())),
            )
            .await;

            if instance.status == InstanceStatus::Running {
                let _ = self
                    .scheduler
                    .enqueue(WorkItem {
                        instance_id: instance_id.to_string(),
                        reason: WorkReason::Event {
                            event_type: event.event_type.clone(),
                        },
                    })
                    .await;
            }
            return Ok(true);
        }
        Ok(false)
    }

    // ---- internal: event publication ----------------------------------

    async fn publish_lifecycle(
        &self,
        event_type: &str,
        instance: &ProcessInstance,
        node_id: Option<&str>,
    ) {
        let mut payload = Map::new();
        payload.insert(
            "instanceId".to_string(),
            Value::String(instance.instance_id.clone()),
        );
        payload.insert("graphId".to_string(), Value::String(instance.graph_id.clone()));
        if let Some(node_id) = node_id {
            payload.insert("nodeId".to_string(), Value::String(node_id.to_string()));
        }
        let event = ProcessEvent::from_system(event_type, payload).with_correlation(
            instance
                .correlation_id
                .clone()
                .unwrap_or_else(|| instance.instance_id.clone()),
        );
        if let Err(err) = self.publisher.publish(event).await {
            warn!(event_type, error = %err, "lifecycle event publication failed");
        }
    }

    async fn publish_edge_traversed(&self, instance: &ProcessInstance, edge_id: &str) {
        let mut payload = Map::new();
        payload.insert(
            "instanceId".to_string(),
            Value::String(instance.instance_id.clone()),
        );
        payload.insert("edgeId".to_string(), Value::String(edge_id.to_string()));
        let event = ProcessEvent::from_system(lifecycle::EDGE_TRAVERSED, payload).with_correlation(
            instance
                .correlation_id
                .clone()
                .unwrap_or_else(|| instance.instance_id.clone()),
        );
        if let Err(err) = self.publisher.publish(event).await {
            warn!(error = %err, "edge event publication failed");
        }
    }

    async fn emit_node_emissions(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        timing: EmitTiming,
        scope: &Map<String, Value>,
    ) {
        for emission in node.event_config.emissions(timing) {
            let payload = match &emission.payload_expr {
                Some(expr) => match self.kernel.expressions().evaluate(expr, scope) {
                    Ok(Value::Object(map)) => map,
                    Ok(other) => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                    Err(err) => {
                        warn!(
                            node = %node.id,
                            event_type = %emission.event_type,
                            error = %err,
                            "payload expression failed; emitting empty payload"
                        );
                        Map::new()
                    }
                },
                None => Map::new(),
            };
            let event = ProcessEvent::from_node(&emission.event_type, &node.id, payload)
                .with_correlation(
                    instance
                        .correlation_id
                        .clone()
                        .unwrap_or_else(|| instance.instance_id.clone()),
                );
            if let Err(err) = self.publisher.publish(event).await {
                warn!(event_type = %emission.event_type, error = %err, "configured emission failed");
            }
        }
    }

    async fn append_trace(&self, trace: DecisionTrace) {
        if let Err(err) = self.traces.append(trace).await {
            warn!(error = %err, "trace append failed");
        }
    }
}

fn parse_context(context: Value) -> Result<ExecutionContext> {
    match context {
        Value::Null => Ok(ExecutionContext::default()),
        Value::Object(map) => {
            let mut client = Map::new();
            let mut domain = Map::new();
            for (key, value) in map {
                match (key.as_str(), value) {
                    ("client", Value::Object(inner)) => client = inner,
                    ("domain", Value::Object(inner)) => domain = inner,
                    ("client", other) | ("domain", other) => {
                        return Err(EngineError::InvalidContext(format!(
                            "compartment '{}' must be an object, got {}",
                            key, other
                        )));
                    }
                    (_, value) => {
                        domain.insert(key, value);
                    }
                }
            }
            Ok(ExecutionContext::new(client, domain))
        }
        other => Err(EngineError::InvalidContext(format!(
            "initial context must be an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpg_core::edge::Edge;
    use cpg_core::node::ActionSpec;
    use serde_json::json;

    fn linear_graph() -> ProcessGraph {
        ProcessGraph::builder("g")
            .node(Node::new("a", ActionSpec::wait()))
            .node(Node::new("t", ActionSpec::wait()))
            .edge(Edge::new("e1", "a", "t"))
            .entry("a")
            .terminal("t")
            .build()
            .unwrap()
    }

    async fn engine() -> Arc<Orchestrator> {
        let engine = Orchestrator::builder()
            .config(EngineConfig::default().with_workers(0))
            .build()
            .await;
        engine.put_graph(linear_graph()).await.unwrap();
        engine
    }

    #[test]
    fn context_parsing_splits_compartments() {
        let context =
            parse_context(json!({"client": {"principal": "p"}, "domain": {"d": 1}, "loose": true}))
                .unwrap();
        assert_eq!(context.client_context["principal"], json!("p"));
        assert_eq!(context.domain_context["d"], json!(1));
        assert_eq!(context.domain_context["loose"], json!(true));

        assert!(parse_context(json!([1, 2])).is_err());
        assert!(parse_context(json!({"client": 4})).is_err());
        assert!(parse_context(Value::Null).is_ok());
    }

    #[tokio::test]
    async fn start_unknown_graph_is_typed() {
        let engine = engine().await;
        let err = engine.start("ghost", StartOptions::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::GraphNotFound { .. }));
    }

    #[tokio::test]
    async fn suspend_is_idempotent_resume_requires_suspension() {
        let engine = engine().await;
        let receipt = engine.start("g", StartOptions::new()).await.unwrap();
        let id = &receipt.instance_id;

        assert_eq!(engine.suspend(id).await.unwrap(), InstanceStatus::Suspended);
        assert_eq!(engine.suspend(id).await.unwrap(), InstanceStatus::Suspended);

        // step on a suspended instance is invalid-state
        assert!(matches!(
            engine.step(id).await.unwrap_err(),
            EngineError::InvalidState { .. }
        ));

        assert_eq!(engine.resume(id).await.unwrap(), InstanceStatus::Running);
        assert!(matches!(
            engine.resume(id).await.unwrap_err(),
            EngineError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_final() {
        let engine = engine().await;
        let receipt = engine.start("g", StartOptions::new()).await.unwrap();
        let id = &receipt.instance_id;

        assert_eq!(engine.cancel(id).await.unwrap(), InstanceStatus::Cancelled);
        assert!(matches!(
            engine.cancel(id).await.unwrap_err(),
            EngineError::AlreadyTerminal { .. }
        ));
        // cancelled, not failed
        assert_eq!(engine.status(id).await.unwrap().status, InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn status_reports_active_and_pending_sets() {
        let engine = engine().await;
        let receipt = engine.start("g", StartOptions::new()).await.unwrap();
        engine.step(&receipt.instance_id).await.unwrap();

        let view = engine.status(&receipt.instance_id).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Running);
        assert!(view.active_node_ids.contains("t"));
    }

    #[tokio::test]
    async fn completed_instance_rejects_steps() {
        let engine = engine().await;
        let receipt = engine.start("g", StartOptions::new()).await.unwrap();
        let status = engine.run_to_quiescence(&receipt.instance_id).await.unwrap();
        assert_eq!(status, InstanceStatus::Completed);

        assert!(matches!(
            engine.step(&receipt.instance_id).await.unwrap_err(),
            EngineError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_instance_is_typed() {
        let engine = engine().await;
        assert!(matches!(
            engine.status("nope").await.unwrap_err(),
            EngineError::InstanceNotFound(_)
        ));
        assert!(matches!(
            engine.history("nope").await.unwrap_err(),
            EngineError::InstanceNotFound(_)
        ));
        assert!(matches!(
            engine.available_events("nope").await.unwrap_err(),
            EngineError::InstanceNotFound(_)
        ));
    }
}
