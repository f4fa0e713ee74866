use crate::{
    application::action_runtime::{
        outcome_channel, ActionContext, ActionRuntime, Dispatch, OutcomeReceiver, OutcomeReport,
        OutcomeReporter,
    },
    config::EngineConfig,
    domain::events::DomainEvent,
    domain::execution_plan::ExecutionPlan,
    domain::flow_instance::{FlowInstance, InstanceStatus, Outcome},
    domain::graph::{FlowGraph, GraphKind},
    domain::mode::{OperationKind, SessionContext},
    domain::node_type::NodeTypeRegistry,
    domain::repository::{FlowDefinitionRepository, FlowInstanceRepository},
    error::{CoreError, ExecutionError, StructuralError},
    types::{FlowId, InstanceId, NodeId},
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// An instance together with the definition it runs against
struct RunningInstance {
    instance: FlowInstance,
    plan: Arc<ExecutionPlan>,
    graph: Arc<FlowGraph>,
}

/// What one call to `advance` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceReport {
    /// Nodes that were started, in id order
    pub started: Vec<NodeId>,

    /// Started nodes still waiting for a reported outcome
    pub deferred: Vec<NodeId>,

    /// Instance status after the wave
    pub status: InstanceStatus,

    /// Every failed node of the instance so far
    pub failures: Vec<ExecutionError>,
}

/// Handler for domain events
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that writes every event to the log
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl DomainEventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        debug!(
            event_type = event.event_type(),
            instance_id = %event.instance_id(),
            timestamp = %event.timestamp(),
            "Domain event"
        );
        Ok(())
    }
}

/// Service that creates instances and drives them through their graphs
#[derive(Clone)]
pub struct FlowExecutionService {
    /// Repository for flow definitions
    definition_repo: Arc<dyn FlowDefinitionRepository>,

    /// Repository for instance snapshots
    instance_repo: Arc<dyn FlowInstanceRepository>,

    /// Node action runtime
    runtime: Arc<dyn ActionRuntime>,

    /// Node type registry
    registry: Arc<NodeTypeRegistry>,

    /// Session the service acts for
    context: SessionContext,

    /// Event handler
    event_handler: Arc<dyn DomainEventHandler>,

    /// Sender handed to actions
    reporter: OutcomeReporter,

    max_loop_iterations: u32,

    /// Live instances; each is locked while it is mutated
    instances: Arc<DashMap<InstanceId, Arc<Mutex<RunningInstance>>>>,
}

impl FlowExecutionService {
    /// Create a new flow execution service and the receiver for deferred outcomes
    pub fn new(
        definition_repo: Arc<dyn FlowDefinitionRepository>,
        instance_repo: Arc<dyn FlowInstanceRepository>,
        runtime: Arc<dyn ActionRuntime>,
        registry: Arc<NodeTypeRegistry>,
        context: SessionContext,
        config: &EngineConfig,
    ) -> (Self, OutcomeReceiver) {
        let (reporter, receiver) = outcome_channel(config.report_channel_capacity);
        let service = Self {
            definition_repo,
            instance_repo,
            runtime,
            registry,
            context,
            event_handler: Arc::new(LoggingEventHandler),
            reporter,
            max_loop_iterations: config.max_loop_iterations,
            instances: Arc::new(DashMap::with_capacity(16)),
        };
        (service, receiver)
    }

    /// Builder: replace the event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Session the service acts for
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Load a definition and create an instance from it
    pub async fn instantiate(
        &self,
        flow_id: &FlowId,
        parameters: BTreeMap<String, Value>,
    ) -> Result<InstanceId, CoreError> {
        self.gate(OperationKind::Instantiate)?;
        let graph = self
            .definition_repo
            .load_definition(flow_id)
            .await
            .map_err(|e| {
                error!(flow_id = %flow_id, error = %e, "Failed to load flow definition");
                e
            })?;
        self.instantiate_graph(graph, parameters).await
    }

    /// Create an instance from an already loaded definition
    pub async fn instantiate_graph(
        &self,
        graph: FlowGraph,
        parameters: BTreeMap<String, Value>,
    ) -> Result<InstanceId, CoreError> {
        self.gate(OperationKind::Instantiate)?;

        let violations = graph.validate(&self.registry);
        if !violations.is_empty() {
            debug!(flow_id = %graph.id, violations = violations.len(), "Refusing to instantiate invalid graph");
            return Err(StructuralError::InvalidGraph(violations.into_iter().collect()).into());
        }

        let plan = ExecutionPlan::build(&graph, &self.registry)?
            .with_max_loop_iterations(self.max_loop_iterations);
        let mut instance = FlowInstance::new(
            InstanceId::generate(),
            &plan,
            self.context.user().clone(),
            parameters,
        );
        let instance_id = instance.id.clone();

        info!(
            flow_id = %graph.id,
            instance_id = %instance_id,
            user = %self.context.user(),
            "Instance created"
        );

        self.persist(&instance).await?;
        self.handle_events(&mut instance).await?;

        self.instances.insert(
            instance_id.clone(),
            Arc::new(Mutex::new(RunningInstance {
                instance,
                plan: Arc::new(plan),
                graph: Arc::new(graph),
            })),
        );
        Ok(instance_id)
    }

    /// Reload an instance snapshot and its definition from persistence
    pub async fn resume(&self, instance_id: &InstanceId) -> Result<InstanceStatus, CoreError> {
        let instance = self.instance_repo.load_instance(instance_id).await?;
        let graph = self
            .definition_repo
            .load_definition(&instance.graph_id)
            .await?;
        let plan = ExecutionPlan::build(&graph, &self.registry)?
            .with_max_loop_iterations(self.max_loop_iterations);
        let status = instance.status();

        info!(instance_id = %instance_id, flow_id = %graph.id, status = ?status, "Instance resumed");
        self.instances.insert(
            instance_id.clone(),
            Arc::new(Mutex::new(RunningInstance {
                instance,
                plan: Arc::new(plan),
                graph: Arc::new(graph),
            })),
        );
        Ok(status)
    }

    /// Copy of the current instance state
    pub async fn instance(&self, instance_id: &InstanceId) -> Result<FlowInstance, CoreError> {
        let entry = self.entry(instance_id)?;
        let guard = entry.lock().await;
        Ok(guard.instance.clone())
    }

    /// Set an instance parameter
    pub async fn set_parameter(
        &self,
        instance_id: &InstanceId,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, CoreError> {
        self.gate(OperationKind::SetInstanceParameter)?;
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock().await;
        let previous = guard.instance.set_parameter(name, value)?;
        self.persist(&guard.instance).await?;
        Ok(previous)
    }

    /// Run every Ready node once
    ///
    /// Actions run concurrently without holding the instance lock; their
    /// immediate outcomes are then applied in node id order.
    pub async fn advance(&self, instance_id: &InstanceId) -> Result<AdvanceReport, CoreError> {
        self.gate(OperationKind::Advance)?;
        let entry = self.entry(instance_id)?;

        let (started, plan, graph, parameters) = {
            let mut guard = entry.lock().await;
            let started = guard.instance.start_ready()?;
            (
                started,
                guard.plan.clone(),
                guard.graph.clone(),
                guard.instance.parameters().clone(),
            )
        };

        debug!(instance_id = %instance_id, started = started.len(), "Advancing instance");

        let futures = started.iter().map(|node_id| {
            let context = ActionContext::new(
                instance_id.clone(),
                node_id.clone(),
                parameters.clone(),
                self.reporter.clone(),
            );
            let graph = graph.clone();
            let runtime = self.runtime.clone();
            async move {
                match graph.node(node_id) {
                    Some(node) => runtime.run(node, context).await,
                    None => Err(StructuralError::NotFound(node_id.0.clone()).into()),
                }
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut guard = entry.lock().await;
        let mut deferred = Vec::new();
        for (node_id, result) in started.iter().zip(results) {
            let outcome = match result {
                Ok(Dispatch::Completed(outcome)) => outcome,
                Ok(Dispatch::Deferred) => {
                    deferred.push(node_id.clone());
                    continue;
                }
                Err(e) => Outcome::Failure(e.to_string()),
            };
            if guard.instance.is_sealed() {
                debug!(instance_id = %instance_id, node_id = %node_id, "Dropping outcome for sealed instance");
                continue;
            }
            Self::apply(&mut guard, node_id, outcome)?;
        }

        self.persist(&guard.instance).await?;
        self.handle_events(&mut guard.instance).await?;

        Ok(AdvanceReport {
            started,
            deferred,
            status: guard.instance.status(),
            failures: guard.instance.node_failures(),
        })
    }

    /// Apply the outcome of a deferred action
    pub async fn report_outcome(
        &self,
        instance_id: &InstanceId,
        node_id: &NodeId,
        outcome: Outcome,
    ) -> Result<InstanceStatus, CoreError> {
        self.gate(OperationKind::ReportOutcome)?;
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock().await;

        let status = Self::apply(&mut guard, node_id, outcome)?;
        self.persist(&guard.instance).await?;
        self.handle_events(&mut guard.instance).await?;
        Ok(status)
    }

    /// Skip every unfinished node and seal the instance
    pub async fn terminate(&self, instance_id: &InstanceId) -> Result<(), CoreError> {
        self.gate(OperationKind::Terminate)?;
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock().await;

        guard.instance.terminate()?;
        info!(instance_id = %instance_id, user = %self.context.user(), "Instance terminated");
        self.persist(&guard.instance).await?;
        self.handle_events(&mut guard.instance).await?;
        Ok(())
    }

    /// Apply every report currently queued, one at a time
    pub async fn drain_reports(&self, receiver: &mut OutcomeReceiver) -> usize {
        let mut applied = 0;
        while let Ok(report) = receiver.try_recv() {
            if self.apply_report(report).await {
                applied += 1;
            }
        }
        applied
    }

    /// Apply reports until every sender is gone
    pub async fn run_report_loop(self, mut receiver: OutcomeReceiver) {
        while let Some(report) = receiver.recv().await {
            self.apply_report(report).await;
        }
        debug!("Outcome channel closed");
    }

    /// Advance until the instance is sealed, waiting on deferred reports when idle
    pub async fn run_until_sealed(
        &self,
        instance_id: &InstanceId,
        receiver: &mut OutcomeReceiver,
    ) -> Result<InstanceStatus, CoreError> {
        loop {
            let status = self.instance(instance_id).await?.status();
            if status != InstanceStatus::Running {
                return Ok(status);
            }

            let report = self.advance(instance_id).await?;
            let applied = self.drain_reports(receiver).await;

            if report.started.is_empty() && applied == 0 && report.status == InstanceStatus::Running {
                match receiver.recv().await {
                    Some(report) => {
                        self.apply_report(report).await;
                    }
                    None => return Err(ExecutionError::ReportChannelClosed(instance_id.0.clone()).into()),
                }
            }
        }
    }

    /// Ids of the instances held by this service
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    async fn apply_report(&self, report: OutcomeReport) -> bool {
        match self
            .report_outcome(&report.instance_id, &report.node_id, report.outcome)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    instance_id = %report.instance_id,
                    node_id = %report.node_id,
                    error = %e,
                    "Rejected reported outcome"
                );
                false
            }
        }
    }

    fn apply(
        running: &mut RunningInstance,
        node_id: &NodeId,
        outcome: Outcome,
    ) -> Result<InstanceStatus, CoreError> {
        let plan = running.plan.clone();
        match running.instance.apply_outcome(&plan, node_id, outcome) {
            Err(CoreError::Execution(ExecutionError::InvalidOutcome { node, reason })) => {
                warn!(node_id = %node, reason = %reason, "Action returned an invalid outcome");
                running
                    .instance
                    .apply_outcome(&plan, node_id, Outcome::Failure(reason))
            }
            other => other,
        }
    }

    fn gate(&self, operation: OperationKind) -> Result<(), CoreError> {
        Ok(self.context.mode().check(operation, GraphKind::Flow)?)
    }

    fn entry(&self, instance_id: &InstanceId) -> Result<Arc<Mutex<RunningInstance>>, CoreError> {
        self.instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ExecutionError::InstanceNotFound(instance_id.0.clone()).into())
    }

    async fn persist(&self, instance: &FlowInstance) -> Result<(), CoreError> {
        self.instance_repo
            .save_instance_snapshot(instance)
            .await
            .map_err(|e| {
                error!(instance_id = %instance.id, error = %e, "Failed to save instance snapshot");
                e
            })
    }

    async fn handle_events(&self, instance: &mut FlowInstance) -> Result<(), CoreError> {
        for event in instance.take_events() {
            self.event_handler.handle_event(event).await?;
        }
        Ok(())
    }
}
