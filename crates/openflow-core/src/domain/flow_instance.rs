use crate::domain::events::{DomainEvent, InstanceCreated, InstanceSealed, NodeStateChanged};
use crate::domain::execution_plan::{ExecutionPlan, PlanNode};
use crate::domain::node_type::LOOP_BODY_PORT;
use crate::error::{CoreError, ExecutionError, StructuralError};
use crate::types::{ConnectionId, FlowId, InstanceId, NodeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Execution state of one node within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Waiting for predecessors
    Pending,
    /// Runnable on the next advance
    Ready,
    /// Action issued, outcome not yet known
    Running,
    /// Action succeeded
    Completed,
    /// Action failed
    Failed,
    /// Branch not taken, or the instance was terminated
    Skipped,
}

impl ExecutionState {
    /// Completed, Failed and Skipped are terminal
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Skipped
        )
    }
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Still accepting advances and outcomes
    Running,
    /// Finished without a fatal failure
    Completed,
    /// A non-recoverable failure left no way to finish
    Failed,
    /// Terminated on request
    Terminated,
}

/// Result of a node action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Succeeded; every out-port is taken
    Success,
    /// Gateway succeeded; only the named out-ports are taken
    Branch(Vec<String>),
    /// Failed with a reason
    Failure(String),
    /// The action decided not to run
    Skip,
}

impl Outcome {
    /// Branch outcome from port names
    pub fn branch(ports: &[&str]) -> Self {
        Outcome::Branch(ports.iter().map(|p| p.to_string()).collect())
    }
}

/// How a connection was settled by its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The source completed and selected this connection
    Taken,
    /// The source was skipped, failed recoverably or did not select it
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LoopProgress {
    iterations: u32,
    deferred: BTreeSet<String>,
}

/// Aggregate: one execution run of a flow definition
#[derive(Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: InstanceId,

    /// Definition this instance was created from
    pub graph_id: FlowId,

    /// User who instantiated the flow
    pub started_by: UserId,

    status: InstanceStatus,

    node_states: BTreeMap<NodeId, ExecutionState>,

    active_set: BTreeSet<NodeId>,

    resolutions: BTreeMap<ConnectionId, Resolution>,

    loops: BTreeMap<NodeId, LoopProgress>,

    errors: BTreeMap<NodeId, String>,

    parameters: BTreeMap<String, Value>,

    fatal_failure: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for FlowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            graph_id: self.graph_id.clone(),
            started_by: self.started_by.clone(),
            status: self.status,
            node_states: self.node_states.clone(),
            active_set: self.active_set.clone(),
            resolutions: self.resolutions.clone(),
            loops: self.loops.clone(),
            errors: self.errors.clone(),
            parameters: self.parameters.clone(),
            fatal_failure: self.fatal_failure,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(),
        }
    }
}

impl FlowInstance {
    /// Create an instance; nodes without predecessors start Ready
    pub fn new(
        id: InstanceId,
        plan: &ExecutionPlan,
        started_by: UserId,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let node_states: BTreeMap<NodeId, ExecutionState> = plan
            .nodes()
            .map(|n| {
                let state = if n.incoming.is_empty() {
                    ExecutionState::Ready
                } else {
                    ExecutionState::Pending
                };
                (n.id.clone(), state)
            })
            .collect();
        let active_set = node_states
            .iter()
            .filter(|(_, s)| **s == ExecutionState::Ready)
            .map(|(id, _)| id.clone())
            .collect();

        let mut instance = Self {
            id: id.clone(),
            graph_id: plan.flow_id().clone(),
            started_by,
            status: InstanceStatus::Running,
            node_states,
            active_set,
            resolutions: BTreeMap::new(),
            loops: BTreeMap::new(),
            errors: BTreeMap::new(),
            parameters,
            fatal_failure: false,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        };

        instance.record_event(Box::new(InstanceCreated {
            instance_id: id,
            flow_id: plan.flow_id().clone(),
            timestamp: now,
        }));
        instance.settle(plan);
        instance
    }

    /// Lifecycle status
    #[inline]
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Whether no further advance or outcome is accepted
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.status != InstanceStatus::Running
    }

    /// State of a node
    #[inline]
    pub fn state(&self, node: &NodeId) -> Option<ExecutionState> {
        self.node_states.get(node).copied()
    }

    /// States of all nodes
    pub fn node_states(&self) -> &BTreeMap<NodeId, ExecutionState> {
        &self.node_states
    }

    /// Nodes that the next advance will run
    pub fn active_set(&self) -> &BTreeSet<NodeId> {
        &self.active_set
    }

    /// Instance parameters
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    /// Failure reason of a node
    pub fn node_error(&self, node: &NodeId) -> Option<&str> {
        self.errors.get(node).map(String::as_str)
    }

    /// Failed nodes as errors
    pub fn node_failures(&self) -> Vec<ExecutionError> {
        self.errors
            .iter()
            .filter(|(id, _)| self.state(id) == Some(ExecutionState::Failed))
            .map(|(id, reason)| ExecutionError::NodeActionFailed {
                node: id.0.clone(),
                reason: reason.clone(),
            })
            .collect()
    }

    /// Completed passes of a loop node
    pub fn loop_iterations(&self, node: &NodeId) -> u32 {
        self.loops.get(node).map(|p| p.iterations).unwrap_or(0)
    }

    /// Set an instance parameter, returning the previous value
    pub fn set_parameter(&mut self, name: &str, value: Value) -> Result<Option<Value>, CoreError> {
        self.ensure_open()?;
        let previous = self.parameters.insert(name.to_string(), value);
        self.touch();
        Ok(previous)
    }

    /// Move every Ready node to Running and return them in id order
    pub fn start_ready(&mut self) -> Result<Vec<NodeId>, CoreError> {
        self.ensure_open()?;
        let ready: Vec<NodeId> = self.active_set.iter().cloned().collect();
        for id in &ready {
            self.transition(id, ExecutionState::Running);
        }
        self.touch();
        Ok(ready)
    }

    /// Apply the outcome of a Running node and propagate readiness
    pub fn apply_outcome(
        &mut self,
        plan: &ExecutionPlan,
        node_id: &NodeId,
        outcome: Outcome,
    ) -> Result<InstanceStatus, CoreError> {
        self.ensure_open()?;
        let node = plan
            .node(node_id)
            .ok_or_else(|| StructuralError::NotFound(node_id.0.clone()))?;
        if self.state(node_id) != Some(ExecutionState::Running) {
            return Err(ExecutionError::NodeNotRunning(node_id.0.clone()).into());
        }

        if let Outcome::Branch(ports) = &outcome {
            if !node.gateway {
                return Err(ExecutionError::InvalidOutcome {
                    node: node_id.0.clone(),
                    reason: "only gateway nodes select branches".to_string(),
                }
                .into());
            }
            if let Some(unknown) = ports.iter().find(|p| !node.out_ports.contains(*p)) {
                return Err(ExecutionError::InvalidOutcome {
                    node: node_id.0.clone(),
                    reason: format!("unknown out-port '{}'", unknown),
                }
                .into());
            }
        }

        if node.loop_construct {
            let selects_one = match &outcome {
                Outcome::Success => false,
                Outcome::Branch(ports) => ports.len() == 1,
                Outcome::Failure(_) | Outcome::Skip => true,
            };
            if !selects_one {
                return Err(ExecutionError::InvalidOutcome {
                    node: node_id.0.clone(),
                    reason: "loop nodes select exactly one out-port".to_string(),
                }
                .into());
            }
        }

        let mut work = VecDeque::new();
        match outcome {
            Outcome::Success => self.complete_node(plan, node, None, &mut work),
            Outcome::Branch(ports) => {
                self.complete_node(plan, node, Some(ports.into_iter().collect()), &mut work)
            }
            Outcome::Failure(reason) => {
                tracing::warn!(
                    instance_id = %self.id,
                    node_id = %node_id,
                    recoverable = node.recoverable,
                    reason = %reason,
                    "Node action failed"
                );
                self.errors.insert(node_id.clone(), reason);
                self.transition(node_id, ExecutionState::Failed);
                if node.recoverable {
                    Self::push_all(node, Resolution::Skipped, &mut work);
                } else {
                    self.fatal_failure = true;
                }
            }
            Outcome::Skip => {
                self.transition(node_id, ExecutionState::Skipped);
                Self::push_all(node, Resolution::Skipped, &mut work);
            }
        }

        self.drain(plan, work);
        self.settle(plan);
        self.touch();
        Ok(self.status)
    }

    /// Skip every non-terminal node and seal the instance as Terminated
    pub fn terminate(&mut self) -> Result<(), CoreError> {
        self.ensure_open()?;
        self.seal(InstanceStatus::Terminated);
        Ok(())
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_sealed() {
            return Err(ExecutionError::InstanceSealed(self.id.0.clone()).into());
        }
        Ok(())
    }

    #[inline]
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, node: &NodeId, to: ExecutionState) {
        let from = self.state(node).unwrap_or(ExecutionState::Pending);
        if from == to {
            return;
        }
        self.node_states.insert(node.clone(), to);
        if to == ExecutionState::Ready {
            self.active_set.insert(node.clone());
        } else {
            self.active_set.remove(node);
        }

        tracing::debug!(instance_id = %self.id, node_id = %node, from = ?from, to = ?to, "Node state changed");
        self.record_event(Box::new(NodeStateChanged {
            instance_id: self.id.clone(),
            node_id: node.clone(),
            from,
            to,
            timestamp: Utc::now(),
        }));
    }

    fn push_all(node: &PlanNode, resolution: Resolution, work: &mut VecDeque<(ConnectionId, Resolution)>) {
        work.extend(node.outgoing.iter().map(|e| (e.clone(), resolution)));
    }

    fn complete_node(
        &mut self,
        plan: &ExecutionPlan,
        node: &PlanNode,
        selection: Option<BTreeSet<String>>,
        work: &mut VecDeque<(ConnectionId, Resolution)>,
    ) {
        self.transition(&node.id, ExecutionState::Completed);

        let enters_body = node.loop_construct
            && selection
                .as_ref()
                .map(|s| s.contains(LOOP_BODY_PORT))
                .unwrap_or(true);
        if node.loop_construct {
            let progress = self.loops.entry(node.id.clone()).or_default();
            progress.iterations += 1;
            progress.deferred.clear();
            if enters_body && progress.iterations > 1 {
                self.reset_body(plan, &node.id);
            }
        }

        for edge_id in &node.outgoing {
            let Some(edge) = plan.edge(edge_id) else {
                continue;
            };
            let taken = selection
                .as_ref()
                .map(|s| s.contains(&edge.source_port))
                .unwrap_or(true);
            if taken {
                work.push_back((edge_id.clone(), Resolution::Taken));
            } else if enters_body {
                self.loops
                    .entry(node.id.clone())
                    .or_default()
                    .deferred
                    .insert(edge.source_port.clone());
            } else {
                work.push_back((edge_id.clone(), Resolution::Skipped));
            }
        }
    }

    fn reset_body(&mut self, plan: &ExecutionPlan, loop_id: &NodeId) {
        let Some(body) = plan.loop_body(loop_id) else {
            return;
        };
        tracing::debug!(instance_id = %self.id, node_id = %loop_id, body = body.len(), "Resetting loop body");
        for member in body {
            self.transition(member, ExecutionState::Pending);
            self.errors.remove(member);
            self.loops.remove(member);
            if let Some(plan_node) = plan.node(member) {
                for edge in &plan_node.incoming {
                    self.resolutions.remove(edge);
                }
            }
        }
    }

    fn drain(&mut self, plan: &ExecutionPlan, mut work: VecDeque<(ConnectionId, Resolution)>) {
        while let Some((edge_id, resolution)) = work.pop_front() {
            let Some(edge) = plan.edge(&edge_id) else {
                continue;
            };
            if edge.back_edge {
                self.resolve_back_edge(plan, &edge.target, resolution, &mut work);
                continue;
            }
            if self.state(&edge.target) != Some(ExecutionState::Pending)
                || self.resolutions.contains_key(&edge_id)
            {
                continue;
            }
            self.resolutions.insert(edge_id, resolution);

            let Some(target) = plan.node(&edge.target) else {
                continue;
            };
            let mut taken = 0;
            for incoming in &target.incoming {
                match self.resolutions.get(incoming) {
                    Some(Resolution::Taken) => taken += 1,
                    Some(Resolution::Skipped) => {}
                    None => {
                        taken = -1;
                        break;
                    }
                }
            }
            if taken < 0 {
                continue;
            }

            if target.join || taken > 0 {
                self.transition(&target.id, ExecutionState::Ready);
            } else {
                self.transition(&target.id, ExecutionState::Skipped);
                Self::push_all(target, Resolution::Skipped, &mut work);
            }
        }
    }

    fn resolve_back_edge(
        &mut self,
        plan: &ExecutionPlan,
        loop_id: &NodeId,
        resolution: Resolution,
        work: &mut VecDeque<(ConnectionId, Resolution)>,
    ) {
        if self.state(loop_id) != Some(ExecutionState::Completed) {
            return;
        }
        let Some(loop_node) = plan.node(loop_id) else {
            return;
        };

        match resolution {
            Resolution::Taken if self.loop_iterations(loop_id) >= plan.max_loop_iterations() => {
                let reason = format!(
                    "loop iteration limit of {} reached",
                    plan.max_loop_iterations()
                );
                tracing::warn!(instance_id = %self.id, node_id = %loop_id, "{}", reason);
                self.errors.insert(loop_id.clone(), reason);
                self.transition(loop_id, ExecutionState::Failed);
                if loop_node.recoverable {
                    self.release_deferred(plan, loop_node, work);
                } else {
                    self.fatal_failure = true;
                }
            }
            Resolution::Taken => self.transition(loop_id, ExecutionState::Ready),
            Resolution::Skipped => self.release_deferred(plan, loop_node, work),
        }
    }

    fn release_deferred(
        &mut self,
        plan: &ExecutionPlan,
        loop_node: &PlanNode,
        work: &mut VecDeque<(ConnectionId, Resolution)>,
    ) {
        let deferred = self
            .loops
            .get_mut(&loop_node.id)
            .map(|p| std::mem::take(&mut p.deferred))
            .unwrap_or_default();
        for edge_id in &loop_node.outgoing {
            if let Some(edge) = plan.edge(edge_id) {
                if deferred.contains(&edge.source_port) {
                    work.push_back((edge_id.clone(), Resolution::Skipped));
                }
            }
        }
    }

    fn settle(&mut self, plan: &ExecutionPlan) {
        if self.is_sealed() {
            return;
        }

        let busy = self
            .node_states
            .values()
            .any(|s| matches!(s, ExecutionState::Ready | ExecutionState::Running));
        if !busy {
            let sink_completed = plan
                .sinks()
                .iter()
                .any(|s| self.state(s) == Some(ExecutionState::Completed));
            if self.fatal_failure && !sink_completed {
                self.seal(InstanceStatus::Failed);
            } else {
                self.seal(InstanceStatus::Completed);
            }
            return;
        }

        if self.fatal_failure {
            let mut reach = Reachability::new(self, plan);
            let alive = plan.sinks().iter().any(|s| reach.can_complete(s));
            if !alive {
                self.seal(InstanceStatus::Failed);
            }
        }
    }

    fn seal(&mut self, status: InstanceStatus) {
        let open: Vec<NodeId> = self
            .node_states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &open {
            self.transition(id, ExecutionState::Skipped);
        }
        self.status = status;
        self.active_set.clear();
        self.touch();

        tracing::info!(instance_id = %self.id, flow_id = %self.graph_id, status = ?status, "Instance sealed");
        self.record_event(Box::new(InstanceSealed {
            instance_id: self.id.clone(),
            status,
            timestamp: Utc::now(),
        }));
    }
}

/// Optimistic look-ahead used after a non-recoverable failure
struct Reachability<'a> {
    instance: &'a FlowInstance,
    plan: &'a ExecutionPlan,
    settles: BTreeMap<NodeId, bool>,
    completes: BTreeMap<NodeId, bool>,
}

impl<'a> Reachability<'a> {
    fn new(instance: &'a FlowInstance, plan: &'a ExecutionPlan) -> Self {
        Self {
            instance,
            plan,
            settles: BTreeMap::new(),
            completes: BTreeMap::new(),
        }
    }

    fn unresolved_sources(&self, node: &NodeId) -> Vec<NodeId> {
        self.plan
            .node(node)
            .map(|n| {
                n.incoming
                    .iter()
                    .filter(|e| !self.instance.resolutions.contains_key(*e))
                    .filter_map(|e| self.plan.edge(e).map(|edge| edge.source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the node's outgoing connections can still be resolved
    fn settles(&mut self, node: &NodeId) -> bool {
        if let Some(known) = self.settles.get(node) {
            return *known;
        }
        self.settles.insert(node.clone(), false);
        let result = match self.instance.state(node) {
            Some(ExecutionState::Failed) => self.plan.node(node).map(|n| n.recoverable).unwrap_or(false),
            Some(ExecutionState::Pending) => self
                .unresolved_sources(node)
                .iter()
                .all(|source| self.settles(source)),
            Some(_) => true,
            None => false,
        };
        self.settles.insert(node.clone(), result);
        result
    }

    /// Whether the node can still reach Completed
    fn can_complete(&mut self, node: &NodeId) -> bool {
        if let Some(known) = self.completes.get(node) {
            return *known;
        }
        self.completes.insert(node.clone(), false);
        let result = match self.instance.state(node) {
            Some(ExecutionState::Completed)
            | Some(ExecutionState::Ready)
            | Some(ExecutionState::Running) => true,
            Some(ExecutionState::Pending) => {
                let sources = self.unresolved_sources(node);
                let join = self.plan.node(node).map(|n| n.join).unwrap_or(false);
                let taken = self.plan.node(node).map_or(false, |n| {
                    n.incoming
                        .iter()
                        .any(|e| self.instance.resolutions.get(e) == Some(&Resolution::Taken))
                });
                sources.iter().all(|s| self.settles(s))
                    && (join || taken || sources.iter().any(|s| self.can_complete(s)))
            }
            _ => false,
        };
        self.completes.insert(node.clone(), result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{FlowGraph, Node};
    use crate::domain::node_type::NodeTypeRegistry;
    use crate::types::PortId;
    use serde_json::json;

    fn graph(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> ExecutionPlan {
        graph_with_fatal(nodes, edges, &[])
    }

    /// Nodes named in `fatal` fail the instance when they fail
    fn graph_with_fatal(
        nodes: &[(&str, &str)],
        edges: &[(&str, &str)],
        fatal: &[&str],
    ) -> ExecutionPlan {
        let reg = NodeTypeRegistry::with_builtin_shapes();
        let mut graph = FlowGraph::new("test", "Test");
        for (id, kind) in nodes {
            let mut node = Node::from_descriptor(*id, reg.get(kind).unwrap());
            if fatal.contains(id) {
                node = node.with_property("recoverable", json!(false));
            }
            graph.add_node(node, &reg).unwrap();
        }
        for (from, to) in edges {
            graph
                .connect(&PortId::from(*from), &PortId::from(*to), &reg)
                .unwrap();
        }
        ExecutionPlan::build(&graph, &reg).unwrap()
    }

    fn instance(plan: &ExecutionPlan) -> FlowInstance {
        FlowInstance::new(
            InstanceId("i-1".to_string()),
            plan,
            UserId("tester".to_string()),
            BTreeMap::new(),
        )
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn run(instance: &mut FlowInstance, plan: &ExecutionPlan, node: &str, outcome: Outcome) {
        instance.start_ready().unwrap();
        instance.apply_outcome(plan, &id(node), outcome).unwrap();
    }

    #[test]
    fn test_initial_states() {
        let plan = graph(
            &[("a", "start"), ("b", "task"), ("c", "end")],
            &[("a.out", "b.in"), ("b.out", "c.in")],
        );
        let inst = instance(&plan);

        assert_eq!(inst.state(&id("a")), Some(ExecutionState::Ready));
        assert_eq!(inst.state(&id("b")), Some(ExecutionState::Pending));
        assert_eq!(inst.active_set(), &BTreeSet::from([id("a")]));
        assert_eq!(inst.status(), InstanceStatus::Running);
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let plan = graph(&[], &[]);
        assert_eq!(instance(&plan).status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_outcome_for_idle_node_rejected() {
        let plan = graph(&[("a", "start"), ("b", "task")], &[("a.out", "b.in")]);
        let mut inst = instance(&plan);

        let err = inst.apply_outcome(&plan, &id("a"), Outcome::Success).unwrap_err();
        assert_eq!(err, ExecutionError::NodeNotRunning("a".into()).into());
    }

    #[test]
    fn test_branch_from_plain_task_rejected() {
        let plan = graph(&[("a", "start"), ("b", "task")], &[("a.out", "b.in")]);
        let mut inst = instance(&plan);
        inst.start_ready().unwrap();

        let err = inst
            .apply_outcome(&plan, &id("a"), Outcome::branch(&["out"]))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Execution(ExecutionError::InvalidOutcome { .. })
        ));
        assert_eq!(inst.state(&id("a")), Some(ExecutionState::Running));
    }

    #[test]
    fn test_gateway_skip_propagates_transitively() {
        let plan = graph(
            &[
                ("s", "start"),
                ("c", "condition"),
                ("y", "task"),
                ("n1", "task"),
                ("n2", "task"),
                ("e", "end"),
            ],
            &[
                ("s.out", "c.in"),
                ("c.yes", "y.in"),
                ("c.no", "n1.in"),
                ("n1.out", "n2.in"),
                ("y.out", "e.in"),
                ("n2.out", "e.in"),
            ],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        run(&mut inst, &plan, "c", Outcome::branch(&["yes"]));

        assert_eq!(inst.state(&id("y")), Some(ExecutionState::Ready));
        assert_eq!(inst.state(&id("n1")), Some(ExecutionState::Skipped));
        assert_eq!(inst.state(&id("n2")), Some(ExecutionState::Skipped));
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Pending));

        run(&mut inst, &plan, "y", Outcome::Success);
        run(&mut inst, &plan, "e", Outcome::Success);
        assert_eq!(inst.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_unmarked_failure_routes_around() {
        let plan = graph(
            &[("s", "start"), ("flaky", "task"), ("after", "task")],
            &[("s.out", "flaky.in"), ("flaky.out", "after.in")],
        );

        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        run(&mut inst, &plan, "flaky", Outcome::Failure("timeout".into()));

        assert_eq!(inst.state(&id("after")), Some(ExecutionState::Skipped));
        assert_eq!(inst.status(), InstanceStatus::Completed);
        assert_eq!(
            inst.node_failures(),
            vec![ExecutionError::NodeActionFailed {
                node: "flaky".into(),
                reason: "timeout".into()
            }]
        );
    }

    #[test]
    fn test_fatal_failure_seals_when_no_sink_can_complete() {
        let plan = graph_with_fatal(
            &[("s", "start"), ("a", "task"), ("b", "task"), ("e", "end")],
            &[("s.out", "a.in"), ("s.out", "b.in"), ("a.out", "e.in"), ("b.out", "e.in")],
            &["a"],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);

        // both a and b are running; a fails hard, e can never fire
        inst.start_ready().unwrap();
        let status = inst
            .apply_outcome(&plan, &id("a"), Outcome::Failure("boom".into()))
            .unwrap();

        assert_eq!(status, InstanceStatus::Failed);
        assert_eq!(inst.state(&id("b")), Some(ExecutionState::Skipped));
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Skipped));
        let err = inst.apply_outcome(&plan, &id("b"), Outcome::Success).unwrap_err();
        assert_eq!(err, ExecutionError::InstanceSealed("i-1".into()).into());
    }

    #[test]
    fn test_fatal_failure_with_alternate_path() {
        let plan = graph_with_fatal(
            &[("s", "start"), ("a", "task"), ("b", "task"), ("ea", "end"), ("eb", "end")],
            &[("s.out", "a.in"), ("s.out", "b.in"), ("a.out", "ea.in"), ("b.out", "eb.in")],
            &["a"],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        inst.start_ready().unwrap();

        let status = inst
            .apply_outcome(&plan, &id("a"), Outcome::Failure("boom".into()))
            .unwrap();
        assert_eq!(status, InstanceStatus::Running);

        inst.apply_outcome(&plan, &id("b"), Outcome::Success).unwrap();
        run(&mut inst, &plan, "eb", Outcome::Success);
        assert_eq!(inst.status(), InstanceStatus::Completed);
        assert_eq!(inst.state(&id("ea")), Some(ExecutionState::Skipped));
    }

    #[test]
    fn test_loop_iterates_until_exit() {
        let plan = graph(
            &[("s", "start"), ("l", "loop"), ("w", "task"), ("e", "end")],
            &[("s.out", "l.in"), ("l.body", "w.in"), ("w.out", "l.back"), ("l.exit", "e.in")],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);

        for _ in 0..3 {
            run(&mut inst, &plan, "l", Outcome::branch(&["body"]));
            assert_eq!(inst.state(&id("w")), Some(ExecutionState::Ready));
            assert_eq!(inst.state(&id("e")), Some(ExecutionState::Pending));
            run(&mut inst, &plan, "w", Outcome::Success);
            assert_eq!(inst.state(&id("l")), Some(ExecutionState::Ready));
        }

        run(&mut inst, &plan, "l", Outcome::branch(&["exit"]));
        assert_eq!(inst.loop_iterations(&id("l")), 4);
        assert_eq!(inst.state(&id("w")), Some(ExecutionState::Completed));
        run(&mut inst, &plan, "e", Outcome::Success);
        assert_eq!(inst.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_failure_beside_join_keeps_siblings_running() {
        let plan = graph(
            &[("s", "start"), ("a", "task"), ("b", "task"), ("e", "end")],
            &[("s.out", "a.in"), ("s.out", "b.in"), ("a.out", "e.in"), ("b.out", "e.in")],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        inst.start_ready().unwrap();

        let status = inst
            .apply_outcome(&plan, &id("a"), Outcome::Failure("boom".into()))
            .unwrap();
        assert_eq!(status, InstanceStatus::Running);
        assert_eq!(inst.state(&id("b")), Some(ExecutionState::Running));
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Pending));

        inst.apply_outcome(&plan, &id("b"), Outcome::Success).unwrap();
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Ready));
    }

    #[test]
    fn test_loop_iteration_limit_fails_loop() {
        let plan = graph_with_fatal(
            &[("s", "start"), ("l", "loop"), ("w", "task"), ("e", "end")],
            &[("s.out", "l.in"), ("l.body", "w.in"), ("w.out", "l.back"), ("l.exit", "e.in")],
            &["l"],
        )
        .with_max_loop_iterations(2);
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);

        run(&mut inst, &plan, "l", Outcome::branch(&["body"]));
        run(&mut inst, &plan, "w", Outcome::Success);
        run(&mut inst, &plan, "l", Outcome::branch(&["body"]));
        run(&mut inst, &plan, "w", Outcome::Success);

        assert_eq!(inst.state(&id("l")), Some(ExecutionState::Failed));
        assert_eq!(inst.status(), InstanceStatus::Failed);
        assert!(inst.node_error(&id("l")).unwrap().contains("limit of 2"));
    }

    #[test]
    fn test_recoverable_loop_limit_releases_exit() {
        let plan = graph(
            &[("s", "start"), ("l", "loop"), ("w", "task"), ("e", "end")],
            &[("s.out", "l.in"), ("l.body", "w.in"), ("w.out", "l.back"), ("l.exit", "e.in")],
        )
        .with_max_loop_iterations(1);
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        run(&mut inst, &plan, "l", Outcome::branch(&["body"]));
        run(&mut inst, &plan, "w", Outcome::Success);

        assert_eq!(inst.state(&id("l")), Some(ExecutionState::Failed));
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Ready));
        run(&mut inst, &plan, "e", Outcome::Success);
        assert_eq!(inst.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_loop_must_select_one_port() {
        let plan = graph(
            &[("s", "start"), ("l", "loop"), ("w", "task"), ("e", "end")],
            &[("s.out", "l.in"), ("l.body", "w.in"), ("w.out", "l.back"), ("l.exit", "e.in")],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        inst.start_ready().unwrap();

        for outcome in [Outcome::Success, Outcome::branch(&["body", "exit"])] {
            let err = inst.apply_outcome(&plan, &id("l"), outcome).unwrap_err();
            assert!(matches!(
                err,
                CoreError::Execution(ExecutionError::InvalidOutcome { .. })
            ));
        }
        assert_eq!(inst.state(&id("l")), Some(ExecutionState::Running));
        assert_eq!(inst.state(&id("w")), Some(ExecutionState::Pending));
        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Pending));
    }

    #[test]
    fn test_nested_loops_wait_for_their_predecessors() {
        let plan = graph(
            &[("s", "start"), ("o", "loop"), ("i", "loop"), ("w", "task"), ("e", "end")],
            &[
                ("s.out", "o.in"),
                ("o.body", "i.in"),
                ("i.body", "w.in"),
                ("w.out", "i.back"),
                ("i.exit", "o.back"),
                ("o.exit", "e.in"),
            ],
        );
        let mut inst = instance(&plan);
        assert_eq!(inst.active_set(), &BTreeSet::from([id("s")]));
        assert_eq!(inst.state(&id("i")), Some(ExecutionState::Pending));

        run(&mut inst, &plan, "s", Outcome::Success);
        for _ in 0..2 {
            run(&mut inst, &plan, "o", Outcome::branch(&["body"]));
            assert_eq!(inst.state(&id("i")), Some(ExecutionState::Ready));
            assert_eq!(inst.state(&id("e")), Some(ExecutionState::Pending));

            run(&mut inst, &plan, "i", Outcome::branch(&["body"]));
            run(&mut inst, &plan, "w", Outcome::Success);
            assert_eq!(inst.state(&id("i")), Some(ExecutionState::Ready));
            assert_eq!(inst.state(&id("o")), Some(ExecutionState::Completed));

            run(&mut inst, &plan, "i", Outcome::branch(&["exit"]));
            assert_eq!(inst.state(&id("o")), Some(ExecutionState::Ready));
            assert_eq!(inst.loop_iterations(&id("i")), 2);
        }

        run(&mut inst, &plan, "o", Outcome::branch(&["exit"]));
        assert_eq!(inst.loop_iterations(&id("o")), 3);
        run(&mut inst, &plan, "e", Outcome::Success);
        assert_eq!(inst.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_loop_skipped_body_releases_exit() {
        let plan = graph(
            &[("s", "start"), ("l", "loop"), ("w", "task"), ("e", "end")],
            &[("s.out", "l.in"), ("l.body", "w.in"), ("w.out", "l.back"), ("l.exit", "e.in")],
        );
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "s", Outcome::Success);
        run(&mut inst, &plan, "l", Outcome::branch(&["body"]));
        run(&mut inst, &plan, "w", Outcome::Skip);

        assert_eq!(inst.state(&id("e")), Some(ExecutionState::Ready));
    }

    #[test]
    fn test_terminate_seals() {
        let plan = graph(
            &[("a", "start"), ("b", "task"), ("c", "end")],
            &[("a.out", "b.in"), ("b.out", "c.in")],
        );
        let mut inst = instance(&plan);
        inst.start_ready().unwrap();
        inst.terminate().unwrap();

        assert_eq!(inst.status(), InstanceStatus::Terminated);
        assert!(inst.node_states().values().all(|s| *s == ExecutionState::Skipped));
        assert_eq!(
            inst.start_ready().unwrap_err(),
            ExecutionError::InstanceSealed("i-1".into()).into()
        );
        assert!(inst.terminate().is_err());
        assert!(inst.set_parameter("x", json!(1)).is_err());
    }

    #[test]
    fn test_events_recorded_and_drained() {
        let plan = graph(&[("a", "start")], &[]);
        let mut inst = instance(&plan);
        run(&mut inst, &plan, "a", Outcome::Success);

        let types: Vec<_> = inst.take_events().iter().map(|e| e.event_type()).collect();
        assert_eq!(types.first(), Some(&"instance.created"));
        assert_eq!(types.last(), Some(&"instance.sealed"));
        assert!(inst.take_events().is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let plan = graph(&[("a", "start"), ("b", "task")], &[("a.out", "b.in")]);
        let mut inst = instance(&plan);
        inst.set_parameter("ticket", json!("T-7")).unwrap();
        run(&mut inst, &plan, "a", Outcome::Success);

        let snapshot = serde_json::to_string(&inst).unwrap();
        let restored: FlowInstance = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(restored.node_states(), inst.node_states());
        assert_eq!(restored.parameters().get("ticket"), Some(&json!("T-7")));
        assert_eq!(restored.active_set(), &BTreeSet::from([id("b")]));
    }
}
