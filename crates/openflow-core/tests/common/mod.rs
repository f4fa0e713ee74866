//! Shared fixtures for the scenario tests
#![allow(dead_code)]

use async_trait::async_trait;
use openflow_core::{
    application::action_runtime::{ActionContext, ActionRuntime, Dispatch},
    domain::repository::memory::{MemoryFlowDefinitionRepository, MemoryFlowInstanceRepository},
    CoreError, EngineConfig, FlowExecutionService, FlowGraph, Mode, Node, NodeTypeRegistry,
    OutcomeReceiver, Outcome, PortId, SessionContext, UserId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize test tracing
pub fn init_test_tracing() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("openflow_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Runtime that plays back scripted dispatches per node; unscripted nodes succeed
#[derive(Default)]
pub struct ScriptedRuntime {
    script: Mutex<HashMap<String, VecDeque<Dispatch>>>,
    defer_all: bool,
}

impl ScriptedRuntime {
    /// Every node succeeds immediately unless scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node defers unless scripted
    pub fn deferring() -> Self {
        Self {
            defer_all: true,
            ..Self::default()
        }
    }

    /// Queue dispatches for a node, consumed one per run
    pub fn script(self, node: &str, dispatches: Vec<Dispatch>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(node.to_string(), dispatches.into());
        self
    }
}

#[async_trait]
impl ActionRuntime for ScriptedRuntime {
    async fn run(&self, node: &Node, _context: ActionContext) -> Result<Dispatch, CoreError> {
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&node.id.0)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or(if self.defer_all {
            Dispatch::Deferred
        } else {
            Dispatch::Completed(Outcome::Success)
        }))
    }
}

/// Build a graph from `(id, type)` nodes and `("node.port", "node.port")` connections
pub fn build_graph(id: &str, nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> FlowGraph {
    let registry = NodeTypeRegistry::with_builtin_shapes();
    let mut graph = FlowGraph::new(id, id);
    for (node_id, kind) in nodes {
        graph
            .add_node(
                Node::from_descriptor(*node_id, registry.get(kind).unwrap()),
                &registry,
            )
            .unwrap();
    }
    for (source, target) in edges {
        graph
            .connect(&PortId::from(*source), &PortId::from(*target), &registry)
            .unwrap();
    }
    graph
}

/// A -> B -> C
pub fn linear_graph() -> FlowGraph {
    build_graph(
        "linear",
        &[("A", "start"), ("B", "task"), ("C", "end")],
        &[("A.out", "B.in"), ("B.out", "C.in")],
    )
}

/// Execution service over memory repositories
pub fn execution_service(
    mode: Mode,
    runtime: ScriptedRuntime,
) -> (FlowExecutionService, OutcomeReceiver) {
    FlowExecutionService::new(
        Arc::new(MemoryFlowDefinitionRepository::new()),
        Arc::new(MemoryFlowInstanceRepository::new()),
        Arc::new(runtime),
        Arc::new(NodeTypeRegistry::with_builtin_shapes()),
        SessionContext::new(mode, UserId::from("tester")),
        &EngineConfig::default(),
    )
}
