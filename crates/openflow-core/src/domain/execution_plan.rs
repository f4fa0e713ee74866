//! Read-only view of a flow graph prepared for the instance runner.

use crate::domain::graph::FlowGraph;
use crate::domain::node_type::{NodeTypeRegistry, LOOP_BACK_PORT};
use crate::error::{CoreError, StructuralError};
use crate::types::{ConnectionId, FlowId, NodeId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Default cap on loop iterations per loop node
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 100;

/// A connection seen at node level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEdge {
    /// Connection id
    pub id: ConnectionId,
    /// Source node
    pub source: NodeId,
    /// Name of the source out-port
    pub source_port: String,
    /// Target node
    pub target: NodeId,
    /// Enters the loop-back port of a loop node
    pub back_edge: bool,
}

/// Node capabilities and adjacency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    /// Node id
    pub id: NodeId,
    /// Waits for every incoming connection
    pub join: bool,
    /// Outcome selects out-ports
    pub gateway: bool,
    /// Loop construct
    pub loop_construct: bool,
    /// Failure does not fail the instance
    pub recoverable: bool,
    /// Names of the out-ports
    pub out_ports: BTreeSet<String>,
    /// Incoming connections that count for readiness
    pub incoming: Vec<ConnectionId>,
    /// Outgoing connections, back edges included
    pub outgoing: Vec<ConnectionId>,
}

/// Execution view of a graph
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    flow_id: FlowId,
    nodes: BTreeMap<NodeId, PlanNode>,
    edges: BTreeMap<ConnectionId, PlanEdge>,
    loop_bodies: BTreeMap<NodeId, BTreeSet<NodeId>>,
    sinks: BTreeSet<NodeId>,
    max_loop_iterations: u32,
}

impl ExecutionPlan {
    /// Build the plan; node types must be registered and connections resolvable
    pub fn build(graph: &FlowGraph, registry: &NodeTypeRegistry) -> Result<Self, CoreError> {
        let mut nodes = BTreeMap::new();
        for node in graph.nodes() {
            let descriptor = registry.require(&node.node_type)?;
            nodes.insert(
                node.id.clone(),
                PlanNode {
                    id: node.id.clone(),
                    join: descriptor.join,
                    gateway: descriptor.gateway,
                    loop_construct: descriptor.loop_construct,
                    recoverable: node.is_recoverable(descriptor),
                    out_ports: node.out_ports().map(|p| p.name.clone()).collect(),
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                },
            );
        }

        let adjacency: BTreeMap<NodeId, BTreeSet<NodeId>> = graph
            .successors()
            .into_iter()
            .map(|(k, v)| (k.clone(), v.into_iter().cloned().collect()))
            .collect();

        let mut edges = BTreeMap::new();
        for connection in graph.edges() {
            let (source_node, source_port) = graph
                .find_port(&connection.source_port)
                .ok_or_else(|| StructuralError::NotFound(connection.source_port.0.clone()))?;
            let (target_node, target_port) = graph
                .find_port(&connection.target_port)
                .ok_or_else(|| StructuralError::NotFound(connection.target_port.0.clone()))?;
            let target = target_node.id.clone();

            let target_is_loop = nodes.get(&target).map(|n| n.loop_construct).unwrap_or(false);
            let back_edge = target_is_loop && target_port.name == LOOP_BACK_PORT;

            edges.insert(
                connection.id.clone(),
                PlanEdge {
                    id: connection.id.clone(),
                    source: source_node.id.clone(),
                    source_port: source_port.name.clone(),
                    target,
                    back_edge,
                },
            );
        }

        for edge in edges.values() {
            if let Some(source) = nodes.get_mut(&edge.source) {
                source.outgoing.push(edge.id.clone());
            }
            if !edge.back_edge {
                if let Some(target) = nodes.get_mut(&edge.target) {
                    target.incoming.push(edge.id.clone());
                }
            }
        }

        let mut predecessors: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (source, targets) in &adjacency {
            for target in targets {
                predecessors
                    .entry(target.clone())
                    .or_default()
                    .insert(source.clone());
            }
        }

        // body: reachable from the loop node and leading back into its back port,
        // both without passing through the loop node itself
        let mut loop_bodies = BTreeMap::new();
        for node in nodes.values().filter(|n| n.loop_construct) {
            let forward = reachable_avoiding(&adjacency, &node.id, &node.id);
            let mut backward = BTreeSet::new();
            for edge in edges.values().filter(|e| e.back_edge && e.target == node.id) {
                backward.insert(edge.source.clone());
                backward.extend(reachable_avoiding(&predecessors, &edge.source, &node.id));
            }
            let body = forward.intersection(&backward).cloned().collect();
            loop_bodies.insert(node.id.clone(), body);
        }

        let sinks = nodes
            .values()
            .filter(|n| n.outgoing.is_empty())
            .map(|n| n.id.clone())
            .collect();

        Ok(Self {
            flow_id: graph.id.clone(),
            nodes,
            edges,
            loop_bodies,
            sinks,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
        })
    }

    /// Builder: cap on loop iterations
    pub fn with_max_loop_iterations(mut self, max: u32) -> Self {
        self.max_loop_iterations = max;
        self
    }

    /// Flow the plan was built from
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Node by id
    #[inline]
    pub fn node(&self, id: &NodeId) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values()
    }

    /// Edge by id
    #[inline]
    pub fn edge(&self, id: &ConnectionId) -> Option<&PlanEdge> {
        self.edges.get(id)
    }

    /// Nodes on the cycles through a loop node, excluding the loop node itself
    pub fn loop_body(&self, loop_node: &NodeId) -> Option<&BTreeSet<NodeId>> {
        self.loop_bodies.get(loop_node)
    }

    /// Nodes without outgoing connections
    pub fn sinks(&self) -> &BTreeSet<NodeId> {
        &self.sinks
    }

    /// Cap on loop iterations
    pub fn max_loop_iterations(&self) -> u32 {
        self.max_loop_iterations
    }
}

fn reachable_avoiding(
    adjacency: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    start: &NodeId,
    avoid: &NodeId,
) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&NodeId> = adjacency
        .get(start)
        .map(|next| next.iter().collect())
        .unwrap_or_default();
    while let Some(current) = queue.pop_front() {
        if current != avoid && seen.insert(current.clone()) {
            if let Some(next) = adjacency.get(current) {
                queue.extend(next.iter());
            }
        }
    }
    seen
}
