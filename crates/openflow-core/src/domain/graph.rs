use crate::domain::node_type::{NodeTypeDescriptor, NodeTypeRegistry};
use crate::error::{CoreError, StructuralError};
use crate::types::{ConnectionId, FlowId, NodeId, PortId, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Whether a graph is a top-level flow or a component's internals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphKind {
    /// Business flow
    #[default]
    Flow,
    /// Internals of a reusable component
    Component,
}

/// Direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    /// Accepts incoming connections
    In,
    /// Emits outgoing connections
    Out,
}

/// Attachment point on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Graph-unique port id
    pub id: PortId,

    /// Port name from the node type descriptor
    pub name: String,

    /// Port direction
    pub direction: PortDirection,

    /// Back-reference to the owning node
    pub node_id: NodeId,
}

/// A step or control-flow construct of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Graph-unique node id
    pub id: NodeId,

    /// Type key in the node type registry
    pub node_type: String,

    /// Ports in descriptor order
    pub ports: Vec<Port>,

    /// Free-form properties edited in the property panel
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,

    /// Canvas position
    #[serde(default)]
    pub position: Position,
}

impl Node {
    /// Create a node with the ports its descriptor declares
    pub fn from_descriptor(id: impl Into<String>, descriptor: &NodeTypeDescriptor) -> Self {
        let id = NodeId(id.into());
        let inputs = descriptor
            .inputs
            .iter()
            .map(|name| (name, PortDirection::In));
        let outputs = descriptor
            .outputs
            .iter()
            .map(|name| (name, PortDirection::Out));
        let ports = inputs
            .chain(outputs)
            .map(|(name, direction)| Port {
                id: PortId::for_node(&id, name),
                name: name.clone(),
                direction,
                node_id: id.clone(),
            })
            .collect();

        Self {
            id,
            node_type: descriptor.key.clone(),
            ports,
            properties: BTreeMap::new(),
            position: Position::default(),
        }
    }

    /// Builder: set a property
    pub fn with_property(mut self, name: &str, value: Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// Builder: set the position
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    /// Port by name
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Id of the port with this name
    pub fn port_id(&self, name: &str) -> Option<PortId> {
        self.port(name).map(|p| p.id.clone())
    }

    /// In-ports
    pub fn in_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports
            .iter()
            .filter(|p| p.direction == PortDirection::In)
    }

    /// Out-ports
    pub fn out_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports
            .iter()
            .filter(|p| p.direction == PortDirection::Out)
    }

    /// Failure recoverability: the `recoverable` property wins over the descriptor
    pub fn is_recoverable(&self, descriptor: &NodeTypeDescriptor) -> bool {
        self.properties
            .get("recoverable")
            .and_then(Value::as_bool)
            .unwrap_or(descriptor.recoverable)
    }
}

/// Directed connection from an out-port to an in-port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection id
    pub id: ConnectionId,
    /// Out-port the connection leaves
    pub source_port: PortId,
    /// In-port the connection enters
    pub target_port: PortId,
}

/// A structural problem reported by `FlowGraph::validate`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Violation {
    /// Node type is not registered
    UnknownType {
        /// Node
        node: NodeId,
        /// Its type key
        node_type: String,
    },
    /// Port back-reference does not name its owner
    OrphanPort {
        /// Owning node
        node: NodeId,
        /// Port
        port: PortId,
    },
    /// Connection endpoint does not exist
    DanglingConnection {
        /// Connection
        connection: ConnectionId,
        /// Missing port
        port: PortId,
    },
    /// Connection does not run out-port to in-port
    TypeMismatch {
        /// Connection
        connection: ConnectionId,
    },
    /// Several connections enter a non-join in-port
    PortOverbound {
        /// In-port
        port: PortId,
    },
    /// Required in-port has no incoming connection
    DisconnectedInput {
        /// Node
        node: NodeId,
        /// In-port
        port: PortId,
    },
    /// Cycle that does not pass through a loop node
    IllegalCycle {
        /// Node where the cycle closes
        node: NodeId,
    },
}

/// A node removed from a graph together with the connections that went with it
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    /// The node
    pub node: Node,
    /// Connections removed by the cascade
    pub connections: Vec<Connection>,
}

/// Flow definition graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Flow id
    pub id: FlowId,

    /// Human-readable name
    pub name: String,

    /// Flow or component internals
    #[serde(default)]
    pub kind: GraphKind,

    nodes: BTreeMap<NodeId, Node>,

    edges: BTreeMap<ConnectionId, Connection>,
}

impl FlowGraph {
    /// Empty flow graph
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FlowId(id.into()),
            name: name.into(),
            kind: GraphKind::Flow,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Builder: set the graph kind
    pub fn with_kind(mut self, kind: GraphKind) -> Self {
        self.kind = kind;
        self
    }

    /// Node by id
    #[inline]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Connections in id order
    pub fn edges(&self) -> impl Iterator<Item = &Connection> {
        self.edges.values()
    }

    /// Connection by id
    pub fn edge(&self, id: &ConnectionId) -> Option<&Connection> {
        self.edges.get(id)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of connections
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Find a port and its owning node
    pub fn find_port(&self, port_id: &PortId) -> Option<(&Node, &Port)> {
        self.nodes
            .values()
            .find_map(|node| node.ports.iter().find(|p| &p.id == port_id).map(|p| (node, p)))
    }

    /// Node that owns a port
    pub fn port_owner(&self, port_id: &PortId) -> Option<&NodeId> {
        self.find_port(port_id).map(|(node, _)| &node.id)
    }

    /// Connections entering a port
    pub fn incoming<'a>(&'a self, port_id: &'a PortId) -> impl Iterator<Item = &'a Connection> {
        self.edges.values().filter(move |c| &c.target_port == port_id)
    }

    /// Add a node; its type must be registered and its ports must be new
    pub fn add_node(&mut self, node: Node, registry: &NodeTypeRegistry) -> Result<(), CoreError> {
        if self.nodes.contains_key(&node.id) {
            return Err(StructuralError::DuplicateId(node.id.0.clone()).into());
        }
        registry.require(&node.node_type)?;

        let mut seen = BTreeSet::new();
        for port in &node.ports {
            let collides = !seen.insert(&port.id) || self.find_port(&port.id).is_some();
            if port.node_id != node.id || collides {
                return Err(StructuralError::InvalidPort {
                    port: port.id.0.clone(),
                    node: node.id.0.clone(),
                }
                .into());
            }
        }

        tracing::trace!(flow_id = %self.id, node_id = %node.id, node_type = %node.node_type, "Node added");
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node and every connection touching its ports
    pub fn remove_node(&mut self, id: &NodeId) -> Result<RemovedNode, CoreError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| StructuralError::NotFound(id.0.clone()))?;

        let port_ids: BTreeSet<&PortId> = node.ports.iter().map(|p| &p.id).collect();
        let doomed: Vec<ConnectionId> = self
            .edges
            .values()
            .filter(|c| port_ids.contains(&c.source_port) || port_ids.contains(&c.target_port))
            .map(|c| c.id.clone())
            .collect();
        let connections = doomed
            .iter()
            .filter_map(|cid| self.edges.remove(cid))
            .collect::<Vec<_>>();

        tracing::trace!(flow_id = %self.id, node_id = %id, cascaded = connections.len(), "Node removed");
        Ok(RemovedNode { node, connections })
    }

    /// Connect an out-port to an in-port
    pub fn connect(
        &mut self,
        source_port: &PortId,
        target_port: &PortId,
        registry: &NodeTypeRegistry,
    ) -> Result<ConnectionId, CoreError> {
        let (source_node, source) = self
            .find_port(source_port)
            .ok_or_else(|| StructuralError::NotFound(source_port.0.clone()))?;
        let (target_node, target) = self
            .find_port(target_port)
            .ok_or_else(|| StructuralError::NotFound(target_port.0.clone()))?;

        if source.direction != PortDirection::Out || target.direction != PortDirection::In {
            return Err(StructuralError::PortDirectionMismatch {
                source_port: source_port.0.clone(),
                target_port: target_port.0.clone(),
            }
            .into());
        }

        let target_is_join = registry
            .get(&target_node.node_type)
            .map(|d| d.join)
            .unwrap_or(false);
        if !target_is_join && self.incoming(target_port).next().is_some() {
            return Err(StructuralError::PortAlreadyBound(target_port.0.clone()).into());
        }

        let id = ConnectionId::between(source_port, target_port);
        if self.edges.contains_key(&id) {
            return Err(StructuralError::DuplicateId(id.0).into());
        }

        let is_loop = |node: &Node| {
            registry
                .get(&node.node_type)
                .map(|d| d.loop_construct)
                .unwrap_or(false)
        };
        if !is_loop(source_node)
            && !is_loop(target_node)
            && self.reaches_avoiding_loops(&target_node.id, &source_node.id, registry)
        {
            return Err(StructuralError::WouldCreateCycle {
                source_port: source_port.0.clone(),
                target_port: target_port.0.clone(),
            }
            .into());
        }

        self.edges.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                source_port: source_port.clone(),
                target_port: target_port.clone(),
            },
        );
        Ok(id)
    }

    /// Remove a connection
    pub fn disconnect(&mut self, id: &ConnectionId) -> Result<Connection, CoreError> {
        self.edges
            .remove(id)
            .ok_or_else(|| StructuralError::NotFound(id.0.clone()).into())
    }

    /// Move a node, returning its previous position
    pub fn move_node(&mut self, id: &NodeId, position: Position) -> Result<Position, CoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StructuralError::NotFound(id.0.clone()))?;
        Ok(std::mem::replace(&mut node.position, position))
    }

    /// Set (`Some`) or clear (`None`) a property, returning the previous value
    pub fn set_property(
        &mut self,
        id: &NodeId,
        name: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StructuralError::NotFound(id.0.clone()))?;
        Ok(match value {
            Some(value) => node.properties.insert(name.to_string(), value),
            None => node.properties.remove(name),
        })
    }

    /// Node-level adjacency derived from the connections
    pub fn successors(&self) -> BTreeMap<&NodeId, BTreeSet<&NodeId>> {
        let mut owners: BTreeMap<&PortId, &NodeId> = BTreeMap::new();
        for node in self.nodes.values() {
            for port in &node.ports {
                owners.insert(&port.id, &node.id);
            }
        }

        let mut adjacency: BTreeMap<&NodeId, BTreeSet<&NodeId>> =
            self.nodes.keys().map(|id| (id, BTreeSet::new())).collect();
        for edge in self.edges.values() {
            if let (Some(from), Some(to)) =
                (owners.get(&edge.source_port), owners.get(&edge.target_port))
            {
                adjacency.entry(*from).or_default().insert(*to);
            }
        }
        adjacency
    }

    /// Whether `to` is reachable from `from` through non-loop nodes only
    fn reaches_avoiding_loops(
        &self,
        from: &NodeId,
        to: &NodeId,
        registry: &NodeTypeRegistry,
    ) -> bool {
        let adjacency = self.successors();
        let is_loop = |id: &NodeId| {
            self.nodes
                .get(id)
                .and_then(|n| registry.get(&n.node_type))
                .map(|d| d.loop_construct)
                .unwrap_or(false)
        };

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = adjacency.get(current) {
                queue.extend(next.iter().copied().filter(|n| !is_loop(*n)));
            }
        }
        false
    }

    /// Collect every structural violation; never fails fast
    pub fn validate(&self, registry: &NodeTypeRegistry) -> BTreeSet<Violation> {
        let mut violations = BTreeSet::new();

        for node in self.nodes.values() {
            let descriptor = registry.get(&node.node_type);
            if descriptor.is_none() {
                violations.insert(Violation::UnknownType {
                    node: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }

            for port in &node.ports {
                if port.node_id != node.id {
                    violations.insert(Violation::OrphanPort {
                        node: node.id.clone(),
                        port: port.id.clone(),
                    });
                }
            }

            for port in node.in_ports() {
                let bound = self.incoming(&port.id).count();
                match descriptor {
                    Some(d) if bound == 0 && !d.is_optional_input(&port.name) => {
                        violations.insert(Violation::DisconnectedInput {
                            node: node.id.clone(),
                            port: port.id.clone(),
                        });
                    }
                    Some(d) if bound > 1 && !d.join => {
                        violations.insert(Violation::PortOverbound {
                            port: port.id.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        for edge in self.edges.values() {
            let source = self.find_port(&edge.source_port);
            let target = self.find_port(&edge.target_port);
            for (endpoint, port_id) in [(&source, &edge.source_port), (&target, &edge.target_port)] {
                if endpoint.is_none() {
                    violations.insert(Violation::DanglingConnection {
                        connection: edge.id.clone(),
                        port: port_id.clone(),
                    });
                }
            }
            if let (Some((_, s)), Some((_, t))) = (source, target) {
                if s.direction != PortDirection::Out || t.direction != PortDirection::In {
                    violations.insert(Violation::TypeMismatch {
                        connection: edge.id.clone(),
                    });
                }
            }
        }

        for node in self.illegal_cycle_closures(registry) {
            violations.insert(Violation::IllegalCycle { node });
        }

        violations
    }

    /// Depth-first search over non-loop nodes; returns the targets of back edges
    fn illegal_cycle_closures(&self, registry: &NodeTypeRegistry) -> BTreeSet<NodeId> {
        let adjacency = self.successors();
        let is_loop = |id: &NodeId| {
            self.nodes
                .get(id)
                .and_then(|n| registry.get(&n.node_type))
                .map(|d| d.loop_construct)
                .unwrap_or(false)
        };

        fn visit<'a>(
            node: &'a NodeId,
            adjacency: &BTreeMap<&'a NodeId, BTreeSet<&'a NodeId>>,
            is_loop: &dyn Fn(&NodeId) -> bool,
            done: &mut BTreeSet<&'a NodeId>,
            on_path: &mut BTreeSet<&'a NodeId>,
            closures: &mut BTreeSet<NodeId>,
        ) {
            on_path.insert(node);
            if let Some(next) = adjacency.get(node) {
                for &succ in next {
                    if is_loop(succ) || done.contains(succ) {
                        continue;
                    }
                    if on_path.contains(succ) {
                        closures.insert(succ.clone());
                    } else {
                        visit(succ, adjacency, is_loop, done, on_path, closures);
                    }
                }
            }
            on_path.remove(node);
            done.insert(node);
        }

        let mut done = BTreeSet::new();
        let mut closures = BTreeSet::new();
        for id in self.nodes.keys() {
            if !is_loop(id) && !done.contains(id) {
                visit(id, &adjacency, &is_loop, &mut done, &mut BTreeSet::new(), &mut closures);
            }
        }
        closures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> NodeTypeRegistry {
        NodeTypeRegistry::with_builtin_shapes()
    }

    fn node(reg: &NodeTypeRegistry, id: &str, kind: &str) -> Node {
        Node::from_descriptor(id, reg.get(kind).unwrap())
    }

    fn port(id: &str) -> PortId {
        PortId::from(id)
    }

    fn linear() -> (NodeTypeRegistry, FlowGraph) {
        let reg = registry();
        let mut graph = FlowGraph::new("linear", "Linear");
        graph.add_node(node(&reg, "a", "start"), &reg).unwrap();
        graph.add_node(node(&reg, "b", "task"), &reg).unwrap();
        graph.add_node(node(&reg, "c", "end"), &reg).unwrap();
        graph.connect(&port("a.out"), &port("b.in"), &reg).unwrap();
        graph.connect(&port("b.out"), &port("c.in"), &reg).unwrap();
        (reg, graph)
    }

    #[test]
    fn test_from_descriptor_ports() {
        let reg = registry();
        let n = node(&reg, "gate", "loop");
        let names: Vec<_> = n.ports.iter().map(|p| p.id.0.as_str()).collect();
        assert_eq!(names, vec!["gate.in", "gate.back", "gate.body", "gate.exit"]);
        assert!(n.ports.iter().all(|p| p.node_id == n.id));
        assert_eq!(n.in_ports().count(), 2);
    }

    #[test]
    fn test_add_node_duplicate_and_invalid_type() {
        let (reg, mut graph) = linear();

        let err = graph.add_node(node(&reg, "a", "task"), &reg).unwrap_err();
        assert_eq!(err, StructuralError::DuplicateId("a".into()).into());

        let mut custom = node(&reg, "x", "task");
        custom.node_type = "unknown".to_string();
        let err = graph.add_node(custom, &reg).unwrap_err();
        assert_eq!(err, StructuralError::InvalidType("unknown".into()).into());
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_add_node_rejects_foreign_port() {
        let reg = registry();
        let mut graph = FlowGraph::new("f", "F");
        let mut n = node(&reg, "x", "task");
        n.ports[0].node_id = NodeId::new("y");
        assert!(matches!(
            graph.add_node(n, &reg),
            Err(CoreError::Structural(StructuralError::InvalidPort { .. }))
        ));
    }

    #[test]
    fn test_remove_node_cascades_edges() {
        let (_, mut graph) = linear();
        let removed = graph.remove_node(&NodeId::new("b")).unwrap();

        assert_eq!(removed.connections.len(), 2);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(
            graph.remove_node(&NodeId::new("b")).unwrap_err(),
            StructuralError::NotFound("b".into()).into()
        );
    }

    #[test]
    fn test_connect_direction_mismatch() {
        let (reg, mut graph) = linear();
        let err = graph.connect(&port("b.in"), &port("c.in"), &reg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Structural(StructuralError::PortDirectionMismatch { .. })
        ));
    }

    #[test]
    fn test_connect_port_already_bound_unless_join() {
        let (reg, mut graph) = linear();
        graph.add_node(node(&reg, "d", "task"), &reg).unwrap();
        graph.add_node(node(&reg, "s2", "start"), &reg).unwrap();

        let err = graph.connect(&port("s2.out"), &port("b.in"), &reg).unwrap_err();
        assert_eq!(err, StructuralError::PortAlreadyBound("b.in".into()).into());

        // end is join-capable
        graph.connect(&port("d.out"), &port("c.in"), &reg).unwrap();
        assert_eq!(graph.incoming(&port("c.in")).count(), 2);
    }

    #[test]
    fn test_connect_twice_is_duplicate() {
        let (reg, mut graph) = linear();
        let err = graph.connect(&port("b.out"), &port("c.in"), &reg).unwrap_err();
        assert_eq!(err, StructuralError::DuplicateId("b.out->c.in".into()).into());
    }

    #[test]
    fn test_connect_rejects_cycle_through_plain_nodes() {
        let reg = registry();
        let mut graph = FlowGraph::new("cyc", "Cycle");
        graph.add_node(node(&reg, "x", "task"), &reg).unwrap();
        graph.add_node(node(&reg, "j", "join"), &reg).unwrap();
        graph.connect(&port("x.out"), &port("j.in"), &reg).unwrap();

        let err = graph.connect(&port("j.out"), &port("x.in"), &reg).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Structural(StructuralError::WouldCreateCycle { .. })
        ));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_connect_allows_cycle_through_loop() {
        let reg = registry();
        let mut graph = FlowGraph::new("loop", "Loop");
        graph.add_node(node(&reg, "l", "loop"), &reg).unwrap();
        graph.add_node(node(&reg, "work", "task"), &reg).unwrap();
        graph.connect(&port("l.body"), &port("work.in"), &reg).unwrap();
        graph.connect(&port("work.out"), &port("l.back"), &reg).unwrap();
        assert!(graph.validate(&reg).iter().all(|v| !matches!(v, Violation::IllegalCycle { .. })));
    }

    #[test]
    fn test_self_loop_rejected() {
        let reg = registry();
        let mut graph = FlowGraph::new("self", "Self");
        graph.add_node(node(&reg, "j", "join"), &reg).unwrap();
        assert!(matches!(
            graph.connect(&port("j.out"), &port("j.in"), &reg),
            Err(CoreError::Structural(StructuralError::WouldCreateCycle { .. }))
        ));
    }

    #[test]
    fn test_property_and_move_return_previous() {
        let (_, mut graph) = linear();
        let b = NodeId::new("b");
        assert_eq!(graph.set_property(&b, "script", Some(json!("echo"))).unwrap(), None);
        assert_eq!(
            graph.set_property(&b, "script", None).unwrap(),
            Some(json!("echo"))
        );
        let old = graph.move_node(&b, Position::new(10.0, 20.0)).unwrap();
        assert_eq!(old, Position::default());
        assert_eq!(graph.node(&b).unwrap().position, Position::new(10.0, 20.0));
    }

    #[test]
    fn test_validate_valid_linear_graph() {
        let (reg, graph) = linear();
        assert!(graph.validate(&reg).is_empty());
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let (reg, mut graph) = linear();
        graph.add_node(node(&reg, "lonely", "task"), &reg).unwrap();

        let mut broken: FlowGraph =
            serde_json::from_value(serde_json::to_value(&graph).unwrap()).unwrap();
        broken.edges.insert(
            ConnectionId("ghost".into()),
            Connection {
                id: ConnectionId("ghost".into()),
                source_port: port("nowhere.out"),
                target_port: port("lonely.in"),
            },
        );
        broken.edges.insert(
            ConnectionId("backwards".into()),
            Connection {
                id: ConnectionId("backwards".into()),
                source_port: port("c.in"),
                target_port: port("b.out"),
            },
        );
        if let Some(n) = broken.nodes.get_mut(&NodeId::new("lonely")) {
            n.node_type = "mystery".into();
        }

        let violations = broken.validate(&reg);
        assert!(violations.contains(&Violation::DanglingConnection {
            connection: ConnectionId("ghost".into()),
            port: port("nowhere.out"),
        }));
        assert!(violations.contains(&Violation::TypeMismatch {
            connection: ConnectionId("backwards".into()),
        }));
        assert!(violations.contains(&Violation::UnknownType {
            node: NodeId::new("lonely"),
            node_type: "mystery".into(),
        }));
    }

    #[test]
    fn test_validate_reports_disconnected_input_and_is_idempotent() {
        let (reg, mut graph) = linear();
        graph.add_node(node(&reg, "orphan", "task"), &reg).unwrap();

        let first = graph.validate(&reg);
        let second = graph.validate(&reg);
        assert_eq!(first, second);
        assert_eq!(
            first,
            BTreeSet::from([Violation::DisconnectedInput {
                node: NodeId::new("orphan"),
                port: port("orphan.in"),
            }])
        );
    }

    #[test]
    fn test_graph_json_round_trip_keeps_order() {
        let (_, graph) = linear();
        let text = serde_json::to_string(&graph).unwrap();
        let back: FlowGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(back, graph);
    }
}
