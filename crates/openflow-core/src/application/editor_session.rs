//! Design-time editing of a flow graph behind the mode policy.

use crate::domain::graph::{FlowGraph, Node, Violation};
use crate::domain::mode::{OperationKind, SessionContext};
use crate::domain::node_type::NodeTypeRegistry;
use crate::domain::repository::FlowDefinitionRepository;
use crate::error::{CoreError, StructuralError};
use crate::types::{ConnectionId, FlowId, NodeId, PortId, Position, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A single user edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditOperation {
    /// Add a node
    AddNode {
        /// The node, ports included
        node: Node,
    },
    /// Remove a node and its connections
    RemoveNode {
        /// Node to remove
        node_id: NodeId,
    },
    /// Connect an out-port to an in-port
    Connect {
        /// Out-port
        source: PortId,
        /// In-port
        target: PortId,
    },
    /// Remove a connection
    Disconnect {
        /// Connection to remove
        connection_id: ConnectionId,
    },
    /// Move a node on the canvas
    MoveNode {
        /// Node to move
        node_id: NodeId,
        /// New position
        position: Position,
    },
    /// Set (`Some`) or clear (`None`) a node property
    SetProperty {
        /// Node to edit
        node_id: NodeId,
        /// Property name
        name: String,
        /// New value
        value: Option<Value>,
    },
}

impl EditOperation {
    /// Operation kind checked against the mode policy
    pub fn kind(&self) -> OperationKind {
        match self {
            EditOperation::AddNode { .. } => OperationKind::AddNode,
            EditOperation::RemoveNode { .. } => OperationKind::RemoveNode,
            EditOperation::Connect { .. } => OperationKind::Connect,
            EditOperation::Disconnect { .. } => OperationKind::Disconnect,
            EditOperation::MoveNode { .. } => OperationKind::MoveNode,
            EditOperation::SetProperty { .. } => OperationKind::SetProperty,
        }
    }

    /// Whether applying the operation bumps the graph revision
    pub fn bumps_revision(&self) -> bool {
        !matches!(
            self,
            EditOperation::MoveNode { .. } | EditOperation::SetProperty { .. }
        )
    }
}

/// Entry of the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the log, starting at 1
    pub sequence: u64,

    /// Graph revision after the change
    pub revision: u64,

    /// User who made the change
    pub user: UserId,

    /// The applied operation
    pub operation: EditOperation,

    /// Operations that restore the previous graph, in order
    pub inverse: Vec<EditOperation>,

    /// When the change was applied
    pub applied_at: DateTime<Utc>,
}

/// Mediates user edits on one flow graph
pub struct EditorSession {
    context: SessionContext,
    registry: Arc<NodeTypeRegistry>,
    graph: FlowGraph,
    revision: u64,
    next_sequence: u64,
    log: Vec<ChangeRecord>,
}

impl EditorSession {
    /// Start editing an in-memory graph at revision 0
    pub fn new(context: SessionContext, registry: Arc<NodeTypeRegistry>, graph: FlowGraph) -> Self {
        info!(
            flow_id = %graph.id,
            mode = ?context.mode(),
            user = %context.user(),
            "Editor session opened"
        );
        Self {
            context,
            registry,
            graph,
            revision: 0,
            next_sequence: 1,
            log: Vec::new(),
        }
    }

    /// Load a definition through the persistence adapter and start editing it
    pub async fn open(
        context: SessionContext,
        registry: Arc<NodeTypeRegistry>,
        repo: &dyn FlowDefinitionRepository,
        flow_id: &FlowId,
    ) -> Result<Self, CoreError> {
        let graph = repo.load_definition(flow_id).await.map_err(|e| {
            error!(flow_id = %flow_id, error = %e, "Failed to load flow definition");
            e
        })?;
        Ok(Self::new(context, registry, graph))
    }

    /// Session context
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Current graph
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Current revision
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Full change log
    pub fn changes(&self) -> &[ChangeRecord] {
        &self.log
    }

    /// Changes made since the session was at `revision`
    pub fn changes_since(&self, revision: u64) -> Vec<&ChangeRecord> {
        self.log
            .iter()
            .filter(|r| {
                r.revision > revision
                    || (r.revision == revision && !r.operation.bumps_revision())
            })
            .collect()
    }

    /// Full copy of the current graph
    pub fn snapshot(&self) -> FlowGraph {
        self.graph.clone()
    }

    /// Structural violations of the current graph
    pub fn validate(&self) -> BTreeSet<Violation> {
        self.graph.validate(&self.registry)
    }

    /// Apply an edit and return the graph revision
    pub fn apply(&mut self, operation: EditOperation) -> Result<u64, CoreError> {
        self.check(operation.kind())?;

        let inverse = Self::execute(&mut self.graph, &self.registry, &operation)?;
        if operation.bumps_revision() {
            self.revision += 1;
        }

        info!(
            flow_id = %self.graph.id,
            operation = ?operation.kind(),
            revision = self.revision,
            user = %self.context.user(),
            "Edit applied"
        );

        self.log.push(ChangeRecord {
            sequence: self.next_sequence,
            revision: self.revision,
            user: self.context.user().clone(),
            operation,
            inverse,
            applied_at: Utc::now(),
        });
        self.next_sequence += 1;
        Ok(self.revision)
    }

    /// Revert the last change and drop it from the log
    ///
    /// Returns `None` when there is nothing to undo.
    pub fn undo(&mut self) -> Result<Option<u64>, CoreError> {
        let Some(last) = self.log.last() else {
            return Ok(None);
        };
        for op in &last.inverse {
            self.check(op.kind())?;
        }

        let mut graph = self.graph.clone();
        for op in &last.inverse {
            Self::execute(&mut graph, &self.registry, op)?;
        }
        let bumps = last.operation.bumps_revision();
        let sequence = last.sequence;

        self.graph = graph;
        self.log.pop();
        if bumps {
            self.revision += 1;
        }

        info!(
            flow_id = %self.graph.id,
            sequence,
            revision = self.revision,
            user = %self.context.user(),
            "Edit undone"
        );
        Ok(Some(self.revision))
    }

    /// Persist the graph; invalid graphs only where the mode allows partial saves
    pub async fn save(&self, repo: &dyn FlowDefinitionRepository) -> Result<u64, CoreError> {
        self.check(OperationKind::SaveDefinition)?;

        let violations = self.validate();
        if !violations.is_empty() {
            if !self.context.mode().allows_partial_save() {
                return Err(StructuralError::InvalidGraph(violations.into_iter().collect()).into());
            }
            debug!(
                flow_id = %self.graph.id,
                violations = violations.len(),
                "Saving partial graph"
            );
        }

        let version = repo.save_definition(&self.graph).await.map_err(|e| {
            error!(flow_id = %self.graph.id, error = %e, "Failed to save flow definition");
            e
        })?;
        info!(flow_id = %self.graph.id, revision = self.revision, version, "Flow definition saved");
        Ok(version)
    }

    fn check(&self, operation: OperationKind) -> Result<(), CoreError> {
        self.context
            .mode()
            .check(operation, self.graph.kind)
            .map_err(|e| {
                debug!(flow_id = %self.graph.id, revision = self.revision, error = %e, "Edit rejected");
                e.into()
            })
    }

    fn execute(
        graph: &mut FlowGraph,
        registry: &NodeTypeRegistry,
        operation: &EditOperation,
    ) -> Result<Vec<EditOperation>, CoreError> {
        Ok(match operation {
            EditOperation::AddNode { node } => {
                graph.add_node(node.clone(), registry)?;
                vec![EditOperation::RemoveNode {
                    node_id: node.id.clone(),
                }]
            }
            EditOperation::RemoveNode { node_id } => {
                let removed = graph.remove_node(node_id)?;
                let mut inverse = vec![EditOperation::AddNode { node: removed.node }];
                inverse.extend(removed.connections.into_iter().map(|c| EditOperation::Connect {
                    source: c.source_port,
                    target: c.target_port,
                }));
                inverse
            }
            EditOperation::Connect { source, target } => {
                let connection_id = graph.connect(source, target, registry)?;
                vec![EditOperation::Disconnect { connection_id }]
            }
            EditOperation::Disconnect { connection_id } => {
                let connection = graph.disconnect(connection_id)?;
                vec![EditOperation::Connect {
                    source: connection.source_port,
                    target: connection.target_port,
                }]
            }
            EditOperation::MoveNode { node_id, position } => {
                let previous = graph.move_node(node_id, *position)?;
                vec![EditOperation::MoveNode {
                    node_id: node_id.clone(),
                    position: previous,
                }]
            }
            EditOperation::SetProperty {
                node_id,
                name,
                value,
            } => {
                let previous = graph.set_property(node_id, name, value.clone())?;
                vec![EditOperation::SetProperty {
                    node_id: node_id.clone(),
                    name: name.clone(),
                    value: previous,
                }]
            }
        })
    }
}
