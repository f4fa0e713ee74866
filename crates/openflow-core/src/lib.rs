//!
//! OpenFlow Core - flow graph model and execution engine
//!
//! This crate holds the graph model with its structural invariants, the
//! mode policy that gates every mutation, the instance runner and the
//! editor session. Hosting surfaces supply persistence and node actions
//! through the traits in `domain::repository` and
//! `application::action_runtime`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - graph model, policy, instances and repository contracts
pub mod domain;

/// Application services - instance runner and editor session
pub mod application;

/// Identifier and value types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

pub use config::EngineConfig;
pub use error::{CoreError, ExecutionError, IntegrationError, PolicyError, StructuralError};
pub use types::{ConnectionId, FlowId, InstanceId, NodeId, PortId, Position, UserId};

pub use domain::execution_plan::ExecutionPlan;
pub use domain::flow_instance::{ExecutionState, FlowInstance, InstanceStatus, Outcome};
pub use domain::graph::{Connection, FlowGraph, GraphKind, Node, Port, PortDirection, Violation};
pub use domain::mode::{Mode, OperationKind, SessionContext};
pub use domain::node_type::{NodeTypeDescriptor, NodeTypeRegistry};
pub use domain::repository::{FlowDefinitionRepository, FlowInstanceRepository};

pub use application::action_runtime::{
    ActionContext, ActionRuntime, Dispatch, OutcomeReceiver, OutcomeReporter,
};
pub use application::editor_session::{ChangeRecord, EditOperation, EditorSession};
pub use application::execution_service::{
    AdvanceReport, DomainEventHandler, FlowExecutionService, LoggingEventHandler,
};
