use crate::domain::graph::Violation;
use crate::domain::mode::{Mode, OperationKind};
use thiserror::Error;

/// Violations of the graph model's structural invariants
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// A node, port, connection or node type with this id already exists
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// The node type is not registered
    #[error("Unregistered node type: {0}")]
    InvalidType(String),

    /// Node, port or connection not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The port does not belong to the node it claims, or collides with another port
    #[error("Invalid port {port} on node {node}")]
    InvalidPort {
        /// Offending port
        port: String,
        /// Node that carries the port
        node: String,
    },

    /// Connections must run from an out-port to an in-port
    #[error("Cannot connect {source_port} to {target_port}: direction mismatch")]
    PortDirectionMismatch {
        /// Source port id
        source_port: String,
        /// Target port id
        target_port: String,
    },

    /// The in-port already has an incoming connection and its node is not a join
    #[error("In-port already bound: {0}")]
    PortAlreadyBound(String),

    /// The connection would close a cycle that does not pass through a loop node
    #[error("Connecting {source_port} to {target_port} would create a cycle")]
    WouldCreateCycle {
        /// Source port id
        source_port: String,
        /// Target port id
        target_port: String,
    },

    /// The graph has structural violations and cannot be used here
    #[error("Graph has {} structural violation(s)", .0.len())]
    InvalidGraph(Vec<Violation>),
}

/// Mode policy rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The session mode does not grant the capability for this operation
    #[error("Operation {operation:?} is not permitted in {mode:?} mode")]
    NotPermittedInMode {
        /// Attempted operation
        operation: OperationKind,
        /// Mode of the session
        mode: Mode,
    },

    /// The mode flag is not one of 0, 1, 2 or 4
    #[error("Unknown mode flag: {0}")]
    UnknownMode(i64),
}

/// Instance runner errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The instance was completed, failed or terminated
    #[error("Instance is sealed: {0}")]
    InstanceSealed(String),

    /// A node action reported failure
    #[error("Node {node} failed: {reason}")]
    NodeActionFailed {
        /// Failed node
        node: String,
        /// Failure reason reported by the action
        reason: String,
    },

    /// No live instance with this id
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// An outcome was reported for a node that is not running
    #[error("Node {0} is not running")]
    NodeNotRunning(String),

    /// Every receiver of the outcome channel is gone
    #[error("Outcome channel closed, report for instance {0} was not delivered")]
    ReportChannelClosed(String),

    /// The outcome does not fit the node that produced it
    #[error("Invalid outcome for node {node}: {reason}")]
    InvalidOutcome {
        /// Node that produced the outcome
        node: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Failures of external collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// The persistence adapter could not serve the request
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

/// Core error type for the OpenFlow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Graph model invariant violated
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Mode policy rejection
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Instance execution error
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// External collaborator failure
    #[error(transparent)]
    Integration(#[from] IntegrationError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl CoreError {
    /// Structural and policy errors reject one operation and leave state untouched
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::Structural(_) | CoreError::Policy(_))
    }

    /// Integration errors may succeed when the caller retries
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Integration(_))
    }

    /// Shorthand for a persistence failure
    pub fn persistence(message: impl Into<String>) -> Self {
        IntegrationError::PersistenceUnavailable(message.into()).into()
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}
