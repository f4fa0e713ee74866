//! Session modes and the capability table that gates every mutation.

use crate::domain::graph::GraphKind;
use crate::error::PolicyError;
use crate::types::UserId;
use serde::{Deserialize, Serialize};

/// Runtime behaviour selected by the hosting page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Flow authoring
    Design,
    /// Running instances of a finished flow
    Instantiate,
    /// Read-only inspection
    View,
    /// Authoring the internals of a reusable component
    ComponentDev,
}

/// Which graphs a mode may restructure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureScope {
    /// No structural edits
    None,
    /// Any graph
    Any,
    /// Only graphs of kind `Component`
    ComponentInternals,
}

/// Which properties a mode may edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyScope {
    /// No property edits
    None,
    /// Only parameters of a running instance
    InstanceParameters,
    /// Node properties of the graph
    All,
}

/// Capability set of a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Structural editing
    pub structure: StructureScope,
    /// Property editing
    pub properties: PropertyScope,
    /// Creating and driving instances
    pub instantiate: bool,
    /// Read-only session
    pub view_only: bool,
}

/// Every operation that is checked against the mode policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Add a node
    AddNode,
    /// Remove a node and its connections
    RemoveNode,
    /// Connect two ports
    Connect,
    /// Remove a connection
    Disconnect,
    /// Move a node on the canvas
    MoveNode,
    /// Set or clear a node property
    SetProperty,
    /// Persist the flow definition
    SaveDefinition,
    /// Create an instance from a definition
    Instantiate,
    /// Set an instance parameter
    SetInstanceParameter,
    /// Advance an instance
    Advance,
    /// Report a node action outcome
    ReportOutcome,
    /// Terminate an instance
    Terminate,
}

impl OperationKind {
    /// All gated operations
    pub const ALL: [OperationKind; 12] = [
        OperationKind::AddNode,
        OperationKind::RemoveNode,
        OperationKind::Connect,
        OperationKind::Disconnect,
        OperationKind::MoveNode,
        OperationKind::SetProperty,
        OperationKind::SaveDefinition,
        OperationKind::Instantiate,
        OperationKind::SetInstanceParameter,
        OperationKind::Advance,
        OperationKind::ReportOutcome,
        OperationKind::Terminate,
    ];

    /// Operations that change the graph's structure or layout
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            OperationKind::AddNode
                | OperationKind::RemoveNode
                | OperationKind::Connect
                | OperationKind::Disconnect
                | OperationKind::MoveNode
        )
    }
}

impl Mode {
    /// All modes
    pub const ALL: [Mode; 4] = [Mode::Design, Mode::Instantiate, Mode::View, Mode::ComponentDev];

    /// Parse the page's mode flag
    pub fn from_flag(flag: i64) -> Result<Self, PolicyError> {
        match flag {
            0 => Ok(Mode::Design),
            1 => Ok(Mode::Instantiate),
            2 => Ok(Mode::View),
            4 => Ok(Mode::ComponentDev),
            other => Err(PolicyError::UnknownMode(other)),
        }
    }

    /// The page's mode flag
    pub fn flag(self) -> i64 {
        match self {
            Mode::Design => 0,
            Mode::Instantiate => 1,
            Mode::View => 2,
            Mode::ComponentDev => 4,
        }
    }

    /// Capability table
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Mode::Design => Capabilities {
                structure: StructureScope::Any,
                properties: PropertyScope::All,
                instantiate: false,
                view_only: false,
            },
            Mode::Instantiate => Capabilities {
                structure: StructureScope::None,
                properties: PropertyScope::InstanceParameters,
                instantiate: true,
                view_only: false,
            },
            Mode::View => Capabilities {
                structure: StructureScope::None,
                properties: PropertyScope::None,
                instantiate: false,
                view_only: true,
            },
            Mode::ComponentDev => Capabilities {
                structure: StructureScope::ComponentInternals,
                properties: PropertyScope::All,
                instantiate: false,
                view_only: false,
            },
        }
    }

    /// Whether the editor canvas accepts edits at all
    pub fn is_editable(self) -> bool {
        self.capabilities().structure != StructureScope::None
    }

    /// Whether a definition with validation violations may be saved
    pub fn allows_partial_save(self) -> bool {
        self.is_editable()
    }

    /// Whether `operation` is allowed on a graph of kind `kind`
    pub fn permits(self, operation: OperationKind, kind: GraphKind) -> bool {
        let caps = self.capabilities();
        let structure_ok = match caps.structure {
            StructureScope::None => false,
            StructureScope::Any => true,
            StructureScope::ComponentInternals => kind == GraphKind::Component,
        };

        match operation {
            op if op.is_structural() => structure_ok,
            OperationKind::SetProperty => caps.properties == PropertyScope::All && structure_ok,
            OperationKind::SaveDefinition => structure_ok,
            OperationKind::SetInstanceParameter => {
                caps.properties == PropertyScope::InstanceParameters
            }
            OperationKind::Instantiate
            | OperationKind::Advance
            | OperationKind::ReportOutcome
            | OperationKind::Terminate => caps.instantiate,
            _ => false,
        }
    }

    /// The single capability gate; fails with `NotPermittedInMode`
    pub fn check(self, operation: OperationKind, kind: GraphKind) -> Result<(), PolicyError> {
        if self.permits(operation, kind) {
            Ok(())
        } else {
            tracing::debug!(mode = ?self, operation = ?operation, "Operation rejected by mode policy");
            Err(PolicyError::NotPermittedInMode {
                operation,
                mode: self,
            })
        }
    }
}

/// Mode and acting user, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    mode: Mode,
    user: UserId,
}

impl SessionContext {
    /// Start a session from the page's mode flag
    pub fn start(flag: i64, user: impl Into<String>) -> Result<Self, PolicyError> {
        let mode = Mode::from_flag(flag)?;
        Ok(Self::new(mode, UserId(user.into())))
    }

    /// Session with an already parsed mode
    pub fn new(mode: Mode, user: UserId) -> Self {
        tracing::info!(mode = ?mode, user = %user, "Session started");
        Self { mode, user }
    }

    /// Session mode
    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Acting user
    #[inline]
    pub fn user(&self) -> &UserId {
        &self.user
    }
}
