//! Registry of node type capability descriptors.
//!
//! Node kinds are data, not behaviour: the graph model and the runner look
//! up ports, join capability and loop tagging by type key.

use crate::error::{CoreError, StructuralError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capabilities of one node type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTypeDescriptor {
    /// Type key referenced by nodes
    pub key: String,

    /// Names of the in-ports, in order
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Names of the out-ports, in order
    #[serde(default)]
    pub outputs: Vec<String>,

    /// In-ports may accept several incoming connections and the node waits for all of them
    #[serde(default)]
    pub join: bool,

    /// The action's outcome selects which out-ports are taken
    #[serde(default)]
    pub gateway: bool,

    /// Cycles are legal through nodes of this type
    #[serde(default)]
    pub loop_construct: bool,

    /// A failure of this node does not fail the instance by itself
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
}

impl NodeTypeDescriptor {
    /// Descriptor with the given ports and no special capabilities
    pub fn new(key: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            join: false,
            gateway: false,
            loop_construct: false,
            recoverable: true,
        }
    }

    /// Mark as join-capable
    pub fn join(mut self) -> Self {
        self.join = true;
        self
    }

    /// Mark as gateway
    pub fn gateway(mut self) -> Self {
        self.gateway = true;
        self
    }

    /// Mark as loop construct
    pub fn looping(mut self) -> Self {
        self.loop_construct = true;
        self
    }

    /// Mark failures as fatal to the instance
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Whether the named port is an optional loop-back input
    pub fn is_optional_input(&self, port_name: &str) -> bool {
        self.loop_construct && port_name == LOOP_BACK_PORT
    }
}

fn default_recoverable() -> bool {
    true
}

/// In-port of a loop node that receives the loop-back connection
pub const LOOP_BACK_PORT: &str = "back";

/// Out-port of a loop node that enters the body
pub const LOOP_BODY_PORT: &str = "body";

/// Node types known to a session
#[derive(Debug, Clone, Default)]
pub struct NodeTypeRegistry {
    types: BTreeMap<String, NodeTypeDescriptor>,
}

impl NodeTypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the editor's built-in shapes
    pub fn with_builtin_shapes() -> Self {
        let mut registry = Self::new();
        let builtins = [
            NodeTypeDescriptor::new("start", &[], &["out"]),
            NodeTypeDescriptor::new("end", &["in"], &[]).join(),
            NodeTypeDescriptor::new("task", &["in"], &["out"]),
            NodeTypeDescriptor::new("component", &["in"], &["out"]),
            NodeTypeDescriptor::new("condition", &["in"], &["yes", "no"]).gateway(),
            NodeTypeDescriptor::new("join", &["in"], &["out"]).join(),
            NodeTypeDescriptor::new("loop", &["in", LOOP_BACK_PORT], &[LOOP_BODY_PORT, "exit"])
                .gateway()
                .looping(),
        ];
        for descriptor in builtins {
            registry.types.insert(descriptor.key.clone(), descriptor);
        }
        registry
    }

    /// Register a new node type; keys are unique
    pub fn register(&mut self, descriptor: NodeTypeDescriptor) -> Result<(), CoreError> {
        if self.types.contains_key(&descriptor.key) {
            return Err(StructuralError::DuplicateId(descriptor.key).into());
        }
        tracing::debug!(node_type = %descriptor.key, "Registered node type");
        self.types.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by type key
    #[inline]
    pub fn get(&self, key: &str) -> Option<&NodeTypeDescriptor> {
        self.types.get(key)
    }

    /// Look up a descriptor, failing with `InvalidType`
    pub fn require(&self, key: &str) -> Result<&NodeTypeDescriptor, CoreError> {
        self.get(key)
            .ok_or_else(|| StructuralError::InvalidType(key.to_string()).into())
    }

    /// Registered type keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
