/// Node type descriptors and registry
pub mod node_type;

/// Flow graph model
pub mod graph;

/// Session modes and capability policy
pub mod mode;

/// Execution view of a graph
pub mod execution_plan;

/// Flow instance aggregate
pub mod flow_instance;

/// Domain events
pub mod events;

/// Repository interfaces
pub mod repository;
