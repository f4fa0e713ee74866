//! Persistence interfaces for flow definitions and instance snapshots
//!
//! The engine only ever talks to these traits. Adapters for concrete
//! stores live outside this crate; the in-memory versions below back the
//! headless host and the tests.

use async_trait::async_trait;

use super::flow_instance::FlowInstance;
use super::graph::FlowGraph;
use crate::types::{FlowId, InstanceId};
use crate::CoreError;

/// Repository for flow definitions
#[async_trait]
pub trait FlowDefinitionRepository: Send + Sync {
    /// Load a flow definition by ID
    async fn load_definition(&self, id: &FlowId) -> Result<FlowGraph, CoreError>;

    /// Save a flow definition and return its stored version
    async fn save_definition(&self, graph: &FlowGraph) -> Result<u64, CoreError>;
}

/// Repository for instance snapshots
#[async_trait]
pub trait FlowInstanceRepository: Send + Sync {
    /// Load the latest snapshot of an instance
    async fn load_instance(&self, id: &InstanceId) -> Result<FlowInstance, CoreError>;

    /// Save a snapshot of an instance
    async fn save_instance_snapshot(&self, instance: &FlowInstance) -> Result<(), CoreError>;
}

/// Memory implementations
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// In-memory definition store keeping every saved version
    #[derive(Default, Clone)]
    pub struct MemoryFlowDefinitionRepository {
        definitions: Arc<DashMap<FlowId, Vec<FlowGraph>>>,
    }

    impl MemoryFlowDefinitionRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored versions of a definition
        pub fn version_count(&self, id: &FlowId) -> usize {
            self.definitions.get(id).map(|v| v.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl FlowDefinitionRepository for MemoryFlowDefinitionRepository {
        async fn load_definition(&self, id: &FlowId) -> Result<FlowGraph, CoreError> {
            self.definitions
                .get(id)
                .and_then(|versions| versions.last().cloned())
                .ok_or_else(|| CoreError::persistence(format!("Flow definition not found: {}", id)))
        }

        async fn save_definition(&self, graph: &FlowGraph) -> Result<u64, CoreError> {
            let mut versions = self.definitions.entry(graph.id.clone()).or_default();
            versions.push(graph.clone());
            Ok(versions.len() as u64)
        }
    }

    /// In-memory snapshot store; snapshots are kept serialized
    #[derive(Default, Clone)]
    pub struct MemoryFlowInstanceRepository {
        snapshots: Arc<DashMap<InstanceId, String>>,
    }

    impl MemoryFlowInstanceRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Whether a snapshot exists for the instance
        pub fn contains(&self, id: &InstanceId) -> bool {
            self.snapshots.contains_key(id)
        }
    }

    #[async_trait]
    impl FlowInstanceRepository for MemoryFlowInstanceRepository {
        async fn load_instance(&self, id: &InstanceId) -> Result<FlowInstance, CoreError> {
            let snapshot = self
                .snapshots
                .get(id)
                .ok_or_else(|| CoreError::persistence(format!("Instance snapshot not found: {}", id)))?;
            Ok(serde_json::from_str(snapshot.value())?)
        }

        async fn save_instance_snapshot(&self, instance: &FlowInstance) -> Result<(), CoreError> {
            let snapshot = serde_json::to_string(instance)?;
            self.snapshots.insert(instance.id.clone(), snapshot);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use crate::error::IntegrationError;

    #[tokio::test]
    async fn test_definition_versions() {
        let repo = MemoryFlowDefinitionRepository::new();
        let graph = FlowGraph::new("orders", "Orders");

        assert_eq!(repo.save_definition(&graph).await.unwrap(), 1);
        assert_eq!(repo.save_definition(&graph).await.unwrap(), 2);
        assert_eq!(repo.load_definition(&graph.id).await.unwrap().name, "Orders");
        assert_eq!(repo.version_count(&graph.id), 2);
    }

    #[tokio::test]
    async fn test_missing_definition() {
        let repo = MemoryFlowDefinitionRepository::new();
        let err = repo.load_definition(&FlowId::from("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Integration(IntegrationError::PersistenceUnavailable(_))
        ));
    }

    #[test]
    fn test_missing_snapshot() {
        use tokio_test::block_on;

        let repo = MemoryFlowInstanceRepository::new();
        let id = InstanceId::generate();
        assert!(!repo.contains(&id));
        assert!(block_on(repo.load_instance(&id)).unwrap_err().is_retryable());
    }
}
