use crate::domain::flow_instance::{ExecutionState, InstanceStatus};
use crate::types::{FlowId, InstanceId, NodeId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for everything an instance records
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the instance ID this event is associated with
    fn instance_id(&self) -> &InstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;

    /// Node the event is about, if any
    fn node_id(&self) -> Option<&NodeId> {
        None
    }

    /// State the node moved into, for node transitions
    fn node_state(&self) -> Option<ExecutionState> {
        None
    }
}

/// Event: instance created from a flow definition
#[derive(Debug)]
pub struct InstanceCreated {
    /// The instance
    pub instance_id: InstanceId,

    /// The definition it was created from
    pub flow_id: FlowId,

    /// When it was created
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceCreated {
    fn event_type(&self) -> &'static str {
        "instance.created"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: a node changed execution state
#[derive(Debug)]
pub struct NodeStateChanged {
    /// The instance
    pub instance_id: InstanceId,

    /// The node
    pub node_id: NodeId,

    /// Previous state
    pub from: ExecutionState,

    /// New state
    pub to: ExecutionState,

    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for NodeStateChanged {
    fn event_type(&self) -> &'static str {
        "node.state_changed"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn node_id(&self) -> Option<&NodeId> {
        Some(&self.node_id)
    }

    fn node_state(&self) -> Option<ExecutionState> {
        Some(self.to)
    }
}

/// Event: instance reached a terminal status
#[derive(Debug)]
pub struct InstanceSealed {
    /// The instance
    pub instance_id: InstanceId,

    /// Terminal status
    pub status: InstanceStatus,

    /// When it was sealed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InstanceSealed {
    fn event_type(&self) -> &'static str {
        "instance.sealed"
    }

    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let id = InstanceId("i-1".to_string());
        let now = Utc::now();

        let events: Vec<Box<dyn DomainEvent>> = vec![
            Box::new(InstanceCreated {
                instance_id: id.clone(),
                flow_id: FlowId("f".to_string()),
                timestamp: now,
            }),
            Box::new(NodeStateChanged {
                instance_id: id.clone(),
                node_id: NodeId::new("a"),
                from: ExecutionState::Ready,
                to: ExecutionState::Running,
                timestamp: now,
            }),
            Box::new(InstanceSealed {
                instance_id: id.clone(),
                status: InstanceStatus::Completed,
                timestamp: now,
            }),
        ];

        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["instance.created", "node.state_changed", "instance.sealed"]);
        assert!(events.iter().all(|e| e.instance_id() == &id && e.timestamp() == now));
        assert_eq!(events[1].node_state(), Some(ExecutionState::Running));
        assert_eq!(events[2].node_id(), None);
    }
}
