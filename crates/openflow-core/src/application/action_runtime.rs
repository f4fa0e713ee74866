//! Contract between the instance runner and the node actions it drives.

use crate::domain::flow_instance::Outcome;
use crate::domain::graph::Node;
use crate::error::{CoreError, ExecutionError};
use crate::types::{InstanceId, NodeId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// What an action returned when it was run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The action finished synchronously
    Completed(Outcome),
    /// The action will report later through its `OutcomeReporter`
    Deferred,
}

/// A deferred outcome on its way back to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeReport {
    /// Instance the node belongs to
    pub instance_id: InstanceId,
    /// Node that finished
    pub node_id: NodeId,
    /// What happened
    pub outcome: Outcome,
}

/// Receiving half of the outcome channel
pub type OutcomeReceiver = mpsc::Receiver<OutcomeReport>;

/// Sending half of the outcome channel, handed to actions
#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    sender: mpsc::Sender<OutcomeReport>,
}

impl OutcomeReporter {
    /// Report the outcome of a deferred action
    pub async fn report(
        &self,
        instance_id: InstanceId,
        node_id: NodeId,
        outcome: Outcome,
    ) -> Result<(), CoreError> {
        self.sender
            .send(OutcomeReport {
                instance_id,
                node_id,
                outcome,
            })
            .await
            .map_err(|e| ExecutionError::ReportChannelClosed(e.0.instance_id.0).into())
    }
}

/// Create a bounded outcome channel
pub fn outcome_channel(capacity: usize) -> (OutcomeReporter, OutcomeReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (OutcomeReporter { sender }, receiver)
}

/// Everything an action gets to see about the run it is part of
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Instance being executed
    pub instance_id: InstanceId,

    /// Node being run
    pub node_id: NodeId,

    /// Instance parameters at the time the node started
    pub parameters: BTreeMap<String, Value>,

    reporter: OutcomeReporter,
}

impl ActionContext {
    /// Create a context
    pub fn new(
        instance_id: InstanceId,
        node_id: NodeId,
        parameters: BTreeMap<String, Value>,
        reporter: OutcomeReporter,
    ) -> Self {
        Self {
            instance_id,
            node_id,
            parameters,
            reporter,
        }
    }

    /// Reporter for a deferred outcome, cloneable into a spawned task
    pub fn reporter(&self) -> OutcomeReporter {
        self.reporter.clone()
    }

    /// Report the outcome of this node
    pub async fn report(&self, outcome: Outcome) -> Result<(), CoreError> {
        self.reporter
            .report(self.instance_id.clone(), self.node_id.clone(), outcome)
            .await
    }
}

/// Runtime behaviour of node actions
///
/// The engine never interprets what an action does. An `Err` is treated
/// as a failure outcome of the node.
#[async_trait]
pub trait ActionRuntime: Send + Sync {
    /// Run the action of `node`
    async fn run(&self, node: &Node, context: ActionContext) -> Result<Dispatch, CoreError>;
}
