//! Action runtime that takes each node's result from its properties
//!
//! `outcome` is one of `success` (default), `failure` or `skip`.
//! `reason` names the failure. `branch` selects gateway ports and takes a
//! port name or a list of them. `delay_ms` defers the node and reports the
//! outcome from a background task once the delay has passed.

use async_trait::async_trait;
use openflow_core::{ActionContext, ActionRuntime, CoreError, Dispatch, ExecutionError, Node, Outcome};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Runtime driven by node properties
#[derive(Debug, Default, Clone)]
pub struct PropertyRuntime;

impl PropertyRuntime {
    /// Outcome described by the node's properties
    pub fn outcome_for(node: &Node) -> Result<Outcome, CoreError> {
        if let Some(branch) = node.properties.get("branch") {
            let ports = match branch {
                Value::String(port) => vec![port.clone()],
                Value::Array(ports) => ports
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect(),
                other => {
                    return Err(ExecutionError::InvalidOutcome {
                        node: node.id.0.clone(),
                        reason: format!("branch must be a port name or a list, got {}", other),
                    }
                    .into())
                }
            };
            return Ok(Outcome::Branch(ports));
        }

        let kind = node
            .properties
            .get("outcome")
            .and_then(Value::as_str)
            .unwrap_or("success");
        match kind {
            "success" => Ok(Outcome::Success),
            "skip" => Ok(Outcome::Skip),
            "failure" => {
                let reason = node
                    .properties
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("failed");
                Ok(Outcome::Failure(reason.to_string()))
            }
            other => Err(ExecutionError::InvalidOutcome {
                node: node.id.0.clone(),
                reason: format!("unknown outcome '{}'", other),
            }
            .into()),
        }
    }
}

#[async_trait]
impl ActionRuntime for PropertyRuntime {
    async fn run(&self, node: &Node, context: ActionContext) -> Result<Dispatch, CoreError> {
        let outcome = Self::outcome_for(node)?;

        let Some(delay) = node.properties.get("delay_ms").and_then(Value::as_u64) else {
            debug!(node_id = %node.id, outcome = ?outcome, "Action finished");
            return Ok(Dispatch::Completed(outcome));
        };

        debug!(node_id = %node.id, delay_ms = delay, "Action deferred");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Err(e) = context.report(outcome).await {
                warn!(node_id = %context.node_id, error = %e, "Deferred outcome was not delivered");
            }
        });
        Ok(Dispatch::Deferred)
    }
}
