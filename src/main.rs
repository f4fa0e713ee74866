//! Headless OpenFlow host
//!
//! `openflow <definition.json> [name=value ...]` opens the definition in
//! the mode given by the configuration and prints the result as JSON:
//! design modes validate and save it, view mode prints it and instantiate
//! mode runs it to completion with node outcomes taken from properties.

mod runtime;

use anyhow::{Context, Result};
use openflow_core::{
    domain::repository::memory::{MemoryFlowDefinitionRepository, MemoryFlowInstanceRepository},
    EditorSession, EngineConfig, FlowExecutionService, FlowGraph, Mode, NodeTypeRegistry,
    SessionContext,
};
use openflow_monitoring::{LogExt, MonitoringConfig};
use runtime::PropertyRuntime;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;

    let monitoring_config = MonitoringConfig::for_service("openflow")
        .with_filter(config.log_filter.clone())
        .with_json(config.json_logs);
    openflow_monitoring::init(&monitoring_config).context("Failed to initialize logging")?;

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .context("Usage: openflow <definition.json> [name=value ...]")?;
    let parameters = parse_parameters(args)?;

    let graph = load_definition(Path::new(&path))?;
    let output = run(&config, graph, parameters)
        .await
        .log_err("Run failed")?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Read a flow definition from a JSON file
fn load_definition(path: &Path) -> Result<FlowGraph> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse flow definition {}", path.display()))
}

/// `name=value` pairs; values are JSON when they parse, plain strings otherwise
fn parse_parameters(args: impl Iterator<Item = String>) -> Result<BTreeMap<String, Value>> {
    args.map(|arg| {
        let (name, raw) = arg
            .split_once('=')
            .with_context(|| format!("Parameter '{}' is not name=value", arg))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok((name.to_string(), value))
    })
    .collect()
}

/// Act on the definition as the configured mode allows
async fn run(
    config: &EngineConfig,
    graph: FlowGraph,
    parameters: BTreeMap<String, Value>,
) -> Result<Value> {
    let context = config.session_context()?;
    let registry = Arc::new(NodeTypeRegistry::with_builtin_shapes());
    info!(mode = ?context.mode(), user = %context.user(), flow_id = %graph.id, "Session started");

    match context.mode() {
        Mode::Design | Mode::ComponentDev => edit(context, registry, graph).await,
        Mode::View => {
            let session = EditorSession::new(context, registry, graph);
            Ok(json!({
                "graph": session.snapshot(),
                "violations": session.validate(),
            }))
        }
        Mode::Instantiate => execute(config, context, registry, graph, parameters).await,
    }
}

async fn edit(
    context: SessionContext,
    registry: Arc<NodeTypeRegistry>,
    graph: FlowGraph,
) -> Result<Value> {
    let repo = MemoryFlowDefinitionRepository::new();
    let session = EditorSession::new(context, registry, graph);
    let violations = session.validate();
    let version = session.save(&repo).await.context("Failed to save definition")?;
    Ok(json!({
        "flow_id": session.graph().id,
        "version": version,
        "revision": session.revision(),
        "violations": violations,
    }))
}

async fn execute(
    config: &EngineConfig,
    context: SessionContext,
    registry: Arc<NodeTypeRegistry>,
    graph: FlowGraph,
    parameters: BTreeMap<String, Value>,
) -> Result<Value> {
    let (service, mut receiver) = FlowExecutionService::new(
        Arc::new(MemoryFlowDefinitionRepository::new()),
        Arc::new(MemoryFlowInstanceRepository::new()),
        Arc::new(PropertyRuntime),
        registry,
        context,
        config,
    );

    let instance_id = service
        .instantiate_graph(graph, parameters)
        .await
        .context("Failed to instantiate flow")?;
    let status = service.run_until_sealed(&instance_id, &mut receiver).await?;
    let instance = service.instance(&instance_id).await?;

    Ok(json!({
        "instance_id": instance_id,
        "status": status,
        "nodes": instance.node_states(),
        "failures": instance
            .node_failures()
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>(),
    }))
}
