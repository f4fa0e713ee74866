//! Logging setup shared by OpenFlow hosts.

use serde::Deserialize;
use tracing::info;

pub mod logging;

pub use logging::{init_logging, LogExt};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup record
    pub service_name: String,
    /// Log level filter (e.g., "info,openflow_core=debug")
    pub log_filter: String,
    /// JSON lines instead of human readable output
    pub json_logs: bool,
    /// Environment (dev, staging, prod)
    pub environment: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "openflow".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
            environment: "dev".to_string(),
        }
    }
}

impl MonitoringConfig {
    /// Config for a named service
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Builder: set the filter directives
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Builder: switch JSON output on or off
    pub fn with_json(mut self, json_logs: bool) -> Self {
        self.json_logs = json_logs;
        self
    }
}

/// Initialize logging for a host process
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    info!(environment = %config.environment, "Monitoring initialized");
    Ok(())
}
