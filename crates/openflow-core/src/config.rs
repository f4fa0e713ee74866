//! Configuration for the OpenFlow engine
//!
//! Values come from an optional YAML file named by `OPENFLOW_CONFIG`,
//! then from `OPENFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::domain::execution_plan::DEFAULT_MAX_LOOP_ITERATIONS;
use crate::domain::mode::SessionContext;
use crate::error::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Mode flag supplied by the hosting surface
    #[serde(default)]
    pub mode: i64,

    /// Acting user recorded in the change log
    #[serde(default = "default_user")]
    pub user: String,

    /// Cap on iterations per loop node
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Buffer size of the deferred outcome channel
    #[serde(default = "default_report_channel_capacity")]
    pub report_channel_capacity: usize,

    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_max_loop_iterations() -> u32 {
    DEFAULT_MAX_LOOP_ITERATIONS
}

fn default_report_channel_capacity() -> usize {
    64
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: 0,
            user: default_user(),
            max_loop_iterations: default_max_loop_iterations(),
            report_channel_capacity: default_report_channel_capacity(),
            log_filter: default_log_filter(),
            json_logs: false,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the optional config file and environment variables
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("OPENFLOW_CONFIG") {
            Ok(path) => {
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    CoreError::ConfigurationError(format!("Cannot read {}: {}", path, e))
                })?;
                info!(path = %path, "Loaded configuration file");
                serde_yaml::from_str(&contents)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(mode) = env::var("OPENFLOW_MODE") {
            if let Ok(mode) = mode.parse::<i64>() {
                config.mode = mode;
            } else {
                warn!("Invalid OPENFLOW_MODE value: {}", mode);
            }
        }

        if let Ok(user) = env::var("OPENFLOW_USER") {
            config.user = user;
        }

        if let Ok(max) = env::var("OPENFLOW_MAX_LOOP_ITERATIONS") {
            if let Ok(max) = max.parse::<u32>() {
                config.max_loop_iterations = max;
            } else {
                warn!("Invalid OPENFLOW_MAX_LOOP_ITERATIONS value: {}", max);
            }
        }

        if let Ok(capacity) = env::var("OPENFLOW_REPORT_CHANNEL_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                config.report_channel_capacity = capacity;
            } else {
                warn!("Invalid OPENFLOW_REPORT_CHANNEL_CAPACITY value: {}", capacity);
            }
        }

        if let Ok(filter) = env::var("OPENFLOW_LOG_FILTER") {
            config.log_filter = filter;
        }

        if let Ok(json_logs) = env::var("OPENFLOW_JSON_LOGS") {
            config.json_logs = json_logs.to_lowercase() == "true" || json_logs == "1";
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_loop_iterations == 0 {
            return Err(CoreError::ConfigurationError(
                "max_loop_iterations must be at least 1".to_string(),
            ));
        }
        if self.report_channel_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "report_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Start a session with the configured mode flag and user
    pub fn session_context(&self) -> Result<SessionContext, CoreError> {
        Ok(SessionContext::start(self.mode, self.user.clone())?)
    }
}
