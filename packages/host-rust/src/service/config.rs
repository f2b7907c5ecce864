//! Host configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Host-level configuration for service groups and their queues.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    /// Per-group queue bound. `None` means unbounded. Producers block while a
    /// bounded queue is full.
    pub queue_capacity: Option<usize>,
    /// Maximum envelopes one `ServiceHost::pump` call dispatches. `None` means
    /// everything that was queued when the pump started.
    pub main_pump_budget: Option<usize>,
    /// Envelopes pre-allocated in each group's pool.
    pub pool_prewarm: usize,
    /// Worker threads are named `<prefix>-<group name or id>`.
    pub thread_name_prefix: String,
    /// Optional stack size in bytes for worker threads.
    pub worker_stack_size: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            main_pump_budget: None,
            pool_prewarm: 0,
            thread_name_prefix: "svc-group".to_string(),
            worker_stack_size: None,
        }
    }
}

impl HostConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidConfig` on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: HostConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// # Errors
    ///
    /// Rejects zero-sized queue bounds and zero pump budgets, which would
    /// block every producer or starve the main group.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "queueCapacity must be greater than zero".to_string(),
            ));
        }
        if self.main_pump_budget == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mainPumpBudget must be greater than zero".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "threadNamePrefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
