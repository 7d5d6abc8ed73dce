//! Engine configuration
//!
//! Plain serde struct; every field has a default so partial JSON files
//! are accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tolerance used when comparing float parameters for change detection
pub const DEFAULT_FLOAT_EPSILON: f64 = 1e-6;

/// Configuration shared by operators and schedulers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Prefix for background worker thread names
    pub thread_name_prefix: String,
    /// Float parameters closer than this are considered unchanged
    pub float_epsilon: f64,
    /// Log derivation failures at warn level (debug otherwise)
    pub verbose_failures: bool,
    /// Warn when a background run takes longer than this
    pub slow_run_warn_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "op-worker".to_string(),
            float_epsilon: DEFAULT_FLOAT_EPSILON,
            verbose_failures: true,
            slow_run_warn_ms: None,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_float_epsilon(mut self, epsilon: f64) -> Self {
        self.float_epsilon = epsilon.abs();
        self
    }

    pub fn with_verbose_failures(mut self, verbose: bool) -> Self {
        self.verbose_failures = verbose;
        self
    }

    pub fn with_slow_run_warning(mut self, millis: u64) -> Self {
        self.slow_run_warn_ms = Some(millis);
        self
    }
}
