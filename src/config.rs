//! Harness configuration.
//!
//! Paths and knobs for a whole invocation, plus the resource policy the
//! sandboxes run under. Read from environment variables with explicit
//! validation; the CLI overrides individual fields from its arguments.

use std::path::PathBuf;

use thiserror::Error;

use crate::policy::ResourcePolicy;

/// Errors that can occur while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one harness invocation.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Problem dataset file (JSON array or JSONL).
    pub dataset_path: PathBuf,
    /// Agent artifact copied into every sandbox.
    pub agent_path: PathBuf,
    /// Directory run workspaces are created under.
    pub workspace_root: PathBuf,
    /// Maximum number of runs evaluated concurrently.
    pub parallel: usize,
    /// Keep run workspaces on disk after the run finishes.
    pub keep_workspaces: bool,
    /// Limits and fixed identifiers for every sandbox.
    pub policy: ResourcePolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("./problems.jsonl"),
            agent_path: PathBuf::from("./main.py"),
            workspace_root: PathBuf::from("./workspaces"),
            parallel: 1,
            keep_workspaces: false,
            policy: ResourcePolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SWEBOX_DATASET`: problem dataset file (default: ./problems.jsonl)
    /// - `SWEBOX_AGENT`: agent artifact path (default: ./main.py)
    /// - `SWEBOX_WORKSPACE_ROOT`: workspace parent directory (default: ./workspaces)
    /// - `SWEBOX_PARALLEL`: concurrent runs (default: 1)
    /// - `SWEBOX_KEEP_WORKSPACES`: keep workspaces after runs (default: false)
    /// - `SWEBOX_SANDBOX_IMAGE`: agent container image
    /// - `SWEBOX_PROXY_IMAGE`: proxy sidecar image
    /// - `SWEBOX_NETWORK`: sandbox network name
    /// - `SWEBOX_MEMORY_MB`: memory ceiling in megabytes
    /// - `SWEBOX_TIMEOUT_SECS`: wall-clock timeout in seconds
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SWEBOX_DATASET") {
            config.dataset_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SWEBOX_AGENT") {
            config.agent_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SWEBOX_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SWEBOX_PARALLEL") {
            config.parallel = parse_env_value(&val, "SWEBOX_PARALLEL")?;
        }
        if let Ok(val) = std::env::var("SWEBOX_KEEP_WORKSPACES") {
            config.keep_workspaces = parse_env_bool(&val, "SWEBOX_KEEP_WORKSPACES")?;
        }

        if let Ok(val) = std::env::var("SWEBOX_SANDBOX_IMAGE") {
            config.policy.sandbox_image = val;
        }
        if let Ok(val) = std::env::var("SWEBOX_PROXY_IMAGE") {
            config.policy.proxy_image = val;
        }
        if let Ok(val) = std::env::var("SWEBOX_NETWORK") {
            config.policy.network_name = val;
        }
        if let Ok(val) = std::env::var("SWEBOX_MEMORY_MB") {
            let mb: i64 = parse_env_value(&val, "SWEBOX_MEMORY_MB")?;
            config.policy.memory_bytes = mb * 1024 * 1024;
        }
        if let Ok(val) = std::env::var("SWEBOX_TIMEOUT_SECS") {
            config.policy.runtime_secs = parse_env_value(&val, "SWEBOX_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel == 0 {
            return Err(ConfigError::ValidationFailed(
                "parallel must be greater than 0".to_string(),
            ));
        }
        if self.policy.sandbox_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sandbox image cannot be empty".to_string(),
            ));
        }
        if self.policy.proxy_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "proxy image cannot be empty".to_string(),
            ));
        }
        if self.policy.memory_bytes <= 0 {
            return Err(ConfigError::ValidationFailed(
                "memory ceiling must be positive".to_string(),
            ));
        }
        if self.policy.runtime_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}
