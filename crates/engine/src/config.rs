//! Simulator configuration via `lockstep.toml`
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Values are validated eagerly on load.

use crate::script::RetryPolicy;
use lockstep_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "lockstep.toml";

fn default_run_timeout_ms() -> u64 {
    5000
}

fn default_pool_timeout_ms() -> u64 {
    30_000
}

/// Simulator configuration loaded from `lockstep.toml`.
///
/// # Example
///
/// ```toml
/// run_timeout_ms = 5000
/// pool_timeout_ms = 30000
/// scenario_dir = "scenarios"
///
/// [retry]
/// max_retries = 5
/// base_delay_ms = 100
/// max_delay_ms = 1600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Run timeout for scenarios that do not set their own.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Directory of extra `*.json` scenarios, loaded after the built-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_dir: Option<PathBuf>,
    /// Checkout timeout for pools that do not set their own.
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
    /// Policy for writes that ask for `"retry": true`.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: default_run_timeout_ms(),
            scenario_dir: None,
            pool_timeout_ms: default_pool_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LockstepConfig {
    /// Run timeout as a `Duration`
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Pool checkout timeout as a `Duration`
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a zero run or pool timeout, or a retry
    /// policy whose base delay exceeds its cap.
    pub fn validate(&self) -> Result<()> {
        if self.run_timeout_ms == 0 {
            return Err(Error::config(
                "run_timeout_ms in lockstep.toml must be greater than 0",
            ));
        }
        if self.pool_timeout_ms == 0 {
            return Err(Error::config(
                "pool_timeout_ms in lockstep.toml must be greater than 0",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({}) in lockstep.toml",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# lockstep simulator configuration
#
# Run timeout in milliseconds, used by scenarios that do not set timeout_ms.
# When it elapses, unfinished connections are cancelled and keep their locks.
run_timeout_ms = 5000

# How long a checkout from a scenario's connection pool waits for a free
# connection, used by pools that do not set checkout_timeout_ms.
pool_timeout_ms = 30000

# Directory of extra scenario files (*.json), loaded after the built-ins.
# scenario_dir = "scenarios"

# Backoff for writes that ask for "retry": true.
# Delay after attempt n is base_delay_ms * 2^n, capped at max_delay_ms.
[retry]
max_retries = 5
base_delay_ms = 100
max_delay_ms = 1600
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: LockstepConfig = toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
