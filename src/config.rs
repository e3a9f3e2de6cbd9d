//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path:?}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Type string under which raw block bytes appear in module inputs.
    pub block_type: String,
    /// Store snapshots are written on multiples of this interval.
    pub store_snapshot_interval: u64,
    /// Output-cache segments span this many blocks.
    pub output_cache_save_interval: u64,
    /// Preferred size of one backfill sub-request.
    pub subrequest_range_size: u64,
    /// Hard ceiling on a single sub-request's range.
    pub max_subrequest_range_size: u64,
    /// Ceiling on how far one synchronization pass will backfill.
    pub max_store_sync_range: u64,
    /// Parallel backfill workers.
    pub worker_count: usize,
    /// Per-module, per-block log byte cap before truncation.
    pub max_module_log_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_type: "blockflow.test.Block".to_string(),
            store_snapshot_interval: 1_000,
            output_cache_save_interval: 100,
            subrequest_range_size: 1_000,
            max_subrequest_range_size: 10_000,
            max_store_sync_range: u64::MAX,
            worker_count: 4,
            max_module_log_bytes: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
        }
    }
}
