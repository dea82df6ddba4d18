//! Engine configuration
//!
//! `EngineConfig` is a plain struct with serde derives so the host's own
//! configuration loader (an external collaborator) can populate it from
//! any format. Fields are public; `with_*` builders exist for in-code
//! construction; `validate()` enforces the documented minimums.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default Markov order (prefix token count).
pub const DEFAULT_STATE_SIZE: usize = 2;
/// Default training batch granularity.
pub const DEFAULT_BATCH_SIZE: usize = 2000;
/// Default worker count.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
/// Default registry LRU ceiling: 128 MiB.
pub const DEFAULT_CHAIN_CACHE_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;
/// Default snapshot debounce in milliseconds.
pub const DEFAULT_CHAIN_SAVE_DEBOUNCE_MS: u64 = 5000;
/// Default batcher soft memory ceiling: 1 GiB.
pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 1024 * 1024 * 1024;
/// Default pool shutdown grace in milliseconds.
pub const DEFAULT_GRACEFUL_SHUTDOWN_MS: u64 = 5000;

fn default_state_size() -> usize {
    DEFAULT_STATE_SIZE
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}
fn default_chain_cache_memory_limit() -> u64 {
    DEFAULT_CHAIN_CACHE_MEMORY_LIMIT
}
fn default_chain_save_debounce_ms() -> u64 {
    DEFAULT_CHAIN_SAVE_DEBOUNCE_MS
}
fn default_memory_ceiling_bytes() -> u64 {
    DEFAULT_MEMORY_CEILING_BYTES
}
fn default_graceful_shutdown_ms() -> u64 {
    DEFAULT_GRACEFUL_SHUTDOWN_MS
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

/// Configuration for the chain engine.
///
/// # Example
///
/// ```
/// use markgen_core::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_state_size(3)
///     .with_worker_pool_size(2);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix order. Per tenant, immutable after the first snapshot: a
    /// snapshot's recorded value wins on load.
    #[serde(default = "default_state_size")]
    pub state_size: usize,
    /// Training batch granularity (>= 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Worker count (>= 1).
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Registry LRU ceiling in bytes.
    #[serde(default = "default_chain_cache_memory_limit")]
    pub chain_cache_memory_limit: u64,
    /// Snapshot debounce in milliseconds (>= 1000).
    #[serde(default = "default_chain_save_debounce_ms")]
    pub chain_save_debounce_ms: u64,
    /// Batcher soft memory ceiling in bytes.
    #[serde(default = "default_memory_ceiling_bytes")]
    pub memory_ceiling_bytes: u64,
    /// Pool shutdown grace in milliseconds.
    #[serde(default = "default_graceful_shutdown_ms")]
    pub graceful_shutdown_ms: u64,
    /// Directory holding per-tenant snapshot files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding advisory training lock files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Optional end-of-line sentinel token terminating generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            state_size: default_state_size(),
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
            chain_cache_memory_limit: default_chain_cache_memory_limit(),
            chain_save_debounce_ms: default_chain_save_debounce_ms(),
            memory_ceiling_bytes: default_memory_ceiling_bytes(),
            graceful_shutdown_ms: default_graceful_shutdown_ms(),
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            eol_token: None,
        }
    }
}

impl EngineConfig {
    /// Config for tests: caller-supplied temp directories, one worker
    /// extra of parallelism, and the minimum legal debounce so on-disk
    /// tests stay fast.
    pub fn for_testing(data_dir: &Path, config_dir: &Path) -> Self {
        EngineConfig {
            batch_size: 100,
            worker_pool_size: 2,
            chain_save_debounce_ms: 1000,
            data_dir: data_dir.to_path_buf(),
            config_dir: config_dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the prefix order.
    pub fn with_state_size(mut self, state_size: usize) -> Self {
        self.state_size = state_size;
        self
    }

    /// Set the training batch granularity.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the worker count.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the registry LRU ceiling in bytes.
    pub fn with_chain_cache_memory_limit(mut self, bytes: u64) -> Self {
        self.chain_cache_memory_limit = bytes;
        self
    }

    /// Set the snapshot debounce in milliseconds.
    pub fn with_chain_save_debounce_ms(mut self, ms: u64) -> Self {
        self.chain_save_debounce_ms = ms;
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the lock-file directory.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    /// Set the end-of-line sentinel token.
    pub fn with_eol_token(mut self, token: impl Into<String>) -> Self {
        self.eol_token = Some(token.into());
        self
    }

    /// Validate the documented minimums.
    pub fn validate(&self) -> Result<()> {
        if self.state_size < 1 {
            return Err(Error::invalid_input("state_size must be >= 1"));
        }
        if self.batch_size < 100 {
            return Err(Error::invalid_input("batch_size must be >= 100"));
        }
        if self.worker_pool_size < 1 {
            return Err(Error::invalid_input("worker_pool_size must be >= 1"));
        }
        if self.chain_save_debounce_ms < 1000 {
            return Err(Error::invalid_input(
                "chain_save_debounce_ms must be >= 1000",
            ));
        }
        Ok(())
    }
}
