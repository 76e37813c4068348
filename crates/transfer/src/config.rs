//! Tunable transfer configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! { "queue_capacity": 8, "controller": { "max_parallelism": 16 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TransferError;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// AIMD parameters for [`AdaptiveTransferController`](crate::AdaptiveTransferController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub initial_chunk_size: usize,
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub initial_parallelism: usize,
    /// Chunk size multiplier applied after a fast success window.
    pub growth_factor: f64,
    /// Chunk size divisor applied on a congestion failure.
    pub backoff_divisor: f64,
    /// A slice finishing within this latency counts as "fast".
    pub target_latency_ms: u64,
    /// Consecutive successes required before probing upward.
    pub success_window: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 256 * KIB,
            max_chunk_size: 32 * MIB,
            initial_chunk_size: MIB,
            min_parallelism: 1,
            max_parallelism: 8,
            initial_parallelism: 2,
            growth_factor: 2.0,
            backoff_divisor: 2.0,
            target_latency_ms: 2_000,
            success_window: 3,
        }
    }
}

impl ControllerConfig {
    /// Pins chunk size and parallelism; feedback can no longer move them.
    pub fn fixed(chunk_size: usize, parallelism: usize) -> Self {
        Self {
            min_chunk_size: chunk_size,
            max_chunk_size: chunk_size,
            initial_chunk_size: chunk_size,
            min_parallelism: parallelism,
            max_parallelism: parallelism,
            initial_parallelism: parallelism,
            ..Self::default()
        }
    }

    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.min_chunk_size == 0 {
            return Err(TransferError::Config("min_chunk_size must be > 0".into()));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(TransferError::Config(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.min_parallelism == 0 {
            return Err(TransferError::Config("min_parallelism must be > 0".into()));
        }
        if self.min_parallelism > self.max_parallelism {
            return Err(TransferError::Config(format!(
                "min_parallelism {} exceeds max_parallelism {}",
                self.min_parallelism, self.max_parallelism
            )));
        }
        if self.growth_factor <= 1.0 || self.backoff_divisor <= 1.0 {
            return Err(TransferError::Config(
                "growth_factor and backoff_divisor must be > 1".into(),
            ));
        }
        if self.target_latency_ms == 0 {
            return Err(TransferError::Config("target_latency_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub controller: ControllerConfig,
    /// Capacity of the bounded upload hand-off queue.
    pub queue_capacity: usize,
    /// How often the parallelism manager re-evaluates the pool size.
    pub supervisor_tick_ms: u64,
    /// How often progress is sampled and published.
    pub progress_interval_ms: u64,
    /// Download parts fetched ahead of the merge cursor.
    pub prefetch_depth: usize,
    /// Per-request timeout of the HTTP object transport.
    pub request_timeout_ms: u64,
    /// Directory for download temp artifacts (system temp dir if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            queue_capacity: 4,
            supervisor_tick_ms: 50,
            progress_interval_ms: 500,
            prefetch_depth: 4,
            request_timeout_ms: 120_000,
            temp_dir: None,
        }
    }
}

impl TransferConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Parses and validates a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        self.controller.validate()?;
        if self.queue_capacity == 0 {
            return Err(TransferError::Config("queue_capacity must be > 0".into()));
        }
        if self.supervisor_tick_ms == 0 || self.progress_interval_ms == 0 {
            return Err(TransferError::Config("intervals must be > 0".into()));
        }
        Ok(())
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Directory where download temp artifacts are created.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
