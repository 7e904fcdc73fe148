//! Scan and search settings.
//!
//! Both structs deserialize from JSON with every field optional, so a
//! config file only needs to name what it changes.

use crate::core::error::ScanError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_PREVIEW_BEFORE: usize = 256;
pub const DEFAULT_PREVIEW_AFTER: usize = 256;
pub const DEFAULT_MAX_PREVIEW_LEN: usize = 512;
pub const DEFAULT_BLOCK_FACTOR: u64 = 8;
pub const DEFAULT_DRIFT_PROBE_LIMIT: usize = 10;
pub const DEFAULT_RAW_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_PAUSE_POLL_MS: u64 = 50;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Options for the streaming scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Bytes read from the source per iteration
    pub chunk_size: usize,
    /// Context captured before each match
    pub preview_before: usize,
    /// Context captured after each match
    pub preview_after: usize,
    /// Hard cap on preview length
    pub max_preview_len: usize,
    /// How often a paused scan re-checks its control flags
    pub pause_poll_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            preview_before: DEFAULT_PREVIEW_BEFORE,
            preview_after: DEFAULT_PREVIEW_AFTER,
            max_preview_len: DEFAULT_MAX_PREVIEW_LEN,
            pause_poll_ms: DEFAULT_PAUSE_POLL_MS,
        }
    }
}

impl ScannerConfig {
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_preview(mut self, before: usize, after: usize, max_len: usize) -> Self {
        self.preview_before = before;
        self.preview_after = after;
        self.max_preview_len = max_len;
        self
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.max_preview_len == 0 {
            return Err(ScanError::InvalidConfig(
                "max_preview_len must be positive".into(),
            ));
        }
        if self.pause_poll_ms == 0 {
            return Err(ScanError::InvalidConfig("pause_poll_ms must be positive".into()));
        }
        Ok(())
    }

    /// Number of bytes captured for each preview.
    pub fn preview_len(&self) -> usize {
        self.max_preview_len
            .min(self.preview_before.saturating_add(self.preview_after))
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

/// Options for a whole search: scanning, validation and the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub scanner: ScannerConfig,
    /// Overrides the logical sector size reported by the device
    pub block_size_override: Option<u64>,
    /// Multiplier applied to the block size for multi-line validation
    pub block_factor: u64,
    /// Number of consecutive blocks probed by drift correction
    pub drift_probe_limit: usize,
    pub raw_queue_capacity: usize,
    pub progress_interval_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            block_size_override: None,
            block_factor: DEFAULT_BLOCK_FACTOR,
            drift_probe_limit: DEFAULT_DRIFT_PROBE_LIMIT,
            raw_queue_capacity: DEFAULT_RAW_QUEUE_CAPACITY,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl SearchConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text).context("Failed to parse search config")?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn with_scanner(mut self, scanner: ScannerConfig) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size_override = Some(block_size);
        self
    }

    pub fn with_block_factor(mut self, factor: u64) -> Self {
        self.block_factor = factor;
        self
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}
