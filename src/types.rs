use humansize::{BINARY, format_size};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type Offset = u64;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Disk,
    Partition,
    Lvm,
    Loop,
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Disk => write!(f, "disk"),
            DeviceType::Partition => write!(f, "partition"),
            DeviceType::Lvm => write!(f, "lvm"),
            DeviceType::Loop => write!(f, "loop"),
            DeviceType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A block device or partition as seen by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub device_path: String,
    pub fs_type: String,
    pub is_mounted: bool,
    pub mount_point: Option<String>,
    pub size_bytes: u64,
    pub device_type: DeviceType,
}

impl Partition {
    pub fn size_human(&self) -> String {
        format_size(self.size_bytes, BINARY)
    }

    pub fn display(&self) -> String {
        match &self.mount_point {
            Some(mp) => format!(
                "{} ({}, {}) - {} on {}",
                self.device_path,
                self.device_type,
                self.fs_type,
                self.size_human(),
                mp
            ),
            None => format!(
                "{} ({}, {}) - {}",
                self.device_path,
                self.device_type,
                self.fs_type,
                self.size_human()
            ),
        }
    }
}

/// Geometry of a device or image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub size_bytes: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub read_only: bool,
    pub is_block_device: bool,
}

impl DeviceInfo {
    pub fn sector_count(&self) -> u64 {
        self.size_bytes / u64::from(self.logical_sector_size.max(1))
    }
}

/// A raw pattern occurrence produced by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub match_offset: Offset,
    pub preview_offset: Offset,
    pub preview: Vec<u8>,
}

impl ScanHit {
    /// Position of the match inside `preview`, if the preview reaches it.
    pub fn match_index(&self) -> Option<usize> {
        let idx = usize::try_from(self.match_offset.checked_sub(self.preview_offset)?).ok()?;
        (idx <= self.preview.len()).then_some(idx)
    }
}

/// A hit that passed validation, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub offset: Offset,
    pub block_index: u64,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl SearchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SearchState::Completed | SearchState::Cancelled | SearchState::Failed
        )
    }
}

impl std::fmt::Display for SearchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SearchState::Idle => "idle",
            SearchState::Running => "running",
            SearchState::Paused => "paused",
            SearchState::Completed => "completed",
            SearchState::Cancelled => "cancelled",
            SearchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a search, cheap to clone and poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProgress {
    pub state: SearchState,
    pub result_count: usize,
    pub progress_percent: f64,
    pub bytes_scanned: u64,
    pub total_bytes: u64,
    pub error_message: Option<String>,
}

impl Default for SearchProgress {
    fn default() -> Self {
        Self {
            state: SearchState::Idle,
            result_count: 0,
            progress_percent: 0.0,
            bytes_scanned: 0,
            total_bytes: 0,
            error_message: None,
        }
    }
}

/// Where a saved block or range ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedRange {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}
