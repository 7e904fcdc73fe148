//! Persisting blocks, byte ranges and validated results.

use crate::core::error::{DeviceIoError, SaveError};
use crate::io::{DEFAULT_READ_CHUNK, extract_range};
use crate::types::{SavedRange, SearchResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Destination for evidence pulled off a device.
///
/// Implementations are shared between the search loop and the UI, so the
/// counters are read through `&self`.
pub trait ResultSaver: Send + Sync {
    /// Copies `length` bytes at `offset` of `source` into the output.
    fn save_range(
        &self,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<SavedRange, SaveError>;

    /// Copies block `block_index`. A block cut short by the end of the
    /// source is saved with the bytes that exist.
    fn save_block(
        &self,
        source: &Path,
        block_size: u64,
        block_index: u64,
    ) -> Result<SavedRange, SaveError>;

    /// Writes a short text record describing `result`.
    fn save_result_text(&self, result: &SearchResult) -> Result<PathBuf, SaveError>;

    fn output_dir(&self) -> &Path;

    fn files_written(&self) -> usize;

    fn bytes_written(&self) -> u64;
}

pub struct LocalResultSaver {
    output_dir: PathBuf,
    files_written: AtomicUsize,
    bytes_written: AtomicU64,
}

impl LocalResultSaver {
    /// Creates `output_dir` (and parents) if it does not exist yet.
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self, SaveError> {
        let output_dir = output_dir.as_ref();
        if !output_dir.exists() {
            fs::create_dir_all(output_dir).map_err(|e| SaveError::from_io(output_dir, e))?;
        }

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            files_written: AtomicUsize::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    fn record(&self, path: PathBuf, bytes: u64) -> Result<SavedRange, SaveError> {
        let sha256 = sha256_file(&path).map_err(|e| SaveError::from_io(&path, e))?;
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        debug!(path = %path.display(), bytes, sha256 = %sha256, "saved");
        Ok(SavedRange {
            path,
            bytes,
            sha256,
        })
    }
}

impl ResultSaver for LocalResultSaver {
    fn save_range(
        &self,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<SavedRange, SaveError> {
        let path = self
            .output_dir
            .join(format!("range_{offset}_{length}.bin"));
        let bytes = extract_range(source, offset, length, &path, DEFAULT_READ_CHUNK)?;
        self.record(path, bytes)
    }

    fn save_block(
        &self,
        source: &Path,
        block_size: u64,
        block_index: u64,
    ) -> Result<SavedRange, SaveError> {
        if block_size == 0 {
            return Err(DeviceIoError::invalid("block_size must be positive").into());
        }
        let offset = block_index.checked_mul(block_size).ok_or_else(|| {
            DeviceIoError::invalid(format!("block {block_index} is out of range"))
        })?;
        let path = self.output_dir.join(format!("block_{block_index}.bin"));

        let bytes = match extract_range(source, offset, block_size, &path, DEFAULT_READ_CHUNK) {
            Ok(bytes) => bytes,
            Err(DeviceIoError::RangeExhausted { available, .. }) if available > 0 => {
                warn!(block = block_index, available, "saved truncated final block");
                available
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
        };
        self.record(path, bytes)
    }

    fn save_result_text(&self, result: &SearchResult) -> Result<PathBuf, SaveError> {
        let path = self.output_dir.join(format!("result_{}.txt", result.offset));
        let text = format!(
            "offset: {}\nblock: {}\nline: {}\n",
            result.offset, result.block_index, result.line
        );

        let mut file = File::create(&path).map_err(|e| SaveError::from_io(&path, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| SaveError::from_io(&path, e))?;

        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(text.len() as u64, Ordering::Relaxed);
        Ok(path)
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn files_written(&self) -> usize {
        self.files_written.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
