//! Validation of raw scan hits.
//!
//! Multi-line searches are scanned for their first line only, so a raw hit
//! says nothing about the remaining lines. A hit is kept when every line of
//! the search string occurs inside the validation block holding the match
//! plus the block after it. The validation block is `block_size *
//! block_factor` bytes; text spread over more than two such blocks is
//! rejected.

use crate::config::SearchConfig;
use crate::core::device::get_device_info;
use crate::core::error::ValidationError;
use crate::io::read_block_available;
use crate::types::{ScanHit, SearchResult};
use crossbeam_channel::Receiver;
use memchr::memmem::Finder;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Immutable description of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub partition: PathBuf,
    pub search_string: String,
    pub block_size: u64,
    pub searched_lines: Vec<String>,
    pub is_multi_line: bool,
}

impl SearchParams {
    pub fn new(
        partition: impl Into<PathBuf>,
        search_string: impl Into<String>,
        block_size: u64,
    ) -> Result<Self, ValidationError> {
        let search_string = search_string.into();
        if block_size == 0 {
            return Err(ValidationError::InvalidParams(
                "block size must be positive".into(),
            ));
        }

        let searched_lines: Vec<String> = search_string.lines().map(str::to_owned).collect();
        match searched_lines.first() {
            Some(first) if !first.is_empty() => {}
            _ => {
                return Err(ValidationError::InvalidParams(
                    "the first line of the search string must not be empty".into(),
                ));
            }
        }

        Ok(Self {
            partition: partition.into(),
            is_multi_line: searched_lines.len() > 1,
            searched_lines,
            search_string,
            block_size,
        })
    }

    /// Builds parameters for `partition`, taking the block size from the
    /// device's logical sector size unless the config overrides it.
    pub fn for_device(
        partition: impl Into<PathBuf>,
        search_string: impl Into<String>,
        config: &SearchConfig,
    ) -> Result<Self, ValidationError> {
        let partition = partition.into();
        let block_size = match config.block_size_override {
            Some(size) => size,
            None => u64::from(get_device_info(&partition)?.logical_sector_size),
        };
        Self::new(partition, search_string, block_size)
    }

    /// Bytes handed to the scanner: the first searched line.
    pub fn needle(&self) -> &[u8] {
        self.searched_lines
            .first()
            .map(String::as_bytes)
            .unwrap_or_default()
    }
}

pub struct ResultValidator {
    params: SearchParams,
    validation_block: u64,
    drift_probe_limit: usize,
    line_finders: Vec<Finder<'static>>,
}

impl ResultValidator {
    pub fn new(params: SearchParams, config: &SearchConfig) -> Result<Self, ValidationError> {
        if config.block_factor == 0 {
            return Err(ValidationError::InvalidParams(
                "block factor must be positive".into(),
            ));
        }
        let validation_block = params
            .block_size
            .checked_mul(config.block_factor)
            .ok_or_else(|| ValidationError::InvalidParams("validation block overflows".into()))?;
        let line_finders = params
            .searched_lines
            .iter()
            .map(|line| Finder::new(line.as_bytes()).into_owned())
            .collect();

        Ok(Self {
            params,
            validation_block,
            drift_probe_limit: config.drift_probe_limit,
            line_finders,
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// Returns the validated result for `hit`, or `None` for a false positive.
    pub fn validate(&self, hit: &ScanHit) -> Result<Option<SearchResult>, ValidationError> {
        if self.params.is_multi_line && !self.all_lines_nearby(hit.match_offset)? {
            debug!(offset = hit.match_offset, "rejected multi-line false positive");
            return Ok(None);
        }

        Ok(Some(SearchResult {
            offset: hit.match_offset,
            block_index: self.fix_block_number(hit.match_offset)?,
            line: matched_line(hit),
        }))
    }

    /// Drains `raw_hits` until every sender is gone, keeping accepted hits
    /// in arrival order.
    pub fn filter(&self, raw_hits: &Receiver<ScanHit>) -> Result<Vec<SearchResult>, ValidationError> {
        let mut accepted = Vec::new();
        for hit in raw_hits {
            if let Some(result) = self.validate(&hit)? {
                accepted.push(result);
            }
        }
        Ok(accepted)
    }

    /// Finds the block (in units of `block_size`) that really holds the
    /// first searched line, probing forward from `offset / block_size`.
    /// Falls back to that starting index when no probe matches.
    pub fn fix_block_number(&self, offset: u64) -> Result<u64, ValidationError> {
        let block_size = self.params.block_size;
        let start = offset / block_size;
        let Some(first_line) = self.line_finders.first() else {
            return Ok(start);
        };

        for candidate in (start..).take(self.drift_probe_limit) {
            let block = read_block_available(self.source(), block_size, candidate)?;
            if block.is_empty() {
                break;
            }
            if first_line.find(&block).is_some() {
                return Ok(candidate);
            }
        }
        Ok(start)
    }

    fn all_lines_nearby(&self, offset: u64) -> Result<bool, ValidationError> {
        let index = offset / self.validation_block;
        let mut window = read_block_available(self.source(), self.validation_block, index)?;
        window.extend(read_block_available(
            self.source(),
            self.validation_block,
            index + 1,
        )?);

        Ok(self
            .line_finders
            .iter()
            .all(|finder| finder.find(&window).is_some()))
    }

    fn source(&self) -> &Path {
        &self.params.partition
    }
}

/// The preview line containing the match, with control bytes masked.
pub fn matched_line(hit: &ScanHit) -> String {
    let preview = &hit.preview;
    let at = hit.match_index().unwrap_or(0).min(preview.len());

    let start = memchr::memrchr(b'\n', &preview[..at]).map_or(0, |i| i + 1);
    let end = memchr::memchr(b'\n', &preview[at..]).map_or(preview.len(), |i| at + i);

    printable(&preview[start..end])
}

/// Lossy UTF-8 decoding with control characters other than tab shown as `.`.
pub fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .chars()
        .map(|c| if c.is_control() && c != '\t' { '.' } else { c })
        .collect()
}
