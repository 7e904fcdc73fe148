//! Chunked needle search over a device or image file.
//!
//! The source is read one chunk at a time. The last
//! `max(needle_len - 1, preview_before)` bytes of each working buffer are
//! carried into the next one so matches straddling a chunk boundary are
//! still seen; a match is only reported when it starts at or after
//! `offset - (needle_len - 1)`, which keeps anything already reported from
//! the previous buffer from being reported twice.

use crate::config::ScannerConfig;
use crate::core::error::ScanError;
use crate::io::read_full_at;
use crate::types::ScanHit;
use memchr::memmem::Finder;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tracing::debug;

/// Shared stop/pause flags checked by the scanner between chunk reads.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// Lazy sequence of [`ScanHit`]s in ascending offset order.
///
/// The iterator owns the source descriptor and closes it as soon as the
/// scan ends, whether by exhaustion, cancellation or a read error.
pub struct ScanHits {
    path: PathBuf,
    file: Option<File>,
    finder: Finder<'static>,
    config: ScannerConfig,
    control: ScanControl,
    overlap: usize,
    tail_size: usize,
    tail: Vec<u8>,
    chunk: Vec<u8>,
    offset: u64,
    pending: VecDeque<ScanHit>,
    scanned: Option<Arc<AtomicU64>>,
    reached_end: bool,
}

/// Starts a scan of `source` for `needle`. See [`ScanHits::open`].
pub fn iter_scan_hits(
    source: impl AsRef<Path>,
    needle: &[u8],
    config: &ScannerConfig,
    control: ScanControl,
) -> Result<ScanHits, ScanError> {
    ScanHits::open(source, needle, config, control)
}

impl ScanHits {
    /// Validates the settings, then opens `source` for reading.
    ///
    /// Nothing is opened when the needle is empty or the configuration is
    /// invalid.
    pub fn open(
        source: impl AsRef<Path>,
        needle: &[u8],
        config: &ScannerConfig,
        control: ScanControl,
    ) -> Result<Self, ScanError> {
        if needle.is_empty() {
            return Err(ScanError::InvalidConfig("needle must not be empty".into()));
        }
        config.validate()?;

        let path = source.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| ScanError::open(&path, e))?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{Advice, fadvise};
            let _ = fadvise(&file, 0, None, Advice::Sequential);
        }

        let overlap = needle.len() - 1;
        debug!(path = %path.display(), needle_len = needle.len(), chunk_size = config.chunk_size, "scan started");

        Ok(Self {
            path,
            file: Some(file),
            finder: Finder::new(needle).into_owned(),
            config: config.clone(),
            control,
            overlap,
            tail_size: overlap.max(config.preview_before),
            tail: Vec::new(),
            chunk: vec![0u8; config.chunk_size],
            offset: 0,
            pending: VecDeque::new(),
            scanned: None,
            reached_end: false,
        })
    }

    /// Mirrors the number of bytes consumed so far into `counter`.
    pub fn with_progress(mut self, counter: Arc<AtomicU64>) -> Self {
        self.scanned = Some(counter);
        self
    }

    pub fn bytes_scanned(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the whole source was read, as opposed to a stop or error.
    pub fn reached_end(&self) -> bool {
        self.reached_end
    }

    fn finish(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), bytes = self.offset, "scan finished");
        }
        self.pending.clear();
        self.tail = Vec::new();
    }

    /// Blocks while paused. Returns `false` if a stop was requested.
    fn wait_while_paused(&self) -> bool {
        while self.control.is_paused() {
            if self.control.is_stopped() {
                return false;
            }
            thread::sleep(self.config.pause_poll());
        }
        !self.control.is_stopped()
    }

    /// Reads and searches the next chunk. Returns `Ok(false)` at end of source.
    fn scan_next_chunk(&mut self) -> Result<bool, ScanError> {
        let Some(file) = self.file.as_ref() else {
            return Ok(false);
        };

        let n = read_full_at(file, &mut self.chunk, self.offset)
            .map_err(|e| ScanError::read(&self.path, self.offset, e))?;
        if n == 0 {
            return Ok(false);
        }

        let mut buffer = std::mem::take(&mut self.tail);
        buffer.extend_from_slice(&self.chunk[..n]);

        let buffer_start = self.offset - (buffer.len() - n) as u64;
        let min_new = self.offset.saturating_sub(self.overlap as u64);
        let preview_len = self.config.preview_len();

        let mut from = 0;
        while let Some(pos) = self.finder.find(&buffer[from..]) {
            let m = from + pos;
            from = m + 1;

            let absolute = buffer_start + m as u64;
            if absolute < min_new {
                continue;
            }

            let preview_offset = absolute.saturating_sub(self.config.preview_before as u64);
            let mut preview = vec![0u8; preview_len];
            let got = read_full_at(file, &mut preview, preview_offset)
                .map_err(|e| ScanError::read(&self.path, preview_offset, e))?;
            preview.truncate(got);

            self.pending.push_back(ScanHit {
                match_offset: absolute,
                preview_offset,
                preview,
            });

            if from >= buffer.len() {
                break;
            }
        }

        self.offset += n as u64;
        if let Some(counter) = &self.scanned {
            counter.store(self.offset, Ordering::Relaxed);
        }

        let keep = self.tail_size.min(buffer.len());
        buffer.drain(..buffer.len() - keep);
        self.tail = buffer;

        Ok(true)
    }
}

impl Iterator for ScanHits {
    type Item = Result<ScanHit, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.control.is_stopped() {
                self.finish();
                return None;
            }
            if let Some(hit) = self.pending.pop_front() {
                return Some(Ok(hit));
            }
            if self.file.is_none() {
                return None;
            }
            if !self.wait_while_paused() {
                self.finish();
                return None;
            }
            match self.scan_next_chunk() {
                Ok(true) => {}
                Ok(false) => {
                    self.reached_end = true;
                    self.finish();
                }
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for ScanHits {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn image_with(len: usize, needle: &[u8], offsets: &[usize]) -> NamedTempFile {
        let mut data = vec![b'.'; len];
        for &off in offsets {
            data[off..off + needle.len()].copy_from_slice(needle);
        }
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();
        temp
    }

    fn offsets(hits: ScanHits) -> Vec<u64> {
        hits.map(|h| h.unwrap().match_offset).collect()
    }

    fn small_config(chunk: usize) -> ScannerConfig {
        ScannerConfig::default()
            .with_chunk_size(chunk)
            .with_preview(16, 16, 32)
    }

    #[test]
    fn finds_needles_around_chunk_boundaries() {
        let temp = image_with(3000, b"NEEDLE", &[10, 512, 1023, 2048]);
        let hits =
            iter_scan_hits(temp.path(), b"NEEDLE", &small_config(256), ScanControl::new()).unwrap();
        assert_eq!(offsets(hits), vec![10, 512, 1023, 2048]);
    }

    #[test]
    fn needle_straddling_a_boundary_is_reported_once() {
        let needle = b"0123456789";
        let temp = image_with(256, needle, &[60]);
        let hits = iter_scan_hits(temp.path(), needle, &small_config(64), ScanControl::new()).unwrap();
        assert_eq!(offsets(hits), vec![60]);
    }

    #[test]
    fn overlapping_occurrences_are_all_reported() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"xxaaaaxx").unwrap();
        temp.flush().unwrap();

        let hits = iter_scan_hits(temp.path(), b"aa", &small_config(3), ScanControl::new()).unwrap();
        assert_eq!(offsets(hits), vec![2, 3, 4]);
    }

    #[test]
    fn previews_are_bounded_and_contain_the_needle() {
        let temp = image_with(4096, b"NEEDLE", &[0, 300, 1500, 4090]);
        let config = ScannerConfig::default()
            .with_chunk_size(128)
            .with_preview(400, 400, 512);

        for hit in iter_scan_hits(temp.path(), b"NEEDLE", &config, ScanControl::new()).unwrap() {
            let hit = hit.unwrap();
            assert!(hit.preview.len() <= 512);
            let idx = hit.match_index().unwrap();
            assert_eq!(&hit.preview[idx..idx + 6], b"NEEDLE");
        }
    }

    #[test]
    fn stop_ends_the_sequence_promptly() {
        let offsets_in: Vec<usize> = (0..50).map(|i| i * 40).collect();
        let temp = image_with(2100, b"HIT", &offsets_in);
        let control = ScanControl::new();
        let mut hits =
            iter_scan_hits(temp.path(), b"HIT", &small_config(256), control.clone()).unwrap();

        assert!(hits.next().unwrap().is_ok());
        control.stop();
        assert!(hits.count() <= 1);
    }

    #[test]
    fn stop_during_pause_is_honoured() {
        let temp = image_with(1024, b"HIT", &[100]);
        let control = ScanControl::new();
        control.pause();
        let mut hits =
            iter_scan_hits(temp.path(), b"HIT", &small_config(256), control.clone()).unwrap();

        let stopper = {
            let control = control.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                control.stop();
            })
        };
        assert!(hits.next().is_none());
        stopper.join().unwrap();
    }

    #[test]
    fn resume_continues_without_losing_hits() {
        let temp = image_with(2048, b"HIT", &[5, 700, 1900]);
        let control = ScanControl::new();
        control.pause();
        let hits = iter_scan_hits(temp.path(), b"HIT", &small_config(256), control.clone()).unwrap();

        let resumer = {
            let control = control.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(80));
                control.resume();
            })
        };
        assert_eq!(offsets(hits), vec![5, 700, 1900]);
        resumer.join().unwrap();
    }

    #[test]
    fn invalid_settings_fail_before_opening() {
        let missing = "/nonexistent/relic/image.bin";
        let err = iter_scan_hits(missing, b"", &ScannerConfig::default(), ScanControl::new())
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::InvalidConfig(_)));

        let cfg = ScannerConfig::default().with_chunk_size(0);
        let err = iter_scan_hits(missing, b"x", &cfg, ScanControl::new()).err().unwrap();
        assert!(matches!(err, ScanError::InvalidConfig(_)));

        let err = iter_scan_hits(missing, b"x", &ScannerConfig::default(), ScanControl::new())
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::Open { .. }));
    }

    #[test]
    fn progress_counter_tracks_consumed_bytes() {
        let temp = image_with(1000, b"HIT", &[]);
        let counter = Arc::new(AtomicU64::new(0));
        let hits = iter_scan_hits(temp.path(), b"HIT", &small_config(256), ScanControl::new())
            .unwrap()
            .with_progress(Arc::clone(&counter));
        let mut hits = hits;
        assert!(hits.next().is_none());
        assert!(hits.reached_end());
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }
}
