//! The search pipeline.
//!
//! Three threads per search: the scanner reads the source and pushes raw
//! hits into a bounded channel, the validator drains it and forwards
//! accepted results into an unbounded channel the consumer polls, and the
//! monitor publishes [`SearchProgress`] snapshots until the validator hangs
//! up. Errors never travel through the result channel; they end the search
//! in [`SearchState::Failed`] with a user-facing message in the snapshot.

use crate::config::SearchConfig;
use crate::core::device::get_device_info;
use crate::core::error::{EngineError, ScanError};
use crate::scanner::{ScanControl, ScanHits};
use crate::types::{ScanHit, SearchProgress, SearchResult, SearchState};
use crate::validation::{ResultValidator, SearchParams};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Counters and flags shared by the worker threads of one search.
#[derive(Default)]
struct Shared {
    bytes_scanned: Arc<AtomicU64>,
    result_count: AtomicUsize,
    scan_reached_end: AtomicBool,
    validator_drained: AtomicBool,
    error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, message: String) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
    }
}

pub struct SearchEngine {
    config: SearchConfig,
    control: ScanControl,
    progress: Arc<RwLock<SearchProgress>>,
    results: Option<Receiver<SearchResult>>,
    workers: Vec<JoinHandle<()>>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            control: ScanControl::new(),
            progress: Arc::new(RwLock::new(SearchProgress::default())),
            results: None,
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Starts searching `params.partition`.
    ///
    /// Invalid settings are returned as errors and leave the engine idle.
    /// Failing to open or size the source is a search failure: the engine
    /// moves to [`SearchState::Failed`] and the message is available from
    /// [`SearchEngine::progress`].
    pub fn start_search(&mut self, params: SearchParams) -> Result<(), EngineError> {
        if self.results.is_some() || self.progress.read().state != SearchState::Idle {
            return Err(EngineError::AlreadyStarted);
        }

        let validator = ResultValidator::new(params.clone(), &self.config)?;
        self.config.scanner.validate()?;

        let (results_tx, results_rx) = unbounded();
        self.results = Some(results_rx);

        let total_bytes = match get_device_info(&params.partition) {
            Ok(info) => info.size_bytes,
            Err(e) => {
                error!(path = %params.partition.display(), error = %e, "cannot size search source");
                self.publish_failure(e.user_message());
                return Ok(());
            }
        };

        let shared = Arc::new(Shared::default());
        let hits = match ScanHits::open(
            &params.partition,
            params.needle(),
            &self.config.scanner,
            self.control.clone(),
        ) {
            Ok(hits) => hits.with_progress(Arc::clone(&shared.bytes_scanned)),
            Err(e @ ScanError::InvalidConfig(_)) => {
                self.results = None;
                return Err(e.into());
            }
            Err(e) => {
                error!(path = %params.partition.display(), error = %e, "cannot open search source");
                self.publish_failure(e.user_message());
                return Ok(());
            }
        };

        info!(
            path = %params.partition.display(),
            total_bytes,
            block_size = params.block_size,
            multi_line = params.is_multi_line,
            "search started"
        );

        *self.progress.write() = SearchProgress {
            state: if self.control.is_paused() {
                SearchState::Paused
            } else {
                SearchState::Running
            },
            total_bytes,
            ..SearchProgress::default()
        };

        let (raw_tx, raw_rx) = bounded(self.config.raw_queue_capacity.max(1));
        let (done_tx, done_rx) = bounded::<()>(0);

        let scanner = guarded(
            "scanner",
            Arc::clone(&shared),
            self.control.clone(),
            done_tx.clone(),
            move |shared, _| scan_worker(hits, raw_tx, shared),
        );
        self.workers.push(spawn("scanner", scanner)?);

        let validate = guarded(
            "validator",
            Arc::clone(&shared),
            self.control.clone(),
            done_tx,
            move |shared, control| {
                validate_worker(&validator, raw_rx, results_tx, control, shared);
            },
        );
        self.workers.push(spawn("validator", validate)?);

        let monitor = {
            let progress = Arc::clone(&self.progress);
            let control = self.control.clone();
            let interval = self.config.progress_interval();
            move || monitor_worker(&progress, done_rx, &shared, &control, total_bytes, interval)
        };
        self.workers.push(spawn("monitor", monitor)?);

        Ok(())
    }

    /// Suspends reading after the current chunk. Calling it before
    /// [`SearchEngine::start_search`] makes the search start paused.
    pub fn pause(&self) {
        self.control.pause();
        let mut progress = self.progress.write();
        if progress.state == SearchState::Running {
            progress.state = SearchState::Paused;
        }
    }

    pub fn resume(&self) {
        self.control.resume();
        let mut progress = self.progress.write();
        if progress.state == SearchState::Paused {
            progress.state = SearchState::Running;
        }
    }

    /// Requests cancellation. The scanner notices within one chunk read.
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn progress(&self) -> SearchProgress {
        self.progress.read().clone()
    }

    pub fn state(&self) -> SearchState {
        self.progress.read().state
    }

    /// Next validated result, if one is ready. Never blocks.
    pub fn try_next_result(&self) -> Option<SearchResult> {
        self.results.as_ref()?.try_recv().ok()
    }

    /// A handle on the result stream for consumers that want to block or
    /// `select!` on it. The stream ends when the search does.
    pub fn results(&self) -> Option<Receiver<SearchResult>> {
        self.results.clone()
    }

    /// Joins the worker threads and returns the final snapshot.
    pub fn wait(&mut self) -> SearchProgress {
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if let Err(e) = handle.join() {
                error!(thread = %name, "search thread panicked: {:?}", e);
            }
        }
        self.progress()
    }

    fn publish_failure(&self, message: String) {
        let mut progress = self.progress.write();
        progress.state = SearchState::Failed;
        progress.error_message = Some(message);
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.control.stop();
            self.wait();
        }
    }
}

fn spawn<F>(name: &'static str, f: F) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("relic-{name}"))
        .spawn(f)
        .map_err(|source| EngineError::Spawn { name, source })
}

/// Wraps a worker body so a panic fails the search instead of looking like
/// a cancellation. `done` is released only after the outcome is recorded.
fn guarded<F>(
    name: &'static str,
    shared: Arc<Shared>,
    control: ScanControl,
    done: Sender<()>,
    body: F,
) -> impl FnOnce() + Send + 'static
where
    F: FnOnce(&Shared, &ScanControl) + Send + 'static,
{
    move || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&shared, &control))) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(thread = name, reason = %reason, "search thread panicked");
            shared.record_error(format!("Internal error in the {name} thread"));
            control.stop();
        }
        drop(done);
    }
}

fn scan_worker(mut hits: ScanHits, raw_tx: Sender<ScanHit>, shared: &Shared) {
    for item in hits.by_ref() {
        match item {
            Ok(hit) => {
                if raw_tx.send(hit).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(path = %hits.path().display(), error = %e, "scan failed");
                shared.record_error(e.user_message());
                break;
            }
        }
    }
    shared
        .scan_reached_end
        .store(hits.reached_end(), Ordering::SeqCst);
}

fn validate_worker(
    validator: &ResultValidator,
    raw_rx: Receiver<ScanHit>,
    results_tx: Sender<SearchResult>,
    control: &ScanControl,
    shared: &Shared,
) {
    for hit in raw_rx.iter() {
        if control.is_stopped() {
            return;
        }
        match validator.validate(&hit) {
            Ok(Some(result)) => {
                debug!(offset = result.offset, block = result.block_index, "match validated");
                shared.result_count.fetch_add(1, Ordering::Relaxed);
                let _ = results_tx.send(result);
            }
            Ok(None) => {}
            Err(e) => {
                error!(offset = hit.match_offset, error = %e, "validation failed");
                shared.record_error(e.user_message());
                control.stop();
                return;
            }
        }
    }
    shared.validator_drained.store(true, Ordering::SeqCst);
}

fn monitor_worker(
    progress: &RwLock<SearchProgress>,
    done_rx: Receiver<()>,
    shared: &Shared,
    control: &ScanControl,
    total_bytes: u64,
    interval: Duration,
) {
    let started = Instant::now();
    loop {
        match done_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => publish_tick(progress, shared, total_bytes),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let mut error = shared.error.lock().take();
    let completed = error.is_none()
        && shared.scan_reached_end.load(Ordering::SeqCst)
        && shared.validator_drained.load(Ordering::SeqCst);
    if !completed && error.is_none() && !control.is_stopped() {
        error = Some("Search ended before the whole source was read".to_string());
    }

    let mut snapshot = progress.write();
    snapshot.bytes_scanned = shared.bytes_scanned.load(Ordering::Relaxed);
    snapshot.result_count = shared.result_count.load(Ordering::Relaxed);
    snapshot.state = if error.is_some() {
        SearchState::Failed
    } else if completed {
        snapshot.progress_percent = 100.0;
        SearchState::Completed
    } else {
        SearchState::Cancelled
    };
    snapshot.error_message = error;

    info!(
        state = %snapshot.state,
        results = snapshot.result_count,
        bytes = snapshot.bytes_scanned,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "search finished"
    );
}

fn publish_tick(progress: &RwLock<SearchProgress>, shared: &Shared, total_bytes: u64) {
    let scanned = shared.bytes_scanned.load(Ordering::Relaxed);
    let percent = if total_bytes == 0 {
        0.0
    } else {
        (scanned as f64 / total_bytes as f64 * 100.0).min(100.0)
    };

    let mut snapshot = progress.write();
    if snapshot.state.is_terminal() {
        return;
    }
    snapshot.bytes_scanned = scanned;
    snapshot.result_count = shared.result_count.load(Ordering::Relaxed);
    snapshot.progress_percent = snapshot.progress_percent.max(percent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn image(len: usize, parts: &[(usize, &[u8])]) -> NamedTempFile {
        let mut data = vec![0u8; len];
        for (off, bytes) in parts {
            data[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();
        temp
    }

    fn config() -> SearchConfig {
        let scanner = crate::config::ScannerConfig::default()
            .with_chunk_size(256)
            .with_preview(32, 32, 64);
        SearchConfig::default().with_scanner(scanner).with_block_factor(1)
    }

    fn drain(engine: &SearchEngine) -> Vec<SearchResult> {
        engine.results().unwrap().try_iter().collect()
    }

    #[test]
    fn single_line_search_completes_with_ordered_results() {
        let temp = image(4096, &[(100, b"needle"), (1020, b"needle"), (4000, b"needle")]);
        let mut engine = SearchEngine::new(config());
        let params = SearchParams::new(temp.path(), "needle", 512).unwrap();

        engine.start_search(params).unwrap();
        let done = engine.wait();

        assert_eq!(done.state, SearchState::Completed);
        assert_eq!(done.progress_percent, 100.0);
        assert_eq!(done.result_count, 3);
        assert_eq!(done.bytes_scanned, 4096);
        assert!(done.error_message.is_none());

        let results = drain(&engine);
        let offsets: Vec<u64> = results.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![100, 1020, 4000]);
        assert_eq!(results[1].block_index, 1);
        assert!(results[1].line.contains("needle"));
    }

    #[test]
    fn multi_line_false_positives_are_dropped() {
        let temp = image(
            8192,
            &[(100, b"alpha\nbeta"), (5000, b"alpha"), (7000, b"beta")],
        );
        let mut engine = SearchEngine::new(config());
        let params = SearchParams::new(temp.path(), "alpha\nbeta", 512).unwrap();

        engine.start_search(params).unwrap();
        assert_eq!(engine.wait().state, SearchState::Completed);

        let offsets: Vec<u64> = drain(&engine).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![100]);
    }

    #[test]
    fn stopping_a_paused_search_cancels_it() {
        let temp = image(4096, &[(10, b"needle")]);
        let mut engine = SearchEngine::new(config());
        engine.pause();
        engine
            .start_search(SearchParams::new(temp.path(), "needle", 512).unwrap())
            .unwrap();
        assert_eq!(engine.state(), SearchState::Paused);

        engine.stop();
        let done = engine.wait();
        assert_eq!(done.state, SearchState::Cancelled);
        assert!(drain(&engine).is_empty());
    }

    #[test]
    fn resumed_search_runs_to_completion() {
        let temp = image(2048, &[(700, b"needle")]);
        let mut engine = SearchEngine::new(config());
        engine.pause();
        engine
            .start_search(SearchParams::new(temp.path(), "needle", 512).unwrap())
            .unwrap();

        engine.resume();
        assert_eq!(engine.state(), SearchState::Running);
        let done = engine.wait();
        assert_eq!(done.state, SearchState::Completed);
        assert_eq!(done.result_count, 1);
    }

    #[test]
    fn unreadable_source_fails_the_search() {
        let dir = TempDir::new().unwrap();
        let mut engine = SearchEngine::new(config());
        engine
            .start_search(SearchParams::new(dir.path(), "needle", 512).unwrap())
            .unwrap();

        let done = engine.wait();
        assert_eq!(done.state, SearchState::Failed);
        assert!(done.error_message.is_some());
        assert!(engine.try_next_result().is_none());
    }

    #[test]
    fn missing_source_fails_without_spawning() {
        let mut engine = SearchEngine::new(config());
        engine
            .start_search(SearchParams::new("/nonexistent/relic.img", "needle", 512).unwrap())
            .unwrap();

        let done = engine.progress();
        assert_eq!(done.state, SearchState::Failed);
        assert!(done.error_message.unwrap().contains("does not exist"));
    }

    #[test]
    fn an_engine_runs_one_search() {
        let temp = image(1024, &[]);
        let mut engine = SearchEngine::new(config());
        let params = SearchParams::new(temp.path(), "needle", 512).unwrap();

        engine.start_search(params.clone()).unwrap();
        assert!(matches!(
            engine.start_search(params),
            Err(EngineError::AlreadyStarted)
        ));
        assert_eq!(engine.wait().state, SearchState::Completed);
    }

    #[test]
    fn unreadable_validation_window_fails_the_search() {
        let temp = image(4096, &[(100, b"alpha\nbeta")]);
        let mut engine = SearchEngine::new(config().with_block_factor(2));
        let params = SearchParams::new(temp.path(), "alpha\nbeta", 1 << 62).unwrap();

        engine.start_search(params).unwrap();
        let done = engine.wait();
        assert_eq!(done.state, SearchState::Failed);
        assert!(done.error_message.is_some());
        assert!(drain(&engine).is_empty());
    }

    #[test]
    fn panicking_worker_is_recorded_as_a_failure() {
        let shared = Arc::new(Shared::default());
        let control = ScanControl::new();
        let (done_tx, done_rx) = bounded::<()>(0);

        let body = guarded(
            "validator",
            Arc::clone(&shared),
            control.clone(),
            done_tx,
            |_, _| panic!("boom"),
        );
        body();

        assert!(control.is_stopped());
        assert!(matches!(
            done_rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
        let message = shared.error.lock().clone().unwrap();
        assert!(message.contains("validator"));
    }

    #[test]
    fn unexplained_early_exit_is_not_a_cancellation() {
        let progress = RwLock::new(SearchProgress {
            state: SearchState::Running,
            ..SearchProgress::default()
        });
        let shared = Shared::default();
        let (done_tx, done_rx) = bounded::<()>(0);
        drop(done_tx);

        monitor_worker(
            &progress,
            done_rx,
            &shared,
            &ScanControl::new(),
            100,
            Duration::from_millis(1),
        );
        let done = progress.read().clone();
        assert_eq!(done.state, SearchState::Failed);
        assert!(done.error_message.is_some());
    }

    #[test]
    fn invalid_settings_leave_the_engine_idle() {
        let temp = image(1024, &[]);
        let mut engine = SearchEngine::new(config().with_block_factor(0));
        let params = SearchParams::new(temp.path(), "needle", 512).unwrap();

        assert!(engine.start_search(params).is_err());
        assert_eq!(engine.state(), SearchState::Idle);
    }
}
