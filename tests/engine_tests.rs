use relic::config::ScannerConfig;
use relic::{SearchConfig, SearchEngine, SearchParams, SearchResult, SearchState};
use rstest::{fixture, rstest};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const BLOCK: u64 = 512;

fn config() -> SearchConfig {
    SearchConfig::default().with_scanner(
        ScannerConfig::default()
            .with_chunk_size(1000)
            .with_preview(64, 64, 128),
    )
}

/// A 64 KiB image with a letter spread over two lines, a lone greeting
/// without its second line, and a single-line marker.
#[fixture]
fn letter_image() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let mut data = vec![0u8; 64 * 1024];
    let mut put = |offset: usize, bytes: &[u8]| {
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    };
    put(2000, b"Dear Alice,\nthe key is under the mat.\n");
    put(30_000, b"Dear Alice,\n");
    put(50_000, b"MARKER-7");

    let path = dir.path().join("letter.img");
    fs::write(&path, &data).unwrap();
    (dir, path)
}

fn run(config: SearchConfig, params: SearchParams) -> (SearchState, Vec<SearchResult>) {
    let mut engine = SearchEngine::new(config);
    engine.start_search(params).unwrap();
    let results = engine.results().unwrap();
    let collected: Vec<SearchResult> = results.iter().collect();
    (engine.wait().state, collected)
}

#[rstest]
fn test_multi_line_search_keeps_only_complete_letters(letter_image: (TempDir, PathBuf)) {
    let (_dir, path) = letter_image;
    let params = SearchParams::new(&path, "Dear Alice,\nthe key is under the mat.", BLOCK).unwrap();

    let (state, results) = run(config(), params);
    assert_eq!(state, SearchState::Completed);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].offset, 2000);
    assert_eq!(results[0].block_index, 3);
    assert!(results[0].line.contains("Dear Alice,"));
}

#[rstest]
fn test_single_line_search_reports_every_hit(letter_image: (TempDir, PathBuf)) {
    let (_dir, path) = letter_image;
    let params = SearchParams::new(&path, "Dear Alice,", BLOCK).unwrap();

    let (state, results) = run(config(), params);
    assert_eq!(state, SearchState::Completed);
    let offsets: Vec<u64> = results.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![2000, 30_000]);
}

#[rstest]
fn test_block_size_from_device_geometry(letter_image: (TempDir, PathBuf)) {
    let (_dir, path) = letter_image;
    let params = SearchParams::for_device(&path, "MARKER-7", &config()).unwrap();
    assert_eq!(params.block_size, 512);

    let (_, results) = run(config(), params);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].block_index, 50_000 / 512);
}

#[rstest]
fn test_progress_is_complete_after_wait(letter_image: (TempDir, PathBuf)) {
    let (_dir, path) = letter_image;
    let mut engine = SearchEngine::new(config());
    engine
        .start_search(SearchParams::new(&path, "MARKER-7", BLOCK).unwrap())
        .unwrap();

    let done = engine.wait();
    assert_eq!(done.state, SearchState::Completed);
    assert_eq!(done.total_bytes, 64 * 1024);
    assert_eq!(done.bytes_scanned, 64 * 1024);
    assert_eq!(done.progress_percent, 100.0);
    assert_eq!(done.result_count, 1);
    assert_eq!(engine.try_next_result().map(|r| r.offset), Some(50_000));
    assert!(engine.try_next_result().is_none());
}

#[rstest]
fn test_dropping_a_paused_engine_returns() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zeros.img");
    fs::write(&path, vec![0u8; 4096]).unwrap();

    let mut engine = SearchEngine::new(config());
    engine.pause();
    engine
        .start_search(SearchParams::new(&path, "x", BLOCK).unwrap())
        .unwrap();
    assert_eq!(engine.state(), SearchState::Paused);
    drop(engine);
}

#[rstest]
fn test_progress_never_goes_backwards() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.img");
    fs::write(&path, vec![b'.'; 4 * 1024 * 1024]).unwrap();

    let mut config = SearchConfig::default().with_scanner(
        ScannerConfig::default()
            .with_chunk_size(4096)
            .with_preview(16, 16, 32),
    );
    config.progress_interval_ms = 1;

    let mut engine = SearchEngine::new(config);
    engine.pause();
    engine
        .start_search(SearchParams::new(&path, "absent", BLOCK).unwrap())
        .unwrap();

    let mut samples = Vec::new();
    for _ in 0..5 {
        samples.push(engine.progress().progress_percent);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    engine.resume();
    while !engine.state().is_terminal() {
        samples.push(engine.progress().progress_percent);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let done = engine.wait();
    samples.push(done.progress_percent);

    assert_eq!(done.state, SearchState::Completed);
    assert_eq!(done.progress_percent, 100.0);
    assert!(samples.iter().all(|p| (0.0..=100.0).contains(p)));
    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "{samples:?}");
}
