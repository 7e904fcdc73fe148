pub mod config;
pub mod core;
pub mod devices;
pub mod engine;
pub mod io;
pub mod saver;
pub mod scanner;
pub mod types;
pub mod validation;

pub use config::{ScannerConfig, SearchConfig};
pub use core::{
    DeviceIoError, DiscoveryError, EngineError, SaveError, ScanError, ValidationError,
    get_device_info,
};
pub use devices::{InventorySources, get_partitions, get_partitions_from};
pub use engine::SearchEngine;
pub use io::{extract_range, read_block, read_range};
pub use saver::{LocalResultSaver, ResultSaver};
pub use scanner::{ScanControl, ScanHits, iter_scan_hits};
pub use types::{
    DeviceInfo, DeviceType, Offset, Partition, SavedRange, ScanHit, SearchProgress, SearchResult,
    SearchState,
};
pub use validation::{ResultValidator, SearchParams};
