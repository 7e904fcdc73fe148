use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use crossbeam_channel::RecvTimeoutError;
use dialoguer::{Select, theme::ColorfulTheme};
use humansize::{BINARY, format_size};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use relic::io::{DEFAULT_READ_CHUNK, extract_range, format_hex_dump, read_block};
use relic::{
    DeviceIoError, DiscoveryError, EngineError, LocalResultSaver, ResultSaver, SaveError,
    ScanError, SearchConfig, SearchEngine, SearchParams, SearchState, ValidationError,
    get_device_info, get_partitions,
};

const UI_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "relic")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Recover text from raw block devices and disk images")]
struct Cli {
    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List block devices and partitions
    List {
        /// Include unmounted disks, loop devices and swap
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show size and sector geometry of a device or image
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Search a device for text
    Search {
        #[arg(short, long)]
        device: Option<PathBuf>,
        #[arg(short, long, required_unless_present = "pattern_file", conflicts_with = "pattern_file")]
        pattern: Option<String>,
        /// Read the (possibly multi-line) pattern from a file
        #[arg(long)]
        pattern_file: Option<PathBuf>,
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Defaults to the device's logical sector size
        #[arg(long)]
        block_size: Option<u64>,
        #[arg(long)]
        block_factor: Option<u64>,
        /// JSON file with search settings; flags take precedence
        #[arg(long)]
        config: Option<PathBuf>,
        /// Save the block of every result into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,
        /// One JSON object per result on stdout
        #[arg(long)]
        json: bool,
    },
    /// Hex dump one block
    Block {
        #[arg(short, long)]
        device: PathBuf,
        #[arg(long)]
        block_size: u64,
        #[arg(long)]
        index: u64,
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
    /// Copy a byte range into a file
    Extract {
        #[arg(short, long)]
        device: PathBuf,
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        length: u64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

struct SearchArgs {
    device: Option<PathBuf>,
    pattern: Option<String>,
    pattern_file: Option<PathBuf>,
    chunk_size: Option<usize>,
    block_size: Option<u64>,
    block_factor: Option<u64>,
    config: Option<PathBuf>,
    save_dir: Option<PathBuf>,
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{e:?}");
            eprintln!("\n[!] {}", style(user_message(&e)).red());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::List { all, json } => run_list(all, json),
        Command::Info { path, json } => run_info(&path, json),
        Command::Search {
            device,
            pattern,
            pattern_file,
            chunk_size,
            block_size,
            block_factor,
            config,
            save_dir,
            json,
        } => run_search(SearchArgs {
            device,
            pattern,
            pattern_file,
            chunk_size,
            block_size,
            block_factor,
            config,
            save_dir,
            json,
        }),
        Command::Block {
            device,
            block_size,
            index,
            save_dir,
        } => run_block(&device, block_size, index, save_dir.as_deref()),
        Command::Extract {
            device,
            offset,
            length,
            output,
        } => run_extract(&device, offset, length, &output),
    }
}

/// Prefers the short message of a library error over the diagnostic chain.
fn user_message(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<DeviceIoError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<DiscoveryError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<ScanError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<ValidationError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<EngineError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<SaveError>() {
        return e.user_message();
    }
    format!("{err:#}")
}

fn run_list(all: bool, json: bool) -> Result<()> {
    let partitions = get_partitions(!all)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&partitions)?);
        return Ok(());
    }

    if partitions.is_empty() {
        println!(
            "\n[!] {}",
            style("No block devices found. Try --all to include unmounted disks.").yellow()
        );
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<8} {:>10} {}",
        style("NAME").bold(),
        style("TYPE").bold(),
        style("FS").bold(),
        style("SIZE").bold(),
        style("MOUNT").bold()
    );
    println!("{}", "-".repeat(62));
    for p in &partitions {
        println!(
            "{:<12} {:<10} {:<8} {:>10} {}",
            p.name,
            p.device_type.to_string(),
            p.fs_type,
            p.size_human(),
            p.mount_point.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_info(path: &Path, json: bool) -> Result<()> {
    let info = get_device_info(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", style(path.display()).cyan().bold());
    println!(
        "Size:            {} ({} bytes)",
        format_size(info.size_bytes, BINARY),
        info.size_bytes
    );
    println!("Logical sector:  {} bytes", info.logical_sector_size);
    println!("Physical sector: {} bytes", info.physical_sector_size);
    println!("Sectors:         {}", info.sector_count());
    println!("Read-only:       {}", info.read_only);
    println!("Block device:    {}", info.is_block_device);
    Ok(())
}

fn select_device() -> Result<PathBuf> {
    println!("\n{}", style("Discovering block devices...").cyan());
    let partitions = get_partitions(true)?;

    if partitions.is_empty() {
        bail!("No block devices found. Pass --device with a device or image path.");
    }

    let options: Vec<String> = partitions.iter().map(|p| p.display()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select device to search")
        .items(&options)
        .default(0)
        .interact()
        .context("Failed to select device")?;

    Ok(PathBuf::from(&partitions[selection].device_path))
}

fn load_search_config(args: &SearchArgs) -> Result<SearchConfig> {
    let mut config = match &args.config {
        Some(path) => SearchConfig::from_json_file(path)?,
        None => SearchConfig::default(),
    };
    if let Some(chunk) = args.chunk_size {
        let scanner = config.scanner.clone().with_chunk_size(chunk);
        config = config.with_scanner(scanner);
    }
    if let Some(size) = args.block_size {
        config = config.with_block_size(size);
    }
    if let Some(factor) = args.block_factor {
        config = config.with_block_factor(factor);
    }
    Ok(config)
}

fn run_search(args: SearchArgs) -> Result<()> {
    let config = load_search_config(&args)?;

    let pattern = match (&args.pattern, &args.pattern_file) {
        (Some(p), _) => p.clone(),
        (None, Some(file)) => std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read pattern file {}", file.display()))?,
        (None, None) => bail!("a pattern is required"),
    };

    let device = match args.device.clone() {
        Some(path) => path,
        None => select_device()?,
    };

    let params = SearchParams::for_device(&device, pattern, &config)?;
    let block_size = params.block_size;
    let saver = args
        .save_dir
        .as_deref()
        .map(LocalResultSaver::new)
        .transpose()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut engine = SearchEngine::new(config);
    engine.start_search(params)?;
    let Some(results) = engine.results() else {
        bail!("search did not start");
    };

    let total = engine.progress().total_bytes;
    let pb = if args.json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
                .progress_chars("=>-"),
        );
        pb
    };

    let mut found = 0usize;
    let mut stopping = false;
    loop {
        if !stopping && interrupted.load(Ordering::SeqCst) {
            pb.println(format!("{}", style("Stopping search...").yellow()));
            engine.stop();
            stopping = true;
        }

        match results.recv_timeout(UI_TICK) {
            Ok(result) => {
                found += 1;
                if args.json {
                    println!("{}", serde_json::to_string(&result)?);
                } else {
                    pb.println(format!(
                        "{} offset {} block {}: {}",
                        style("[+]").green(),
                        result.offset,
                        result.block_index,
                        result.line
                    ));
                }
                if let Some(saver) = &saver {
                    saver.save_block(&device, block_size, result.block_index)?;
                    saver.save_result_text(&result)?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let progress = engine.progress();
        pb.set_position(progress.bytes_scanned);
        pb.set_message(format!("{found} found"));
    }

    let done = engine.wait();
    pb.set_position(done.bytes_scanned);
    pb.finish_with_message(format!("{} found", style(done.result_count).green().bold()));

    if args.json {
        println!("{}", serde_json::to_string(&done)?);
    } else {
        println!();
        println!("Search {}: {} results", done.state, style(done.result_count).bold());
        if let Some(saver) = &saver {
            println!(
                "Saved {} files ({}) to {}",
                saver.files_written(),
                format_size(saver.bytes_written(), BINARY),
                saver.output_dir().display()
            );
        }
    }

    if done.state == SearchState::Failed {
        bail!(
            "{}",
            done.error_message
                .unwrap_or_else(|| "search failed".to_string())
        );
    }
    Ok(())
}

fn run_block(device: &Path, block_size: u64, index: u64, save_dir: Option<&Path>) -> Result<()> {
    let data = read_block(device, block_size, index)?;
    print!("{}", format_hex_dump(&data, index.saturating_mul(block_size)));

    if let Some(dir) = save_dir {
        let saver = LocalResultSaver::new(dir)?;
        let saved = saver.save_block(device, block_size, index)?;
        println!(
            "\nSaved {} bytes to {} (sha256 {})",
            saved.bytes,
            saved.path.display(),
            saved.sha256
        );
    }
    Ok(())
}

fn run_extract(device: &Path, offset: u64, length: u64, output: &Path) -> Result<()> {
    let written = extract_range(device, offset, length, output, DEFAULT_READ_CHUNK)?;
    println!(
        "{} {} ({} bytes) to {}",
        style("Extracted").green().bold(),
        format_size(written, BINARY),
        written,
        output.display()
    );
    Ok(())
}
