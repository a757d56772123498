//! # snapheap CLI - Deduplicating snapshots of a directory
//!
//! A thin driver over the snapheap library.
//!
//! ## Usage
//! ```bash
//! # Snapshot the current directory (heap and manifests under .snapheap/)
//! snapheap snapshot
//!
//! # List persisted snapshots
//! snapheap list
//!
//! # Compare the newest snapshot with the tree as it is now
//! snapheap diff latest current
//!
//! # Roll back to the state at a point in time
//! snapheap restore 2024-05-01T12:00:00Z
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use snapheap::{
    DiffStatus, Manifest, RestoreOptions, Result, SnapError, SnapshotConfig, SnapshotManager,
    SnapshotManagerBuilder, SnapshotOptions, SnapshotSelector,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// snapheap - deduplicating snapshot and restore of directory trees
#[derive(Parser)]
#[command(name = "snapheap")]
#[command(version)]
#[command(about = "Snapshot, diff and restore directory trees with a deduplicating heap")]
#[command(long_about = None)]
struct Cli {
    /// Directory to snapshot (defaults to current)
    #[arg(short = 'r', long, global = true)]
    file_root: Option<PathBuf>,

    /// Where manifests are stored (defaults to <file-root>/.snapheap/snapshots)
    #[arg(long, global = true)]
    snap_root: Option<PathBuf>,

    /// Where content blobs are stored (defaults to <file-root>/.snapheap/heap)
    #[arg(long, global = true)]
    heap_root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of listing and ingestion workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a snapshot of the file root
    #[command(alias = "snap")]
    Snapshot {
        /// Ingest content without writing a manifest
        #[arg(long)]
        no_persist: bool,
    },

    /// List persisted snapshots
    #[command(alias = "ls")]
    List {
        /// Show only the newest N snapshots
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the records of a snapshot
    Show {
        /// `latest`, a manifest path or an RFC 3339 timestamp
        #[arg(default_value = "latest")]
        snapshot: String,
    },

    /// Compare two snapshots (`current` snapshots the tree without persisting)
    Diff {
        /// Left side
        left: String,

        /// Right side
        #[arg(default_value = "current")]
        right: String,

        /// Also list unchanged files
        #[arg(long)]
        all: bool,
    },

    /// Make the file root match a snapshot
    #[command(alias = "rs")]
    Restore {
        /// `latest`, a manifest path or an RFC 3339 timestamp
        #[arg(default_value = "latest")]
        snapshot: String,

        /// Do not persist the snapshot taken before restoring
        #[arg(long)]
        no_safety_snapshot: bool,

        /// Re-hash heap content before writing it
        #[arg(long)]
        verify: bool,

        /// Show what would change without touching files
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let manager = open_manager(&config, cli.workers)?;

    match cli.command {
        Commands::Snapshot { no_persist } => cmd_snapshot(&manager, !no_persist),
        Commands::List { limit } => cmd_list(&manager, limit),
        Commands::Show { snapshot } => cmd_show(&manager, &snapshot),
        Commands::Diff { left, right, all } => cmd_diff(&manager, &left, &right, all),
        Commands::Restore {
            snapshot,
            no_safety_snapshot,
            verify,
            dry_run,
        } => {
            let options = RestoreOptions {
                persist_safety_snapshot: !no_safety_snapshot,
                verify_hashes: verify,
                dry_run,
            };
            cmd_restore(&manager, &snapshot, &options)
        }
    }
}

/// Merge the configuration file (if any) with command-line roots
fn resolve_config(cli: &Cli) -> Result<SnapshotConfig> {
    let as_string = |p: &PathBuf| p.to_string_lossy().to_string();

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = SnapshotConfig::load(path)?;
            if let Some(root) = &cli.file_root {
                config.file_root = as_string(root);
            }
            config
        }
        None => {
            let file_root = cli.file_root.clone().unwrap_or_else(|| PathBuf::from("."));
            let file_root = std::fs::canonicalize(&file_root).unwrap_or(file_root);
            let state = file_root.join(".snapheap");
            SnapshotConfig::new(
                as_string(&file_root),
                as_string(&state.join("snapshots")),
                as_string(&state.join("heap")),
            )
        }
    };

    if let Some(root) = &cli.snap_root {
        config.snap_root = as_string(root);
    }
    if let Some(root) = &cli.heap_root {
        config.heap_root = as_string(root);
    }
    Ok(config)
}

fn open_manager(config: &SnapshotConfig, workers: Option<usize>) -> Result<SnapshotManager> {
    let mut builder = SnapshotManagerBuilder::from_config(config);
    if let Some(workers) = workers {
        if workers == 0 {
            return Err(SnapError::InvalidConfiguration(
                "--workers must be at least 1".to_string(),
            ));
        }
        builder = builder.lister_workers(workers).ingest_workers(workers);
    }
    builder.build(&config.file_root, &config.snap_root, &config.heap_root)
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Resolve a selector argument; `current` takes an unpersisted snapshot
fn load_side(manager: &SnapshotManager, arg: &str) -> Result<Manifest> {
    if arg.eq_ignore_ascii_case("current") {
        let options = SnapshotOptions {
            persist: false,
            ingest_missing: false,
        };
        return manager.make_snapshot(&options).map(|(manifest, _)| manifest);
    }
    let selector: SnapshotSelector = arg.parse()?;
    manager.read_snapshot(&selector)
}

fn cmd_snapshot(manager: &SnapshotManager, persist: bool) -> Result<()> {
    println!("{}", "Taking snapshot...".blue().bold());
    let start = Instant::now();
    let pb = spinner("Listing and ingesting files...");

    let options = SnapshotOptions {
        persist,
        ..Default::default()
    };
    let result = manager.make_snapshot(&options);
    pb.finish_and_clear();
    let (manifest, timestamp) = result?;

    println!(
        "{} Snapshot {}",
        "✓".green().bold(),
        timestamp.to_rfc3339().yellow().bold()
    );
    println!("  Files: {}", manifest.len().to_string().cyan());
    println!("  Size: {}", format_bytes(manifest.total_size()).cyan());
    println!("  Heap blobs: {}", manager.heap().len().to_string().cyan());
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());
    if !persist {
        println!("  {}", "(manifest not persisted)".dimmed());
    }
    Ok(())
}

fn cmd_list(manager: &SnapshotManager, limit: Option<usize>) -> Result<()> {
    let snapshots = manager.list_snapshots()?;
    if snapshots.is_empty() {
        println!("{}", "No snapshots found".yellow());
        return Ok(());
    }

    let skip = limit.map_or(0, |n| snapshots.len().saturating_sub(n));
    for (timestamp, path) in snapshots.iter().skip(skip) {
        println!("{}  {}", timestamp.to_rfc3339().yellow(), path.dimmed());
    }
    println!("\n{} snapshots", snapshots.len().to_string().cyan());
    Ok(())
}

fn cmd_show(manager: &SnapshotManager, snapshot: &str) -> Result<()> {
    let manifest = load_side(manager, snapshot)?;
    for record in &manifest {
        let checksum = record.checksum.as_deref().unwrap_or("-");
        let size = record.size().map(format_bytes).unwrap_or_default();
        println!("{}  {:>10}  {}", checksum.dimmed(), size, record.name);
    }
    println!(
        "\n{} files, {}",
        manifest.len().to_string().cyan(),
        format_bytes(manifest.total_size()).cyan()
    );
    Ok(())
}

fn cmd_diff(manager: &SnapshotManager, left: &str, right: &str, all: bool) -> Result<()> {
    let left_manifest = load_side(manager, left)?;
    let right_manifest = load_side(manager, right)?;
    let table = manager.diff(&left_manifest, &right_manifest);

    for row in table.rows() {
        let line = match row.status {
            DiffStatus::Equal if !all => continue,
            DiffStatus::Equal => format!("  {}", row.name).normal(),
            DiffStatus::Different => format!("~ {}", row.name).yellow(),
            DiffStatus::OnlyLeft => format!("< {}", row.name).red(),
            DiffStatus::OnlyRight => format!("> {}", row.name).green(),
        };
        println!("{}", line);
    }

    let stats = table.stats();
    println!(
        "\n{} equal, {} different, {} only in {}, {} only in {}",
        stats.equal.to_string().cyan(),
        stats.different.to_string().yellow(),
        stats.only_left.to_string().red(),
        left,
        stats.only_right.to_string().green(),
        right
    );
    Ok(())
}

fn cmd_restore(manager: &SnapshotManager, snapshot: &str, options: &RestoreOptions) -> Result<()> {
    let selector: SnapshotSelector = snapshot.parse()?;
    let target = manager.read_snapshot(&selector)?;

    println!(
        "{} {} ({} files)",
        "Restoring".blue().bold(),
        snapshot.yellow(),
        target.len()
    );

    let pb = spinner("Restoring files...");
    let result = manager.restore(&target, options);
    pb.finish_and_clear();
    let result = result?;

    if result.dry_run {
        println!("{} Dry run, no files touched", "✓".green().bold());
        println!("  Would write: {}", result.files_restored.to_string().cyan());
        println!("  Would delete: {}", result.files_deleted.to_string().yellow());
        return Ok(());
    }

    println!("{} Restoration complete", "✓".green().bold());
    println!("  Files restored: {}", result.files_restored.to_string().cyan());
    println!("  Files deleted: {}", result.files_deleted.to_string().yellow());
    println!("  Unchanged: {}", result.stats.equal.to_string().cyan());
    println!("  Bytes written: {}", format_bytes(result.bytes_written).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );
    Ok(())
}

fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
