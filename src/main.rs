use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use spacemap::config::settings::Settings;
use spacemap::core::admission::VolumeAdmissionScheduler;
use spacemap::core::cache::ResultCache;
use spacemap::core::orchestrator::{OverallState, ScanOrchestrator, PUMP_INTERVAL};
use spacemap::core::reader::FsDirectoryReader;
use spacemap::layout::treemap::Rect;
use spacemap::models::node::human_readable_size;

#[derive(Parser, Debug)]
#[command(name = "spacemap", version, about = "Live disk-usage treemap scanner")]
struct Cli {
    /// Path to analyze (default: current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scanner threads (1-16)
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Files kept individually per directory (0-4096)
    #[arg(short = 'k', long)]
    top_files: Option<usize>,

    /// Concurrent scans allowed per storage volume (1-8)
    #[arg(long)]
    per_volume: Option<usize>,

    /// Ignore cached results and always rescan
    #[arg(long)]
    no_cache: bool,

    /// Layout viewport width
    #[arg(long, default_value_t = 1280.0)]
    width: f32,

    /// Layout viewport height
    #[arg(long, default_value_t = 800.0)]
    height: f32,

    /// Export the finished tree as JSON to this file
    #[arg(long)]
    export_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (logs to stderr)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut settings = match cli.config {
        Some(ref path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(threads) = cli.threads {
        settings.scan_threads = threads;
    }
    if let Some(top_files) = cli.top_files {
        settings.top_files_per_directory = top_files;
    }
    if let Some(per_volume) = cli.per_volume {
        settings.max_concurrent_scans_per_volume = per_volume;
    }
    let settings = settings.clamped();

    let path = std::fs::canonicalize(&cli.path)?;

    let admission = VolumeAdmissionScheduler::new(settings.max_concurrent_scans_per_volume);
    let cache = Arc::new(ResultCache::from_settings(&settings));
    let mut orchestrator =
        ScanOrchestrator::new(settings, Arc::new(FsDirectoryReader), admission, cache);
    orchestrator.set_viewport(Rect::new(0.0, 0.0, cli.width, cli.height));
    orchestrator.start_scan(&path, !cli.no_cache)?;

    let mut ticker = tokio::time::interval(PUMP_INTERVAL);
    let mut last_report = std::time::Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = orchestrator.pump();
                if report.scan_active && last_report.elapsed().as_secs() >= 1 {
                    let progress = orchestrator.progress();
                    eprintln!(
                        "scanned {} files in {} dirs, {} ({:.0} files/s)",
                        progress.files_scanned,
                        progress.dirs_scanned,
                        human_readable_size(progress.bytes_scanned),
                        progress.files_per_second,
                    );
                    last_report = std::time::Instant::now();
                }
                if !report.scan_active && report.layout_complete && !report.layout_rebuilt {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling scan");
                orchestrator.cancel_scan();
            }
        }
    }

    print_summary(&orchestrator);

    if let Some(ref export_path) = cli.export_json {
        if let Some(store) = orchestrator.store() {
            spacemap::export::json::export_json(store, export_path)?;
            println!("Exported to: {}", export_path.display());
        }
    }

    orchestrator.shutdown();
    Ok(())
}

fn print_summary(orchestrator: &ScanOrchestrator) {
    let Some(root) = orchestrator.store().map(|s| s.root()) else {
        return;
    };
    let state = match orchestrator.overall_state() {
        OverallState::Done => "complete",
        OverallState::Error => "completed with errors",
        OverallState::Canceled => "cancelled",
        OverallState::Scanning | OverallState::Idle => "incomplete",
    };
    println!(
        "{}: {} ({})",
        orchestrator.name(root.id),
        human_readable_size(root.total_bytes),
        state
    );

    let mut tiles: Vec<_> = orchestrator
        .tiles()
        .iter()
        .filter(|t| t.depth == 0)
        .collect();
    tiles.sort_by(|a, b| b.rect.area().total_cmp(&a.rect.area()));
    for tile in tiles {
        match tile.remainder {
            Some(remainder) => println!(
                "  {:>10}  ({} more items)",
                human_readable_size(remainder.bytes),
                remainder.items
            ),
            None => {
                let Some(node) = orchestrator.node(tile.node) else {
                    continue;
                };
                let label = if node.is_synthetic {
                    format!("({} more files)", node.aggregate_files)
                } else {
                    orchestrator.name(tile.node).to_string()
                };
                println!(
                    "  {:>10}  {:5.1}%  {}",
                    human_readable_size(node.total_bytes),
                    node.percentage(root.total_bytes),
                    label
                );
            }
        }
    }

    let errors = orchestrator.error_nodes();
    if !errors.is_empty() {
        println!("{} directories could not be read", errors.len());
    }
}
