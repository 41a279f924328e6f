//! memwarden command-line interface
//!
//! # Examples
//!
//! ```bash
//! # Show memory status and pressure level
//! memwarden status
//!
//! # Run the engine until Ctrl-C
//! memwarden daemon --config memwarden.toml
//!
//! # Compress a 64 MB buffer through the block allocator
//! memwarden compress-demo --size-mb 64
//! ```

use clap::{Parser, Subcommand};
use memwarden::{metrics, EngineConfig, MemoryContext};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// memwarden - resource lifecycle and memory-pressure management
#[derive(Parser, Debug)]
#[command(name = "memwarden")]
#[command(version = memwarden::VERSION)]
#[command(about = "Keeps resident memory under budget for large in-process objects", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "MEMWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path; diagnostic reports go to `<log-dir>/reports`
    #[arg(long, global = true, default_value = "logs", env = "MEMWARDEN_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print system and process memory status
    Status,

    /// Run background services until interrupted
    Daemon {
        /// Seconds between status lines
        #[arg(long, default_value = "60")]
        status_interval: u64,
    },

    /// Run one compaction pass and print its report
    Compact,

    /// Allocate a repetitive buffer and compress it through the allocator
    CompressDemo {
        /// Buffer size in MB
        #[arg(long, default_value = "50")]
        size_mb: usize,
    },

    /// Print Prometheus metrics
    Metrics,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match cli.command {
        Commands::Status => status_command(&cli),
        Commands::Daemon { status_interval } => daemon_command(&cli, status_interval).await,
        Commands::Compact => compact_command(&cli),
        Commands::CompressDemo { size_mb } => compress_demo_command(&cli, size_mb),
        Commands::Metrics => {
            let _ctx = build_context(&cli)?;
            print!("{}", metrics::export_metrics());
            Ok(())
        }
        Commands::Version => {
            println!("memwarden {}", memwarden::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "memwarden.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if config.report_dir.is_none() {
        config.report_dir = Some(cli.log_dir.join("reports"));
    }
    Ok(config)
}

fn build_context(cli: &Cli) -> anyhow::Result<MemoryContext> {
    Ok(MemoryContext::new(load_config(cli)?)?)
}

fn status_command(cli: &Cli) -> anyhow::Result<()> {
    let ctx = build_context(cli)?;
    let status = ctx.get_memory_status();
    let level = ctx.monitor().pressure_level(&status);

    println!("{}", serde_json::to_string_pretty(&status)?);
    println!(
        "pressure: {:?} (rss {:.1} MB of {} MB budget)",
        level,
        status.process_rss_mb,
        ctx.config().monitor.budget_mb
    );
    Ok(())
}

async fn daemon_command(cli: &Cli, status_interval: u64) -> anyhow::Result<()> {
    info!(version = %memwarden::VERSION, "memwarden starting");

    let ctx = MemoryContext::new(load_config(cli)?)?;
    ctx.start_background_tasks()?;
    info!(tasks = ?ctx.running_tasks(), "Engine running, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                break;
            }
            _ = ticker.tick() => {
                let status = ctx.get_memory_status();
                let registry = ctx.registry().stats();
                info!(
                    rss_mb = status.process_rss_mb,
                    level = ?ctx.monitor().pressure_level(&status),
                    resources = registry.resource_count,
                    registered_mb = registry.total_size_mb,
                    blocks = ctx.allocator().len(),
                    snapshots = ctx.snapshots().len(),
                    "Engine status"
                );
            }
        }
    }

    info!("Shutting down");
    ctx.shutdown();
    Ok(())
}

fn compact_command(cli: &Cli) -> anyhow::Result<()> {
    let ctx = build_context(cli)?;
    match ctx.compact_memory() {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("compaction already in progress"),
    }
    Ok(())
}

fn compress_demo_command(cli: &Cli, size_mb: usize) -> anyhow::Result<()> {
    let ctx = build_context(cli)?;
    let allocator = ctx.allocator();

    let pattern = b"memwarden block compression ";
    let data: Vec<u8> = pattern
        .iter()
        .copied()
        .cycle()
        .take(size_mb * 1024 * 1024)
        .collect();

    let started = Instant::now();
    let block = allocator.malloc_from(data)?;
    allocator.compress_idle_blocks(Some(Duration::ZERO));
    info!(
        block = %block,
        state = ?allocator.block_state(block),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Demo buffer allocated"
    );

    let view = allocator.access(block)?;
    let intact = view
        .chunks(pattern.len())
        .all(|chunk| pattern.starts_with(chunk));
    drop(view);

    println!("{}", serde_json::to_string_pretty(&ctx.get_compression_stats())?);
    println!("round trip intact: {}", intact);
    allocator.free(block);
    Ok(())
}
