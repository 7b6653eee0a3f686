use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use aggregoor::config::Config;
use aggregoor::pipeline::{self, Pipeline};
use aggregoor::plugin::PluginRegistry;

/// Batch aggregation pipeline for daily telemetry log shards.
#[derive(Parser)]
#[command(name = "aggregoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Directory holding the daily shard files (overrides config).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for per-day aggregate files (overrides config).
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Plugin driving the run (overrides config).
    #[arg(long)]
    plugin: Option<String>,

    /// First shard date to include, YYYYMMDD (overrides config).
    #[arg(long)]
    start_date: Option<String>,

    /// Last shard date to include, YYYYMMDD (overrides config).
    #[arg(long)]
    end_date: Option<String>,

    /// Worker process count (overrides config).
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Process one shard and write the encoded snapshot to stdout.
    /// Spawned by the worker pool; not part of the public CLI.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        plugin: String,
        shard: PathBuf,
    },

    /// Reduce one saved day file in place.
    /// Spawned by the worker pool; not part of the public CLI.
    #[command(hide = true)]
    Reduce {
        #[arg(long)]
        plugin: String,
        file: PathBuf,
    },
}

/// Build-time version info, injected via the GIT_COMMIT env var at build
/// time.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

/// Initialize tracing. Worker and reduce subcommands log to stderr so the
/// process's stdout stays a clean payload channel.
fn init_tracing(level: &str, to_stderr: bool) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("aggregoor {}", version::full());
        return Ok(());
    }

    // Worker and reduce jobs run inside pool-spawned child processes with a
    // fixed plugin and file; they never read the config.
    match &cli.command {
        Some(Command::Worker { plugin, shard }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"), true)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            pipeline::run_worker_job(&PluginRegistry::builtin(), plugin, shard, &mut out)?;
            out.flush().context("flushing worker payload")?;
            return Ok(());
        }
        Some(Command::Reduce { plugin, file }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"), true)?;
            return pipeline::run_reduce_job(&PluginRegistry::builtin(), plugin, file);
        }
        _ => {}
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // CLI flags override file values.
    if let Some(log_level) = cli.log_level {
        cfg.log_level = log_level;
    }
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(results_dir) = cli.results_dir {
        cfg.results_dir = results_dir;
    }
    if let Some(plugin) = cli.plugin {
        cfg.plugin = plugin;
    }
    if let Some(start_date) = cli.start_date {
        cfg.start_date = Some(start_date);
    }
    if let Some(end_date) = cli.end_date {
        cfg.end_date = Some(end_date);
    }
    if let Some(workers) = cli.workers {
        cfg.worker_count = Some(workers);
    }
    cfg.validate()?;

    init_tracing(&cfg.log_level, false)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting aggregoor",
    );

    let pipeline = Pipeline::new(cfg)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let report = pipeline.run(&mut out)?;

    tracing::info!("aggregoor finished");

    if report.shards_failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
