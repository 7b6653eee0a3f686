//! Run orchestration: enumerate shards, fan them out to the worker-process
//! pool, merge partial results, reduce, report.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::aggregate::daily_fs::DailyFsAggregator;
use crate::aggregate::Aggregator;
use crate::codec::Snapshot;
use crate::config::Config;
use crate::plugin::{Plugin, PluginRegistry};
use crate::pool::{default_worker_count, Job, JobOutcome, WorkerPool};
use crate::shard;
use crate::stats::{render_section, Section};
use crate::worker;

/// Outcome accounting for one run. Failed shards never abort the run; they
/// are counted here and surfaced in the final report.
#[derive(Debug, Default)]
pub struct RunReport {
    pub shards_total: usize,
    pub shards_ok: usize,
    pub shards_failed: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl RunReport {
    fn record_ok(&mut self) {
        self.shards_ok += 1;
    }

    fn record_failure(&mut self, path: PathBuf, reason: String) {
        self.shards_failed += 1;
        self.failures.push((path, reason));
    }

    /// The run summary as a report section: totals, then one row per failed
    /// shard.
    pub fn summary_section(&self) -> Section {
        let mut rows = vec![vec![
            self.shards_total.to_string(),
            self.shards_ok.to_string(),
            self.shards_failed.to_string(),
        ]];
        for (path, reason) in &self.failures {
            rows.push(vec![path.display().to_string(), reason.clone()]);
        }
        Section {
            header: "Run summary\nShards\tOk\tFailed".to_string(),
            rows,
        }
    }
}

/// One configured aggregation run over a shard directory.
pub struct Pipeline {
    config: Config,
    registry: PluginRegistry,
    worker_exe: PathBuf,
}

impl Pipeline {
    /// Build a pipeline re-invoking the current executable for worker jobs.
    pub fn new(config: Config) -> Result<Self> {
        let worker_exe = std::env::current_exe().context("resolving current executable")?;
        Ok(Self::with_worker_exe(
            config,
            PluginRegistry::builtin(),
            worker_exe,
        ))
    }

    /// Build a pipeline with an explicit registry and worker executable.
    /// Integration tests use this to point at the compiled binary.
    pub fn with_worker_exe(
        config: Config,
        registry: PluginRegistry,
        worker_exe: PathBuf,
    ) -> Self {
        Self {
            config,
            registry,
            worker_exe,
        }
    }

    /// Execute the run end to end, writing reports to `out`. The pool is
    /// torn down on every exit path, including errors.
    pub fn run(&self, out: &mut dyn Write) -> Result<RunReport> {
        self.config.validate()?;
        let (start, end) = self.config.date_range()?;

        let shards = shard::enumerate(&self.config.data_dir, start, end)?;
        info!(
            shards = shards.len(),
            data_dir = %self.config.data_dir.display(),
            plugin = %self.config.plugin,
            "starting aggregation run",
        );

        let plugin = self.registry.get(&self.config.plugin)?;
        // Surfaces registration errors before any worker process is spawned.
        plugin.new_processor()?;
        let mut aggregator = plugin.new_aggregator(&self.config.results_dir)?;

        let worker_count = self.config.worker_count.unwrap_or_else(default_worker_count);
        let mut pool = WorkerPool::spawn(worker_count, self.job_launcher(&plugin))?;

        let mut report = RunReport {
            shards_total: shards.len(),
            ..Default::default()
        };
        let outcome = self.drive(&mut pool, &shards, aggregator.as_mut(), &mut report);
        pool.shutdown();
        outcome?;

        if let Some(mut stats) = plugin.stats(aggregator.as_ref()) {
            stats.process_stats().context("collecting stats")?;
            crate::stats::print_stats(stats.as_ref(), out).context("rendering stats")?;
        }
        render_section(&report.summary_section(), out).context("rendering run summary")?;

        info!(
            ok = report.shards_ok,
            failed = report.shards_failed,
            "aggregation run finished",
        );
        Ok(report)
    }

    /// Child command factory handed to the pool: a re-invocation of the
    /// pipeline executable's hidden `worker` / `reduce` subcommands.
    fn job_launcher(&self, plugin: &Arc<dyn Plugin>) -> impl Fn(&Job) -> Command {
        let exe = self.worker_exe.clone();
        let plugin = plugin.name();
        move |job| {
            let mut command = Command::new(&exe);
            match job {
                Job::Map(shard) => {
                    command.arg("worker").arg("--plugin").arg(plugin).arg(&shard.path);
                }
                Job::Reduce(path) => {
                    command.arg("reduce").arg("--plugin").arg(plugin).arg(path);
                }
            }
            command
        }
    }

    /// Map phase plus plugin post-aggregation, with the pool borrowed for
    /// both. Split out so `run` can tear the pool down regardless of errors.
    fn drive(
        &self,
        pool: &mut WorkerPool,
        shards: &[shard::ShardDescriptor],
        aggregator: &mut dyn Aggregator,
        report: &mut RunReport,
    ) -> Result<()> {
        for shard in shards {
            pool.submit(Job::Map(shard.clone()))?;
        }

        for _ in 0..shards.len() {
            match pool.next_outcome()? {
                JobOutcome::Completed { job, payload } => {
                    let merged = Snapshot::decode(&payload)
                        .context("decoding worker snapshot")
                        .and_then(|snapshot| aggregator.aggregate(snapshot));
                    match merged {
                        Ok(()) => report.record_ok(),
                        Err(err) => {
                            let reason = format!("{err:#}");
                            error!(path = %job.path().display(), reason, "bad shard result");
                            report.record_failure(job.path().to_path_buf(), reason);
                        }
                    }
                }
                JobOutcome::Failed { job, reason } => {
                    warn!(path = %job.path().display(), reason, "shard failed");
                    report.record_failure(job.path().to_path_buf(), reason);
                }
            }
        }

        aggregator
            .post_aggregate(Some(pool))
            .context("post-aggregation")
    }
}

/// Body of the hidden `worker` subcommand: process one shard and write the
/// encoded snapshot to `out` (the process's stdout).
pub fn run_worker_job(
    registry: &PluginRegistry,
    plugin_name: &str,
    shard_path: &Path,
    out: &mut dyn Write,
) -> Result<()> {
    let plugin = registry.get(plugin_name)?;
    let mut processor = plugin.new_processor()?;
    let payload = worker::run_shard(shard_path, processor.as_mut())?;
    out.write_all(&payload).context("writing worker payload")?;
    Ok(())
}

/// Body of the hidden `reduce` subcommand: reduce one saved day file in
/// place with the plugin's reduction strategy.
pub fn run_reduce_job(registry: &PluginRegistry, plugin_name: &str, file: &Path) -> Result<()> {
    let plugin = registry.get(plugin_name)?;
    DailyFsAggregator::reduce_day_file(file, plugin.reduction().as_ref())
}
