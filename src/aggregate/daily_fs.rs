//! Filesystem-partitioned aggregator.
//!
//! Map phase: each shard's per-day entries are appended to one file per
//! calendar day under `results_dir/<year>/<month>/<day>` (components
//! unpadded). Reduce phase: every day file is read back, merged by the
//! plugin's reduction strategy and rewritten in place. No two reduce jobs
//! touch the same file, so no locking is needed.

use std::any::Any;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::clock::DayKey;
use crate::codec::{self, Key, Snapshot, Value};
use crate::pool::{Job, JobOutcome, WorkerPool};

use super::{Aggregator, ReductionStrategy};

/// Snapshot field the filesystem aggregator consumes: a mapping from
/// `dtYYYYMMDD` day keys to that day's local key-value state.
pub const DAY_STATE_FIELD: &str = "data_per_days";

pub struct DailyFsAggregator {
    results_dir: PathBuf,
    created_dirs: HashSet<PathBuf>,
    reduction: Box<dyn ReductionStrategy>,
}

impl DailyFsAggregator {
    /// Create the aggregator, clearing any previous run's output under
    /// `results_dir`.
    pub fn new(results_dir: &Path, reduction: Box<dyn ReductionStrategy>) -> Self {
        let _ = fs::remove_dir_all(results_dir);
        Self {
            results_dir: results_dir.to_path_buf(),
            created_dirs: HashSet::new(),
            reduction,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Path of the day file for `day`, creating its month directory on
    /// first use. Creation attempts are memoized per directory.
    fn day_file_path(&mut self, day: NaiveDate) -> Result<PathBuf> {
        let month_dir = self
            .results_dir
            .join(day.year().to_string())
            .join(day.month().to_string());

        if !self.created_dirs.contains(&month_dir) {
            fs::create_dir_all(&month_dir)
                .with_context(|| format!("creating {}", month_dir.display()))?;
            self.created_dirs.insert(month_dir.clone());
        }

        Ok(month_dir.join(day.day().to_string()))
    }

    /// Recover the calendar date encoded in a day file's path (the last
    /// three components, zero-filled).
    pub fn extract_date_from_path(path: &Path) -> Option<NaiveDate> {
        let mut parts = path
            .components()
            .rev()
            .filter_map(|c| c.as_os_str().to_str());
        let day = parts.next()?;
        let month = parts.next()?;
        let year = parts.next()?;

        let compact = format!("{year:0>4}{month:0>2}{day:0>2}");
        crate::clock::parse_compact_date(&compact).ok()
    }

    /// Append (or overwrite) serialized entries, one JSON line each.
    pub fn save_entries<'a>(
        path: &Path,
        entries: impl IntoIterator<Item = (&'a Key, &'a Value)>,
        append: bool,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("opening day file {}", path.display()))?;
        let mut out = BufWriter::new(file);

        for (key, value) in entries {
            let line = codec::encode_entry(key, value)
                .with_context(|| format!("encoding entry for {}", path.display()))?;
            out.write_all(&line)?;
            out.write_all(b"\n")?;
        }

        out.flush().context("flushing day file")?;
        Ok(())
    }

    /// Read back all appended entries of one day file.
    pub fn load_entries(path: &Path) -> Result<Vec<(Key, Value)>> {
        let file =
            File::open(path).with_context(|| format!("opening day file {}", path.display()))?;

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("reading day file line")?;
            if line.is_empty() {
                continue;
            }
            entries.push(
                codec::decode_entry(&line)
                    .with_context(|| format!("decoding entry in {}", path.display()))?,
            );
        }
        Ok(entries)
    }

    /// Reduce one day file in place: read all appended entries, merge them
    /// with `reduction`, overwrite the file with the merged result.
    pub fn reduce_day_file(path: &Path, reduction: &dyn ReductionStrategy) -> Result<()> {
        let entries = Self::load_entries(path)?;
        let before = entries.len();

        let reduced = reduction.reduce(entries);
        Self::save_entries(path, reduced.iter().map(|(k, v)| (k, v)), false)?;

        debug!(
            path = %path.display(),
            before,
            after = reduced.len(),
            strategy = reduction.name(),
            "day file reduced",
        );
        Ok(())
    }

    /// All saved day files under `results_dir`, discovered by a recursive
    /// walk. Order is unspecified.
    pub fn saved_day_files(results_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if results_dir.exists() {
            walk(results_dir, &mut files)?;
        }
        Ok(files)
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("walking {}", dir.display()))?;
    for entry in entries {
        let entry = entry.context("reading results directory entry")?;
        let path = entry.path();
        if entry.file_type().context("reading file type")?.is_dir() {
            walk(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

impl Aggregator for DailyFsAggregator {
    fn aggregate(&mut self, snapshot: Snapshot) -> Result<()> {
        let Some(Value::Map(per_day)) = snapshot.field(DAY_STATE_FIELD) else {
            bail!("worker snapshot has no {DAY_STATE_FIELD} mapping");
        };

        for (day_key, day_state) in per_day {
            let Key::Str(raw) = day_key else {
                bail!("day key {day_key} is not a dt-string");
            };
            let day: DayKey = raw
                .parse()
                .with_context(|| format!("bad day key {raw:?}"))?;

            let Value::Map(state) = day_state else {
                bail!("day state for {raw} is not a mapping");
            };

            let path = self.day_file_path(day.0)?;
            Self::save_entries(&path, state.iter(), true)?;
        }
        Ok(())
    }

    fn post_aggregate(&mut self, pool: Option<&mut WorkerPool>) -> Result<()> {
        let files = Self::saved_day_files(&self.results_dir)?;
        info!(days = files.len(), "reducing saved day files");

        match pool {
            Some(pool) => {
                let mut submitted = 0usize;
                for file in files {
                    pool.submit(Job::Reduce(file))?;
                    submitted += 1;
                }
                // A failed reduction leaves duplicate appended entries that
                // stats would render as valid rows, so it fails the run.
                let mut failed = 0usize;
                for _ in 0..submitted {
                    if let JobOutcome::Failed { job, reason } = pool.next_outcome()? {
                        warn!(path = %job.path().display(), reason, "day reduction failed");
                        failed += 1;
                    }
                }
                if failed > 0 {
                    bail!("{failed} of {submitted} day file reductions failed");
                }
            }
            None => {
                for file in &files {
                    Self::reduce_day_file(file, self.reduction.as_ref())?;
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::aggregate::LastWriteWins;

    fn snapshot_with_day(day: &str, entries: &[(&str, i64)]) -> Snapshot {
        let mut state = BTreeMap::new();
        for (key, value) in entries {
            state.insert(Key::str(*key), Value::Int(*value));
        }
        let mut per_day = BTreeMap::new();
        per_day.insert(Key::str(day), Value::Map(state));
        Snapshot::new(vec![(DAY_STATE_FIELD.to_string(), Value::Map(per_day))])
    }

    #[test]
    fn test_aggregate_appends_to_day_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        let mut agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));

        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 1)]))
            .expect("aggregates");
        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 2), ("b", 3)]))
            .expect("aggregates");

        let day_file = results.join("2020").join("1").join("15");
        let entries = DailyFsAggregator::load_entries(&day_file).expect("loads");
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_post_aggregate_reduces_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        let mut agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));

        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 1)]))
            .expect("aggregates");
        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 2)]))
            .expect("aggregates");
        agg.post_aggregate(None).expect("reduces");

        let day_file = results.join("2020").join("1").join("15");
        let entries = DailyFsAggregator::load_entries(&day_file).expect("loads");
        assert_eq!(entries, vec![(Key::str("a"), Value::Int(2))]);
    }

    #[test]
    fn test_new_clears_previous_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        fs::create_dir_all(results.join("2019").join("5")).expect("mkdir");
        fs::write(results.join("2019").join("5").join("1"), b"stale").expect("write");

        let _agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));
        let files = DailyFsAggregator::saved_day_files(&results).expect("walks");
        assert!(files.is_empty());
    }

    #[test]
    fn test_date_round_trips_through_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        let mut agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));

        agg.aggregate(snapshot_with_day("dt20200105", &[("k", 1)]))
            .expect("aggregates");

        let files = DailyFsAggregator::saved_day_files(&results).expect("walks");
        assert_eq!(files.len(), 1);
        assert_eq!(
            DailyFsAggregator::extract_date_from_path(&files[0]),
            Some(NaiveDate::from_ymd_opt(2020, 1, 5).expect("valid date")),
        );
    }

    #[test]
    fn test_pooled_reduce_failure_fails_the_run() {
        use std::process::Command;

        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        let mut agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));

        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 1)]))
            .expect("aggregates");

        let mut pool = WorkerPool::spawn(1, |_job| {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exit 1");
            cmd
        })
        .expect("spawns");

        let err = agg
            .post_aggregate(Some(&mut pool))
            .expect_err("failed reduction must surface");
        assert!(err.to_string().contains("reductions failed"));
        pool.shutdown();

        // The unreduced day file is untouched, duplicates and all.
        agg.aggregate(snapshot_with_day("dt20200115", &[("a", 2)]))
            .expect("aggregates");
        let day_file = results.join("2020").join("1").join("15");
        let entries = DailyFsAggregator::load_entries(&day_file).expect("loads");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_snapshot_without_day_state_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut agg =
            DailyFsAggregator::new(&dir.path().join("stats"), Box::new(LastWriteWins));
        let snapshot = Snapshot::new(vec![("other".to_string(), Value::Int(1))]);
        assert!(agg.aggregate(snapshot).is_err());
    }
}
