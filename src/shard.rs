use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::debug;

use crate::clock;

/// One daily shard file: the unit of parallel work. The date is derived from
/// the filename and used only for inclusion filtering and reduction-path
/// derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub path: PathBuf,
    pub date: NaiveDate,
}

impl ShardDescriptor {
    /// Derive a descriptor from a path. The 8 characters immediately before
    /// the extension must encode a UTC calendar date (`YYYYMMDD`). Hidden
    /// files and files without a parsable date yield `None`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }

        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let bytes = stem.as_bytes();
        if bytes.len() < 8 {
            return None;
        }

        let tail = &bytes[bytes.len() - 8..];
        if !tail.iter().all(u8::is_ascii_digit) {
            return None;
        }

        let digits = std::str::from_utf8(tail).ok()?;
        let date = clock::parse_compact_date(digits).ok()?;

        Some(Self {
            path: path.to_path_buf(),
            date,
        })
    }
}

/// Enumerate candidate shards in `data_dir`, keeping only those whose date
/// lies in the inclusive `[start, end]` range (either bound optional).
/// Sorted by path so submission order is deterministic; completion order is
/// not.
pub fn enumerate(
    data_dir: &Path,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<ShardDescriptor>> {
    let entries = std::fs::read_dir(data_dir)
        .with_context(|| format!("listing shard directory {}", data_dir.display()))?;

    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.context("reading shard directory entry")?;
        if !entry.file_type().context("reading file type")?.is_file() {
            continue;
        }

        let path = entry.path();
        let Some(shard) = ShardDescriptor::from_path(&path) else {
            debug!(path = %path.display(), "skipping non-shard file");
            continue;
        };

        if start.is_some_and(|s| shard.date < s) {
            continue;
        }
        if end.is_some_and(|e| shard.date > e) {
            continue;
        }

        shards.push(shard);
    }

    shards.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_date_parsed_from_filename() {
        let shard =
            ShardDescriptor::from_path(Path::new("/data/events_20200115.gz")).expect("parses");
        assert_eq!(shard.date, date(2020, 1, 15));
    }

    #[test]
    fn test_hidden_files_skipped() {
        assert!(ShardDescriptor::from_path(Path::new("/data/.events_20200115.gz")).is_none());
    }

    #[test]
    fn test_dateless_files_skipped() {
        assert!(ShardDescriptor::from_path(Path::new("/data/readme.txt")).is_none());
        assert!(ShardDescriptor::from_path(Path::new("/data/events_2020.gz")).is_none());
        assert!(ShardDescriptor::from_path(Path::new("/data/events_2020011x.gz")).is_none());
    }

    #[test]
    fn test_range_filter_inclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "events_20200101.gz",
            "events_20200115.gz",
            "events_20200131.gz",
            "events_20200201.gz",
            ".hidden_20200115.gz",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let january = enumerate(
            dir.path(),
            Some(date(2020, 1, 1)),
            Some(date(2020, 1, 31)),
        )
        .expect("enumerates");
        let dates: Vec<NaiveDate> = january.iter().map(|s| s.date).collect();
        assert_eq!(
            dates,
            vec![date(2020, 1, 1), date(2020, 1, 15), date(2020, 1, 31)]
        );

        let february = enumerate(
            dir.path(),
            Some(date(2020, 2, 1)),
            Some(date(2020, 2, 28)),
        )
        .expect("enumerates");
        assert_eq!(february.len(), 1);
        assert_eq!(february[0].date, date(2020, 2, 1));
    }

    #[test]
    fn test_open_ended_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a_20200110.gz", "a_20200120.gz"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let all = enumerate(dir.path(), None, None).expect("enumerates");
        assert_eq!(all.len(), 2);

        let from = enumerate(dir.path(), Some(date(2020, 1, 15)), None).expect("enumerates");
        assert_eq!(from.len(), 1);
        assert_eq!(from[0].date, date(2020, 1, 20));

        let until = enumerate(dir.path(), None, Some(date(2020, 1, 15))).expect("enumerates");
        assert_eq!(until.len(), 1);
        assert_eq!(until[0].date, date(2020, 1, 10));
    }
}
