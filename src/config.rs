use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::clock;

/// Top-level configuration for one aggregation run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the daily shard files.
    #[serde(default)]
    pub data_dir: PathBuf,

    /// Directory for per-day aggregate files and reports. Default: "stats".
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Name of the plugin driving this run.
    #[serde(default)]
    pub plugin: String,

    /// First shard date to include (`YYYYMMDD`, inclusive).
    #[serde(default)]
    pub start_date: Option<String>,

    /// Last shard date to include (`YYYYMMDD`, inclusive).
    #[serde(default)]
    pub end_date: Option<String>,

    /// Worker process count. Default: three quarters of the CPU count.
    #[serde(default)]
    pub worker_count: Option<usize>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("stats")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: PathBuf::new(),
            results_dir: default_results_dir(),
            plugin: String::new(),
            start_date: None,
            end_date: None,
            worker_count: None,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Validation is separate so CLI
    /// overrides can fill required fields first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir is required");
        }

        if self.plugin.is_empty() {
            bail!("plugin is required");
        }

        if self.worker_count == Some(0) {
            bail!("worker_count must be positive");
        }

        let (start, end) = self.date_range()?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                bail!("start_date {start} is after end_date {end}");
            }
        }

        Ok(())
    }

    /// The inclusive shard date range, parsed from the `YYYYMMDD` fields.
    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let start = self
            .start_date
            .as_deref()
            .map(clock::parse_compact_date)
            .transpose()
            .context("parsing start_date (expected YYYYMMDD)")?;
        let end = self
            .end_date
            .as_deref()
            .map(clock::parse_compact_date)
            .transpose()
            .context("parsing end_date (expected YYYYMMDD)")?;
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            data_dir: PathBuf::from("/data/shards"),
            plugin: "count_users_and_events".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.results_dir, PathBuf::from("stats"));
        assert_eq!(cfg.worker_count, None);
    }

    #[test]
    fn test_validation_missing_data_dir() {
        let cfg = Config {
            plugin: "count_users_and_events".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("data_dir"));
    }

    #[test]
    fn test_validation_missing_plugin() {
        let cfg = Config {
            data_dir: PathBuf::from("/data/shards"),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("plugin"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut cfg = valid_config();
        cfg.worker_count = Some(0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn test_validation_inverted_date_range() {
        let mut cfg = valid_config();
        cfg.start_date = Some("20200201".to_string());
        cfg.end_date = Some("20200101".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("after end_date"));
    }

    #[test]
    fn test_date_range_parses_compact_dates() {
        let mut cfg = valid_config();
        cfg.start_date = Some("20200101".to_string());
        cfg.end_date = Some("20200131".to_string());

        let (start, end) = cfg.date_range().expect("parses");
        assert_eq!(start, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(end, NaiveDate::from_ymd_opt(2020, 1, 31));
    }

    #[test]
    fn test_date_range_rejects_garbage() {
        let mut cfg = valid_config();
        cfg.start_date = Some("January 1st".to_string());
        assert!(cfg.date_range().is_err());
        assert!(cfg.validate().is_err());

        // Truncated digit runs must not parse as a shorter date.
        cfg.start_date = Some("2020011".to_string());
        assert!(cfg.date_range().is_err());
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "data_dir: /data/shards\nplugin: count_users_and_events\nworker_count: 2\n",
        )
        .expect("write");

        let cfg = Config::load(&path).expect("loads");
        assert_eq!(cfg.data_dir, PathBuf::from("/data/shards"));
        assert_eq!(cfg.worker_count, Some(2));
        assert_eq!(cfg.log_level, "info");
    }
}
