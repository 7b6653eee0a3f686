//! Report generation over the finalized aggregate.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::aggregate::daily_fs::DailyFsAggregator;
use crate::codec::{Key, Value};

/// Width of the divider line around each report header.
pub const DIVIDER_WIDTH: usize = 20;

/// One labeled tabular report: a header block and tab-joined rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub header: String,
    pub rows: Vec<Vec<String>>,
}

/// Produces the run's report sections from the finalized aggregate.
pub trait StatsProcessor {
    /// Optional collection pass before rendering (e.g. re-reading persisted
    /// day files).
    fn process_stats(&mut self) -> Result<()> {
        Ok(())
    }

    fn gen_stats(&self) -> Vec<Section>;
}

/// Render every section of a processor, in registration order.
pub fn print_stats(processor: &dyn StatsProcessor, out: &mut dyn Write) -> Result<()> {
    for section in processor.gen_stats() {
        render_section(&section, out)?;
    }
    Ok(())
}

/// Render one section: divider, header, divider, rows, blank line.
pub fn render_section(section: &Section, out: &mut dyn Write) -> Result<()> {
    let divider = "-".repeat(DIVIDER_WIDTH);
    writeln!(out, "{divider}")?;
    writeln!(out, "{}", section.header)?;
    writeln!(out, "{divider}")?;
    for row in &section.rows {
        writeln!(out, "{}", row.join("\t"))?;
    }
    writeln!(out)?;
    Ok(())
}

/// A pluggable stats collector: sees every saved day once, then produces
/// one report section.
pub trait Subscriber {
    fn collect(&mut self, day: NaiveDate, entries: &[(Key, Value)]);

    fn section(&self) -> Section;
}

/// Stats processor over the filesystem-partitioned aggregate: feeds saved
/// day files to every subscriber in ascending date order.
pub struct DailyFsStats {
    results_dir: PathBuf,
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl DailyFsStats {
    pub fn new(results_dir: PathBuf, subscribers: Vec<Box<dyn Subscriber>>) -> Self {
        Self {
            results_dir,
            subscribers,
        }
    }
}

impl StatsProcessor for DailyFsStats {
    fn process_stats(&mut self) -> Result<()> {
        let mut days: Vec<(NaiveDate, PathBuf)> =
            DailyFsAggregator::saved_day_files(&self.results_dir)?
                .into_iter()
                .filter_map(|path| {
                    DailyFsAggregator::extract_date_from_path(&path).map(|date| (date, path))
                })
                .collect();
        days.sort();

        for (day, path) in days {
            let entries = DailyFsAggregator::load_entries(&path)
                .with_context(|| format!("loading day {day}"))?;
            for subscriber in &mut self.subscribers {
                subscriber.collect(day, &entries);
            }
        }
        Ok(())
    }

    fn gen_stats(&self) -> Vec<Section> {
        self.subscribers.iter().map(|s| s.section()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Section>);

    impl StatsProcessor for Fixed {
        fn gen_stats(&self) -> Vec<Section> {
            self.0.clone()
        }
    }

    #[test]
    fn test_render_section_format() {
        let section = Section {
            header: "Users & Events by days\nDate\tUsers\tEvents".to_string(),
            rows: vec![
                vec!["dt20200115".to_string(), "2".to_string(), "3".to_string()],
                vec!["dt20200116".to_string(), "1".to_string(), "5".to_string()],
            ],
        };

        let mut out = Vec::new();
        render_section(&section, &mut out).expect("renders");
        let text = String::from_utf8(out).expect("utf8");

        let divider = "-".repeat(20);
        let expected = format!(
            "{divider}\nUsers & Events by days\nDate\tUsers\tEvents\n{divider}\n\
             dt20200115\t2\t3\ndt20200116\t1\t5\n\n"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_sections_render_in_registration_order() {
        let processor = Fixed(vec![
            Section {
                header: "first".to_string(),
                rows: vec![],
            },
            Section {
                header: "second".to_string(),
                rows: vec![],
            },
        ]);

        let mut out = Vec::new();
        print_stats(&processor, &mut out).expect("renders");
        let text = String::from_utf8(out).expect("utf8");

        let first = text.find("first").expect("first present");
        let second = text.find("second").expect("second present");
        assert!(first < second);
    }

    #[test]
    fn test_daily_fs_stats_feeds_days_in_order() {
        use crate::aggregate::{Aggregator, LastWriteWins};
        use crate::codec::Snapshot;
        use std::collections::BTreeMap;

        struct DayRecorder(Vec<NaiveDate>);

        impl Subscriber for DayRecorder {
            fn collect(&mut self, day: NaiveDate, _entries: &[(Key, Value)]) {
                self.0.push(day);
            }

            fn section(&self) -> Section {
                Section {
                    header: "days".to_string(),
                    rows: self.0.iter().map(|d| vec![d.to_string()]).collect(),
                }
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let results = dir.path().join("stats");
        let mut agg = DailyFsAggregator::new(&results, Box::new(LastWriteWins));

        for day in ["dt20200120", "dt20200105", "dt20200110"] {
            let mut state = BTreeMap::new();
            state.insert(Key::str("k"), Value::Int(1));
            let mut per_day = BTreeMap::new();
            per_day.insert(Key::str(day), Value::Map(state));
            agg.aggregate(Snapshot::new(vec![(
                crate::aggregate::daily_fs::DAY_STATE_FIELD.to_string(),
                Value::Map(per_day),
            )]))
            .expect("aggregates");
        }

        let mut stats = DailyFsStats::new(results, vec![Box::new(DayRecorder(Vec::new()))]);
        stats.process_stats().expect("collects");

        let rows = &stats.gen_stats()[0].rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "2020-01-05");
        assert_eq!(rows[1][0], "2020-01-10");
        assert_eq!(rows[2][0], "2020-01-20");
    }
}
