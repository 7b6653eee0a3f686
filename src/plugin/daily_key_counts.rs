//! Built-in plugin counting selected events per day, persisted through the
//! filesystem-partitioned aggregator. Demonstrates declared variants, the
//! pairs payload shape and an additive reduction strategy.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;

use crate::aggregate::daily_fs::{DailyFsAggregator, DAY_STATE_FIELD};
use crate::aggregate::{Aggregator, ReductionStrategy};
use crate::clock::DayKey;
use crate::codec::{Key, Value};
use crate::event::{Event, EventHandler, EventRegistry, EventVariant, PayloadShape};
use crate::stats::{DailyFsStats, Section, StatsProcessor, Subscriber};
use crate::worker::{EventPipeline, ShardProcessor, StateSnapshot};

use super::Plugin;

const HEADER: &str = "Selected events by days\nDate\tEvent\tCount";

/// Per-shard accumulator: day → event label → occurrence count.
#[derive(Debug, Default)]
pub struct KeyCountHandler {
    days: BTreeMap<DayKey, BTreeMap<String, i64>>,
}

impl KeyCountHandler {
    fn bump(&mut self, event: &Event, label: String) {
        if !event.time.is_accurate {
            return;
        }
        *self
            .days
            .entry(DayKey::of(&event.time.time))
            .or_default()
            .entry(label)
            .or_default() += 1;
    }

    fn on_poi_selected(&mut self, event: &Event) {
        // The pairs payload carries the mark type; fold it into the label so
        // map pins and bookmarks count separately.
        let label = match event.payload.pairs().and_then(|p| p.get("type")) {
            Some(mark_type) => format!("poi:{mark_type}"),
            None => "poi".to_string(),
        };
        self.bump(event, label);
    }

    fn on_search(&mut self, event: &Event) {
        self.bump(event, "search".to_string());
    }
}

impl EventHandler for KeyCountHandler {}

impl StateSnapshot for KeyCountHandler {
    fn snapshot_fields(&self) -> Vec<(String, Value)> {
        let mut per_day = BTreeMap::new();
        for (day, counts) in &self.days {
            let state = counts
                .iter()
                .map(|(label, count)| (Key::Str(label.clone()), Value::Int(*count)))
                .collect();
            per_day.insert(Key::Str(day.to_string()), Value::Map(state));
        }
        vec![(DAY_STATE_FIELD.to_string(), Value::Map(per_day))]
    }
}

fn variants() -> Vec<EventVariant<KeyCountHandler>> {
    vec![
        EventVariant {
            name: "poi_selected",
            keys: &["$GetUserMark", "$SelectMapObject"],
            shape: PayloadShape::Pairs,
            dispatch: KeyCountHandler::on_poi_selected,
        },
        EventVariant {
            name: "search",
            keys: &["$Search"],
            shape: PayloadShape::Raw,
            dispatch: KeyCountHandler::on_search,
        },
    ]
}

/// Integer entries from different shards add up; anything else keeps the
/// last appended occurrence.
pub struct SumInts;

impl ReductionStrategy for SumInts {
    fn name(&self) -> &'static str {
        "sum_ints"
    }

    fn reduce(&self, entries: Vec<(Key, Value)>) -> Vec<(Key, Value)> {
        let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
        for (key, value) in entries {
            match (merged.get_mut(&key), value) {
                (Some(Value::Int(total)), Value::Int(count)) => *total += count,
                (_, value) => {
                    merged.insert(key, value);
                }
            }
        }
        merged.into_iter().collect()
    }
}

#[derive(Default)]
struct KeyCountRows {
    rows: Vec<Vec<String>>,
}

impl Subscriber for KeyCountRows {
    fn collect(&mut self, day: NaiveDate, entries: &[(Key, Value)]) {
        let day = DayKey(day).to_string();
        for (key, value) in entries {
            if let Value::Int(count) = value {
                self.rows
                    .push(vec![day.clone(), key.to_string(), count.to_string()]);
            }
        }
    }

    fn section(&self) -> Section {
        Section {
            header: HEADER.to_string(),
            rows: self.rows.clone(),
        }
    }
}

pub struct DailyKeyCounts;

impl Plugin for DailyKeyCounts {
    fn name(&self) -> &'static str {
        "daily_key_counts"
    }

    fn new_processor(&self) -> Result<Box<dyn ShardProcessor>> {
        let registry = EventRegistry::new(&variants())?;
        Ok(Box::new(EventPipeline::new(
            registry,
            KeyCountHandler::default(),
        )))
    }

    fn new_aggregator(&self, results_dir: &Path) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(DailyFsAggregator::new(
            results_dir,
            self.reduction(),
        )))
    }

    fn reduction(&self) -> Box<dyn ReductionStrategy> {
        Box::new(SumInts)
    }

    fn stats(&self, aggregator: &dyn Aggregator) -> Option<Box<dyn StatsProcessor>> {
        let aggregator = aggregator.as_any().downcast_ref::<DailyFsAggregator>()?;
        Some(Box::new(DailyFsStats::new(
            aggregator.results_dir().to_path_buf(),
            vec![Box::<KeyCountRows>::default()],
        )))
    }
}
