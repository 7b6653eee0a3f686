//! Built-in plugin counting distinct users and events per day, in memory.
//! The smallest complete example of the worker / aggregator / stats triple.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::aggregate::Aggregator;
use crate::clock::DayKey;
use crate::codec::{Key, Snapshot, Value};
use crate::event::{Event, EventHandler, EventRegistry};
use crate::stats::{Section, StatsProcessor};
use crate::worker::{EventPipeline, ShardProcessor, StateSnapshot};

use super::Plugin;

const DATES_FIELD: &str = "dates";
const USERS_KEY: &str = "users";
const EVENTS_KEY: &str = "events";

const HEADER: &str = "Users & Events by days\nDate\tUsers\tEvents";

#[derive(Debug, Default, Clone, PartialEq)]
struct DayCounters {
    users: BTreeSet<String>,
    events: i64,
}

/// Per-shard accumulator: day → (distinct uids, event count). Only events
/// with a trusted client timestamp are counted; inaccurate ones would land
/// on the upload day, not the day they happened.
#[derive(Debug, Default)]
pub struct CountHandler {
    dates: BTreeMap<DayKey, DayCounters>,
}

impl EventHandler for CountHandler {
    fn on_unmatched(&mut self, event: &Event) {
        if !event.time.is_accurate {
            return;
        }
        let day = self.dates.entry(DayKey::of(&event.time.time)).or_default();
        day.users.insert(format!("{:032x}", event.identity.uid));
        day.events += 1;
    }
}

impl StateSnapshot for CountHandler {
    fn snapshot_fields(&self) -> Vec<(String, Value)> {
        let mut per_day = BTreeMap::new();
        for (day, counters) in &self.dates {
            let mut state = BTreeMap::new();
            state.insert(Key::str(USERS_KEY), Value::StrSet(counters.users.clone()));
            state.insert(Key::str(EVENTS_KEY), Value::Int(counters.events));
            per_day.insert(Key::Str(day.to_string()), Value::Map(state));
        }
        vec![(DATES_FIELD.to_string(), Value::Map(per_day))]
    }
}

/// In-memory aggregate over all shards. Set union and addition are
/// commutative and associative, so completion order does not matter.
#[derive(Debug, Default)]
pub struct CountAggregator {
    dates: BTreeMap<DayKey, DayCounters>,
}

impl Aggregator for CountAggregator {
    fn aggregate(&mut self, snapshot: Snapshot) -> Result<()> {
        let Some(Value::Map(per_day)) = snapshot.field(DATES_FIELD) else {
            bail!("worker snapshot has no {DATES_FIELD} mapping");
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

            let counters = self.dates.entry(day).or_default();
            if let Some(Value::StrSet(users)) = state.get(&Key::str(USERS_KEY)) {
                counters.users.extend(users.iter().cloned());
            }
            if let Some(Value::Int(events)) = state.get(&Key::str(EVENTS_KEY)) {
                counters.events += events;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CountStats {
    rows: Vec<Vec<String>>,
}

impl StatsProcessor for CountStats {
    fn gen_stats(&self) -> Vec<Section> {
        vec![Section {
            header: HEADER.to_string(),
            rows: self.rows.clone(),
        }]
    }
}

pub struct CountUsersAndEvents;

impl Plugin for CountUsersAndEvents {
    fn name(&self) -> &'static str {
        "count_users_and_events"
    }

    fn new_processor(&self) -> Result<Box<dyn ShardProcessor>> {
        // No declared variants: every record reaches the catch-all.
        let registry = EventRegistry::<CountHandler>::new(&[])?;
        Ok(Box::new(EventPipeline::new(
            registry,
            CountHandler::default(),
        )))
    }

    fn new_aggregator(&self, _results_dir: &Path) -> Result<Box<dyn Aggregator>> {
        Ok(Box::<CountAggregator>::default())
    }

    fn stats(&self, aggregator: &dyn Aggregator) -> Option<Box<dyn StatsProcessor>> {
        let aggregator = aggregator.as_any().downcast_ref::<CountAggregator>()?;
        let rows = aggregator
            .dates
            .iter()
            .map(|(day, counters)| {
                vec![
                    day.to_string(),
                    counters.users.len().to_string(),
                    counters.events.to_string(),
                ]
            })
            .collect();
        Some(Box::new(CountStats { rows }))
    }
}
