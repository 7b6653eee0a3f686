//! Aggregator contract: merging per-shard partial results into the run's
//! global aggregate.

pub mod daily_fs;

use std::any::Any;
use std::collections::BTreeMap;

use anyhow::Result;

use crate::codec::{Key, Snapshot, Value};
use crate::pool::WorkerPool;

/// Merges one shard's partial result into the running aggregate. Shard
/// outcomes arrive in completion order, so `aggregate` must be commutative
/// and associative over shard results.
pub trait Aggregator {
    fn aggregate(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Optional second pass after all shards are consumed. May reuse the
    /// run's pool for partition-level reduction.
    fn post_aggregate(&mut self, _pool: Option<&mut WorkerPool>) -> Result<()> {
        Ok(())
    }

    /// Concrete-type access for plugin-side stats construction.
    fn as_any(&self) -> &dyn Any;
}

/// How duplicate keys within one saved day are collapsed during the reduce
/// phase. Named explicitly because the shipped default is a placeholder, not
/// a declared merge arithmetic; plugins with additive statistics must supply
/// their own.
pub trait ReductionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn reduce(&self, entries: Vec<(Key, Value)>) -> Vec<(Key, Value)>;
}

/// Duplicate keys collapse to the last appended occurrence.
pub struct LastWriteWins;

impl ReductionStrategy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn reduce(&self, entries: Vec<(Key, Value)>) -> Vec<(Key, Value)> {
        let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
        for (key, value) in entries {
            merged.insert(key, value);
        }
        merged.into_iter().collect()
    }
}
