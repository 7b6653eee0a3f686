//! Static plugin registry.
//!
//! A plugin bundles an event-processing strategy, an aggregator and
//! optionally a stats processor. Plugins are compiled in and selected by
//! name at startup; there is no dynamic loading.

pub mod count_users;
pub mod daily_key_counts;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::aggregate::{Aggregator, LastWriteWins, ReductionStrategy};
use crate::stats::StatsProcessor;
use crate::worker::ShardProcessor;

/// One named analysis strategy. Factories rather than instances: the worker
/// side builds a fresh processor per shard process, the orchestrator builds
/// one aggregator per run.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fresh per-shard processor. Also the point where event registration
    /// errors surface, before any shard is processed.
    fn new_processor(&self) -> Result<Box<dyn ShardProcessor>>;

    /// Fresh per-run aggregator. `results_dir` is only meaningful for
    /// filesystem-partitioned aggregators.
    fn new_aggregator(&self, results_dir: &Path) -> Result<Box<dyn Aggregator>>;

    /// Reduce-phase merge policy for filesystem-partitioned state.
    fn reduction(&self) -> Box<dyn ReductionStrategy> {
        Box::new(LastWriteWins)
    }

    /// Stats processor over the finalized aggregate, if the plugin reports.
    fn stats(&self, aggregator: &dyn Aggregator) -> Option<Box<dyn StatsProcessor>>;
}

/// Name-indexed plugin set, resolved once at startup.
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
        }
    }

    /// The registry with all built-in plugins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(count_users::CountUsersAndEvents));
        registry.register(Arc::new(daily_key_counts::DailyKeyCounts));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned().with_context(|| {
            format!("unknown plugin {name:?} (known: {:?})", self.names())
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
