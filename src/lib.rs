//! Local batch aggregation pipeline for per-day telemetry log shards.
//!
//! A run fans daily gzip-compressed shard files out to a pool of worker
//! processes, applies a named plugin (event dispatch + aggregator + stats)
//! per shard, merges the partial results and renders tabular reports.

pub mod aggregate;
pub mod clock;
pub mod codec;
pub mod config;
pub mod event;
pub mod identity;
pub mod pipeline;
pub mod plugin;
pub mod pool;
pub mod shard;
pub mod stats;
pub mod worker;
