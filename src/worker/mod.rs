//! Per-shard worker runtime.
//!
//! Runs inside an isolated worker process: decompress the shard in-process,
//! drive the decode boundary, route every record through the event model
//! into the plugin's accumulator, then encode the accumulator snapshot as
//! the shard's sole output.

pub mod source;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::debug;

use crate::codec::{Snapshot, Value};
use crate::event::{EventHandler, EventRegistry, RawRecord};

use self::source::{FramedSource, RecordSource};

/// Plugin-facing view of one shard's processing: which keys to ask the
/// boundary for, what to do per record, and how to snapshot the result.
pub trait ShardProcessor {
    fn interested_keys(&self) -> Vec<String>;

    /// Handle one raw record. Per-event failures are the implementation's
    /// concern and must not abort the shard.
    fn process_record(&mut self, record: RawRecord);

    /// Optional hook after the boundary signals exhaustion, before the
    /// snapshot is taken.
    fn finalize(&mut self) {}

    /// The accumulator's declared snapshot schema: an ordered sequence of
    /// named fields.
    fn snapshot(&self) -> Vec<(String, Value)>;
}

/// Declared snapshot schema of a handler's accumulated state.
pub trait StateSnapshot {
    /// Optional hook before the snapshot is taken.
    fn finalize(&mut self) {}

    fn snapshot_fields(&self) -> Vec<(String, Value)>;
}

/// Generic `ShardProcessor` binding an event registry to a handler. This is
/// the standard way plugins plug into the runtime; hand-rolled processors
/// are only needed when bypassing the event model entirely.
pub struct EventPipeline<H> {
    registry: EventRegistry<H>,
    handler: H,
}

impl<H> EventPipeline<H> {
    pub fn new(registry: EventRegistry<H>, handler: H) -> Self {
        Self { registry, handler }
    }
}

impl<H: EventHandler + StateSnapshot> ShardProcessor for EventPipeline<H> {
    fn interested_keys(&self) -> Vec<String> {
        self.registry.interested_keys()
    }

    fn process_record(&mut self, record: RawRecord) {
        self.registry.dispatch(&mut self.handler, record);
    }

    fn finalize(&mut self) {
        StateSnapshot::finalize(&mut self.handler);
    }

    fn snapshot(&self) -> Vec<(String, Value)> {
        self.handler.snapshot_fields()
    }
}

/// Process one gzip-compressed shard file end to end and return the encoded
/// snapshot bytes.
pub fn run_shard(path: &Path, processor: &mut dyn ShardProcessor) -> Result<Vec<u8>> {
    let file =
        File::open(path).with_context(|| format!("opening shard {}", path.display()))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut source = FramedSource::new(BufReader::new(decoder));

    drive(&mut source, processor)
        .with_context(|| format!("processing shard {}", path.display()))
}

/// Drive a record source through a processor and encode the result. Split
/// from [`run_shard`] so tests can feed synthetic sources directly.
pub fn drive(
    source: &mut dyn RecordSource,
    processor: &mut dyn ShardProcessor,
) -> Result<Vec<u8>> {
    let keys = processor.interested_keys();

    let mut records = 0usize;
    source.iterate(&keys, &mut |record| {
        records += 1;
        processor.process_record(record);
    })?;

    processor.finalize();

    let snapshot = Snapshot::new(processor.snapshot());
    let payload = snapshot.encode().context("encoding worker snapshot")?;

    debug!(records, bytes = payload.len(), "shard processed");
    Ok(payload)
}
