//! Event model: typed payloads, the key-indexed variant registry and the
//! dispatch step that routes each raw record to exactly one handler method.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use crate::clock::{DualTimestamp, ResolvedTime};
use crate::identity::{Identity, IdentityError};

/// A raw record as handed over by the native decode boundary, one per
/// callback invocation. Owned so it can cross the boundary without lifetime
/// entanglement; each record is consumed by exactly one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: String,
    pub time: DualTimestamp,
    pub os: u8,
    pub uid_hex: String,
    pub lat: f32,
    pub lon: f32,
    pub payload: Vec<String>,
}

/// How a variant interprets its payload strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Opaque passthrough list.
    Raw,
    /// Even-length alternating (field, value) list reinterpreted as a map.
    Pairs,
}

/// Payload of a constructed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Vec<String>),
    Pairs(HashMap<String, String>),
}

impl Payload {
    fn build(shape: PayloadShape, values: Vec<String>) -> Result<Self, EventError> {
        match shape {
            PayloadShape::Raw => Ok(Self::Raw(values)),
            PayloadShape::Pairs => {
                if values.len() % 2 != 0 {
                    return Err(EventError::OddPairs { len: values.len() });
                }
                // Duplicate field names collapse to the last occurrence.
                let mut pairs = HashMap::with_capacity(values.len() / 2);
                let mut iter = values.into_iter();
                while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
                    pairs.insert(field, value);
                }
                Ok(Self::Pairs(pairs))
            }
        }
    }

    /// The key-value view of a pairs payload, if this is one.
    pub fn pairs(&self) -> Option<&HashMap<String, String>> {
        match self {
            Self::Pairs(map) => Some(map),
            Self::Raw(_) => None,
        }
    }
}

/// A fully constructed event. Time and identity are resolved eagerly at
/// construction; downstream handlers assume both are ready.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    pub time: ResolvedTime,
    pub identity: Identity,
    pub payload: Payload,
}

/// Per-event construction failures. These drop a single event and never
/// abort the rest of the shard.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("odd key-value payload length {len}")]
    OddPairs { len: usize },

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Duplicate event key across registered variants. Fatal at startup.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("event key {key:?} claimed by both {first:?} and {second:?}")]
    DuplicateKey {
        key: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

/// Handler hook for the default passthrough variant. Events whose key no
/// registered variant claims land here.
pub trait EventHandler {
    fn on_unmatched(&mut self, _event: &Event) {}
}

/// Variant-specific handler entry point, bound at registration time.
pub type DispatchFn<H> = fn(&mut H, &Event);

/// Descriptor for one event variant: the keys it claims, the payload shape
/// it expects and the handler method it routes to.
pub struct EventVariant<H> {
    pub name: &'static str,
    pub keys: &'static [&'static str],
    pub shape: PayloadShape,
    pub dispatch: DispatchFn<H>,
}

struct VariantSlot<H> {
    name: &'static str,
    shape: PayloadShape,
    dispatch: DispatchFn<H>,
}

/// Key-indexed variant registry, built once per run. The variant set is
/// closed after construction; dispatch is a plain map lookup.
pub struct EventRegistry<H> {
    by_key: HashMap<&'static str, VariantSlot<H>>,
}

impl<H: EventHandler> EventRegistry<H> {
    /// Build the key map, rejecting any key claimed by more than one variant.
    pub fn new(variants: &[EventVariant<H>]) -> Result<Self, RegistrationError> {
        let mut by_key = HashMap::new();
        for variant in variants {
            for key in variant.keys {
                let slot = VariantSlot {
                    name: variant.name,
                    shape: variant.shape,
                    dispatch: variant.dispatch,
                };
                if let Some(previous) = by_key.insert(*key, slot) {
                    return Err(RegistrationError::DuplicateKey {
                        key,
                        first: previous.name,
                        second: variant.name,
                    });
                }
            }
        }
        Ok(Self { by_key })
    }

    /// The union of keys claimed by all registered variants. Passed to the
    /// decode boundary so it can skip irrelevant records; empty means "all".
    pub fn interested_keys(&self) -> Vec<String> {
        self.by_key.keys().map(|k| (*k).to_string()).collect()
    }

    /// Construct the event for a raw record and resolve its handler entry
    /// point. Unknown keys build the raw passthrough variant and route to
    /// the handler's catch-all.
    pub fn make_event(&self, record: RawRecord) -> Result<(Event, DispatchFn<H>), EventError> {
        let identity = Identity::from_raw(record.os, &record.uid_hex, record.lat, record.lon)?;
        let time = record.time.resolve();

        let (payload, dispatch) = match self.by_key.get(record.key.as_str()) {
            Some(slot) => (Payload::build(slot.shape, record.payload)?, slot.dispatch),
            None => (
                Payload::Raw(record.payload),
                <H as EventHandler>::on_unmatched as DispatchFn<H>,
            ),
        };

        Ok((
            Event {
                key: record.key,
                time,
                identity,
                payload,
            },
            dispatch,
        ))
    }

    /// Construct and dispatch one record. Construction failures are logged
    /// here and drop only this event.
    pub fn dispatch(&self, handler: &mut H, record: RawRecord) {
        let key = record.key.clone();
        match self.make_event(record) {
            Ok((event, dispatch)) => dispatch(handler, &event),
            Err(err) => warn!(key = %key, %err, "dropping malformed event"),
        }
    }
}
