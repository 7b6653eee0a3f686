//! Worker result wire protocol.
//!
//! A worker's accumulated state crosses the process boundary as a JSON array
//! of `[field_name, value]` pairs, ordered, so field order is preserved
//! faithfully. Dates, datetimes and sets are not natively representable in
//! JSON; each is wrapped in a `{"__stype__": "repr", "__svalue__": ...}`
//! envelope holding a canonical textual form. Because JSON object keys are
//! always strings, decoding re-keys every mapping whose key looks like an
//! integer back to an integer key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as Wire;
use thiserror::Error;

const STYPE_FIELD: &str = "__stype__";
const SVALUE_FIELD: &str = "__svalue__";
const STYPE_REPR: &str = "repr";

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Raised when the codec meets something it cannot represent or reconstruct.
/// Never swallowed: a codec failure fails the whole shard result.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("non-finite float is not representable")]
    NonFiniteFloat,

    #[error("malformed {kind} envelope: {text:?}")]
    BadEnvelope { kind: &'static str, text: String },

    #[error("unsupported wire number: {text}")]
    UnsupportedNumber { text: String },

    #[error("result frame is not an array of [name, value] pairs")]
    BadFrame,

    #[error("day entry is not a [key, value] pair")]
    BadEntry,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Mapping key. The wire format can only carry string keys, so integer keys
/// are stringified on encode and recovered by post-decode normalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    fn render(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Str(s) => s.clone(),
        }
    }

    /// Integer-looking string keys become integer keys. Applied to every
    /// decoded mapping, not opt-in.
    fn from_decoded(raw: &str) -> Self {
        raw.parse::<i64>().map_or_else(|_| Self::Str(raw.to_string()), Self::Int)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// The value vocabulary a worker snapshot may carry. A closed set: anything
/// a plugin wants on the wire must be declared in these terms.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<Key, Value>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    IntSet(BTreeSet<i64>),
    /// The `set([...])` wire form carries no element kind, so an empty set
    /// always decodes as an empty [`Value::IntSet`], the canonical empty
    /// set. Consumers matching on `StrSet` must not rely on an empty one
    /// surviving the codec.
    StrSet(BTreeSet<String>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }
}

/// Encode an ordered field sequence into wire bytes.
pub fn encode(fields: &[(String, Value)]) -> Result<Vec<u8>, CodecError> {
    let mut rows = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        rows.push(Wire::Array(vec![
            Wire::String(name.clone()),
            to_wire(value)?,
        ]));
    }
    Ok(serde_json::to_vec(&Wire::Array(rows))?)
}

/// Decode wire bytes back into the ordered field sequence.
pub fn decode(bytes: &[u8]) -> Result<Vec<(String, Value)>, CodecError> {
    let wire: Wire = serde_json::from_slice(bytes)?;
    let Wire::Array(rows) = wire else {
        return Err(CodecError::BadFrame);
    };

    let mut fields = Vec::with_capacity(rows.len());
    for row in &rows {
        let pair = row.as_array().filter(|a| a.len() == 2).ok_or(CodecError::BadFrame)?;
        let name = pair[0].as_str().ok_or(CodecError::BadFrame)?;
        fields.push((name.to_string(), from_wire(&pair[1])?));
    }
    Ok(fields)
}

/// Encode one `[key, value]` day-file entry (without trailing newline).
pub fn encode_entry(key: &Key, value: &Value) -> Result<Vec<u8>, CodecError> {
    let wire_key = match key {
        Key::Int(i) => Wire::from(*i),
        Key::Str(s) => Wire::String(s.clone()),
    };
    Ok(serde_json::to_vec(&Wire::Array(vec![wire_key, to_wire(value)?]))?)
}

/// Decode one `[key, value]` day-file entry. Entry keys are positional, not
/// mapping keys, so string keys stay strings here.
pub fn decode_entry(line: &str) -> Result<(Key, Value), CodecError> {
    let wire: Wire = serde_json::from_str(line)?;
    let pair = wire.as_array().filter(|a| a.len() == 2).ok_or(CodecError::BadEntry)?;
    let key = match &pair[0] {
        Wire::Number(n) => Key::Int(n.as_i64().ok_or_else(|| CodecError::UnsupportedNumber {
            text: n.to_string(),
        })?),
        Wire::String(s) => Key::Str(s.clone()),
        _ => return Err(CodecError::BadEntry),
    };
    Ok((key, from_wire(&pair[1])?))
}

fn to_wire(value: &Value) -> Result<Wire, CodecError> {
    Ok(match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::from(*i),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(CodecError::NonFiniteFloat);
            }
            Wire::from(*f)
        }
        Value::Str(s) => Wire::String(s.clone()),
        Value::List(items) => {
            Wire::Array(items.iter().map(to_wire).collect::<Result<_, _>>()?)
        }
        Value::Map(map) => {
            let mut obj = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                obj.insert(key.render(), to_wire(val)?);
            }
            Wire::Object(obj)
        }
        Value::Date(d) => envelope(format!("date({})", d.format(DATE_FORMAT))),
        Value::DateTime(dt) => envelope(format!("datetime({})", dt.format(DATETIME_FORMAT))),
        Value::IntSet(set) => {
            let items: Vec<&i64> = set.iter().collect();
            envelope(format!("set({})", serde_json::to_string(&items)?))
        }
        Value::StrSet(set) => {
            let items: Vec<&String> = set.iter().collect();
            envelope(format!("set({})", serde_json::to_string(&items)?))
        }
    })
}

fn envelope(svalue: String) -> Wire {
    let mut obj = serde_json::Map::with_capacity(2);
    obj.insert(STYPE_FIELD.to_string(), Wire::String(STYPE_REPR.to_string()));
    obj.insert(SVALUE_FIELD.to_string(), Wire::String(svalue));
    Wire::Object(obj)
}

fn from_wire(wire: &Wire) -> Result<Value, CodecError> {
    Ok(match wire {
        Wire::Null => Value::Null,
        Wire::Bool(b) => Value::Bool(*b),
        Wire::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(CodecError::UnsupportedNumber { text: n.to_string() });
            }
        }
        Wire::String(s) => Value::Str(s.clone()),
        Wire::Array(items) => {
            Value::List(items.iter().map(from_wire).collect::<Result<_, _>>()?)
        }
        Wire::Object(obj) => {
            if obj.len() == 2 {
                if let (Some(Wire::String(stype)), Some(Wire::String(svalue))) =
                    (obj.get(STYPE_FIELD), obj.get(SVALUE_FIELD))
                {
                    if stype == STYPE_REPR {
                        return parse_repr(svalue);
                    }
                }
            }

            let mut map = BTreeMap::new();
            for (raw_key, val) in obj {
                map.insert(Key::from_decoded(raw_key), from_wire(val)?);
            }
            Value::Map(map)
        }
    })
}

/// Reconstruct a value from its canonical textual form. `datetime(` must be
/// checked before `date(` since the latter is a prefix of the former.
fn parse_repr(svalue: &str) -> Result<Value, CodecError> {
    if let Some(inner) = strip_call(svalue, "datetime") {
        return NaiveDateTime::parse_from_str(inner, DATETIME_FORMAT)
            .map(Value::DateTime)
            .map_err(|_| CodecError::BadEnvelope {
                kind: "datetime",
                text: svalue.to_string(),
            });
    }

    if let Some(inner) = strip_call(svalue, "date") {
        return NaiveDate::parse_from_str(inner, DATE_FORMAT)
            .map(Value::Date)
            .map_err(|_| CodecError::BadEnvelope {
                kind: "date",
                text: svalue.to_string(),
            });
    }

    if let Some(inner) = strip_call(svalue, "set") {
        return parse_set(inner).ok_or_else(|| CodecError::BadEnvelope {
            kind: "set",
            text: svalue.to_string(),
        });
    }

    Err(CodecError::BadEnvelope {
        kind: "repr",
        text: svalue.to_string(),
    })
}

fn strip_call<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_set(inner: &str) -> Option<Value> {
    let items: Vec<Wire> = serde_json::from_str(inner).ok()?;
    // Kind-less on the wire: the empty set decodes as the integer kind.
    if items.is_empty() {
        return Some(Value::IntSet(BTreeSet::new()));
    }

    if items.iter().all(|w| w.as_i64().is_some()) {
        let set = items.iter().filter_map(Wire::as_i64).collect();
        return Some(Value::IntSet(set));
    }

    if items.iter().all(Wire::is_string) {
        let set = items
            .iter()
            .filter_map(|w| w.as_str().map(str::to_string))
            .collect();
        return Some(Value::StrSet(set));
    }

    None
}

/// A decoded worker result: the ordered field sequence plus name lookup.
/// Produced by exactly one worker, consumed by exactly one aggregate call.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    fields: Vec<(String, Value)>,
}

impl Snapshot {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes).map(Self::new)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(&self.fields)
    }

    /// First field with the given name, if any.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(fields: Vec<(String, Value)>) -> Vec<(String, Value)> {
        let bytes = encode(&fields).expect("encodes");
        decode(&bytes).expect("decodes")
    }

    #[test]
    fn test_round_trip_primitives() {
        let fields = vec![
            ("a".to_string(), Value::Int(3)),
            ("b".to_string(), Value::Str("hello".to_string())),
            ("c".to_string(), Value::Bool(true)),
            ("d".to_string(), Value::Float(2.5)),
            ("e".to_string(), Value::Null),
        ];
        assert_eq!(round_trip(fields.clone()), fields);
    }

    #[test]
    fn test_field_order_preserved() {
        let fields = vec![
            ("z".to_string(), Value::Int(1)),
            ("a".to_string(), Value::Int(2)),
            ("m".to_string(), Value::Int(3)),
        ];
        let names: Vec<String> = round_trip(fields).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_round_trip_nested_map_and_list() {
        let mut inner = BTreeMap::new();
        inner.insert(Key::str("x"), Value::List(vec![Value::Int(1), Value::Int(2)]));
        let mut outer = BTreeMap::new();
        outer.insert(Key::str("inner"), Value::Map(inner));

        let fields = vec![("tree".to_string(), Value::Map(outer))];
        assert_eq!(round_trip(fields.clone()), fields);
    }

    #[test]
    fn test_round_trip_dates_and_sets() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date");
        let datetime = date.and_hms_opt(12, 30, 0).expect("valid time");

        let fields = vec![
            ("day".to_string(), Value::Date(date)),
            ("instant".to_string(), Value::DateTime(datetime)),
            (
                "ids".to_string(),
                Value::IntSet([1, 2, 3].into_iter().collect()),
            ),
            (
                "names".to_string(),
                Value::StrSet(["a".to_string(), "b".to_string()].into_iter().collect()),
            ),
        ];
        assert_eq!(round_trip(fields.clone()), fields);
    }

    #[test]
    fn test_integer_keys_normalized_on_decode() {
        let mut map = BTreeMap::new();
        map.insert(Key::Int(1), Value::Int(5));
        map.insert(Key::Int(2), Value::Int(7));

        let fields = vec![("b".to_string(), Value::Map(map.clone()))];
        let decoded = round_trip(fields);

        // Integer keys survive the string-only wire format.
        assert_eq!(decoded[0].1, Value::Map(map));
    }

    #[test]
    fn test_day_keys_stay_strings() {
        let mut map = BTreeMap::new();
        map.insert(Key::str("dt20200101"), Value::Int(5));

        let fields = vec![("b".to_string(), Value::Map(map.clone()))];
        let decoded = round_trip(fields);
        assert_eq!(decoded[0].1, Value::Map(map));
    }

    #[test]
    fn test_mixed_keys_normalized_independently() {
        let mut map = BTreeMap::new();
        map.insert(Key::Int(7), Value::Null);
        map.insert(Key::str("seven"), Value::Null);

        let fields = vec![("m".to_string(), Value::Map(map.clone()))];
        let decoded = round_trip(fields);
        assert_eq!(decoded[0].1, Value::Map(map));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let fields = vec![("bad".to_string(), Value::Float(f64::NAN))];
        assert!(matches!(
            encode(&fields),
            Err(CodecError::NonFiniteFloat)
        ));
    }

    #[test]
    fn test_malformed_envelope_rejected() {
        let bytes = br#"[["x", {"__stype__": "repr", "__svalue__": "mystery(1)"}]]"#;
        assert!(matches!(
            decode(bytes),
            Err(CodecError::BadEnvelope { kind: "repr", .. })
        ));
    }

    #[test]
    fn test_bad_date_envelope_rejected() {
        let bytes = br#"[["x", {"__stype__": "repr", "__svalue__": "date(2020-13-99)"}]]"#;
        assert!(matches!(
            decode(bytes),
            Err(CodecError::BadEnvelope { kind: "date", .. })
        ));
    }

    #[test]
    fn test_frame_must_be_pair_array() {
        assert!(matches!(decode(b"{}"), Err(CodecError::BadFrame)));
        assert!(matches!(decode(b"[[1, 2, 3]]"), Err(CodecError::BadFrame)));
    }

    #[test]
    fn test_empty_set_round_trips() {
        let fields = vec![("s".to_string(), Value::IntSet(BTreeSet::new()))];
        assert_eq!(round_trip(fields.clone()), fields);
    }

    #[test]
    fn test_empty_str_set_decodes_as_canonical_empty_set() {
        // The wire form cannot distinguish empty set kinds.
        let fields = vec![("s".to_string(), Value::StrSet(BTreeSet::new()))];
        let decoded = round_trip(fields);
        assert_eq!(decoded[0].1, Value::IntSet(BTreeSet::new()));
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = encode_entry(&Key::Int(42), &Value::Str("v".to_string())).expect("encodes");
        let line = String::from_utf8(entry).expect("utf8");
        let (key, value) = decode_entry(&line).expect("decodes");
        assert_eq!(key, Key::Int(42));
        assert_eq!(value, Value::Str("v".to_string()));
    }

    #[test]
    fn test_entry_string_key_not_normalized() {
        // Positional entry keys are carried verbatim, unlike mapping keys.
        let entry = encode_entry(&Key::str("123x"), &Value::Null).expect("encodes");
        let line = String::from_utf8(entry).expect("utf8");
        let (key, _) = decode_entry(&line).expect("decodes");
        assert_eq!(key, Key::str("123x"));
    }

    #[test]
    fn test_snapshot_field_lookup() {
        let snapshot = Snapshot::new(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]);
        assert_eq!(snapshot.field("b"), Some(&Value::Int(2)));
        assert_eq!(snapshot.field("missing"), None);
    }
}
