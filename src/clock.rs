use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use thiserror::Error;

/// How far in the past a client clock may lag the server clock and still be
/// trusted. Mobile devices routinely report events days after they happened.
pub const SKEW_PAST_DAYS: i64 = 180;

/// How far in the future a client clock may run ahead of the server clock.
pub const SKEW_FUTURE_DAYS: i64 = 1;

/// Compact calendar date format used in shard filenames and day keys.
const COMPACT_DAY_FORMAT: &str = "%Y%m%d";

/// Day key prefix on the wire. Keeps serialized day keys from looking like
/// integers, so the codec's integer-key normalization leaves them alone.
const DAY_KEY_PREFIX: &str = "dt";

/// The two clocks attached to every raw event: when the device claims the
/// event happened and when the server actually received it. Both are UTC
/// millisecond instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualTimestamp {
    pub client_created_ms: u64,
    pub server_upload_ms: u64,
}

/// A reconciled event time. `is_accurate` records whether the client clock
/// was trusted or the server upload time was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTime {
    pub time: DateTime<Utc>,
    pub is_accurate: bool,
}

impl DualTimestamp {
    pub fn new(client_created_ms: u64, server_upload_ms: u64) -> Self {
        Self {
            client_created_ms,
            server_upload_ms,
        }
    }

    /// Reconcile the two clocks. The client time wins when it falls inside
    /// the window `[server - SKEW_PAST_DAYS, server + SKEW_FUTURE_DAYS]`
    /// (both ends inclusive); otherwise the server time is used and the
    /// result is flagged inaccurate. Pure and infallible: malformed
    /// timestamps clamp to the epoch instead of erroring.
    pub fn resolve(&self) -> ResolvedTime {
        let client = ms_to_utc(self.client_created_ms);
        let server = ms_to_utc(self.server_upload_ms);

        let earliest = server - Duration::days(SKEW_PAST_DAYS);
        let latest = server + Duration::days(SKEW_FUTURE_DAYS);

        if client >= earliest && client <= latest {
            ResolvedTime {
                time: client,
                is_accurate: true,
            }
        } else {
            ResolvedTime {
                time: server,
                is_accurate: false,
            }
        }
    }
}

/// Convert UTC milliseconds to a `DateTime<Utc>`, clamping out-of-range
/// values to the epoch.
fn ms_to_utc(ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Raised for compact date strings that are not exactly eight digits or do
/// not name a real calendar date.
#[derive(Error, Debug)]
#[error("invalid compact date {text:?} (expected YYYYMMDD)")]
pub struct DateParseError {
    text: String,
}

/// Parse a compact `YYYYMMDD` date, as used in shard filenames and
/// date-range configuration. Exactly eight ASCII digits are required;
/// chrono's `%Y%m%d` alone would accept shorter digit runs.
pub fn parse_compact_date(s: &str) -> Result<NaiveDate, DateParseError> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DateParseError { text: s.to_string() });
    }
    NaiveDate::parse_from_str(s, COMPACT_DAY_FORMAT).map_err(|_| DateParseError {
        text: s.to_string(),
    })
}

/// A per-day aggregation key. Renders as `dtYYYYMMDD` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(pub NaiveDate);

impl DayKey {
    /// Day key for the calendar day (UTC) of the given instant.
    pub fn of(time: &DateTime<Utc>) -> Self {
        Self(time.date_naive())
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DAY_KEY_PREFIX}{}", self.0.format(COMPACT_DAY_FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = DateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact = s.strip_prefix(DAY_KEY_PREFIX).unwrap_or(s);
        parse_compact_date(compact).map(DayKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;
    const SERVER_MS: u64 = 1_700_000_000_000;

    #[test]
    fn test_resolve_client_within_window() {
        let ts = DualTimestamp::new(SERVER_MS - 3 * DAY_MS, SERVER_MS);
        let resolved = ts.resolve();
        assert!(resolved.is_accurate);
        assert_eq!(resolved.time, ms_to_utc(SERVER_MS - 3 * DAY_MS));
    }

    #[test]
    fn test_resolve_client_too_far_in_past() {
        let ts = DualTimestamp::new(SERVER_MS - 200 * DAY_MS, SERVER_MS);
        let resolved = ts.resolve();
        assert!(!resolved.is_accurate);
        assert_eq!(resolved.time, ms_to_utc(SERVER_MS));
    }

    #[test]
    fn test_resolve_client_too_far_in_future() {
        let ts = DualTimestamp::new(SERVER_MS + 2 * DAY_MS, SERVER_MS);
        let resolved = ts.resolve();
        assert!(!resolved.is_accurate);
        assert_eq!(resolved.time, ms_to_utc(SERVER_MS));
    }

    #[test]
    fn test_resolve_window_bounds_inclusive() {
        let past_edge = DualTimestamp::new(SERVER_MS - 180 * DAY_MS, SERVER_MS);
        assert!(past_edge.resolve().is_accurate);

        let future_edge = DualTimestamp::new(SERVER_MS + DAY_MS, SERVER_MS);
        assert!(future_edge.resolve().is_accurate);

        let past_outside = DualTimestamp::new(SERVER_MS - 180 * DAY_MS - 1, SERVER_MS);
        assert!(!past_outside.resolve().is_accurate);

        let future_outside = DualTimestamp::new(SERVER_MS + DAY_MS + 1, SERVER_MS);
        assert!(!future_outside.resolve().is_accurate);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let ts = DualTimestamp::new(SERVER_MS - 1, SERVER_MS);
        assert_eq!(ts.resolve(), ts.resolve());
    }

    #[test]
    fn test_day_key_round_trip() {
        let day = DayKey(NaiveDate::from_ymd_opt(2020, 1, 15).expect("valid date"));
        assert_eq!(day.to_string(), "dt20200115");
        assert_eq!("dt20200115".parse::<DayKey>().expect("parses"), day);
    }

    #[test]
    fn test_day_key_rejects_garbage() {
        assert!("dt2020011".parse::<DayKey>().is_err());
        assert!("dt202001150".parse::<DayKey>().is_err());
        assert!("not-a-day".parse::<DayKey>().is_err());
    }

    #[test]
    fn test_parse_compact_date() {
        let date = parse_compact_date("20200115").expect("parses");
        assert_eq!(date, NaiveDate::from_ymd_opt(2020, 1, 15).expect("valid date"));
        assert!(parse_compact_date("20201340").is_err());
    }

    #[test]
    fn test_parse_compact_date_requires_eight_digits() {
        assert!(parse_compact_date("2020011").is_err());
        assert!(parse_compact_date("202001150").is_err());
        assert!(parse_compact_date("2020o115").is_err());
        assert!(parse_compact_date(" 20200115").is_err());
    }
}
