use std::fmt;

use thiserror::Error;

/// Operating system of the device that produced an event.
/// Values must match the native decode boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OsType {
    Unknown = 0,
    Android = 1,
    Ios = 2,
}

impl OsType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Android,
            2 => Self::Ios,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while normalizing a raw identity record.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid uid token {token:?}")]
    InvalidUid { token: String },
}

/// Per-user identity attached to a single event. The uid is decoded from the
/// raw 32-character hex token at event construction time. Coordinates are
/// zero when the device reported no location.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub os: OsType,
    pub uid: u128,
    pub lat: f32,
    pub lon: f32,
}

impl Identity {
    /// Build an identity from the raw fields handed over by the decode
    /// boundary. Fails only on an undecodable uid token.
    pub fn from_raw(os: u8, uid_hex: &str, lat: f32, lon: f32) -> Result<Self, IdentityError> {
        let token = uid_hex.trim();
        let uid = u128::from_str_radix(token, 16).map_err(|_| IdentityError::InvalidUid {
            token: token.to_string(),
        })?;

        Ok(Self {
            os: OsType::from_u8(os),
            uid,
            lat,
            lon,
        })
    }

    /// Geo is present iff either coordinate survives rounding to 2 decimals.
    /// Near-zero jitter around the null island is treated as "no location".
    pub fn has_geo(&self) -> bool {
        round_to(self.lat as f64, 2) != 0.0 || round_to(self.lon as f64, 2) != 0.0
    }

    /// The persisted representation: coordinates dropped when geo is absent,
    /// rounded to 6 decimals when present.
    pub fn stripped(&self) -> StrippedIdentity {
        StrippedIdentity {
            os: self.os,
            uid: self.uid,
            geo: self
                .has_geo()
                .then(|| (round_to(self.lat as f64, 6), round_to(self.lon as f64, 6))),
        }
    }
}

/// Identity as it crosses the result codec: no raw coordinates, no token.
#[derive(Debug, Clone, PartialEq)]
pub struct StrippedIdentity {
    pub os: OsType,
    pub uid: u128,
    pub geo: Option<(f64, f64)>,
}

fn round_to(v: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (v * factor).round() / factor
}
