//! Reference implementation of the native decode boundary.
//!
//! Reads the decoded shard stream record by record and hands each one to a
//! callback. Length checks happen per field; truncation yields typed errors
//! rather than panics. The boundary is driven synchronously and makes no
//! reentrancy or thread-safety promises.

use std::collections::HashSet;
use std::io::Read;

use thiserror::Error;

use crate::clock::DualTimestamp;
use crate::event::RawRecord;

/// Leading magic of a decoded shard stream.
pub const SHARD_MAGIC: &[u8; 4] = b"ALG1";

/// Length of the raw uid hex token.
const UID_TOKEN_LEN: usize = 32;

/// Errors raised while reading the framed record stream.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad shard magic")]
    BadMagic,

    #[error("truncated record while reading {section}")]
    Truncated { section: &'static str },

    #[error("{section} is not valid utf-8")]
    BadUtf8 { section: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The decode boundary contract consumed by the worker runtime: one
/// synchronous callback per decoded record, then return once exhausted.
/// An empty `interested_keys` set means "all records"; a nonempty set lets
/// the boundary skip irrelevant records before they are materialized.
pub trait RecordSource {
    fn iterate(
        &mut self,
        interested_keys: &[String],
        callback: &mut dyn FnMut(RawRecord),
    ) -> anyhow::Result<()>;
}

/// `RecordSource` over the length-prefixed binary framing.
pub struct FramedSource<R> {
    reader: R,
}

impl<R: Read> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> RecordSource for FramedSource<R> {
    fn iterate(
        &mut self,
        interested_keys: &[String],
        callback: &mut dyn FnMut(RawRecord),
    ) -> anyhow::Result<()> {
        let keys: HashSet<&str> = interested_keys.iter().map(String::as_str).collect();

        let mut magic = [0u8; 4];
        fill(&mut self.reader, &mut magic, "magic")?;
        if &magic != SHARD_MAGIC {
            return Err(FrameError::BadMagic.into());
        }

        while let Some(record) = read_record(&mut self.reader)? {
            if !keys.is_empty() && !keys.contains(record.key.as_str()) {
                continue;
            }
            callback(record);
        }
        Ok(())
    }
}

/// Read one record, or `None` at a clean end of stream.
fn read_record<R: Read>(r: &mut R) -> Result<Option<RawRecord>, FrameError> {
    // The first field distinguishes clean EOF from mid-record truncation.
    let mut first = [0u8; 8];
    let mut filled = 0;
    while filled < first.len() {
        let n = r.read(&mut first[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                section: "client_created",
            });
        }
        filled += n;
    }
    let client_created_ms = u64::from_le_bytes(first);

    let server_upload_ms = read_u64(r, "server_upload")?;
    let os = read_u8(r, "os_type")?;
    let lat = f32::from_le_bytes(read_array(r, "lat")?);
    let lon = f32::from_le_bytes(read_array(r, "lon")?);
    let uid_hex = read_string(r, UID_TOKEN_LEN, "uid")?;

    let key_len = read_u16(r, "key_len")? as usize;
    let key = read_string(r, key_len, "key")?;

    let payload_count = read_u16(r, "payload_count")? as usize;
    let mut payload = Vec::with_capacity(payload_count);
    for _ in 0..payload_count {
        let len = read_u32(r, "payload_item_len")? as usize;
        payload.push(read_string(r, len, "payload_item")?);
    }

    Ok(Some(RawRecord {
        key,
        time: DualTimestamp::new(client_created_ms, server_upload_ms),
        os,
        uid_hex,
        lat,
        lon,
        payload,
    }))
}

fn fill<R: Read>(r: &mut R, buf: &mut [u8], section: &'static str) -> Result<(), FrameError> {
    r.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated { section }
        } else {
            FrameError::Io(err)
        }
    })
}

fn read_array<R: Read, const N: usize>(
    r: &mut R,
    section: &'static str,
) -> Result<[u8; N], FrameError> {
    let mut buf = [0u8; N];
    fill(r, &mut buf, section)?;
    Ok(buf)
}

fn read_u8<R: Read>(r: &mut R, section: &'static str) -> Result<u8, FrameError> {
    Ok(read_array::<R, 1>(r, section)?[0])
}

fn read_u16<R: Read>(r: &mut R, section: &'static str) -> Result<u16, FrameError> {
    Ok(u16::from_le_bytes(read_array(r, section)?))
}

fn read_u32<R: Read>(r: &mut R, section: &'static str) -> Result<u32, FrameError> {
    Ok(u32::from_le_bytes(read_array(r, section)?))
}

fn read_u64<R: Read>(r: &mut R, section: &'static str) -> Result<u64, FrameError> {
    Ok(u64::from_le_bytes(read_array(r, section)?))
}

fn read_string<R: Read>(
    r: &mut R,
    len: usize,
    section: &'static str,
) -> Result<String, FrameError> {
    let mut buf = vec![0u8; len];
    fill(r, &mut buf, section)?;
    String::from_utf8(buf).map_err(|_| FrameError::BadUtf8 { section })
}
