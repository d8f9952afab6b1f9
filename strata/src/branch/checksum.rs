//! CRC32-framed payloads for tier snapshot and chunk files.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::MAGIC;
use crate::errors::{StrataError, StrataResult};

/// A serialized payload wrapped with a magic number and CRC32 checksum
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    magic: u32,
    checksum: u32,
    payload: Vec<u8>,
}

/// CRC32-MPEG2 implementation (matching common checksums)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}

/// Serializes `value` and frames it with a checksum.
pub(crate) fn seal<T: Serialize>(value: &T) -> StrataResult<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let envelope = Envelope {
        magic: MAGIC,
        checksum: crc32(&payload),
        payload,
    };
    Ok(bincode::serde::encode_to_vec(&envelope, bincode::config::legacy())?)
}

/// Verifies the frame written by [`seal`] and decodes its payload.
pub(crate) fn open<T: DeserializeOwned>(bytes: &[u8], what: &str) -> StrataResult<T> {
    let (envelope, _): (Envelope, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map_err(|e| StrataError::Corrupted(format!("{}: {}", what, e)))?;

    if envelope.magic != MAGIC {
        return Err(StrataError::Corrupted(format!("{}: bad magic", what)));
    }
    let expected = crc32(&envelope.payload);
    if envelope.checksum != expected {
        return Err(StrataError::Corrupted(format!(
            "{}: checksum mismatch (expected: {:x}, got: {:x})",
            what, expected, envelope.checksum
        )));
    }

    let (value, _) = bincode::serde::decode_from_slice(&envelope.payload, bincode::config::legacy())
        .map_err(|e| StrataError::Corrupted(format!("{}: {}", what, e)))?;
    Ok(value)
}
