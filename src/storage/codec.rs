//! Record codec for persisted objects
//!
//! Every value handed to the persistent store is framed the same way:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ magic: [u8; 4] = "PSTR"                  │
//! │ version: u8                              │
//! │ kind: u8                                 │
//! │ crc32: u32 (LE, over the payload bytes)  │
//! │ payload: lz4(bincode(object))            │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The kind byte lets a reader reject a record read through the wrong
//! namespace, and the checksum catches torn or bit-rotted values.

use crate::storage::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Magic bytes identifying a record
const RECORD_MAGIC: [u8; 4] = *b"PSTR";

/// Current record format version
const RECORD_VERSION: u8 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 10;

/// The closed set of object kinds held by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Dimension = 1,
    Segment = 2,
    Dictionary = 3,
    Tree = 4,
}

impl Kind {
    /// Every kind, in eviction preference order (cheapest to reload last)
    pub fn all() -> &'static [Kind] {
        &[Kind::Tree, Kind::Dictionary, Kind::Segment, Kind::Dimension]
    }

    /// Every kind, referenced kinds before the kinds referencing them
    ///
    /// Chunks hold dictionary ids, segments list chunks and dimensions
    /// list segments.
    pub fn write_order() -> &'static [Kind] {
        &[Kind::Dictionary, Kind::Tree, Kind::Segment, Kind::Dimension]
    }

    /// Key namespace in the persistent store
    pub fn prefix(&self) -> &'static str {
        match self {
            Kind::Dimension => "d:",
            Kind::Segment => "s:",
            Kind::Dictionary => "y:",
            Kind::Tree => "t:",
        }
    }

    /// Full store key for an object of this kind
    pub fn store_key(&self, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + id.len());
        key.extend_from_slice(self.prefix().as_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }
}

impl TryFrom<u8> for Kind {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Kind::Dimension),
            2 => Ok(Kind::Segment),
            3 => Ok(Kind::Dictionary),
            4 => Ok(Kind::Tree),
            _ => Err(StorageError::Corruption(format!(
                "Unknown record kind: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Dimension => write!(f, "dimension"),
            Kind::Segment => write!(f, "segment"),
            Kind::Dictionary => write!(f, "dictionary"),
            Kind::Tree => write!(f, "tree"),
        }
    }
}

/// Serialize, compress and frame an object
pub fn encode_record<T: Serialize>(kind: Kind, value: &T) -> StorageResult<Vec<u8>> {
    let serialized = bincode::serialize(value)?;
    let payload = lz4_flex::compress_prepend_size(&serialized);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.push(RECORD_VERSION);
    buf.push(kind as u8);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Verify, decompress and deserialize a framed object
pub fn decode_record<T: DeserializeOwned>(kind: Kind, data: &[u8]) -> StorageResult<T> {
    if data.len() < HEADER_SIZE {
        return Err(StorageError::Corruption(format!(
            "Record too short: {} bytes",
            data.len()
        )));
    }

    if data[0..4] != RECORD_MAGIC {
        return Err(StorageError::Corruption(format!(
            "Invalid magic: {:?}",
            &data[0..4]
        )));
    }

    let version = data[4];
    if version > RECORD_VERSION {
        return Err(StorageError::Corruption(format!(
            "Unsupported record version: {}",
            version
        )));
    }

    let stored_kind = Kind::try_from(data[5])?;
    if stored_kind != kind {
        return Err(StorageError::Corruption(format!(
            "Expected {} record, found {}",
            kind, stored_kind
        )));
    }

    let stored_checksum = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
    let payload = &data[HEADER_SIZE..];
    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(StorageError::Corruption(format!(
            "Checksum mismatch: stored={}, computed={}",
            stored_checksum, computed_checksum
        )));
    }

    let decompressed = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    Ok(bincode::deserialize(&decompressed)?)
}
