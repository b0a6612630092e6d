//! On-store framing for cached artifacts
//!
//! Layout (bincode): magic, schema version, key, write time, SHA-256 of the
//! payload, payload bytes. A read is trusted only when every field matches the
//! requested key and the checksum recomputes.

use crate::error::{CacheError, CacheResult};
use crate::keys::{ArtifactKey, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MAGIC: [u8; 4] = *b"RCAF";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 4],
    schema_version: u32,
    epoch_id: String,
    kind: String,
    written_at: i64,
    checksum: String,
    payload: Vec<u8>,
}

/// Metadata of a decoded entry
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub written_at: i64,
    pub payload_len: usize,
}

pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn seal(key: &ArtifactKey, payload: Vec<u8>) -> CacheResult<Vec<u8>> {
    let envelope = Envelope {
        magic: MAGIC,
        schema_version: SCHEMA_VERSION,
        epoch_id: key.epoch_id.clone(),
        kind: key.kind.clone(),
        written_at: chrono::Utc::now().timestamp(),
        checksum: checksum(&payload),
        payload,
    };
    Ok(bincode::serialize(&envelope)?)
}

pub fn open(key: &ArtifactKey, bytes: &[u8]) -> CacheResult<(Vec<u8>, EntryInfo)> {
    let envelope: Envelope = bincode::deserialize(bytes)
        .map_err(|e| CacheError::Corrupt(format!("{}: undecodable envelope ({})", key, e)))?;

    if envelope.magic != MAGIC {
        return Err(CacheError::Corrupt(format!("{}: bad magic", key)));
    }
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(CacheError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }
    if envelope.epoch_id != key.epoch_id || envelope.kind != key.kind {
        return Err(CacheError::Corrupt(format!(
            "{}: entry belongs to {}:{}",
            key, envelope.epoch_id, envelope.kind
        )));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(CacheError::ChecksumMismatch(key.to_string()));
    }

    let info = EntryInfo {
        written_at: envelope.written_at,
        payload_len: envelope.payload.len(),
    };
    Ok((envelope.payload, info))
}
