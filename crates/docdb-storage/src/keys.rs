//! Key encoding and decoding for the storage layer.
//!
//! Variable-length components are length-prefixed (`{len:04}:{name}`) so
//! that one index's key range can never overlap another's, whatever
//! characters the names contain. Etags are encoded as 32 hex characters,
//! which sort the same way as the raw bytes.
//!
//! - mapped result: `mr:{len:04}:{index}:{etag}`
//! - mapped result by reduce key: `mrk:{len:04}:{index}:{len:04}:{reduce_key}:{group:010}:{etag}`
//! - reduced result: `rr:{len:04}:{index}:{len:04}:{reduce_key}:{group:010}`
//! - stats / definition: `stats:{index}`, `def:{index}`

use docdb_types::{Etag, ReduceKeyAndGroupId};

use crate::error::StorageError;

fn push_component(out: &mut String, component: &str) {
    out.push_str(&format!("{:04}:{}:", component.len(), component));
}

/// Split a length-prefixed component off the front of `s`.
fn take_component(s: &str) -> Result<(&str, &str), StorageError> {
    let (len, rest) = s
        .split_once(':')
        .ok_or_else(|| StorageError::Key(format!("Missing length prefix: {}", s)))?;
    let len: usize = len
        .parse()
        .map_err(|e| StorageError::Key(format!("Invalid length prefix: {}", e)))?;
    if rest.len() < len + 1 || !rest.is_char_boundary(len) || &rest[len..len + 1] != ":" {
        return Err(StorageError::Key(format!("Truncated component: {}", s)));
    }
    Ok((&rest[..len], &rest[len + 1..]))
}

/// Key of one mapped result's metadata (and payload).
/// Format: mr:{len:04}:{index}:{etag}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedResultKey {
    pub index: String,
    pub etag: Etag,
}

impl MappedResultKey {
    pub fn new(index: impl Into<String>, etag: Etag) -> Self {
        Self {
            index: index.into(),
            etag,
        }
    }

    /// Prefix shared by every mapped result of `index`.
    pub fn index_prefix(index: &str) -> Vec<u8> {
        let mut key = String::from("mr:");
        push_component(&mut key, index);
        key.into_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut key = Self::index_prefix(&self.index);
        key.extend_from_slice(self.etag.to_hex().as_bytes());
        key
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        let rest = s
            .strip_prefix("mr:")
            .ok_or_else(|| StorageError::Key(format!("Invalid mapped result key: {}", s)))?;
        let (index, etag) = take_component(rest)?;
        let etag: Etag = etag.parse()?;
        Ok(Self::new(index, etag))
    }
}

/// Secondary index entry locating mapped results by reduce key and group.
/// Format: mrk:{len:04}:{index}:{len:04}:{reduce_key}:{group:010}:{etag}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceKeyIndexKey {
    pub index: String,
    pub reduce_key: ReduceKeyAndGroupId,
    pub etag: Etag,
}

impl ReduceKeyIndexKey {
    pub fn new(index: impl Into<String>, reduce_key: ReduceKeyAndGroupId, etag: Etag) -> Self {
        Self {
            index: index.into(),
            reduce_key,
            etag,
        }
    }

    /// Prefix shared by every mapped result of one key/group of `index`.
    pub fn group_prefix(index: &str, reduce_key: &ReduceKeyAndGroupId) -> Vec<u8> {
        let mut key = String::from("mrk:");
        push_component(&mut key, index);
        push_component(&mut key, &reduce_key.reduce_key);
        key.push_str(&format!("{:010}:", reduce_key.reduce_group_id));
        key.into_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut key = Self::group_prefix(&self.index, &self.reduce_key);
        key.extend_from_slice(self.etag.to_hex().as_bytes());
        key
    }

    /// Recover the etag from an encoded key; it is always the final 32 characters.
    pub fn etag_from_bytes(bytes: &[u8]) -> Result<Etag, StorageError> {
        let hex_len = docdb_types::ETAG_LEN * 2;
        if bytes.len() < hex_len {
            return Err(StorageError::Key("Reduce key index entry too short".to_string()));
        }
        let hex = std::str::from_utf8(&bytes[bytes.len() - hex_len..])
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        Ok(hex.parse()?)
    }
}

/// Key of one reduced output row.
/// Format: rr:{len:04}:{index}:{len:04}:{reduce_key}:{group:010}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedResultKey {
    pub index: String,
    pub reduce_key: ReduceKeyAndGroupId,
}

impl ReducedResultKey {
    pub fn new(index: impl Into<String>, reduce_key: ReduceKeyAndGroupId) -> Self {
        Self {
            index: index.into(),
            reduce_key,
        }
    }

    pub fn index_prefix(index: &str) -> Vec<u8> {
        let mut key = String::from("rr:");
        push_component(&mut key, index);
        key.into_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut key = String::from("rr:");
        push_component(&mut key, &self.index);
        push_component(&mut key, &self.reduce_key.reduce_key);
        key.push_str(&format!("{:010}", self.reduce_key.reduce_group_id));
        key.into_bytes()
    }
}

/// Format: stats:{index}
pub fn stats_key(index: &str) -> Vec<u8> {
    format!("stats:{}", index).into_bytes()
}

/// Format: def:{index}
pub fn definition_key(index: &str) -> Vec<u8> {
    format!("def:{}", index).into_bytes()
}

/// Key in the metadata column family holding the highest etag handed out.
pub const LAST_ETAG_KEY: &[u8] = b"last_etag";
