//! Etags: fixed-width mutation identifiers.
//!
//! Every persisted mutation gets an etag. Etags are compared byte-wise
//! (lexicographically), which for etags built from a sequence number with
//! [`Etag::from_sequence`] is the same as numeric order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Width of an etag in bytes.
pub const ETAG_LEN: usize = 16;

/// A totally ordered, fixed-width mutation identifier.
///
/// Serialized as a 32-character lowercase hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Etag([u8; ETAG_LEN]);

impl Etag {
    /// The empty watermark. Compares less than or equal to every etag.
    pub const ZERO: Etag = Etag([0u8; ETAG_LEN]);

    /// Create an etag from raw bytes.
    pub fn from_bytes(bytes: [u8; ETAG_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an etag from a slice, which must be exactly [`ETAG_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        let array: [u8; ETAG_LEN] = bytes.try_into().map_err(|_| {
            TypesError::InvalidEtag(format!("expected {} bytes, got {}", ETAG_LEN, bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Create an etag from a sequence number (big-endian, so byte order
    /// matches numeric order).
    pub fn from_sequence(sequence: u128) -> Self {
        Self(sequence.to_be_bytes())
    }

    /// The sequence number this etag encodes.
    pub fn sequence(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// The etag immediately after this one.
    pub fn next(&self) -> Self {
        Self::from_sequence(self.sequence().wrapping_add(1))
    }

    pub fn as_bytes(&self) -> &[u8; ETAG_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Lowercase hex encoding, always 32 characters.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Etag {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ETAG_LEN * 2 || !s.is_ascii() {
            return Err(TypesError::InvalidEtag(format!(
                "expected {} hex characters: {}",
                ETAG_LEN * 2,
                s
            )));
        }

        let mut bytes = [0u8; ETAG_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| TypesError::InvalidEtag(format!("{}: {}", s, e)))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Etag {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Etag> for String {
    fn from(etag: Etag) -> Self {
        etag.to_hex()
    }
}
