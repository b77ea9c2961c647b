use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Filename prefix reserved for binary records.
pub(crate) const BLOB_PREFIX: &str = "B_";

/// Stable 128-bit identifier for a logical key.
///
/// Derived from the SHA-256 of the key's canonical JSON encoding, truncated
/// to 16 bytes. Two keys that are equal in the data-model sense hash to the
/// same fingerprint on every platform: `serde_json` keeps object members
/// sorted (the `preserve_order` feature is not enabled), so the encoding is
/// canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(Uuid);

impl Fingerprint {
    /// Fingerprint an arbitrary structured key.
    pub fn of(key: &Value) -> Self {
        let canonical = serde_json::to_vec(key).expect("in-memory JSON value always serializes");
        let digest = Sha256::digest(&canonical);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint(Uuid::from_bytes(bytes))
    }

    /// Filename of the structured record for this fingerprint.
    pub(crate) fn record_name(&self) -> String {
        self.0.as_hyphenated().to_string()
    }

    /// Filename of the binary record for this fingerprint.
    pub(crate) fn blob_name(&self) -> String {
        format!("{BLOB_PREFIX}{}", self.0.as_hyphenated())
    }

    /// Parse a directory entry name that has the canonical record shape.
    ///
    /// Returns `None` for anything else: blob records, side files, probe
    /// files, or non-canonical renderings (uppercase, undashed).
    pub(crate) fn from_record_name(name: &str) -> Option<Self> {
        if !is_record_name(name) {
            return None;
        }
        Uuid::parse_str(name).ok().map(Fingerprint)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// Whether `name` matches `[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}`.
///
/// Hand-rolled rather than `Uuid::parse_str` because the parser also accepts
/// non-canonical forms (uppercase, braced, undashed) that must not be
/// mistaken for records.
pub(crate) fn is_record_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_digit() || (b'a'..=b'f').contains(b),
    })
}
