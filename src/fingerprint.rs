//! Content-addressed key type for cache entries.
//!
//! A [`Fingerprint`] is a fixed-width 16-byte hash, printable as 32 lowercase
//! hex characters. The first two hex characters name a shard directory and
//! the remaining thirty name the entry directory beneath it
//! (`R/<hex[0:2]>/<hex[2:]>/`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const FINGERPRINT_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    /// Derive a fingerprint from arbitrary bytes using blake3, truncated to
    /// the first 16 bytes of the 32-byte digest.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; FINGERPRINT_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..FINGERPRINT_BYTES]);
        Fingerprint(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        if decoded.len() != FINGERPRINT_BYTES {
            return None;
        }
        let mut bytes = [0u8; FINGERPRINT_BYTES];
        bytes.copy_from_slice(&decoded);
        Some(Fingerprint(bytes))
    }

    /// Relative `<shard>/<rest>` path for this key's on-disk entry directory.
    pub fn entry_path(&self) -> PathBuf {
        let hex = self.to_hex();
        let (shard, rest) = hex.split_at(2);
        PathBuf::from(shard).join(rest)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
