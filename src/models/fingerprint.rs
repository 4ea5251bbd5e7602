//! Stage fingerprints for crash-resume.
//!
//! A fingerprint is a stable SHA-256 digest of everything that determines a
//! stage's semantics: the command vector, the input and output paths, and
//! parameters such as the memory override. Two processes building the same
//! pipeline must derive identical fingerprints, so hashing uses a canonical
//! length-prefixed encoding rather than a serializer whose output could
//! drift between versions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest identifying a stage's semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest, as read from the completion log.
    ///
    /// Returns `None` for anything that is not 64 hex characters, so a
    /// corrupt log line is dropped instead of poisoning the resume set.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental fingerprint builder.
///
/// Every field is written as `len(tag) tag len(value) value` so that
/// adjacent fields can never collide by concatenation.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn field(mut self, tag: &str, value: &str) -> Self {
        self.hasher.update((tag.len() as u64).to_le_bytes());
        self.hasher.update(tag.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}
