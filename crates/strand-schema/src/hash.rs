//! Content digests and requirement fingerprints.

use crate::error::ParseError;
use crate::requirement::Requirement;
use serde::{Deserialize, Deserializer, Serialize};

/// BLAKE3 digest used as the key of every content-addressed object.
///
/// Always 64 lowercase hex characters; validated at construction and at
/// deserialization time so malformed digests never propagate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Blake3Hash(String);

impl Blake3Hash {
    /// Validate a hex digest, accepting an optional `blake3:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidDigest`] if the hex portion is not exactly
    /// 64 hex characters.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);
        if hex.len() != 64 || hex::decode(hex).is_err() {
            return Err(ParseError::InvalidDigest(s.to_string()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Compute BLAKE3 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(hash.to_hex().to_string())
    }

    /// Return the inner hex string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Blake3Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Blake3Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Blake3Hash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Deterministic hash of a set of root requirements.
///
/// Requirements are reduced to their canonical text, sorted and
/// de-duplicated before hashing, so declaration order and formatting
/// whitespace do not matter while any semantic edit does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Blake3Hash);

impl Fingerprint {
    /// Fingerprint a set of root requirements.
    ///
    /// Change detection works on canonical text, not raw text: edits that
    /// canonicalize to the same requirement (`B` and `b`, `a >= 1.0` and
    /// `a>=1.0.0`) or only reorder or repeat lines keep the fingerprint.
    pub fn of<'a>(requirements: impl IntoIterator<Item = &'a Requirement>) -> Self {
        let mut lines: Vec<String> = requirements.into_iter().map(ToString::to_string).collect();
        lines.sort();
        lines.dedup();

        let mut hasher = blake3::Hasher::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        Self(Blake3Hash(hasher.finalize().to_hex().to_string()))
    }

    /// The underlying digest.
    pub fn digest(&self) -> &Blake3Hash {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
