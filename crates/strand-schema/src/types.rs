//! Package names, extra names and release versions.

use crate::error::ParseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Normalize a raw name: lowercase, runs of `-`, `_` and `.` fold into one `-`.
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('-');
        }
        pending_sep = false;
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn validate_name(raw: &str) -> Result<String, ParseError> {
    let trimmed = raw.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && trimmed.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(ParseError::InvalidName(raw.to_string()));
    }
    Ok(normalize_name(trimmed))
}

/// A normalized package name.
///
/// Names compare case-insensitively and treat `-`, `_` and `.` as the same
/// separator, so `Foo_Bar` and `foo-bar` refer to the same package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Create a new package name, normalizing the input without validation.
    pub fn new(name: &str) -> Self {
        Self(normalize_name(name))
    }

    /// Parse and validate a package name.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidName`] if the name is empty or contains
    /// characters other than ASCII alphanumerics, `-`, `_` and `.`.
    pub fn parse(name: &str) -> Result<Self, ParseError> {
        validate_name(name).map(Self)
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == normalize_name(other)
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == normalize_name(other)
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl FromStr for PackageName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Name of an optional dependency group ("extra") of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExtraName(String);

impl ExtraName {
    /// Create an extra name, normalizing the input without validation.
    pub fn new(name: &str) -> Self {
        Self(normalize_name(name))
    }

    /// Parse and validate an extra name.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidName`] for empty or illegal names.
    pub fn parse(name: &str) -> Result<Self, ParseError> {
        validate_name(name).map(Self)
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ExtraName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ExtraName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExtraName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A numeric release version (`major.minor.patch`).
///
/// Shorter inputs are zero-padded, so `1.0` and `1.0.0` are the same
/// version. Ordering is numeric, segment by segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    /// Major release number.
    pub major: u32,
    /// Minor release number.
    pub minor: u32,
    /// Patch release number.
    pub patch: u32,
}

impl Version {
    /// Construct a version from its three segments.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, returning it with the number of segments
    /// the input actually spelled out (needed by `~=`).
    pub(crate) fn parse_with_precision(s: &str) -> Result<(Self, usize), ParseError> {
        let s = s.trim();
        let parts: Vec<&str> = s.split('.').collect();
        if s.is_empty() || parts.len() > 3 {
            return Err(ParseError::InvalidVersion(s.to_string()));
        }

        let mut segments = [0u32; 3];
        for (slot, part) in segments.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(ParseError::InvalidVersion(s.to_string()));
            }
            *slot = part
                .parse()
                .map_err(|_| ParseError::InvalidVersion(s.to_string()))?;
        }

        Ok((
            Self::new(segments[0], segments[1], segments[2]),
            parts.len(),
        ))
    }

    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidVersion`] unless the input is one to three
    /// dot-separated unsigned integers.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        Self::parse_with_precision(s).map(|(v, _)| v)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_normalize_separators_and_case() {
        assert_eq!(PackageName::new("Foo_Bar"), PackageName::new("foo-bar"));
        assert_eq!(PackageName::new("zope.interface").as_str(), "zope-interface");
        assert_eq!(PackageName::new("a__b").as_str(), "a-b");
        assert!(PackageName::new("Requests") == "requests");
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(PackageName::parse("").is_err());
        assert!(PackageName::parse("bad name").is_err());
        assert!(PackageName::parse("-leading").is_err());
        assert!(PackageName::parse("ok-name_1.2").is_ok());
    }

    #[test]
    fn versions_are_zero_padded() {
        assert_eq!(Version::parse("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(Version::parse("1.0").unwrap(), Version::parse("1.0.0").unwrap());
        assert_eq!(Version::parse("3.11").unwrap().to_string(), "3.11.0");
    }

    #[test]
    fn versions_order_numerically() {
        assert!(Version::parse("1.10").unwrap() > Version::parse("1.9").unwrap());
        assert!(Version::parse("2.0").unwrap() > Version::parse("1.99.99").unwrap());
    }

    #[test]
    fn malformed_versions_are_rejected() {
        for bad in ["", "1.", "1..2", "1.2.3.4", "1.0a", "v1.0", "1.-2"] {
            assert!(Version::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn version_serde_uses_canonical_string() {
        let v = Version::parse("2.5").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"2.5.0\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
