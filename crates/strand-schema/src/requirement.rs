//! Requirement lines: `name[extras] spec ; marker`.

use crate::error::ParseError;
use crate::marker::{Environment, Marker};
use crate::specifier::VersionSpec;
use crate::types::{ExtraName, PackageName, Version};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A named constraint on acceptable versions of a package.
///
/// Textual form: `name[extra1,extra2] <spec> ; <marker>`, where everything
/// after the name is optional:
///
/// ```
/// use strand_schema::Requirement;
///
/// let req: Requirement = "httpx[http2] >=0.27, <1 ; python >= 3.9".parse().unwrap();
/// assert_eq!(req.name.as_str(), "httpx");
/// assert_eq!(req.to_string(), "httpx[http2]>=0.27.0,<1.0.0 ; python >=3.9.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    /// The required package.
    pub name: PackageName,
    /// Optional dependency groups to activate on the required package.
    pub extras: BTreeSet<ExtraName>,
    /// Acceptable versions.
    pub spec: VersionSpec,
    /// Environments in which the requirement is active.
    pub marker: Marker,
}

impl Requirement {
    /// A requirement on `name` with the given spec and no extras or marker.
    pub fn new(name: PackageName, spec: VersionSpec) -> Self {
        Self {
            name,
            extras: BTreeSet::new(),
            spec,
            marker: Marker::always(),
        }
    }

    /// Parse a requirement line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidRequirement`] for structural problems and
    /// the component parse errors for bad names, specs or markers.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidRequirement {
            requirement: s.to_string(),
            reason: reason.to_string(),
        };

        let (body, marker) = match s.split_once(';') {
            Some((body, marker)) => (body.trim(), Marker::parse(marker)?),
            None => (s.trim(), Marker::always()),
        };

        let name_end = body
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(body.len());
        if name_end == 0 {
            return Err(invalid("missing package name"));
        }
        let name = PackageName::parse(&body[..name_end])?;
        let mut rest = body[name_end..].trim_start();

        let mut extras = BTreeSet::new();
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            for extra in after[..close].split(',') {
                if extra.trim().is_empty() {
                    return Err(invalid("empty extra name"));
                }
                extras.insert(ExtraName::parse(extra)?);
            }
            rest = after[close + 1..].trim_start();
        }

        if rest.contains(['[', ']']) {
            return Err(invalid("unexpected bracket"));
        }

        Ok(Self {
            name,
            extras,
            spec: VersionSpec::parse(rest)?,
            marker,
        })
    }

    /// Whether the requirement is active in `env`.
    pub fn applies_to(&self, env: &Environment) -> bool {
        self.marker.matches(env)
    }

    /// Whether `version` of the named package satisfies the constraint.
    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.spec.contains(version)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(ExtraName::as_str).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        write!(f, "{}", self.spec)?;
        if !self.marker.is_always() {
            write!(f, " ; {}", self.marker)?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Requirement {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Requirement {
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
    fn parses_bare_name() {
        let req = Requirement::parse("requests").unwrap();
        assert_eq!(req.name.as_str(), "requests");
        assert!(req.spec.is_any());
        assert!(req.extras.is_empty());
        assert!(req.marker.is_always());
    }

    #[test]
    fn parses_all_components() {
        let req = Requirement::parse("Foo_Bar[Extra-One, two] >= 1.0, != 1.5 ; os == linux").unwrap();
        assert_eq!(req.name.as_str(), "foo-bar");
        assert_eq!(req.extras.len(), 2);
        assert!(req.extras.contains(&ExtraName::new("extra-one")));
        assert!(req.is_satisfied_by(&Version::new(1, 4, 0)));
        assert!(!req.is_satisfied_by(&Version::new(1, 5, 0)));
        assert_eq!(
            req.to_string(),
            "foo-bar[extra-one,two]>=1.0.0,!=1.5.0 ; os == linux"
        );
    }

    #[test]
    fn canonical_form_reparses_to_same_value() {
        let req = Requirement::parse("a[x] ~=2.1 ; python < 3.13 and arch == arm64").unwrap();
        let again = Requirement::parse(&req.to_string()).unwrap();
        assert_eq!(req, again);
    }

    #[test]
    fn rejects_malformed_requirements() {
        for bad in ["", ">=1.0", "a[", "a[]", "a[x]]", "a >=x", "a ; os == plan9"] {
            assert!(Requirement::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
