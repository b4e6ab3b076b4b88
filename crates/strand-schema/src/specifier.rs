//! Version constraint expressions (`>=1.0, <2.0`, `~=1.4`, `==2.*`).

use crate::error::ParseError;
use crate::types::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a single [`Comparator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    /// `==`: exactly this version.
    Equal,
    /// `!=`: anything but this version.
    NotEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterEq,
    /// `<`
    Less,
    /// `<=`
    LessEq,
    /// `~=`: compatible release.
    Compatible,
    /// `==X.Y.*`: any version sharing the prefix.
    EqualPrefix,
    /// `!=X.Y.*`: no version sharing the prefix.
    NotEqualPrefix,
}

impl Operator {
    fn symbol(self) -> &'static str {
        match self {
            Self::Equal | Self::EqualPrefix => "==",
            Self::NotEqual | Self::NotEqualPrefix => "!=",
            Self::Greater => ">",
            Self::GreaterEq => ">=",
            Self::Less => "<",
            Self::LessEq => "<=",
            Self::Compatible => "~=",
        }
    }
}

/// One `operator version` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparator {
    operator: Operator,
    version: Version,
    /// Segments spelled out in the source; drives `~=` and `.*` bounds.
    precision: usize,
}

impl Comparator {
    /// Build a comparator from an operator and a full three-segment version.
    pub fn new(operator: Operator, version: Version) -> Self {
        Self {
            operator,
            version,
            precision: 3,
        }
    }

    /// The comparison operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// The version operand.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Exclusive upper bound for the prefix-style operators.
    ///
    /// `~=1.4` yields `2.0.0`, `~=1.4.2` yields `1.5.0`, `==1.2.*` yields
    /// `1.3.0`. Returns `None` for the plain comparison operators.
    pub fn upper_exclusive(&self) -> Option<Version> {
        match self.operator {
            Operator::Compatible => Some(bump_at(self.version, self.precision - 1)),
            Operator::EqualPrefix | Operator::NotEqualPrefix => {
                Some(bump_at(self.version, self.precision))
            }
            _ => None,
        }
    }

    /// Whether `version` satisfies this comparator.
    pub fn matches(&self, version: &Version) -> bool {
        let v = *version;
        match self.operator {
            Operator::Equal => v == self.version,
            Operator::NotEqual => v != self.version,
            Operator::Greater => v > self.version,
            Operator::GreaterEq => v >= self.version,
            Operator::Less => v < self.version,
            Operator::LessEq => v <= self.version,
            Operator::Compatible | Operator::EqualPrefix => {
                let upper = self.upper_exclusive().unwrap_or(self.version);
                v >= self.version && v < upper
            }
            Operator::NotEqualPrefix => {
                let upper = self.upper_exclusive().unwrap_or(self.version);
                !(v >= self.version && v < upper)
            }
        }
    }

    fn parse(raw: &str) -> Result<Self, ParseError> {
        const OPERATORS: [(&str, Operator); 7] = [
            ("~=", Operator::Compatible),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            (">=", Operator::GreaterEq),
            ("<=", Operator::LessEq),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ];

        let text = raw.trim();
        let invalid = |reason: &str| ParseError::InvalidSpecifier {
            spec: raw.to_string(),
            reason: reason.to_string(),
        };

        // A bare version is an exact pin.
        let (mut operator, rest) = OPERATORS
            .iter()
            .find_map(|(sym, op)| text.strip_prefix(sym).map(|rest| (*op, rest.trim())))
            .unwrap_or((Operator::Equal, text));

        let version_text = if let Some(prefix) = rest.strip_suffix(".*") {
            operator = match operator {
                Operator::Equal => Operator::EqualPrefix,
                Operator::NotEqual => Operator::NotEqualPrefix,
                _ => return Err(invalid("wildcards are only allowed with == and !=")),
            };
            prefix
        } else {
            rest
        };

        if version_text.is_empty() {
            return Err(invalid("missing version"));
        }

        let (version, precision) = Version::parse_with_precision(version_text)
            .map_err(|_| invalid("malformed version"))?;

        if operator == Operator::Compatible && precision < 2 {
            return Err(invalid("~= needs at least two version segments"));
        }

        let precision = match operator {
            Operator::Compatible | Operator::EqualPrefix | Operator::NotEqualPrefix => precision,
            _ => 3,
        };

        Ok(Self {
            operator,
            version,
            precision,
        })
    }
}

/// Increment the segment at `precision` (1-based) and zero the rest.
fn bump_at(version: Version, precision: usize) -> Version {
    match precision {
        0 | 1 => Version::new(version.major.saturating_add(1), 0, 0),
        2 => Version::new(version.major, version.minor.saturating_add(1), 0),
        _ => Version::new(
            version.major,
            version.minor,
            version.patch.saturating_add(1),
        ),
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments = [self.version.major, self.version.minor, self.version.patch];
        let shown = match self.operator {
            Operator::Compatible | Operator::EqualPrefix | Operator::NotEqualPrefix => {
                self.precision.clamp(1, 3)
            }
            _ => 3,
        };
        let version = segments[..shown]
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        let wildcard = match self.operator {
            Operator::EqualPrefix | Operator::NotEqualPrefix => ".*",
            _ => "",
        };
        write!(f, "{}{version}{wildcard}", self.operator.symbol())
    }
}

/// A conjunction of comparators. An empty spec accepts every version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VersionSpec {
    comparators: Vec<Comparator>,
}

impl VersionSpec {
    /// The spec that accepts any version.
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a spec from already-parsed comparators.
    pub fn from_comparators(comparators: Vec<Comparator>) -> Self {
        Self { comparators }
    }

    /// Parse a comma-separated list of comparators. `*` and the empty string
    /// mean "any version".
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidSpecifier`] when any comparator is
    /// malformed.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::any());
        }

        let comparators = s
            .split(',')
            .map(Comparator::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { comparators })
    }

    /// The individual comparators, in source order.
    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    /// True if the spec places no constraint.
    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }

    /// Whether `version` satisfies every comparator.
    pub fn contains(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.comparators.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for VersionSpec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
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

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn range_spec_matches_inside_only() {
        let spec = VersionSpec::parse(">=1.0, <2.0").unwrap();
        assert!(spec.contains(&v("1.0")));
        assert!(spec.contains(&v("1.9.9")));
        assert!(!spec.contains(&v("2.0")));
        assert!(!spec.contains(&v("0.9")));
    }

    #[test]
    fn any_spec_matches_everything() {
        for text in ["", "*", "  "] {
            let spec = VersionSpec::parse(text).unwrap();
            assert!(spec.is_any());
            assert!(spec.contains(&v("0.0.1")));
        }
    }

    #[test]
    fn compatible_release_bounds() {
        let minor = VersionSpec::parse("~=1.4").unwrap();
        assert!(minor.contains(&v("1.9")));
        assert!(!minor.contains(&v("2.0")));
        assert!(!minor.contains(&v("1.3.9")));

        let patch = VersionSpec::parse("~=1.4.2").unwrap();
        assert!(patch.contains(&v("1.4.7")));
        assert!(!patch.contains(&v("1.5.0")));

        assert!(VersionSpec::parse("~=1").is_err());
    }

    #[test]
    fn wildcard_prefix_matching() {
        let eq = VersionSpec::parse("==1.2.*").unwrap();
        assert!(eq.contains(&v("1.2.9")));
        assert!(!eq.contains(&v("1.3.0")));

        let ne = VersionSpec::parse("!=1.*").unwrap();
        assert!(!ne.contains(&v("1.5")));
        assert!(ne.contains(&v("2.0")));

        assert!(VersionSpec::parse(">=1.*").is_err());
    }

    #[test]
    fn bare_version_is_exact_pin() {
        let spec = VersionSpec::parse("1.2").unwrap();
        assert_eq!(spec.comparators()[0].operator(), Operator::Equal);
        assert!(spec.contains(&v("1.2.0")));
        assert!(!spec.contains(&v("1.2.1")));
    }

    #[test]
    fn display_is_canonical_and_reparses() {
        let spec = VersionSpec::parse(" >= 1.0 ,<2 , ~=1.4, ==3.*").unwrap();
        assert_eq!(spec.to_string(), ">=1.0.0,<2.0.0,~=1.4,==3.*");
        assert_eq!(VersionSpec::parse(&spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for bad in ["=>1.0", ">=", ">=1.x", "~=1.*", ">=1.0,,<2"] {
            assert!(VersionSpec::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
