//! Target platforms and environment markers.
//!
//! An [`Environment`] is one concrete `(python, os, arch)` tuple a resolution
//! must hold for. A [`Marker`] is a predicate over environments attached to
//! requirements and package artifacts.

use crate::error::ParseError;
use crate::specifier::VersionSpec;
use crate::types::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Operating system family.
///
/// # Example
///
/// ```
/// use strand_schema::Os;
///
/// let os: Os = "darwin".parse().unwrap();
/// assert_eq!(os, Os::Macos);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Os {
    /// Linux distributions.
    Linux,
    /// macOS.
    Macos,
    /// Windows.
    Windows,
}

impl Os {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Os {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "macos" | "darwin" | "osx" => Ok(Self::Macos),
            "windows" | "win32" => Ok(Self::Windows),
            _ => Err(ParseError::UnknownOs(s.to_string())),
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    /// `x86_64` (Intel / AMD 64-bit).
    X86_64,
    /// 64-bit ARM (Apple Silicon, Graviton).
    Aarch64,
}

impl Arch {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            _ => Err(ParseError::UnknownArch(s.to_string())),
        }
    }
}

/// A concrete target the resolution must satisfy.
///
/// Ordered by python version, then OS, then architecture; that order is the
/// one used when laying out lock files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Environment {
    /// Interpreter version.
    pub python: Version,
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
}

impl Environment {
    /// Construct an environment.
    pub fn new(python: Version, os: Os, arch: Arch) -> Self {
        Self { python, os, arch }
    }

    /// Parse a descriptor such as `3.11-linux-x86_64`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidEnvironment`] if the descriptor does not
    /// have exactly three dash-separated fields, or the field-specific error
    /// when one of them is unknown.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        let [python, os, arch] = parts.as_slice() else {
            return Err(ParseError::InvalidEnvironment(s.to_string()));
        };
        let python =
            Version::parse(python).map_err(|_| ParseError::InvalidEnvironment(s.to_string()))?;
        Ok(Self {
            python,
            os: os.parse()?,
            arch: arch.parse()?,
        })
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Version {
            major,
            minor,
            patch,
        } = self.python;
        if patch == 0 {
            write!(f, "{major}.{minor}-{}-{}", self.os, self.arch)
        } else {
            write!(f, "{major}.{minor}.{patch}-{}-{}", self.os, self.arch)
        }
    }
}

impl FromStr for Environment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Environment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A single clause of a [`Marker`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerClause {
    /// Interpreter version constraint, e.g. `python >= 3.11`.
    Python(VersionSpec),
    /// `os == <os>` (`equal = true`) or `os != <os>`.
    Os {
        /// Whether the clause is an equality test.
        equal: bool,
        /// The operating system compared against.
        os: Os,
    },
    /// `arch == <arch>` (`equal = true`) or `arch != <arch>`.
    Arch {
        /// Whether the clause is an equality test.
        equal: bool,
        /// The architecture compared against.
        arch: Arch,
    },
}

impl MarkerClause {
    fn matches(&self, env: &Environment) -> bool {
        match self {
            Self::Python(spec) => spec.contains(&env.python),
            Self::Os { equal, os } => (env.os == *os) == *equal,
            Self::Arch { equal, arch } => (env.arch == *arch) == *equal,
        }
    }

    fn parse(raw: &str, whole: &str) -> Result<Self, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidMarker {
            marker: whole.to_string(),
            reason: reason.to_string(),
        };

        let text = raw.trim();
        let key_end = text
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(text.len());
        let (key, rest) = text.split_at(key_end);
        let rest = rest.trim();

        match key {
            "python" | "python_version" | "python_full_version" => {
                let spec = VersionSpec::parse(&unquote(rest))
                    .map_err(|_| invalid("malformed python constraint"))?;
                if spec.is_any() {
                    return Err(invalid("python clause needs a comparison"));
                }
                Ok(Self::Python(spec))
            }
            "os" | "sys_platform" | "platform_system" => {
                let (equal, value) = split_equality(rest).ok_or_else(|| invalid("expected == or !="))?;
                Ok(Self::Os {
                    equal,
                    os: value.parse()?,
                })
            }
            "arch" | "platform_machine" => {
                let (equal, value) = split_equality(rest).ok_or_else(|| invalid("expected == or !="))?;
                Ok(Self::Arch {
                    equal,
                    arch: value.parse()?,
                })
            }
            "" => Err(invalid("empty clause")),
            other => Err(invalid(&format!("unknown marker variable '{other}'"))),
        }
    }
}

fn unquote(s: &str) -> String {
    s.chars().filter(|c| *c != '"' && *c != '\'').collect()
}

fn split_equality(rest: &str) -> Option<(bool, String)> {
    if let Some(value) = rest.strip_prefix("==") {
        Some((true, unquote(value.trim())))
    } else {
        rest.strip_prefix("!=")
            .map(|value| (false, unquote(value.trim())))
    }
}

impl fmt::Display for MarkerClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = |equal: bool| if equal { "==" } else { "!=" };
        match self {
            Self::Python(spec) => write!(f, "python {spec}"),
            Self::Os { equal, os } => write!(f, "os {} {os}", op(*equal)),
            Self::Arch { equal, arch } => write!(f, "arch {} {arch}", op(*equal)),
        }
    }
}

/// A conjunction of [`MarkerClause`]s. The empty marker matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Marker {
    clauses: Vec<MarkerClause>,
}

impl Marker {
    /// The marker that matches every environment.
    pub fn always() -> Self {
        Self::default()
    }

    /// Parse `clause and clause and ...`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidMarker`] for unknown variables or
    /// operators, and the OS/arch parse errors for unknown platform names.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::always());
        }
        let clauses = s
            .split(" and ")
            .map(|clause| MarkerClause::parse(clause, s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    /// True if this marker places no restriction.
    pub fn is_always(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The clauses of this marker.
    pub fn clauses(&self) -> &[MarkerClause] {
        &self.clauses
    }

    /// Evaluate the marker against a concrete environment.
    pub fn matches(&self, env: &Environment) -> bool {
        self.clauses.iter().all(|c| c.matches(env))
    }

    /// True if the marker matches at least one of `envs`.
    pub fn matches_any<'a>(&self, envs: impl IntoIterator<Item = &'a Environment>) -> bool {
        envs.into_iter().any(|env| self.matches(env))
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.clauses.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" and "))
    }
}

impl FromStr for Marker {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Marker {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Marker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
