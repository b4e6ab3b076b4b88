//! Package metadata served by a catalog.

use crate::hash::Blake3Hash;
use crate::marker::{Environment, Marker};
use crate::requirement::Requirement;
use crate::types::{ExtraName, PackageName, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One published version of a package, as served by a catalog.
///
/// Identified uniquely by `(name, version)`. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Package name.
    pub name: PackageName,
    /// Exact version.
    pub version: Version,
    /// Unconditional runtime requirements (still subject to their markers).
    #[serde(default)]
    pub requires: Vec<Requirement>,
    /// Optional dependency groups, activated by `name[extra]` requirements.
    #[serde(default)]
    pub extras: BTreeMap<ExtraName, Vec<Requirement>>,
    /// Environments the artifact installs on. Empty means everywhere.
    #[serde(default)]
    pub environments: Vec<Marker>,
    /// BLAKE3 digest of the artifact bytes.
    pub digest: Blake3Hash,
    /// Publication time, used by date-bounded resolution.
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
}

impl PackageVersion {
    /// Whether the artifact can be installed in `env`.
    pub fn supports(&self, env: &Environment) -> bool {
        self.environments.is_empty() || self.environments.iter().any(|m| m.matches(env))
    }

    /// Whether the artifact can be installed in every one of `envs`.
    pub fn supports_all<'a>(&self, envs: impl IntoIterator<Item = &'a Environment>) -> bool {
        envs.into_iter().all(|env| self.supports(env))
    }

    /// The requirements of an extra, or `None` if the package does not
    /// declare it.
    pub fn extra(&self, extra: &ExtraName) -> Option<&[Requirement]> {
        self.extras.get(extra).map(Vec::as_slice)
    }

    /// Every requirement this version can ever declare: runtime ones plus
    /// those of all extras.
    pub fn all_requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.requires
            .iter()
            .chain(self.extras.values().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageVersion {
        PackageVersion {
            name: PackageName::new("a"),
            version: Version::new(1, 0, 0),
            requires: vec![Requirement::parse("b<2.0").unwrap()],
            extras: BTreeMap::from([(
                ExtraName::new("fast"),
                vec![Requirement::parse("c>=1").unwrap()],
            )]),
            environments: vec![Marker::parse("os == linux").unwrap()],
            digest: Blake3Hash::compute(b"a-1.0.0"),
            published: None,
        }
    }

    #[test]
    fn supports_follows_environment_markers() {
        let pkg = sample();
        assert!(pkg.supports(&Environment::parse("3.11-linux-x86_64").unwrap()));
        assert!(!pkg.supports(&Environment::parse("3.11-macos-x86_64").unwrap()));

        let everywhere = PackageVersion {
            environments: vec![],
            ..sample()
        };
        assert!(everywhere.supports(&Environment::parse("3.11-windows-x86_64").unwrap()));
    }

    #[test]
    fn all_requirements_includes_extras() {
        let pkg = sample();
        let names: Vec<&str> = pkg.all_requirements().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(pkg.extra(&ExtraName::new("fast")).is_some());
        assert!(pkg.extra(&ExtraName::new("slow")).is_none());
    }

    #[test]
    fn serde_round_trip_through_json() {
        let pkg = sample();
        let json = serde_json::to_string(&pkg).unwrap();
        let back: PackageVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pkg);
    }
}
