//! Lock compilation.
//!
//! A lock document (`strand.lock`) records a [`ResolutionGraph`] as TOML:
//! one `[[package]]` entry per distinct `(name, version, digest)`, listing the
//! environments it applies to. A package resolved to the same version in
//! every environment is written once.
//!
//! Output is a pure function of the graph and its settings: entries are
//! sorted by name, then first environment, then version, and no timestamps
//! are recorded, so compiling the same graph twice yields identical bytes.

use crate::resolver::{ResolutionGraph, ResolutionMode, ResolveOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use strand_schema::{Blake3Hash, Environment, Fingerprint, PackageName, Version};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Lock document format version.
pub const LOCK_VERSION: u32 = 1;

/// Conventional lock file name.
pub const LOCK_FILE_NAME: &str = "strand.lock";

const HEADER: &str = "# This file is generated by strand. Do not edit.\n";

/// The lock no longer matches the requirements it claims to satisfy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Lock is stale: recorded fingerprint {found}, requirements now fingerprint to {expected}")]
pub struct StaleLockError {
    /// Fingerprint of the current requirements.
    pub expected: Fingerprint,
    /// Fingerprint recorded in the lock.
    pub found: Fingerprint,
}

/// Errors reading, parsing or writing lock documents.
#[derive(Error, Debug)]
pub enum LockError {
    /// Not valid TOML, or not a lock document.
    #[error("Failed to parse lock document: {0}")]
    Parse(#[from] toml::de::Error),

    /// Could not serialize the document.
    #[error("Failed to serialize lock document: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Parsed, but violates a structural rule.
    #[error("Invalid lock document: {0}")]
    Invalid(String),

    /// Written by an incompatible version.
    #[error("Unsupported lock version {0} (expected {LOCK_VERSION})")]
    UnsupportedVersion(u32),

    /// The lock is out of date.
    #[error(transparent)]
    Stale(#[from] StaleLockError),

    /// Filesystem failure.
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: std::path::PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// One `[[package]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    /// Package name.
    pub name: PackageName,
    /// Locked version.
    pub version: Version,
    /// Environments this entry applies to, sorted.
    pub environments: Vec<Environment>,
    /// Artifact digest.
    pub digest: Blake3Hash,
}

/// A serialized [`ResolutionGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockDocument {
    /// Format version, always [`LOCK_VERSION`] when written.
    pub version: u32,
    /// Fingerprint of the root requirements.
    pub fingerprint: Fingerprint,
    /// Ordering strategy used.
    pub resolution: ResolutionMode,
    /// Date bound used, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_newer: Option<DateTime<Utc>>,
    /// Target environments, sorted.
    pub environments: Vec<Environment>,
    /// Locked packages.
    #[serde(default, rename = "package")]
    pub packages: Vec<LockedPackage>,
}

/// A version and digest locked for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedVersion {
    /// Locked version.
    pub version: Version,
    /// Artifact digest.
    pub digest: Blake3Hash,
}

/// Environment → package → locked version.
///
/// Both a [`ResolutionGraph`] and the [`LockDocument`] compiled from it
/// produce the same view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockView(BTreeMap<Environment, BTreeMap<PackageName, LockedVersion>>);

impl LockView {
    pub(crate) fn add_environment(&mut self, env: Environment) {
        self.0.entry(env).or_default();
    }

    pub(crate) fn insert(&mut self, env: Environment, name: PackageName, locked: LockedVersion) -> Option<LockedVersion> {
        self.0.entry(env).or_default().insert(name, locked)
    }

    /// What is locked for `name` in `env`.
    pub fn get(&self, env: &Environment, name: &PackageName) -> Option<&LockedVersion> {
        self.0.get(env)?.get(name)
    }

    /// Everything locked for `env`.
    pub fn environment(&self, env: &Environment) -> Option<&BTreeMap<PackageName, LockedVersion>> {
        self.0.get(env)
    }

    /// Environments in the view.
    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.0.keys()
    }
}

/// Compiles resolution graphs into lock documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCompiler {
    mode: ResolutionMode,
    exclude_newer: Option<DateTime<Utc>>,
}

impl LockCompiler {
    /// A compiler recording the settings in `options`.
    pub fn new(options: &ResolveOptions) -> Self {
        Self {
            mode: options.mode,
            exclude_newer: options.exclude_newer,
        }
    }

    /// Compile `graph` into a lock document stamped with `fingerprint`.
    pub fn compile(&self, graph: &ResolutionGraph, fingerprint: &Fingerprint) -> LockDocument {
        let mut grouped: BTreeMap<(PackageName, Version, Blake3Hash), BTreeSet<Environment>> = BTreeMap::new();
        for (env, packages) in graph.iter() {
            for (name, resolved) in packages {
                grouped
                    .entry((name.clone(), resolved.version(), resolved.digest().clone()))
                    .or_default()
                    .insert(*env);
            }
        }

        let mut packages: Vec<LockedPackage> = grouped
            .into_iter()
            .map(|((name, version, digest), envs)| LockedPackage {
                name,
                version,
                environments: envs.into_iter().collect(),
                digest,
            })
            .collect();
        packages.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.environments.first().cmp(&b.environments.first()))
                .then_with(|| a.version.cmp(&b.version))
        });

        debug!(entries = packages.len(), "compiled lock document");
        LockDocument {
            version: LOCK_VERSION,
            fingerprint: fingerprint.clone(),
            resolution: self.mode,
            exclude_newer: self.exclude_newer,
            environments: graph.environments().copied().collect(),
            packages,
        }
    }

    /// Whether `lock` was compiled for requirements with `fingerprint`.
    pub fn validate(lock: &LockDocument, fingerprint: &Fingerprint) -> bool {
        lock.fingerprint == *fingerprint
    }
}

impl LockDocument {
    /// Parse and structurally validate a lock document.
    ///
    /// # Errors
    ///
    /// [`LockError::Parse`] for malformed TOML, [`LockError::UnsupportedVersion`]
    /// for other format versions and [`LockError::Invalid`] when an entry
    /// names an environment the lock does not target or two entries claim
    /// the same package in one environment.
    pub fn parse(text: &str) -> Result<Self, LockError> {
        let lock: Self = toml::from_str(text)?;
        if lock.version != LOCK_VERSION {
            return Err(LockError::UnsupportedVersion(lock.version));
        }

        let targets: BTreeSet<&Environment> = lock.environments.iter().collect();
        let mut claimed = BTreeSet::new();
        for package in &lock.packages {
            if package.environments.is_empty() {
                return Err(LockError::Invalid(format!(
                    "{} {} lists no environments",
                    package.name, package.version
                )));
            }
            for env in &package.environments {
                if !targets.contains(env) {
                    return Err(LockError::Invalid(format!(
                        "{} {} is locked for {env}, which is not a target environment",
                        package.name, package.version
                    )));
                }
                if !claimed.insert((&package.name, env)) {
                    return Err(LockError::Invalid(format!(
                        "{} is locked twice for {env}",
                        package.name
                    )));
                }
            }
        }
        Ok(lock)
    }

    /// Serialize to TOML. Identical documents serialize to identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Serialize`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, LockError> {
        Ok(format!("{HEADER}{}", toml::to_string_pretty(self)?))
    }

    /// Whether the lock matches `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`StaleLockError`] when it does not.
    pub fn ensure_fresh(&self, fingerprint: &Fingerprint) -> Result<(), StaleLockError> {
        if LockCompiler::validate(self, fingerprint) {
            Ok(())
        } else {
            Err(StaleLockError {
                expected: fingerprint.clone(),
                found: self.fingerprint.clone(),
            })
        }
    }

    /// Whether the lock was produced for exactly these environments and
    /// settings.
    pub fn matches_settings(&self, envs: &[Environment], options: &ResolveOptions) -> bool {
        let wanted: BTreeSet<&Environment> = envs.iter().collect();
        let recorded: BTreeSet<&Environment> = self.environments.iter().collect();
        wanted == recorded && self.resolution == options.mode && self.exclude_newer == options.exclude_newer
    }

    /// Environment → name → (version, digest).
    pub fn view(&self) -> LockView {
        let mut view = LockView::default();
        for env in &self.environments {
            view.add_environment(*env);
        }
        for package in &self.packages {
            for env in &package.environments {
                view.insert(
                    *env,
                    package.name.clone(),
                    LockedVersion {
                        version: package.version,
                        digest: package.digest.clone(),
                    },
                );
            }
        }
        view
    }

    /// Entries that apply to `env`.
    pub fn packages_for<'a>(&'a self, env: &'a Environment) -> impl Iterator<Item = &'a LockedPackage> + 'a {
        self.packages
            .iter()
            .filter(move |p| p.environments.contains(env))
    }

    /// Every locked digest.
    pub fn digests(&self) -> BTreeSet<Blake3Hash> {
        self.packages.iter().map(|p| p.digest.clone()).collect()
    }

    /// Locked versions as resolver preferences. The first entry for a name
    /// wins.
    pub fn preferences(&self) -> BTreeMap<PackageName, Version> {
        let mut preferences = BTreeMap::new();
        for package in &self.packages {
            preferences.entry(package.name.clone()).or_insert(package.version);
        }
        preferences
    }

    /// Load a lock document, returning `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Option<Self>, LockError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&content).map(Some)
    }

    /// Atomically persist the document to `path`.
    ///
    /// The file is first written to a temporary location and then renamed so
    /// that readers never observe a partially written lock.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, file writing, or the atomic rename
    /// fails.
    pub async fn save(&self, path: &Path) -> Result<(), LockError> {
        let content = self.to_toml()?;
        let io = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("lock.tmp");
        fs::write(&temp_path, &content).await.map_err(io)?;
        fs::rename(&temp_path, path).await.map_err(io)?;
        debug!(path = %path.display(), "saved lock document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_schema::Requirement;

    fn fingerprint(reqs: &[&str]) -> Fingerprint {
        let reqs: Vec<Requirement> = reqs.iter().map(|r| Requirement::parse(r).unwrap()).collect();
        Fingerprint::of(&reqs)
    }

    fn env(s: &str) -> Environment {
        Environment::parse(s).unwrap()
    }

    fn document() -> LockDocument {
        LockDocument {
            version: LOCK_VERSION,
            fingerprint: fingerprint(&["a"]),
            resolution: ResolutionMode::Highest,
            exclude_newer: None,
            environments: vec![env("3.11-linux-x86_64"), env("3.13-macos-aarch64")],
            packages: vec![LockedPackage {
                name: PackageName::new("a"),
                version: Version::new(1, 0, 0),
                environments: vec![env("3.11-linux-x86_64"), env("3.13-macos-aarch64")],
                digest: Blake3Hash::compute(b"a"),
            }],
        }
    }

    #[test]
    fn toml_round_trip_is_byte_stable() {
        let lock = document();
        let text = lock.to_toml().unwrap();
        assert!(text.starts_with(HEADER));
        assert!(text.contains("[[package]]"));

        let parsed = LockDocument::parse(&text).unwrap();
        assert_eq!(parsed, lock);
        assert_eq!(parsed.to_toml().unwrap(), text);
    }

    #[test]
    fn rejects_other_versions() {
        let mut lock = document();
        lock.version = 2;
        let text = toml::to_string(&lock).unwrap();
        assert!(matches!(
            LockDocument::parse(&text),
            Err(LockError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_undeclared_environment() {
        let mut lock = document();
        lock.packages[0].environments.push(env("3.12-windows-x86_64"));
        let text = toml::to_string(&lock).unwrap();
        assert!(matches!(LockDocument::parse(&text), Err(LockError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_claims() {
        let mut lock = document();
        let mut dup = lock.packages[0].clone();
        dup.version = Version::new(2, 0, 0);
        dup.environments = vec![env("3.11-linux-x86_64")];
        lock.packages.push(dup);
        let text = toml::to_string(&lock).unwrap();
        assert!(matches!(LockDocument::parse(&text), Err(LockError::Invalid(_))));
    }

    #[test]
    fn validate_compares_fingerprints() {
        let lock = document();
        assert!(LockCompiler::validate(&lock, &fingerprint(&["a"])));
        assert!(!LockCompiler::validate(&lock, &fingerprint(&["a", "b"])));
        assert!(lock.ensure_fresh(&fingerprint(&["a"])).is_ok());
        let stale = lock.ensure_fresh(&fingerprint(&["b"])).unwrap_err();
        assert_eq!(stale.found, lock.fingerprint);
    }

    #[test]
    fn view_expands_shared_entries() {
        let view = document().view();
        let name = PackageName::new("a");
        assert_eq!(
            view.get(&env("3.11-linux-x86_64"), &name).unwrap().version,
            Version::new(1, 0, 0)
        );
        assert!(view.get(&env("3.13-macos-aarch64"), &name).is_some());
    }

    #[test]
    fn matches_settings_checks_environments_and_mode() {
        let lock = document();
        let envs = [env("3.13-macos-aarch64"), env("3.11-linux-x86_64")];
        assert!(lock.matches_settings(&envs, &ResolveOptions::default()));
        assert!(!lock.matches_settings(&envs[..1], &ResolveOptions::default()));
        let lowest = ResolveOptions {
            mode: ResolutionMode::Lowest,
            ..ResolveOptions::default()
        };
        assert!(!lock.matches_settings(&envs, &lowest));
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        assert!(LockDocument::load(&path).await.unwrap().is_none());

        let lock = document();
        lock.save(&path).await.unwrap();
        assert_eq!(LockDocument::load(&path).await.unwrap(), Some(lock));
        assert!(!path.with_extension("lock.tmp").exists());
    }
}
