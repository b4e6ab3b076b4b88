//! Package catalogs: where version metadata and artifacts come from.
//!
//! The resolver only depends on the [`Catalog`] trait. [`InMemoryCatalog`]
//! serves a fixed snapshot, loaded from TOML or built in code, and is what
//! tests and offline tooling use. Network-backed catalogs wrap a remote index
//! behind the same trait, usually behind a [`crate::cache::CachedCatalog`].

use crate::cache::CacheError;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use strand_schema::{Blake3Hash, PackageName, PackageVersion, ParseError, Requirement, Version};
use thiserror::Error;

/// Errors returned by catalog lookups.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog has never heard of the package.
    #[error("Package not found: {0}")]
    NotFound(PackageName),

    /// The lookup failed. The catalog may be unreachable or return garbage.
    #[error("Failed to look up {name}: {reason}")]
    Unavailable {
        /// Package being looked up.
        name: PackageName,
        /// What went wrong.
        reason: String,
    },

    /// The artifact for a version could not be retrieved.
    #[error("Failed to fetch artifact for {name} {version}: {reason}")]
    Artifact {
        /// Package name.
        name: PackageName,
        /// Package version.
        version: Version,
        /// What went wrong.
        reason: String,
    },

    /// Offline mode and the answer is not cached.
    #[error("{0} is not cached and the catalog is offline")]
    Offline(PackageName),

    /// The local cache failed underneath the catalog.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Source of package metadata and artifacts.
///
/// Implementations must be safe to call concurrently; the resolver issues
/// many lookups at once.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All published versions of `name`, in any order.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the name is unknown, other variants
    /// when the lookup itself failed.
    async fn list_versions(&self, name: &PackageName) -> Result<Vec<PackageVersion>, CatalogError>;

    /// The artifact bytes of one version.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Artifact`] if the bytes cannot be retrieved.
    async fn fetch_artifact(&self, package: &PackageVersion) -> Result<Vec<u8>, CatalogError>;
}

#[async_trait]
impl<T: Catalog + ?Sized> Catalog for Arc<T> {
    async fn list_versions(&self, name: &PackageName) -> Result<Vec<PackageVersion>, CatalogError> {
        (**self).list_versions(name).await
    }

    async fn fetch_artifact(&self, package: &PackageVersion) -> Result<Vec<u8>, CatalogError> {
        (**self).fetch_artifact(package).await
    }
}

/// On-disk snapshot format: a list of `[[package]]` tables.
#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    package: Vec<PackageVersion>,
}

/// A catalog held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    packages: BTreeMap<PackageName, Vec<PackageVersion>>,
    artifacts: HashMap<Blake3Hash, Vec<u8>>,
}

impl InMemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML snapshot of `[[package]]` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid snapshot.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let snapshot: Snapshot = toml::from_str(text).context("Failed to parse catalog snapshot")?;
        let mut catalog = Self::new();
        for package in snapshot.package {
            catalog.insert(package);
        }
        Ok(catalog)
    }

    /// Load a TOML snapshot from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog snapshot {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Add a version. A version already present is replaced.
    pub fn insert(&mut self, package: PackageVersion) {
        let versions = self.packages.entry(package.name.clone()).or_default();
        versions.retain(|p| p.version != package.version);
        versions.push(package);
    }

    /// Add a version whose artifact is `name==version`, digest included.
    ///
    /// Returns the stored entry so callers can attach extras, markers or a
    /// publication date.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] if the name, version or any requirement is
    /// malformed.
    pub fn publish(
        &mut self,
        name: &str,
        version: &str,
        requires: &[&str],
    ) -> Result<&mut PackageVersion, ParseError> {
        let name = PackageName::parse(name)?;
        let version = Version::parse(version)?;
        let requires = requires
            .iter()
            .map(|r| Requirement::parse(r))
            .collect::<Result<Vec<_>, _>>()?;

        let artifact = format!("{name}=={version}").into_bytes();
        let digest = Blake3Hash::compute(&artifact);
        self.artifacts.insert(digest.clone(), artifact);

        self.insert(PackageVersion {
            name: name.clone(),
            version,
            requires,
            extras: BTreeMap::new(),
            environments: Vec::new(),
            digest,
            published: None,
        });

        let versions = self.packages.entry(name).or_default();
        let idx = versions
            .iter()
            .position(|p| p.version == version)
            .unwrap_or(versions.len() - 1);
        Ok(&mut versions[idx])
    }

    /// Serve `bytes` as the artifact for `digest`, whether or not they hash
    /// to it.
    pub fn set_artifact(&mut self, digest: Blake3Hash, bytes: Vec<u8>) {
        self.artifacts.insert(digest, bytes);
    }

    /// Number of package names known.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the catalog has no packages.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn list_versions(&self, name: &PackageName) -> Result<Vec<PackageVersion>, CatalogError> {
        self.packages
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(name.clone()))
    }

    async fn fetch_artifact(&self, package: &PackageVersion) -> Result<Vec<u8>, CatalogError> {
        self.artifacts
            .get(&package.digest)
            .cloned()
            .ok_or_else(|| CatalogError::Artifact {
                name: package.name.clone(),
                version: package.version,
                reason: "no artifact for digest".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"
[[package]]
name = "a"
version = "1.0"
requires = ["b<2.0"]
digest = "blake3:af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"

[[package]]
name = "b"
version = "1.0"
digest = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
published = "2024-01-01T00:00:00Z"

[package.extras]
fast = ["c>=1 ; os == linux"]
"#;

    #[tokio::test]
    async fn loads_toml_snapshot() {
        let catalog = InMemoryCatalog::from_toml(SNAPSHOT).unwrap();
        assert_eq!(catalog.len(), 2);

        let b = catalog.list_versions(&PackageName::new("b")).await.unwrap();
        assert_eq!(b.len(), 1);
        assert!(b[0].published.is_some());
        assert_eq!(b[0].extras.len(), 1);
    }

    #[test]
    fn rejects_bad_snapshot() {
        let err = InMemoryCatalog::from_toml("[[package]]\nname = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("catalog snapshot"));
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let catalog = InMemoryCatalog::new();
        let err = catalog
            .list_versions(&PackageName::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn published_artifact_matches_digest() {
        let mut catalog = InMemoryCatalog::new();
        let pkg = catalog.publish("a", "1.0", &["b"]).unwrap().clone();
        let bytes = catalog.fetch_artifact(&pkg).await.unwrap();
        assert_eq!(Blake3Hash::compute(&bytes), pkg.digest);
    }

    #[test]
    fn publishing_same_version_replaces() {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &[]).unwrap();
        catalog.publish("a", "1.0", &["b"]).unwrap();
        assert_eq!(catalog.packages[&PackageName::new("a")].len(), 1);
        assert_eq!(catalog.packages[&PackageName::new("a")][0].requires.len(), 1);
    }
}
