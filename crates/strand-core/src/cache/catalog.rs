//! A [`Catalog`] that answers from the content store when it can.

use super::{CacheError, ContentStore};
use crate::catalog::{Catalog, CatalogError};
use async_trait::async_trait;
use std::sync::Arc;
use strand_schema::{Blake3Hash, PackageName, PackageVersion};
use tracing::{debug, warn};

const VERSIONS_REF: &str = "versions";

/// Wraps a catalog, caching version listings and artifacts.
///
/// Listings are stored as canonical JSON objects with a ref per package
/// name; artifacts are stored under their declared digest, so a catalog
/// serving bytes that do not match the digest it advertised is caught before
/// anything is cached. Corrupt cache entries are dropped and re-fetched.
#[derive(Debug)]
pub struct CachedCatalog<C> {
    inner: C,
    store: Arc<ContentStore>,
    offline: bool,
}

impl<C: Catalog> CachedCatalog<C> {
    /// Cache `inner` in `store`.
    pub fn new(inner: C, store: Arc<ContentStore>) -> Self {
        Self {
            inner,
            store,
            offline: false,
        }
    }

    /// Serve only from the cache; misses become [`CatalogError::Offline`].
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    async fn cached_versions(&self, name: &PackageName) -> Result<Option<Vec<PackageVersion>>, CacheError> {
        let Some(digest) = self.store.get_ref(VERSIONS_REF, name.as_str()).await? else {
            return Ok(None);
        };
        let bytes = match self.store.get(&digest).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(CacheError::Integrity(e)) => {
                warn!(package = %name, error = %e, "cached version listing was corrupt, refetching");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(versions) => Ok(Some(versions)),
            Err(e) => {
                warn!(package = %name, error = %e, "cached version listing is unreadable, refetching");
                Ok(None)
            }
        }
    }

    async fn store_versions(&self, name: &PackageName, versions: &[PackageVersion]) -> Result<(), CacheError> {
        let bytes = match serde_json::to_vec(versions) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(package = %name, error = %e, "version listing could not be serialized, not caching it");
                return Ok(());
            }
        };
        let digest = Blake3Hash::compute(&bytes);
        self.store.put(&digest, &bytes).await?;
        self.store.set_ref(VERSIONS_REF, name.as_str(), &digest).await
    }
}

#[async_trait]
impl<C: Catalog> Catalog for CachedCatalog<C> {
    async fn list_versions(&self, name: &PackageName) -> Result<Vec<PackageVersion>, CatalogError> {
        if let Some(versions) = self.cached_versions(name).await? {
            debug!(package = %name, count = versions.len(), "version listing served from cache");
            return Ok(versions);
        }
        if self.offline {
            return Err(CatalogError::Offline(name.clone()));
        }

        let mut versions = self.inner.list_versions(name).await?;
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        self.store_versions(name, &versions).await?;
        debug!(package = %name, count = versions.len(), "version listing cached");
        Ok(versions)
    }

    async fn fetch_artifact(&self, package: &PackageVersion) -> Result<Vec<u8>, CatalogError> {
        match self.store.get(&package.digest).await {
            Ok(Some(bytes)) => return Ok(bytes),
            Ok(None) => {}
            Err(CacheError::Integrity(e)) => {
                warn!(package = %package.name, version = %package.version, error = %e, "cached artifact was corrupt, refetching");
            }
            Err(e) => return Err(e.into()),
        }
        if self.offline {
            return Err(CatalogError::Offline(package.name.clone()));
        }

        let bytes = self.inner.fetch_artifact(package).await?;
        self.store.put(&package.digest, &bytes).await?;
        debug!(package = %package.name, version = %package.version, size = bytes.len(), "artifact cached");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IntegrityError;
    use crate::catalog::InMemoryCatalog;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Counts calls that reach the wrapped catalog.
    struct Counting {
        inner: InMemoryCatalog,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for Counting {
        async fn list_versions(&self, name: &PackageName) -> Result<Vec<PackageVersion>, CatalogError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.list_versions(name).await
        }

        async fn fetch_artifact(&self, package: &PackageVersion) -> Result<Vec<u8>, CatalogError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_artifact(package).await
        }
    }

    fn sample() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &["b<2.0"]).unwrap();
        catalog.publish("a", "2.0", &[]).unwrap();
        catalog
    }

    #[tokio::test]
    async fn second_listing_is_served_from_cache() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let cached = CachedCatalog::new(
            Counting {
                inner: sample(),
                lookups: AtomicUsize::new(0),
            },
            Arc::clone(&store),
        );
        let name = PackageName::new("a");

        let first = cached.list_versions(&name).await.unwrap();
        let second = cached.list_versions(&name).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.inner.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_serves_cache_and_rejects_misses() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let name = PackageName::new("a");

        CachedCatalog::new(sample(), Arc::clone(&store))
            .list_versions(&name)
            .await
            .unwrap();

        let offline = CachedCatalog::new(InMemoryCatalog::new(), store).offline(true);
        assert_eq!(offline.list_versions(&name).await.unwrap().len(), 2);
        let err = offline
            .list_versions(&PackageName::new("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Offline(_)));
    }

    #[tokio::test]
    async fn mismatched_artifact_is_not_cached() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let mut catalog = sample();
        let pkg = catalog.list_versions(&PackageName::new("a")).await.unwrap()[0].clone();
        catalog.set_artifact(pkg.digest.clone(), b"tampered".to_vec());

        let cached = CachedCatalog::new(catalog, Arc::clone(&store));
        let err = cached.fetch_artifact(&pkg).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Cache(CacheError::Integrity(IntegrityError::DigestMismatch { .. }))
        ));
        assert!(!store.contains(&pkg.digest).await);
    }

    #[tokio::test]
    async fn corrupt_artifact_is_refetched() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let catalog = sample();
        let pkg = catalog.list_versions(&PackageName::new("a")).await.unwrap()[0].clone();
        let cached = CachedCatalog::new(catalog, Arc::clone(&store));

        let good = cached.fetch_artifact(&pkg).await.unwrap();
        std::fs::write(store.object_path(&pkg.digest), b"bit rot").unwrap();

        assert_eq!(cached.fetch_artifact(&pkg).await.unwrap(), good);
        assert_eq!(store.get(&pkg.digest).await.unwrap().unwrap(), good);
    }
}
