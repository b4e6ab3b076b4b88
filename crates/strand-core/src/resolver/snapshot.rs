//! Catalog prefetch.
//!
//! The solver runs synchronously, so every version listing it could need is
//! fetched up front. The walk is breadth-first over package names: each
//! frontier is looked up concurrently, and the requirements of the versions
//! found (extras included) that can apply in some target environment form the
//! next frontier.

use super::error::ResolveError;
use super::options::ResolveOptions;
use crate::catalog::{Catalog, CatalogError};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strand_schema::{Environment, PackageName, PackageVersion, Requirement, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Every version visible to one resolution, by package name.
#[derive(Debug, Clone, Default)]
pub(crate) struct CatalogSnapshot {
    packages: BTreeMap<PackageName, Vec<Arc<PackageVersion>>>,
}

impl CatalogSnapshot {
    /// Versions of `name` in ascending order. Empty for unknown names.
    pub(crate) fn versions(&self, name: &PackageName) -> &[Arc<PackageVersion>] {
        self.packages
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, name: &PackageName, version: &Version) -> Option<&Arc<PackageVersion>> {
        let versions = self.versions(name);
        versions
            .binary_search_by(|p| p.version.cmp(version))
            .ok()
            .map(|idx| &versions[idx])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&PackageName, &[Arc<PackageVersion>])> {
        self.packages.iter().map(|(name, versions)| (name, versions.as_slice()))
    }

    pub(crate) fn len(&self) -> usize {
        self.packages.len()
    }

    fn insert(&mut self, name: PackageName, mut versions: Vec<PackageVersion>, options: &ResolveOptions) {
        versions.retain(|p| {
            if p.name != name {
                trace!(package = %name, listed = %p.name, "ignoring mislabelled catalog entry");
                return false;
            }
            match (options.exclude_newer, p.published) {
                (Some(cutoff), Some(published)) => published <= cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            }
        });
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        versions.dedup_by(|a, b| a.version == b.version);
        self.packages
            .insert(name, versions.into_iter().map(Arc::new).collect());
    }
}

fn follows(requirement: &Requirement, envs: &[Environment]) -> bool {
    requirement.marker.matches_any(envs)
}

/// Fetch everything reachable from `roots` in any of `envs`.
pub(crate) async fn prefetch(
    catalog: &dyn Catalog,
    roots: &[Requirement],
    envs: &[Environment],
    options: &ResolveOptions,
    cancel: &CancellationToken,
) -> Result<CatalogSnapshot, ResolveError> {
    let mut snapshot = CatalogSnapshot::default();
    let mut seen: BTreeSet<PackageName> = roots
        .iter()
        .filter(|r| follows(r, envs))
        .map(|r| r.name.clone())
        .collect();
    let mut frontier: Vec<PackageName> = seen.iter().cloned().collect();
    let concurrency = options.concurrency.max(1);

    while !frontier.is_empty() {
        debug!(count = frontier.len(), "fetching version listings");
        let batch = stream::iter(frontier.iter().cloned())
            .map(|name| async move {
                let result = catalog.list_versions(&name).await;
                (name, result)
            })
            .buffered(concurrency)
            .collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ResolveError::Cancelled),
            results = batch => results,
        };

        let mut next = BTreeSet::new();
        for (name, result) in results {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            let versions = match result {
                Ok(versions) => versions,
                Err(CatalogError::NotFound(_)) => {
                    debug!(package = %name, "package not in catalog");
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            snapshot.insert(name.clone(), versions, options);

            for requirement in snapshot.versions(&name).iter().flat_map(|p| p.all_requirements()) {
                if follows(requirement, envs) && seen.insert(requirement.name.clone()) {
                    next.insert(requirement.name.clone());
                }
            }
        }
        frontier = next.into_iter().collect();
    }

    debug!(packages = snapshot.len(), "catalog snapshot complete");
    Ok(snapshot)
}
