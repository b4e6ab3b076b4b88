//! Universal dependency resolution.
//!
//! A resolution runs in three phases:
//!
//! 1. **Prefetch**: every version listing reachable from the roots in any
//!    target environment is fetched concurrently into a snapshot.
//! 2. **Universal pass**: one `PubGrub` run over the union of all
//!    environments, using only versions that install everywhere. When it
//!    succeeds every environment shares the same versions.
//! 3. **Split fallback**: if the universal pass has no solution and there are
//!    several environments, each environment is solved on its own, in
//!    parallel, preferring versions that install everywhere. Packages that
//!    still end up with different versions are then re-solved with each of
//!    those versions preferred in every environment, keeping any attempt
//!    that leaves fewer distinct versions in the lock.
//!
//! Either way the selection is walked per environment to build the
//! [`ResolutionGraph`], re-checking every reachable requirement.

mod error;
mod graph;
mod options;
mod provider;
mod snapshot;

pub use error::{Conflict, Dependent, ResolveError, UnsatisfiableError};
pub use graph::{ResolutionGraph, ResolvedPackage, Violation};
pub use options::{ResolutionMode, ResolveOptions};

use crate::catalog::Catalog;
use provider::Scope;
use snapshot::CatalogSnapshot;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strand_schema::{Environment, PackageName, PackageVersion, Requirement, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Selection = BTreeMap<PackageName, Arc<PackageVersion>>;
type Split = BTreeMap<Environment, Selection>;

/// Distinct versions picked for each package across a split resolution.
fn variants(selections: &Split) -> BTreeMap<PackageName, BTreeSet<Version>> {
    let mut variants: BTreeMap<PackageName, BTreeSet<Version>> = BTreeMap::new();
    for selection in selections.values() {
        for (name, package) in selection {
            variants.entry(name.clone()).or_default().insert(package.version);
        }
    }
    variants
}

fn variant_count(selections: &Split) -> usize {
    variants(selections).values().map(BTreeSet::len).sum()
}

/// Resolves root requirements against a [`Catalog`].
///
/// A resolver is cheap to clone and may be shared; each call to
/// [`Resolver::resolve`] works on its own snapshot of the catalog.
#[derive(Clone)]
pub struct Resolver {
    catalog: Arc<dyn Catalog>,
    options: ResolveOptions,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("options", &self.options)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// A resolver over `catalog` with default options.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            options: ResolveOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop resolving when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The active options.
    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolve `roots` for every environment in `envs`.
    ///
    /// Deterministic: the same catalog contents, roots, environments and
    /// options always produce the same graph.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Unsatisfiable`] when no selection exists.
    /// - [`ResolveError::Catalog`] when a lookup fails.
    /// - [`ResolveError::Cancelled`] when the token fires.
    /// - [`ResolveError::Configuration`] when `envs` is empty.
    pub async fn resolve(
        &self,
        roots: &[Requirement],
        envs: &[Environment],
    ) -> Result<ResolutionGraph, ResolveError> {
        let mut envs = envs.to_vec();
        envs.sort();
        envs.dedup();
        if envs.is_empty() {
            return Err(ResolveError::Configuration(
                "at least one target environment is required".to_string(),
            ));
        }

        info!(
            roots = roots.len(),
            environments = envs.len(),
            mode = %self.options.mode,
            "resolving"
        );

        let snapshot = Arc::new(
            snapshot::prefetch(
                self.catalog.as_ref(),
                roots,
                &envs,
                &self.options,
                &self.cancel,
            )
            .await?,
        );
        let roots: Arc<[Requirement]> = roots.into();
        let envs: Arc<[Environment]> = envs.into();

        let universal = self.solve_universal(&snapshot, &roots, &envs).await;
        let graph = match universal {
            Ok(selection) => ResolutionGraph::build(&roots, &envs, |_, name| selection.get(name).cloned()),
            Err(ResolveError::Unsatisfiable(err)) if envs.len() > 1 => {
                debug!(reason = %err, "no universal solution, resolving per environment");
                let selections = self.solve_split(&snapshot, &roots, &envs).await?;
                let selections = self.converge_split(&snapshot, &roots, &envs, selections).await?;
                ResolutionGraph::build(&roots, &envs, |env, name| {
                    selections.get(env).and_then(|s| s.get(name)).cloned()
                })
            }
            Err(ResolveError::Unsatisfiable(err)) => {
                return Err(ResolveError::Unsatisfiable(Box::new(err.in_environment(envs[0]))));
            }
            Err(e) => return Err(e),
        };

        let graph = graph.map_err(|violation| {
            warn!(%violation, "resolution produced an inconsistent graph");
            ResolveError::Internal(violation.to_string())
        })?;
        info!(
            packages = graph.digests().len(),
            "resolution complete"
        );
        Ok(graph)
    }

    /// Resolve `roots`, reusing `previous` where possible.
    ///
    /// If `previous` still satisfies every reachable requirement in the same
    /// environments it is returned, pruned to what the roots reach, without
    /// consulting the catalog. Otherwise this is a full resolution that tries
    /// the previous versions first.
    ///
    /// # Errors
    ///
    /// As [`Resolver::resolve`].
    pub async fn resolve_incremental(
        &self,
        previous: &ResolutionGraph,
        roots: &[Requirement],
        envs: &[Environment],
    ) -> Result<ResolutionGraph, ResolveError> {
        let mut targets = envs.to_vec();
        targets.sort();
        targets.dedup();
        if let Some(graph) = previous.reuse(roots, &targets) {
            debug!("previous resolution still satisfies the roots");
            return Ok(graph);
        }

        let mut options = self.options.clone();
        for (name, version) in previous.preferences() {
            options.preferences.entry(name).or_insert(version);
        }
        self.clone().with_options(options).resolve(roots, envs).await
    }

    async fn solve_universal(
        &self,
        snapshot: &Arc<CatalogSnapshot>,
        roots: &Arc<[Requirement]>,
        envs: &Arc<[Environment]>,
    ) -> Result<Selection, ResolveError> {
        let snapshot = Arc::clone(snapshot);
        let roots = Arc::clone(roots);
        let envs = Arc::clone(envs);
        let options = self.options.clone();
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            provider::solve(&snapshot, &roots, Scope::universal(&envs), &options, &cancel)
        })
        .await
        .map_err(|e| ResolveError::Internal(format!("solver task failed: {e}")))?
    }

    async fn solve_split(
        &self,
        snapshot: &Arc<CatalogSnapshot>,
        roots: &Arc<[Requirement]>,
        envs: &Arc<[Environment]>,
    ) -> Result<Split, ResolveError> {
        self.solve_split_with(snapshot, roots, envs, &self.options).await
    }

    /// Pull diverging packages back onto one version where the per-environment
    /// constraints allow it.
    ///
    /// Each package picked at several versions is tried once per picked
    /// version, in resolution-mode order, as a preference in every
    /// environment. An attempt is kept when it lowers the total number of
    /// distinct versions across the split.
    async fn converge_split(
        &self,
        snapshot: &Arc<CatalogSnapshot>,
        roots: &Arc<[Requirement]>,
        envs: &Arc<[Environment]>,
        mut selections: Split,
    ) -> Result<Split, ResolveError> {
        let mut options = self.options.clone();
        let diverging: Vec<(PackageName, BTreeSet<Version>)> = variants(&selections)
            .into_iter()
            .filter(|(_, versions)| versions.len() > 1)
            .collect();

        for (name, versions) in diverging {
            let mut ordered: Vec<Version> = versions.into_iter().collect();
            if options.mode == ResolutionMode::Highest {
                ordered.reverse();
            }
            for version in ordered {
                if variants(&selections).get(&name).is_none_or(|v| v.len() <= 1) {
                    break;
                }
                let mut trial = options.clone();
                trial.preferences.insert(name.clone(), version);
                let attempt = match self.solve_split_with(snapshot, roots, envs, &trial).await {
                    Ok(attempt) => attempt,
                    Err(ResolveError::Unsatisfiable(_)) => continue,
                    Err(e) => return Err(e),
                };
                if variant_count(&attempt) < variant_count(&selections) {
                    debug!(package = %name, %version, "split environments converged");
                    selections = attempt;
                    options = trial;
                }
            }
        }
        Ok(selections)
    }

    async fn solve_split_with(
        &self,
        snapshot: &Arc<CatalogSnapshot>,
        roots: &Arc<[Requirement]>,
        envs: &Arc<[Environment]>,
        options: &ResolveOptions,
    ) -> Result<Split, ResolveError> {
        let tasks: Vec<_> = envs
            .iter()
            .map(|env| {
                let env = *env;
                let snapshot = Arc::clone(snapshot);
                let roots = Arc::clone(roots);
                let envs = Arc::clone(envs);
                let options = options.clone();
                let cancel = self.cancel.clone();
                tokio::task::spawn_blocking(move || {
                    let result = provider::solve(&snapshot, &roots, Scope::single(&env, &envs), &options, &cancel);
                    (env, result)
                })
            })
            .collect();

        let mut selections = BTreeMap::new();
        for joined in futures::future::join_all(tasks).await {
            let (env, result) =
                joined.map_err(|e| ResolveError::Internal(format!("solver task failed: {e}")))?;
            match result {
                Ok(selection) => {
                    selections.insert(env, selection);
                }
                Err(ResolveError::Unsatisfiable(err)) => {
                    return Err(ResolveError::Unsatisfiable(Box::new(err.in_environment(env))));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(selections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    fn linux() -> Environment {
        Environment::parse("3.12-linux-x86_64").unwrap()
    }

    #[tokio::test]
    async fn empty_environment_list_is_rejected() {
        let resolver = Resolver::new(Arc::new(InMemoryCatalog::new()));
        let err = resolver.resolve(&[req("a")], &[]).await.unwrap_err();
        assert!(matches!(err, ResolveError::Configuration(_)));
    }

    #[tokio::test]
    async fn self_requirement_is_tolerated() {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &["a>=1.0"]).unwrap();
        let resolver = Resolver::new(Arc::new(catalog));

        let graph = resolver.resolve(&[req("a")], &[linux()]).await.unwrap();
        assert_eq!(
            graph.get(&linux(), &PackageName::new("a")).unwrap().version(),
            Version::new(1, 0, 0)
        );
    }

    #[tokio::test]
    async fn version_excluding_itself_is_skipped() {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &[]).unwrap();
        catalog.publish("a", "2.0", &["a<2.0"]).unwrap();
        let resolver = Resolver::new(Arc::new(catalog));

        let graph = resolver.resolve(&[req("a")], &[linux()]).await.unwrap();
        assert_eq!(
            graph.get(&linux(), &PackageName::new("a")).unwrap().version(),
            Version::new(1, 0, 0)
        );
    }

    #[tokio::test]
    async fn preferences_win_over_newer_versions() {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &[]).unwrap();
        catalog.publish("a", "1.5", &[]).unwrap();
        catalog.publish("a", "2.0", &[]).unwrap();

        let mut options = ResolveOptions::default();
        options.preferences.insert(PackageName::new("a"), Version::new(1, 5, 0));
        let resolver = Resolver::new(Arc::new(catalog)).with_options(options);

        let graph = resolver.resolve(&[req("a")], &[linux()]).await.unwrap();
        assert_eq!(
            graph.get(&linux(), &PackageName::new("a")).unwrap().version(),
            Version::new(1, 5, 0)
        );
    }
}
