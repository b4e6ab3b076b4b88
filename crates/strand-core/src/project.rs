//! Project manifests and the lock workflow.
//!
//! A project (`strand.toml`) declares its root requirements and the
//! environments to lock for:
//!
//! ```toml
//! [project]
//! name = "demo"
//! requires = ["requests>=2.0", "colorama ; os == windows"]
//! environments = ["3.11-linux-x86_64", "3.13-macos-aarch64"]
//!
//! [resolution]
//! mode = "highest"
//!
//! [cache]
//! max-bytes = 1073741824
//! ```
//!
//! [`Locker`] turns a project into a [`LockDocument`], reusing an existing
//! lock when it still matches, and fetches locked artifacts into the
//! [`ContentStore`].

use crate::cache::{CacheError, ContentStore, IntegrityError, Stored};
use crate::catalog::{Catalog, CatalogError};
use crate::config::{CacheSettings, ConfigError, ResolutionSettings};
use crate::error::Error;
use crate::lockfile::{LockCompiler, LockDocument, LockedPackage, StaleLockError};
use crate::resolver::{ResolutionGraph, ResolveOptions, Resolver};
use futures::stream::{self, TryStreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strand_schema::{Environment, Fingerprint, Requirement};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Conventional manifest file name.
pub const MANIFEST_FILE_NAME: &str = "strand.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    project: ProjectTable,
    #[serde(default)]
    resolution: ResolutionSettings,
    #[serde(default)]
    cache: CacheSettings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectTable {
    name: String,
    #[serde(default)]
    requires: Vec<Requirement>,
    environments: Vec<Environment>,
}

/// A parsed `strand.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Project name.
    pub name: String,
    /// Root requirements, in declaration order.
    pub requires: Vec<Requirement>,
    /// Target environments, sorted and de-duplicated.
    pub environments: Vec<Environment>,
    /// The `[resolution]` table.
    pub resolution: ResolutionSettings,
    /// The `[cache]` table, with environment overrides applied.
    pub cache: CacheSettings,
}

impl Project {
    /// Parse a manifest. `path` is only used in error messages.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Toml`] for malformed TOML or unparseable requirements
    /// and environments, [`ConfigError::Invalid`] for an empty project name,
    /// no target environments or unusable settings.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let manifest: Manifest = toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;

        let ProjectTable {
            name,
            requires,
            mut environments,
        } = manifest.project;
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("project.name must not be empty".to_string()));
        }
        environments.sort();
        environments.dedup();
        if environments.is_empty() {
            return Err(ConfigError::Invalid(
                "project.environments must list at least one environment".to_string(),
            ));
        }
        manifest.resolution.validate()?;

        Ok(Self {
            name,
            requires,
            environments,
            resolution: manifest.resolution,
            cache: manifest.cache.with_env_overrides(),
        })
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`Project::from_toml`].
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Fingerprint of the root requirements.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.requires)
    }

    /// Resolver options from the `[resolution]` table.
    pub fn resolve_options(&self) -> ResolveOptions {
        self.resolution.to_options()
    }

    /// Require `lock` to match the current requirements exactly, as a frozen
    /// install would.
    ///
    /// # Errors
    ///
    /// Returns [`StaleLockError`] when the fingerprints differ.
    pub fn ensure_locked(&self, lock: &LockDocument) -> Result<(), StaleLockError> {
        lock.ensure_fresh(&self.fingerprint())
    }

    /// Where the lock file for a manifest at `manifest_path` lives.
    pub fn lock_path(manifest_path: &Path) -> PathBuf {
        manifest_path.with_file_name(crate::lockfile::LOCK_FILE_NAME)
    }
}

/// Result of [`Locker::lock`].
#[derive(Debug)]
pub enum LockOutcome {
    /// The existing lock still matches and was kept as is.
    Fresh(LockDocument),
    /// A new resolution was run.
    Resolved {
        /// The compiled lock.
        lock: LockDocument,
        /// The graph it was compiled from.
        graph: ResolutionGraph,
    },
}

impl LockOutcome {
    /// The lock document, whichever way it was obtained.
    pub fn lock(&self) -> &LockDocument {
        match self {
            Self::Fresh(lock) | Self::Resolved { lock, .. } => lock,
        }
    }

    /// Consume the outcome, keeping the lock document.
    pub fn into_lock(self) -> LockDocument {
        match self {
            Self::Fresh(lock) | Self::Resolved { lock, .. } => lock,
        }
    }

    /// Whether a resolution ran.
    pub fn was_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// Locks projects and fetches locked artifacts.
#[derive(Clone)]
pub struct Locker {
    catalog: Arc<dyn Catalog>,
    store: Arc<ContentStore>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("store", &self.store.root())
            .finish_non_exhaustive()
    }
}

impl Locker {
    /// A locker resolving against `catalog` and storing artifacts in `store`.
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<ContentStore>) -> Self {
        Self {
            catalog,
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop work when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Produce a lock for `project`.
    ///
    /// `existing` is kept when its fingerprint, environments and resolution
    /// settings all match. Otherwise the project is resolved again, trying
    /// the versions in `existing` first so unrelated packages do not move.
    /// The digests of `existing` stay pinned in the store throughout.
    ///
    /// # Errors
    ///
    /// Any [`Error`] from resolution.
    pub async fn lock(
        &self,
        project: &Project,
        existing: Option<&LockDocument>,
    ) -> Result<LockOutcome, Error> {
        let fingerprint = project.fingerprint();
        let mut options = project.resolve_options();
        let _pins = match existing {
            Some(lock) => Some(self.store.pin(lock.digests()).await),
            None => None,
        };

        if let Some(lock) = existing {
            if LockCompiler::validate(lock, &fingerprint)
                && lock.matches_settings(&project.environments, &options)
            {
                info!(project = %project.name, "lock is up to date");
                return Ok(LockOutcome::Fresh(lock.clone()));
            }
            debug!(project = %project.name, "lock is stale, re-resolving");
            options.preferences = lock.preferences();
        }

        let compiler = LockCompiler::new(&options);
        let graph = Resolver::new(Arc::clone(&self.catalog))
            .with_options(options)
            .with_cancellation(self.cancel.clone())
            .resolve(&project.requires, &project.environments)
            .await?;
        let lock = compiler.compile(&graph, &fingerprint);
        info!(
            project = %project.name,
            packages = lock.packages.len(),
            "locked"
        );
        Ok(LockOutcome::Resolved { lock, graph })
    }

    /// Make sure every artifact locked for `env` is in the store.
    ///
    /// Lookups and downloads run concurrently. Each artifact is verified
    /// against its locked digest before it is stored. Returns the number of
    /// artifacts that were downloaded.
    ///
    /// # Errors
    ///
    /// - [`Error::Catalog`] if a locked version is no longer listed or its
    ///   artifact cannot be fetched.
    /// - [`Error::Integrity`] if the catalog now reports a different digest
    ///   for a locked version, or the download does not match it.
    /// - [`Error::Cancelled`] if the token fires.
    pub async fn fetch(&self, lock: &LockDocument, env: &Environment) -> Result<usize, Error> {
        let _pins = self.store.pin(lock.digests()).await;
        let concurrency = crate::config::DEFAULT_CONCURRENCY;

        let downloads = stream::iter(lock.packages_for(env).map(Ok::<_, Error>))
            .map_ok(|package| self.fetch_one(package))
            .try_buffer_unordered(concurrency)
            .try_fold(0usize, |count, stored| async move {
                Ok::<_, Error>(count + usize::from(stored == Stored::Written))
            });

        let downloaded = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = downloads => result?,
        };
        info!(environment = %env, downloaded, "artifacts ready");
        Ok(downloaded)
    }

    async fn fetch_one(&self, locked: &LockedPackage) -> Result<Stored, Error> {
        match self.store.get(&locked.digest).await {
            Ok(Some(_)) => {
                debug!(package = %locked.name, version = %locked.version, "artifact already cached");
                return Ok(Stored::AlreadyPresent);
            }
            Ok(None) => {}
            Err(CacheError::Integrity(e)) => {
                warn!(package = %locked.name, version = %locked.version, error = %e, "cached artifact was corrupt, refetching");
            }
            Err(e) => return Err(e.into()),
        }

        let listed = self.catalog.list_versions(&locked.name).await?;
        let package = listed
            .into_iter()
            .find(|p| p.version == locked.version)
            .ok_or_else(|| CatalogError::Artifact {
                name: locked.name.clone(),
                version: locked.version,
                reason: "version is no longer listed".to_string(),
            })?;
        if package.digest != locked.digest {
            return Err(IntegrityError::DigestMismatch {
                expected: locked.digest.clone(),
                actual: package.digest,
            }
            .into());
        }

        let bytes = self.catalog.fetch_artifact(&package).await?;
        let stored = self.store.put(&locked.digest, &bytes).await?;
        debug!(package = %locked.name, version = %locked.version, "artifact stored");
        Ok(stored)
    }
}
