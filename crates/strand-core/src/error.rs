//! Top-level error taxonomy.
//!
//! Module errors ([`ConfigError`], [`CatalogError`], [`CacheError`],
//! [`ResolveError`], [`LockError`]) fold into [`Error`], whose variants are
//! the categories callers act on.

use crate::cache::{CacheError, IntegrityError};
use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::lockfile::{LockError, StaleLockError};
use crate::resolver::{ResolveError, UnsatisfiableError};
use thiserror::Error;

/// Errors surfaced by the high-level workflows in [`crate::project`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed requirement, version, marker or configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Valid input with no solution.
    #[error(transparent)]
    Unsatisfiable(Box<UnsatisfiableError>),

    /// Cache content did not match its digest. The entry was discarded, so a
    /// retry re-fetches from the catalog.
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// The lock no longer matches the root requirements; re-resolve.
    #[error(transparent)]
    StaleLock(#[from] StaleLockError),

    /// A catalog lookup failed for a package.
    #[error(transparent)]
    Catalog(CatalogError),

    /// The cache could not be read or written.
    #[error(transparent)]
    Cache(CacheError),

    /// The lock document could not be read, parsed or written.
    #[error(transparent)]
    Lock(LockError),

    /// Cooperative cancellation was requested.
    #[error("Resolution cancelled")]
    Cancelled,

    /// An invariant was violated inside the resolver.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation can succeed without changing the
    /// input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Integrity(_) | Self::StaleLock(_) | Self::Catalog(_))
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Integrity(e) => Self::Integrity(e),
            other => Self::Cache(other),
        }
    }
}

impl From<CatalogError> for Error {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Cache(e) => Self::from(e),
            other => Self::Catalog(other),
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Stale(e) => Self::StaleLock(e),
            other => Self::Lock(other),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unsatisfiable(e) => Self::Unsatisfiable(e),
            ResolveError::Catalog(e) => Self::from(e),
            ResolveError::Configuration(msg) => Self::Configuration(ConfigError::Invalid(msg)),
            ResolveError::Cancelled => Self::Cancelled,
            ResolveError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<strand_schema::ParseError> for Error {
    fn from(err: strand_schema::ParseError) -> Self {
        Self::Configuration(ConfigError::Parse(err))
    }
}
