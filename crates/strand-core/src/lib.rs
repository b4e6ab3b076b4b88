//! Core library for strand.
//!
//! - [`resolver`]: universal dependency resolution across target environments.
//! - [`cache`]: a content-addressed store verified on every read and write.
//! - [`lockfile`]: deterministic lock documents compiled from resolutions.
//! - [`project`]: `strand.toml` manifests and the lock/fetch workflow.
//!
//! Catalog access goes through the [`Catalog`] trait; nothing here talks to a
//! network directly.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lockfile;
pub mod paths;
pub mod project;
pub mod resolver;

pub use cache::{CachedCatalog, ContentStore, IntegrityError, PinGuard, Stored};
pub use catalog::{Catalog, CatalogError, InMemoryCatalog};
pub use error::Error;
pub use lockfile::{LockCompiler, LockDocument, LockView, StaleLockError};
pub use project::{LockOutcome, Locker, Project};
pub use resolver::{ResolutionGraph, ResolutionMode, ResolveOptions, Resolver, UnsatisfiableError};
