//! Shared data model for strand.
//!
//! Everything here is immutable once parsed: names, versions, version
//! specifiers, environment markers, requirements and the package metadata a
//! catalog serves. Malformed text is rejected with a [`ParseError`].

pub mod error;
pub mod hash;
pub mod marker;
pub mod package;
pub mod requirement;
pub mod specifier;
pub mod types;

// Re-exports
pub use error::ParseError;
pub use hash::{Blake3Hash, Fingerprint};
pub use marker::{Arch, Environment, Marker, MarkerClause, Os};
pub use package::PackageVersion;
pub use requirement::Requirement;
pub use specifier::{Comparator, Operator, VersionSpec};
pub use types::{ExtraName, PackageName, Version};
