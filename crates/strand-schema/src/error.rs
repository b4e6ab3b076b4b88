//! Parse errors for the textual forms of the data model.
//!
//! Every variant is a configuration problem: malformed input is rejected
//! before it ever reaches the resolver.

use thiserror::Error;

/// Errors produced while parsing names, versions, specifiers, markers,
/// requirements, environments and digests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A package or extra name was empty or contained illegal characters.
    #[error("Invalid name '{0}': expected ASCII letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    /// A version string was not a 1-3 segment numeric release.
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    /// A comparator had an unknown operator or an operator it cannot use.
    #[error("Invalid version specifier '{spec}': {reason}")]
    InvalidSpecifier {
        /// The offending specifier text.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A marker clause could not be understood.
    #[error("Invalid marker '{marker}': {reason}")]
    InvalidMarker {
        /// The offending marker text.
        marker: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The requirement line as a whole was malformed.
    #[error("Invalid requirement '{requirement}': {reason}")]
    InvalidRequirement {
        /// The offending requirement text.
        requirement: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An environment descriptor did not look like `3.11-linux-x86_64`.
    #[error("Invalid environment '{0}': expected <python>-<os>-<arch>")]
    InvalidEnvironment(String),

    /// Unknown operating system name.
    #[error("Unknown operating system: {0}")]
    UnknownOs(String),

    /// Unknown architecture name.
    #[error("Unknown architecture: {0}")]
    UnknownArch(String),

    /// A digest was not 64 lowercase hex characters.
    #[error("Invalid BLAKE3 digest: expected 64 hex characters, got '{0}'")]
    InvalidDigest(String),
}
