use crate::catalog::CatalogError;
use std::fmt;
use strand_schema::{Environment, ExtraName, PackageName, Requirement, Version};
use thiserror::Error;

/// Errors from [`super::Resolver`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No assignment satisfies the requirements.
    #[error(transparent)]
    Unsatisfiable(Box<UnsatisfiableError>),

    /// A catalog lookup failed. Resolution never continues without the
    /// package.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The request itself is unusable, for example no target environments.
    #[error("{0}")]
    Configuration(String),

    /// The cancellation token fired.
    #[error("Resolution cancelled")]
    Cancelled,

    /// A resolver invariant was violated.
    #[error("Internal resolver error: {0}")]
    Internal(String),
}

impl From<UnsatisfiableError> for ResolveError {
    fn from(err: UnsatisfiableError) -> Self {
        Self::Unsatisfiable(Box::new(err))
    }
}

/// Who declared a requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependent {
    /// The root requirements being resolved.
    Root,
    /// A package version (or one of its extras).
    Package {
        /// Package name.
        name: PackageName,
        /// Package version.
        version: Version,
        /// The extra that pulled the requirement in, if any.
        extra: Option<ExtraName>,
    },
}

impl fmt::Display for Dependent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Package {
                name,
                version,
                extra: None,
            } => write!(f, "{name} {version}"),
            Self::Package {
                name,
                version,
                extra: Some(extra),
            } => write!(f, "{name}[{extra}] {version}"),
        }
    }
}

/// One requirement that took part in a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Who required it.
    pub dependent: Dependent,
    /// The requirement as declared.
    pub requirement: Requirement,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires {}", self.dependent, self.requirement)
    }
}

/// Why a resolution has no solution.
///
/// `conflicts` lists the declared requirements that the solver's proof of
/// unsatisfiability rests on; `explanation` is the proof itself, one step per
/// line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiableError {
    /// The environment that failed, when resolution was split per
    /// environment. `None` for the universal pass.
    pub environment: Option<Environment>,
    /// Requirements involved in the conflict, sorted by dependent.
    pub conflicts: Vec<Conflict>,
    /// Required packages with no usable version at all.
    pub missing: Vec<PackageName>,
    /// The derivation, rendered as text.
    pub explanation: String,
}

impl UnsatisfiableError {
    /// Conflicts whose requirement names `package`.
    pub fn requirements_on<'a>(&'a self, package: &'a PackageName) -> impl Iterator<Item = &'a Conflict> + 'a {
        self.conflicts
            .iter()
            .filter(move |c| c.requirement.name == *package)
    }

    /// Attach the environment the failure happened in.
    pub fn in_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }
}

impl fmt::Display for UnsatisfiableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.environment {
            Some(env) => writeln!(f, "No solution found for environment {env}:")?,
            None => writeln!(f, "No solution found:")?,
        }
        for conflict in &self.conflicts {
            writeln!(f, "  - {conflict}")?;
        }
        for name in &self.missing {
            writeln!(f, "  - no usable versions of {name}")?;
        }
        if !self.explanation.is_empty() {
            write!(f, "\n{}", self.explanation)?;
        }
        Ok(())
    }
}
