//! Knobs that shape a resolution.

use crate::config::DEFAULT_CONCURRENCY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strand_schema::{PackageName, Version};

/// Which end of the acceptable range to prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Newest acceptable version.
    #[default]
    Highest,
    /// Oldest acceptable version; useful for testing lower bounds.
    Lowest,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highest => write!(f, "highest"),
            Self::Lowest => write!(f, "lowest"),
        }
    }
}

/// Options for one [`super::Resolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Version ordering strategy.
    pub mode: ResolutionMode,
    /// Versions published after this instant are invisible.
    pub exclude_newer: Option<DateTime<Utc>>,
    /// Versions to try first when acceptable, typically from a previous
    /// lock.
    pub preferences: BTreeMap<PackageName, Version>,
    /// Maximum concurrent catalog lookups while prefetching.
    pub concurrency: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::default(),
            exclude_newer: None,
            preferences: BTreeMap::new(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}
