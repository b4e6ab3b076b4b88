//! Settings for resolution and the cache.
//!
//! Both tables live in `strand.toml` next to the project requirements (see
//! [`crate::project`]). Environment variables from [`crate::paths`] override
//! the file.

use crate::cache::eviction::{EvictionPolicy, LruPolicy, MaxAgePolicy};
use crate::paths;
use crate::resolver::{ResolutionMode, ResolveOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strand_schema::ParseError;
use thiserror::Error;

/// Default number of concurrent catalog lookups.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default cache budget for LRU eviction: 2 GiB.
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Errors in user-supplied configuration or input text.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A requirement, version, marker or environment failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for its schema.
    #[error("Failed to parse {path}: {source}")]
    Toml {
        /// File that was being parsed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A setting has an unusable value.
    #[error("{0}")]
    Invalid(String),
}

/// The `[resolution]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResolutionSettings {
    /// Version ordering strategy.
    pub mode: ResolutionMode,
    /// Ignore versions published after this instant.
    pub exclude_newer: Option<DateTime<Utc>>,
    /// Maximum concurrent catalog lookups.
    pub concurrency: usize,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::default(),
            exclude_newer: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ResolutionSettings {
    /// Check values that deserialize fine but cannot be used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `concurrency` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "resolution.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolver options carrying these settings and no preferences.
    pub fn to_options(&self) -> ResolveOptions {
        ResolveOptions {
            mode: self.mode,
            exclude_newer: self.exclude_newer,
            concurrency: self.concurrency,
            ..ResolveOptions::default()
        }
    }
}

/// The `[cache]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheSettings {
    /// Cache root. Defaults to [`paths::try_cache_path`].
    pub dir: Option<PathBuf>,
    /// Size budget for LRU eviction.
    pub max_bytes: Option<u64>,
    /// When set, evict entries unused for this many days instead of
    /// enforcing a size budget.
    pub max_age_days: Option<u64>,
    /// Serve only cached catalog data.
    pub offline: bool,
}

impl CacheSettings {
    /// Apply `STRAND_CACHE_DIR` and `STRAND_OFFLINE`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(paths::CACHE_DIR_ENV) {
            self.dir = Some(PathBuf::from(dir));
        }
        if paths::offline_from_env() {
            self.offline = true;
        }
        self
    }

    /// The directory the cache lives in.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no directory is configured and
    /// the home directory cannot be determined.
    pub fn resolved_dir(&self) -> Result<PathBuf, ConfigError> {
        self.dir.clone().or_else(paths::try_cache_path).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "Could not determine cache directory. Set {} to override.",
                paths::CACHE_DIR_ENV
            ))
        })
    }

    /// The eviction policy these settings describe.
    pub fn eviction_policy(&self) -> Box<dyn EvictionPolicy> {
        match self.max_age_days {
            Some(days) => Box::new(MaxAgePolicy::new(Duration::from_secs(
                days.saturating_mul(SECONDS_PER_DAY),
            ))),
            None => Box::new(LruPolicy::new(self.max_bytes.unwrap_or(DEFAULT_MAX_BYTES))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_defaults() {
        let settings: ResolutionSettings = toml::from_str("").unwrap();
        assert_eq!(settings.mode, ResolutionMode::Highest);
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
        assert!(settings.exclude_newer.is_none());
    }

    #[test]
    fn resolution_parses_kebab_case_keys() {
        let settings: ResolutionSettings = toml::from_str(
            "mode = \"lowest\"\nexclude-newer = \"2024-01-01T00:00:00Z\"\nconcurrency = 4\n",
        )
        .unwrap();
        assert_eq!(settings.mode, ResolutionMode::Lowest);
        assert_eq!(settings.concurrency, 4);
        assert!(settings.exclude_newer.is_some());

        let options = settings.to_options();
        assert_eq!(options.mode, ResolutionMode::Lowest);
        assert!(options.preferences.is_empty());
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let settings = ResolutionSettings {
            concurrency: 0,
            ..ResolutionSettings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let settings = CacheSettings {
            dir: Some(PathBuf::from("/tmp/strand-cache")),
            ..CacheSettings::default()
        };
        assert_eq!(
            settings.resolved_dir().unwrap(),
            PathBuf::from("/tmp/strand-cache")
        );
    }

    #[test]
    fn eviction_policy_follows_settings() {
        let lru = CacheSettings {
            max_bytes: Some(10),
            ..CacheSettings::default()
        };
        assert!(format!("{:?}", lru.eviction_policy()).contains("LruPolicy"));

        let aged = CacheSettings {
            max_age_days: Some(30),
            ..CacheSettings::default()
        };
        assert!(format!("{:?}", aged.eviction_policy()).contains("MaxAgePolicy"));
    }

    #[test]
    fn huge_max_age_saturates() {
        let settings = CacheSettings {
            max_age_days: Some(u64::MAX),
            ..CacheSettings::default()
        };
        assert!(format!("{:?}", settings.eviction_policy()).contains("MaxAgePolicy"));
    }
}
