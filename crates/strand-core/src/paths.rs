//! Well-known filesystem locations.

use dirs::home_dir;
use std::path::PathBuf;

/// Environment variable overriding the strand home directory.
pub const HOME_ENV: &str = "STRAND_HOME";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "STRAND_CACHE_DIR";

/// Environment variable forcing offline mode when set to `1` or `true`.
pub const OFFLINE_ENV: &str = "STRAND_OFFLINE";

/// Returns the strand home directory, or None if the user's home cannot be resolved.
pub fn try_strand_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(HOME_ENV) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".strand"))
}

/// Cache path: `$STRAND_CACHE_DIR`, else ~/.strand/cache
pub fn try_cache_path() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(CACHE_DIR_ENV) {
        return Some(PathBuf::from(val));
    }
    try_strand_home().map(|h| h.join("cache"))
}

/// Whether `STRAND_OFFLINE` requests offline operation.
pub fn offline_from_env() -> bool {
    std::env::var(OFFLINE_ENV).is_ok_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
}
