//! Eviction policies for the content store.

use std::fmt;
use std::time::{Duration, SystemTime};
use strand_schema::Blake3Hash;

/// What the store knows about one cached object when it asks a policy to
/// choose victims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    /// Content digest.
    pub digest: Blake3Hash,
    /// Size on disk in bytes.
    pub size: u64,
    /// Last time the entry was read or written.
    pub last_access: SystemTime,
    /// Pinned entries must never be selected.
    pub pinned: bool,
}

/// Chooses which cache entries to remove.
///
/// Policies see every entry, pinned ones included, so that budgets account
/// for pinned bytes. The store refuses to remove a pinned entry even if a
/// policy selects it.
pub trait EvictionPolicy: fmt::Debug + Send + Sync {
    /// Digests to evict, given the current entries and the current time.
    fn select(&self, entries: &[CacheEntryInfo], now: SystemTime) -> Vec<Blake3Hash>;
}

/// Evict least recently used entries until the cache fits in `max_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruPolicy {
    max_bytes: u64,
}

impl LruPolicy {
    /// Policy keeping total size at or below `max_bytes`.
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl EvictionPolicy for LruPolicy {
    fn select(&self, entries: &[CacheEntryInfo], _now: SystemTime) -> Vec<Blake3Hash> {
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_bytes {
            return Vec::new();
        }

        let mut candidates: Vec<&CacheEntryInfo> = entries.iter().filter(|e| !e.pinned).collect();
        // Oldest first; digest breaks ties so the choice is repeatable.
        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.digest.cmp(&b.digest))
        });

        let mut victims = Vec::new();
        for entry in candidates {
            if total <= self.max_bytes {
                break;
            }
            total = total.saturating_sub(entry.size);
            victims.push(entry.digest.clone());
        }
        victims
    }
}

/// Evict entries not accessed within `max_age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAgePolicy {
    max_age: Duration,
}

impl MaxAgePolicy {
    /// Policy removing entries idle for longer than `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl EvictionPolicy for MaxAgePolicy {
    fn select(&self, entries: &[CacheEntryInfo], now: SystemTime) -> Vec<Blake3Hash> {
        entries
            .iter()
            .filter(|e| !e.pinned)
            .filter(|e| {
                now.duration_since(e.last_access)
                    .is_ok_and(|idle| idle > self.max_age)
            })
            .map(|e| e.digest.clone())
            .collect()
    }
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    /// Entries removed.
    pub removed: usize,
    /// Bytes freed.
    pub freed_bytes: u64,
    /// Entries left in the cache.
    pub retained: usize,
    /// Entries the policy selected but were pinned.
    pub skipped_pinned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seed: &str, size: u64, age_secs: u64, pinned: bool) -> CacheEntryInfo {
        CacheEntryInfo {
            digest: Blake3Hash::compute(seed.as_bytes()),
            size,
            last_access: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs),
            pinned,
        }
    }

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    #[test]
    fn lru_keeps_everything_under_budget() {
        let entries = vec![entry("a", 10, 5, false), entry("b", 10, 1, false)];
        assert!(LruPolicy::new(20).select(&entries, now()).is_empty());
    }

    #[test]
    fn lru_evicts_oldest_first() {
        let entries = vec![
            entry("new", 10, 1, false),
            entry("old", 10, 100, false),
            entry("mid", 10, 50, false),
        ];
        let victims = LruPolicy::new(15).select(&entries, now());
        assert_eq!(
            victims,
            vec![
                Blake3Hash::compute(b"old"),
                Blake3Hash::compute(b"mid")
            ]
        );
    }

    #[test]
    fn lru_counts_pinned_bytes_but_never_selects_them() {
        let entries = vec![entry("pinned", 100, 1000, true), entry("free", 10, 1, false)];
        let victims = LruPolicy::new(50).select(&entries, now());
        assert_eq!(victims, vec![Blake3Hash::compute(b"free")]);
    }

    #[test]
    fn max_age_selects_idle_entries() {
        let entries = vec![
            entry("fresh", 1, 10, false),
            entry("stale", 1, 10_000, false),
            entry("stale-pinned", 1, 10_000, true),
        ];
        let victims = MaxAgePolicy::new(Duration::from_secs(3600)).select(&entries, now());
        assert_eq!(victims, vec![Blake3Hash::compute(b"stale")]);
    }
}
