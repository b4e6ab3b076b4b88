//! Content-addressed cache.
//!
//! Objects are stored by their BLAKE3 digest and verified on every read:
//!
//! ```text
//! <root>/objects/ab/abcdef0123...   content, named by its digest
//! <root>/refs/<kind>/<key-digest>   digest of the object a key maps to
//! <root>/tmp/                       staging area, same volume as objects
//! ```
//!
//! Writes land in `tmp/` and are renamed into place, so readers never see a
//! partial object. Writers of the same digest serialize on a per-digest lock;
//! different digests proceed in parallel.

pub mod catalog;
pub mod eviction;

pub use catalog::CachedCatalog;
pub use eviction::{CacheEntryInfo, EvictionPolicy, EvictionSummary, LruPolicy, MaxAgePolicy};

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use strand_schema::Blake3Hash;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const OBJECTS_DIR: &str = "objects";
const REFS_DIR: &str = "refs";
const TMP_DIR: &str = "tmp";

/// Content did not hash to the digest it was stored or requested under.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Bytes handed to `put` do not hash to the claimed digest. Nothing was
    /// stored.
    #[error("Digest mismatch: expected {expected}, content hashes to {actual}")]
    DigestMismatch {
        /// Digest the caller claimed.
        expected: Blake3Hash,
        /// Digest of the bytes.
        actual: Blake3Hash,
    },

    /// A stored object no longer matches its digest. It has been removed.
    #[error("Cache entry {digest} is corrupt (content hashes to {actual}); entry discarded")]
    Corrupt {
        /// Digest the object was stored under.
        digest: Blake3Hash,
        /// Digest of what was on disk.
        actual: Blake3Hash,
    },

    /// An object already stored under this digest holds different bytes.
    /// The existing object was left untouched.
    #[error("Cache entry {digest} already holds different content")]
    Collision {
        /// The contested digest.
        digest: Blake3Hash,
    },
}

/// Errors from the content store.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Content failed verification.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Filesystem operation failed.
    #[error("Cache IO error at {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A blocking filesystem task panicked or was cancelled.
    #[error("Cache task failed: {0}")]
    Task(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Outcome of a successful [`ContentStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// The object was written.
    Written,
    /// Identical content was already cached.
    AlreadyPresent,
}

/// A filesystem-backed content-addressed store.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    locks: Mutex<HashMap<Blake3Hash, Arc<AsyncMutex<()>>>>,
    access: Mutex<HashMap<Blake3Hash, SystemTime>>,
    pins: Arc<Mutex<HashMap<Blake3Hash, usize>>>,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory layout cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        for dir in [OBJECTS_DIR, REFS_DIR, TMP_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).await.map_err(io_error(&path))?;
        }
        debug!(root = %root.display(), "opened content store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
            access: Mutex::new(HashMap::new()),
            pins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the object for `digest` lives. Uses a 2-char prefix: ab/abcdef123...
    pub fn object_path(&self, digest: &Blake3Hash) -> PathBuf {
        let hex = digest.as_str();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(hex)
    }

    fn ref_path(&self, kind: &str, key: &str) -> PathBuf {
        let key_digest = Blake3Hash::compute(key.as_bytes());
        self.root.join(REFS_DIR).join(kind).join(key_digest.as_str())
    }

    /// Read and verify the object stored under `digest`.
    ///
    /// Returns `Ok(None)` on a miss. An object whose bytes no longer hash to
    /// `digest` is deleted and reported as [`IntegrityError::Corrupt`]; the
    /// next `get` is a clean miss.
    ///
    /// # Errors
    ///
    /// [`CacheError::Integrity`] for corrupt objects, [`CacheError::Io`] for
    /// read failures.
    pub async fn get(&self, digest: &Blake3Hash) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.object_path(digest);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };

        let actual = Blake3Hash::compute(&bytes);
        if actual != *digest {
            let _lock = self.lock_digest(digest).await;
            warn!(%digest, %actual, "discarding corrupt cache entry");
            remove_if_present(&path).await?;
            self.forget(digest);
            return Err(IntegrityError::Corrupt {
                digest: digest.clone(),
                actual,
            }
            .into());
        }

        self.touch(digest);
        Ok(Some(bytes))
    }

    /// Store `bytes` under `digest`.
    ///
    /// Idempotent: storing identical content again is a no-op reported as
    /// [`Stored::AlreadyPresent`].
    ///
    /// # Errors
    ///
    /// [`IntegrityError::DigestMismatch`] if `bytes` do not hash to `digest`
    /// (nothing is written), [`IntegrityError::Collision`] if different bytes
    /// already occupy the entry (they are left in place), or
    /// [`CacheError::Io`].
    pub async fn put(&self, digest: &Blake3Hash, bytes: &[u8]) -> Result<Stored, CacheError> {
        let actual = Blake3Hash::compute(bytes);
        if actual != *digest {
            return Err(IntegrityError::DigestMismatch {
                expected: digest.clone(),
                actual,
            }
            .into());
        }

        let _lock = self.lock_digest(digest).await;
        let path = self.object_path(digest);

        if let Some(stored) = self.compare_existing(digest, &path, bytes).await? {
            return Ok(stored);
        }

        let written = write_atomic(self.root.join(TMP_DIR), path.clone(), bytes.to_vec(), false).await?;
        if !written {
            // Another process won the rename.
            return self
                .compare_existing(digest, &path, bytes)
                .await?
                .ok_or_else(|| CacheError::Io {
                    path,
                    source: io::Error::new(io::ErrorKind::NotFound, "object vanished after write"),
                });
        }

        debug!(%digest, size = bytes.len(), "stored cache object");
        self.touch(digest);
        Ok(Stored::Written)
    }

    async fn compare_existing(
        &self,
        digest: &Blake3Hash,
        path: &Path,
        bytes: &[u8],
    ) -> Result<Option<Stored>, CacheError> {
        match fs::read(path).await {
            Ok(existing) if existing == bytes => {
                self.touch(digest);
                Ok(Some(Stored::AlreadyPresent))
            }
            Ok(_) => {
                warn!(%digest, "refusing to overwrite cache entry with different content");
                Err(IntegrityError::Collision {
                    digest: digest.clone(),
                }
                .into())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    /// Whether an object is stored under `digest` (without verifying it).
    pub async fn contains(&self, digest: &Blake3Hash) -> bool {
        fs::try_exists(self.object_path(digest)).await.unwrap_or(false)
    }

    /// Point the key `(kind, key)` at `digest`, replacing any previous target.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the ref cannot be written.
    pub async fn set_ref(&self, kind: &str, key: &str, digest: &Blake3Hash) -> Result<(), CacheError> {
        let path = self.ref_path(kind, key);
        write_atomic(
            self.root.join(TMP_DIR),
            path,
            digest.as_str().as_bytes().to_vec(),
            true,
        )
        .await?;
        Ok(())
    }

    /// The digest the key `(kind, key)` points at, if any.
    ///
    /// A malformed ref is removed and reported as missing.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the ref exists but cannot be read.
    pub async fn get_ref(&self, kind: &str, key: &str) -> Result<Option<Blake3Hash>, CacheError> {
        let path = self.ref_path(kind, key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        if let Ok(digest) = Blake3Hash::parse(text.trim()) {
            Ok(Some(digest))
        } else {
            warn!(kind, key, "discarding malformed cache ref");
            remove_if_present(&path).await?;
            Ok(None)
        }
    }

    /// Protect `digests` from eviction until the returned guard is dropped.
    ///
    /// Pins nest: a digest stays pinned while any guard holding it lives.
    /// Each pin is taken under the digest's lock, so it waits for an eviction
    /// of that digest already in progress.
    pub async fn pin<I>(&self, digests: I) -> PinGuard
    where
        I: IntoIterator<Item = Blake3Hash>,
    {
        let digests: Vec<Blake3Hash> = digests.into_iter().collect();
        for digest in &digests {
            let _lock = self.lock_digest(digest).await;
            let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
            *pins.entry(digest.clone()).or_insert(0) += 1;
        }
        PinGuard {
            pins: Arc::clone(&self.pins),
            digests,
        }
    }

    /// Whether `digest` is currently pinned.
    pub fn is_pinned(&self, digest: &Blake3Hash) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest)
    }

    /// Every stored object with its size, last access time and pin state.
    ///
    /// Access times observed by this process take precedence over file
    /// modification times.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Task`] if the directory scan cannot run.
    pub async fn entries(&self) -> Result<Vec<CacheEntryInfo>, CacheError> {
        let objects = self.root.join(OBJECTS_DIR);
        let scanned = tokio::task::spawn_blocking(move || scan_objects(&objects))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;

        let access = self.access.lock().unwrap_or_else(PoisonError::into_inner);
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(scanned
            .into_iter()
            .map(|(digest, size, modified)| CacheEntryInfo {
                last_access: access.get(&digest).copied().unwrap_or(modified),
                pinned: pins.contains_key(&digest),
                digest,
                size,
            })
            .collect())
    }

    /// Total bytes of stored objects.
    ///
    /// # Errors
    ///
    /// See [`ContentStore::entries`].
    pub async fn total_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.entries().await?.iter().map(|e| e.size).sum())
    }

    /// Remove the objects `policy` selects, skipping pinned ones.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if an object cannot be removed.
    pub async fn evict(&self, policy: &dyn EvictionPolicy) -> Result<EvictionSummary, CacheError> {
        let entries = self.entries().await?;
        let victims = policy.select(&entries, SystemTime::now());
        let sizes: HashMap<&Blake3Hash, u64> = entries.iter().map(|e| (&e.digest, e.size)).collect();

        let mut summary = EvictionSummary::default();
        for digest in victims {
            let _lock = self.lock_digest(&digest).await;
            if self.is_pinned(&digest) {
                summary.skipped_pinned += 1;
                continue;
            }
            if remove_if_present(&self.object_path(&digest)).await? {
                summary.removed += 1;
                summary.freed_bytes += sizes.get(&digest).copied().unwrap_or(0);
            }
            self.forget(&digest);
        }
        summary.retained = entries.len().saturating_sub(summary.removed);

        info!(
            removed = summary.removed,
            freed_bytes = summary.freed_bytes,
            retained = summary.retained,
            skipped_pinned = summary.skipped_pinned,
            ?policy,
            "cache eviction finished"
        );
        Ok(summary)
    }

    fn touch(&self, digest: &Blake3Hash) {
        self.access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.clone(), SystemTime::now());
    }

    fn forget(&self, digest: &Blake3Hash) {
        self.access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(digest);
    }

    async fn lock_digest(&self, digest: &Blake3Hash) -> DigestLock<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(digest.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        DigestLock {
            store: self,
            digest: digest.clone(),
            guard: Some(guard),
        }
    }
}

/// Exclusive access to one digest. The lock table entry is dropped with the
/// last holder.
struct DigestLock<'a> {
    store: &'a ContentStore,
    digest: Blake3Hash,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DigestLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.store.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.digest)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.digest);
        }
    }
}

/// Keeps a set of digests pinned; see [`ContentStore::pin`].
#[derive(Debug)]
#[must_use = "digests are unpinned when the guard is dropped"]
pub struct PinGuard {
    pins: Arc<Mutex<HashMap<Blake3Hash, usize>>>,
    digests: Vec<Blake3Hash>,
}

impl PinGuard {
    /// The digests this guard holds.
    pub fn digests(&self) -> &[Blake3Hash] {
        &self.digests
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        for digest in &self.digests {
            if let Some(count) = pins.get_mut(digest) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(digest);
                }
            }
        }
    }
}

/// Write `bytes` to `dest` through a temp file in `tmp_dir`.
///
/// Returns `false` when `clobber` is off and `dest` already existed.
async fn write_atomic(
    tmp_dir: PathBuf,
    dest: PathBuf,
    bytes: Vec<u8>,
    clobber: bool,
) -> Result<bool, CacheError> {
    let target = dest.clone();
    let result = tokio::task::spawn_blocking(move || -> io::Result<bool> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        let persisted = if clobber {
            tmp.persist(&dest)
        } else {
            tmp.persist_noclobber(&dest)
        };
        match persisted {
            Ok(_) => Ok(true),
            Err(e) if !clobber && e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    })
    .await
    .map_err(|e| CacheError::Task(e.to_string()))?;

    result.map_err(io_error(&target))
}

/// Returns whether a file was actually removed.
async fn remove_if_present(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path)(e)),
    }
}

fn scan_objects(objects: &Path) -> Vec<(Blake3Hash, u64, SystemTime)> {
    let mut found: Vec<_> = WalkDir::new(objects)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let digest = Blake3Hash::parse(&entry.file_name().to_string_lossy()).ok()?;
            let meta = entry.metadata().ok()?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((digest, meta.len(), modified))
        })
        .collect();
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let data = b"hello, strand!";
        let digest = Blake3Hash::compute(data);
        assert_eq!(store.put(&digest, data).await.unwrap(), Stored::Written);

        assert!(store.contains(&digest).await);
        assert_eq!(store.get(&digest).await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let data = b"duplicate content";
        let digest = Blake3Hash::compute(data);
        assert_eq!(store.put(&digest, data).await.unwrap(), Stored::Written);
        assert_eq!(store.put(&digest, data).await.unwrap(), Stored::AlreadyPresent);
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_digest() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let claimed = Blake3Hash::compute(b"expected");
        let err = store.put(&claimed, b"something else").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Integrity(IntegrityError::DigestMismatch { .. })
        ));
        assert!(!store.contains(&claimed).await);
    }

    #[tokio::test]
    async fn test_get_discards_corrupt_object() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let digest = Blake3Hash::compute(b"original");
        store.put(&digest, b"original").await.unwrap();
        std::fs::write(store.object_path(&digest), b"tampered").unwrap();

        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Integrity(IntegrityError::Corrupt { .. })
        ));
        assert!(store.get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_never_overwrites_different_content() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let digest = Blake3Hash::compute(b"original");
        store.put(&digest, b"original").await.unwrap();
        std::fs::write(store.object_path(&digest), b"tampered").unwrap();

        let err = store.put(&digest, b"original").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Integrity(IntegrityError::Collision { .. })
        ));
        assert_eq!(std::fs::read(store.object_path(&digest)).unwrap(), b"tampered");
    }

    #[tokio::test]
    async fn test_refs_point_at_objects() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        assert!(store.get_ref("versions", "a").await.unwrap().is_none());

        let first = Blake3Hash::compute(b"one");
        let second = Blake3Hash::compute(b"two");
        store.set_ref("versions", "a", &first).await.unwrap();
        assert_eq!(store.get_ref("versions", "a").await.unwrap(), Some(first));
        store.set_ref("versions", "a", &second).await.unwrap();
        assert_eq!(store.get_ref("versions", "a").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_pins_nest() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let digest = Blake3Hash::compute(b"pinned");

        let outer = store.pin([digest.clone()]).await;
        let inner = store.pin([digest.clone()]).await;
        drop(outer);
        assert!(store.is_pinned(&digest));
        drop(inner);
        assert!(!store.is_pinned(&digest));
    }

    #[tokio::test]
    async fn test_pin_waits_for_digest_lock() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::open(dir.path()).await.unwrap());
        let digest = Blake3Hash::compute(b"contested");
        store.put(&digest, b"contested").await.unwrap();

        // Stand in for an eviction holding the digest between its pin check
        // and the removal.
        let held = store.lock_digest(&digest).await;
        let pinning = tokio::spawn({
            let store = Arc::clone(&store);
            let digest = digest.clone();
            async move { store.pin([digest]).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!store.is_pinned(&digest));

        drop(held);
        let guard = pinning.await.unwrap();
        assert!(store.is_pinned(&digest));
        let summary = store.evict(&LruPolicy::new(0)).await.unwrap();
        assert_eq!(summary.skipped_pinned, 0);
        assert!(store.contains(&digest).await);
        drop(guard);
    }

    #[tokio::test]
    async fn test_lock_table_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let digest = Blake3Hash::compute(b"x");
        store.put(&digest, b"x").await.unwrap();
        assert!(store.locks.lock().unwrap().is_empty());
    }
}
