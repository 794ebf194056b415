//! Local file cache with LRU eviction
//!
//! Tracks every locally materialized copy against a byte capacity. Entries
//! pinned by open descriptors are never evicted; per-version read copies are
//! reference counted so shared readers keep superseded versions alive until
//! the last one departs. All mutating operations take one critical section
//! over the whole cache state, and eviction only touches local disk.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::FsError;
use crate::fs::paths::copy_name;

/// Default cache capacity: 1 GB
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Tracked state for one cached path
struct CacheEntry {
    /// Server-assigned version of the current read copy
    version: i64,
    /// Size of the current read copy in bytes
    size: u64,
    /// Directories have no local copy
    is_directory: bool,
    /// Open descriptors pinning this entry
    references: u32,
}

/// Snapshot of a cache entry returned to sessions
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub version: i64,
    pub size: u64,
    pub is_directory: bool,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Recency order: front is most recently used, back is eviction candidate
    recency: VecDeque<String>,
    /// Per-version read copy reference counts, keyed by the copy file name
    read_refs: HashMap<String, u32>,
    /// Bytes of all local copies currently tracked
    total: u64,
}

/// Shared cache for locally materialized file copies
pub struct CacheManager {
    cache_dir: PathBuf,
    capacity: u64,
    state: Mutex<CacheState>,
}

impl CacheManager {
    /// Create a cache rooted at `cache_dir` bounded by `capacity` bytes
    pub fn new(cache_dir: PathBuf, capacity: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", cache_dir))?;

        let cache = Self {
            cache_dir,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                read_refs: HashMap::new(),
                total: 0,
            }),
        };

        cache.sweep_temp_files();

        info!(
            cache_dir = %cache.cache_dir.display(),
            capacity_mb = capacity / (1024 * 1024),
            "File cache initialized"
        );

        Ok(cache)
    }

    /// Directory holding all local copies
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Look up an entry, marking the path most recently used on a hit
    pub fn obtain(&self, path: &str) -> Option<EntryInfo> {
        let mut state = self.state.lock().unwrap();
        let info = {
            let entry = state.entries.get(path)?;
            EntryInfo {
                version: entry.version,
                size: entry.size,
                is_directory: entry.is_directory,
            }
        };
        state.recency.retain(|p| p != path);
        state.recency.push_front(path.to_string());
        debug!(path = %path, version = info.version, "Cache HIT");
        Some(info)
    }

    /// Record a newly fetched entry and account for its size.
    ///
    /// A no-op when the path is already tracked. If eviction cannot bring the
    /// total within capacity the insert is rolled back.
    pub fn insert(
        &self,
        path: &str,
        is_directory: bool,
        version: i64,
        size: u64,
    ) -> Result<(), FsError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(path) {
            return Ok(());
        }
        state.total += size;
        state.entries.insert(
            path.to_string(),
            CacheEntry {
                version,
                size,
                is_directory,
                references: 0,
            },
        );
        if let Err(e) = self.evict_locked(&mut state) {
            state.entries.remove(path);
            state.total = state.total.saturating_sub(size);
            return Err(e);
        }
        state.recency.push_front(path.to_string());
        debug!(path = %path, version = version, size = size, "Cache entry inserted");
        Ok(())
    }

    /// Adjust the tracked total for a local copy that changed size.
    ///
    /// Growth triggers eviction and is reverted if capacity cannot be
    /// reclaimed; shrinking always succeeds.
    pub fn update_usage(&self, old: u64, new: u64) -> Result<(), FsError> {
        let mut state = self.state.lock().unwrap();
        if new >= old {
            let delta = new - old;
            state.total += delta;
            if let Err(e) = self.evict_locked(&mut state) {
                state.total = state.total.saturating_sub(delta);
                return Err(e);
            }
        } else {
            state.total = state.total.saturating_sub(old - new);
        }
        Ok(())
    }

    /// Record a committed or refreshed version for a tracked path.
    ///
    /// The bytes of the new copy must already be tracked via `insert` or
    /// `update_usage`; this only rewrites the entry's version and size.
    pub fn promote(&self, path: &str, version: i64, size: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(path) {
            entry.version = version;
            entry.size = size;
        }
    }

    /// Pin an entry against eviction for the lifetime of a descriptor
    pub fn ref_entry(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(path) {
            entry.references += 1;
        }
    }

    /// Release a descriptor's pin on an entry
    pub fn unref_entry(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(path) {
            entry.references = entry.references.saturating_sub(1);
        }
    }

    /// Count a new reader of a specific version's shared copy
    pub fn read_ref(&self, path: &str, version: i64) {
        let mut state = self.state.lock().unwrap();
        *state.read_refs.entry(copy_name(path, version)).or_insert(0) += 1;
    }

    /// Release a reader of a version's shared copy.
    ///
    /// When the last reader departs and a newer version has been recorded for
    /// the path, the superseded copy is deleted and its bytes released. The
    /// check and the deletion happen under the cache lock so a concurrent
    /// reader cannot slip in between.
    pub fn drop_read_copy(&self, path: &str, version: i64) {
        let mut state = self.state.lock().unwrap();
        let key = copy_name(path, version);
        let remaining = match state.read_refs.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        state.read_refs.remove(&key);

        let superseded = state
            .entries
            .get(path)
            .map(|entry| entry.version > version)
            .unwrap_or(true);
        if !superseded {
            return;
        }

        let copy = self.cache_dir.join(&key);
        if let Ok(meta) = fs::metadata(&copy) {
            state.total = state.total.saturating_sub(meta.len());
            if let Err(e) = fs::remove_file(&copy) {
                warn!(copy = %copy.display(), error = %e, "Failed to delete superseded copy");
            } else {
                debug!(path = %path, version = version, "Deleted superseded read copy");
            }
        }
    }

    /// Delete every copy of `path` older than `up_to_version` that no reader
    /// holds, releasing the reclaimed bytes
    pub fn remove_obsolete(&self, path: &str, up_to_version: i64) {
        let mut state = self.state.lock().unwrap();
        for version in 0..up_to_version {
            let key = copy_name(path, version);
            if state.read_refs.get(&key).copied().unwrap_or(0) > 0 {
                continue;
            }
            let copy = self.cache_dir.join(&key);
            if let Ok(meta) = fs::metadata(&copy) {
                if meta.is_file() {
                    state.total = state.total.saturating_sub(meta.len());
                    let _ = fs::remove_file(&copy);
                    debug!(path = %path, version = version, "Removed obsolete copy");
                }
            }
        }
    }

    /// Drop a tracked entry and its current copy (rollback after a failed
    /// materialization)
    pub fn discard(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.remove(path) {
            state.recency.retain(|p| p != path);
            state.total = state.total.saturating_sub(entry.size);
            if !entry.is_directory {
                let copy = self.cache_dir.join(copy_name(path, entry.version));
                let _ = fs::remove_file(&copy);
            }
        }
    }

    /// Evict least-recently-used entries until the total fits the capacity.
    ///
    /// Iterative walk over the recency list: referenced entries are requeued
    /// at the most-recently-used end instead of evicted. Fails once every
    /// remaining entry is referenced.
    fn evict_locked(&self, state: &mut CacheState) -> Result<(), FsError> {
        let mut skipped = 0usize;
        while state.total > self.capacity {
            if state.recency.is_empty() || skipped >= state.recency.len() {
                warn!(
                    total = state.total,
                    capacity = self.capacity,
                    "Eviction failed, every entry is referenced"
                );
                return Err(FsError::CapacityExceeded);
            }
            let path = match state.recency.pop_back() {
                Some(path) => path,
                None => return Err(FsError::CapacityExceeded),
            };
            let referenced = match state.entries.get(&path) {
                Some(entry) => entry.references > 0,
                // Stale recency node, drop it
                None => continue,
            };
            if referenced {
                state.recency.push_front(path);
                skipped += 1;
                continue;
            }
            let entry = match state.entries.remove(&path) {
                Some(entry) => entry,
                None => continue,
            };
            if !entry.is_directory {
                let copy = self.cache_dir.join(copy_name(&path, entry.version));
                if let Err(e) = fs::remove_file(&copy) {
                    warn!(copy = %copy.display(), error = %e, "Failed to delete evicted copy");
                }
            }
            state.total = state.total.saturating_sub(entry.size);
            skipped = 0;
            debug!(path = %path, size = entry.size, "Evicted cache entry");
        }
        Ok(())
    }

    /// Remove temp files left behind by an interrupted materialization
    fn sweep_temp_files(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.cache_dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let stale = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(".tmp"))
                    .unwrap_or(false);
                if stale {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// Currently tracked bytes
    pub fn total(&self) -> u64 {
        self.state.lock().unwrap().total
    }

    /// Configured capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether a path is currently tracked
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }

    /// Current descriptor pin count for a path
    pub fn entry_references(&self, path: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(path)
            .map(|e| e.references)
            .unwrap_or(0)
    }

    /// Current reader count for one version's shared copy
    pub fn read_refs(&self, path: &str, version: i64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .read_refs
            .get(&copy_name(path, version))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn cache_with_capacity(capacity: u64) -> (TempDir, CacheManager) {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf(), capacity).unwrap();
        (dir, cache)
    }

    fn put_copy(dir: &TempDir, path: &str, version: i64, size: usize) -> PathBuf {
        let copy = dir.path().join(copy_name(path, version));
        let mut file = File::create(&copy).unwrap();
        file.write_all(&vec![b'x'; size]).unwrap();
        copy
    }

    #[test]
    fn test_insert_and_obtain() {
        let (_dir, cache) = cache_with_capacity(1000);
        assert!(cache.obtain("a.txt").is_none());

        cache.insert("a.txt", false, 0, 100).unwrap();
        let info = cache.obtain("a.txt").unwrap();
        assert_eq!(info.version, 0);
        assert_eq!(info.size, 100);
        assert_eq!(cache.total(), 100);

        // Duplicate insert is a no-op
        cache.insert("a.txt", false, 0, 100).unwrap();
        assert_eq!(cache.total(), 100);
    }

    #[test]
    fn test_lru_eviction_order() {
        let (dir, cache) = cache_with_capacity(100);
        let copy_a = put_copy(&dir, "a", 0, 40);
        put_copy(&dir, "b", 0, 40);
        put_copy(&dir, "c", 0, 40);

        cache.insert("a", false, 0, 40).unwrap();
        cache.insert("b", false, 0, 40).unwrap();
        // Touch "a" so "b" becomes the eviction candidate
        cache.obtain("a").unwrap();
        cache.insert("c", false, 0, 40).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(copy_a.exists());
        assert!(!dir.path().join(copy_name("b", 0)).exists());
        assert!(cache.total() <= 100);
    }

    #[test]
    fn test_referenced_entries_survive_eviction() {
        let (dir, cache) = cache_with_capacity(100);
        let copy_a = put_copy(&dir, "a", 0, 60);
        put_copy(&dir, "b", 0, 60);

        cache.insert("a", false, 0, 60).unwrap();
        cache.ref_entry("a");

        let err = cache.insert("b", false, 0, 60).unwrap_err();
        assert_eq!(err, FsError::CapacityExceeded);
        // The failed insert is rolled back, the pinned entry stays
        assert!(!cache.contains("b"));
        assert!(cache.contains("a"));
        assert!(copy_a.exists());
        assert_eq!(cache.total(), 60);

        cache.unref_entry("a");
        cache.insert("b", false, 0, 60).unwrap();
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_update_usage_growth_and_rollback() {
        let (_dir, cache) = cache_with_capacity(100);
        cache.insert("a", false, 0, 50).unwrap();
        cache.ref_entry("a");

        cache.update_usage(0, 30).unwrap();
        assert_eq!(cache.total(), 80);

        let err = cache.update_usage(30, 90).unwrap_err();
        assert_eq!(err, FsError::CapacityExceeded);
        assert_eq!(cache.total(), 80);

        cache.update_usage(30, 0).unwrap();
        assert_eq!(cache.total(), 50);
    }

    #[test]
    fn test_drop_read_copy_deletes_only_superseded() {
        let (dir, cache) = cache_with_capacity(1000);
        let copy_v0 = put_copy(&dir, "a", 0, 10);

        cache.insert("a", false, 0, 10).unwrap();
        cache.read_ref("a", 0);
        cache.read_ref("a", 0);
        assert_eq!(cache.read_refs("a", 0), 2);

        // Still the current version: last reader departs, copy stays
        cache.drop_read_copy("a", 0);
        cache.drop_read_copy("a", 0);
        assert_eq!(cache.read_refs("a", 0), 0);
        assert!(copy_v0.exists());

        // A newer version supersedes the copy
        cache.read_ref("a", 0);
        cache.promote("a", 1, 10);
        cache.drop_read_copy("a", 0);
        assert!(!copy_v0.exists());
    }

    #[test]
    fn test_remove_obsolete_spares_referenced_copies() {
        let (dir, cache) = cache_with_capacity(1000);
        let copy_v0 = put_copy(&dir, "a", 0, 10);
        let copy_v1 = put_copy(&dir, "a", 1, 10);

        cache.insert("a", false, 2, 10).unwrap();
        cache.update_usage(0, 20).unwrap();
        cache.read_ref("a", 1);

        cache.remove_obsolete("a", 2);
        assert!(!copy_v0.exists());
        assert!(copy_v1.exists());
        assert_eq!(cache.total(), 20);
    }

    #[test]
    fn test_sweep_removes_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join(".tmpXYZ123");
        File::create(&stale).unwrap();
        let kept = dir.path().join("data.txt_0");
        File::create(&kept).unwrap();

        let _cache = CacheManager::new(dir.path().to_path_buf(), 1000).unwrap();
        assert!(!stale.exists());
        assert!(kept.exists());
    }

    #[test]
    fn test_discard_rolls_back_entry() {
        let (dir, cache) = cache_with_capacity(1000);
        let copy = put_copy(&dir, "a", 0, 10);
        cache.insert("a", false, 0, 10).unwrap();

        cache.discard("a");
        assert!(!cache.contains("a"));
        assert_eq!(cache.total(), 0);
        assert!(!copy.exists());
    }
}
