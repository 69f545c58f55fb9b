// Disk-backed cache store — one file per cache key under the cache root,
// plus a metadata record that warms the in-memory index on startup.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::index::{CacheEntry, CacheIndex, EntryRecord};
use crate::config::{CACHE_FILE_EXT, CACHE_INDEX_FILE};
use crate::error::EngineError;
use crate::resolver::CacheKey;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct DiskStore {
    cache_dir: PathBuf,
    capacity_bytes: u64,
    index: Mutex<CacheIndex>,
}

impl DiskStore {
    /// Open a store rooted at `cache_dir`, warming the index from the
    /// persisted metadata record. A missing or corrupt record is never
    /// fatal: the index rebuilds from the directory listing instead.
    pub fn open(cache_dir: impl Into<PathBuf>, capacity_bytes: u64) -> std::io::Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;

        let store = Self {
            cache_dir,
            capacity_bytes,
            index: Mutex::new(CacheIndex::new()),
        };
        store.warm();
        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(CACHE_INDEX_FILE)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, CACHE_FILE_EXT))
    }

    /// Load the metadata record, dropping entries whose backing file is
    /// missing or has an unexpected size, then adopt any untracked cache
    /// files found in the directory so they become subject to eviction.
    fn warm(&self) {
        let mut index = self.index.lock();

        match fs::read(self.index_path()) {
            Ok(bytes) => match serde_json::from_slice::<Vec<EntryRecord>>(&bytes) {
                Ok(records) => {
                    for record in records {
                        let path = self.cache_dir.join(&record.file);
                        match fs::metadata(&path) {
                            Ok(meta) if meta.len() == record.len => {
                                index.insert(CacheEntry {
                                    key: CacheKey::from(record.key),
                                    path,
                                    len: record.len,
                                    inserted_at: record.inserted_at,
                                    last_access: record.last_access,
                                });
                            }
                            _ => {
                                debug!("dropping stale index record key={}", record.key);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("cache metadata unreadable, rebuilding from directory: {}", e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("cache metadata unreadable, rebuilding from directory: {}", e);
            }
        }

        self.adopt_untracked(&mut index);
        info!(
            "cache warmed: {} entries, {} bytes",
            index.len(),
            index.total_bytes()
        );
        let _ = self.persist(&index);
    }

    fn adopt_untracked(&self, index: &mut CacheIndex) {
        let Ok(read_dir) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext == Some("part") {
                // Leftover from an interrupted write; nothing references it.
                let _ = fs::remove_file(&path);
                continue;
            }
            if ext != Some(CACHE_FILE_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = CacheKey::from(key.to_string());
            if index.contains(&key) {
                continue;
            }
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let stamp = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or_else(unix_now);
            debug!("adopting untracked cache file {}", path.display());
            index.insert(CacheEntry {
                key,
                path,
                len: meta.len(),
                inserted_at: stamp,
                last_access: stamp,
            });
        }
    }

    /// Rewrite the on-disk metadata record from the current index. Called
    /// after every mutation; last-access bumps from lookups ride along with
    /// the next mutation.
    fn persist(&self, index: &CacheIndex) -> std::io::Result<()> {
        let records = index.records();
        let bytes = serde_json::to_vec(&records)?;
        let tmp = self.index_path().with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.index_path())?;
        Ok(())
    }

    /// O(1) index lookup. On hit, bumps last-access (delaying eviction) and
    /// returns the entry. Never touches the network.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut index = self.index.lock();
        index.touch(key, unix_now())
    }

    /// Begin a streaming insert. Bytes go to a temp file; nothing is indexed
    /// until [`DiskStore::commit`]. Dropping the handle without committing
    /// removes the partial file.
    pub fn begin(&self, key: &CacheKey) -> Result<PendingWrite, EngineError> {
        let final_path = self.entry_path(key);
        let temp_path = final_path.with_extension(format!("{}.part", CACHE_FILE_EXT));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(EngineError::write_failure)?;
        Ok(PendingWrite {
            file: Some(file),
            temp_path,
            final_path,
            written: 0,
        })
    }

    /// Finish a streaming insert: fsync-free rename into place, record the
    /// entry, then evict down to capacity.
    pub fn commit(&self, key: &CacheKey, mut pending: PendingWrite) -> Result<CacheEntry, EngineError> {
        let file = pending.file.take();
        let result = (|| -> std::io::Result<()> {
            if let Some(mut f) = file {
                f.flush()?;
            }
            fs::rename(&pending.temp_path, &pending.final_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            // Partial write rollback: no index record, no leftover file.
            let _ = fs::remove_file(&pending.temp_path);
            return Err(EngineError::write_failure(e));
        }

        let now = unix_now();
        let entry = CacheEntry {
            key: key.clone(),
            path: pending.final_path.clone(),
            len: pending.written,
            inserted_at: now,
            last_access: now,
        };

        let mut index = self.index.lock();
        index.insert(entry.clone());
        self.evict_if_needed(&mut index, key);
        if let Err(e) = self.persist(&index) {
            warn!("cache metadata write failed: {}", e);
        }
        Ok(entry)
    }

    /// Convenience insert for callers holding the whole payload in memory.
    pub fn insert(&self, key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry, EngineError> {
        let mut pending = self.begin(key)?;
        pending.write_chunk(bytes)?;
        self.commit(key, pending)
    }

    /// While usage exceeds capacity, remove the least-recently-used entry.
    /// The entry just committed is never a victim: its caller was promised a
    /// usable path, so an oversized insert stays until the next one. A failed
    /// file deletion is logged and the index entry is dropped regardless, so
    /// a dangling record never outlives its file.
    fn evict_if_needed(&self, index: &mut CacheIndex, keep: &CacheKey) {
        while index.total_bytes() > self.capacity_bytes {
            let Some(victim) = index.lru_candidate() else {
                break;
            };
            if victim == *keep {
                break;
            }
            let Some(entry) = index.remove(&victim) else {
                break;
            };
            debug!("evicting {} ({} bytes)", victim, entry.len);
            if let Err(e) = fs::remove_file(&entry.path) {
                warn!("evicted file removal failed for {}: {}", entry.path.display(), e);
            }
        }
    }

    /// Remove an entry unconditionally. No-op when absent.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut index = self.index.lock();
        if let Some(entry) = index.remove(key) {
            if let Err(e) = fs::remove_file(&entry.path) {
                warn!("invalidated file removal failed for {}: {}", entry.path.display(), e);
            }
            if let Err(e) = self.persist(&index) {
                warn!("cache metadata write failed: {}", e);
            }
        }
    }

    /// Drop every entry and its backing file.
    pub fn clear(&self) {
        let mut index = self.index.lock();
        for entry in index.drain() {
            if let Err(e) = fs::remove_file(&entry.path) {
                warn!("cleared file removal failed for {}: {}", entry.path.display(), e);
            }
        }
        if let Err(e) = self.persist(&index) {
            warn!("cache metadata write failed: {}", e);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes()
    }

    pub fn entry_count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Handle for an in-progress streaming insert.
pub struct PendingWrite {
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl PendingWrite {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        let file = self
            .file
            .as_mut()
            .expect("write_chunk after commit");
        file.write_all(chunk).map_err(EngineError::write_failure)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        // Uncommitted write: discard the partial file.
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
