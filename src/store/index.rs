// In-memory cache index — key/entry map, byte accounting and LRU ordering.
// Owned by `DiskStore` behind a single lock; not synchronized itself.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::resolver::CacheKey;

/// One cached artifact. Created on successful fetch completion; last-access
/// is bumped on every hit; destroyed by eviction or explicit invalidation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub len: u64,
    pub inserted_at: u64,
    pub last_access: u64,
}

/// Persisted form of one entry inside the on-disk metadata record.
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    pub file: String,
    pub len: u64,
    pub inserted_at: u64,
    pub last_access: u64,
}

/// Recency ordering: oldest last-access first, ties broken by oldest
/// insertion, then by a monotonic sequence so keys never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    last_access: u64,
    inserted_at: u64,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<CacheKey, (CacheEntry, OrderKey)>,
    order: BTreeMap<OrderKey, CacheKey>,
    total_bytes: u64,
    next_seq: u64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes across all indexed entries. Equals the sum of entry sizes
    /// at all times; insert and remove both maintain it.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    fn next_order(&mut self, last_access: u64, inserted_at: u64) -> OrderKey {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        OrderKey {
            last_access,
            inserted_at,
            seq,
        }
    }

    /// Insert or replace an entry. Replacing subtracts the previous size so
    /// the byte accounting stays exact.
    pub fn insert(&mut self, entry: CacheEntry) {
        if let Some((prev, order)) = self.entries.remove(&entry.key) {
            self.order.remove(&order);
            self.total_bytes = self.total_bytes.saturating_sub(prev.len);
        }
        let order = self.next_order(entry.last_access, entry.inserted_at);
        self.total_bytes = self.total_bytes.saturating_add(entry.len);
        self.order.insert(order, entry.key.clone());
        self.entries.insert(entry.key.clone(), (entry, order));
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let (entry, order) = self.entries.remove(key)?;
        self.order.remove(&order);
        self.total_bytes = self.total_bytes.saturating_sub(entry.len);
        Some(entry)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key).map(|(entry, _)| entry)
    }

    /// Look up an entry and mark it as just used.
    pub fn touch(&mut self, key: &CacheKey, now: u64) -> Option<CacheEntry> {
        let (mut entry, old_order) = self.entries.remove(key)?;
        entry.last_access = now;
        let new_order = self.next_order(now, entry.inserted_at);
        self.order.remove(&old_order);
        self.order.insert(new_order, key.clone());
        let snapshot = entry.clone();
        self.entries.insert(key.clone(), (entry, new_order));
        Some(snapshot)
    }

    /// Key of the least-recently-used entry, if any.
    pub fn lru_candidate(&self) -> Option<CacheKey> {
        self.order.values().next().cloned()
    }

    /// All entries in recency order (least recently used first).
    pub fn entries_lru_first(&self) -> impl Iterator<Item = &CacheEntry> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|(entry, _)| entry))
    }

    /// Serializable snapshot for the on-disk metadata record.
    pub fn records(&self) -> Vec<EntryRecord> {
        self.entries_lru_first()
            .map(|entry| EntryRecord {
                key: entry.key.as_str().to_string(),
                file: entry
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                len: entry.len,
                inserted_at: entry.inserted_at,
                last_access: entry.last_access,
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<CacheEntry> {
        self.order.clear();
        self.total_bytes = 0;
        self.entries.drain().map(|(_, (entry, _))| entry).collect()
    }
}
