// Disk cache store — size-bounded, LRU-evicted, warmable from disk.

pub mod disk;
pub mod index;

pub use disk::{DiskStore, PendingWrite};
pub use index::{CacheEntry, CacheIndex};
