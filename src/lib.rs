//! # nested-art
//!
//! An Adaptive Radix Tree index from byte keys to sets of row ids.
//!
//! ## Leaves
//!
//! The row ids stored under one key take one of three shapes:
//!
//! 1. **Inlined**: a single row id kept in the leaf handle itself.
//! 2. **Gate**: the root of a nested tree keyed by 8-byte encoded row ids,
//!    flagged so traversal knows where the outer key ends.
//! 3. **Legacy chain**: linked chunks of up to four row ids, as written by
//!    older images. They are readable as is and migrate to a gate (or an
//!    inlined leaf) on the first mutation that reaches them.
//!
//! ## Example
//!
//! ```rust
//! use nested_art::{Art, ArtKey};
//!
//! let mut index = Art::new();
//! index.insert(&ArtKey::encode("apple"), 7).unwrap();
//! index.insert(&ArtKey::encode("apple"), 3).unwrap();
//!
//! let mut row_ids = Vec::new();
//! assert!(index.lookup(&ArtKey::encode("apple"), usize::MAX, &mut row_ids));
//! assert_eq!(row_ids, vec![3, 7]);
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod arena;
pub mod art;
pub mod encoding;
pub mod error;

pub use art::iterator::ArtIterator;
pub use art::key::{ArtKey, KeyEncode, KeySection};
pub use art::leaf::{GatedLeaf, LEAF_SIZE};
pub use art::node::{NType, Node, NodePtr};
pub use art::serialize::StorageFormat;
pub use art::tree::GateStatus;
pub use art::{Art, ArtMemoryStats, RowId, VacuumStats, MAX_ROW_ID_LOCAL};
pub use error::{ArtError, Result};

use std::ops::Bound;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

/// Configuration for the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Slots per segment in every node pool.
    pub slots_per_segment: usize,
    /// Segment limit per node pool; allocation fails beyond it.
    pub max_segments: Option<usize>,
    /// Segments whose live fraction drops below this are compacted by vacuum.
    pub vacuum_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots_per_segment: 256,
            max_segments: None,
            vacuum_threshold: 0.5,
        }
    }
}

/// Thread-safe wrapper around [`Art`]: any number of readers or a single
/// writer.
///
/// ## Example
///
/// ```rust
/// use nested_art::{ArtKey, SharedArt};
///
/// let index = SharedArt::new();
/// index.insert(&ArtKey::encode(&42u64), 1).unwrap();
/// assert!(index.contains(&ArtKey::encode(&42u64), 1));
/// ```
pub struct SharedArt {
    inner: RwLock<Art>,
}

impl SharedArt {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: RwLock::new(Art::with_config(config)),
        }
    }

    pub fn from_art(art: Art) -> Self {
        Self {
            inner: RwLock::new(art),
        }
    }

    pub fn insert(&self, key: &ArtKey, row_id: RowId) -> Result<bool> {
        self.inner.write().insert(key, row_id)
    }

    pub fn erase(&self, key: &ArtKey, row_id: RowId) -> Result<()> {
        self.inner.write().erase(key, row_id)
    }

    /// Row ids under `key`, or `None` if there are more than `max_count`.
    pub fn lookup(&self, key: &ArtKey, max_count: usize) -> Option<Vec<RowId>> {
        let mut out = Vec::new();
        self.inner
            .read()
            .lookup(key, max_count, &mut out)
            .then_some(out)
    }

    pub fn contains(&self, key: &ArtKey, row_id: RowId) -> bool {
        self.inner.read().contains(key, row_id)
    }

    /// Row ids of all keys within the bounds, or `None` if there are more
    /// than `max_count`.
    pub fn range_scan(
        &self,
        lower: Bound<&ArtKey>,
        upper: Bound<&ArtKey>,
        max_count: usize,
    ) -> Option<Vec<RowId>> {
        let mut out = Vec::new();
        self.inner
            .read()
            .range_scan(lower, upper, max_count, &mut out)
            .then_some(out)
    }

    pub fn vacuum(&self) -> Result<VacuumStats> {
        self.inner.write().vacuum()
    }

    /// Encode the index. Takes the write lock: a legacy image rewrites gates
    /// in memory.
    pub fn serialize(&self, format: StorageFormat) -> Result<Vec<u8>> {
        self.inner.write().serialize(format)
    }

    pub fn memory_stats(&self) -> ArtMemoryStats {
        self.inner.read().memory_stats()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Art> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Art> {
        self.inner.write()
    }

    pub fn into_inner(self) -> Art {
        self.inner.into_inner()
    }
}

impl Default for SharedArt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_config_defaults() {
        let config = Config {
            slots_per_segment: 8,
            ..Config::default()
        };
        assert_eq!(config.max_segments, None);
        assert_eq!(config.vacuum_threshold, 0.5);
    }

    #[test]
    fn test_shared_concurrent_readers_and_writers() {
        let index = Arc::new(SharedArt::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for i in 0..250i64 {
                        let key = ArtKey::encode(&(i % 25));
                        index.insert(&key, t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for _ in 0..100 {
                    let _ = index.lookup(&ArtKey::encode(&3i64), usize::MAX);
                }
            })
        };
        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let all = index
            .range_scan(Bound::Unbounded, Bound::Unbounded, usize::MAX)
            .unwrap();
        assert_eq!(all.len(), 1000);
        let key_three = index.lookup(&ArtKey::encode(&3i64), usize::MAX).unwrap();
        assert_eq!(key_three.len(), 40);
        assert!(index.lookup(&ArtKey::encode(&3i64), 10).is_none());
    }

    #[test]
    fn test_shared_into_inner() {
        let index = SharedArt::with_config(Config::default());
        index.insert(&ArtKey::encode("k"), 1).unwrap();
        index.erase(&ArtKey::encode("k"), 1).unwrap();
        let art = index.into_inner();
        assert!(art.is_empty());
    }
}

#[cfg(test)]
mod proptests;
