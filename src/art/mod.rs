//! Adaptive Radix Tree (ART) index with nested row-id leaves.
//!
//! Based on "The Adaptive Radix Tree: ARTful Indexing for Main-Memory Databases"
//! by Leis et al., 2013.
//!
//! Key features:
//! - Adaptive node sizes (4, 16, 48, 256 children)
//! - Path compression through prefix chains
//! - Non-unique keys: a key maps to a set of row ids, kept inline when there
//!   is one and in a nested tree (a gate) otherwise
//! - Nodes live in generation-checked pools that can be vacuumed

pub mod iterator;
pub mod key;
pub mod leaf;
pub mod node;
pub mod prefix;
pub mod serialize;
pub mod tree;

mod debug;

use std::ops::Bound;

use tracing::{debug, trace};

use crate::arena::FixedSizeAllocator;
use crate::error::{ArtError, Result};
use crate::Config;

use iterator::ArtIterator;
use key::{ArtKey, KeySection, MAX_KEY_LEN};
use leaf::{GatedLeaf, Leaf};
use node::{Node, Node16, Node256, Node4, Node48};
use prefix::Prefix;
use tree::GateStatus;

/// Identifier of an indexed row.
pub type RowId = i64;

/// Exclusive upper bound of row ids the index stores. Larger values are
/// reserved for rows that have not been assigned a local position.
pub const MAX_ROW_ID_LOCAL: RowId = 1 << 56;

pub(crate) fn prefix_conflict(key: &[u8]) -> ArtError {
    ArtError::PrefixConflict { key: key.to_vec() }
}

/// Memory statistics for the ART.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtMemoryStats {
    /// Bytes reserved by all node pools
    pub node_bytes: usize,
    /// Segments holding memory across all pools
    pub segments: usize,
    pub prefix_count: usize,
    /// Number of legacy leaf chunks
    pub leaf_count: usize,
    pub node4_count: usize,
    pub node16_count: usize,
    pub node48_count: usize,
    pub node256_count: usize,
}

impl ArtMemoryStats {
    /// Total number of pooled nodes.
    pub fn node_count(&self) -> usize {
        self.prefix_count
            + self.leaf_count
            + self.node4_count
            + self.node16_count
            + self.node48_count
            + self.node256_count
    }
}

/// Outcome of a vacuum pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    /// Nodes moved out of sparse segments
    pub relocated: usize,
    /// Segments whose memory was released
    pub released_segments: usize,
}

/// An index from byte keys to sets of row ids.
///
/// Mutations take `&mut self`; callers serialize writers externally (see
/// [`crate::SharedArt`]).
pub struct Art {
    pub(crate) prefixes: FixedSizeAllocator<Prefix>,
    pub(crate) leaves: FixedSizeAllocator<Leaf>,
    pub(crate) nodes4: FixedSizeAllocator<Node4>,
    pub(crate) nodes16: FixedSizeAllocator<Node16>,
    pub(crate) nodes48: FixedSizeAllocator<Node48>,
    pub(crate) nodes256: FixedSizeAllocator<Node256>,
    pub(crate) root: Node,
    config: Config,
}

impl Default for Art {
    fn default() -> Self {
        Self::new()
    }
}

impl Art {
    /// Create an empty index with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let slots = config.slots_per_segment;
        let max = config.max_segments;
        Self {
            prefixes: FixedSizeAllocator::new("prefix", slots, max),
            leaves: FixedSizeAllocator::new("leaf", slots, max),
            nodes4: FixedSizeAllocator::new("node4", slots, max),
            nodes16: FixedSizeAllocator::new("node16", slots, max),
            nodes48: FixedSizeAllocator::new("node48", slots, max),
            nodes256: FixedSizeAllocator::new("node256", slots, max),
            root: Node::Empty,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle of the root node.
    pub fn root(&self) -> Node {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Add `row_id` to the set stored under `key`.
    ///
    /// Returns false if the pair was already present.
    pub fn insert(&mut self, key: &ArtKey, row_id: RowId) -> Result<bool> {
        if !(0..MAX_ROW_ID_LOCAL).contains(&row_id) {
            return Err(ArtError::RowIdOutOfRange { row_id });
        }
        if key.is_empty() {
            return Err(prefix_conflict(key));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ArtError::KeyTooLong { len: key.len() });
        }
        if self.contains(key, row_id) {
            return Ok(false);
        }

        let mut root = self.root;
        let result = self.insert_leaf(&mut root, key, 0, Node::inlined(row_id), GateStatus::Outside);
        self.root = root;
        result?;

        debug_assert!(self.gated_leaf_holds(key, row_id));
        trace!(?key, row_id, "inserted");
        Ok(true)
    }

    /// Remove `row_id` from the set stored under `key`. Missing pairs are
    /// ignored.
    pub fn erase(&mut self, key: &ArtKey, row_id: RowId) -> Result<()> {
        let row_key = ArtKey::from_row_id(row_id);
        let mut root = self.root;
        let result = self.erase_at(&mut root, key, 0, &row_key, GateStatus::Outside);
        self.root = root;
        result?;

        debug_assert!(!self.gated_leaf_holds(key, row_id));
        trace!(?key, row_id, "erased");
        Ok(())
    }

    /// Whether the non-legacy leaf at `key` holds `row_id`.
    fn gated_leaf_holds(&self, key: &ArtKey, row_id: RowId) -> bool {
        self.lookup_leaf(self.root, key, 0, GateStatus::Outside)
            .and_then(GatedLeaf::from_node)
            .is_some_and(|leaf| self.contains_row_id(leaf, &ArtKey::from_row_id(row_id)))
    }

    /// Append the row ids stored under `key` to `out` in ascending order
    /// (legacy leaves in stored order).
    ///
    /// Returns false if that would take `out` beyond `max_count`.
    pub fn lookup(&self, key: &ArtKey, max_count: usize, out: &mut Vec<RowId>) -> bool {
        match self.lookup_leaf(self.root, key, 0, GateStatus::Outside) {
            Some(leaf) => self.leaf_row_ids(leaf, out, max_count),
            None => true,
        }
    }

    pub fn contains(&self, key: &ArtKey, row_id: RowId) -> bool {
        self.lookup_leaf(self.root, key, 0, GateStatus::Outside)
            .is_some_and(|leaf| self.leaf_contains(leaf, row_id))
    }

    /// Append the row ids of every key within the bounds to `out`, in key
    /// order.
    ///
    /// Returns false if that would take `out` beyond `max_count`; `out` then
    /// holds a partial result.
    pub fn range_scan(
        &self,
        lower: Bound<&ArtKey>,
        upper: Bound<&ArtKey>,
        max_count: usize,
        out: &mut Vec<RowId>,
    ) -> bool {
        let mut it = ArtIterator::new(self);
        let positioned = match lower {
            Bound::Unbounded => it.find_minimum(self.root),
            Bound::Included(key) => it.lower_bound(self.root, key, true),
            Bound::Excluded(key) => it.lower_bound(self.root, key, false),
        };
        if !positioned {
            return true;
        }
        match upper {
            Bound::Unbounded => it.scan(None, max_count, out, false),
            Bound::Included(key) => it.scan(Some(key.as_bytes()), max_count, out, true),
            Bound::Excluded(key) => it.scan(Some(key.as_bytes()), max_count, out, false),
        }
    }

    /// Bulk-build an empty index from `(key, row id)` pairs sorted by key and
    /// then row id.
    pub fn construct_from_sorted(&mut self, keys: &[ArtKey], row_ids: &[RowId]) -> Result<()> {
        if !self.root.is_empty() {
            return Err(ArtError::NotEmpty);
        }
        if keys.len() != row_ids.len() {
            return Err(ArtError::InvalidInput("keys and row ids differ in length"));
        }
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(&row_id) = row_ids
            .iter()
            .find(|r| !(0..MAX_ROW_ID_LOCAL).contains(*r))
        {
            return Err(ArtError::RowIdOutOfRange { row_id });
        }
        let sorted = keys
            .windows(2)
            .zip(row_ids.windows(2))
            .all(|(k, r)| (&k[0], r[0]) < (&k[1], r[1]));
        if !sorted {
            return Err(ArtError::InvalidInput(
                "pairs are not strictly sorted by key and row id",
            ));
        }
        if keys.iter().any(|k| k.is_empty()) {
            return Err(prefix_conflict(&[]));
        }
        if let Some(key) = keys.iter().find(|k| k.len() > MAX_KEY_LEN) {
            return Err(ArtError::KeyTooLong { len: key.len() });
        }

        let row_keys: Vec<ArtKey> = row_ids.iter().map(|&r| ArtKey::from_row_id(r)).collect();
        let mut root = Node::Empty;
        let section = KeySection::new(0, keys.len() - 1, 0);
        if let Err(err) = self.construct(keys, &row_keys, &mut root, section, GateStatus::Outside) {
            self.reset();
            return Err(err);
        }
        self.root = root;
        debug!(pairs = keys.len(), "constructed index from sorted input");
        Ok(())
    }

    /// Add every `(key, row id)` pair of `other` to this index.
    ///
    /// Each leaf of `other` is copied whole, minus the row ids this index
    /// already holds under the same key, and combined with the leaf-level
    /// merge.
    pub fn merge(&mut self, other: &Art) -> Result<()> {
        let mut it = ArtIterator::new(other);
        let mut more = it.find_minimum(other.root);
        let mut merged = 0usize;
        let mut row_ids = Vec::new();
        while more {
            let Some(leaf) = it.leaf() else {
                break;
            };
            row_ids.clear();
            other.leaf_row_ids(leaf, &mut row_ids, usize::MAX);
            let key = ArtKey::from_bytes(it.key());
            row_ids.retain(|&row_id| !self.contains(&key, row_id));
            row_ids.sort_unstable();

            let copy = match row_ids.as_slice() {
                [] => Node::Empty,
                [row_id] => Node::inlined(*row_id),
                _ => {
                    let keys: Vec<ArtKey> =
                        row_ids.iter().map(|&r| ArtKey::from_row_id(r)).collect();
                    let mut gate = Node::Empty;
                    self.new_gate(&mut gate, &keys, 0, keys.len())?;
                    gate
                }
            };
            if !copy.is_empty() {
                let mut root = self.root;
                let result = self.insert_leaf(&mut root, &key, 0, copy, GateStatus::Outside);
                self.root = root;
                if let Err(err) = result {
                    // A conflict is detected before the copy is linked anywhere.
                    if matches!(err, ArtError::PrefixConflict { .. }) {
                        let mut copy = copy;
                        self.free_tree(&mut copy);
                    }
                    return Err(err);
                }
                merged += 1;
            }
            more = it.next_leaf();
        }
        debug!(leaves = merged, "merged index");
        Ok(())
    }

    /// Compact sparse pool segments.
    ///
    /// Every node in a segment whose live fraction is below the configured
    /// threshold is moved, and the emptied segments are released. Handles
    /// held outside the tree are invalidated.
    pub fn vacuum(&mut self) -> Result<VacuumStats> {
        let threshold = self.config.vacuum_threshold;
        let flagged = [
            self.prefixes.init_vacuum(threshold),
            self.leaves.init_vacuum(threshold),
            self.nodes4.init_vacuum(threshold),
            self.nodes16.init_vacuum(threshold),
            self.nodes48.init_vacuum(threshold),
            self.nodes256.init_vacuum(threshold),
        ];
        if !flagged.contains(&true) {
            return Ok(VacuumStats::default());
        }

        let mut root = self.root;
        let result = self.vacuum_node(&mut root);
        self.root = root;

        let released_segments = self.prefixes.finalize_vacuum()
            + self.leaves.finalize_vacuum()
            + self.nodes4.finalize_vacuum()
            + self.nodes16.finalize_vacuum()
            + self.nodes48.finalize_vacuum()
            + self.nodes256.finalize_vacuum();
        let stats = VacuumStats {
            relocated: result?,
            released_segments,
        };
        debug!(
            relocated = stats.relocated,
            released = stats.released_segments,
            "vacuumed index"
        );
        Ok(stats)
    }

    pub fn memory_stats(&self) -> ArtMemoryStats {
        ArtMemoryStats {
            node_bytes: self.prefixes.memory_usage()
                + self.leaves.memory_usage()
                + self.nodes4.memory_usage()
                + self.nodes16.memory_usage()
                + self.nodes48.memory_usage()
                + self.nodes256.memory_usage(),
            segments: self.prefixes.segment_count()
                + self.leaves.segment_count()
                + self.nodes4.segment_count()
                + self.nodes16.segment_count()
                + self.nodes48.segment_count()
                + self.nodes256.segment_count(),
            prefix_count: self.prefixes.len(),
            leaf_count: self.leaves.len(),
            node4_count: self.nodes4.len(),
            node16_count: self.nodes16.len(),
            node48_count: self.nodes48.len(),
            node256_count: self.nodes256.len(),
        }
    }

    /// Drop every node.
    pub fn reset(&mut self) {
        self.prefixes.reset();
        self.leaves.reset();
        self.nodes4.reset();
        self.nodes16.reset();
        self.nodes48.reset();
        self.nodes256.reset();
        self.root = Node::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(art: &Art, key: &ArtKey) -> Vec<RowId> {
        let mut out = Vec::new();
        assert!(art.lookup(key, usize::MAX, &mut out));
        out
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut art = Art::new();
        let key = ArtKey::encode("apple");
        assert!(art.insert(&key, 1).unwrap());
        assert!(!art.insert(&key, 1).unwrap());
        assert!(art.insert(&key, 5).unwrap());
        assert!(art.insert(&ArtKey::encode("apricot"), 2).unwrap());

        assert_eq!(lookup(&art, &key), vec![1, 5]);
        assert_eq!(lookup(&art, &ArtKey::encode("apricot")), vec![2]);
        assert!(lookup(&art, &ArtKey::encode("banana")).is_empty());
        assert!(art.contains(&key, 5));
        assert!(!art.contains(&key, 2));
    }

    #[test]
    fn test_row_id_range() {
        let mut art = Art::new();
        let key = ArtKey::encode(&1u8);
        assert!(matches!(
            art.insert(&key, -1),
            Err(ArtError::RowIdOutOfRange { row_id: -1 })
        ));
        assert!(matches!(
            art.insert(&key, MAX_ROW_ID_LOCAL),
            Err(ArtError::RowIdOutOfRange { .. })
        ));
        assert!(art.insert(&key, MAX_ROW_ID_LOCAL - 1).unwrap());
        assert_eq!(lookup(&art, &key), vec![MAX_ROW_ID_LOCAL - 1]);
    }

    #[test]
    fn test_prefix_conflict() {
        let mut art = Art::new();
        art.insert(&ArtKey::from_bytes(b"abc"), 1).unwrap();
        assert!(matches!(
            art.insert(&ArtKey::from_bytes(b"ab"), 2),
            Err(ArtError::PrefixConflict { .. })
        ));
        assert!(matches!(
            art.insert(&ArtKey::from_bytes(b"abcd"), 2),
            Err(ArtError::PrefixConflict { .. })
        ));
        assert_eq!(lookup(&art, &ArtKey::from_bytes(b"abc")), vec![1]);
    }

    #[test]
    fn test_leaf_lifecycle() {
        let mut art = Art::new();
        let key = ArtKey::encode("k");
        let leaf = |art: &Art| art.lookup_leaf(art.root, &key, 0, GateStatus::Outside);

        art.insert(&key, 42).unwrap();
        assert_eq!(leaf(&art), Some(Node::Inlined(42)));
        art.insert(&key, 7).unwrap();
        assert!(leaf(&art).is_some_and(Node::is_gate));
        art.insert(&key, 99).unwrap();
        assert_eq!(lookup(&art, &key), vec![7, 42, 99]);

        art.erase(&key, 7).unwrap();
        assert_eq!(lookup(&art, &key), vec![42, 99]);
        assert!(leaf(&art).is_some_and(Node::is_gate));
        art.erase(&key, 42).unwrap();
        assert_eq!(leaf(&art), Some(Node::Inlined(99)));
        art.erase(&key, 99).unwrap();
        assert!(art.is_empty());
    }

    #[test]
    fn test_erase_down_to_empty() {
        let mut art = Art::new();
        let key = ArtKey::encode(&42u64);
        for row_id in 0..10 {
            art.insert(&key, row_id).unwrap();
        }
        for row_id in 0..9 {
            art.erase(&key, row_id).unwrap();
        }
        // One row id left: stored inline, no gate nodes remain.
        assert_eq!(lookup(&art, &key), vec![9]);
        assert_eq!(art.memory_stats().node4_count, 0);

        art.erase(&key, 9).unwrap();
        assert!(art.is_empty());
        assert_eq!(art.memory_stats().node_count(), 0);
        art.erase(&key, 9).unwrap();
    }

    #[test]
    fn test_lookup_respects_max_count() {
        let mut art = Art::new();
        let key = ArtKey::encode("k");
        for row_id in 0..5 {
            art.insert(&key, row_id).unwrap();
        }
        let mut out = Vec::new();
        assert!(!art.lookup(&key, 3, &mut out));
        out.clear();
        assert!(art.lookup(&key, 5, &mut out));
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_range_scan() {
        let mut art = Art::new();
        for i in 0..100u32 {
            art.insert(&ArtKey::encode(&i), i as RowId).unwrap();
            art.insert(&ArtKey::encode(&i), 1000 + i as RowId).unwrap();
        }
        let lo = ArtKey::encode(&10u32);
        let hi = ArtKey::encode(&12u32);

        let mut out = Vec::new();
        assert!(art.range_scan(Bound::Included(&lo), Bound::Included(&hi), usize::MAX, &mut out));
        assert_eq!(out, vec![10, 1010, 11, 1011, 12, 1012]);

        out.clear();
        assert!(art.range_scan(Bound::Excluded(&lo), Bound::Excluded(&hi), usize::MAX, &mut out));
        assert_eq!(out, vec![11, 1011]);

        out.clear();
        assert!(art.range_scan(Bound::Unbounded, Bound::Unbounded, usize::MAX, &mut out));
        assert_eq!(out.len(), 200);
    }

    #[test]
    fn test_construct_from_sorted() {
        let mut pairs: Vec<(ArtKey, RowId)> = Vec::new();
        for i in 0..500u32 {
            pairs.push((ArtKey::encode(&(i / 3)), i as RowId));
        }
        pairs.sort();
        let keys: Vec<ArtKey> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let row_ids: Vec<RowId> = pairs.iter().map(|&(_, r)| r).collect();

        let mut art = Art::new();
        art.construct_from_sorted(&keys, &row_ids).unwrap();
        assert_eq!(lookup(&art, &ArtKey::encode(&0u32)), vec![0, 1, 2]);
        assert_eq!(lookup(&art, &ArtKey::encode(&166u32)), vec![498, 499]);
        assert!(art.verify_integrity().is_empty());

        assert!(matches!(
            art.construct_from_sorted(&keys, &row_ids),
            Err(ArtError::NotEmpty)
        ));
    }

    #[test]
    fn test_construct_rejects_unsorted() {
        let mut art = Art::new();
        let keys = vec![ArtKey::encode(&2u8), ArtKey::encode(&1u8)];
        assert!(matches!(
            art.construct_from_sorted(&keys, &[0, 1]),
            Err(ArtError::InvalidInput(_))
        ));
        let keys = vec![ArtKey::encode(&1u8), ArtKey::encode(&1u8)];
        assert!(matches!(
            art.construct_from_sorted(&keys, &[3, 3]),
            Err(ArtError::InvalidInput(_))
        ));
        assert!(art.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut left = Art::new();
        let mut right = Art::new();
        for i in 0..50u32 {
            left.insert(&ArtKey::encode(&(i % 10)), i as RowId * 2).unwrap();
            right.insert(&ArtKey::encode(&(i % 20)), i as RowId * 2 + 1).unwrap();
        }
        left.merge(&right).unwrap();

        let mut expected: Vec<RowId> = (0..50)
            .filter(|i| i % 10 == 3)
            .map(|i| i * 2)
            .chain((0..50).filter(|i| i % 20 == 3).map(|i| i * 2 + 1))
            .collect();
        expected.sort_unstable();
        assert_eq!(lookup(&left, &ArtKey::encode(&3u32)), expected);
        assert_eq!(lookup(&left, &ArtKey::encode(&15u32)), vec![31, 71]);
        assert!(left.verify_integrity().is_empty());
    }

    #[test]
    fn test_failed_merge_frees_copied_leaf() {
        let mut left = Art::new();
        left.insert(&ArtKey::from_bytes(b"abc"), 1).unwrap();
        let mut right = Art::new();
        right.insert(&ArtKey::from_bytes(b"ab"), 1).unwrap();
        right.insert(&ArtKey::from_bytes(b"ab"), 2).unwrap();

        let before = left.memory_stats();
        assert!(matches!(
            left.merge(&right),
            Err(ArtError::PrefixConflict { .. })
        ));
        assert_eq!(left.memory_stats().node_count(), before.node_count());
        assert_eq!(lookup(&left, &ArtKey::from_bytes(b"abc")), vec![1]);

        let mut root = left.root;
        left.free_tree(&mut root);
        left.root = root;
        assert_eq!(left.memory_stats().node_count(), 0);
    }

    #[test]
    fn test_key_length_limit() {
        let mut art = Art::new();
        let longest = ArtKey::from_bytes(&[1u8; MAX_KEY_LEN]);
        assert!(art.insert(&longest, 1).unwrap());
        let too_long = ArtKey::from_bytes(&[2u8; MAX_KEY_LEN + 1]);
        assert!(matches!(
            art.insert(&too_long, 1),
            Err(ArtError::KeyTooLong { len }) if len == MAX_KEY_LEN + 1
        ));

        let mut built = Art::new();
        assert!(matches!(
            built.construct_from_sorted(&[too_long], &[1]),
            Err(ArtError::KeyTooLong { .. })
        ));
        assert!(built.is_empty());
    }

    #[test]
    fn test_vacuum_keeps_contents() {
        let mut art = Art::with_config(Config {
            slots_per_segment: 4,
            vacuum_threshold: 0.9,
            ..Config::default()
        });
        for i in 0..300u32 {
            art.insert(&ArtKey::encode(&(i % 40)), i as RowId).unwrap();
        }
        for i in (0..300u32).filter(|i| i % 4 != 0) {
            art.erase(&ArtKey::encode(&(i % 40)), i as RowId).unwrap();
        }
        let before = art.memory_stats();
        let stats = art.vacuum().unwrap();
        assert!(stats.relocated > 0);
        assert!(stats.released_segments > 0);
        assert!(art.memory_stats().segments <= before.segments);
        assert!(art.memory_stats().node_bytes <= before.node_bytes);
        assert_eq!(art.memory_stats().node_count(), before.node_count());

        for key in 0..40u32 {
            let expected: Vec<RowId> = (0..300)
                .filter(|i| i % 40 == key as RowId && i % 4 == 0)
                .collect();
            assert_eq!(lookup(&art, &ArtKey::encode(&key)), expected);
        }
        assert!(art.verify_integrity().is_empty());
    }

    #[test]
    fn test_allocator_exhaustion_surfaces() {
        let mut art = Art::with_config(Config {
            slots_per_segment: 2,
            max_segments: Some(1),
            ..Config::default()
        });
        let mut result = Ok(true);
        // Keys diverge on their second byte, so each one needs its own prefix.
        for i in 0..100u32 {
            result = art.insert(&ArtKey::encode(&(i * 65_537)), i as RowId);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ArtError::AllocatorExhausted { .. })));
    }
}
