//! Row-id leaves.
//!
//! The set of row ids stored under one key takes one of three shapes:
//! - a single row id inlined in the leaf handle,
//! - a gate: the root of a nested tree keyed by encoded row ids,
//! - a legacy chain of [`Leaf`] chunks, as written by older images.
//!
//! Legacy chains are read as they are and migrated to the nested shape on
//! the first mutation that reaches them.

use std::fmt::Write as _;

use tracing::debug;

use super::iterator::ArtIterator;
use super::key::{ArtKey, KeySection};
use super::node::{NType, Node, NodePtr};
use super::tree::GateStatus;
use super::{Art, RowId};
use crate::error::Result;

/// Row ids per legacy leaf chunk.
pub const LEAF_SIZE: usize = 4;

/// A chunk of a legacy linked leaf.
#[derive(Debug, Clone, Copy)]
pub struct Leaf {
    count: u8,
    row_ids: [RowId; LEAF_SIZE],
    next: Node,
}

impl Leaf {
    pub(crate) fn new(row_ids: &[RowId], next: Node) -> Self {
        debug_assert!(!row_ids.is_empty() && row_ids.len() <= LEAF_SIZE);
        let mut data = [0; LEAF_SIZE];
        data[..row_ids.len()].copy_from_slice(row_ids);
        Self {
            count: row_ids.len() as u8,
            row_ids: data,
            next,
        }
    }

    #[inline]
    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids[..self.count as usize]
    }

    /// Next chunk of the chain, or `Node::Empty` at the end.
    #[inline]
    pub fn next(&self) -> Node {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Node) {
        self.next = next;
    }
}

/// A leaf known not to be a legacy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedLeaf {
    Inlined(RowId),
    Gate(NodePtr),
}

impl GatedLeaf {
    /// Classify an outer-tree leaf. Returns `None` for legacy chains and for
    /// nodes that are not leaves.
    pub fn from_node(node: Node) -> Option<Self> {
        match node {
            Node::Inlined(row_id) => Some(GatedLeaf::Inlined(row_id)),
            Node::Allocated(ptr) if ptr.is_gate() => Some(GatedLeaf::Gate(ptr)),
            _ => None,
        }
    }
}

impl Art {
    /// Build a gate holding `row_ids[start..start + count]` into `node`.
    ///
    /// The row ids must be sorted and distinct, and `count` at least two.
    pub fn new_gate(
        &mut self,
        node: &mut Node,
        row_ids: &[ArtKey],
        start: usize,
        count: usize,
    ) -> Result<()> {
        debug_assert!(count > 1, "a gate holds at least two row ids");
        let section = KeySection::new(start, start + count - 1, 0);
        self.construct(row_ids, row_ids, node, section, GateStatus::Inside)?;
        node.set_gate(true);
        Ok(())
    }

    /// Merge the leaf `right` into the leaf `left`, leaving `right` empty.
    ///
    /// The row id sets of both leaves must be disjoint. Legacy chains on
    /// either side are migrated first.
    pub fn merge_leaves(&mut self, left: &mut Node, right: &mut Node) -> Result<()> {
        if left.is_deprecated_leaf() {
            self.transform_to_nested(left)?;
        }
        if right.is_deprecated_leaf() {
            self.transform_to_nested(right)?;
        }

        if let Node::Inlined(row_id) = *right {
            *right = Node::Empty;
            return self.merge_inlined(left, row_id);
        }
        if left.is_inlined() {
            std::mem::swap(left, right);
            let Node::Inlined(row_id) = *right else {
                unreachable!("swapped leaf is inlined");
            };
            *right = Node::Empty;
            return self.merge_inlined(left, row_id);
        }

        debug_assert!(left.is_gate() && right.is_gate());
        left.set_gate(false);
        right.set_gate(false);
        let result = self.merge_trees(left, right, GateStatus::Inside);
        left.set_gate(true);
        result
    }

    /// Add a single row id to a non-legacy leaf.
    fn merge_inlined(&mut self, node: &mut Node, row_id: RowId) -> Result<()> {
        let key = ArtKey::from_row_id(row_id);
        if node.is_inlined() {
            return self.insert_into_inlined(node, &key);
        }
        debug_assert!(node.is_gate());
        node.set_gate(false);
        let result = self.insert_leaf(node, &key, 0, Node::inlined(row_id), GateStatus::Inside);
        node.set_gate(true);
        result
    }

    /// Turn an inlined leaf into a gate holding its row id and `row_id`.
    pub fn insert_into_inlined(&mut self, node: &mut Node, row_id: &ArtKey) -> Result<()> {
        let Node::Inlined(stored) = *node else {
            panic!("insert_into_inlined on a non-inlined leaf");
        };
        debug_assert_ne!(stored, row_id.row_id(), "row id already in leaf");

        let stored_key = ArtKey::from_row_id(stored);
        let mut keys = [stored_key, row_id.clone()];
        keys.sort();
        *node = Node::Empty;
        self.new_gate(node, &keys, 0, 2)
    }

    /// Remove `row_id` from the leaf at `node`.
    ///
    /// Returns true if the leaf would become empty, in which case the caller
    /// frees it: an inlined leaf holding exactly `row_id` is left untouched.
    /// A gate reduced to one row id collapses back into an inlined leaf.
    pub fn remove_row_id(&mut self, node: &mut Node, row_id: &ArtKey) -> Result<bool> {
        debug_assert!(!node.is_empty());
        if node.is_deprecated_leaf() {
            self.transform_to_nested(node)?;
        }
        if let Node::Inlined(stored) = *node {
            return Ok(stored == row_id.row_id());
        }

        node.set_gate(false);
        self.erase_at(node, row_id, 0, row_id, GateStatus::Inside)?;
        if node.is_empty() {
            return Ok(true);
        }
        if let Some(remaining) = self.single_row_id(*node) {
            self.free_tree(node);
            *node = Node::inlined(remaining);
            return Ok(false);
        }
        node.set_gate(true);
        Ok(false)
    }

    /// The row id of a nested tree that holds exactly one, found by walking
    /// its prefix chain.
    fn single_row_id(&self, mut node: Node) -> Option<RowId> {
        loop {
            match node {
                Node::Inlined(row_id) => return Some(row_id),
                Node::Allocated(ptr) if ptr.kind() == NType::Prefix => {
                    node = self.prefix(ptr).child();
                }
                _ => return None,
            }
        }
    }

    /// Migrate a legacy chain into a gate, or into an inlined leaf if the
    /// chain holds a single row id.
    pub fn transform_to_nested(&mut self, node: &mut Node) -> Result<()> {
        debug_assert!(node.is_deprecated_leaf());
        let mut root = Node::Empty;
        let mut count = 0usize;
        let mut cursor = *node;
        while let Some(ptr) = cursor.ptr() {
            let chunk = *self.leaf(ptr);
            for &row_id in chunk.row_ids() {
                let key = ArtKey::from_row_id(row_id);
                self.insert_leaf(&mut root, &key, 0, Node::inlined(row_id), GateStatus::Inside)?;
                count += 1;
            }
            cursor = chunk.next();
        }
        self.deprecated_free(node);

        match self.single_row_id(root) {
            Some(row_id) => {
                self.free_tree(&mut root);
                *node = Node::inlined(row_id);
            }
            _ => {
                root.set_gate(true);
                *node = root;
            }
        }
        debug!(row_ids = count, "migrated legacy leaf to nested leaf");
        Ok(())
    }

    /// Rewrite a gate as a legacy chain holding the same row ids in
    /// ascending order. Inlined leaves and chains are left as they are.
    pub fn transform_to_deprecated(&mut self, node: &mut Node) -> Result<()> {
        if !node.is_gate() {
            return Ok(());
        }
        let mut row_ids = Vec::new();
        let mut it = ArtIterator::new(self);
        if it.find_minimum(*node) {
            it.scan(None, usize::MAX, &mut row_ids, false);
        }
        self.free_tree(node);
        *node = self.new_deprecated_leaf(&row_ids)?;
        debug!(row_ids = row_ids.len(), "rewrote nested leaf as legacy leaf");
        Ok(())
    }

    /// Whether a non-legacy leaf holds `row_id`.
    pub fn contains_row_id(&self, leaf: GatedLeaf, row_id: &ArtKey) -> bool {
        match leaf {
            GatedLeaf::Inlined(stored) => stored == row_id.row_id(),
            GatedLeaf::Gate(ptr) => self
                .lookup_leaf(Node::Allocated(ptr), row_id, 0, GateStatus::Inside)
                .is_some(),
        }
    }

    /// Whether any outer-tree leaf, legacy chains included, holds `row_id`.
    pub(crate) fn leaf_contains(&self, leaf: Node, row_id: RowId) -> bool {
        match GatedLeaf::from_node(leaf) {
            Some(gated) => self.contains_row_id(gated, &ArtKey::from_row_id(row_id)),
            None => self.deprecated_row_ids(leaf).any(|id| id == row_id),
        }
    }

    /// Append the row ids of an outer-tree leaf to `out`.
    ///
    /// Returns false, possibly after a partial append, once `out` would grow
    /// beyond `max_count`.
    pub(crate) fn leaf_row_ids(&self, leaf: Node, out: &mut Vec<RowId>, max_count: usize) -> bool {
        match leaf {
            Node::Inlined(row_id) => {
                if out.len() + 1 > max_count {
                    return false;
                }
                out.push(row_id);
                true
            }
            Node::Allocated(ptr) if ptr.kind() == NType::Leaf => {
                self.deprecated_get_row_ids(leaf, out, max_count)
            }
            Node::Allocated(_) => {
                let mut it = ArtIterator::new(self);
                if !it.find_minimum(leaf) {
                    return true;
                }
                it.scan(None, max_count, out, false)
            }
            Node::Empty => true,
        }
    }

    /// Allocate a legacy chain holding `row_ids` in order.
    pub fn new_deprecated_leaf(&mut self, row_ids: &[RowId]) -> Result<Node> {
        let mut next = Node::Empty;
        for chunk in row_ids.chunks(LEAF_SIZE).rev() {
            let slot = self.leaves.allocate(Leaf::new(chunk, next))?;
            next = Node::allocated(slot, NType::Leaf);
        }
        Ok(next)
    }

    #[inline]
    pub(crate) fn leaf(&self, ptr: NodePtr) -> &Leaf {
        debug_assert_eq!(ptr.kind(), NType::Leaf);
        self.leaves.get(ptr.slot())
    }

    fn deprecated_row_ids(&self, node: Node) -> impl Iterator<Item = RowId> + '_ {
        let mut cursor = node;
        std::iter::from_fn(move || {
            let ptr = cursor.ptr()?;
            let chunk = self.leaf(ptr);
            cursor = chunk.next();
            Some(chunk.row_ids().iter().copied())
        })
        .flatten()
    }

    /// Free every chunk of a legacy chain.
    pub fn deprecated_free(&mut self, node: &mut Node) {
        let mut cursor = *node;
        while let Some(ptr) = cursor.ptr() {
            debug_assert_eq!(ptr.kind(), NType::Leaf);
            cursor = self.leaves.free(ptr.slot()).next();
        }
        *node = Node::Empty;
    }

    /// Append the row ids of a legacy chain to `out`.
    ///
    /// Chunks are appended whole; returns false as soon as the next chunk
    /// would take `out` beyond `max_count`.
    pub fn deprecated_get_row_ids(&self, node: Node, out: &mut Vec<RowId>, max_count: usize) -> bool {
        let mut cursor = node;
        while let Some(ptr) = cursor.ptr() {
            let chunk = self.leaf(ptr);
            if out.len() + chunk.row_ids().len() > max_count {
                return false;
            }
            out.extend_from_slice(chunk.row_ids());
            cursor = chunk.next();
        }
        true
    }

    /// Relocate the chunks of a legacy chain that sit in vacuum segments.
    /// Returns the number of relocated chunks.
    pub fn deprecated_vacuum(&mut self, node: &mut Node) -> Result<usize> {
        let mut moved = 0;
        let Some(mut ptr) = node.ptr() else {
            return Ok(0);
        };
        if self.leaves.needs_vacuum(ptr.slot()) {
            ptr = self.relocate(ptr)?;
            *node = Node::Allocated(ptr);
            moved += 1;
        }
        loop {
            let next = self.leaf(ptr).next();
            let Some(next_ptr) = next.ptr() else {
                return Ok(moved);
            };
            let next_ptr = if self.leaves.needs_vacuum(next_ptr.slot()) {
                moved += 1;
                let relocated = self.relocate(next_ptr)?;
                self.leaves
                    .get_mut(ptr.slot())
                    .set_next(Node::Allocated(relocated));
                relocated
            } else {
                next_ptr
            };
            ptr = next_ptr;
        }
    }

    /// Render a legacy chain as `Leaf [count: N, row ids: a-b-] `, checking
    /// its chunks along the way. Returns an empty string if `only_verify`.
    ///
    /// # Panics
    /// Panics on an empty or overfull chunk.
    pub fn deprecated_verify_and_to_string(&self, node: Node, only_verify: bool) -> String {
        let mut out = String::new();
        let mut cursor = node;
        while let Some(ptr) = cursor.ptr() {
            let chunk = self.leaf(ptr);
            let count = chunk.row_ids().len();
            assert!(
                (1..=LEAF_SIZE).contains(&count),
                "legacy leaf chunk holds {count} row ids"
            );
            if !only_verify {
                let _ = write!(out, "Leaf [count: {count}, row ids: ");
                for row_id in chunk.row_ids() {
                    let _ = write!(out, "{row_id}-");
                }
                out.push_str("] ");
            }
            cursor = chunk.next();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_row_ids(art: &Art, node: Node) -> Vec<RowId> {
        let mut out = Vec::new();
        assert!(art.leaf_row_ids(node, &mut out, usize::MAX));
        out
    }

    fn gate_of(art: &mut Art, ids: &[RowId]) -> Node {
        let keys: Vec<ArtKey> = ids.iter().map(|&id| ArtKey::from_row_id(id)).collect();
        let mut node = Node::Empty;
        art.new_gate(&mut node, &keys, 0, keys.len()).unwrap();
        node
    }

    #[test]
    fn test_inlined_grows_into_gate() {
        let mut art = Art::new();
        let mut node = Node::inlined(9);
        art.insert_into_inlined(&mut node, &ArtKey::from_row_id(3)).unwrap();
        assert!(node.is_gate());
        assert_eq!(gate_row_ids(&art, node), vec![3, 9]);
        assert!(art.contains_row_id(GatedLeaf::from_node(node).unwrap(), &ArtKey::from_row_id(9)));
        assert!(!art.contains_row_id(GatedLeaf::from_node(node).unwrap(), &ArtKey::from_row_id(4)));
    }

    #[test]
    fn test_remove_collapses_gate_to_inlined() {
        let mut art = Art::new();
        let mut node = gate_of(&mut art, &[1, 2, 3]);
        assert!(!art.remove_row_id(&mut node, &ArtKey::from_row_id(2)).unwrap());
        assert!(node.is_gate());
        assert!(!art.remove_row_id(&mut node, &ArtKey::from_row_id(1)).unwrap());
        assert_eq!(node, Node::Inlined(3));
        assert_eq!(art.memory_stats().node_count(), 0);

        assert!(art.remove_row_id(&mut node, &ArtKey::from_row_id(3)).unwrap());
        assert!(!art.remove_row_id(&mut node, &ArtKey::from_row_id(4)).unwrap());
    }

    #[test]
    fn test_merge_leaves_every_shape() {
        let mut art = Art::new();

        let mut left = Node::inlined(1);
        let mut right = Node::inlined(2);
        art.merge_leaves(&mut left, &mut right).unwrap();
        assert!(right.is_empty());
        assert_eq!(gate_row_ids(&art, left), vec![1, 2]);

        let mut inlined = Node::inlined(0);
        art.merge_leaves(&mut inlined, &mut left).unwrap();
        assert_eq!(gate_row_ids(&art, inlined), vec![0, 1, 2]);

        let mut other = gate_of(&mut art, &[10, 11, 1 << 33]);
        art.merge_leaves(&mut inlined, &mut other).unwrap();
        assert!(other.is_empty());
        assert!(inlined.is_gate());
        assert_eq!(gate_row_ids(&art, inlined), vec![0, 1, 2, 10, 11, 1 << 33]);

        let mut legacy = art.new_deprecated_leaf(&[7, 5, 6]).unwrap();
        art.merge_leaves(&mut inlined, &mut legacy).unwrap();
        assert_eq!(
            gate_row_ids(&art, inlined),
            vec![0, 1, 2, 5, 6, 7, 10, 11, 1 << 33]
        );
        assert_eq!(art.memory_stats().leaf_count, 0);
    }

    #[test]
    fn test_transform_round_trip() {
        let mut art = Art::new();
        let ids: Vec<RowId> = (0..10).map(|i| i * 3).collect();
        let mut node = gate_of(&mut art, &ids);

        art.transform_to_deprecated(&mut node).unwrap();
        assert!(node.is_deprecated_leaf());
        assert_eq!(art.memory_stats().leaf_count, 3);
        assert_eq!(art.memory_stats().node_count(), 3);

        let rendered = art.deprecated_verify_and_to_string(node, false);
        assert!(rendered.starts_with("Leaf [count: 4, row ids: 0-3-6-9-] "));
        assert!(rendered.ends_with("Leaf [count: 2, row ids: 24-27-] "));
        assert!(art.deprecated_verify_and_to_string(node, true).is_empty());

        art.transform_to_nested(&mut node).unwrap();
        assert!(node.is_gate());
        assert_eq!(gate_row_ids(&art, node), ids);
        assert_eq!(art.memory_stats().leaf_count, 0);
    }

    #[test]
    fn test_single_row_chain_becomes_inlined() {
        let mut art = Art::new();
        let mut node = art.new_deprecated_leaf(&[42]).unwrap();
        art.transform_to_nested(&mut node).unwrap();
        assert_eq!(node, Node::Inlined(42));
        assert_eq!(art.memory_stats().node_count(), 0);
    }

    #[test]
    fn test_deprecated_get_row_ids_respects_limit() {
        let mut art = Art::new();
        let node = art.new_deprecated_leaf(&[1, 2, 3, 4, 5, 6]).unwrap();

        let mut out = Vec::new();
        assert!(!art.deprecated_get_row_ids(node, &mut out, 5));
        assert_eq!(out, vec![1, 2, 3, 4]);

        out.clear();
        assert!(art.deprecated_get_row_ids(node, &mut out, 6));
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_remove_from_legacy_chain() {
        let mut art = Art::new();
        let mut node = art.new_deprecated_leaf(&[8, 9]).unwrap();
        assert!(!art.remove_row_id(&mut node, &ArtKey::from_row_id(8)).unwrap());
        assert_eq!(node, Node::Inlined(9));
    }

    #[test]
    fn test_deprecated_vacuum_moves_chunks() {
        let mut art = Art::with_config(crate::Config {
            slots_per_segment: 2,
            ..Default::default()
        });
        let mut node = art.new_deprecated_leaf(&(0..20).collect::<Vec<_>>()).unwrap();
        let mut spare = art.new_deprecated_leaf(&[100, 101, 102, 103, 104]).unwrap();
        // Free the second chain so its segments turn sparse.
        art.deprecated_free(&mut spare);
        let _ = art.leaves.init_vacuum(1.0);

        let moved = art.deprecated_vacuum(&mut node).unwrap();
        assert!(moved > 0);
        art.leaves.finalize_vacuum();

        let mut out = Vec::new();
        assert!(art.deprecated_get_row_ids(node, &mut out, usize::MAX));
        assert_eq!(out, (0..20).collect::<Vec<_>>());
    }
}
