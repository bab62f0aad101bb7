//! Recursive tree algorithms shared by the outer key tree and gate trees.
//!
//! Every routine takes a [`GateStatus`]. Outside a gate, leaves are inlined
//! row ids, legacy chains or gate roots. Inside a gate, keys are encoded row
//! ids and every leaf is an inlined row id.

use smallvec::SmallVec;
use tracing::trace;

use super::key::{ArtKey, KeySection};
use super::node::{NType, Node};
use super::Art;
use crate::error::{ArtError, Result};

/// Whether a routine runs in the outer tree or inside a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Outside,
    Inside,
}

impl Art {
    /// Whether `node` terminates a key path under `gate`.
    #[inline]
    pub(crate) fn is_leaf(node: Node, gate: GateStatus) -> bool {
        match node {
            Node::Empty => false,
            Node::Inlined(_) => true,
            Node::Allocated(ptr) => {
                gate == GateStatus::Outside && (ptr.kind() == NType::Leaf || ptr.is_gate())
            }
        }
    }

    /// Insert `leaf` at `key[depth..]` below `node`.
    ///
    /// Reaching an existing leaf at the end of the key merges both leaves in
    /// the outer tree. Inside a gate that position already holds the row id.
    pub(crate) fn insert_leaf(
        &mut self,
        node: &mut Node,
        key: &[u8],
        depth: usize,
        leaf: Node,
        gate: GateStatus,
    ) -> Result<()> {
        if node.is_empty() {
            *node = self.new_prefix_chain(&key[depth..], leaf)?;
            return Ok(());
        }

        if depth == key.len() {
            if !Self::is_leaf(*node, gate) {
                return Err(super::prefix_conflict(key));
            }
            debug_assert_eq!(
                gate,
                GateStatus::Outside,
                "row id {:?} inserted twice into a gate",
                key
            );
            if gate == GateStatus::Inside {
                return Ok(());
            }
            let mut leaf = leaf;
            return self.merge_leaves(node, &mut leaf);
        }

        let Some(ptr) = node.ptr().filter(|_| !Self::is_leaf(*node, gate)) else {
            return Err(super::prefix_conflict(key));
        };

        if ptr.kind() == NType::Prefix {
            let prefix = *self.prefix(ptr);
            return match prefix.mismatch(&key[depth..]) {
                None => {
                    let mut child = prefix.child();
                    self.insert_leaf(&mut child, key, depth + prefix.len(), leaf, gate)?;
                    self.prefix_mut(ptr).set_child(child);
                    Ok(())
                }
                Some(pos) => self.split_prefix(node, key, depth, pos, leaf),
            };
        }

        let byte = key[depth];
        match self.child(ptr, byte) {
            Some(mut child) => {
                self.insert_leaf(&mut child, key, depth + 1, leaf, gate)?;
                self.set_child(ptr, byte, child);
                Ok(())
            }
            None => {
                let branch = self.new_prefix_chain(&key[depth + 1..], leaf)?;
                self.add_child(node, byte, branch)
            }
        }
    }

    /// Remove `row_id` from the leaf at `key[depth..]` below `node`.
    ///
    /// Emptied nodes are freed on the way back up, and prefix chains left
    /// fragmented by a collapse are compacted.
    pub(crate) fn erase_at(
        &mut self,
        node: &mut Node,
        key: &[u8],
        depth: usize,
        row_id: &ArtKey,
        gate: GateStatus,
    ) -> Result<()> {
        if node.is_empty() {
            return Ok(());
        }

        if Self::is_leaf(*node, gate) {
            if depth != key.len() {
                return Ok(());
            }
            match gate {
                GateStatus::Inside => {
                    if node.row_id() == Some(row_id.row_id()) {
                        *node = Node::Empty;
                    }
                }
                GateStatus::Outside => {
                    if self.remove_row_id(node, row_id)? {
                        self.free_tree(node);
                    }
                }
            }
            return Ok(());
        }

        let Some(ptr) = node.ptr() else {
            return Ok(());
        };
        if depth >= key.len() {
            return Ok(());
        }

        if ptr.kind() == NType::Prefix {
            let prefix = *self.prefix(ptr);
            if prefix.mismatch(&key[depth..]).is_some() {
                return Ok(());
            }
            let mut child = prefix.child();
            self.erase_at(&mut child, key, depth + prefix.len(), row_id, gate)?;
            if child.is_empty() {
                self.prefixes.free(ptr.slot());
                *node = Node::Empty;
                return Ok(());
            }
            self.prefix_mut(ptr).set_child(child);
            return self.concat_prefix(node);
        }

        let byte = key[depth];
        let Some(mut child) = self.child(ptr, byte) else {
            return Ok(());
        };
        self.erase_at(&mut child, key, depth + 1, row_id, gate)?;
        if child.is_empty() {
            self.delete_child(node, byte)
        } else {
            self.set_child(ptr, byte, child);
            Ok(())
        }
    }

    /// Find the leaf stored at `key[depth..]` below `node`.
    pub(crate) fn lookup_leaf(
        &self,
        mut node: Node,
        key: &[u8],
        mut depth: usize,
        gate: GateStatus,
    ) -> Option<Node> {
        loop {
            if node.is_empty() {
                return None;
            }
            if Self::is_leaf(node, gate) {
                return (depth == key.len()).then_some(node);
            }
            if depth >= key.len() {
                return None;
            }
            let ptr = node.ptr()?;
            if ptr.kind() == NType::Prefix {
                let prefix = self.prefix(ptr);
                if prefix.mismatch(&key[depth..]).is_some() {
                    return None;
                }
                depth += prefix.len();
                node = prefix.child();
            } else {
                node = self.child(ptr, key[depth])?;
                depth += 1;
            }
        }
    }

    /// Build the subtree for `keys[section.start..=section.end]` into `node`.
    ///
    /// `keys` must be sorted, `row_ids` aligned with them, and every run of
    /// equal keys must carry strictly increasing row ids. Inside a gate the
    /// keys are the encoded row ids themselves.
    pub(crate) fn construct(
        &mut self,
        keys: &[ArtKey],
        row_ids: &[ArtKey],
        node: &mut Node,
        section: KeySection,
        gate: GateStatus,
    ) -> Result<()> {
        debug_assert!(node.is_empty());
        let start_key = &keys[section.start];
        let end_key = &keys[section.end];

        let mut depth = section.depth;
        while depth < start_key.len()
            && depth < end_key.len()
            && start_key[depth] == end_key[depth]
        {
            depth += 1;
        }

        if depth == start_key.len() {
            if depth != end_key.len() {
                return Err(super::prefix_conflict(end_key));
            }
            let count = section.count();
            let leaf = match gate {
                GateStatus::Inside if count > 1 => {
                    return Err(ArtError::InvalidInput("duplicate row id for one key"));
                }
                _ if count == 1 => Node::inlined(row_ids[section.start].row_id()),
                _ => {
                    let mut gate_root = Node::Empty;
                    self.new_gate(&mut gate_root, row_ids, section.start, count)?;
                    gate_root
                }
            };
            *node = self.new_prefix_chain(&start_key[section.depth..depth], leaf)?;
            return Ok(());
        }
        if depth == end_key.len() {
            return Err(super::prefix_conflict(end_key));
        }

        let mut inner = Node::Allocated(self.new_inner(NType::Node4)?);
        let mut child_start = section.start;
        while child_start <= section.end {
            let Some(&byte) = keys[child_start].get(depth) else {
                return Err(super::prefix_conflict(&keys[child_start]));
            };
            let mut child_end = child_start;
            while child_end < section.end && keys[child_end + 1].get(depth) == Some(&byte) {
                child_end += 1;
            }
            let mut child = Node::Empty;
            self.construct(
                keys,
                row_ids,
                &mut child,
                KeySection::new(child_start, child_end, depth + 1),
                gate,
            )?;
            self.add_child(&mut inner, byte, child)?;
            child_start = child_end + 1;
        }
        *node = self.new_prefix_chain(&start_key[section.depth..depth], inner)?;
        Ok(())
    }

    /// Move every leaf of `right` into `left`, leaving `right` empty.
    ///
    /// Inner nodes of `right` are freed; its leaves are reinserted under
    /// their full key paths, merging with leaves already in `left`.
    pub(crate) fn merge_trees(
        &mut self,
        left: &mut Node,
        right: &mut Node,
        gate: GateStatus,
    ) -> Result<()> {
        let mut detached = Vec::new();
        let mut path: SmallVec<[u8; 32]> = SmallVec::new();
        self.detach_leaves(*right, gate, &mut path, &mut detached);
        *right = Node::Empty;
        trace!(leaves = detached.len(), "merging detached leaves");
        for (key, leaf) in detached {
            self.insert_leaf(left, &key, 0, leaf, gate)?;
        }
        Ok(())
    }

    fn detach_leaves(
        &mut self,
        node: Node,
        gate: GateStatus,
        path: &mut SmallVec<[u8; 32]>,
        out: &mut Vec<(ArtKey, Node)>,
    ) {
        if node.is_empty() {
            return;
        }
        if Self::is_leaf(node, gate) {
            out.push((ArtKey::from_bytes(path), node));
            return;
        }
        let Some(ptr) = node.ptr() else {
            return;
        };
        let len = path.len();
        if ptr.kind() == NType::Prefix {
            let prefix = *self.prefix(ptr);
            path.extend_from_slice(prefix.bytes());
            self.detach_leaves(prefix.child(), gate, path, out);
        } else {
            for (byte, child) in self.inner_entries(ptr) {
                path.push(byte);
                self.detach_leaves(child, gate, path, out);
                path.truncate(len);
            }
        }
        path.truncate(len);
        self.free_node(ptr);
    }

    /// Relocate every node below `node` that sits in a vacuum segment.
    /// Returns the number of relocated nodes.
    pub(crate) fn vacuum_node(&mut self, node: &mut Node) -> Result<usize> {
        let Some(mut ptr) = node.ptr() else {
            return Ok(0);
        };
        if ptr.kind() == NType::Leaf {
            return self.deprecated_vacuum(node);
        }

        let mut moved = 0;
        if self.needs_vacuum(ptr) {
            ptr = self.relocate(ptr)?;
            *node = Node::Allocated(ptr);
            moved += 1;
        }

        if ptr.kind() == NType::Prefix {
            let mut child = self.prefix(ptr).child();
            moved += self.vacuum_node(&mut child)?;
            self.prefix_mut(ptr).set_child(child);
            return Ok(moved);
        }

        let mut next = self.next_child(ptr, 0);
        while let Some((byte, mut child)) = next {
            moved += self.vacuum_node(&mut child)?;
            self.set_child(ptr, byte, child);
            next = self.next_child(ptr, byte as usize + 1);
        }
        Ok(moved)
    }
}
