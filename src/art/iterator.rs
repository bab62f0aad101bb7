//! Ordered traversal.
//!
//! An [`ArtIterator`] walks the leaves below a root in key order, keeping the
//! key bytes of the current position. The root passed to a seek may be a gate:
//! its flag is ignored so that the walk enters the nested tree. Gates further
//! down are reported as leaves.

use std::cmp::Ordering;

use smallvec::SmallVec;

use super::node::{NType, Node};
use super::{Art, RowId};

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: Node,
    /// Key length before this node's bytes were appended.
    key_len: usize,
    /// Child byte taken at an inner node; `None` for prefixes.
    byte: Option<u8>,
}

pub struct ArtIterator<'a> {
    art: &'a Art,
    stack: Vec<Frame>,
    key: SmallVec<[u8; 32]>,
    leaf: Option<Node>,
}

impl<'a> ArtIterator<'a> {
    pub fn new(art: &'a Art) -> Self {
        Self {
            art,
            stack: Vec::new(),
            key: SmallVec::new(),
            leaf: None,
        }
    }

    /// Key bytes of the current leaf.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The current leaf, if positioned.
    pub fn leaf(&self) -> Option<Node> {
        self.leaf
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.key.clear();
        self.leaf = None;
    }

    #[inline]
    fn is_leaf(node: Node, is_root: bool) -> bool {
        match node {
            Node::Empty => false,
            Node::Inlined(_) => true,
            Node::Allocated(ptr) => ptr.kind() == NType::Leaf || (ptr.is_gate() && !is_root),
        }
    }

    /// Position on the smallest leaf below `root`. Returns false if there is
    /// none.
    pub fn find_minimum(&mut self, root: Node) -> bool {
        self.reset();
        self.descend_min(root, true)
    }

    fn descend_min(&mut self, mut node: Node, mut is_root: bool) -> bool {
        let art = self.art;
        loop {
            if Self::is_leaf(node, is_root) {
                self.leaf = Some(node);
                return true;
            }
            let Some(ptr) = node.ptr() else {
                self.leaf = None;
                return false;
            };
            let key_len = self.key.len();
            if ptr.kind() == NType::Prefix {
                let prefix = art.prefix(ptr);
                self.stack.push(Frame {
                    node,
                    key_len,
                    byte: None,
                });
                self.key.extend_from_slice(prefix.bytes());
                node = prefix.child();
            } else {
                let Some((byte, child)) = art.next_child(ptr, 0) else {
                    self.leaf = None;
                    return false;
                };
                self.stack.push(Frame {
                    node,
                    key_len,
                    byte: Some(byte),
                });
                self.key.push(byte);
                node = child;
            }
            is_root = false;
        }
    }

    /// Advance to the next leaf in key order.
    pub fn next_leaf(&mut self) -> bool {
        let art = self.art;
        while let Some(frame) = self.stack.pop() {
            self.key.truncate(frame.key_len);
            let (Some(byte), Some(ptr)) = (frame.byte, frame.node.ptr()) else {
                continue;
            };
            if let Some((next, child)) = art.next_child(ptr, byte as usize + 1) {
                self.stack.push(Frame {
                    byte: Some(next),
                    ..frame
                });
                self.key.push(next);
                return self.descend_min(child, false);
            }
        }
        self.leaf = None;
        false
    }

    /// Position on the first leaf whose key is greater than `key`, or equal
    /// to it if `inclusive`.
    pub fn lower_bound(&mut self, root: Node, key: &[u8], inclusive: bool) -> bool {
        self.reset();
        let art = self.art;
        let mut node = root;
        let mut depth = 0;
        let mut is_root = true;
        loop {
            if Self::is_leaf(node, is_root) {
                self.leaf = Some(node);
                if depth == key.len() && inclusive {
                    return true;
                }
                // Either an exact match to skip, or a path that is a prefix
                // of `key` and so sorts before it.
                return self.next_leaf();
            }
            let Some(ptr) = node.ptr() else {
                return self.next_leaf();
            };
            if depth >= key.len() {
                return self.descend_min(node, is_root);
            }
            let key_len = self.key.len();
            if ptr.kind() == NType::Prefix {
                let prefix = art.prefix(ptr);
                self.stack.push(Frame {
                    node,
                    key_len,
                    byte: None,
                });
                self.key.extend_from_slice(prefix.bytes());
                let rest = &key[depth..];
                for (i, &b) in prefix.bytes().iter().enumerate() {
                    match rest.get(i).map(|k| b.cmp(k)) {
                        None | Some(Ordering::Greater) => {
                            return self.descend_min(prefix.child(), false);
                        }
                        Some(Ordering::Less) => return self.next_leaf(),
                        Some(Ordering::Equal) => {}
                    }
                }
                depth += prefix.len();
                node = prefix.child();
            } else {
                let byte = key[depth];
                if let Some(child) = art.child(ptr, byte) {
                    self.stack.push(Frame {
                        node,
                        key_len,
                        byte: Some(byte),
                    });
                    self.key.push(byte);
                    node = child;
                    depth += 1;
                } else if let Some((next, child)) = art.next_child(ptr, byte as usize + 1) {
                    self.stack.push(Frame {
                        node,
                        key_len,
                        byte: Some(next),
                    });
                    self.key.push(next);
                    return self.descend_min(child, false);
                } else {
                    return self.next_leaf();
                }
            }
            is_root = false;
        }
    }

    /// Collect row ids from the current leaf onwards until the key passes
    /// `upper` (or reaches it, unless `inclusive`).
    ///
    /// Returns false if `out` would grow beyond `max_count`; `out` may then
    /// hold a partial result.
    pub fn scan(
        &mut self,
        upper: Option<&[u8]>,
        max_count: usize,
        out: &mut Vec<RowId>,
        inclusive: bool,
    ) -> bool {
        while let Some(leaf) = self.leaf {
            if let Some(upper) = upper {
                match self.key.as_slice().cmp(upper) {
                    Ordering::Greater => return true,
                    Ordering::Equal if !inclusive => return true,
                    _ => {}
                }
            }
            if !self.art.leaf_row_ids(leaf, out, max_count) {
                return false;
            }
            self.next_leaf();
        }
        true
    }
}
