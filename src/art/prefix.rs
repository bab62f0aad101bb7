//! Path compression.
//!
//! Runs of single-child levels are stored in chains of prefix nodes, each
//! holding up to [`PREFIX_SIZE`] key bytes followed by one child.

use smallvec::SmallVec;

use super::node::{NType, Node, NodePtr};
use super::Art;
use crate::error::Result;

/// Key bytes per prefix node.
pub const PREFIX_SIZE: usize = 15;

#[derive(Debug, Clone, Copy)]
pub struct Prefix {
    data: [u8; PREFIX_SIZE],
    count: u8,
    child: Node,
}

impl Prefix {
    pub(crate) fn new(bytes: &[u8], child: Node) -> Self {
        debug_assert!(!bytes.is_empty() && bytes.len() <= PREFIX_SIZE);
        let mut data = [0u8; PREFIX_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            count: bytes.len() as u8,
            child,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.count as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn child(&self) -> Node {
        self.child
    }

    #[inline]
    pub(crate) fn set_child(&mut self, child: Node) {
        self.child = child;
    }

    /// Position of the first prefix byte that `key` does not match, or `None`
    /// if `key` starts with all prefix bytes.
    pub fn mismatch(&self, key: &[u8]) -> Option<usize> {
        let bytes = self.bytes();
        match bytes.iter().zip(key).position(|(a, b)| a != b) {
            Some(pos) => Some(pos),
            None if key.len() < bytes.len() => Some(key.len()),
            None => None,
        }
    }
}

impl Art {
    /// Build a chain of prefix nodes spelling `bytes` in front of `child`.
    /// Empty `bytes` return `child` itself.
    pub(crate) fn new_prefix_chain(&mut self, bytes: &[u8], child: Node) -> Result<Node> {
        let mut node = child;
        for chunk in bytes.chunks(PREFIX_SIZE).rev() {
            let slot = self.prefixes.allocate(Prefix::new(chunk, node))?;
            node = Node::allocated(slot, NType::Prefix);
        }
        Ok(node)
    }

    /// Split the prefix at `node` where it stops matching `key`.
    ///
    /// `pos` is the mismatching offset inside the prefix, `depth` the key
    /// offset at which the prefix starts. The prefix is replaced by the common
    /// part, a Node4 and two branches: the old remainder and `leaf`.
    pub(crate) fn split_prefix(
        &mut self,
        node: &mut Node,
        key: &[u8],
        depth: usize,
        pos: usize,
        leaf: Node,
    ) -> Result<()> {
        let Some(ptr) = node.ptr() else {
            panic!("split_prefix on a non-pooled node");
        };
        if depth + pos >= key.len() {
            return Err(super::prefix_conflict(key));
        }
        let prefix = *self.prefix(ptr);
        let bytes = prefix.bytes();
        debug_assert!(pos < bytes.len());

        let old_branch = self.new_prefix_chain(&bytes[pos + 1..], prefix.child())?;
        let new_branch = self.new_prefix_chain(&key[depth + pos + 1..], leaf)?;
        let mut inner = Node::Allocated(self.new_inner(NType::Node4)?);
        self.add_child(&mut inner, bytes[pos], old_branch)?;
        self.add_child(&mut inner, key[depth + pos], new_branch)?;

        self.prefixes.free(ptr.slot());
        *node = self.new_prefix_chain(&bytes[..pos], inner)?;
        node.set_gate(ptr.is_gate());
        Ok(())
    }

    /// Rewrite a fragmented prefix chain into the fewest nodes.
    ///
    /// The walk stops at the first non-prefix node and at any gate below
    /// `node`, since bytes above a gate belong to the outer key.
    pub(crate) fn concat_prefix(&mut self, node: &mut Node) -> Result<()> {
        let Some(head) = node.ptr().filter(|p| p.kind() == NType::Prefix) else {
            return Ok(());
        };
        let mut links: SmallVec<[NodePtr; 4]> = SmallVec::new();
        let mut bytes: SmallVec<[u8; 32]> = SmallVec::new();
        let mut cursor = *node;
        while let Some(ptr) = cursor.ptr() {
            if ptr.kind() != NType::Prefix || (!links.is_empty() && ptr.is_gate()) {
                break;
            }
            let prefix = self.prefix(ptr);
            bytes.extend_from_slice(prefix.bytes());
            cursor = prefix.child();
            links.push(ptr);
        }
        if links.len() <= bytes.len().div_ceil(PREFIX_SIZE) {
            return Ok(());
        }
        for ptr in links {
            self.prefixes.free(ptr.slot());
        }
        *node = self.new_prefix_chain(&bytes, cursor)?;
        node.set_gate(head.is_gate());
        Ok(())
    }
}
