//! Node handles and inner node layouts.
//!
//! A [`Node`] is a small copyable handle. It either is empty, holds a row id
//! directly, or points into one of the typed pools owned by [`Art`]. Pointer
//! handles carry a gate flag marking the root of a nested row-id tree.

use super::prefix::Prefix;
use super::{Art, RowId, MAX_ROW_ID_LOCAL};
use crate::arena::SlotId;
use crate::error::Result;

/// Kind of pooled node a pointer handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NType {
    Prefix,
    /// Chunk of a legacy linked leaf.
    Leaf,
    Node4,
    Node16,
    Node48,
    Node256,
}

impl NType {
    pub fn name(self) -> &'static str {
        match self {
            NType::Prefix => "prefix",
            NType::Leaf => "leaf",
            NType::Node4 => "node4",
            NType::Node16 => "node16",
            NType::Node48 => "node48",
            NType::Node256 => "node256",
        }
    }

    /// Maximum number of children of an inner node kind.
    pub fn capacity(self) -> usize {
        match self {
            NType::Node4 => NODE4_CAPACITY,
            NType::Node16 => NODE16_CAPACITY,
            NType::Node48 => NODE48_CAPACITY,
            NType::Node256 => NODE256_CAPACITY,
            NType::Prefix | NType::Leaf => 0,
        }
    }
}

/// Pointer to a pooled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodePtr {
    slot: SlotId,
    kind: NType,
    gate: bool,
}

impl NodePtr {
    pub(crate) fn new(slot: SlotId, kind: NType) -> Self {
        Self {
            slot,
            kind,
            gate: false,
        }
    }

    #[inline]
    pub fn slot(self) -> SlotId {
        self.slot
    }

    #[inline]
    pub fn kind(self) -> NType {
        self.kind
    }

    #[inline]
    pub fn is_gate(self) -> bool {
        self.gate
    }

    /// Same node kind and gate flag at a new slot.
    pub(crate) fn with_slot(self, slot: SlotId) -> Self {
        Self { slot, ..self }
    }
}

/// Handle to a node of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Node {
    #[default]
    Empty,
    /// A leaf holding exactly one row id, stored in the handle.
    Inlined(RowId),
    Allocated(NodePtr),
}

impl Node {
    /// Handle for a single-row-id leaf.
    #[inline]
    pub fn inlined(row_id: RowId) -> Self {
        debug_assert!(
            (0..MAX_ROW_ID_LOCAL).contains(&row_id),
            "row id {} cannot be inlined",
            row_id
        );
        Node::Inlined(row_id)
    }

    #[inline]
    pub(crate) fn allocated(slot: SlotId, kind: NType) -> Self {
        Node::Allocated(NodePtr::new(slot, kind))
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        matches!(self, Node::Empty)
    }

    #[inline]
    pub fn is_inlined(self) -> bool {
        matches!(self, Node::Inlined(_))
    }

    #[inline]
    pub fn row_id(self) -> Option<RowId> {
        match self {
            Node::Inlined(row_id) => Some(row_id),
            _ => None,
        }
    }

    #[inline]
    pub fn ptr(self) -> Option<NodePtr> {
        match self {
            Node::Allocated(ptr) => Some(ptr),
            _ => None,
        }
    }

    #[inline]
    pub fn kind(self) -> Option<NType> {
        self.ptr().map(NodePtr::kind)
    }

    #[inline]
    pub fn is_gate(self) -> bool {
        self.ptr().is_some_and(NodePtr::is_gate)
    }

    pub fn set_gate(&mut self, gate: bool) {
        debug_assert!(
            !gate || matches!(self, Node::Allocated(_)),
            "only pooled nodes can be gates"
        );
        if let Node::Allocated(ptr) = self {
            ptr.gate = gate;
        }
    }

    #[inline]
    pub fn is_deprecated_leaf(self) -> bool {
        self.kind() == Some(NType::Leaf)
    }
}

pub const NODE4_CAPACITY: usize = 4;
pub const NODE16_CAPACITY: usize = 16;
pub const NODE48_CAPACITY: usize = 48;
pub const NODE256_CAPACITY: usize = 256;

/// A Node16 shrinks to a Node4 below this many children.
pub const NODE16_SHRINK: usize = 4;
/// A Node48 shrinks to a Node16 below this many children.
pub const NODE48_SHRINK: usize = 12;
/// A Node256 shrinks to a Node48 at this many children or fewer.
pub const NODE256_SHRINK: usize = 36;

/// Inner node keeping up to `N` children in byte order.
#[derive(Debug, Clone)]
pub struct SortedNode<const N: usize> {
    count: u8,
    keys: [u8; N],
    children: [Node; N],
}

pub type Node4 = SortedNode<NODE4_CAPACITY>;
pub type Node16 = SortedNode<NODE16_CAPACITY>;

impl<const N: usize> Default for SortedNode<N> {
    fn default() -> Self {
        Self {
            count: 0,
            keys: [0; N],
            children: [Node::Empty; N],
        }
    }
}

impl<const N: usize> SortedNode<N> {
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub fn get(&self, byte: u8) -> Option<Node> {
        self.keys[..self.len()]
            .binary_search(&byte)
            .ok()
            .map(|i| self.children[i])
    }

    /// Replace the child at an existing byte.
    pub fn set(&mut self, byte: u8, child: Node) {
        match self.keys[..self.len()].binary_search(&byte) {
            Ok(i) => self.children[i] = child,
            Err(_) => debug_assert!(child.is_empty(), "set on missing byte {byte}"),
        }
    }

    pub fn insert(&mut self, byte: u8, child: Node) {
        let n = self.len();
        debug_assert!(!self.is_full(), "insert into full node");
        match self.keys[..n].binary_search(&byte) {
            Ok(i) => self.children[i] = child,
            Err(i) => {
                self.keys.copy_within(i..n, i + 1);
                self.children.copy_within(i..n, i + 1);
                self.keys[i] = byte;
                self.children[i] = child;
                self.count += 1;
            }
        }
    }

    pub fn remove(&mut self, byte: u8) -> Option<Node> {
        let n = self.len();
        let i = self.keys[..n].binary_search(&byte).ok()?;
        let child = self.children[i];
        self.keys.copy_within(i + 1..n, i);
        self.children.copy_within(i + 1..n, i);
        self.children[n - 1] = Node::Empty;
        self.count -= 1;
        Some(child)
    }

    /// First child whose byte is at least `start`.
    pub fn next_from(&self, start: usize) -> Option<(u8, Node)> {
        let n = self.len();
        let i = self.keys[..n].partition_point(|&k| (k as usize) < start);
        (i < n).then(|| (self.keys[i], self.children[i]))
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
        self.keys[..self.len()]
            .iter()
            .copied()
            .zip(self.children[..self.len()].iter().copied())
    }
}

const EMPTY_INDEX: u8 = u8::MAX;

/// Inner node with a 256-entry byte index into 48 child slots.
#[derive(Debug, Clone)]
pub struct Node48 {
    count: u8,
    child_index: [u8; 256],
    children: [Node; NODE48_CAPACITY],
}

impl Default for Node48 {
    fn default() -> Self {
        Self {
            count: 0,
            child_index: [EMPTY_INDEX; 256],
            children: [Node::Empty; NODE48_CAPACITY],
        }
    }
}

impl Node48 {
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == NODE48_CAPACITY
    }

    pub fn get(&self, byte: u8) -> Option<Node> {
        match self.child_index[byte as usize] {
            EMPTY_INDEX => None,
            i => Some(self.children[i as usize]),
        }
    }

    pub fn set(&mut self, byte: u8, child: Node) {
        match self.child_index[byte as usize] {
            EMPTY_INDEX => debug_assert!(child.is_empty(), "set on missing byte {byte}"),
            i => self.children[i as usize] = child,
        }
    }

    pub fn insert(&mut self, byte: u8, child: Node) {
        if let Some(i) = self.position(byte) {
            self.children[i] = child;
            return;
        }
        // Slots of removed children are reused; a vacant slot holds Empty.
        let Some(slot) = self.children.iter().position(|c| c.is_empty()) else {
            unreachable!("insert into full node48");
        };
        self.children[slot] = child;
        self.child_index[byte as usize] = slot as u8;
        self.count += 1;
    }

    pub fn remove(&mut self, byte: u8) -> Option<Node> {
        let i = self.position(byte)?;
        let child = self.children[i];
        self.children[i] = Node::Empty;
        self.child_index[byte as usize] = EMPTY_INDEX;
        self.count -= 1;
        Some(child)
    }

    fn position(&self, byte: u8) -> Option<usize> {
        match self.child_index[byte as usize] {
            EMPTY_INDEX => None,
            i => Some(i as usize),
        }
    }

    pub fn next_from(&self, start: usize) -> Option<(u8, Node)> {
        (start..256).find_map(|b| self.get(b as u8).map(|child| (b as u8, child)))
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
        (0..=u8::MAX).filter_map(|b| self.get(b).map(|child| (b, child)))
    }
}

/// Inner node with one child slot per byte.
#[derive(Debug, Clone)]
pub struct Node256 {
    count: u16,
    children: [Node; NODE256_CAPACITY],
}

impl Default for Node256 {
    fn default() -> Self {
        Self {
            count: 0,
            children: [Node::Empty; NODE256_CAPACITY],
        }
    }
}

impl Node256 {
    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, byte: u8) -> Option<Node> {
        let child = self.children[byte as usize];
        (!child.is_empty()).then_some(child)
    }

    pub fn set(&mut self, byte: u8, child: Node) {
        debug_assert!(!self.children[byte as usize].is_empty() || child.is_empty());
        self.children[byte as usize] = child;
    }

    pub fn insert(&mut self, byte: u8, child: Node) {
        if self.children[byte as usize].is_empty() {
            self.count += 1;
        }
        self.children[byte as usize] = child;
    }

    pub fn remove(&mut self, byte: u8) -> Option<Node> {
        let child = self.get(byte)?;
        self.children[byte as usize] = Node::Empty;
        self.count -= 1;
        Some(child)
    }

    pub fn next_from(&self, start: usize) -> Option<(u8, Node)> {
        (start..256).find_map(|b| self.get(b as u8).map(|child| (b as u8, child)))
    }

    pub fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
        (0..=u8::MAX).filter_map(|b| self.get(b).map(|child| (b, child)))
    }
}

/// Dispatches a read-only inner node operation on the node kind.
macro_rules! with_inner {
    ($art:expr, $ptr:expr, |$n:ident| $body:expr) => {
        match $ptr.kind() {
            NType::Node4 => {
                let $n = $art.nodes4.get($ptr.slot());
                $body
            }
            NType::Node16 => {
                let $n = $art.nodes16.get($ptr.slot());
                $body
            }
            NType::Node48 => {
                let $n = $art.nodes48.get($ptr.slot());
                $body
            }
            NType::Node256 => {
                let $n = $art.nodes256.get($ptr.slot());
                $body
            }
            kind => panic!("{} is not an inner node", kind.name()),
        }
    };
}

/// Mutable counterpart of `with_inner!`.
macro_rules! with_inner_mut {
    ($art:expr, $ptr:expr, |$n:ident| $body:expr) => {
        match $ptr.kind() {
            NType::Node4 => {
                let $n = $art.nodes4.get_mut($ptr.slot());
                $body
            }
            NType::Node16 => {
                let $n = $art.nodes16.get_mut($ptr.slot());
                $body
            }
            NType::Node48 => {
                let $n = $art.nodes48.get_mut($ptr.slot());
                $body
            }
            NType::Node256 => {
                let $n = $art.nodes256.get_mut($ptr.slot());
                $body
            }
            kind => panic!("{} is not an inner node", kind.name()),
        }
    };
}

impl Art {
    #[inline]
    pub(crate) fn prefix(&self, ptr: NodePtr) -> &Prefix {
        debug_assert_eq!(ptr.kind(), NType::Prefix);
        self.prefixes.get(ptr.slot())
    }

    #[inline]
    pub(crate) fn prefix_mut(&mut self, ptr: NodePtr) -> &mut Prefix {
        debug_assert_eq!(ptr.kind(), NType::Prefix);
        self.prefixes.get_mut(ptr.slot())
    }

    /// Child of an inner node at `byte`.
    pub(crate) fn child(&self, ptr: NodePtr, byte: u8) -> Option<Node> {
        with_inner!(self, ptr, |n| n.get(byte))
    }

    /// Overwrite the child at an existing byte of an inner node.
    pub(crate) fn set_child(&mut self, ptr: NodePtr, byte: u8, child: Node) {
        with_inner_mut!(self, ptr, |n| n.set(byte, child))
    }

    /// First child at a byte of at least `start`.
    pub(crate) fn next_child(&self, ptr: NodePtr, start: usize) -> Option<(u8, Node)> {
        with_inner!(self, ptr, |n| n.next_from(start))
    }

    pub(crate) fn child_count(&self, ptr: NodePtr) -> usize {
        with_inner!(self, ptr, |n| n.len())
    }

    /// All children of an inner node in byte order.
    pub(crate) fn inner_entries(&self, ptr: NodePtr) -> Vec<(u8, Node)> {
        with_inner!(self, ptr, |n| n.entries().collect())
    }

    pub(crate) fn insert_child(&mut self, ptr: NodePtr, byte: u8, child: Node) {
        with_inner_mut!(self, ptr, |n| n.insert(byte, child))
    }

    fn remove_child(&mut self, ptr: NodePtr, byte: u8) -> Option<Node> {
        with_inner_mut!(self, ptr, |n| n.remove(byte))
    }

    pub(crate) fn new_inner(&mut self, kind: NType) -> Result<NodePtr> {
        let slot = match kind {
            NType::Node4 => self.nodes4.allocate(Node4::default())?,
            NType::Node16 => self.nodes16.allocate(Node16::default())?,
            NType::Node48 => self.nodes48.allocate(Node48::default())?,
            NType::Node256 => self.nodes256.allocate(Node256::default())?,
            kind => panic!("{} is not an inner node", kind.name()),
        };
        Ok(NodePtr::new(slot, kind))
    }

    /// Add a child to the inner node at `node`, growing it when full.
    pub(crate) fn add_child(&mut self, node: &mut Node, byte: u8, child: Node) -> Result<()> {
        let Some(ptr) = node.ptr() else {
            panic!("add_child on a non-pooled node");
        };
        debug_assert!(self.child(ptr, byte).is_none(), "byte {byte} already present");
        if self.child_count(ptr) == ptr.kind().capacity() {
            let grown = match ptr.kind() {
                NType::Node4 => NType::Node16,
                NType::Node16 => NType::Node48,
                _ => NType::Node256,
            };
            self.rebuild_inner(node, grown)?;
        }
        let Some(ptr) = node.ptr() else {
            unreachable!("inner node rebuilt into a non-pooled node");
        };
        self.insert_child(ptr, byte, child);
        Ok(())
    }

    /// Remove the child at `byte`, shrinking or collapsing the node.
    ///
    /// A Node4 left with a single child becomes a one-byte prefix in front of
    /// that child, merged into any prefix chain that follows.
    pub(crate) fn delete_child(&mut self, node: &mut Node, byte: u8) -> Result<()> {
        let Some(ptr) = node.ptr() else {
            panic!("delete_child on a non-pooled node");
        };
        self.remove_child(ptr, byte);
        let remaining = self.child_count(ptr);

        match ptr.kind() {
            NType::Node4 if remaining == 1 => {
                let Some((last_byte, child)) = self.next_child(ptr, 0) else {
                    unreachable!("node4 lost its last child");
                };
                self.nodes4.free(ptr.slot());
                *node = self.new_prefix_chain(&[last_byte], child)?;
                node.set_gate(ptr.is_gate());
                self.concat_prefix(node)
            }
            NType::Node16 if remaining < NODE16_SHRINK => self.rebuild_inner(node, NType::Node4),
            NType::Node48 if remaining < NODE48_SHRINK => self.rebuild_inner(node, NType::Node16),
            NType::Node256 if remaining <= NODE256_SHRINK => {
                self.rebuild_inner(node, NType::Node48)
            }
            _ => Ok(()),
        }
    }

    /// Copy an inner node into a node of another kind, keeping the gate flag.
    fn rebuild_inner(&mut self, node: &mut Node, kind: NType) -> Result<()> {
        let Some(old) = node.ptr() else {
            return Ok(());
        };
        let entries = self.inner_entries(old);
        debug_assert!(entries.len() <= kind.capacity());
        let fresh = self.new_inner(kind)?;
        for (byte, child) in entries {
            self.insert_child(fresh, byte, child);
        }
        self.free_node(old);
        *node = Node::Allocated(fresh);
        node.set_gate(old.is_gate());
        Ok(())
    }

    /// Free a single pooled node without touching its children.
    pub(crate) fn free_node(&mut self, ptr: NodePtr) {
        let slot = ptr.slot();
        match ptr.kind() {
            NType::Prefix => {
                self.prefixes.free(slot);
            }
            NType::Leaf => {
                self.leaves.free(slot);
            }
            NType::Node4 => {
                self.nodes4.free(slot);
            }
            NType::Node16 => {
                self.nodes16.free(slot);
            }
            NType::Node48 => {
                self.nodes48.free(slot);
            }
            NType::Node256 => {
                self.nodes256.free(slot);
            }
        }
    }

    /// Free a node and everything below it, leaving `node` empty.
    pub fn free_tree(&mut self, node: &mut Node) {
        let Some(ptr) = node.ptr() else {
            *node = Node::Empty;
            return;
        };
        match ptr.kind() {
            NType::Leaf => self.deprecated_free(node),
            NType::Prefix => {
                let mut child = self.prefix(ptr).child();
                self.free_tree(&mut child);
                self.prefixes.free(ptr.slot());
            }
            _ => {
                for (_, mut child) in self.inner_entries(ptr) {
                    self.free_tree(&mut child);
                }
                self.free_node(ptr);
            }
        }
        *node = Node::Empty;
    }

    /// Whether a pooled node sits in a segment marked for vacuum.
    pub(crate) fn needs_vacuum(&self, ptr: NodePtr) -> bool {
        let slot = ptr.slot();
        match ptr.kind() {
            NType::Prefix => self.prefixes.needs_vacuum(slot),
            NType::Leaf => self.leaves.needs_vacuum(slot),
            NType::Node4 => self.nodes4.needs_vacuum(slot),
            NType::Node16 => self.nodes16.needs_vacuum(slot),
            NType::Node48 => self.nodes48.needs_vacuum(slot),
            NType::Node256 => self.nodes256.needs_vacuum(slot),
        }
    }

    /// Move a node out of a vacuum segment, returning its new handle.
    pub(crate) fn relocate(&mut self, ptr: NodePtr) -> Result<NodePtr> {
        let slot = ptr.slot();
        let moved = match ptr.kind() {
            NType::Prefix => self.prefixes.relocate(slot)?,
            NType::Leaf => self.leaves.relocate(slot)?,
            NType::Node4 => self.nodes4.relocate(slot)?,
            NType::Node16 => self.nodes16.relocate(slot)?,
            NType::Node48 => self.nodes48.relocate(slot)?,
            NType::Node256 => self.nodes256.relocate(slot)?,
        };
        Ok(ptr.with_slot(moved))
    }
}
