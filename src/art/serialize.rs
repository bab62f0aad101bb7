//! Persisted index images.
//!
//! An image is the magic `NART`, a version byte and the root node in
//! pre-order. Every node starts with a tag byte whose high bit marks a gate:
//!
//! | tag | node    | body                                             |
//! |-----|---------|--------------------------------------------------|
//! | 0   | empty   |                                                  |
//! | 1   | inlined | varint row id                                    |
//! | 2   | prefix  | byte count, bytes, child                         |
//! | 3   | leaf    | varint chunk count, per chunk: count, varint ids |
//! | 4-7 | inner   | varint child count, per child: byte, child       |
//!
//! Version 1 images predate gates: multi-row-id leaves are legacy chains.
//! Writing one rewrites every gate in memory as a chain first.
//!
//! Decoding validates what the tree algorithms rely on: node nesting is
//! bounded, gates hold at least two row ids, each at the end of its own
//! 8-byte key, and legacy chains hold distinct row ids.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use smallvec::SmallVec;
use tracing::debug;

use super::key::{ArtKey, MAX_KEY_LEN, ROW_ID_KEY_LEN};
use super::leaf::{Leaf, LEAF_SIZE};
use super::node::{NType, Node};
use super::prefix::{Prefix, PREFIX_SIZE};
use super::tree::GateStatus;
use super::{Art, RowId, MAX_ROW_ID_LOCAL};
use crate::encoding::{encode_varint, Reader};
use crate::error::{ArtError, Result};
use crate::Config;

const MAGIC: &[u8; 4] = b"NART";

const TAG_EMPTY: u8 = 0;
const TAG_INLINED: u8 = 1;
const TAG_PREFIX: u8 = 2;
const TAG_LEAF: u8 = 3;
const TAG_NODE4: u8 = 4;
const TAG_NODE16: u8 = 5;
const TAG_NODE48: u8 = 6;
const TAG_NODE256: u8 = 7;
const GATE_BIT: u8 = 0x80;

/// Deepest node nesting a well-formed image can hold: every node on a path
/// consumes at least one key byte, plus the terminal leaf, once for the
/// outer key and once for the row id key below a gate.
const MAX_NODE_DEPTH: usize = MAX_KEY_LEN + ROW_ID_KEY_LEN + 2;

/// On-disk layout of multi-row-id leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// Linked chunks of row ids, readable by older versions.
    Legacy,
    /// Gates holding nested row-id trees.
    Nested,
}

impl StorageFormat {
    pub fn version(self) -> u8 {
        match self {
            StorageFormat::Legacy => 1,
            StorageFormat::Nested => 2,
        }
    }

    pub fn from_version(version: u8) -> Result<Self> {
        match version {
            1 => Ok(StorageFormat::Legacy),
            2 => Ok(StorageFormat::Nested),
            v => Err(ArtError::UnsupportedVersion(v)),
        }
    }
}

fn inner_tag(kind: NType) -> u8 {
    match kind {
        NType::Node4 => TAG_NODE4,
        NType::Node16 => TAG_NODE16,
        NType::Node48 => TAG_NODE48,
        NType::Node256 => TAG_NODE256,
        NType::Prefix => TAG_PREFIX,
        NType::Leaf => TAG_LEAF,
    }
}

impl Art {
    /// Encode the index as an image of the given format.
    ///
    /// For [`StorageFormat::Legacy`] every gate is first rewritten as a
    /// legacy chain in memory; the next mutation reaching such a leaf
    /// migrates it back.
    pub fn serialize(&mut self, format: StorageFormat) -> Result<Vec<u8>> {
        if format == StorageFormat::Legacy {
            self.transform_gates_to_deprecated()?;
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(format.version());
        self.write_node(self.root, &mut buf);
        debug!(bytes = buf.len(), ?format, "serialized index");
        Ok(buf)
    }

    /// Load an image of either format. Legacy chains are kept as they are.
    pub fn deserialize(bytes: &[u8], config: Config) -> Result<Art> {
        let mut reader = Reader::new(bytes);
        if reader.read_bytes(MAGIC.len())? != MAGIC {
            return Err(ArtError::Corrupt {
                offset: 0,
                reason: "bad magic",
            });
        }
        let format = StorageFormat::from_version(reader.read_u8()?)?;

        let mut dec = Decoder {
            reader,
            format,
            level: 0,
            gate_path: SmallVec::new(),
            gate_leaves: 0,
        };
        let mut art = Art::with_config(config);
        let root = art.read_node(&mut dec, GateStatus::Outside)?;
        if !dec.reader.is_at_end() {
            return Err(dec.reader.corrupt("trailing bytes after root"));
        }
        art.root = root;
        debug!(bytes = bytes.len(), ?format, "loaded index image");
        Ok(art)
    }

    pub fn write_to<W: Write>(&mut self, mut writer: W, format: StorageFormat) -> Result<()> {
        let buf = self.serialize(format)?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R, config: Config) -> Result<Art> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::deserialize(&buf, config)
    }

    /// Rewrite every gate of the outer tree as a legacy chain.
    pub(crate) fn transform_gates_to_deprecated(&mut self) -> Result<()> {
        let mut root = self.root;
        let result = self.transform_below(&mut root);
        self.root = root;
        result
    }

    fn transform_below(&mut self, node: &mut Node) -> Result<()> {
        if Self::is_leaf(*node, GateStatus::Outside) {
            return self.transform_to_deprecated(node);
        }
        let Some(ptr) = node.ptr() else {
            return Ok(());
        };
        if ptr.kind() == NType::Prefix {
            let mut child = self.prefix(ptr).child();
            self.transform_below(&mut child)?;
            self.prefix_mut(ptr).set_child(child);
            return Ok(());
        }
        for (byte, mut child) in self.inner_entries(ptr) {
            self.transform_below(&mut child)?;
            self.set_child(ptr, byte, child);
        }
        Ok(())
    }

    fn write_node(&self, node: Node, buf: &mut Vec<u8>) {
        let ptr = match node {
            Node::Empty => {
                buf.push(TAG_EMPTY);
                return;
            }
            Node::Inlined(row_id) => {
                buf.push(TAG_INLINED);
                encode_varint(row_id as u64, buf);
                return;
            }
            Node::Allocated(ptr) => ptr,
        };
        let gate_bit = if ptr.is_gate() { GATE_BIT } else { 0 };
        buf.push(inner_tag(ptr.kind()) | gate_bit);

        match ptr.kind() {
            NType::Prefix => {
                let prefix = self.prefix(ptr);
                buf.push(prefix.len() as u8);
                buf.extend_from_slice(prefix.bytes());
                self.write_node(prefix.child(), buf);
            }
            NType::Leaf => {
                let mut chunks = Vec::new();
                let mut cursor = node;
                while let Some(chunk_ptr) = cursor.ptr() {
                    let chunk = self.leaf(chunk_ptr);
                    chunks.push(chunk.row_ids());
                    cursor = chunk.next();
                }
                encode_varint(chunks.len() as u64, buf);
                for row_ids in chunks {
                    buf.push(row_ids.len() as u8);
                    for &row_id in row_ids {
                        encode_varint(row_id as u64, buf);
                    }
                }
            }
            _ => {
                let entries = self.inner_entries(ptr);
                encode_varint(entries.len() as u64, buf);
                for (byte, child) in entries {
                    buf.push(byte);
                    self.write_node(child, buf);
                }
            }
        }
    }

    fn read_row_id(reader: &mut Reader<'_>) -> Result<RowId> {
        let raw = reader.read_varint()?;
        RowId::try_from(raw)
            .ok()
            .filter(|row_id| (0..MAX_ROW_ID_LOCAL).contains(row_id))
            .ok_or_else(|| reader.corrupt("row id out of range"))
    }

    fn read_node(&mut self, dec: &mut Decoder<'_>, gate: GateStatus) -> Result<Node> {
        if dec.level >= MAX_NODE_DEPTH {
            return Err(dec.reader.corrupt("nodes nested too deep"));
        }
        dec.level += 1;
        let result = self.read_node_body(dec, gate);
        dec.level -= 1;
        result
    }

    fn read_node_body(&mut self, dec: &mut Decoder<'_>, gate: GateStatus) -> Result<Node> {
        let tag = dec.reader.read_u8()?;
        let is_gate = tag & GATE_BIT != 0;
        let tag = tag & !GATE_BIT;
        if is_gate {
            if dec.format == StorageFormat::Legacy {
                return Err(dec.reader.corrupt("gate in a legacy image"));
            }
            if gate == GateStatus::Inside {
                return Err(dec.reader.corrupt("gate nested inside a gate"));
            }
            if !matches!(tag, TAG_PREFIX | TAG_NODE4..=TAG_NODE256) {
                return Err(dec.reader.corrupt("gate flag on a leaf"));
            }
            dec.gate_path.clear();
            dec.gate_leaves = 0;
        }
        let child_gate = if is_gate { GateStatus::Inside } else { gate };

        let mut node = match tag {
            TAG_EMPTY => Node::Empty,
            TAG_INLINED => {
                let row_id = Self::read_row_id(&mut dec.reader)?;
                if gate == GateStatus::Inside {
                    if dec.gate_path.len() != ROW_ID_KEY_LEN {
                        return Err(dec.reader.corrupt("gate leaf at the wrong depth"));
                    }
                    if ArtKey::from_bytes(&dec.gate_path).row_id() != row_id {
                        return Err(dec.reader.corrupt("gate leaf does not match its key"));
                    }
                    dec.gate_leaves += 1;
                }
                Node::inlined(row_id)
            }
            TAG_PREFIX => {
                let len = dec.reader.read_u8()? as usize;
                if len == 0 || len > PREFIX_SIZE {
                    return Err(dec.reader.corrupt("prefix length out of range"));
                }
                let bytes = dec.reader.read_bytes(len)?;
                let mark = dec.gate_path.len();
                if child_gate == GateStatus::Inside {
                    dec.push_gate_bytes(bytes)?;
                }
                let child = self.read_node(dec, child_gate)?;
                dec.gate_path.truncate(mark);
                if child.is_empty() {
                    return Err(dec.reader.corrupt("prefix without child"));
                }
                let slot = self.prefixes.allocate(Prefix::new(bytes, child))?;
                Node::allocated(slot, NType::Prefix)
            }
            TAG_LEAF => {
                if gate == GateStatus::Inside {
                    return Err(dec.reader.corrupt("legacy leaf inside a gate"));
                }
                self.read_legacy_chain(&mut dec.reader)?
            }
            TAG_NODE4..=TAG_NODE256 => {
                let kind = match tag {
                    TAG_NODE4 => NType::Node4,
                    TAG_NODE16 => NType::Node16,
                    TAG_NODE48 => NType::Node48,
                    _ => NType::Node256,
                };
                let count = dec.reader.read_varint()?;
                if count == 0 || count > kind.capacity() as u64 {
                    return Err(dec.reader.corrupt("child count out of range"));
                }
                let ptr = self.new_inner(kind)?;
                let mark = dec.gate_path.len();
                let mut previous: Option<u8> = None;
                for _ in 0..count {
                    let byte = dec.reader.read_u8()?;
                    if previous.is_some_and(|p| p >= byte) {
                        return Err(dec.reader.corrupt("children out of order"));
                    }
                    previous = Some(byte);
                    if child_gate == GateStatus::Inside {
                        dec.push_gate_bytes(&[byte])?;
                    }
                    let child = self.read_node(dec, child_gate)?;
                    dec.gate_path.truncate(mark);
                    if child.is_empty() {
                        return Err(dec.reader.corrupt("empty child"));
                    }
                    self.insert_child(ptr, byte, child);
                }
                Node::Allocated(ptr)
            }
            _ => return Err(dec.reader.corrupt("unknown node tag")),
        };
        if is_gate && dec.gate_leaves < 2 {
            return Err(dec.reader.corrupt("gate holds fewer than two row ids"));
        }
        node.set_gate(is_gate);
        Ok(node)
    }

    fn read_legacy_chain(&mut self, reader: &mut Reader<'_>) -> Result<Node> {
        let chunk_count = reader.read_varint()?;
        if chunk_count == 0 {
            return Err(reader.corrupt("legacy leaf without chunks"));
        }
        let mut seen = BTreeSet::new();
        let mut chunks = Vec::new();
        for _ in 0..chunk_count {
            let count = reader.read_u8()? as usize;
            if count == 0 || count > LEAF_SIZE {
                return Err(reader.corrupt("leaf chunk size out of range"));
            }
            let mut row_ids = [0; LEAF_SIZE];
            for row_id in row_ids.iter_mut().take(count) {
                *row_id = Self::read_row_id(reader)?;
                if !seen.insert(*row_id) {
                    return Err(reader.corrupt("duplicate row id in legacy leaf"));
                }
            }
            chunks.push((row_ids, count));
        }
        let mut next = Node::Empty;
        for (row_ids, count) in chunks.into_iter().rev() {
            let slot = self.leaves.allocate(Leaf::new(&row_ids[..count], next))?;
            next = Node::allocated(slot, NType::Leaf);
        }
        Ok(next)
    }
}

/// Cursor state of one image decode.
struct Decoder<'a> {
    reader: Reader<'a>,
    format: StorageFormat,
    /// Nodes between the root and the node being read.
    level: usize,
    /// Key bytes from the enclosing gate down to the node being read.
    gate_path: SmallVec<[u8; ROW_ID_KEY_LEN]>,
    /// Row ids read so far under the enclosing gate.
    gate_leaves: usize,
}

impl Decoder<'_> {
    fn push_gate_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.gate_path.len() + bytes.len() > ROW_ID_KEY_LEN {
            return Err(self.reader.corrupt("gate key longer than a row id"));
        }
        self.gate_path.extend_from_slice(bytes);
        Ok(())
    }
}
