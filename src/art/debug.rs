//! Debug utilities for index troubleshooting.

use std::fmt::Write as _;

use super::leaf::LEAF_SIZE;
use super::node::{NType, Node, NodePtr, NODE16_SHRINK, NODE256_SHRINK, NODE48_SHRINK};
use super::prefix::PREFIX_SIZE;
use super::tree::GateStatus;
use super::Art;
use crate::art::key::ROW_ID_KEY_LEN;

impl Art {
    /// Print the tree structure for debugging.
    pub fn debug_print(&self) {
        println!("=== ART Debug ===");
        print!("{}", self.verify_and_to_string(false));
        println!("=================");
    }

    /// Render the tree, one node per line. With `only_verify` the walk only
    /// runs the legacy leaf checks and returns an empty string.
    pub fn verify_and_to_string(&self, only_verify: bool) -> String {
        let mut out = String::new();
        if self.root.is_empty() {
            if !only_verify {
                out.push_str("(empty)\n");
            }
            return out;
        }
        self.render_node(self.root, 0, only_verify, &mut out);
        out
    }

    fn render_node(&self, node: Node, depth: usize, only_verify: bool, out: &mut String) {
        let indent = "  ".repeat(depth);
        match node {
            Node::Empty => {
                if !only_verify {
                    let _ = writeln!(out, "{indent}(empty)");
                }
            }
            Node::Inlined(row_id) => {
                if !only_verify {
                    let _ = writeln!(out, "{indent}Inlined [row id: {row_id}]");
                }
            }
            Node::Allocated(ptr) => {
                let gate = if ptr.is_gate() { " (gate)" } else { "" };
                match ptr.kind() {
                    NType::Leaf => {
                        let chain = self.deprecated_verify_and_to_string(node, only_verify);
                        if !only_verify {
                            let _ = writeln!(out, "{indent}{}", chain.trim_end());
                        }
                    }
                    NType::Prefix => {
                        let prefix = self.prefix(ptr);
                        if !only_verify {
                            let _ = writeln!(out, "{indent}Prefix{gate} {:02x?}", prefix.bytes());
                        }
                        self.render_node(prefix.child(), depth + 1, only_verify, out);
                    }
                    kind => {
                        if !only_verify {
                            let _ = writeln!(
                                out,
                                "{indent}{}{gate} (children={})",
                                kind.name(),
                                self.child_count(ptr)
                            );
                        }
                        for (byte, child) in self.inner_entries(ptr) {
                            if !only_verify {
                                let _ = writeln!(out, "{indent}  [{byte:02x}] ->");
                            }
                            self.render_node(child, depth + 2, only_verify, out);
                        }
                    }
                }
            }
        }
    }

    /// Verify tree integrity - returns list of issues found.
    pub fn verify_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut path = Vec::new();
        self.verify_node(self.root, GateStatus::Outside, &mut path, true, &mut issues);
        issues
    }

    /// Whether `ptr` still refers to a live slot of its pool.
    fn is_live(&self, ptr: NodePtr) -> bool {
        let slot = ptr.slot();
        match ptr.kind() {
            NType::Prefix => self.prefixes.contains(slot),
            NType::Leaf => self.leaves.contains(slot),
            NType::Node4 => self.nodes4.contains(slot),
            NType::Node16 => self.nodes16.contains(slot),
            NType::Node48 => self.nodes48.contains(slot),
            NType::Node256 => self.nodes256.contains(slot),
        }
    }

    fn verify_node(
        &self,
        node: Node,
        gate: GateStatus,
        path: &mut Vec<u8>,
        is_root: bool,
        issues: &mut Vec<String>,
    ) {
        let Some(ptr) = node.ptr() else {
            if node.is_empty() && !is_root {
                issues.push(format!("Empty child at path {:02x?}", path));
            }
            if node.is_inlined() && gate == GateStatus::Inside && path.len() != ROW_ID_KEY_LEN {
                issues.push(format!("Gate leaf at depth {} (expected {ROW_ID_KEY_LEN})", path.len()));
            }
            return;
        };
        if !self.is_live(ptr) {
            issues.push(format!("Stale {} handle at path {:02x?}", ptr.kind().name(), path));
            return;
        }

        if ptr.is_gate() {
            if gate == GateStatus::Inside {
                issues.push(format!("Nested gate at path {:02x?}", path));
                return;
            }
            let mut row_ids = Vec::new();
            self.leaf_row_ids(node, &mut row_ids, usize::MAX);
            if row_ids.len() < 2 {
                issues.push(format!(
                    "Gate at path {:02x?} holds {} row ids (min 2)",
                    path,
                    row_ids.len()
                ));
            }
            if row_ids.windows(2).any(|w| w[0] >= w[1]) {
                issues.push(format!("Gate at path {:02x?} is not strictly ordered", path));
            }
            let mut gate_path = Vec::new();
            let mut inner = node;
            inner.set_gate(false);
            self.verify_node(inner, GateStatus::Inside, &mut gate_path, true, issues);
            return;
        }

        let len = path.len();
        match ptr.kind() {
            NType::Leaf => {
                if gate == GateStatus::Inside {
                    issues.push(format!("Legacy leaf inside a gate at path {:02x?}", path));
                }
                let mut cursor = node;
                while let Some(chunk_ptr) = cursor.ptr() {
                    if !self.is_live(chunk_ptr) {
                        issues.push(format!("Stale leaf chunk at path {:02x?}", path));
                        break;
                    }
                    let chunk = self.leaf(chunk_ptr);
                    if chunk.row_ids().is_empty() || chunk.row_ids().len() > LEAF_SIZE {
                        issues.push(format!(
                            "Leaf chunk at path {:02x?} holds {} row ids",
                            path,
                            chunk.row_ids().len()
                        ));
                    }
                    cursor = chunk.next();
                }
            }
            NType::Prefix => {
                let prefix = self.prefix(ptr);
                if prefix.is_empty() || prefix.len() > PREFIX_SIZE {
                    issues.push(format!("Prefix at path {:02x?} has {} bytes", path, prefix.len()));
                }
                if prefix.child().is_empty() {
                    issues.push(format!("Prefix at path {:02x?} has no child", path));
                }
                path.extend_from_slice(prefix.bytes());
                self.verify_node(prefix.child(), gate, path, false, issues);
            }
            kind => {
                let n = self.child_count(ptr);
                let min = match kind {
                    NType::Node4 => 2,
                    NType::Node16 => NODE16_SHRINK,
                    NType::Node48 => NODE48_SHRINK,
                    _ => NODE256_SHRINK + 1,
                };
                if n > kind.capacity() {
                    issues.push(format!("{} has {} children (max {})", kind.name(), n, kind.capacity()));
                }
                if n < min {
                    issues.push(format!(
                        "{} at path {:02x?} has {} children (min {})",
                        kind.name(),
                        path,
                        n,
                        min
                    ));
                }
                let entries = self.inner_entries(ptr);
                if entries.len() != n {
                    issues.push(format!(
                        "{} reports {} children but holds {}",
                        kind.name(),
                        n,
                        entries.len()
                    ));
                }
                for (byte, child) in entries {
                    path.push(byte);
                    self.verify_node(child, gate, path, false, issues);
                    path.truncate(len);
                }
            }
        }
        path.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::art::key::ArtKey;

    #[test]
    fn test_render_mixed_leaves() {
        let mut art = Art::new();
        art.insert(&ArtKey::encode("a"), 1).unwrap();
        art.insert(&ArtKey::encode("b"), 2).unwrap();
        art.insert(&ArtKey::encode("b"), 3).unwrap();

        let rendered = art.verify_and_to_string(false);
        assert!(rendered.contains("Inlined [row id: 1]"));
        assert!(rendered.contains("(gate)"));
        assert!(rendered.contains("Inlined [row id: 3]"));
        assert!(art.verify_and_to_string(true).is_empty());
        assert!(art.verify_integrity().is_empty(), "{:?}", art.verify_integrity());
    }

    #[test]
    fn test_render_empty() {
        let art = Art::new();
        assert_eq!(art.verify_and_to_string(false), "(empty)\n");
        assert!(art.verify_integrity().is_empty());
    }

    #[test]
    fn test_integrity_after_many_inserts() {
        let mut art = Art::new();
        for i in 0..2_000u32 {
            art.insert(&ArtKey::encode(&(i % 300)), i as i64).unwrap();
        }
        for i in (0..2_000u32).step_by(3) {
            art.erase(&ArtKey::encode(&(i % 300)), i as i64).unwrap();
        }
        assert!(art.verify_integrity().is_empty(), "{:?}", art.verify_integrity());
    }

    #[test]
    fn test_integrity_reports_stale_handles() {
        let mut art = Art::new();
        art.insert(&ArtKey::encode("k"), 1).unwrap();
        let Some(ptr) = art.root.ptr() else {
            panic!("root is not pooled");
        };
        art.prefixes.free(ptr.slot());

        let issues = art.verify_integrity();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("Stale prefix handle"), "{issues:?}");
    }
}
