//! Pluggable subtree hashing.
//!
//! Hashes are recomputed bottom-up in the touched part of the trie; an
//! unchanged sibling contributes the 32-byte cache its parent keeps for it,
//! so a parent rehash never re-walks clean subtrees.

use sha3::{Digest, Keccak256};

use crate::node::Node;

/// A strategy producing the canonical 32-byte digest of a node given its
/// path, leaf value and the cached digests of its children.
pub trait Compute: Send + Sync + std::fmt::Debug {
    fn compute(&self, node: &Node) -> [u8; 32];
}

/// Keccak-256 over a canonical node encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct Keccak256Compute;

impl Compute for Keccak256Compute {
    fn compute(&self, node: &Node) -> [u8; 32] {
        let mut h = Keccak256::new();
        h.update((node.path.len() as u16).to_le_bytes());
        h.update(node.path.packed_bytes());
        h.update(node.mask.to_le_bytes());
        for (branch, child) in node.branches() {
            debug_assert!(!child.data.is_empty(), "child hash cache missing during rehash");
            h.update([branch]);
            h.update(&child.data);
        }
        if let Some(value) = node.leaf() {
            h.update([1u8]);
            h.update((value.len() as u16).to_le_bytes());
            h.update(value);
        } else {
            h.update([0u8]);
        }
        h.finalize().into()
    }
}
