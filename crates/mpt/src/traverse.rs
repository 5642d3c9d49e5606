//! Bounded depth-first traversal.
//!
//! Walks a subtree in branch order, emitting each reached leaf to a
//! visitor. Cold children load through the shared read cache (coalescing
//! with any concurrent find), the depth bound is counted in nibbles below
//! the starting cursor, and the visitor can stop the walk early.

use std::sync::Arc;

use triedb_io::AsyncIo;
use triedb_types::DbError;

use crate::find::{load_node_blocking, NodeCursor, ReadContext};
use crate::nibbles::Nibbles;
use crate::node::Node;

/// Visitor invoked per leaf with the full key (in nibbles) and the value.
/// Returning `false` stops the traversal.
pub type Visitor<'v> = dyn FnMut(&Nibbles, &[u8]) -> bool + 'v;

/// Depth-first traversal from `cursor`, whose path prefix is `base_key`
/// (the nibbles consumed getting there, including the matched part of the
/// node's own path). `max_depth`, when given, bounds how many nibbles below
/// the cursor the walk descends.
pub fn traverse_blocking(
    ctx: &Arc<ReadContext>,
    io: &AsyncIo,
    cursor: NodeCursor,
    base_key: Nibbles,
    max_depth: Option<usize>,
    visitor: &mut Visitor<'_>,
) -> Result<(), DbError> {
    debug_assert!(io.is_owner());
    // Finish matching the starting node's own path into the key.
    let mut key = base_key;
    for i in cursor.nibble_index..cursor.node.path.len() {
        key.push(cursor.node.path.get(i));
    }
    let mut stack: Vec<(Arc<Node>, Nibbles, usize)> = vec![(cursor.node, key, 0)];
    while let Some((node, key, depth)) = stack.pop() {
        if let Some(value) = node.leaf() {
            if !visitor(&key, value) {
                return Ok(());
            }
        }
        if max_depth.is_some_and(|limit| depth >= limit) {
            continue;
        }
        // Push children in reverse so they pop in ascending branch order.
        let branches: Vec<(u8, triedb_types::PackedOffset)> =
            node.branches().map(|(b, c)| (b, c.fnext)).collect();
        for (branch, offset) in branches.into_iter().rev() {
            let child = load_node_blocking(ctx, io, offset)?;
            let mut child_key = key.clone();
            child_key.push(branch);
            let child_depth = depth + 1 + child.path.len();
            for i in 0..child.path.len() {
                child_key.push(child.path.get(i));
            }
            stack.push((child, child_key, child_depth));
        }
    }
    Ok(())
}

