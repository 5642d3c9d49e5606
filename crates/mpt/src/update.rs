//! The batched trie update path.
//!
//! An upsert takes an ordered [`UpdateList`], merges it into the live trie
//! (loading cold nodes through the io as needed), and leaves the touched
//! path dirty: cleared hash caches and invalid child offsets. A post-order
//! commit pass then rehashes bottom-up and appends every dirty node through
//! the chosen write stream, threading each subtree's minimum virtual offset
//! up into its parent so expiration can reason about chunk liveness.

use smallvec::SmallVec;
use triedb_io::AsyncIo;
use triedb_types::{DbError, PackedOffset};

use crate::aux::{Stream, UpdateAux};
use crate::compute::Compute;
use crate::nibbles::{Nibbles, NibblesView};
use crate::node::{Child, Node};
use crate::pages::spare_for_record;

/// One update of a batch. `next` nests updates for the subtree below `key`,
/// modeling nested tables; their keys are relative to that subtree.
#[derive(Debug, Clone)]
pub struct Update {
    pub key: Vec<u8>,
    /// `Some(empty)` with no children erases; any other `Some` replaces the
    /// leaf; `None` leaves the leaf alone (pure subtree update).
    pub value: Option<Vec<u8>>,
    /// A nonzero incarnation discards the existing subtree below `key`
    /// before the nested updates apply.
    pub incarnation: u64,
    pub version: u64,
    pub next: Vec<Update>,
}

pub type UpdateList = Vec<Update>;

impl Update {
    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: u64) -> Self {
        Self { key: key.into(), value: Some(value.into()), incarnation: 0, version, next: Vec::new() }
    }

    pub fn erase(key: impl Into<Vec<u8>>, version: u64) -> Self {
        Self { key: key.into(), value: Some(Vec::new()), incarnation: 0, version, next: Vec::new() }
    }

    pub fn nested(
        key: impl Into<Vec<u8>>,
        value: Option<Vec<u8>>,
        version: u64,
        next: Vec<Update>,
    ) -> Self {
        Self { key: key.into(), value, incarnation: 0, version, next }
    }

    fn is_erase(&self) -> bool {
        self.value.as_ref().is_some_and(|v| v.is_empty()) && self.next.is_empty()
    }
}

/// Loader context for the merge phase.
pub(crate) struct TrieCtx<'a> {
    pub aux: &'a UpdateAux,
    pub io: &'a AsyncIo,
}

impl TrieCtx<'_> {
    fn load(&self, offset: PackedOffset) -> Result<Box<Node>, DbError> {
        self.aux.load_node(self.io, offset)
    }
}

/// Merges an ordered batch into the trie rooted at `root`, returning the new
/// root. The touched path is left dirty for [`commit_subtree`].
pub fn apply_updates(
    ctx: &TrieCtx<'_>,
    mut root: Option<Box<Node>>,
    updates: &[Update],
) -> Result<Option<Box<Node>>, DbError> {
    debug_assert!(
        updates.windows(2).all(|w| w[0].key <= w[1].key),
        "update list must be ordered by key"
    );
    for upd in updates {
        let key = NibblesView::from_key(&upd.key);
        root = apply_one(ctx, root, key, upd)?.0;
    }
    Ok(root)
}

/// Applies one update at `key` relative to `node`. Returns the replacement
/// subtree and whether anything changed.
fn apply_one(
    ctx: &TrieCtx<'_>,
    node: Option<Box<Node>>,
    key: NibblesView<'_>,
    upd: &Update,
) -> Result<(Option<Box<Node>>, bool), DbError> {
    let Some(mut node) = node else {
        if upd.is_erase() {
            return Ok((None, false));
        }
        let mut fresh = Node::new_branch(key.to_nibbles());
        let changed = apply_payload(ctx, &mut fresh, upd)?;
        if !changed && fresh.value.is_none() && fresh.n() == 0 {
            return Ok((None, false));
        }
        return Ok((normalize(ctx, fresh)?, true));
    };

    let path = node.path.clone();
    let lcp = key.common_prefix_len(&path.view());
    if lcp == path.len() {
        if lcp == key.len() {
            // The update lands on this node.
            let changed = apply_payload(ctx, &mut node, upd)?;
            if !changed {
                return Ok((Some(node), false));
            }
            return Ok((normalize(ctx, node)?, true));
        }
        // Descend below this node.
        let changed = apply_below(ctx, &mut node, key.substr(lcp), upd)?;
        if !changed {
            return Ok((Some(node), false));
        }
        return Ok((normalize(ctx, node)?, true));
    }
    if upd.is_erase() {
        // The key diverges from the compressed path; nothing to erase.
        return Ok((Some(node), false));
    }
    // Path split: this node's compressed path and the key part ways at
    // `lcp`. The node is pushed down a branch of a new fork node.
    let prefix = path.view().prefix(lcp).to_nibbles();
    let node_branch = path.view().get(lcp);
    node.path = path.view().substr(lcp + 1).to_nibbles();
    node.mark_dirty();
    let mut fork = Node::new_branch(prefix);
    fork.insert_child(node_branch, Child::from_node(node));
    if lcp == key.len() {
        // The key ends at the fork itself.
        apply_payload(ctx, &mut fork, upd)?;
    } else {
        let key_branch = key.get(lcp);
        let (sub, _) = apply_one(ctx, None, key.substr(lcp + 1), upd)?;
        if let Some(sub) = sub {
            fork.insert_child(key_branch, Child::from_node(sub));
        }
    }
    fork.mark_dirty();
    Ok((normalize(ctx, fork)?, true))
}

/// Applies an update whose key continues below `node` (first nibble selects
/// the branch). Returns whether the node changed.
fn apply_below(
    ctx: &TrieCtx<'_>,
    node: &mut Node,
    key: NibblesView<'_>,
    upd: &Update,
) -> Result<bool, DbError> {
    debug_assert!(!key.is_empty());
    let branch = key.get(0);
    let rest = key.substr(1);
    if node.has_branch(branch) {
        let j = node.child_index(branch);
        {
            let child = &mut node.children[j];
            if child.next.is_none() {
                child.next = Some(ctx.load(child.fnext)?);
            }
        }
        let sub = node.children[j].next.take();
        let (replacement, changed) = apply_one(ctx, sub, rest, upd)?;
        match replacement {
            Some(n) => {
                let child = &mut node.children[j];
                child.next = Some(n);
                if changed {
                    child.fnext = PackedOffset::INVALID;
                    child.min_offset = u64::MAX;
                    child.data.clear();
                    node.mark_dirty();
                }
            }
            None => {
                node.remove_child(branch);
                node.mark_dirty();
            }
        }
        Ok(changed)
    } else {
        if upd.is_erase() {
            return Ok(false);
        }
        let (sub, changed) = apply_one(ctx, None, rest, upd)?;
        if let Some(sub) = sub {
            node.insert_child(branch, Child::from_node(sub));
            node.mark_dirty();
        }
        Ok(changed)
    }
}

/// Applies the update's own payload (incarnation reset, leaf value, nested
/// updates) to the node the key resolved to.
fn apply_payload(ctx: &TrieCtx<'_>, node: &mut Node, upd: &Update) -> Result<bool, DbError> {
    let mut changed = false;
    if upd.incarnation != 0 && node.n() > 0 {
        node.mask = 0;
        node.children.clear();
        changed = true;
    }
    match &upd.value {
        Some(v) if v.is_empty() => {
            if node.value.is_some() {
                node.value = None;
                changed = true;
            }
        }
        Some(v) => {
            if v.len() > u8::MAX as usize {
                return Err(DbError::InvalidArgument(
                    "leaf value over 255 bytes; use a nested subtree",
                ));
            }
            if node.leaf() != Some(v.as_slice()) {
                node.value = Some(v.clone().into_boxed_slice());
                changed = true;
            }
        }
        None => {}
    }
    for nested in &upd.next {
        let key = NibblesView::from_key(&nested.key);
        if key.is_empty() {
            return Err(DbError::InvalidArgument("nested update with empty key"));
        }
        changed |= apply_below(ctx, node, key, nested)?;
    }
    if changed {
        node.mark_dirty();
    }
    Ok(changed)
}

/// Enforces the branch invariant after an update: a node with no leaf and a
/// single child collapses into that child, a node with nothing disappears.
fn normalize(ctx: &TrieCtx<'_>, mut node: Box<Node>) -> Result<Option<Box<Node>>, DbError> {
    if node.value.is_some() || node.n() >= 2 {
        return Ok(Some(node));
    }
    match node.sole_branch() {
        None => Ok(None),
        Some(branch) => {
            let mut child = node.remove_child(branch);
            let mut sub = match child.next.take() {
                Some(sub) => sub,
                None => ctx.load(child.fnext)?,
            };
            sub.path = Nibbles::concat3(node.path.view(), branch, sub.path.view());
            sub.mark_dirty();
            Ok(Some(sub))
        }
    }
}

/// Writes every dirty node of `node`'s subtree post-order through `stream`,
/// rehashing bottom-up. Returns the node's packed offset (spare pages
/// included) and the minimum virtual offset of the written subtree.
pub fn commit_subtree(
    aux: &mut UpdateAux,
    io: &AsyncIo,
    compute: &dyn Compute,
    node: &mut Node,
    stream: Stream,
    compaction: bool,
    threshold: u64,
) -> Result<(PackedOffset, u64), DbError> {
    let mut min_virtual = u64::MAX;
    for j in 0..node.children.len() {
        let needs_commit = {
            let child = &node.children[j];
            !child.fnext.is_valid() || (compaction && child.min_offset < threshold)
        };
        if needs_commit {
            {
                let child = &mut node.children[j];
                if child.next.is_none() {
                    // A cold reference being compacted forward.
                    child.next = Some(aux.load_node(io, child.fnext)?);
                }
            }
            // Compacted rewrites land on the slow stream so cold subtrees do
            // not churn the hot chain.
            let child_stream =
                if node.children[j].fnext.is_valid() { Stream::Slow } else { stream };
            let mut sub = node.children[j].next.take().unwrap_or_else(|| unreachable!());
            let (off, min) =
                commit_subtree(aux, io, compute, &mut sub, child_stream, compaction, threshold)?;
            let child = &mut node.children[j];
            child.next = Some(sub);
            child.fnext = off;
            child.min_offset = min;
        }
        let child = &mut node.children[j];
        if child.data.is_empty() {
            if let Some(sub) = child.next.as_ref() {
                child.data = SmallVec::from_slice(&sub.hash);
            }
        }
        min_virtual = min_virtual.min(child.min_offset);
    }
    if !node.has_hash() {
        node.hash = compute.compute(node);
    }
    node.disk_size = node.compute_disk_size();
    let bytes = node.serialize();
    let at = aux.write_node_bytes(io, stream, &bytes)?;
    let own = aux.db_metadata().virtual_offset(at);
    let spare = spare_for_record(at.offset, bytes.len());
    Ok((at.pack(spare), min_virtual.min(own)))
}
