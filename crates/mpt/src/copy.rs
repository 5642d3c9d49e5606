//! Logical subtree copy.
//!
//! `copy_node` grafts the subtree found at `src` under `dest`, creating the
//! intermediate splits and branches the destination needs. Ownership of the
//! in-memory children moves to the destination: the source's child
//! pointers are nulled, leaving it a disk-only reference to the very same
//! records, so no node ever has two owners while both keys resolve to the
//! same data.

use smallvec::SmallVec;
use triedb_io::AsyncIo;
use triedb_types::DbError;

use crate::aux::UpdateAux;
use crate::nibbles::NibblesView;
use crate::node::{Child, Node};
use crate::update::TrieCtx;

/// The payload lifted out of the source node.
struct SubtreePayload {
    mask: u16,
    value: Option<Box<[u8]>>,
    children: Vec<Child>,
}

/// Copies the subtree at `src` to `dest`, returning the new root. The
/// source subtree must be committed (its children must have disk offsets);
/// an uncommitted source cannot be referenced from two places.
pub fn copy_node(
    aux: &UpdateAux,
    io: &AsyncIo,
    mut root: Box<Node>,
    src: &[u8],
    dest: &[u8],
) -> Result<Box<Node>, DbError> {
    let ctx = TrieCtx { aux, io };
    let payload = {
        let src_node = find_mut(&ctx, &mut root, NibblesView::from_key(src))?
            .ok_or(DbError::NotFound)?;
        if src_node.children.iter().any(|c| !c.fnext.is_valid()) {
            return Err(DbError::InvalidArgument("copy of an uncommitted source subtree"));
        }
        let children = src_node
            .children
            .iter_mut()
            .map(|c| Child {
                fnext: c.fnext,
                min_offset: c.min_offset,
                data: c.data.clone(),
                // Ownership transfers; the source keeps the disk reference.
                next: c.next.take(),
            })
            .collect();
        SubtreePayload {
            mask: src_node.mask,
            value: src_node.value.clone(),
            children,
        }
    };
    graft(&ctx, Some(root), NibblesView::from_key(dest), payload)
        .map(|n| n.unwrap_or_else(|| unreachable!("graft never empties the trie")))
}

/// Resolves `key` to the node whose path ends exactly there, loading cold
/// nodes into the writer's tree along the way.
fn find_mut<'n>(
    ctx: &TrieCtx<'_>,
    node: &'n mut Node,
    key: NibblesView<'_>,
) -> Result<Option<&'n mut Node>, DbError> {
    let lcp = key.common_prefix_len(&node.path.view());
    if lcp < node.path.len() {
        return Ok(None);
    }
    if lcp == key.len() {
        return Ok(Some(node));
    }
    let branch = key.get(lcp);
    if !node.has_branch(branch) {
        return Ok(None);
    }
    let j = node.child_index(branch);
    if node.children[j].next.is_none() {
        let loaded = ctx.aux.load_node(ctx.io, node.children[j].fnext)?;
        node.children[j].next = Some(loaded);
    }
    let sub = node.children[j].next.as_mut().unwrap_or_else(|| unreachable!());
    find_mut(ctx, sub, key.substr(lcp + 1))
}

/// Inserts a node built from `payload` at `key`, splitting paths as needed.
/// An existing node at `key` has its value and subtree replaced wholesale.
fn graft(
    ctx: &TrieCtx<'_>,
    node: Option<Box<Node>>,
    key: NibblesView<'_>,
    payload: SubtreePayload,
) -> Result<Option<Box<Node>>, DbError> {
    let Some(mut node) = node else {
        let mut fresh = Node::new_branch(key.to_nibbles());
        install(&mut fresh, payload);
        return Ok(Some(fresh));
    };
    let path = node.path.clone();
    let lcp = key.common_prefix_len(&path.view());
    if lcp == path.len() {
        if lcp == key.len() {
            install(&mut node, payload);
            return Ok(Some(node));
        }
        let branch = key.get(lcp);
        let rest = key.substr(lcp + 1);
        if node.has_branch(branch) {
            let j = node.child_index(branch);
            if node.children[j].next.is_none() {
                let loaded = ctx.aux.load_node(ctx.io, node.children[j].fnext)?;
                node.children[j].next = Some(loaded);
            }
            let sub = node.children[j].next.take();
            let replaced = graft(ctx, sub, rest, payload)?;
            let child = &mut node.children[j];
            child.next = replaced;
            child.fnext = triedb_types::PackedOffset::INVALID;
            child.min_offset = u64::MAX;
            child.data = SmallVec::new();
        } else {
            let sub = graft(ctx, None, rest, payload)?;
            if let Some(sub) = sub {
                node.insert_child(branch, Child::from_node(sub));
            }
        }
        node.mark_dirty();
        return Ok(Some(node));
    }
    // Split the compressed path at the divergence and push this node down.
    let prefix = path.view().prefix(lcp).to_nibbles();
    let node_branch = path.view().get(lcp);
    node.path = path.view().substr(lcp + 1).to_nibbles();
    node.mark_dirty();
    let mut fork = Node::new_branch(prefix);
    fork.insert_child(node_branch, Child::from_node(node));
    if lcp == key.len() {
        install(&mut fork, payload);
    } else {
        let sub = graft(ctx, None, key.substr(lcp + 1), payload)?;
        if let Some(sub) = sub {
            fork.insert_child(key.get(lcp), Child::from_node(sub));
        }
    }
    fork.mark_dirty();
    Ok(Some(fork))
}

fn install(node: &mut Node, payload: SubtreePayload) {
    node.mask = payload.mask;
    node.value = payload.value;
    node.children = payload.children;
    node.mark_dirty();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aux::Stream;
    use crate::compute::Keccak256Compute;
    use crate::update::{apply_updates, commit_subtree, Update};
    use triedb_io::{
        make_buffers_for_segregated_read_write, StoragePool, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
    };

    fn writer() -> (AsyncIo, UpdateAux) {
        let pool = StoragePool::anonymous(8, 1 << 20).unwrap();
        let buffers =
            make_buffers_for_segregated_read_write(4, 4, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE);
        let io = AsyncIo::new(pool, buffers).unwrap();
        let mut aux = UpdateAux::new();
        aux.set_io(&io, 100).unwrap();
        (io, aux)
    }

    fn get(ctx: &TrieCtx<'_>, root: &mut Node, key: &[u8]) -> Option<Vec<u8>> {
        find_mut(ctx, root, NibblesView::from_key(key))
            .unwrap()
            .and_then(|n| n.leaf().map(<[u8]>::to_vec))
    }

    #[test]
    fn copy_subtree_reaches_both_keys() {
        let (io, mut aux) = writer();
        let compute = Keccak256Compute;
        let mut root = {
            let ctx = TrieCtx { aux: &aux, io: &io };
            apply_updates(
                &ctx,
                None,
                &[
                    Update::nested(
                        &b"src"[..],
                        Some(b"table".to_vec()),
                        0,
                        vec![
                            Update::insert(&b"/a"[..], &b"1"[..], 0),
                            Update::insert(&b"/b"[..], &b"2"[..], 0),
                        ],
                    ),
                    Update::insert(&b"zzz"[..], &b"3"[..], 0),
                ],
            )
            .unwrap()
            .unwrap()
        };
        commit_subtree(&mut aux, &io, &compute, &mut root, Stream::Fast, false, 0).unwrap();
        aux.flush_writers(&io).unwrap();

        let mut root = copy_node(&aux, &io, root, b"src", b"dst").unwrap();
        let ctx = TrieCtx { aux: &aux, io: &io };
        for (key, want) in [
            (&b"src"[..], &b"table"[..]),
            (b"src/a", b"1"),
            (b"src/b", b"2"),
            (b"dst", b"table"),
            (b"dst/a", b"1"),
            (b"dst/b", b"2"),
            (b"zzz", b"3"),
        ] {
            assert_eq!(get(&ctx, &mut root, key), Some(want.to_vec()), "key {key:?}");
        }
    }

    #[test]
    fn copy_missing_source_fails() {
        let (io, aux) = writer();
        let ctx = TrieCtx { aux: &aux, io: &io };
        let root = apply_updates(&ctx, None, &[Update::insert(&b"a"[..], &b"1"[..], 0)])
            .unwrap()
            .unwrap();
        let err = copy_node(&aux, &io, root, b"missing", b"dst").unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[test]
    fn copy_of_uncommitted_source_is_refused() {
        let (io, aux) = writer();
        let ctx = TrieCtx { aux: &aux, io: &io };
        let root = apply_updates(
            &ctx,
            None,
            &[Update::nested(
                &b"src"[..],
                Some(b"table".to_vec()),
                0,
                vec![
                    Update::insert(&b"/a"[..], &b"1"[..], 0),
                    Update::insert(&b"/b"[..], &b"2"[..], 0),
                ],
            )],
        )
        .unwrap()
        .unwrap();
        let err = copy_node(&aux, &io, root, b"src", b"dst").unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }
}
