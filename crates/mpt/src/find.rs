//! Concurrent trie reads.
//!
//! Readers never walk the writer's in-memory tree: every read resolves a
//! version's root offset and deserializes records through a shared,
//! offset-keyed node cache. Concurrent requests for the same offset
//! coalesce in an inflight map: the first caller issues the read, later
//! callers append continuations, and the completion receiver installs the
//! node once and fires every continuation in order.
//!
//! Traversal itself only runs on the io-owning thread; a caller on any
//! other thread gets [`FindResult::NeedIoThread`] and reposts through an
//! [`triedb_io::IoHandle`], typically wrapped in a promise it then blocks
//! on (the fiber variant).

use std::sync::Arc;

use dashmap::DashMap;
use triedb_io::{AsyncIo, IoBytes, ReadReceiver};
use triedb_telemetry::io_metrics;
use triedb_types::{round_down_align, ChunkOffset, DbError, PackedOffset, DISK_PAGE_BITS};

use crate::nibbles::{get_nibble, Nibbles};
use crate::node::Node;
use crate::pages::read_len_for_spare;

/// Every observable outcome of a find. All four "not found" classes are
/// distinct so callers can tell "no such prefix" from "prefix exists but
/// the key stops inside a node".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Success,
    BranchNotExist,
    KeyMismatch,
    KeyEndsEarlierThanNode,
    RootNodeIsNull,
    /// Traversal was invoked off the io-owning thread; repost there.
    NeedIoThread,
}

/// A position inside a node's compressed path.
#[derive(Clone)]
pub struct NodeCursor {
    pub node: Arc<Node>,
    /// Nibble index into `node.path` where matching stopped.
    pub nibble_index: usize,
}

impl NodeCursor {
    pub fn at_start(node: Arc<Node>) -> Self {
        Self { node, nibble_index: 0 }
    }
}

/// The outcome delivered to a find continuation.
pub struct FindCursorResult {
    pub cursor: Option<NodeCursor>,
    pub result: FindResult,
}

impl FindCursorResult {
    fn miss(cursor: Option<NodeCursor>, result: FindResult) -> Self {
        Self { cursor, result }
    }

    /// The leaf value, when the find succeeded on a leaf.
    pub fn value(&self) -> Option<&[u8]> {
        if self.result != FindResult::Success {
            return None;
        }
        self.cursor.as_ref().and_then(|c| c.node.leaf())
    }
}

type LoadResult = Result<Arc<Node>, Arc<DbError>>;
type Continuation = Box<dyn FnOnce(&AsyncIo, LoadResult) + Send + Sync>;
type FindDone = Box<dyn FnOnce(&AsyncIo, Result<FindCursorResult, Arc<DbError>>) + Send + Sync>;

/// Shared read-side state: the deserialized-node cache and the inflight
/// map deduplicating concurrent reads of one offset.
#[derive(Default)]
pub struct ReadContext {
    cache: DashMap<u64, Arc<Node>>,
    inflights: DashMap<u64, Vec<Continuation>>,
}

impl ReadContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cached(&self, offset: PackedOffset) -> Option<Arc<Node>> {
        self.cache.get(&offset.raw()).map(|e| e.clone())
    }

    /// Drops cached nodes; readers re-load from disk afterwards.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Loads the node at `offset` through the cache, coalescing with any
/// inflight read of the same offset, then calls `cont` on the io thread.
pub fn load_node_async(
    ctx: &Arc<ReadContext>,
    io: &AsyncIo,
    offset: PackedOffset,
    cont: Continuation,
) {
    debug_assert!(io.is_owner());
    if let Some(node) = ctx.cached(offset) {
        cont(io, Ok(node));
        return;
    }
    use dashmap::mapref::entry::Entry;
    let issue_read = match ctx.inflights.entry(offset.raw()) {
        Entry::Occupied(mut e) => {
            io_metrics().inc_coalesced_reads();
            e.get_mut().push(cont);
            false
        }
        Entry::Vacant(e) => {
            e.insert(vec![cont]);
            true
        }
    };
    if issue_read {
        let co = offset.offset();
        let aligned = round_down_align::<DISK_PAGE_BITS>(u64::from(co.offset)) as u32;
        let mut len = read_len_for_spare(offset.spare(), io.read_buffer_size());
        len = len.min((io.chunk_capacity() - u64::from(aligned)) as usize);
        let receiver = NodeReadReceiver {
            ctx: ctx.clone(),
            offset,
            buffer_off: (co.offset - aligned) as usize,
        };
        io.read(ChunkOffset::new(co.id, aligned), len, Box::new(receiver));
    }
}

/// Deserializes the node once, installs it in the shared cache, and fires
/// every continuation pending on this offset in order.
struct NodeReadReceiver {
    ctx: Arc<ReadContext>,
    offset: PackedOffset,
    buffer_off: usize,
}

impl ReadReceiver for NodeReadReceiver {
    fn set_value(self: Box<Self>, io: &AsyncIo, res: std::io::Result<IoBytes>) {
        let outcome: LoadResult = match res {
            Ok(bytes) => match Node::deserialize(&bytes[self.buffer_off..], self.offset) {
                Ok(node) => {
                    let node: Arc<Node> = Arc::from(node);
                    self.ctx.cache.insert(self.offset.raw(), node.clone());
                    Ok(node)
                }
                Err(e) => Err(Arc::new(e)),
            },
            Err(e) => Err(Arc::new(DbError::Io(e))),
        };
        let Some((_, pendings)) = self.ctx.inflights.remove(&self.offset.raw()) else { return };
        for cont in pendings {
            cont(io, outcome.clone());
        }
    }
}

/// The iterative matcher. Walks as far as the cache allows, issues one
/// coalesced read when it hits a cold child, and re-enters itself as the
/// continuation.
pub fn find_async(
    ctx: &Arc<ReadContext>,
    io: &AsyncIo,
    start: Option<NodeCursor>,
    key: Nibbles,
    done: FindDone,
) {
    debug_assert!(io.is_owner());
    let Some(mut cursor) = start else {
        done(io, Ok(FindCursorResult::miss(None, FindResult::RootNodeIsNull)));
        return;
    };
    let mut key_index = 0usize;
    loop {
        let node = cursor.node.clone();
        let mut node_index = cursor.nibble_index;
        while node_index < node.path.len() {
            if key_index >= key.len() {
                done(
                    io,
                    Ok(FindCursorResult::miss(
                        Some(NodeCursor { node, nibble_index: node_index }),
                        FindResult::KeyEndsEarlierThanNode,
                    )),
                );
                return;
            }
            if key.get(key_index) != get_nibble(node.path.packed_bytes(), node_index) {
                done(
                    io,
                    Ok(FindCursorResult::miss(
                        Some(NodeCursor { node, nibble_index: node_index }),
                        FindResult::KeyMismatch,
                    )),
                );
                return;
            }
            key_index += 1;
            node_index += 1;
        }
        if key_index == key.len() {
            done(
                io,
                Ok(FindCursorResult {
                    cursor: Some(NodeCursor { node, nibble_index: node_index }),
                    result: FindResult::Success,
                }),
            );
            return;
        }
        let branch = key.get(key_index);
        let Some(child) = node.child(branch) else {
            done(
                io,
                Ok(FindCursorResult::miss(
                    Some(NodeCursor { node, nibble_index: node_index }),
                    FindResult::BranchNotExist,
                )),
            );
            return;
        };
        key_index += 1;
        let offset = child.fnext;
        if let Some(cached) = ctx.cached(offset) {
            cursor = NodeCursor::at_start(cached);
            continue;
        }
        // Cold child: coalesce the read and continue from the receiver.
        let remaining = {
            let mut rest = Nibbles::empty();
            for i in key_index..key.len() {
                rest.push(key.get(i));
            }
            rest
        };
        let ctx2 = ctx.clone();
        load_node_async(
            ctx,
            io,
            offset,
            Box::new(move |io, loaded| match loaded {
                Ok(node) => {
                    find_async(&ctx2, io, Some(NodeCursor::at_start(node)), remaining, done)
                }
                Err(e) => done(io, Err(e)),
            }),
        );
        return;
    }
}

/// Runs a find to completion on the io-owning thread, driving completions.
/// Off the owning thread this reports [`FindResult::NeedIoThread`] so the
/// caller can repost.
pub fn find_blocking(
    ctx: &Arc<ReadContext>,
    io: &AsyncIo,
    start: Option<NodeCursor>,
    key: Nibbles,
) -> Result<FindCursorResult, DbError> {
    if !io.is_owner() {
        return Ok(FindCursorResult::miss(None, FindResult::NeedIoThread));
    }
    let (tx, rx) = crossbeam_channel::bounded(1);
    find_async(
        ctx,
        io,
        start,
        key,
        Box::new(move |_io, res| {
            let _ = tx.send(res);
        }),
    );
    loop {
        if let Ok(res) = rx.try_recv() {
            return res.map_err(unwrap_shared);
        }
        if io.poll_blocking() == 0 && io.pending_ops() == 0 {
            if let Ok(res) = rx.try_recv() {
                return res.map_err(unwrap_shared);
            }
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "find completion lost",
            )));
        }
    }
}

/// Loads one node through the shared cache on the io thread, driving
/// completions until it arrives.
pub fn load_node_blocking(
    ctx: &Arc<ReadContext>,
    io: &AsyncIo,
    offset: PackedOffset,
) -> Result<Arc<Node>, DbError> {
    debug_assert!(io.is_owner());
    if let Some(node) = ctx.cached(offset) {
        return Ok(node);
    }
    let (tx, rx) = crossbeam_channel::bounded(1);
    load_node_async(
        ctx,
        io,
        offset,
        Box::new(move |_io, res| {
            let _ = tx.send(res);
        }),
    );
    loop {
        if let Ok(res) = rx.try_recv() {
            return res.map_err(unwrap_shared);
        }
        if io.poll_blocking() == 0 && io.pending_ops() == 0 {
            if let Ok(res) = rx.try_recv() {
                return res.map_err(unwrap_shared);
            }
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "load completion lost",
            )));
        }
    }
}

/// The fiber-style variant: posts the find onto the io thread and returns a
/// promise the calling thread (or fiber) blocks on.
pub fn find_notify(
    handle: &triedb_io::IoHandle,
    ctx: Arc<ReadContext>,
    root_offset: PackedOffset,
    key: Nibbles,
) -> crossbeam_channel::Receiver<Result<FindCursorResult, DbError>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    handle.post(move |io| {
        let tx2 = tx.clone();
        let finish: FindDone = Box::new(move |_io, res| {
            let _ = tx2.send(res.map_err(unwrap_shared));
        });
        if !root_offset.is_valid() {
            finish(io, Ok(FindCursorResult::miss(None, FindResult::RootNodeIsNull)));
            return;
        }
        let ctx2 = ctx.clone();
        load_node_async(
            &ctx,
            io,
            root_offset,
            Box::new(move |io, loaded| match loaded {
                Ok(node) => {
                    find_async(&ctx2, io, Some(NodeCursor::at_start(node)), key, finish)
                }
                Err(e) => finish(io, Err(e)),
            }),
        );
    });
    rx
}

pub(crate) fn unwrap_shared(e: Arc<DbError>) -> DbError {
    Arc::try_unwrap(e).unwrap_or_else(|shared| match &*shared {
        DbError::NotFound => DbError::NotFound,
        DbError::VersionExpired(v) => DbError::VersionExpired(*v),
        DbError::CorruptNode(at) => DbError::CorruptNode(*at),
        DbError::CorruptMetadata(msg) => DbError::CorruptMetadata(msg),
        DbError::Io(e) => DbError::Io(std::io::Error::new(e.kind(), e.to_string())),
        DbError::ReadOnly => DbError::ReadOnly,
        DbError::OutOfSpace => DbError::OutOfSpace,
        DbError::InvalidArgument(msg) => DbError::InvalidArgument(msg),
    })
}
