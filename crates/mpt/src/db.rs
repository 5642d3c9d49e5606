//! The public database facade.
//!
//! A [`Db`] couples one [`AsyncIo`] (and therefore one owning thread) with
//! the writer's [`UpdateAux`] and the shared read context. Writes are
//! single-writer: an upsert merges a batch, commits the dirty subtree
//! through the chosen stream, waits for the bytes to land, and only then
//! publishes the new root offset, so a reader can never observe a version
//! whose bytes are not durable. Concurrent readers on other threads go
//! through [`DbReader`], which posts coalesced finds onto the io thread.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use triedb_io::{
    make_buffers_for_read_only, make_buffers_for_segregated_read_write, AsyncIo, IoHandle,
    PoolOptions, StoragePool, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
};
use triedb_types::{DbError, PackedOffset, Version, DEFAULT_CHUNK_CAPACITY, DEFAULT_HISTORY_LENGTH};

use crate::aux::{FailOnDirty, Stream, UpdateAux};
use crate::compute::{Compute, Keccak256Compute};
use crate::copy::copy_node;
use crate::find::{
    find_blocking, find_notify, load_node_blocking, FindCursorResult, FindResult, NodeCursor,
    ReadContext,
};
use crate::meta::DbMetadata;
use crate::nibbles::Nibbles;
use crate::node::{Node, EMPTY_HASH};
use crate::traverse::{traverse_blocking, Visitor};
use crate::update::{apply_updates, commit_subtree, TrieCtx, UpdateList};

/// Construction options for [`Db::open`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub paths: Vec<PathBuf>,
    pub chunk_capacity: u64,
    pub history_length: u64,
    pub read_only: bool,
    pub direct_io: bool,
    pub create: bool,
    pub read_buffers: usize,
    pub write_buffers: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            history_length: DEFAULT_HISTORY_LENGTH,
            read_only: false,
            direct_io: false,
            create: true,
            read_buffers: 8,
            write_buffers: 8,
        }
    }
}

/// A versioned Merkle-Patricia trie database over a storage pool.
pub struct Db {
    io: AsyncIo,
    aux: UpdateAux,
    ctx: Arc<ReadContext>,
    compute: Arc<dyn Compute>,
    /// The writer's live tree for the newest version, or `None` when the
    /// trie is empty or the db is read-only.
    root: Option<Box<Node>>,
    root_offset: PackedOffset,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database over the configured devices.
    pub fn open(cfg: DbConfig) -> Result<Self, DbError> {
        let opts = PoolOptions {
            chunk_capacity: cfg.chunk_capacity,
            direct_io: cfg.direct_io,
            create: cfg.create,
        };
        let pool = StoragePool::open(&cfg.paths, &opts)?;
        Self::from_pool(pool, &cfg)
    }

    /// A database over an unnamed auto-unlinked temporary file, for tests.
    pub fn open_anonymous(
        chunk_count: u32,
        chunk_capacity: u64,
        history_length: u64,
    ) -> Result<Self, DbError> {
        let pool = StoragePool::anonymous(chunk_count, chunk_capacity)?;
        let cfg = DbConfig { chunk_capacity, history_length, ..DbConfig::default() };
        Self::from_pool(pool, &cfg)
    }

    fn from_pool(pool: StoragePool, cfg: &DbConfig) -> Result<Self, DbError> {
        let (pool, buffers) = if cfg.read_only {
            (
                pool.clone_as_read_only(),
                make_buffers_for_read_only(cfg.read_buffers, READ_BUFFER_SIZE),
            )
        } else {
            (
                pool,
                make_buffers_for_segregated_read_write(
                    cfg.read_buffers,
                    cfg.write_buffers,
                    READ_BUFFER_SIZE,
                    WRITE_BUFFER_SIZE,
                ),
            )
        };
        let io = AsyncIo::new(pool, buffers)?;
        let mut aux = UpdateAux::new();
        if cfg.read_only {
            aux.set_io_read_only(&io, cfg.history_length, &mut FailOnDirty)?;
        } else {
            aux.set_io(&io, cfg.history_length)?;
        }
        let mut db = Self {
            io,
            aux,
            ctx: ReadContext::new(),
            compute: Arc::new(Keccak256Compute),
            root: None,
            root_offset: PackedOffset::INVALID,
        };
        if let Some(version) = db.aux.max_version() {
            let offset = db.aux.root_offset_for(version)?;
            db.root_offset = offset;
            if offset.is_valid() && !db.aux.is_read_only() {
                db.root = Some(db.aux.load_node(&db.io, offset)?);
            }
        }
        Ok(db)
    }

    /// Swaps the hashing strategy; only meaningful before the first upsert.
    pub fn with_compute(mut self, compute: Arc<dyn Compute>) -> Self {
        self.compute = compute;
        self
    }

    pub fn io(&self) -> &AsyncIo {
        &self.io
    }

    pub fn aux(&self) -> &UpdateAux {
        &self.aux
    }

    pub fn aux_mut(&mut self) -> &mut UpdateAux {
        &mut self.aux
    }

    /// Split borrow of the io and the writer state, for embedders (and test
    /// harnesses) that drive the aux directly.
    pub fn io_and_aux_mut(&mut self) -> (&AsyncIo, &mut UpdateAux) {
        (&self.io, &mut self.aux)
    }

    /// The newest version, if any upsert ever committed.
    pub fn get_latest_version(&self) -> Option<Version> {
        self.aux.max_version()
    }

    pub fn get_earliest_version(&self) -> Option<Version> {
        self.aux.min_version()
    }

    pub fn get_finalized_version(&self) -> Version {
        self.aux.latest_finalized_version()
    }

    /// Applies one ordered batch as `version`, which must be exactly one
    /// past the newest version (zero for the first commit); an upsert never
    /// skips a slot. Returns the new root hash (all zeroes for the empty
    /// trie).
    pub fn upsert(
        &mut self,
        updates: UpdateList,
        version: Version,
        write_to_fast: bool,
        compaction: bool,
    ) -> Result<[u8; 32], DbError> {
        if self.aux.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        if version != self.aux.max_version().map_or(0, |m| m + 1) {
            return Err(DbError::InvalidArgument("upsert version must advance by exactly one"));
        }
        self.aux.set_dirty(self.io.pool(), true)?;
        let root = {
            let ctx = TrieCtx { aux: &self.aux, io: &self.io };
            apply_updates(&ctx, self.root.take(), &updates)?
        };
        self.root = root;
        self.commit_version(version, write_to_fast, compaction)
    }

    /// Commits the writer's live tree as `version`: writes dirty nodes,
    /// waits for durability, then publishes the root offset and clears the
    /// dirty bit in one metadata update.
    fn commit_version(
        &mut self,
        version: Version,
        write_to_fast: bool,
        compaction: bool,
    ) -> Result<[u8; 32], DbError> {
        let stream = if write_to_fast { Stream::Fast } else { Stream::Slow };
        let threshold = if compaction { self.aux.compaction_threshold() } else { 0 };
        let (offset, min_virtual, hash) = match self.root.as_mut() {
            Some(root) => {
                if root.has_hash() && self.root_offset.is_valid() && !compaction {
                    // Nothing changed; the new version shares the old root.
                    (self.root_offset, None, root.hash)
                } else {
                    let (off, min) = commit_subtree(
                        &mut self.aux,
                        &self.io,
                        self.compute.as_ref(),
                        root,
                        stream,
                        compaction,
                        threshold,
                    )?;
                    (off, Some(min), root.hash)
                }
            }
            None => (PackedOffset::INVALID, None, EMPTY_HASH),
        };
        self.aux.flush_writers(&self.io)?;
        // The root's bytes must be durable before the version becomes
        // visible; metadata goes last.
        self.io.wait_until_done();
        let fast = self
            .aux
            .writer_offset(Stream::Fast)
            .ok_or(DbError::ReadOnly)?;
        let slow = self
            .aux
            .writer_offset(Stream::Slow)
            .ok_or(DbError::ReadOnly)?;
        let mut ring_result = Ok(());
        self.aux.modify_metadata(self.io.pool(), |m: &mut DbMetadata| {
            ring_result = m.root_ring.set(version, offset);
            m.wip_fast_offset = fast.pack(0);
            m.wip_slow_offset = slow.pack(0);
            m.is_dirty = false;
        })?;
        ring_result?;
        if let Some(min) = min_virtual {
            self.aux.note_root_min(version, min);
        }
        self.root_offset = offset;
        let recycled = self.aux.advance_version_window(&self.io)?;
        if recycled > 0 {
            // Chunk ids are being reused; offset-keyed cache entries from
            // the recycled range are no longer trustworthy.
            self.ctx.clear();
        }
        info!(target: "db", version, "version committed");
        Ok(hash)
    }

    /// Copies the committed subtree at `src` to `dest`, committing the
    /// result as `version` (which, like an upsert, must be exactly one past
    /// the newest version).
    pub fn copy_trie(
        &mut self,
        src: &[u8],
        dest: &[u8],
        version: Version,
        write_to_fast: bool,
    ) -> Result<[u8; 32], DbError> {
        if self.aux.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        if version != self.aux.max_version().map_or(0, |m| m + 1) {
            return Err(DbError::InvalidArgument("copy version must advance by exactly one"));
        }
        let root = match self.root.take() {
            Some(root) => root,
            None => {
                if !self.root_offset.is_valid() {
                    return Err(DbError::NotFound);
                }
                self.aux.load_node(&self.io, self.root_offset)?
            }
        };
        self.aux.set_dirty(self.io.pool(), true)?;
        let root = copy_node(&self.aux, &self.io, root, src, dest)?;
        self.root = Some(root);
        self.commit_version(version, write_to_fast, false)
    }

    fn resolve_root(&self, version: Version) -> Result<Option<NodeCursor>, DbError> {
        let offset = self.aux.root_offset_for(version)?;
        if !offset.is_valid() {
            return Ok(None);
        }
        let node = load_node_blocking(&self.ctx, &self.io, offset)?;
        Ok(Some(NodeCursor::at_start(node)))
    }

    /// The canonical read: resolves the version's root and matches `key`,
    /// returning the cursor where matching stopped and the exact find
    /// class.
    pub fn find(&self, key: &[u8], version: Version) -> Result<FindCursorResult, DbError> {
        let cursor = self.resolve_root(version)?;
        find_blocking(&self.ctx, &self.io, cursor, Nibbles::from_key(key))
    }

    /// Point lookup at a version.
    pub fn get(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, DbError> {
        let Some(cursor) = self.resolve_root(version)? else { return Ok(None) };
        let found = find_blocking(&self.ctx, &self.io, Some(cursor), Nibbles::from_key(key))?;
        Ok(found.value().map(<[u8]>::to_vec))
    }

    /// Raw leaf bytes at a version, exactly as stored.
    pub fn get_data(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, DbError> {
        let Some(cursor) = self.resolve_root(version)? else { return Ok(None) };
        let found = find_blocking(&self.ctx, &self.io, Some(cursor), Nibbles::from_key(key))?;
        match found.result {
            FindResult::Success => {
                Ok(found.cursor.and_then(|c| c.node.leaf().map(<[u8]>::to_vec)))
            }
            _ => Ok(None),
        }
    }

    /// The canonical 32-byte root of a version (zeroes for an empty trie).
    pub fn root_hash(&self, version: Version) -> Result<[u8; 32], DbError> {
        match self.resolve_root(version)? {
            Some(cursor) => Ok(cursor.node.hash),
            None => Ok(EMPTY_HASH),
        }
    }

    /// Depth-first walk of the subtree under `prefix` at `version`,
    /// emitting each leaf to `visitor`. `max_depth` bounds the descent in
    /// nibbles below the prefix.
    pub fn traverse(
        &self,
        prefix: &[u8],
        version: Version,
        visitor: &mut Visitor<'_>,
        max_depth: Option<usize>,
    ) -> Result<(), DbError> {
        let Some(cursor) = self.resolve_root(version)? else { return Ok(()) };
        let found =
            find_blocking(&self.ctx, &self.io, Some(cursor), Nibbles::from_key(prefix))?;
        match found.result {
            FindResult::Success | FindResult::KeyEndsEarlierThanNode => {}
            _ => return Ok(()),
        }
        let Some(cursor) = found.cursor else { return Ok(()) };
        traverse_blocking(
            &self.ctx,
            &self.io,
            cursor,
            Nibbles::from_key(prefix),
            max_depth,
            visitor,
        )
    }

    /// Loads the root cursor of a version.
    pub fn load_root_for_version(&self, version: Version) -> Result<Option<NodeCursor>, DbError> {
        self.resolve_root(version)
    }

    /// Renames version `from` to `to` (a later slot), filling any gap with
    /// the invalid offset. Used when consensus skips proposal slots.
    pub fn move_trie_version_forward(&mut self, from: Version, to: Version) -> Result<(), DbError> {
        if self.aux.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        if to <= from {
            return Err(DbError::InvalidArgument("target version must be ahead of source"));
        }
        let offset = self.aux.root_offset_for(from)?;
        let mut ring_result = Ok(());
        self.aux.modify_metadata(self.io.pool(), |m| {
            ring_result = m.root_ring.set(to, offset);
        })?;
        ring_result?;
        self.root_offset = offset;
        let recycled = self.aux.advance_version_window(&self.io)?;
        if recycled > 0 {
            self.ctx.clear();
        }
        Ok(())
    }

    /// Marks `version` as committed by consensus; cheap metadata update.
    pub fn update_finalized_version(&mut self, version: Version) -> Result<(), DbError> {
        if self.aux.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        self.aux
            .modify_metadata(self.io.pool(), |m| m.latest_finalized_version = version)
    }

    /// Runs posted reader tasks and dispatches ready completions once. A
    /// writer thread hosting concurrent [`DbReader`]s calls this in its
    /// idle loop.
    pub fn poll(&self) -> usize {
        self.io.poll_nonblocking()
    }

    /// A `Send + Clone` handle for concurrent point lookups from other
    /// threads.
    pub fn reader(&self) -> DbReader {
        DbReader {
            handle: self.io.handle(),
            ctx: self.ctx.clone(),
            meta: self.aux.metadata_handle(),
        }
    }
}

/// A cross-thread read handle. Lookups resolve the version under the shared
/// metadata lock, post a coalesced find onto the io-owning thread, and block
/// on the promise until the receiver completes it.
#[derive(Clone)]
pub struct DbReader {
    handle: IoHandle,
    ctx: Arc<ReadContext>,
    meta: Arc<RwLock<DbMetadata>>,
}

impl DbReader {
    pub fn get(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, DbError> {
        let offset = self.meta.read().root_ring.get(version)?;
        if !offset.is_valid() {
            return Ok(None);
        }
        let rx = find_notify(&self.handle, self.ctx.clone(), offset, Nibbles::from_key(key));
        let found = rx
            .recv()
            .map_err(|_| DbError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "io thread went away",
            )))??;
        Ok(found.value().map(<[u8]>::to_vec))
    }

    pub fn max_version(&self) -> Option<Version> {
        self.meta.read().root_ring.max_version()
    }

    pub fn min_version(&self) -> Option<Version> {
        self.meta.read().root_ring.min_version()
    }
}
