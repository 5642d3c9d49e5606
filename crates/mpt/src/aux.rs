//! The single writer's aggregate state.
//!
//! [`UpdateAux`] owns everything a writer mutates: the metadata image and
//! its shared/exclusive locking discipline, the two node writers, the root
//! offset ring, the history window, and the dirty-bit transaction guard.
//! Binding an io instance (`set_io`) runs crash recovery; a read-only bind
//! refuses a dirty database unless its observer can get the bit cleared.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{info, warn};
use triedb_io::{AsyncIo, ChunkKind, StoragePool};
use triedb_telemetry::storage_metrics;
use triedb_types::{
    round_down_align, round_up_align, ChunkOffset, DbError, PackedOffset, Version,
    DISK_PAGE_BITS, ROOT_OFFSET_RING_CAPACITY,
};

use crate::meta::{self, ChunkListState, DbMetadata};
use crate::node::Node;
use crate::pages::read_len_for_spare;
use crate::writer::NodeWriter;

/// Which append stream a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Fast,
    Slow,
}

impl Stream {
    fn list_state(self) -> ChunkListState {
        match self {
            Stream::Fast => ChunkListState::Fast,
            Stream::Slow => ChunkListState::Slow,
        }
    }

    fn chunk_kind(self) -> ChunkKind {
        match self {
            Stream::Fast => ChunkKind::Seq,
            Stream::Slow => ChunkKind::Slow,
        }
    }
}

/// Hook invoked when a read-only aux binds while the writer's dirty bit is
/// set. The default refuses the open; an embedder that can wait for its
/// writer overrides this.
pub trait DirtyBitObserver {
    fn on_read_only_init_with_dirty_bit(&mut self) -> Result<(), DbError> {
        Err(DbError::CorruptMetadata("read-only open while the writer is mid-transaction"))
    }
}

/// The default observer: a dirty database is not safe to read.
pub struct FailOnDirty;

impl DirtyBitObserver for FailOnDirty {}

/// Writer-owned state; see the module docs.
pub struct UpdateAux {
    meta: Arc<RwLock<DbMetadata>>,
    history_len: u64,
    read_only: bool,
    bound: bool,
    pub node_writer_fast: Option<NodeWriter>,
    pub node_writer_slow: Option<NodeWriter>,
    /// Minimum virtual offset reachable from each live root, filled as
    /// versions commit and lazily for reopened histories.
    root_mins: HashMap<Version, u64>,
}

impl Default for UpdateAux {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateAux {
    pub fn new() -> Self {
        Self {
            meta: Arc::new(RwLock::new(DbMetadata::new(0, 0))),
            history_len: 0,
            read_only: false,
            bound: false,
            node_writer_fast: None,
            node_writer_slow: None,
            root_mins: HashMap::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn history_len(&self) -> u64 {
        self.history_len
    }

    /// Shared-lock view of the metadata.
    pub fn db_metadata(&self) -> RwLockReadGuard<'_, DbMetadata> {
        self.meta.read()
    }

    /// The metadata handle shared with concurrent readers.
    pub fn metadata_handle(&self) -> Arc<RwLock<DbMetadata>> {
        self.meta.clone()
    }

    /// Binds a writer io: loads or initializes metadata, replays recovery if
    /// the dirty bit is set, and positions both node writers.
    pub fn set_io(&mut self, io: &AsyncIo, history_len: u64) -> Result<(), DbError> {
        if self.bound {
            return Err(DbError::InvalidArgument("aux already bound to an io"));
        }
        if history_len == 0 || history_len as usize > ROOT_OFFSET_RING_CAPACITY {
            return Err(DbError::InvalidArgument("history length outside the root ring capacity"));
        }
        let pool = io.pool();
        if pool.is_read_only() {
            return Err(DbError::InvalidArgument("writer bind on a read-only pool"));
        }
        self.history_len = history_len;
        match meta::load(pool)? {
            None => {
                let mut m = DbMetadata::new(pool.chunk_count(), pool.chunk_capacity());
                let fast = m.pop_free().ok_or(DbError::OutOfSpace)?;
                m.append_to_list(ChunkListState::Fast, fast);
                let slow = m.pop_free().ok_or(DbError::OutOfSpace)?;
                m.append_to_list(ChunkListState::Slow, slow);
                m.wip_fast_offset = ChunkOffset::new(fast, 0).pack(0);
                m.wip_slow_offset = ChunkOffset::new(slow, 0).pack(0);
                meta::store(pool, &m)?;
                pool.mark_active(ChunkKind::Seq, fast);
                pool.mark_active(ChunkKind::Slow, slow);
                info!(target: "aux", chunks = m.chunk_count, "initialized fresh database");
                self.meta = Arc::new(RwLock::new(m));
            }
            Some(m) => {
                if m.chunk_count != pool.chunk_count() || m.chunk_capacity != pool.chunk_capacity()
                {
                    return Err(DbError::CorruptMetadata("metadata does not match pool geometry"));
                }
                for (id, _) in m.list_ids(ChunkListState::Fast) {
                    pool.mark_active(ChunkKind::Seq, id);
                }
                for (id, _) in m.list_ids(ChunkListState::Slow) {
                    pool.mark_active(ChunkKind::Slow, id);
                }
                let was_dirty = m.is_dirty;
                self.meta = Arc::new(RwLock::new(m));
                if was_dirty {
                    warn!(target: "recovery", "dirty bit set on open, rewinding to last durable root");
                    self.rewind_to_match_offsets(io)?;
                    self.modify_metadata(pool, |m| m.is_dirty = false)?;
                }
            }
        }
        let (fast, slow) = {
            let m = self.meta.read();
            (m.wip_fast_offset, m.wip_slow_offset)
        };
        if !fast.is_valid() || !slow.is_valid() {
            return Err(DbError::CorruptMetadata("work-in-progress cursors missing"));
        }
        self.node_writer_fast = Some(NodeWriter::new(page_align_up(fast.offset())));
        self.node_writer_slow = Some(NodeWriter::new(page_align_up(slow.offset())));
        self.bound = true;
        Ok(())
    }

    /// Binds a read-only aux. If the dirty bit is set at bind time the
    /// observer decides; the default refuses with a corruption error unless
    /// the writer concurrently cleared the bit.
    pub fn set_io_read_only(
        &mut self,
        io: &AsyncIo,
        history_len: u64,
        observer: &mut dyn DirtyBitObserver,
    ) -> Result<(), DbError> {
        if self.bound {
            return Err(DbError::InvalidArgument("aux already bound to an io"));
        }
        let pool = io.pool();
        let m = meta::load(pool)?
            .ok_or(DbError::CorruptMetadata("read-only open of an uninitialized pool"))?;
        let m = if m.is_dirty {
            observer.on_read_only_init_with_dirty_bit()?;
            let again = meta::load(pool)?
                .ok_or(DbError::CorruptMetadata("metadata vanished during read-only open"))?;
            if again.is_dirty {
                return Err(DbError::CorruptMetadata(
                    "writer still mid-transaction after dirty-bit observation",
                ));
            }
            again
        } else {
            m
        };
        self.history_len = history_len;
        self.meta = Arc::new(RwLock::new(m));
        self.read_only = true;
        self.bound = true;
        Ok(())
    }

    /// Shares a writer's live metadata image for an in-process reader.
    pub fn share_for_read(&self) -> UpdateAux {
        UpdateAux {
            meta: self.meta.clone(),
            history_len: self.history_len,
            read_only: true,
            bound: self.bound,
            node_writer_fast: None,
            node_writer_slow: None,
            root_mins: HashMap::new(),
        }
    }

    pub fn unset_io(&mut self) {
        self.bound = false;
        self.node_writer_fast = None;
        self.node_writer_slow = None;
    }

    /// Applies `f` under the exclusive lock, bumps the generation and
    /// persists the image double-buffered.
    pub fn modify_metadata(
        &self,
        pool: &StoragePool,
        f: impl FnOnce(&mut DbMetadata),
    ) -> Result<(), DbError> {
        debug_assert!(!self.read_only, "metadata mutation through a read-only aux");
        let mut guard = self.meta.write();
        f(&mut guard);
        guard.generation += 1;
        meta::store(pool, &guard)
    }

    // --- root offset ring ---

    pub fn max_version(&self) -> Option<Version> {
        self.meta.read().root_ring.max_version()
    }

    pub fn min_version(&self) -> Option<Version> {
        self.meta.read().root_ring.min_version()
    }

    pub fn root_offset_for(&self, version: Version) -> Result<PackedOffset, DbError> {
        self.meta.read().root_ring.get(version)
    }

    /// Records a new root at `max_version() + 1` and returns that version.
    pub fn append_root_offset(
        &mut self,
        pool: &StoragePool,
        offset: PackedOffset,
    ) -> Result<Version, DbError> {
        let mut version = 0;
        self.modify_metadata(pool, |m| {
            version = m.root_ring.append(offset);
        })?;
        Ok(version)
    }

    /// Moves the committed-up-to markers used by recovery.
    pub fn advance_db_offsets_to(
        &mut self,
        pool: &StoragePool,
        fast: ChunkOffset,
        slow: ChunkOffset,
    ) -> Result<(), DbError> {
        self.modify_metadata(pool, |m| {
            m.wip_fast_offset = fast.pack(0);
            m.wip_slow_offset = slow.pack(0);
        })
    }

    pub fn get_start_of_wip_fast_offset(&self) -> ChunkOffset {
        self.meta.read().wip_fast_offset.offset()
    }

    pub fn get_start_of_wip_slow_offset(&self) -> ChunkOffset {
        self.meta.read().wip_slow_offset.offset()
    }

    pub fn fast_list_ids(&self) -> Vec<(u32, u64)> {
        self.meta.read().list_ids(ChunkListState::Fast)
    }

    pub fn slow_list_ids(&self) -> Vec<(u32, u64)> {
        self.meta.read().list_ids(ChunkListState::Slow)
    }

    pub fn set_dirty(&mut self, pool: &StoragePool, dirty: bool) -> Result<(), DbError> {
        self.modify_metadata(pool, |m| m.is_dirty = dirty)
    }

    pub fn latest_finalized_version(&self) -> Version {
        self.meta.read().latest_finalized_version
    }

    /// On crash, truncates root offsets whose write-stream suffix never
    /// became durable. At most one version can be mid-flight; if even the
    /// root below it contradicts the recorded cursors the database is not
    /// recoverable.
    pub fn rewind_to_match_offsets(&mut self, io: &AsyncIo) -> Result<(), DbError> {
        let pool = io.pool();
        let mut popped = false;
        loop {
            let last = self.meta.read().root_ring.last();
            let Some((version, offset)) = last else { break };
            if !offset.is_valid() || self.root_is_durable(offset) {
                break;
            }
            if popped {
                return Err(DbError::CorruptMetadata(
                    "penultimate root also exceeds the durable write cursors",
                ));
            }
            warn!(target: "recovery", version, "discarding root that never durably materialized");
            self.modify_metadata(pool, |m| m.root_ring.pop_back())?;
            popped = true;
        }
        if popped {
            // Trim the cursors to the end of the newest surviving root.
            if let Some((_, offset)) = self.meta.read().root_ring.last() {
                if offset.is_valid() {
                    let end = self.record_end(io, offset)?;
                    let stream = self.stream_of_chunk(offset.offset().id)?;
                    self.modify_metadata(pool, |m| match stream {
                        Stream::Fast => m.wip_fast_offset = end.pack(0),
                        Stream::Slow => m.wip_slow_offset = end.pack(0),
                    })?;
                }
            }
        }
        Ok(())
    }

    fn stream_of_chunk(&self, id: u32) -> Result<Stream, DbError> {
        match self.meta.read().at(id).state {
            ChunkListState::Fast => Ok(Stream::Fast),
            ChunkListState::Slow => Ok(Stream::Slow),
            ChunkListState::Free => {
                Err(DbError::CorruptMetadata("live root offset points into a free chunk"))
            }
        }
    }

    /// Whether the record at `offset` landed before the recorded cursor of
    /// its stream.
    fn root_is_durable(&self, offset: PackedOffset) -> bool {
        let m = self.meta.read();
        let co = offset.offset();
        let wip = match m.at(co.id).state {
            ChunkListState::Fast => m.wip_fast_offset,
            ChunkListState::Slow => m.wip_slow_offset,
            ChunkListState::Free => return false,
        };
        if !wip.is_valid() {
            return false;
        }
        m.virtual_offset(co) < m.virtual_offset(wip.offset())
    }

    /// Byte offset one past a record, page aligned, for cursor trimming.
    fn record_end(&self, io: &AsyncIo, offset: PackedOffset) -> Result<ChunkOffset, DbError> {
        let node = self.load_node(io, offset)?;
        let co = offset.offset();
        let end = u64::from(co.offset) + u64::from(node.disk_size);
        Ok(ChunkOffset::new(co.id, round_up_align::<DISK_PAGE_BITS>(end) as u32))
    }

    // --- node i/o ---

    /// Reads and deserializes one node record.
    pub fn load_node(&self, io: &AsyncIo, offset: PackedOffset) -> Result<Box<Node>, DbError> {
        debug_assert!(offset.is_valid());
        let co = offset.offset();
        let aligned = round_down_align::<DISK_PAGE_BITS>(u64::from(co.offset)) as u32;
        let capacity = io.chunk_capacity();
        let mut len = read_len_for_spare(offset.spare(), io.read_buffer_size());
        len = len.min((capacity - u64::from(aligned)) as usize);
        let bytes = io.read_blocking(ChunkOffset::new(co.id, aligned), len)?;
        Node::deserialize(&bytes[(co.offset - aligned) as usize..], offset)
    }

    /// Appends a serialized record to a stream, sealing and advancing the
    /// chunk chain when the record does not fit. Returns where it landed.
    pub fn write_node_bytes(
        &mut self,
        io: &AsyncIo,
        stream: Stream,
        bytes: &[u8],
    ) -> Result<ChunkOffset, DbError> {
        let capacity = io.chunk_capacity();
        let mut writer = self.take_writer(stream)?;
        let result = (|| {
            if !writer.fits(bytes.len(), capacity) {
                writer.seal(io)?;
                let id = self.activate_next_chunk(io.pool(), stream)?;
                writer.restart_at(ChunkOffset::new(id, 0));
            }
            let at = writer.append(bytes);
            if writer.wants_flush() {
                writer.flush(io)?;
            }
            storage_metrics().inc_nodes_written(1);
            storage_metrics().inc_bytes_written_total(bytes.len() as u64);
            Ok(at)
        })();
        self.put_writer(stream, writer);
        result
    }

    /// Retires the stream's writer at its current chunk and starts a new one
    /// at the head of a fresh chunk, recording the transition in metadata.
    pub fn replace_node_writer(&mut self, io: &AsyncIo, stream: Stream) -> Result<(), DbError> {
        let mut writer = self.take_writer(stream)?;
        let result = (|| {
            writer.seal(io)?;
            let id = self.activate_next_chunk(io.pool(), stream)?;
            writer.restart_at(ChunkOffset::new(id, 0));
            Ok(())
        })();
        self.put_writer(stream, writer);
        result
    }

    pub fn flush_writers(&mut self, io: &AsyncIo) -> Result<(), DbError> {
        if let Some(w) = self.node_writer_fast.as_mut() {
            w.flush(io)?;
        }
        if let Some(w) = self.node_writer_slow.as_mut() {
            w.flush(io)?;
        }
        Ok(())
    }

    pub fn writer_offset(&self, stream: Stream) -> Option<ChunkOffset> {
        match stream {
            Stream::Fast => self.node_writer_fast.as_ref().map(NodeWriter::offset),
            Stream::Slow => self.node_writer_slow.as_ref().map(NodeWriter::offset),
        }
    }

    fn take_writer(&mut self, stream: Stream) -> Result<NodeWriter, DbError> {
        let slot = match stream {
            Stream::Fast => &mut self.node_writer_fast,
            Stream::Slow => &mut self.node_writer_slow,
        };
        slot.take().ok_or(DbError::ReadOnly)
    }

    fn put_writer(&mut self, stream: Stream, writer: NodeWriter) {
        let slot = match stream {
            Stream::Fast => &mut self.node_writer_fast,
            Stream::Slow => &mut self.node_writer_slow,
        };
        *slot = Some(writer);
    }

    fn activate_next_chunk(&self, pool: &StoragePool, stream: Stream) -> Result<u32, DbError> {
        let mut picked = None;
        self.modify_metadata(pool, |m| {
            if let Some(id) = m.pop_free() {
                m.append_to_list(stream.list_state(), id);
                picked = Some(id);
            }
        })?;
        let id = picked.ok_or(DbError::OutOfSpace)?;
        pool.mark_active(stream.chunk_kind(), id);
        Ok(id)
    }

    // --- versioning, expiration, chunk recycling ---

    pub fn note_root_min(&mut self, version: Version, min_virtual: u64) {
        self.root_mins.insert(version, min_virtual);
    }

    /// Minimum virtual offset reachable from the live root at `version`,
    /// loading the root record if this aux has not seen it commit.
    fn root_min_virtual(&mut self, io: &AsyncIo, version: Version) -> Result<u64, DbError> {
        if let Some(&v) = self.root_mins.get(&version) {
            return Ok(v);
        }
        let offset = self.meta.read().root_ring.get(version)?;
        let min = if offset.is_valid() {
            let node = self.load_node(io, offset)?;
            let own = self.meta.read().virtual_offset(offset.offset());
            node.children.iter().map(|c| c.min_offset).fold(own, u64::min)
        } else {
            u64::MAX
        };
        self.root_mins.insert(version, min);
        Ok(min)
    }

    /// The compaction threshold: where the oldest live root's own record
    /// sits. References colder than every retained root belong to long-idle
    /// subtrees; a compacting upsert copies them forward when it touches
    /// their ancestors.
    pub fn compaction_threshold(&self) -> u64 {
        let m = self.meta.read();
        let Some(min_v) = m.root_ring.min_version() else { return 0 };
        match m.root_ring.get(min_v) {
            Ok(offset) if offset.is_valid() => m.virtual_offset(offset.offset()),
            _ => 0,
        }
    }

    /// The virtual offset below which no live version references anything;
    /// chunk recycling frees everything older.
    pub fn live_min_virtual(&mut self, io: &AsyncIo) -> Result<u64, DbError> {
        let (min, max) = {
            let m = self.meta.read();
            match (m.root_ring.min_version(), m.root_ring.max_version()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Ok(0),
            }
        };
        let mut live_min = u64::MAX;
        for v in min..=max {
            live_min = live_min.min(self.root_min_virtual(io, v)?);
        }
        Ok(live_min)
    }

    /// Expires versions beyond the history window and returns any chunk
    /// every live version has moved past to the free list. Returns how many
    /// chunks were recycled so the caller can drop stale reader caches.
    pub fn advance_version_window(&mut self, io: &AsyncIo) -> Result<usize, DbError> {
        let pool = io.pool();
        let (len, min_version) = {
            let m = self.meta.read();
            (m.root_ring.len() as u64, m.root_ring.min_version())
        };
        if len > self.history_len {
            let excess = (len - self.history_len) as usize;
            self.modify_metadata(pool, |m| m.root_ring.evict_front(excess))?;
            if let Some(min) = min_version {
                for v in min..min + excess as u64 {
                    self.root_mins.remove(&v);
                }
            }
            storage_metrics().inc_versions_expired(excess as u64);
        }
        storage_metrics().set_retained_versions(self.meta.read().root_ring.len() as u64);
        if self.meta.read().root_ring.is_empty() {
            return Ok(0);
        }
        let live_min = self.live_min_virtual(io)?;
        let mut recycled = 0;
        for stream in [Stream::Fast, Stream::Slow] {
            loop {
                let head = {
                    let m = self.meta.read();
                    m.list_ids(stream.list_state()).first().copied()
                };
                let Some((id, _)) = head else { break };
                // Never recycle the chunk a writer is parked on.
                if self.writer_offset(stream).map(|c| c.id) == Some(id) {
                    break;
                }
                if self.meta.read().chunk_end_virtual(id) > live_min {
                    break;
                }
                self.modify_metadata(pool, |m| {
                    m.recycle_list_head(stream.list_state());
                })?;
                pool.deactivate_chunk(id);
                recycled += 1;
                storage_metrics().inc_chunks_recycled(1);
                info!(target: "aux", chunk = id, ?stream, "chunk recycled");
            }
        }
        Ok(recycled)
    }
}

fn page_align_up(co: ChunkOffset) -> ChunkOffset {
    ChunkOffset::new(co.id, round_up_align::<DISK_PAGE_BITS>(u64::from(co.offset)) as u32)
}
