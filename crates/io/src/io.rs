//! The async i/o engine.
//!
//! An [`AsyncIo`] instance is owned by exactly one thread, enforced at
//! runtime by a thread-id check; constructing a second instance on the same
//! thread is refused. Reads and writes go to segregated rings with their own
//! buffer pools. Completions are delivered by the owning thread from a flat
//! dispatch loop: a receiver that initiates more i/o only enqueues work, it
//! never grows the stack.
//!
//! A write-back cache fronts the read path so bytes that are in flight or
//! recently written are served without touching the device.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;
use triedb_telemetry::io_metrics;
use triedb_types::ChunkOffset;

use crate::buffers::{BufferPool, Buffers, PooledBuf};
use crate::pool::StoragePool;
use crate::ring::{delay_sqe, Cqe, Ring, Sqe};

/// Upper bound on completed write extents retained by the write-back cache.
const WRITEBACK_CACHE_BYTES: usize = 32 * 1024 * 1024;

thread_local! {
    static OWNS_IO: Cell<bool> = const { Cell::new(false) };
}

/// Bytes delivered to a read receiver: either a pool buffer fresh off the
/// device or a slice assembled from the write-back cache.
pub enum IoBytes {
    Pooled { buf: PooledBuf, len: usize },
    Cached { data: Arc<Vec<u8>> },
}

impl std::ops::Deref for IoBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            IoBytes::Pooled { buf, len } => &buf[..*len],
            IoBytes::Cached { data } => data,
        }
    }
}

/// Completion callback of a read. Invoked exactly once, on the owning
/// thread.
pub trait ReadReceiver {
    fn set_value(self: Box<Self>, io: &AsyncIo, res: io::Result<IoBytes>);
}

/// Completion callback of a write.
pub trait WriteReceiver {
    fn set_value(self: Box<Self>, io: &AsyncIo, res: io::Result<usize>);
}

/// Completion callback of a no-op or timed delay.
pub trait NopReceiver {
    fn set_value(self: Box<Self>, io: &AsyncIo);
}

/// Adapts a closure into a [`NopReceiver`].
pub struct NopFn<F>(pub F);

impl<F: FnOnce(&AsyncIo)> NopReceiver for NopFn<F> {
    fn set_value(self: Box<Self>, io: &AsyncIo) {
        (self.0)(io)
    }
}

type InjectedFn = Box<dyn FnOnce(&AsyncIo) + Send>;

enum Pending {
    Read { recv: Box<dyn ReadReceiver>, pool: Arc<BufferPool> },
    Write { recv: Option<Box<dyn WriteReceiver>>, pool: Arc<BufferPool> },
    Nop { recv: Box<dyn NopReceiver> },
}

enum Ready {
    Read { recv: Box<dyn ReadReceiver>, res: io::Result<IoBytes> },
    Write { recv: Box<dyn WriteReceiver>, res: io::Result<usize> },
    Nop { recv: Box<dyn NopReceiver> },
}

struct CacheExtent {
    data: Arc<Vec<u8>>,
    len: usize,
    inflight: bool,
}

#[derive(Default)]
struct WritebackCache {
    extents: HashMap<u32, BTreeMap<u32, CacheExtent>>,
    tokens: HashMap<u64, (u32, u32)>,
    order: VecDeque<(u32, u32)>,
    bytes: usize,
}

impl WritebackCache {
    fn insert(&mut self, token: u64, chunk: u32, start: u32, data: Arc<Vec<u8>>) {
        let len = data.len();
        let map = self.extents.entry(chunk).or_default();
        // Truncate a preceding extent that overlaps the new write.
        if let Some((&ps, prev)) = map.range_mut(..=start).next_back() {
            if ps + prev.len as u32 > start {
                let keep = (start - ps) as usize;
                self.bytes -= prev.len - keep;
                prev.len = keep;
                if keep == 0 {
                    map.remove(&ps);
                }
            }
        }
        // Drop stale extents now rewritten.
        let end = start + len as u32;
        let stale: Vec<u32> = map.range(start..end).map(|(&k, _)| k).collect();
        for k in stale {
            if let Some(e) = map.remove(&k) {
                self.bytes -= e.len;
            }
        }
        map.insert(start, CacheExtent { data, len, inflight: true });
        self.tokens.insert(token, (chunk, start));
        self.bytes += len;
    }

    fn complete(&mut self, token: u64) {
        if let Some((chunk, start)) = self.tokens.remove(&token) {
            if let Some(e) = self.extents.get_mut(&chunk).and_then(|m| m.get_mut(&start)) {
                e.inflight = false;
                self.order.push_back((chunk, start));
            }
        }
        while self.bytes > WRITEBACK_CACHE_BYTES {
            let Some((chunk, start)) = self.order.pop_front() else { break };
            if let Some(map) = self.extents.get_mut(&chunk) {
                // Skip entries replaced or re-marked since queued.
                if map.get(&start).is_some_and(|e| !e.inflight) {
                    if let Some(e) = map.remove(&start) {
                        self.bytes -= e.len;
                    }
                }
            }
        }
    }

    /// Assembles `len` bytes starting at `(chunk, start)` if the cache fully
    /// covers the range.
    fn covered(&self, chunk: u32, start: u32, len: usize) -> Option<Vec<u8>> {
        let map = self.extents.get(&chunk)?;
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        let end = start + len as u32;
        while pos < end {
            let (&es, e) = map.range(..=pos).next_back()?;
            let e_end = es + e.len as u32;
            if e_end <= pos {
                return None;
            }
            let from = (pos - es) as usize;
            let to = e.len.min((end - es) as usize);
            out.extend_from_slice(&e.data[from..to]);
            pos = es + to as u32;
        }
        Some(out)
    }

    fn overlaps_inflight(&self, chunk: u32, start: u32, len: usize) -> bool {
        let Some(map) = self.extents.get(&chunk) else { return false };
        let end = start + len as u32;
        map.iter().any(|(&es, e)| e.inflight && es < end && es + e.len as u32 > start)
    }
}

/// A cloneable, `Send` handle used to post work onto the owning thread.
#[derive(Clone)]
pub struct IoHandle {
    injected: Sender<InjectedFn>,
    owner: ThreadId,
}

impl IoHandle {
    /// Enqueues `f` to run on the io-owning thread at its next poll.
    pub fn post(&self, f: impl FnOnce(&AsyncIo) + Send + 'static) {
        let _ = self.injected.send(Box::new(f));
    }

    pub fn owning_thread_id(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// The single-owner async i/o engine over a storage pool.
pub struct AsyncIo {
    pool: StoragePool,
    buffers: Buffers,
    read_ring: Ring,
    write_ring: Ring,
    owner: ThreadId,
    next_token: Cell<u64>,
    inflight: Cell<usize>,
    pending: RefCell<HashMap<u64, Pending>>,
    ready: RefCell<VecDeque<Ready>>,
    writeback: RefCell<WritebackCache>,
    within_completions: Cell<u32>,
    injected_tx: Sender<InjectedFn>,
    injected_rx: Receiver<InjectedFn>,
}

impl std::fmt::Debug for AsyncIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncIo").finish_non_exhaustive()
    }
}

impl AsyncIo {
    /// Binds a pool and buffer set to the calling thread. Fails if this
    /// thread already owns an `AsyncIo`.
    pub fn new(pool: StoragePool, buffers: Buffers) -> io::Result<Self> {
        let already = OWNS_IO.with(|c| c.replace(true));
        if already {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "an AsyncIo already owns this thread",
            ));
        }
        let (injected_tx, injected_rx) = unbounded();
        Ok(Self {
            pool,
            buffers,
            read_ring: Ring::new("read", 128),
            write_ring: Ring::new("write", 128),
            owner: thread::current().id(),
            next_token: Cell::new(1),
            inflight: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            writeback: RefCell::new(WritebackCache::default()),
            within_completions: Cell::new(0),
            injected_tx,
            injected_rx,
        })
    }

    pub fn pool(&self) -> &StoragePool {
        &self.pool
    }

    pub fn chunk_capacity(&self) -> u64 {
        self.pool.chunk_capacity()
    }

    pub fn owning_thread_id(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn handle(&self) -> IoHandle {
        IoHandle { injected: self.injected_tx.clone(), owner: self.owner }
    }

    pub fn read_buffer_size(&self) -> usize {
        self.buffers.read.buf_size()
    }

    /// Operations submitted to the rings that have not completed yet.
    pub fn pending_ops(&self) -> usize {
        self.inflight.get()
    }

    fn assert_owner(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "AsyncIo used off its owning thread"
        );
    }

    fn token(&self) -> u64 {
        let t = self.next_token.get();
        self.next_token.set(t + 1);
        t
    }

    /// Initiates a read of `len` bytes at `offset`. The receiver is invoked
    /// exactly once on the owning thread. If the write-back cache covers the
    /// range, no device i/o is issued.
    pub fn read(&self, offset: ChunkOffset, len: usize, recv: Box<dyn ReadReceiver>) {
        self.assert_owner();
        assert!(len > 0 && len <= self.buffers.read.buf_size(), "read larger than a read buffer");
        if let Some(bytes) = self.writeback.borrow().covered(offset.id, offset.offset, len) {
            io_metrics().inc_writeback_cache_hits();
            self.ready.borrow_mut().push_back(Ready::Read {
                recv,
                res: Ok(IoBytes::Cached { data: Arc::new(bytes) }),
            });
            return;
        }
        // A partially-overlapping in-flight write must land before the
        // device can serve this range.
        if self.writeback.borrow().overlaps_inflight(offset.id, offset.offset, len) {
            self.wait_for_overlapping_writes(offset.id, offset.offset, len);
        }
        let pooled = self.acquire_read_buffer();
        let (buf, pool) = pooled.take();
        let token = self.token();
        self.pending.borrow_mut().insert(token, Pending::Read { recv, pool });
        let chunk = self.pool.chunk(offset.id);
        let (_, at) = chunk.read_fd(offset.offset);
        self.inflight.set(self.inflight.get() + 1);
        io_metrics().inc_reads_submitted();
        self.read_ring.submit(Sqe::Read { file: chunk.shared_fd(), at, len, buf, token });
    }

    /// Initiates a write of `data` at `offset`. The bytes become visible to
    /// reads on this instance immediately through the write-back cache.
    pub fn write(
        &self,
        offset: ChunkOffset,
        data: &[u8],
        recv: Option<Box<dyn WriteReceiver>>,
    ) -> io::Result<()> {
        self.assert_owner();
        let Some(write_pool) = &self.buffers.write else {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "io instance is read-only"));
        };
        assert!(
            !data.is_empty() && data.len() <= write_pool.buf_size(),
            "write larger than a write buffer"
        );
        let pooled = loop {
            if let Some(b) = write_pool.try_acquire() {
                break b;
            }
            io_metrics().inc_buffer_waits();
            self.poll_blocking();
        };
        let (mut buf, pool) = pooled.take();
        buf[..data.len()].copy_from_slice(data);
        let token = self.token();
        self.writeback.borrow_mut().insert(
            token,
            offset.id,
            offset.offset,
            Arc::new(data.to_vec()),
        );
        self.pending.borrow_mut().insert(token, Pending::Write { recv, pool });
        let chunk = self.pool.chunk(offset.id);
        let (_, at) = chunk.write_fd(offset.offset);
        self.inflight.set(self.inflight.get() + 1);
        io_metrics().inc_writes_submitted();
        self.write_ring.submit(Sqe::Write {
            file: chunk.shared_fd(),
            at,
            len: data.len(),
            buf,
            token,
        });
        Ok(())
    }

    /// An operation that completes immediately, through the ordinary
    /// completion path.
    pub fn submit_nop(&self, recv: Box<dyn NopReceiver>) {
        self.assert_owner();
        let token = self.token();
        self.pending.borrow_mut().insert(token, Pending::Nop { recv });
        self.inflight.set(self.inflight.get() + 1);
        self.read_ring.submit(Sqe::Nop { token });
    }

    /// An operation that completes after `dur`, through the ordinary
    /// completion path.
    pub fn submit_delay(&self, dur: Duration, recv: Box<dyn NopReceiver>) {
        self.assert_owner();
        let token = self.token();
        self.pending.borrow_mut().insert(token, Pending::Nop { recv });
        self.inflight.set(self.inflight.get() + 1);
        self.read_ring.submit(delay_sqe(dur, token));
    }

    /// Reads and returns owned bytes, driving completions until done.
    pub fn read_blocking(&self, offset: ChunkOffset, len: usize) -> io::Result<Vec<u8>> {
        struct Slot(Rc<RefCell<Option<io::Result<Vec<u8>>>>>);
        impl ReadReceiver for Slot {
            fn set_value(self: Box<Self>, _io: &AsyncIo, res: io::Result<IoBytes>) {
                *self.0.borrow_mut() = Some(res.map(|b| b.to_vec()));
            }
        }
        let slot = Rc::new(RefCell::new(None));
        self.read(offset, len, Box::new(Slot(slot.clone())));
        loop {
            if let Some(res) = slot.borrow_mut().take() {
                return res;
            }
            if self.poll_blocking() == 0 && self.inflight.get() == 0 {
                if let Some(res) = slot.borrow_mut().take() {
                    return res;
                }
                return Err(io::Error::new(io::ErrorKind::Other, "read completion lost"));
            }
        }
    }

    /// Dispatches any ready completions and runs posted tasks; blocks until
    /// at least one completion has been delivered if none is ready. Returns
    /// the number of completions delivered.
    pub fn poll_blocking(&self) -> usize {
        self.assert_owner();
        self.run_injected();
        loop {
            let n = self.dispatch(usize::MAX);
            if n > 0 {
                return n;
            }
            if self.inflight.get() == 0 {
                return 0;
            }
            self.block_on_any();
        }
    }

    /// Dispatches whatever is ready without blocking.
    pub fn poll_nonblocking(&self) -> usize {
        self.assert_owner();
        self.run_injected();
        self.dispatch(usize::MAX)
    }

    /// Dispatches up to `n` completions, unless called from inside a
    /// completion, in which case it does nothing: the already-running
    /// dispatch loop will deliver them without deepening the stack.
    pub fn poll_nonblocking_if_not_within_completions(&self, n: usize) -> usize {
        self.assert_owner();
        if self.within_completions.get() > 0 {
            return 0;
        }
        self.dispatch(n)
    }

    /// Blocks until every submitted operation has completed and every
    /// receiver has run.
    pub fn wait_until_done(&self) {
        self.assert_owner();
        loop {
            self.run_injected();
            self.dispatch(usize::MAX);
            if self.inflight.get() == 0 && self.ready.borrow().is_empty() {
                return;
            }
            self.block_on_any();
        }
    }

    fn acquire_read_buffer(&self) -> PooledBuf {
        loop {
            if let Some(b) = self.buffers.read.try_acquire() {
                return b;
            }
            // Exhaustion is non-fatal: drive completions until a receiver
            // returns a buffer.
            io_metrics().inc_buffer_waits();
            self.poll_blocking();
        }
    }

    fn wait_for_overlapping_writes(&self, chunk: u32, start: u32, len: usize) {
        while self.writeback.borrow().overlaps_inflight(chunk, start, len) {
            match self.write_ring.completions().recv_timeout(Duration::from_millis(100)) {
                Ok(cqe) => self.handle_write_cqe(cqe),
                Err(_) => trace!(target: "io", "still waiting on overlapping write"),
            }
        }
    }

    fn run_injected(&self) {
        while let Ok(f) = self.injected_rx.try_recv() {
            f(self);
        }
    }

    fn drain_rings(&self) {
        while let Ok(cqe) = self.read_ring.completions().try_recv() {
            self.handle_read_cqe(cqe);
        }
        while let Ok(cqe) = self.write_ring.completions().try_recv() {
            self.handle_write_cqe(cqe);
        }
    }

    fn handle_read_cqe(&self, cqe: Cqe) {
        self.inflight.set(self.inflight.get() - 1);
        let Some(pending) = self.pending.borrow_mut().remove(&cqe.token) else { return };
        match pending {
            Pending::Read { recv, pool } => {
                let res = match (cqe.result, cqe.buf) {
                    (Ok(len), Some(buf)) => {
                        Ok(IoBytes::Pooled { buf: PooledBuf::from_parts(buf, pool), len })
                    }
                    (Err(e), buf) => {
                        if let Some(buf) = buf {
                            pool.release_raw(buf);
                        }
                        Err(e)
                    }
                    (Ok(_), None) => unreachable!("read completion without buffer"),
                };
                self.ready.borrow_mut().push_back(Ready::Read { recv, res });
            }
            Pending::Nop { recv } => {
                self.ready.borrow_mut().push_back(Ready::Nop { recv });
            }
            Pending::Write { .. } => unreachable!("write pending on read ring"),
        }
    }

    fn handle_write_cqe(&self, cqe: Cqe) {
        self.inflight.set(self.inflight.get() - 1);
        self.writeback.borrow_mut().complete(cqe.token);
        let Some(pending) = self.pending.borrow_mut().remove(&cqe.token) else { return };
        match pending {
            Pending::Write { recv, pool } => {
                if let Some(buf) = cqe.buf {
                    pool.release_raw(buf);
                }
                if let Some(recv) = recv {
                    self.ready.borrow_mut().push_back(Ready::Write { recv, res: cqe.result });
                }
            }
            _ => unreachable!("non-write pending on write ring"),
        }
    }

    /// The flat completion dispatch loop. Receivers run here and only here;
    /// anything they initiate is enqueued and handled by this same loop.
    fn dispatch(&self, max: usize) -> usize {
        let mut delivered = 0;
        self.within_completions.set(self.within_completions.get() + 1);
        while delivered < max {
            self.drain_rings();
            let item = self.ready.borrow_mut().pop_front();
            let Some(item) = item else { break };
            match item {
                Ready::Read { recv, res } => recv.set_value(self, res),
                Ready::Write { recv, res } => recv.set_value(self, res),
                Ready::Nop { recv } => recv.set_value(self),
            }
            delivered += 1;
        }
        self.within_completions.set(self.within_completions.get() - 1);
        delivered
    }

    fn block_on_any(&self) {
        let mut sel = crossbeam_channel::Select::new();
        let ri = sel.recv(self.read_ring.completions());
        let wi = sel.recv(self.write_ring.completions());
        let ii = sel.recv(&self.injected_rx);
        if let Ok(op) = sel.select_timeout(Duration::from_millis(100)) {
            let idx = op.index();
            if idx == ri {
                if let Ok(cqe) = op.recv(self.read_ring.completions()) {
                    self.handle_read_cqe(cqe);
                }
            } else if idx == wi {
                if let Ok(cqe) = op.recv(self.write_ring.completions()) {
                    self.handle_write_cqe(cqe);
                }
            } else if idx == ii {
                if let Ok(f) = op.recv(&self.injected_rx) {
                    f(self);
                }
            }
        }
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        if self.is_owner() {
            self.wait_until_done();
            OWNS_IO.with(|c| c.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::make_buffers_for_segregated_read_write;
    use crate::pool::{ChunkKind, StoragePool};
    use crate::{READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};

    fn test_io(chunks: u32) -> AsyncIo {
        let pool = StoragePool::anonymous(chunks, 1 << 20).unwrap();
        for id in 0..chunks {
            pool.activate_chunk(ChunkKind::Seq, id);
        }
        let buffers =
            make_buffers_for_segregated_read_write(4, 4, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE);
        AsyncIo::new(pool, buffers).unwrap()
    }

    #[test]
    fn second_instance_on_thread_is_refused() {
        let io = test_io(1);
        let pool = StoragePool::anonymous(1, 1 << 20).unwrap();
        let err = AsyncIo::new(pool, Buffers::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        drop(io);
        // After the owner is gone the thread may host a new instance.
        let pool = StoragePool::anonymous(1, 1 << 20).unwrap();
        let io2 = AsyncIo::new(pool, Buffers::default()).unwrap();
        drop(io2);
    }

    #[test]
    fn write_then_read_round_trip() {
        let io = test_io(1);
        let data = vec![0xabu8; 1024];
        io.write(ChunkOffset::new(0, 0), &data, None).unwrap();
        io.wait_until_done();
        let got = io.read_blocking(ChunkOffset::new(0, 0), 1024).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn writeback_cache_serves_inflight_bytes() {
        let io = test_io(1);
        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        io.write(ChunkOffset::new(0, 4096), &data, None).unwrap();
        // No wait: the read must be served from the write-back cache.
        let got = io.read_blocking(ChunkOffset::new(0, 4096), 2048).unwrap();
        assert_eq!(got, data);
        io.wait_until_done();
    }

    #[test]
    fn poll_does_not_recurse() {
        struct Chained {
            remaining: Rc<Cell<u32>>,
            depth: Rc<Cell<u32>>,
            max_depth: Rc<Cell<u32>>,
        }
        impl NopReceiver for Chained {
            fn set_value(self: Box<Self>, io: &AsyncIo) {
                let d = self.depth.get() + 1;
                self.depth.set(d);
                self.max_depth.set(self.max_depth.get().max(d));
                if self.remaining.get() > 0 {
                    self.remaining.set(self.remaining.get() - 1);
                    io.submit_nop(Box::new(Chained {
                        remaining: self.remaining.clone(),
                        depth: self.depth.clone(),
                        max_depth: self.max_depth.clone(),
                    }));
                    io.poll_nonblocking_if_not_within_completions(1);
                }
                self.depth.set(self.depth.get() - 1);
            }
        }
        let io = test_io(1);
        let remaining = Rc::new(Cell::new(10_000u32));
        let depth = Rc::new(Cell::new(0u32));
        let max_depth = Rc::new(Cell::new(0u32));
        for _ in 0..100 {
            io.submit_nop(Box::new(Chained {
                remaining: remaining.clone(),
                depth: depth.clone(),
                max_depth: max_depth.clone(),
            }));
        }
        io.wait_until_done();
        assert_eq!(remaining.get(), 0);
        assert!(max_depth.get() < 2, "completions recursed {} deep", max_depth.get());
    }

    #[test]
    fn buffer_exhaustion_does_not_cause_death() {
        let io = test_io(1);
        // Far more writes than write buffers.
        for n in 0..32u32 {
            let data = vec![n as u8; 8192];
            io.write(ChunkOffset::new(0, n * 8192), &data, None).unwrap();
        }
        io.wait_until_done();
        for n in 0..32u32 {
            let got = io.read_blocking(ChunkOffset::new(0, n * 8192), 8192).unwrap();
            assert!(got.iter().all(|&b| b == n as u8));
        }
    }

    #[test]
    fn delayed_completion_fires_once() {
        let io = test_io(1);
        let fired = Rc::new(Cell::new(0u32));
        let f2 = fired.clone();
        io.submit_delay(
            Duration::from_millis(10),
            Box::new(NopFn(move |_io: &AsyncIo| f2.set(f2.get() + 1))),
        );
        io.wait_until_done();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn posted_tasks_run_on_owner_thread() {
        let io = test_io(1);
        let handle = io.handle();
        let owner = io.owning_thread_id();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let joiner = std::thread::spawn(move || {
            handle.post(move |io| {
                assert_eq!(std::thread::current().id(), io.owning_thread_id());
                let _ = tx.send(());
            });
            assert_ne!(std::thread::current().id(), owner);
        });
        joiner.join().unwrap();
        while rx.try_recv().is_err() {
            io.poll_nonblocking();
            std::thread::yield_now();
        }
    }
}
