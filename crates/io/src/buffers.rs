//! Segregated buffer pools for the read and write rings.
//!
//! Exhaustion is non-fatal: acquiring a buffer when none is free blocks the
//! initiating thread until a completion hands one back.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use triedb_telemetry::io_metrics;

use crate::aligned::AlignedBuf;
use crate::{READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};

/// A fixed set of page-aligned buffers of one size.
pub struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<AlignedBuf>>,
    available: Condvar,
}

impl BufferPool {
    pub fn new(count: usize, buf_size: usize) -> Arc<Self> {
        let free = (0..count).map(|_| AlignedBuf::zeroed(buf_size)).collect();
        Arc::new(Self { buf_size, free: Mutex::new(free), available: Condvar::new() })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Takes a buffer, blocking until one is free.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let mut free = self.free.lock();
        if free.is_empty() {
            io_metrics().inc_buffer_waits();
            while free.is_empty() {
                self.available.wait(&mut free);
            }
        }
        let buf = free.pop().unwrap_or_else(|| unreachable!("woken with empty pool"));
        PooledBuf { buf: Some(buf), pool: self.clone() }
    }

    /// Takes a buffer if one is free right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuf> {
        let buf = self.free.lock().pop()?;
        Some(PooledBuf { buf: Some(buf), pool: self.clone() })
    }

    fn release(&self, buf: AlignedBuf) {
        self.free.lock().push(buf);
        self.available.notify_one();
    }

    pub(crate) fn release_raw(&self, buf: AlignedBuf) {
        self.release(buf);
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop.
pub struct PooledBuf {
    buf: Option<AlignedBuf>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub(crate) fn take(mut self) -> (AlignedBuf, Arc<BufferPool>) {
        let buf = self.buf.take().unwrap_or_else(|| unreachable!("taken twice"));
        (buf, self.pool.clone())
    }

    pub(crate) fn from_parts(buf: AlignedBuf, pool: Arc<BufferPool>) -> Self {
        Self { buf: Some(buf), pool }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_ref().map(|b| b.as_slice()).unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().map(|b| b.as_mut_slice()).unwrap_or(&mut [])
    }
}

/// The read and (optional) write buffer pools of one `AsyncIo`.
pub struct Buffers {
    pub read: Arc<BufferPool>,
    pub write: Option<Arc<BufferPool>>,
}

/// Buffer pools for an io instance that both reads and writes; the two rings
/// never contend for each other's buffers.
pub fn make_buffers_for_segregated_read_write(
    read_count: usize,
    write_count: usize,
    read_size: usize,
    write_size: usize,
) -> Buffers {
    Buffers {
        read: BufferPool::new(read_count, read_size),
        write: Some(BufferPool::new(write_count, write_size)),
    }
}

/// Buffer pools for a read-only io instance.
pub fn make_buffers_for_read_only(read_count: usize, read_size: usize) -> Buffers {
    Buffers { read: BufferPool::new(read_count, read_size), write: None }
}

impl Default for Buffers {
    fn default() -> Self {
        make_buffers_for_segregated_read_write(8, 8, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE)
    }
}
