//! Chunked storage pools and the completion-based async i/o engine.
//!
//! The model is two-tiered: a [`StoragePool`] carves raw devices (or plain
//! files) into fixed-capacity chunks, and an [`AsyncIo`] instance owned by
//! exactly one thread drives reads and writes against the pool through two
//! segregated [`Ring`]s with their own buffer pools. Completions are
//! dispatched on the owning thread in a flat loop, never from inside another
//! receiver, so completion chains do not deepen the stack.

mod aligned;
mod buffers;
mod io;
mod pool;
mod ring;

pub use aligned::AlignedBuf;
pub use buffers::{
    make_buffers_for_read_only, make_buffers_for_segregated_read_write, BufferPool, Buffers,
    PooledBuf,
};
pub use io::{AsyncIo, IoBytes, IoHandle, NopFn, NopReceiver, ReadReceiver, WriteReceiver};
pub use pool::{ChunkHandle, ChunkKind, PoolOptions, StoragePool, METADATA_REGION_SIZE};
pub use ring::Ring;

/// Default size of one read buffer.
pub const READ_BUFFER_SIZE: usize = 256 * 1024;
/// Default size of one write buffer; node writers flush at most this much at once.
pub const WRITE_BUFFER_SIZE: usize = 256 * 1024;
