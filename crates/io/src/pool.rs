//! Storage pools: raw devices carved into fixed-capacity chunks.
//!
//! A pool owns one or more devices. The head of the first device is reserved
//! for the double-buffered db metadata; everything after it is chunks. The
//! pool hands out [`ChunkHandle`]s that translate a byte offset within a
//! chunk into `(fd, absolute file offset)` pairs for positional i/o. Chunk
//! lifecycle (which chunk is free, which belongs to the fast or slow append
//! stream) is recorded by the db metadata; the pool only tracks the live
//! in-memory view of it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use triedb_types::{DEFAULT_CHUNK_CAPACITY, DISK_PAGE_SIZE};

/// Bytes reserved at the head of the first device for one metadata copy.
pub const METADATA_COPY_SIZE: u64 = 256 * 1024;
/// Bytes reserved at the head of the first device for both metadata copies.
pub const METADATA_REGION_SIZE: u64 = 2 * METADATA_COPY_SIZE;

/// Which append stream a chunk is activated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// The hot sequential stream.
    Seq,
    /// The cold stream; drawn from the same chunk set but tracked distinctly.
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Free,
    Active(ChunkKind),
}

struct Device {
    file: Arc<File>,
    /// Absolute file offset of this device's first chunk.
    chunk_base: u64,
    first_chunk: u32,
    chunk_count: u32,
}

/// Construction options for [`StoragePool::open`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub chunk_capacity: u64,
    /// Open the devices with `O_DIRECT` where the platform supports it.
    pub direct_io: bool,
    /// Create the backing files if they do not exist.
    pub create: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { chunk_capacity: DEFAULT_CHUNK_CAPACITY, direct_io: false, create: true }
    }
}

/// A flat address space of chunks over one or more devices.
pub struct StoragePool {
    devices: Vec<Arc<Device>>,
    chunk_capacity: u64,
    total_chunks: u32,
    states: Arc<Mutex<Vec<ChunkState>>>,
    read_only: bool,
}

impl StoragePool {
    /// Opens (or creates) a pool over the given device paths.
    pub fn open<P: AsRef<Path>>(paths: &[P], opts: &PoolOptions) -> io::Result<Self> {
        if paths.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no devices given"));
        }
        if opts.chunk_capacity == 0 || opts.chunk_capacity % u64::from(DISK_PAGE_SIZE) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk capacity must be a positive multiple of the disk page size",
            ));
        }
        let mut devices = Vec::with_capacity(paths.len());
        let mut next_chunk = 0u32;
        for (i, path) in paths.iter().enumerate() {
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(opts.create);
            #[cfg(target_os = "linux")]
            if opts.direct_io {
                use std::os::unix::fs::OpenOptionsExt;
                options.custom_flags(libc::O_DIRECT);
            }
            let file = options.open(path)?;
            let len = file.metadata()?.len();
            let reserve = if i == 0 { METADATA_REGION_SIZE } else { 0 };
            if len < reserve + opts.chunk_capacity {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "device too small for metadata region plus one chunk",
                ));
            }
            let chunk_count = ((len - reserve) / opts.chunk_capacity) as u32;
            devices.push(Arc::new(Device {
                file: Arc::new(file),
                chunk_base: reserve,
                first_chunk: next_chunk,
                chunk_count,
            }));
            next_chunk += chunk_count;
        }
        debug!(target: "pool", chunks = next_chunk, capacity = opts.chunk_capacity, "pool opened");
        Ok(Self {
            devices,
            chunk_capacity: opts.chunk_capacity,
            total_chunks: next_chunk,
            states: Arc::new(Mutex::new(vec![ChunkState::Free; next_chunk as usize])),
            read_only: false,
        })
    }

    /// A pool backed by an unnamed auto-unlinked temporary file, for tests
    /// and CI.
    pub fn anonymous(chunk_count: u32, chunk_capacity: u64) -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        file.set_len(METADATA_REGION_SIZE + u64::from(chunk_count) * chunk_capacity)?;
        Ok(Self {
            devices: vec![Arc::new(Device {
                file: Arc::new(file),
                chunk_base: METADATA_REGION_SIZE,
                first_chunk: 0,
                chunk_count,
            })],
            chunk_capacity,
            total_chunks: chunk_count,
            states: Arc::new(Mutex::new(vec![ChunkState::Free; chunk_count as usize])),
            read_only: false,
        })
    }

    /// A reader-only view sharing the same devices and chunk states.
    pub fn clone_as_read_only(&self) -> Self {
        Self {
            devices: self.devices.clone(),
            chunk_capacity: self.chunk_capacity,
            total_chunks: self.total_chunks,
            states: self.states.clone(),
            read_only: true,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    pub fn chunk_count(&self) -> u32 {
        self.total_chunks
    }

    fn device_of(&self, id: u32) -> &Arc<Device> {
        assert!(id < self.total_chunks, "chunk id {id} out of range");
        self.devices
            .iter()
            .find(|d| id >= d.first_chunk && id < d.first_chunk + d.chunk_count)
            .unwrap_or_else(|| unreachable!("chunk id within total count"))
    }

    /// A handle to chunk `id`.
    pub fn chunk(&self, id: u32) -> ChunkHandle {
        let device = self.device_of(id);
        let base = device.chunk_base + u64::from(id - device.first_chunk) * self.chunk_capacity;
        ChunkHandle { device: device.clone(), base, capacity: self.chunk_capacity, id }
    }

    /// Takes a free chunk and makes it live for the given stream.
    pub fn activate_chunk(&self, kind: ChunkKind, id: u32) -> ChunkHandle {
        let mut states = self.states.lock();
        debug_assert_eq!(states[id as usize], ChunkState::Free, "activating a non-free chunk");
        states[id as usize] = ChunkState::Active(kind);
        drop(states);
        self.chunk(id)
    }

    /// Returns a live chunk to the free set.
    pub fn deactivate_chunk(&self, id: u32) {
        self.states.lock()[id as usize] = ChunkState::Free;
    }

    /// Re-marks a chunk as active without touching the free set, used when
    /// rebuilding the in-memory view from persisted metadata on open.
    pub fn mark_active(&self, kind: ChunkKind, id: u32) {
        self.states.lock()[id as usize] = ChunkState::Active(kind);
    }

    pub fn is_chunk_free(&self, id: u32) -> bool {
        self.states.lock()[id as usize] == ChunkState::Free
    }

    /// The fd and byte range of the reserved metadata region.
    pub fn metadata_fd(&self) -> (&File, u64, u64) {
        (self.devices[0].file.as_ref(), 0, METADATA_REGION_SIZE)
    }
}

/// A handle to one chunk of a pool.
pub struct ChunkHandle {
    device: Arc<Device>,
    base: u64,
    capacity: u64,
    id: u32,
}

impl ChunkHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.capacity
    }

    /// The fd and absolute file offset for a write at `offset` within this
    /// chunk.
    pub fn write_fd(&self, offset: u32) -> (&File, u64) {
        debug_assert!(u64::from(offset) <= self.capacity);
        (&self.device.file, self.base + u64::from(offset))
    }

    /// The fd and absolute file offset for a read at `offset` within this
    /// chunk.
    pub fn read_fd(&self, offset: u32) -> (&File, u64) {
        debug_assert!(u64::from(offset) <= self.capacity);
        (&self.device.file, self.base + u64::from(offset))
    }

    /// A shared handle to the underlying device fd, for ring submissions.
    pub(crate) fn shared_fd(&self) -> Arc<File> {
        self.device.file.clone()
    }
}
