//! Chunk offsets and their packed on-disk form.
//!
//! A [`ChunkOffset`] addresses a byte within a chunk of a storage pool. The
//! packed form squeezes the pair into a `u64` together with a 15-bit spare
//! field; parents store the packed form for each child so a reader learns
//! both where the child lives and how many pages to load in one shot.

use serde::{Deserialize, Serialize};

/// Bits reserved for the byte offset within a chunk.
pub const OFFSET_BITS: u32 = 28;
/// Bits reserved for the chunk id.
pub const ID_BITS: u32 = 21;
/// Bits reserved for the spare field (the page span encoding).
pub const SPARE_BITS: u32 = 15;

/// Largest representable byte offset within a chunk.
pub const MAX_OFFSET: u32 = (1 << OFFSET_BITS) - 1;
/// Largest representable chunk id.
pub const MAX_CHUNK_ID: u32 = (1 << ID_BITS) - 1;

/// A `(chunk_id, byte_offset)` pair within a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkOffset {
    pub id: u32,
    pub offset: u32,
}

impl ChunkOffset {
    pub const fn new(id: u32, offset: u32) -> Self {
        Self { id, offset }
    }

    /// The cursor advanced by `n` bytes within the same chunk.
    pub fn add_to_offset(self, n: u32) -> Self {
        debug_assert!(self.offset.checked_add(n).is_some());
        Self { id: self.id, offset: self.offset + n }
    }

    /// Packs this offset together with a spare field value.
    pub fn pack(self, spare: u16) -> PackedOffset {
        PackedOffset::new(self, spare)
    }
}

impl std::fmt::Display for ChunkOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.offset)
    }
}

/// The packed `u64` form of a chunk offset: offset in bits `0..28`, chunk id
/// in bits `28..49`, spare field in bits `49..64`. `u64::MAX` is the invalid
/// sentinel marking absent children and empty roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackedOffset(u64);

impl PackedOffset {
    pub const INVALID: Self = Self(u64::MAX);

    pub fn new(offset: ChunkOffset, spare: u16) -> Self {
        debug_assert!(offset.offset <= MAX_OFFSET);
        debug_assert!(offset.id <= MAX_CHUNK_ID);
        debug_assert!(u32::from(spare) < (1 << SPARE_BITS));
        Self(
            u64::from(offset.offset)
                | (u64::from(offset.id) << OFFSET_BITS)
                | (u64::from(spare) << (OFFSET_BITS + ID_BITS)),
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    pub fn offset(self) -> ChunkOffset {
        debug_assert!(self.is_valid());
        ChunkOffset {
            id: ((self.0 >> OFFSET_BITS) & u64::from(MAX_CHUNK_ID)) as u32,
            offset: (self.0 & u64::from(MAX_OFFSET)) as u32,
        }
    }

    pub fn spare(self) -> u16 {
        debug_assert!(self.is_valid());
        (self.0 >> (OFFSET_BITS + ID_BITS)) as u16 & ((1 << SPARE_BITS) - 1)
    }

    /// The same location with a different spare field.
    pub fn with_spare(self, spare: u16) -> Self {
        Self::new(self.offset(), spare)
    }
}

impl Default for PackedOffset {
    fn default() -> Self {
        Self::INVALID
    }
}
