//! Trie nodes and their byte-exact on-disk records.
//!
//! A node is a 16-bit branch mask, a compressed nibble path, an optional
//! leaf value of up to 255 bytes, and one entry per present branch carrying
//! the child's packed disk offset, the minimum virtual offset of its
//! subtree, a small hash cache used to recompute the parent hash without
//! re-walking, and (for in-memory children) the owning pointer.
//!
//! Record layout, little endian:
//!
//! ```text
//! 0   mask       u16
//! 2   flags      u8      bit 0: leaf
//! 3   path_len   u8      nibbles
//! 4   leaf_len   u8
//! 5   hash_len   u8      0 or 32
//! 6   disk_size  u16     total record bytes
//! 8   crc        u32     over the record with this field zeroed
//! 12  path       (path_len + 1) / 2 bytes
//!     fnext      n * u64
//!     min_off    n * u64
//!     data_off   n * u16 cumulative end offsets into the data area
//!     data       per-child hash caches
//!     value      leaf_len bytes
//!     hash       hash_len bytes
//! ```

use smallvec::SmallVec;

use triedb_types::{DbError, PackedOffset};

use crate::nibbles::Nibbles;

const FLAG_LEAF: u8 = 1;
const HEADER_LEN: usize = 12;

/// The zero hash, meaning "not yet computed".
pub const EMPTY_HASH: [u8; 32] = [0u8; 32];

/// One branch slot of a node.
#[derive(Debug)]
pub struct Child {
    /// On-disk location plus spare pages, or invalid while memory-only.
    pub fnext: PackedOffset,
    /// Minimum virtual offset among all of the child's subtree records;
    /// `u64::MAX` while the subtree has unwritten parts.
    pub min_offset: u64,
    /// The child's cached subtree hash, filled when the child was last
    /// hashed or deserialized.
    pub data: SmallVec<[u8; 32]>,
    /// The owning in-memory pointer, or `None` when the child lives only on
    /// disk.
    pub next: Option<Box<Node>>,
}

impl Child {
    /// A memory-only child, as produced mid-update before the subtree is
    /// written out.
    pub fn from_node(node: Box<Node>) -> Self {
        Self { fnext: PackedOffset::INVALID, min_offset: u64::MAX, data: SmallVec::new(), next: Some(node) }
    }

    /// True when the child's bytes are only on disk.
    pub fn is_on_disk_only(&self) -> bool {
        self.next.is_none()
    }
}

/// A trie node.
#[derive(Debug)]
pub struct Node {
    pub mask: u16,
    pub path: Nibbles,
    pub value: Option<Box<[u8]>>,
    /// Cached subtree hash; all zeroes while dirty.
    pub hash: [u8; 32],
    /// Serialized size, recomputed whenever the node changes.
    pub disk_size: u16,
    /// One entry per set mask bit, in branch order.
    pub children: Vec<Child>,
}

impl Node {
    pub fn new_leaf(path: Nibbles, value: &[u8]) -> Box<Node> {
        debug_assert!(value.len() <= u8::MAX as usize, "leaf value over 255 bytes");
        let mut node = Box::new(Node {
            mask: 0,
            path,
            value: Some(value.into()),
            hash: EMPTY_HASH,
            disk_size: 0,
            children: Vec::new(),
        });
        node.disk_size = node.compute_disk_size();
        node
    }

    pub fn new_branch(path: Nibbles) -> Box<Node> {
        Box::new(Node {
            mask: 0,
            path,
            value: None,
            hash: EMPTY_HASH,
            disk_size: 0,
            children: Vec::new(),
        })
    }

    /// Number of children.
    pub fn n(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.value.is_some()
    }

    pub fn has_branch(&self, branch: u8) -> bool {
        self.mask & (1u16 << branch) != 0
    }

    /// Index into `children` for a present branch.
    pub fn child_index(&self, branch: u8) -> usize {
        debug_assert!(self.has_branch(branch));
        (self.mask & ((1u16 << branch) - 1)).count_ones() as usize
    }

    pub fn child(&self, branch: u8) -> Option<&Child> {
        self.has_branch(branch).then(|| &self.children[self.child_index(branch)])
    }

    pub fn child_mut(&mut self, branch: u8) -> Option<&mut Child> {
        if self.has_branch(branch) {
            let j = self.child_index(branch);
            Some(&mut self.children[j])
        } else {
            None
        }
    }

    pub fn insert_child(&mut self, branch: u8, child: Child) {
        debug_assert!(!self.has_branch(branch));
        let j = (self.mask & ((1u16 << branch) - 1)).count_ones() as usize;
        self.mask |= 1u16 << branch;
        self.children.insert(j, child);
    }

    pub fn remove_child(&mut self, branch: u8) -> Child {
        debug_assert!(self.has_branch(branch));
        let j = self.child_index(branch);
        self.mask &= !(1u16 << branch);
        self.children.remove(j)
    }

    /// `(branch, child)` pairs in branch order.
    pub fn branches(&self) -> impl Iterator<Item = (u8, &Child)> {
        let mask = self.mask;
        (0u8..16).filter(move |b| mask & (1 << b) != 0).zip(self.children.iter())
    }

    /// The branch nibble of the only child. Meaningful during collapse.
    pub fn sole_branch(&self) -> Option<u8> {
        (self.n() == 1).then(|| self.mask.trailing_zeros() as u8)
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn has_hash(&self) -> bool {
        self.hash != EMPTY_HASH
    }

    /// Invalidates the cached hash; the serialized size is recomputed here
    /// too so both stay consistent with the contents.
    pub fn mark_dirty(&mut self) {
        self.hash = EMPTY_HASH;
        self.disk_size = self.compute_disk_size();
    }

    pub fn compute_disk_size(&self) -> u16 {
        let n = self.n();
        let data: usize = self.children.iter().map(|c| c.data.len()).sum();
        let size = HEADER_LEN
            + self.path.packed_bytes().len()
            + n * (8 + 8 + 2)
            + data
            + self.value.as_ref().map_or(0, |v| v.len())
            + if self.has_hash() { 32 } else { 0 };
        debug_assert!(size <= u16::MAX as usize);
        size as u16
    }

    /// Serializes the record. The cached hash and `disk_size` must be
    /// current.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert_eq!(self.n(), self.children.len());
        let size = self.compute_disk_size() as usize;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&self.mask.to_le_bytes());
        out.push(if self.is_leaf() { FLAG_LEAF } else { 0 });
        debug_assert!(self.path.len() <= u8::MAX as usize, "node path over 255 nibbles");
        out.push(self.path.len() as u8);
        out.push(self.value.as_ref().map_or(0, |v| v.len()) as u8);
        out.push(if self.has_hash() { 32 } else { 0 });
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // crc placeholder
        out.extend_from_slice(self.path.packed_bytes());
        for child in &self.children {
            out.extend_from_slice(&child.fnext.raw().to_le_bytes());
        }
        for child in &self.children {
            out.extend_from_slice(&child.min_offset.to_le_bytes());
        }
        let mut end = 0u16;
        for child in &self.children {
            end += child.data.len() as u16;
            out.extend_from_slice(&end.to_le_bytes());
        }
        for child in &self.children {
            out.extend_from_slice(&child.data);
        }
        if let Some(v) = &self.value {
            out.extend_from_slice(v);
        }
        if self.has_hash() {
            out.extend_from_slice(&self.hash);
        }
        debug_assert_eq!(out.len(), size);
        let crc = crc32_of_record(&out);
        out[8..12].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Deserializes a record from `bytes` (which may extend past it). `at`
    /// only labels the corruption error.
    pub fn deserialize(bytes: &[u8], at: PackedOffset) -> Result<Box<Node>, DbError> {
        let corrupt = || DbError::CorruptNode(at.raw());
        if bytes.len() < HEADER_LEN {
            return Err(corrupt());
        }
        let mask = u16::from_le_bytes([bytes[0], bytes[1]]);
        let flags = bytes[2];
        let path_len = bytes[3] as usize;
        let leaf_len = bytes[4] as usize;
        let hash_len = bytes[5] as usize;
        let disk_size = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if hash_len != 0 && hash_len != 32 {
            return Err(corrupt());
        }
        let n = mask.count_ones() as usize;
        let path_bytes = (path_len + 1) / 2;
        if disk_size > bytes.len() || disk_size < HEADER_LEN + path_bytes + n * 18 {
            return Err(corrupt());
        }
        let record = &bytes[..disk_size];
        let stored_crc = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);
        let mut check = record.to_vec();
        check[8..12].fill(0);
        if crc32_of_record(&check) != stored_crc {
            return Err(corrupt());
        }
        let mut pos = HEADER_LEN;
        let path = Nibbles::from_packed(&record[pos..pos + path_bytes], path_len);
        pos += path_bytes;
        let mut children = Vec::with_capacity(n);
        let mut fnexts = Vec::with_capacity(n);
        for _ in 0..n {
            let raw = u64::from_le_bytes(record[pos..pos + 8].try_into().map_err(|_| corrupt())?);
            fnexts.push(PackedOffset::from_raw(raw));
            pos += 8;
        }
        let mut mins = Vec::with_capacity(n);
        for _ in 0..n {
            let v = u64::from_le_bytes(record[pos..pos + 8].try_into().map_err(|_| corrupt())?);
            mins.push(v);
            pos += 8;
        }
        let mut data_ends = Vec::with_capacity(n);
        for _ in 0..n {
            let v = u16::from_le_bytes([record[pos], record[pos + 1]]) as usize;
            data_ends.push(v);
            pos += 2;
        }
        let data_total = data_ends.last().copied().unwrap_or(0);
        if pos + data_total + leaf_len + hash_len != disk_size {
            return Err(corrupt());
        }
        let mut data_start = 0usize;
        for j in 0..n {
            let end = data_ends[j];
            if end < data_start || pos + end > disk_size {
                return Err(corrupt());
            }
            let data = SmallVec::from_slice(&record[pos + data_start..pos + end]);
            children.push(Child {
                fnext: fnexts[j],
                min_offset: mins[j],
                data,
                next: None,
            });
            data_start = end;
        }
        pos += data_total;
        let value: Option<Box<[u8]>> =
            (flags & FLAG_LEAF != 0).then(|| record[pos..pos + leaf_len].into());
        if flags & FLAG_LEAF == 0 && leaf_len != 0 {
            return Err(corrupt());
        }
        pos += leaf_len;
        let mut hash = EMPTY_HASH;
        if hash_len == 32 {
            hash.copy_from_slice(&record[pos..pos + 32]);
        }
        Ok(Box::new(Node { mask, path, value, hash, disk_size: disk_size as u16, children }))
    }
}

fn crc32_of_record(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
