//! # Record Index Entries
//!
//! The on-arena layout of one index entry and its owned, decoded form.

use bytemuck::{Pod, Zeroable};
use kvindex_core::ElementHandle;
use kvindex_shared::{DIGEST_SIZE, PARTITION_MASK};

/// Record key: a 20-byte hash digest.
pub type Digest = [u8; DIGEST_SIZE];

/// Partition that owns `digest`.
#[inline]
#[must_use]
pub fn partition_id(digest: &Digest) -> usize {
    (u16::from_le_bytes([digest[0], digest[1]]) & PARTITION_MASK) as usize
}

/// One index entry as stored in an arena element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndexRecord {
    /// Left child handle, packed.
    pub left: u64,
    /// Right child handle, packed.
    pub right: u64,
    /// First read block of the record on its device.
    pub rblock_id: u64,
    /// Record key.
    pub digest: Digest,
    /// Expiry in seconds since the void-time epoch (0 = never).
    pub void_time: u32,
    /// Record size in read blocks.
    pub n_rblocks: u32,
    /// Device holding the record.
    pub file_id: u32,
    /// Write generation.
    pub generation: u16,
    /// Index into the set name map (0 = no set).
    pub set_id: u16,
    _reserved: u32,
}

/// Arena element size of an [`IndexRecord`].
pub const INDEX_RECORD_SIZE: u32 = std::mem::size_of::<IndexRecord>() as u32;

const _: () = assert!(INDEX_RECORD_SIZE == 64);

impl IndexRecord {
    /// Left child.
    #[inline]
    #[must_use]
    pub const fn left(&self) -> ElementHandle {
        ElementHandle::from_raw(self.left)
    }

    /// Right child.
    #[inline]
    #[must_use]
    pub const fn right(&self) -> ElementHandle {
        ElementHandle::from_raw(self.right)
    }

    /// Overwrites the payload, keeping the child links.
    pub fn set_entry(&mut self, entry: &IndexEntry) {
        self.rblock_id = entry.rblock_id;
        self.digest = entry.digest;
        self.void_time = entry.void_time;
        self.n_rblocks = entry.n_rblocks;
        self.file_id = entry.file_id;
        self.generation = entry.generation;
        self.set_id = entry.set_id;
    }
}

/// Decoded payload of an index entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    /// Record key.
    pub digest: Digest,
    /// Expiry in seconds since the void-time epoch (0 = never).
    pub void_time: u32,
    /// Device holding the record.
    pub file_id: u32,
    /// First read block of the record on its device.
    pub rblock_id: u64,
    /// Record size in read blocks.
    pub n_rblocks: u32,
    /// Write generation.
    pub generation: u16,
    /// Index into the set name map (0 = no set).
    pub set_id: u16,
}

impl IndexEntry {
    /// Partition that owns this entry's digest.
    #[inline]
    #[must_use]
    pub fn partition_id(&self) -> usize {
        partition_id(&self.digest)
    }
}

impl From<&IndexRecord> for IndexEntry {
    fn from(record: &IndexRecord) -> Self {
        Self {
            digest: record.digest,
            void_time: record.void_time,
            file_id: record.file_id,
            rblock_id: record.rblock_id,
            n_rblocks: record.n_rblocks,
            generation: record.generation,
            set_id: record.set_id,
        }
    }
}
