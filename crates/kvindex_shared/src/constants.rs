//! # Layout Constants
//!
//! Geometry and keying constants for persistent index memory.
//!
//! **CRITICAL:** These values are baked into shared memory layouts.
//! A process resuming memory written with different values will refuse
//! to start.

// =============================================================================
// PARTITIONING
// =============================================================================

/// Number of partitions the keyspace is split into.
pub const PARTITIONS: usize = 4096;

/// Mask applied to the leading digest bytes to obtain a partition id.
pub const PARTITION_MASK: u16 = (PARTITIONS - 1) as u16;

/// Size of a record digest (the record key) in bytes.
pub const DIGEST_SIZE: usize = 20;

// =============================================================================
// ARENA GEOMETRY
// =============================================================================

/// Largest number of elements a single arena stage may hold.
pub const MAX_STAGE_CAPACITY: u32 = 1 << 24;

/// Smallest stage capacity the capacity probe will settle for.
pub const MIN_STAGE_CAPACITY: u32 = MAX_STAGE_CAPACITY / 8;

/// Default and maximum number of stages in one arena.
pub const MAX_STAGES: u32 = 256;

/// Largest byte size of a single arena stage.
pub const MAX_STAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Offset added to an arena's key base to derive per-stage keys.
pub const STAGE_KEY_OFFSET: u32 = 0x100;

// =============================================================================
// NAMESPACE REGION
// =============================================================================

/// Base of the persistence keys used for namespace regions.
pub const NAMESPACE_KEY_BASE: u32 = 0xae00_0000;

/// Key distance between two namespaces. Stage keys stay below it.
pub const NAMESPACE_KEY_STRIDE: u32 = 0x1000;

/// Bytes per set-map value.
pub const SET_VALUE_SIZE: u32 = 128;

/// Maximum number of sets per namespace.
pub const SET_MAX_COUNT: u32 = 1023;

/// Maximum set name size including the NUL terminator.
pub const SET_NAME_MAX_SIZE: u32 = 64;

/// Initial hash capacity of the set-name index.
pub const SET_HASH_SIZE: u32 = 1024;

/// Bytes per bin-map value (the bin name itself).
pub const BIN_NAME_MAX_SIZE: u32 = 16;

/// Maximum number of distinct bin names per namespace.
pub const MAX_BIN_NAMES: u32 = 0xFFFF;

/// Initial hash capacity of the bin-name index.
pub const BIN_HASH_SIZE: u32 = 4096;

// =============================================================================
// DEVICES
// =============================================================================

/// Device read-block size. Record locations are addressed in read blocks.
pub const RBLOCK_SIZE: u64 = 128;

/// Default device write-block size.
pub const DEFAULT_WRITE_BLOCK_SIZE: u32 = 1024 * 1024;

// =============================================================================
// TIME
// =============================================================================

/// Unix time of the void-time epoch (2010-01-01T00:00:00Z).
pub const VOID_TIME_EPOCH: u64 = 1_262_304_000;

/// Derives the persistence key of a namespace's shared region.
#[inline]
#[must_use]
pub const fn namespace_key(ns_id: u32) -> u32 {
    NAMESPACE_KEY_BASE + NAMESPACE_KEY_STRIDE * ns_id
}

/// Converts a read-block count to bytes.
#[inline]
#[must_use]
pub const fn rblocks_to_bytes(n_rblocks: u32) -> u64 {
    n_rblocks as u64 * RBLOCK_SIZE
}
