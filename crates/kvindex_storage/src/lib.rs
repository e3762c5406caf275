//! # KVINDEX Storage
//!
//! Namespace memory and the startup pass that makes a resumed index usable.
//!
//! ## Startup Order
//!
//! 1. [`probe_stage_capacity`] once, for every namespace together
//! 2. [`setup`] per namespace: cold start or warm restart
//! 3. [`resume_devices`] per warm namespace: rebuild device accounting
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvindex_storage::{probe_stage_capacity, setup, HeapProbe, INDEX_RECORD_SIZE};
//!
//! let capacity = probe_stage_capacity(&mut HeapProbe, &[INDEX_RECORD_SIZE])?;
//! let memory = setup(1, &ns_config, capacity, &options)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cold_start;
pub mod device;
pub mod error;
pub mod index;
pub mod mem_check;
pub mod namespace;
pub mod setup;
pub mod tree;
pub mod vmap;

pub use cold_start::{reduce_entry, resume_devices, EntryOutcome, ReduceContext, ReduceSummary};
pub use device::{Device, DeviceSet, OwnAll, PartitionOwnership, RecoveryCounters};
pub use error::{ColdStartError, SetupError, SetupResult, TreeError, TreeResult, VmapError};
pub use index::{partition_id, Digest, IndexEntry, IndexRecord, INDEX_RECORD_SIZE};
pub use mem_check::{min_memory_mb, probe_stage_capacity, HeapProbe, ProbeAllocator};
pub use namespace::{now_void_time, Namespace, NamespaceStats, Partition, PartitionInfo, TreeKind};
pub use setup::{configure_sets, namespace_layout, setup, NamespaceMemory, SetEntry, SetupOptions};
pub use tree::{ArenaTree, IndexTree, TreeRoot, Visit};
pub use vmap::NameMap;
