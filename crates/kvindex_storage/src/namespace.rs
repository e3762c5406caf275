//! # Namespaces
//!
//! A namespace ties its memory, partitions and devices together and holds
//! the namespace-wide counters the reducer updates.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kvindex_shared::{NamespaceConfig, PARTITIONS, VOID_TIME_EPOCH};

use crate::device::DeviceSet;
use crate::error::TreeResult;
use crate::index::IndexEntry;
use crate::setup::NamespaceMemory;
use crate::tree::{ArenaTree, IndexTree};

/// Seconds since the void-time epoch, now.
#[must_use]
pub fn now_void_time() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    u32::try_from(unix.saturating_sub(VOID_TIME_EPOCH)).unwrap_or(u32::MAX)
}

/// Which of a partition's trees an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    /// Records.
    Primary,
    /// Sub-records, exempt from the max TTL.
    Sub,
}

impl TreeKind {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Sub => "sub",
        }
    }
}

/// Namespace-wide counters.
#[derive(Debug, Default)]
pub struct NamespaceStats {
    n_objects: AtomicU64,
    max_void_time: AtomicU32,
    cold_start_threshold_void_time: AtomicU32,
    cold_start_max_void_time: AtomicU32,
}

impl NamespaceStats {
    /// Objects in the index.
    #[must_use]
    pub fn n_objects(&self) -> u64 {
        self.n_objects.load(Ordering::Relaxed)
    }

    /// Latest void time of any kept entry.
    #[must_use]
    pub fn max_void_time(&self) -> u32 {
        self.max_void_time.load(Ordering::Relaxed)
    }

    /// Entries voiding before this are dropped at startup.
    #[must_use]
    pub fn cold_start_threshold_void_time(&self) -> u32 {
        self.cold_start_threshold_void_time.load(Ordering::Relaxed)
    }

    /// Entries voiding after this exceed the max TTL.
    #[must_use]
    pub fn cold_start_max_void_time(&self) -> u32 {
        self.cold_start_max_void_time.load(Ordering::Relaxed)
    }

    /// Moves the expiry threshold. Eviction may raise it during startup.
    pub fn set_cold_start_threshold_void_time(&self, void_time: u32) {
        self.cold_start_threshold_void_time.store(void_time, Ordering::Relaxed);
    }

    /// Sets the max-TTL cutoff.
    pub fn set_cold_start_max_void_time(&self, void_time: u32) {
        self.cold_start_max_void_time.store(void_time, Ordering::Relaxed);
    }

    pub(crate) fn add_object(&self) {
        self.n_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn raise_max_void_time(&self, void_time: u32) {
        self.max_void_time.fetch_max(void_time, Ordering::Relaxed);
    }
}

/// Identity and counters of one partition.
#[derive(Debug)]
pub struct PartitionInfo {
    id: usize,
    max_void_time: AtomicU32,
}

impl PartitionInfo {
    /// Partition id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Latest void time of any kept entry in this partition.
    #[must_use]
    pub fn max_void_time(&self) -> u32 {
        self.max_void_time.load(Ordering::Relaxed)
    }

    pub(crate) fn raise_max_void_time(&self, void_time: u32) {
        self.max_void_time.fetch_max(void_time, Ordering::Relaxed);
    }
}

/// One partition of a namespace.
#[derive(Debug)]
pub struct Partition {
    info: PartitionInfo,
    /// Record index.
    pub tree: ArenaTree,
    /// Sub-record index.
    pub sub_tree: ArenaTree,
}

impl Partition {
    /// Partition id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.info.id
    }

    /// Identity and counters.
    #[must_use]
    pub const fn info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Latest void time of any kept entry in this partition.
    #[must_use]
    pub fn max_void_time(&self) -> u32 {
        self.info.max_void_time()
    }

    /// Tree of `kind`.
    #[must_use]
    pub fn tree(&self, kind: TreeKind) -> &ArenaTree {
        match kind {
            TreeKind::Primary => &self.tree,
            TreeKind::Sub => &self.sub_tree,
        }
    }

    /// Tree of `kind`, mutably.
    pub fn tree_mut(&mut self, kind: TreeKind) -> &mut ArenaTree {
        self.split_tree(kind).0
    }

    /// Tree of `kind`, mutably, alongside the partition counters.
    pub fn split_tree(&mut self, kind: TreeKind) -> (&mut ArenaTree, &PartitionInfo) {
        let tree = match kind {
            TreeKind::Primary => &mut self.tree,
            TreeKind::Sub => &mut self.sub_tree,
        };
        (tree, &self.info)
    }
}

/// A set-up namespace.
#[derive(Debug)]
pub struct Namespace {
    id: u32,
    config: NamespaceConfig,
    memory: NamespaceMemory,
    partitions: Vec<Partition>,
    devices: DeviceSet,
    stats: NamespaceStats,
}

impl Namespace {
    /// Opens the partition trees over `memory`.
    #[must_use]
    pub fn new(id: u32, config: NamespaceConfig, memory: NamespaceMemory, devices: DeviceSet) -> Self {
        let partitions = memory
            .tree_roots
            .iter()
            .zip(&memory.sub_tree_roots)
            .take(PARTITIONS)
            .enumerate()
            .map(|(pid, (root, sub_root))| Partition {
                info: PartitionInfo {
                    id: pid,
                    max_void_time: AtomicU32::new(0),
                },
                tree: ArenaTree::new(Arc::clone(&memory.arena), root.clone()),
                sub_tree: ArenaTree::new(Arc::clone(&memory.arena), sub_root.clone()),
            })
            .collect();

        Self {
            id,
            config,
            memory,
            partitions,
            devices,
            stats: NamespaceStats::default(),
        }
    }

    /// Namespace id (the first configured namespace is 1).
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the namespace was set up with.
    #[must_use]
    pub const fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Namespace memory.
    #[must_use]
    pub const fn memory(&self) -> &NamespaceMemory {
        &self.memory
    }

    /// Whether the index started empty.
    #[must_use]
    pub const fn cold_start(&self) -> bool {
        self.memory.cold_start
    }

    /// Namespace counters.
    #[must_use]
    pub const fn stats(&self) -> &NamespaceStats {
        &self.stats
    }

    /// Devices of the namespace.
    #[must_use]
    pub const fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Devices of the namespace, mutably.
    pub fn devices_mut(&mut self) -> &mut DeviceSet {
        &mut self.devices
    }

    /// Partition `pid`.
    #[must_use]
    pub fn partition(&self, pid: usize) -> Option<&Partition> {
        self.partitions.get(pid)
    }

    /// Partition `pid`, mutably.
    pub fn partition_mut(&mut self, pid: usize) -> Option<&mut Partition> {
        self.partitions.get_mut(pid)
    }

    /// All partitions in id order.
    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Sets the startup expiry threshold to `now` and the max-TTL cutoff
    /// to `now + max_ttl` (unbounded when max TTL is 0).
    pub fn prepare_cold_start_times(&self, now: u32) {
        self.stats.set_cold_start_threshold_void_time(now);
        let cutoff = match self.config.max_ttl {
            0 => u32::MAX,
            max_ttl => now.saturating_add(max_ttl),
        };
        self.stats.set_cold_start_max_void_time(cutoff);
    }

    /// Indexes `entry` in the tree of `kind` of the partition its digest
    /// maps to. Returns whether a new entry was added.
    ///
    /// # Errors
    ///
    /// Fails if the arena is exhausted or the tree cannot be walked.
    pub fn index_entry(&mut self, entry: &IndexEntry, kind: TreeKind) -> TreeResult<bool> {
        let partition = &mut self.partitions[entry.partition_id()];
        let added = partition.tree_mut(kind).insert(entry)?;
        if added {
            self.stats.add_object();
        }
        Ok(added)
    }

    /// Entries accounted to every tree of every partition.
    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.tree.element_count() + p.sub_tree.element_count())
            .sum()
    }

    pub(crate) fn reduce_parts(&mut self) -> (&mut [Partition], &DeviceSet, &NamespaceStats, &NamespaceConfig) {
        (&mut self.partitions, &self.devices, &self.stats, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::{setup, SetupOptions};
    use kvindex_core::ShmDir;

    fn memory_namespace(max_ttl: u32) -> Namespace {
        let mut config = NamespaceConfig::memory("test");
        config.max_ttl = max_ttl;
        let options = SetupOptions {
            shm_dir: ShmDir::new("/nonexistent"),
            cold_start: false,
            instance: 0,
        };
        let memory = setup(1, &config, 256, &options).unwrap();
        Namespace::new(1, config, memory, DeviceSet::new(Vec::new()))
    }

    #[test]
    fn test_partitions_opened() {
        let ns = memory_namespace(0);
        assert_eq!(ns.partitions().len(), PARTITIONS);
        assert_eq!(ns.partition(17).unwrap().id(), 17);
        assert!(ns.partition(PARTITIONS).is_none());
        assert!(ns.cold_start());
    }

    #[test]
    fn test_prepare_cold_start_times() {
        let ns = memory_namespace(1000);
        ns.prepare_cold_start_times(500);
        assert_eq!(ns.stats().cold_start_threshold_void_time(), 500);
        assert_eq!(ns.stats().cold_start_max_void_time(), 1500);

        let unbounded = memory_namespace(0);
        unbounded.prepare_cold_start_times(500);
        assert_eq!(unbounded.stats().cold_start_max_void_time(), u32::MAX);
    }

    #[test]
    fn test_index_entry_routes_by_digest() {
        let mut ns = memory_namespace(0);
        let mut digest = [0u8; 20];
        digest[0] = 0x05;
        digest[1] = 0x01;
        let entry = IndexEntry {
            digest,
            ..IndexEntry::default()
        };

        assert!(ns.index_entry(&entry, TreeKind::Primary).unwrap());
        assert!(!ns.index_entry(&entry, TreeKind::Primary).unwrap());
        assert!(ns.index_entry(&entry, TreeKind::Sub).unwrap());

        let partition = ns.partition(0x105).unwrap();
        assert_eq!(partition.tree.element_count(), 1);
        assert_eq!(partition.sub_tree.element_count(), 1);
        assert_eq!(ns.stats().n_objects(), 2);
        assert_eq!(ns.element_count(), 2);
    }

    #[test]
    fn test_now_void_time_after_epoch() {
        // 2020-01-01 is 315_532_800 seconds after the epoch.
        assert!(now_void_time() > 315_532_800);
    }
}
