//! # Devices
//!
//! Usage accounting for the devices of a namespace. None of it is
//! persisted: the cold-start reducer rebuilds it from the index.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kvindex_shared::{DeviceConfig, PARTITIONS, RBLOCK_SIZE};
use tracing::warn;

/// Per-device counters filled while rebuilding the index.
#[derive(Debug, Default)]
pub struct RecoveryCounters {
    expired: AtomicU64,
    max_ttl: AtomicU64,
    unique: AtomicU64,
}

impl RecoveryCounters {
    /// Entries dropped because they had expired.
    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Entries dropped because they outlived the max TTL.
    #[must_use]
    pub fn max_ttl(&self) -> u64 {
        self.max_ttl.load(Ordering::Relaxed)
    }

    /// Entries kept.
    #[must_use]
    pub fn unique(&self) -> u64 {
        self.unique.load(Ordering::Relaxed)
    }

    pub(crate) fn add_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_max_ttl(&self) {
        self.max_ttl.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_unique(&self) {
        self.unique.fetch_add(1, Ordering::Relaxed);
    }
}

/// One storage device.
#[derive(Debug)]
pub struct Device {
    name: String,
    file_id: u32,
    write_block_size: u32,
    inuse_size: AtomicU64,
    wblock_inuse: Box<[AtomicU32]>,
    recovery: RecoveryCounters,
}

impl Device {
    /// Creates a device with empty accounting.
    #[must_use]
    pub fn new(config: &DeviceConfig) -> Self {
        let n_wblocks = config
            .size
            .checked_div(u64::from(config.write_block_size))
            .unwrap_or(0);

        Self {
            name: config.name.clone(),
            file_id: config.file_id,
            write_block_size: config.write_block_size,
            inuse_size: AtomicU64::new(0),
            wblock_inuse: (0..n_wblocks).map(|_| AtomicU32::new(0)).collect(),
            recovery: RecoveryCounters::default(),
        }
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier index entries use to name this device.
    #[must_use]
    pub const fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Write-block size in bytes.
    #[must_use]
    pub const fn write_block_size(&self) -> u32 {
        self.write_block_size
    }

    /// Number of write blocks.
    #[must_use]
    pub fn n_wblocks(&self) -> usize {
        self.wblock_inuse.len()
    }

    /// Write block containing read block `rblock_id`.
    #[inline]
    #[must_use]
    pub fn wblock_id(&self, rblock_id: u64) -> u64 {
        rblock_id.saturating_mul(RBLOCK_SIZE) / u64::from(self.write_block_size.max(1))
    }

    /// Bytes in use on the device.
    #[must_use]
    pub fn inuse_size(&self) -> u64 {
        self.inuse_size.load(Ordering::Relaxed)
    }

    /// Bytes in use in write block `wblock_id`, if it exists.
    #[must_use]
    pub fn wblock_inuse(&self, wblock_id: u64) -> Option<u32> {
        let slot = usize::try_from(wblock_id).ok()?;
        self.wblock_inuse.get(slot).map(|w| w.load(Ordering::Relaxed))
    }

    /// Recovery counters.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryCounters {
        &self.recovery
    }

    /// Accounts `size` bytes to write block `wblock_id` and the device.
    /// Returns `false`, changing nothing, if the block does not exist or
    /// `size` cannot fit in a block counter.
    pub(crate) fn add_inuse(&self, wblock_id: u64, size: u64) -> bool {
        let Some(block) = usize::try_from(wblock_id)
            .ok()
            .and_then(|slot| self.wblock_inuse.get(slot))
        else {
            return false;
        };
        let Ok(block_size) = u32::try_from(size) else {
            warn!(device = %self.name, wblock_id, size, "record size overflows write block counter");
            return false;
        };

        block.fetch_add(block_size, Ordering::Relaxed);
        self.inuse_size.fetch_add(size, Ordering::Relaxed);
        true
    }
}

/// Which partitions of a namespace this node owns at startup.
pub trait PartitionOwnership {
    /// Whether this node owns partition `pid` of namespace `ns`.
    fn owns(&self, ns: &str, pid: usize) -> bool;
}

/// Owns every partition of every namespace, as a lone node does.
#[derive(Clone, Copy, Debug, Default)]
pub struct OwnAll;

impl PartitionOwnership for OwnAll {
    fn owns(&self, _ns: &str, _pid: usize) -> bool {
        true
    }
}

impl<F: Fn(&str, usize) -> bool> PartitionOwnership for F {
    fn owns(&self, ns: &str, pid: usize) -> bool {
        self(ns, pid)
    }
}

/// The devices of one namespace plus which partitions this node owns.
#[derive(Debug)]
pub struct DeviceSet {
    devices: Vec<Device>,
    owned: Box<[bool]>,
}

impl DeviceSet {
    /// Creates a set that owns every partition.
    #[must_use]
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            owned: vec![true; PARTITIONS].into_boxed_slice(),
        }
    }

    /// Creates a set from device configurations.
    #[must_use]
    pub fn from_configs(configs: &[DeviceConfig]) -> Self {
        Self::new(configs.iter().map(Device::new).collect())
    }

    /// Device whose file id is `file_id`.
    #[must_use]
    pub fn find_by_file_id(&self, file_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.file_id == file_id)
    }

    /// Whether this node owns partition `pid`.
    #[must_use]
    pub fn owns_partition(&self, pid: usize) -> bool {
        self.owned.get(pid).copied().unwrap_or(false)
    }

    /// Takes the ownership of every partition of namespace `ns` from
    /// `ownership`.
    pub fn apply_ownership(&mut self, ns: &str, ownership: &impl PartitionOwnership) {
        for (pid, flag) in self.owned.iter_mut().enumerate() {
            *flag = ownership.owns(ns, pid);
        }
    }

    /// Marks partition `pid` owned or not.
    pub fn set_partition_owned(&mut self, pid: usize, owned: bool) {
        if let Some(flag) = self.owned.get_mut(pid) {
            *flag = owned;
        }
    }

    /// Devices in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the set has no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Bytes in use across all devices.
    #[must_use]
    pub fn inuse_size(&self) -> u64 {
        self.devices.iter().map(Device::inuse_size).sum()
    }
}
