//! # Cold-Start Reducer
//!
//! After a warm restart the index trees are back but nothing else is:
//! device usage, per-device recovery counters, object counts and max void
//! times all start at zero. The reducer walks every owned partition once
//! and rebuilds them, dropping entries that expired while the node was
//! down or that now exceed the namespace max TTL.
//!
//! Every counter is additive, so the order in which partitions and
//! entries are visited does not change the result.

use std::ops::AddAssign;

use tracing::{debug, info, trace, warn};

use kvindex_shared::rblocks_to_bytes;

use crate::device::DeviceSet;
use crate::error::ColdStartError;
use crate::index::{partition_id, IndexEntry};
use crate::namespace::{Namespace, NamespaceStats, Partition, PartitionInfo, TreeKind};
use crate::tree::{IndexTree, Visit};

/// What happened to one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Kept and accounted.
    Kept,
    /// Deleted: void time before the startup threshold.
    Expired,
    /// Deleted: void time past the max-TTL cutoff.
    ExceededMaxTtl,
    /// Left alone: the digest belongs to another partition.
    MisroutedPartitionEntry,
    /// Left alone: no device has the entry's file id.
    OrphanedDeviceReference,
    /// Left alone: the entry points past the end of its device.
    BlockOutOfRange,
}

impl EntryOutcome {
    /// Tree verdict for this outcome.
    #[must_use]
    pub const fn visit(self) -> Visit {
        match self {
            Self::Expired | Self::ExceededMaxTtl => Visit::Delete,
            _ => Visit::Keep,
        }
    }
}

/// Totals of one reduction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReduceSummary {
    /// Partitions walked.
    pub partitions: u64,
    /// Partitions skipped because this node does not own them.
    pub skipped_partitions: u64,
    /// Entries kept.
    pub kept: u64,
    /// Entries deleted as expired.
    pub expired: u64,
    /// Entries deleted for exceeding the max TTL.
    pub max_ttl: u64,
    /// Entries found in the wrong partition.
    pub misrouted: u64,
    /// Entries naming an unknown device.
    pub orphaned: u64,
    /// Entries pointing past the end of their device.
    pub out_of_range: u64,
}

impl ReduceSummary {
    fn record(&mut self, outcome: EntryOutcome) {
        let slot = match outcome {
            EntryOutcome::Kept => &mut self.kept,
            EntryOutcome::Expired => &mut self.expired,
            EntryOutcome::ExceededMaxTtl => &mut self.max_ttl,
            EntryOutcome::MisroutedPartitionEntry => &mut self.misrouted,
            EntryOutcome::OrphanedDeviceReference => &mut self.orphaned,
            EntryOutcome::BlockOutOfRange => &mut self.out_of_range,
        };
        *slot += 1;
    }

    /// Entries left in the trees but not accounted.
    #[must_use]
    pub const fn rejected(&self) -> u64 {
        self.misrouted + self.orphaned + self.out_of_range
    }
}

impl AddAssign for ReduceSummary {
    fn add_assign(&mut self, other: Self) {
        self.partitions += other.partitions;
        self.skipped_partitions += other.skipped_partitions;
        self.kept += other.kept;
        self.expired += other.expired;
        self.max_ttl += other.max_ttl;
        self.misrouted += other.misrouted;
        self.orphaned += other.orphaned;
        self.out_of_range += other.out_of_range;
    }
}

/// What the per-entry step reads from the namespace.
#[derive(Clone, Copy, Debug)]
pub struct ReduceContext<'a> {
    /// Devices and partition ownership.
    pub devices: &'a DeviceSet,
    /// Namespace counters.
    pub stats: &'a NamespaceStats,
    /// Namespace max TTL in seconds (0 = unlimited).
    pub max_ttl: u32,
    /// Namespace name, for logs.
    pub ns: &'a str,
}

/// Decides the fate of one entry found in `partition`'s tree of `kind`,
/// updating every counter a kept entry contributes to.
///
/// The tree's element count is left to the caller.
pub fn reduce_entry(
    ctx: &ReduceContext<'_>,
    partition: &PartitionInfo,
    kind: TreeKind,
    entry: &IndexEntry,
) -> EntryOutcome {
    let pid = partition.id();

    let digest_pid = partition_id(&entry.digest);
    if digest_pid != pid {
        warn!(ns = ctx.ns, pid, digest_pid, "index entry in wrong partition, skipping");
        return EntryOutcome::MisroutedPartitionEntry;
    }

    let Some(device) = ctx.devices.find_by_file_id(entry.file_id) else {
        warn!(ns = ctx.ns, pid, file_id = entry.file_id, "index entry names unknown device, skipping");
        return EntryOutcome::OrphanedDeviceReference;
    };

    if entry.void_time != 0 {
        // Read per entry: eviction may raise the threshold while we walk.
        if entry.void_time < ctx.stats.cold_start_threshold_void_time() {
            trace!(ns = ctx.ns, pid, void_time = entry.void_time, "dropping expired entry");
            device.recovery().add_expired();
            return EntryOutcome::Expired;
        }

        if ctx.max_ttl != 0
            && kind == TreeKind::Primary
            && entry.void_time > ctx.stats.cold_start_max_void_time()
        {
            debug!(ns = ctx.ns, pid, void_time = entry.void_time, "dropping entry past max-ttl");
            device.recovery().add_max_ttl();
            return EntryOutcome::ExceededMaxTtl;
        }
    }

    let wblock_id = device.wblock_id(entry.rblock_id);
    if wblock_id >= device.n_wblocks() as u64 {
        warn!(
            ns = ctx.ns,
            pid,
            device = device.name(),
            rblock_id = entry.rblock_id,
            wblock_id,
            "index entry points past end of device, skipping"
        );
        return EntryOutcome::BlockOutOfRange;
    }

    partition.raise_max_void_time(entry.void_time);
    ctx.stats.raise_max_void_time(entry.void_time);
    device.recovery().add_unique();
    device.add_inuse(wblock_id, rblocks_to_bytes(entry.n_rblocks));
    ctx.stats.add_object();

    EntryOutcome::Kept
}

/// Rebuilds device accounting from the resumed index of `ns`.
///
/// Every partition this node owns has its primary tree reduced, then its
/// sub-record tree. Runs once, on trees just resumed from persistent
/// memory, whose element counts start at zero.
///
/// # Errors
///
/// Fails if a tree cannot be walked. Individual bad entries never fail the
/// reduction; they are logged and counted.
pub fn resume_devices(ns: &mut Namespace) -> Result<ReduceSummary, ColdStartError> {
    let (partitions, devices, stats, config) = ns.reduce_parts();
    let ctx = ReduceContext {
        devices,
        stats,
        max_ttl: config.max_ttl,
        ns: &config.name,
    };

    let mut summary = ReduceSummary::default();
    for partition in partitions.iter_mut() {
        if !devices.owns_partition(partition.id()) {
            summary.skipped_partitions += 1;
            continue;
        }

        for kind in [TreeKind::Primary, TreeKind::Sub] {
            summary += reduce_tree(&ctx, partition, kind)?;
        }
        summary.partitions += 1;
    }

    info!(
        ns = ctx.ns,
        partitions = summary.partitions,
        kept = summary.kept,
        expired = summary.expired,
        max_ttl = summary.max_ttl,
        rejected = summary.rejected(),
        "rebuilt index accounting"
    );

    Ok(summary)
}

fn reduce_tree(
    ctx: &ReduceContext<'_>,
    partition: &mut Partition,
    kind: TreeKind,
) -> Result<ReduceSummary, ColdStartError> {
    let mut summary = ReduceSummary::default();
    let pid = partition.id();
    let (tree, info) = partition.split_tree(kind);

    tree.reduce_sync(&mut |entry| {
        let outcome = reduce_entry(ctx, info, kind, entry);
        summary.record(outcome);
        outcome.visit()
    })
    .map_err(|source| ColdStartError::Tree {
        ns: ctx.ns.to_string(),
        partition: pid,
        tree: kind.as_str(),
        source,
    })?;

    tree.add_elements(summary.kept);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvindex_core::ShmDir;
    use kvindex_shared::{DeviceConfig, NamespaceConfig};

    use crate::setup::{setup, SetupOptions};

    fn namespace(max_ttl: u32) -> Namespace {
        let device = DeviceConfig {
            name: "/dev/d0".to_string(),
            file_id: 1,
            size: 4 * 1024 * 1024,
            write_block_size: 1024 * 1024,
        };
        let mut config = NamespaceConfig::memory("test");
        config.max_ttl = max_ttl;
        let options = SetupOptions {
            shm_dir: ShmDir::new("/nonexistent"),
            cold_start: false,
            instance: 0,
        };
        let memory = setup(1, &config, 256, &options).unwrap();
        Namespace::new(1, config, memory, DeviceSet::from_configs(&[device]))
    }

    fn entry(key: u8, void_time: u32) -> IndexEntry {
        let mut digest = [0u8; 20];
        digest[0] = 3;
        digest[10] = key;
        IndexEntry {
            digest,
            void_time,
            file_id: 1,
            rblock_id: u64::from(key) * 8192,
            n_rblocks: 2,
            ..IndexEntry::default()
        }
    }

    #[test]
    fn test_entry_outcomes() {
        let ns = namespace(1000);
        ns.prepare_cold_start_times(500);
        let ctx = ReduceContext {
            devices: ns.devices(),
            stats: ns.stats(),
            max_ttl: 1000,
            ns: "test",
        };
        let partition = ns.partition(3).unwrap().info();

        assert_eq!(reduce_entry(&ctx, partition, TreeKind::Primary, &entry(0, 0)), EntryOutcome::Kept);
        assert_eq!(reduce_entry(&ctx, partition, TreeKind::Primary, &entry(1, 400)), EntryOutcome::Expired);
        assert_eq!(reduce_entry(&ctx, partition, TreeKind::Primary, &entry(2, 1501)), EntryOutcome::ExceededMaxTtl);
        assert_eq!(reduce_entry(&ctx, partition, TreeKind::Sub, &entry(2, 1501)), EntryOutcome::Kept);

        let other = ns.partition(4).unwrap().info();
        assert_eq!(
            reduce_entry(&ctx, other, TreeKind::Primary, &entry(0, 0)),
            EntryOutcome::MisroutedPartitionEntry
        );

        let mut orphan = entry(0, 0);
        orphan.file_id = 9;
        assert_eq!(
            reduce_entry(&ctx, partition, TreeKind::Primary, &orphan),
            EntryOutcome::OrphanedDeviceReference
        );

        assert_eq!(
            reduce_entry(&ctx, partition, TreeKind::Primary, &entry(4, 0)),
            EntryOutcome::BlockOutOfRange
        );

        let device = ns.devices().find_by_file_id(1).unwrap();
        assert_eq!(device.recovery().unique(), 2);
        assert_eq!(device.recovery().expired(), 1);
        assert_eq!(device.recovery().max_ttl(), 1);
        assert_eq!(device.wblock_inuse(0), Some(256));
        assert_eq!(device.wblock_inuse(2), Some(256));
        assert_eq!(device.inuse_size(), 512);
        assert_eq!(ns.stats().n_objects(), 2);
        assert_eq!(ns.stats().max_void_time(), 1501);
        assert_eq!(partition.max_void_time(), 1501);
    }

    #[test]
    fn test_unowned_partitions_skipped() {
        let mut ns = namespace(0);
        ns.index_entry(&entry(1, 0), TreeKind::Primary).unwrap();
        ns.devices_mut().set_partition_owned(3, false);

        let summary = resume_devices(&mut ns).unwrap();
        assert_eq!(summary.skipped_partitions, 1);
        assert_eq!(summary.partitions, kvindex_shared::PARTITIONS as u64 - 1);
        assert_eq!(summary.kept, 0);
        assert_eq!(ns.devices().inuse_size(), 0);
    }
}
