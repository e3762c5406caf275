//! # Namespace Memory Setup
//!
//! Lays out the memory of one namespace and decides between a cold start
//! and a warm restart.
//!
//! ## Region Layout
//!
//! ```text
//! [ set map ][ bin map (unless single-bin) ][ arena control ]
//! [ primary tree roots x PARTITIONS ][ sub-record tree roots x PARTITIONS ]
//! ```
//!
//! A device-backed namespace keeps this region, and the arena stages, in
//! shared memory under the namespace key. Anything else gets the same
//! layout on the heap and always starts cold.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use kvindex_core::{
    Arena, ArenaControl, ArenaFlags, ArenaGeometry, HeapBacking, RegionCell, RegionError,
    RegionLayout, RegionSlice, SharedRegion, ShmBacking, ShmDir, StageBacking,
};
use kvindex_shared::{
    namespace_key, NamespaceConfig, SetConfig, BIN_HASH_SIZE, BIN_NAME_MAX_SIZE, MAX_BIN_NAMES,
    PARTITIONS, SET_HASH_SIZE, SET_MAX_COUNT, SET_NAME_MAX_SIZE, SET_VALUE_SIZE,
};
use tracing::{debug, info};

use crate::error::{SetupError, SetupResult, VmapError};
use crate::index::INDEX_RECORD_SIZE;
use crate::tree::TreeRoot;
use crate::vmap::NameMap;

/// Layout part holding the set name map.
pub const SETS_PART: &str = "sets";
/// Layout part holding the bin name map.
pub const BINS_PART: &str = "bins";
/// Layout part holding the arena control block.
pub const ARENA_PART: &str = "arena";
/// Layout part holding primary tree roots.
pub const TREE_ROOTS_PART: &str = "tree_roots";
/// Layout part holding sub-record tree roots.
pub const SUB_TREE_ROOTS_PART: &str = "sub_tree_roots";

/// A set as stored in the set name map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SetEntry {
    /// NUL-padded set name.
    pub name: [u8; SET_NAME_MAX_SIZE as usize],
    /// Object count above which writes stop (0 = unlimited).
    pub stop_writes_count: u64,
    /// Non-zero if eviction skips the set.
    pub disable_eviction: u32,
    _reserved: [u8; 52],
}

const _: () = assert!(std::mem::size_of::<SetEntry>() == SET_VALUE_SIZE as usize);

impl SetEntry {
    /// Builds the stored form of a configured set.
    #[must_use]
    pub fn from_config(config: &SetConfig) -> Self {
        let mut entry = Self::zeroed();
        let len = config.name.len().min(entry.name.len() - 1);
        entry.name[..len].copy_from_slice(&config.name.as_bytes()[..len]);
        entry.stop_writes_count = config.stop_writes_count;
        entry.disable_eviction = u32::from(config.disable_eviction);
        entry
    }

    /// Decodes a value read from the set name map.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == std::mem::size_of::<Self>()).then(|| bytemuck::pod_read_unaligned(bytes))
    }

    /// Set name, up to the first NUL.
    #[must_use]
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Startup facts that apply to every namespace.
#[derive(Clone, Debug)]
pub struct SetupOptions {
    /// Where shared memory segments live.
    pub shm_dir: ShmDir,
    /// Discard persisted memory even when it exists.
    pub cold_start: bool,
    /// Instance number of this node on the host.
    pub instance: u32,
}

/// The memory of one set-up namespace.
#[derive(Debug)]
pub struct NamespaceMemory {
    /// Region holding the maps, arena control block and tree roots.
    pub region: Arc<SharedRegion>,
    /// Layout the region was carved with.
    pub layout: RegionLayout,
    /// Set name map.
    pub sets: NameMap,
    /// Bin name map, absent for single-bin namespaces.
    pub bins: Option<NameMap>,
    /// Index arena.
    pub arena: Arc<Arena>,
    /// Primary tree root per partition.
    pub tree_roots: Vec<RegionCell<TreeRoot>>,
    /// Sub-record tree root per partition.
    pub sub_tree_roots: Vec<RegionCell<TreeRoot>>,
    /// Whether the index starts empty.
    pub cold_start: bool,
}

/// Computes the region layout of a namespace.
#[must_use]
pub fn namespace_layout(single_bin: bool) -> RegionLayout {
    let mut layout =
        RegionLayout::new().push(SETS_PART, NameMap::size_of(SET_VALUE_SIZE, SET_MAX_COUNT));

    if !single_bin {
        layout = layout.push(BINS_PART, NameMap::size_of(BIN_NAME_MAX_SIZE, MAX_BIN_NAMES));
    }

    layout
        .push(ARENA_PART, ArenaControl::SIZE)
        .push(TREE_ROOTS_PART, TreeRoot::SIZE * PARTITIONS)
        .push(SUB_TREE_ROOTS_PART, TreeRoot::SIZE * PARTITIONS)
}

/// Sets up the memory of namespace `ns_id`.
///
/// A device-backed namespace whose data is not in memory attaches its
/// persistent region and resumes it unless the region was just created or
/// a cold start was requested. Every other namespace starts cold on the
/// heap.
///
/// # Errors
///
/// Any failure leaves the namespace unusable and is returned as a
/// [`SetupError`].
pub fn setup(
    ns_id: u32,
    config: &NamespaceConfig,
    stage_capacity: u32,
    options: &SetupOptions,
) -> SetupResult<NamespaceMemory> {
    if config.storage.uses_persistent_index() {
        setup_persistent(ns_id, config, stage_capacity, options)
    } else {
        setup_memory(config, stage_capacity, options)
    }
}

fn setup_persistent(
    ns_id: u32,
    config: &NamespaceConfig,
    stage_capacity: u32,
    options: &SetupOptions,
) -> SetupResult<NamespaceMemory> {
    let key = namespace_key(ns_id);
    let layout = namespace_layout(config.single_bin);

    // A requested cold start replaces the segment, so a region left by a
    // different layout cannot block it.
    let (region, firsttime) = if options.cold_start {
        let firsttime = !options.shm_dir.exists(key);
        SharedRegion::create_fresh(&options.shm_dir, key, layout.total_len())
            .map(|region| (region, firsttime))
    } else {
        SharedRegion::open_or_create(&options.shm_dir, key, layout.total_len())
    }
    .map_err(|source| region_error(config, source))?;

    let fresh = firsttime || options.cold_start;
    if fresh {
        info!(
            ns = %config.name,
            instance = options.instance,
            firsttime,
            "beginning COLD start"
        );
    } else {
        info!(ns = %config.name, instance = options.instance, "beginning WARM restart");
    }

    let backing = ShmBacking::new(options.shm_dir.clone(), key);
    carve(config, region, layout, fresh, Box::new(backing), key, stage_capacity)
}

fn setup_memory(
    config: &NamespaceConfig,
    stage_capacity: u32,
    options: &SetupOptions,
) -> SetupResult<NamespaceMemory> {
    info!(ns = %config.name, instance = options.instance, "beginning COLD start");

    let layout = namespace_layout(config.single_bin);
    let region = SharedRegion::heap(layout.total_len());
    carve(config, region, layout, true, Box::new(HeapBacking), 0, stage_capacity)
}

fn carve(
    config: &NamespaceConfig,
    region: Arc<SharedRegion>,
    layout: RegionLayout,
    fresh: bool,
    backing: Box<dyn StageBacking>,
    key_base: u32,
    stage_capacity: u32,
) -> SetupResult<NamespaceMemory> {
    let ns = config.name.as_str();
    let part = |name: &'static str| -> SetupResult<RegionSlice> {
        layout
            .get(name)
            .and_then(|sub| region.slice(sub))
            .map_err(|source| region_error(config, source))
    };

    // Sets
    let sets_slot = part(SETS_PART)?;
    let sets = if fresh {
        NameMap::create(&sets_slot, SET_VALUE_SIZE, SET_MAX_COUNT, SET_HASH_SIZE, SET_NAME_MAX_SIZE)
    } else {
        NameMap::resume(&sets_slot, SET_HASH_SIZE, SET_NAME_MAX_SIZE)
    }
    .map_err(|source| SetupError::Vmap {
        ns: ns.to_string(),
        map: "sets",
        source,
    })?;

    configure_sets(&sets, config)?;

    // Bins
    let bins = if config.single_bin {
        None
    } else {
        let bins_slot = part(BINS_PART)?;
        let bins = if fresh {
            NameMap::create(&bins_slot, BIN_NAME_MAX_SIZE, MAX_BIN_NAMES, BIN_HASH_SIZE, BIN_NAME_MAX_SIZE)
        } else {
            NameMap::resume(&bins_slot, BIN_HASH_SIZE, BIN_NAME_MAX_SIZE)
        }
        .map_err(|source| SetupError::Vmap {
            ns: ns.to_string(),
            map: "bins",
            source,
        })?;
        Some(bins)
    };

    // Index arena
    let control = layout
        .get(ARENA_PART)
        .and_then(|sub| region.cell::<ArenaControl>(sub))
        .map_err(|source| region_error(config, source))?;
    let geometry = ArenaGeometry::new(
        key_base,
        INDEX_RECORD_SIZE,
        stage_capacity,
        0,
        ArenaFlags::BIG_LOCK,
    );
    let arena = if fresh {
        Arena::create(control, backing, geometry)
    } else {
        Arena::resume(control, backing, geometry)
    }
    .map_err(|source| SetupError::Arena {
        ns: ns.to_string(),
        source,
    })?;

    // Tree roots
    let roots_slot = part(TREE_ROOTS_PART)?;
    let sub_roots_slot = part(SUB_TREE_ROOTS_PART)?;
    if fresh {
        roots_slot.zero();
        sub_roots_slot.zero();
    }
    let tree_roots = roots_slot
        .table::<TreeRoot>()
        .map_err(|source| region_error(config, source))?;
    let sub_tree_roots = sub_roots_slot
        .table::<TreeRoot>()
        .map_err(|source| region_error(config, source))?;

    debug!(
        ns,
        region_len = region.len(),
        stages = arena.stage_count(),
        sets = sets.count(),
        "namespace memory ready"
    );

    Ok(NamespaceMemory {
        region,
        layout,
        sets,
        bins,
        arena: Arc::new(arena),
        tree_roots,
        sub_tree_roots,
        cold_start: fresh,
    })
}

/// Registers every configured set in the set name map. Sets already
/// present, from configuration or a previous run, are accepted.
///
/// # Errors
///
/// Returns [`SetupError::ConfigureSets`] if the map is full or a set name
/// is unusable.
pub fn configure_sets(sets: &NameMap, config: &NamespaceConfig) -> SetupResult<()> {
    for set in &config.sets {
        let entry = SetEntry::from_config(set);
        match sets.put_unique(bytemuck::bytes_of(&entry)) {
            Ok(index) => debug!(ns = %config.name, set = %set.name, index, "added set"),
            Err(VmapError::NameExists { index }) => {
                debug!(ns = %config.name, set = %set.name, index, "set already present");
            }
            Err(source) => {
                return Err(SetupError::ConfigureSets {
                    ns: config.name.clone(),
                    set: set.name.clone(),
                    source,
                });
            }
        }
    }
    Ok(())
}

fn region_error(config: &NamespaceConfig, source: RegionError) -> SetupError {
    SetupError::Region {
        ns: config.name.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_order_and_single_bin() {
        let layout = namespace_layout(false);
        let names: Vec<_> = layout.parts().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![SETS_PART, BINS_PART, ARENA_PART, TREE_ROOTS_PART, SUB_TREE_ROOTS_PART]
        );

        let single = namespace_layout(true);
        assert!(!single.contains(BINS_PART));
        assert!(single.total_len() < layout.total_len());
        assert_eq!(
            single.get(TREE_ROOTS_PART).unwrap().len,
            TreeRoot::SIZE * PARTITIONS
        );
    }

    #[test]
    fn test_set_entry_name() {
        let entry = SetEntry::from_config(&SetConfig {
            name: "users".to_string(),
            stop_writes_count: 10,
            disable_eviction: true,
        });
        assert_eq!(entry.name(), "users");
        assert_eq!(entry.disable_eviction, 1);

        let decoded = SetEntry::from_bytes(bytemuck::bytes_of(&entry)).unwrap();
        assert_eq!(decoded, entry);
        assert!(SetEntry::from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_memory_setup_is_cold() {
        let mut config = NamespaceConfig::memory("test");
        config.sets = vec![SetConfig {
            name: "s1".to_string(),
            stop_writes_count: 0,
            disable_eviction: false,
        }];
        let options = SetupOptions {
            shm_dir: ShmDir::new("/nonexistent"),
            cold_start: false,
            instance: 0,
        };

        let memory = setup(1, &config, 1024, &options).unwrap();
        assert!(memory.cold_start);
        assert!(memory.region.key().is_none());
        assert_eq!(memory.sets.get_index("s1").unwrap(), 0);
        assert!(memory.bins.is_some());
        assert_eq!(memory.arena.geometry().key_base, 0);
        assert_eq!(memory.arena.geometry().stage_capacity, 1024);
        assert_eq!(memory.tree_roots.len(), PARTITIONS);
        assert_eq!(memory.sub_tree_roots.len(), PARTITIONS);
    }

    #[test]
    fn test_configure_sets_accepts_existing() {
        let mut config = NamespaceConfig::memory("test");
        config.single_bin = true;
        let options = SetupOptions {
            shm_dir: ShmDir::new("/nonexistent"),
            cold_start: false,
            instance: 0,
        };
        let memory = setup(1, &config, 1024, &options).unwrap();
        assert!(memory.bins.is_none());

        config.sets = vec![
            SetConfig {
                name: "a".to_string(),
                stop_writes_count: 0,
                disable_eviction: false,
            };
            2
        ];
        configure_sets(&memory.sets, &config).unwrap();
        configure_sets(&memory.sets, &config).unwrap();
        assert_eq!(memory.sets.count(), 1);
    }
}
