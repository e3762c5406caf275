//! # Memory Management
//!
//! Persistent memory for the record index.
//!
//! ## Design Philosophy
//!
//! Everything that must survive a restart lives in key-addressed shared
//! memory and is interpreted by position alone:
//! - Regions are carved by a fixed layout
//! - Arena elements are named by handles, never by addresses
//! - Geometry is checked before a single stage is reattached

mod arena;
mod backing;
mod handle;
mod region;
mod shm;

pub use arena::{Arena, ArenaControl, ArenaFlags, ArenaGeometry};
pub use backing::{HeapBacking, ShmBacking, StageBacking};
pub use handle::ElementHandle;
pub use region::{Memory, RegionCell, RegionLayout, RegionSlice, SharedRegion, SubRegion};
pub use shm::{ShmDir, ShmSegment};

#[cfg(test)]
pub(crate) mod test_support {
    use super::ShmDir;

    /// A fresh, unique shared memory directory under the system temp dir.
    pub(crate) fn temp_shm_dir(tag: &str) -> ShmDir {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        ShmDir::new(std::env::temp_dir().join(format!("kvindex_core_{tag}_{id}")))
    }
}
