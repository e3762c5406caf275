//! # KVINDEX Core
//!
//! Staged arena allocator over persistent shared memory.
//!
//! ## Architecture Rules
//!
//! 1. **Geometry is law** - a resumed arena must match its recorded geometry exactly
//! 2. **Handles, not pointers** - elements are reached through borrowed views
//! 3. **No process exits here** - every failure is returned to the caller
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvindex_core::{Arena, ArenaFlags, ArenaGeometry, HeapBacking, RegionCell};
//!
//! let geometry = ArenaGeometry::new(0, 64, 1024, 0, ArenaFlags::BIG_LOCK);
//! let arena = Arena::create(RegionCell::detached(), Box::new(HeapBacking), geometry)?;
//! let handle = arena.alloc()?;
//! arena.resolve_mut(handle)?[0] = 1;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;

pub use error::{ArenaError, ArenaResult, RegionError, RegionResult};
pub use memory::{
    Arena, ArenaControl, ArenaFlags, ArenaGeometry, ElementHandle, HeapBacking, Memory,
    RegionCell, RegionLayout, RegionSlice, SharedRegion, ShmBacking, ShmDir, ShmSegment,
    StageBacking, SubRegion,
};
