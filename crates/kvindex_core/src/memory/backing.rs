//! # Stage Backings
//!
//! Where arena stages come from. Chosen once, when the arena is built.
//!
//! - [`HeapBacking`]: process-local memory, gone on exit
//! - [`ShmBacking`]: one shared memory segment per stage, keyed
//!   `key_base + STAGE_KEY_OFFSET + stage_id`

use std::fmt;
use std::io::{self, ErrorKind};

use kvindex_shared::STAGE_KEY_OFFSET;

use crate::memory::region::Memory;
use crate::memory::shm::ShmDir;

/// Source of arena stage memory.
pub trait StageBacking: Send + Sync + fmt::Debug {
    /// Persistence key base recorded in the arena control block
    /// (0 for process-local memory).
    fn key_base(&self) -> u32;

    /// Obtains the memory of stage `stage_id`, `stage_size` bytes long.
    ///
    /// A persistent backing returns the same bytes for the same stage id
    /// across processes.
    ///
    /// # Errors
    ///
    /// Fails if the memory cannot be allocated or attached.
    fn attach_stage(&self, stage_id: u32, stage_size: u64) -> io::Result<Memory>;

    /// Obtains zeroed memory for a new stage `stage_id`, discarding
    /// anything a previous process left under the same stage id.
    ///
    /// # Errors
    ///
    /// Fails if the memory cannot be allocated or attached.
    fn create_stage(&self, stage_id: u32, stage_size: u64) -> io::Result<Memory> {
        self.attach_stage(stage_id, stage_size)
    }
}

/// Stages allocated from the process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapBacking;

impl StageBacking for HeapBacking {
    fn key_base(&self) -> u32 {
        0
    }

    fn attach_stage(&self, _stage_id: u32, stage_size: u64) -> io::Result<Memory> {
        let len = usize::try_from(stage_size)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "stage too large"))?;

        Memory::try_zeroed(len).map_err(|e| io::Error::new(ErrorKind::OutOfMemory, e))
    }
}

/// Stages held in key-addressed shared memory segments.
#[derive(Clone, Debug)]
pub struct ShmBacking {
    dir: ShmDir,
    key_base: u32,
}

impl ShmBacking {
    /// Creates a backing whose stage keys derive from `key_base`.
    #[must_use]
    pub fn new(dir: ShmDir, key_base: u32) -> Self {
        Self { dir, key_base }
    }

    /// Persistence key of stage `stage_id`.
    #[inline]
    #[must_use]
    pub const fn stage_key(&self, stage_id: u32) -> u32 {
        self.key_base + STAGE_KEY_OFFSET + stage_id
    }
}

impl StageBacking for ShmBacking {
    fn key_base(&self) -> u32 {
        self.key_base
    }

    fn attach_stage(&self, stage_id: u32, stage_size: u64) -> io::Result<Memory> {
        let (segment, _created) = self.dir.open_or_create(self.stage_key(stage_id), stage_size)?;
        Ok(Memory::Mapped(segment.attach()?))
    }

    fn create_stage(&self, stage_id: u32, stage_size: u64) -> io::Result<Memory> {
        let segment = self.dir.create_fresh(self.stage_key(stage_id), stage_size)?;
        Ok(Memory::Mapped(segment.attach()?))
    }
}
