//! # Staged Arena Allocator
//!
//! A bump allocator over fixed-size elements, grown one fixed-size stage
//! at a time and able to outlive the process.
//!
//! ```text
//! stage 0: [null][e1][e2] ... [e(cap-1)]
//! stage 1: [e0  ][e1][e2] ... [e(cap-1)]
//!              ^ cursor (at_stage_id = 1, at_element_id = 1)
//! ```
//!
//! The geometry and cursor live in an [`ArenaControl`] block inside a
//! persistent region. A later process *resumes* the arena by checking the
//! geometry it wants against the recorded one and reattaching every stage
//! in order. Elements are never freed individually.

use kvindex_shared::{MAX_STAGES, MAX_STAGE_CAPACITY, MAX_STAGE_SIZE};
use bytemuck::{Pod, Zeroable};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::{ArenaError, ArenaResult};
use crate::memory::backing::StageBacking;
use crate::memory::handle::ElementHandle;
use crate::memory::region::{Memory, RegionCell};

/// Arena behavior flags, persisted with the geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArenaFlags(u32);

impl ArenaFlags {
    /// No flags.
    pub const NONE: Self = Self(0);

    /// Serialize cursor and stage-count mutations on one arena-wide lock.
    pub const BIG_LOCK: Self = Self(1);

    /// Every defined flag.
    const ALL: u32 = Self::BIG_LOCK.0;

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Parses raw bits, rejecting undefined ones.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Whether every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ArenaFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Arena geometry: everything that is physically baked into its stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaGeometry {
    /// Persistence key base (0 = process-local).
    pub key_base: u32,
    /// Bytes per element.
    pub element_size: u32,
    /// Elements per stage (0 = [`MAX_STAGE_CAPACITY`]).
    pub stage_capacity: u32,
    /// Stage limit (0 = [`MAX_STAGES`]).
    pub max_stages: u32,
    /// Behavior flags.
    pub flags: ArenaFlags,
}

impl ArenaGeometry {
    /// Creates a geometry. Zero capacity or stage limit select defaults.
    #[must_use]
    pub const fn new(
        key_base: u32,
        element_size: u32,
        stage_capacity: u32,
        max_stages: u32,
        flags: ArenaFlags,
    ) -> Self {
        Self {
            key_base,
            element_size,
            stage_capacity,
            max_stages,
            flags,
        }
    }

    /// Replaces zero values with defaults and enforces hard limits.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::BadParameter`] if a value exceeds its limit.
    pub fn normalized(mut self) -> ArenaResult<Self> {
        if self.element_size == 0 {
            return Err(ArenaError::BadParameter("element size is zero".to_string()));
        }

        if self.stage_capacity == 0 {
            self.stage_capacity = MAX_STAGE_CAPACITY;
        } else if self.stage_capacity > MAX_STAGE_CAPACITY {
            warn!(stage_capacity = self.stage_capacity, "stage capacity too large");
            return Err(ArenaError::BadParameter(format!(
                "stage capacity {} too large",
                self.stage_capacity
            )));
        }

        if self.max_stages == 0 {
            self.max_stages = MAX_STAGES;
        } else if self.max_stages > MAX_STAGES {
            warn!(max_stages = self.max_stages, "max stages too large");
            return Err(ArenaError::BadParameter(format!(
                "max stages {} too large",
                self.max_stages
            )));
        }

        let stage_size = self.stage_size();
        if stage_size > MAX_STAGE_SIZE {
            warn!(stage_size, "stage size too large");
            return Err(ArenaError::BadParameter(format!(
                "stage size {stage_size} too large"
            )));
        }

        Ok(self)
    }

    /// Bytes per stage.
    #[inline]
    #[must_use]
    pub const fn stage_size(&self) -> u64 {
        self.stage_capacity as u64 * self.element_size as u64
    }

    /// Checks this geometry against the one recorded in `persisted`.
    fn verify(&self, persisted: &ArenaControl) -> ArenaResult<()> {
        let checks: [(&'static str, u64, u64); 6] = [
            ("key_base", persisted.key_base.into(), self.key_base.into()),
            ("element_size", persisted.element_size.into(), self.element_size.into()),
            ("stage_capacity", persisted.stage_capacity.into(), self.stage_capacity.into()),
            ("max_stages", persisted.max_stages.into(), self.max_stages.into()),
            ("flags", persisted.flags.into(), self.flags.bits().into()),
            ("stage_size", persisted.stage_size, self.stage_size()),
        ];

        for (field, persisted, requested) in checks {
            if persisted != requested {
                return Err(ArenaError::GeometryMismatch {
                    field,
                    persisted,
                    requested,
                });
            }
        }

        Ok(())
    }
}

/// Persisted arena state: geometry, stage count and allocation cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ArenaControl {
    /// Bytes per stage.
    pub stage_size: u64,
    /// Persistence key base.
    pub key_base: u32,
    /// Bytes per element.
    pub element_size: u32,
    /// Elements per stage.
    pub stage_capacity: u32,
    /// Stage limit.
    pub max_stages: u32,
    /// Raw [`ArenaFlags`].
    pub flags: u32,
    /// Stages attached so far.
    pub stage_count: u32,
    /// Stage holding the next free element.
    pub at_stage_id: u32,
    /// Next free element within `at_stage_id`.
    pub at_element_id: u32,
}

impl ArenaControl {
    /// Size of the control block inside a region.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    fn fresh(geometry: &ArenaGeometry) -> Self {
        Self {
            stage_size: geometry.stage_size(),
            key_base: geometry.key_base,
            element_size: geometry.element_size,
            stage_capacity: geometry.stage_capacity,
            max_stages: geometry.max_stages,
            flags: geometry.flags.bits(),
            stage_count: 0,
            at_stage_id: 0,
            at_element_id: 0,
        }
    }
}

/// A staged arena of fixed-size elements.
///
/// # Thread Safety
///
/// With [`ArenaFlags::BIG_LOCK`] every allocation and stage addition
/// holds one arena-wide mutex. Without it, callers that allocate
/// concurrently must serialize themselves. Element access is always
/// safe: stages sit behind a read-write lock, so growing the stage table
/// never invalidates a borrowed element.
///
/// A guard returned by [`Arena::resolve`] or [`Arena::resolve_mut`] holds
/// the stage table lock. Calling [`Arena::alloc`], [`Arena::add_stage`] or
/// [`Arena::resolve_mut`] on the same thread while such a guard is alive
/// deadlocks. Use [`Arena::read`] and [`Arena::write`], which copy, when
/// the element must outlive the next arena call.
#[derive(Debug)]
pub struct Arena {
    /// Normalized geometry.
    geometry: ArenaGeometry,
    /// Persisted control block.
    control: RegionCell<ArenaControl>,
    /// Where stages come from.
    backing: Box<dyn StageBacking>,
    /// Attached stages, in stage id order.
    stages: RwLock<Vec<Memory>>,
    /// Arena-wide lock, present iff `BIG_LOCK` is set.
    lock: Option<Mutex<()>>,
}

impl Arena {
    fn unattached(
        control: RegionCell<ArenaControl>,
        backing: Box<dyn StageBacking>,
        geometry: ArenaGeometry,
    ) -> ArenaResult<Self> {
        if backing.key_base() != geometry.key_base {
            return Err(ArenaError::BadParameter(format!(
                "key base {:#x} does not match stage backing key base {:#x}",
                geometry.key_base,
                backing.key_base()
            )));
        }

        let lock = geometry.flags.contains(ArenaFlags::BIG_LOCK).then(|| Mutex::new(()));

        Ok(Self {
            geometry,
            control,
            backing,
            stages: RwLock::new(Vec::new()),
            lock,
        })
    }

    /// Creates a new arena, overwriting whatever `control` held.
    ///
    /// Attaches stage 0 and reserves its first element as the null handle.
    ///
    /// # Errors
    ///
    /// Fails on invalid geometry or if stage 0 cannot be attached.
    pub fn create(
        control: RegionCell<ArenaControl>,
        backing: Box<dyn StageBacking>,
        geometry: ArenaGeometry,
    ) -> ArenaResult<Self> {
        let geometry = geometry.normalized()?;
        let arena = Self::unattached(control, backing, geometry)?;

        arena.control.store(&ArenaControl::fresh(&geometry));
        arena.add_stage_unlocked()?;
        arena.control.update(|c| c.at_element_id = 1);

        debug!(
            key_base = geometry.key_base,
            element_size = geometry.element_size,
            stage_capacity = geometry.stage_capacity,
            "created arena"
        );

        Ok(arena)
    }

    /// Resumes an arena from the control block a previous process left.
    ///
    /// The requested geometry must match the recorded one exactly; it is
    /// checked before any stage is attached. Stages `0..stage_count` are
    /// then reattached in order. The allocation cursor is left untouched.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::BadParameter`] if the requested geometry exceeds a limit
    /// - [`ArenaError::GeometryMismatch`] if it differs from the recorded one
    /// - [`ArenaError::CorruptControl`] if the recorded stage count or
    ///   cursor cannot belong to a created arena
    /// - [`ArenaError::StageCreateFailed`] if a stage cannot be reattached
    pub fn resume(
        control: RegionCell<ArenaControl>,
        backing: Box<dyn StageBacking>,
        geometry: ArenaGeometry,
    ) -> ArenaResult<Self> {
        let geometry = geometry.normalized()?;
        let persisted = control.load();
        geometry.verify(&persisted)?;

        // A block with no stages is what an interrupted create leaves behind.
        if persisted.stage_count == 0
            || persisted.stage_count > persisted.max_stages
            || persisted.at_stage_id >= persisted.stage_count
            || persisted.at_element_id > persisted.stage_capacity
        {
            return Err(ArenaError::CorruptControl {
                stage_count: persisted.stage_count,
                at_stage_id: persisted.at_stage_id,
                at_element_id: persisted.at_element_id,
            });
        }

        let arena = Self::unattached(control, backing, geometry)?;
        {
            let mut stages = arena.stages.write();
            for _ in 0..persisted.stage_count {
                arena.attach_next(&mut stages, false)?;
            }
        }

        info!(
            key_base = geometry.key_base,
            stages = persisted.stage_count,
            at_stage = persisted.at_stage_id,
            at_element = persisted.at_element_id,
            "resumed arena"
        );

        Ok(arena)
    }

    /// Attaches the next stage and appends it to `stages`. A `fresh` stage
    /// replaces whatever its backing held before.
    fn attach_next(&self, stages: &mut RwLockWriteGuard<'_, Vec<Memory>>, fresh: bool) -> ArenaResult<u32> {
        let stage_id = stages.len() as u32;
        if stage_id >= self.geometry.max_stages {
            return Err(ArenaError::StageLimitExceeded {
                max_stages: self.geometry.max_stages,
            });
        }

        let stage_size = self.geometry.stage_size();
        let attached = if fresh {
            self.backing.create_stage(stage_id, stage_size)
        } else {
            self.backing.attach_stage(stage_id, stage_size)
        };
        let memory = attached.map_err(|source| {
                warn!(stage_id, stage_size, error = %source, "could not attach arena stage");
                ArenaError::StageCreateFailed {
                    stage_id,
                    stage_size,
                    source,
                }
            })?;

        stages.push(memory);
        Ok(stage_id)
    }

    fn add_stage_unlocked(&self) -> ArenaResult<u32> {
        let mut stages = self.stages.write();
        let stage_id = self.attach_next(&mut stages, true)?;
        self.control.update(|c| c.stage_count = stage_id + 1);

        debug!(stage_id, "added arena stage");
        Ok(stage_id)
    }

    /// Adds one stage.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::StageLimitExceeded`] if all stages are attached
    /// - [`ArenaError::StageCreateFailed`] if the stage cannot be obtained
    ///
    /// Neither error changes the arena.
    pub fn add_stage(&self) -> ArenaResult<u32> {
        let _guard = self.lock.as_ref().map(|lock| lock.lock());
        self.add_stage_unlocked()
    }

    /// Allocates one zeroed element.
    ///
    /// # Errors
    ///
    /// Fails when the current stage is full and no further stage can be
    /// added.
    pub fn alloc(&self) -> ArenaResult<ElementHandle> {
        let _guard = self.lock.as_ref().map(|lock| lock.lock());

        let cursor = self.control.load();
        let mut handle = ElementHandle::new(cursor.at_stage_id, cursor.at_element_id);
        if cursor.at_element_id >= cursor.stage_capacity {
            let next = cursor.at_stage_id + 1;
            if next >= cursor.stage_count {
                self.add_stage_unlocked()?;
            }
            handle = ElementHandle::new(next, 0);
        }

        // The cursor only moves once the element is known to exist.
        {
            let mut stages = self.stages.write();
            let size = self.geometry.element_size as usize;
            let start = handle.element_id() as usize * size;
            let stage = stages
                .get_mut(handle.stage_id() as usize)
                .ok_or(ArenaError::InvalidHandle(handle.to_raw()))?;
            stage[start..start + size].fill(0);
        }

        self.control.update(|c| {
            c.at_stage_id = handle.stage_id();
            c.at_element_id = handle.element_id() + 1;
        });
        Ok(handle)
    }

    fn check_handle(&self, handle: ElementHandle) -> ArenaResult<std::ops::Range<usize>> {
        let cursor = self.control.load();
        let allocated = handle.stage_id() < cursor.at_stage_id
            || (handle.stage_id() == cursor.at_stage_id && handle.element_id() < cursor.at_element_id);

        if handle.is_null() || !allocated || handle.element_id() >= self.geometry.stage_capacity {
            return Err(ArenaError::InvalidHandle(handle.to_raw()));
        }

        let size = self.geometry.element_size as usize;
        let start = handle.element_id() as usize * size;
        Ok(start..start + size)
    }

    /// Borrows the bytes of an allocated element.
    ///
    /// The guard holds the stage table lock; see the
    /// [thread safety notes](Arena#thread-safety).
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidHandle`] for the null handle or a
    /// handle that was never allocated.
    pub fn resolve(&self, handle: ElementHandle) -> ArenaResult<MappedRwLockReadGuard<'_, [u8]>> {
        let range = self.check_handle(handle)?;
        let stages = self.stages.read();
        let stage = handle.stage_id() as usize;
        if stage >= stages.len() {
            return Err(ArenaError::InvalidHandle(handle.to_raw()));
        }
        Ok(RwLockReadGuard::map(stages, |s| &s[stage][range]))
    }

    /// Mutably borrows the bytes of an allocated element.
    ///
    /// # Errors
    ///
    /// Same as [`Arena::resolve`].
    pub fn resolve_mut(&self, handle: ElementHandle) -> ArenaResult<MappedRwLockWriteGuard<'_, [u8]>> {
        let range = self.check_handle(handle)?;
        let stages = self.stages.write();
        let stage = handle.stage_id() as usize;
        if stage >= stages.len() {
            return Err(ArenaError::InvalidHandle(handle.to_raw()));
        }
        Ok(RwLockWriteGuard::map(stages, |s| &mut s[stage][range]))
    }

    fn check_type<T>(&self) -> ArenaResult<()> {
        let requested = std::mem::size_of::<T>();
        if requested == self.geometry.element_size as usize {
            Ok(())
        } else {
            Err(ArenaError::ElementSize {
                element_size: self.geometry.element_size,
                requested,
            })
        }
    }

    /// Reads an element as `T`.
    ///
    /// # Errors
    ///
    /// Fails for invalid handles or if `T` is not exactly one element.
    pub fn read<T: Pod>(&self, handle: ElementHandle) -> ArenaResult<T> {
        self.check_type::<T>()?;
        Ok(bytemuck::pod_read_unaligned(&self.resolve(handle)?))
    }

    /// Writes `value` into an element.
    ///
    /// # Errors
    ///
    /// Fails for invalid handles or if `T` is not exactly one element.
    pub fn write<T: Pod>(&self, handle: ElementHandle, value: &T) -> ArenaResult<()> {
        self.check_type::<T>()?;
        self.resolve_mut(handle)?.copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Normalized geometry.
    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> &ArenaGeometry {
        &self.geometry
    }

    /// Number of attached stages.
    #[must_use]
    pub fn stage_count(&self) -> u32 {
        self.stages.read().len() as u32
    }

    /// Current allocation cursor as `(at_stage_id, at_element_id)`.
    #[must_use]
    pub fn cursor(&self) -> (u32, u32) {
        let control = self.control.load();
        (control.at_stage_id, control.at_element_id)
    }

    /// Snapshot of the persisted control block.
    #[must_use]
    pub fn control(&self) -> ArenaControl {
        self.control.load()
    }
}
