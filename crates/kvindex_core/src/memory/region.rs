//! # Persistent Regions
//!
//! One blob of memory, carved into named sub-regions by a [`RegionLayout`].
//!
//! ## Design
//!
//! A resumed region is interpreted purely by position, so the layout is
//! computed up front from constants and handed out as typed,
//! bounds-checked views:
//!
//! ```text
//! [sets map][bins map?][arena control][tree roots][sub tree roots]
//!  ^ each part starts on an 8-byte boundary
//! ```
//!
//! Views copy plain-old-data in and out through `bytemuck`, so no
//! reference into the region ever escapes the region's lock.

use std::collections::TryReserveError;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytemuck::Pod;
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{RegionError, RegionResult};
use crate::memory::shm::ShmDir;

/// Alignment of every sub-region start.
const SUB_REGION_ALIGN: usize = 8;

/// A named byte range inside a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubRegion {
    /// Name used in diagnostics.
    pub name: &'static str,
    /// Offset of the first byte.
    pub start: usize,
    /// Length in bytes.
    pub len: usize,
}

impl SubRegion {
    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Ordered list of sub-regions making up a region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionLayout {
    parts: Vec<SubRegion>,
    len: usize,
}

impl RegionLayout {
    /// Creates an empty layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sub-region of `len` bytes.
    #[must_use]
    pub fn push(mut self, name: &'static str, len: usize) -> Self {
        let start = self.len.next_multiple_of(SUB_REGION_ALIGN);
        self.parts.push(SubRegion { name, start, len });
        self.len = start + len;
        self
    }

    /// Looks up a sub-region by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Missing`] if the layout has no such part.
    pub fn get(&self, name: &'static str) -> RegionResult<SubRegion> {
        self.parts
            .iter()
            .find(|part| part.name == name)
            .copied()
            .ok_or(RegionError::Missing(name))
    }

    /// Whether the layout names `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.parts.iter().any(|part| part.name == name)
    }

    /// Total region size, rounded up to the sub-region alignment.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.len.next_multiple_of(SUB_REGION_ALIGN)
    }

    /// Sub-regions in layout order.
    pub fn parts(&self) -> impl Iterator<Item = &SubRegion> {
        self.parts.iter()
    }
}

/// Memory behind a region or an arena stage.
pub enum Memory {
    /// Process-local, zero-initialized heap memory.
    Heap(Box<[u8]>),
    /// A mapped shared memory segment.
    Mapped(MmapMut),
}

impl Memory {
    /// Allocates zeroed heap memory.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::Heap(vec![0u8; len].into_boxed_slice())
    }

    /// Allocates zeroed heap memory, reporting exhaustion instead of
    /// aborting.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if `len` bytes are not available.
    pub fn try_zeroed(len: usize) -> Result<Self, TryReserveError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(Self::Heap(bytes.into_boxed_slice()))
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Heap(_) => "Heap",
            Self::Mapped(_) => "Mapped",
        };
        f.debug_struct("Memory").field("kind", &kind).field("len", &self.len()).finish()
    }
}

impl Deref for Memory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

impl DerefMut for Memory {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

/// A region of memory shared by the structures carved out of it.
#[derive(Debug)]
pub struct SharedRegion {
    /// Persistence key, `None` for heap regions.
    key: Option<u32>,
    /// Region length.
    len: usize,
    /// The bytes.
    memory: Mutex<Memory>,
}

impl SharedRegion {
    /// Creates a zeroed, process-local region.
    #[must_use]
    pub fn heap(len: usize) -> Arc<Self> {
        Arc::new(Self {
            key: None,
            len,
            memory: Mutex::new(Memory::zeroed(len)),
        })
    }

    /// Opens the shared region under `key`, creating it if needed.
    ///
    /// Returns the region and whether it was just created.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be opened, created or mapped, or if an
    /// existing segment has a different length.
    pub fn open_or_create(dir: &ShmDir, key: u32, len: usize) -> RegionResult<(Arc<Self>, bool)> {
        let to_region = |source| RegionError::Io { key, source };

        let (segment, created) = dir.open_or_create(key, len as u64).map_err(to_region)?;
        let map = segment.attach().map_err(to_region)?;

        let region = Arc::new(Self {
            key: Some(key),
            len,
            memory: Mutex::new(Memory::Mapped(map)),
        });
        Ok((region, created))
    }

    /// Creates the shared region under `key` zero-filled, discarding any
    /// segment a previous process left there, whatever its length.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be created or mapped.
    pub fn create_fresh(dir: &ShmDir, key: u32, len: usize) -> RegionResult<Arc<Self>> {
        let to_region = |source| RegionError::Io { key, source };

        let segment = dir.create_fresh(key, len as u64).map_err(to_region)?;
        let map = segment.attach().map_err(to_region)?;

        Ok(Arc::new(Self {
            key: Some(key),
            len,
            memory: Mutex::new(Memory::Mapped(map)),
        }))
    }

    /// Returns the persistence key.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> Option<u32> {
        self.key
    }

    /// Returns the region length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, sub: SubRegion) -> RegionResult<()> {
        if sub.end() > self.len {
            return Err(RegionError::OutOfBounds {
                name: sub.name,
                start: sub.start,
                end: sub.end(),
                len: self.len,
            });
        }
        Ok(())
    }

    /// Creates a typed view over `sub`.
    ///
    /// # Errors
    ///
    /// Fails if `sub` lies outside the region or its length differs from
    /// `size_of::<T>()`.
    pub fn cell<T: Pod>(self: &Arc<Self>, sub: SubRegion) -> RegionResult<RegionCell<T>> {
        self.check(sub)?;
        let needed = std::mem::size_of::<T>();
        if sub.len != needed {
            return Err(RegionError::SizeMismatch {
                name: sub.name,
                len: sub.len,
                needed,
            });
        }
        Ok(RegionCell {
            region: Arc::clone(self),
            sub,
            _marker: PhantomData,
        })
    }

    /// Creates a byte view over `sub`.
    ///
    /// # Errors
    ///
    /// Fails if `sub` lies outside the region.
    pub fn slice(self: &Arc<Self>, sub: SubRegion) -> RegionResult<RegionSlice> {
        self.check(sub)?;
        Ok(RegionSlice {
            region: Arc::clone(self),
            sub,
        })
    }
}

/// Typed view of one plain-old-data value inside a region.
pub struct RegionCell<T: Pod> {
    region: Arc<SharedRegion>,
    sub: SubRegion,
    _marker: PhantomData<T>,
}

impl<T: Pod> Clone for RegionCell<T> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            sub: self.sub,
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> std::fmt::Debug for RegionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionCell").field("sub", &self.sub).finish()
    }
}

impl<T: Pod> RegionCell<T> {
    /// Creates a cell over standalone heap memory.
    #[must_use]
    pub fn detached() -> Self {
        let len = std::mem::size_of::<T>();
        Self {
            region: SharedRegion::heap(len),
            sub: SubRegion { name: "detached", start: 0, len },
            _marker: PhantomData,
        }
    }

    /// Reads the current value.
    #[must_use]
    pub fn load(&self) -> T {
        let memory = self.region.memory.lock();
        bytemuck::pod_read_unaligned(&memory[self.sub.start..self.sub.end()])
    }

    /// Overwrites the value.
    pub fn store(&self, value: &T) {
        let mut memory = self.region.memory.lock();
        memory[self.sub.start..self.sub.end()].copy_from_slice(bytemuck::bytes_of(value));
    }

    /// Reads, modifies and writes back the value under the region lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut memory = self.region.memory.lock();
        let bytes = &mut memory[self.sub.start..self.sub.end()];
        let mut value: T = bytemuck::pod_read_unaligned(bytes);
        let result = f(&mut value);
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        result
    }

    /// Returns the region this cell lives in.
    #[inline]
    #[must_use]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

/// Byte view of a sub-region.
#[derive(Clone, Debug)]
pub struct RegionSlice {
    region: Arc<SharedRegion>,
    sub: SubRegion,
}

impl RegionSlice {
    /// Creates a slice over standalone heap memory.
    #[must_use]
    pub fn detached(len: usize) -> Self {
        Self {
            region: SharedRegion::heap(len),
            sub: SubRegion { name: "detached", start: 0, len },
        }
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.sub.len
    }

    /// Whether the slice is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.sub.len == 0
    }

    /// Runs `f` over the bytes.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let memory = self.region.memory.lock();
        f(&memory[self.sub.start..self.sub.end()])
    }

    /// Runs `f` over the bytes, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = self.region.memory.lock();
        f(&mut memory[self.sub.start..self.sub.end()])
    }

    /// Splits the slice into `[0, mid)` and `[mid, len)`.
    ///
    /// # Errors
    ///
    /// Fails if `mid` is past the end of the slice.
    pub fn split_at(&self, mid: usize) -> RegionResult<(Self, Self)> {
        if mid > self.sub.len {
            return Err(RegionError::OutOfBounds {
                name: self.sub.name,
                start: self.sub.start,
                end: self.sub.start + mid,
                len: self.sub.end(),
            });
        }

        let head = SubRegion { len: mid, ..self.sub };
        let tail = SubRegion {
            start: self.sub.start + mid,
            len: self.sub.len - mid,
            ..self.sub
        };
        Ok((
            Self { region: Arc::clone(&self.region), sub: head },
            Self { region: Arc::clone(&self.region), sub: tail },
        ))
    }

    /// Views the whole slice as one `T`.
    ///
    /// # Errors
    ///
    /// Fails if the slice length differs from `size_of::<T>()`.
    pub fn as_cell<T: Pod>(&self) -> RegionResult<RegionCell<T>> {
        self.region.cell(self.sub)
    }

    /// Zeroes the slice.
    pub fn zero(&self) {
        self.with_mut(|bytes| bytes.fill(0));
    }

    /// Splits the slice into a table of typed cells.
    ///
    /// # Errors
    ///
    /// Fails if the slice length is not a multiple of `size_of::<T>()`.
    pub fn table<T: Pod>(&self) -> RegionResult<Vec<RegionCell<T>>> {
        let size = std::mem::size_of::<T>();
        if size == 0 || self.sub.len % size != 0 {
            return Err(RegionError::SizeMismatch {
                name: self.sub.name,
                len: self.sub.len,
                needed: size,
            });
        }

        (0..self.sub.len / size)
            .map(|i| {
                self.region.cell(SubRegion {
                    name: self.sub.name,
                    start: self.sub.start + i * size,
                    len: size,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::temp_shm_dir;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn test_layout_aligns_parts() {
        let layout = RegionLayout::new().push("one", 3).push("two", 8).push("three", 5);

        assert_eq!(layout.get("one").unwrap().start, 0);
        assert_eq!(layout.get("two").unwrap().start, 8);
        assert_eq!(layout.get("three").unwrap().start, 16);
        assert_eq!(layout.total_len(), 24);
        assert!(layout.contains("two"));
        assert!(matches!(layout.get("four"), Err(RegionError::Missing("four"))));
    }

    #[test]
    fn test_cell_checks_size_and_bounds() {
        let region = SharedRegion::heap(16);

        let wrong_size = SubRegion { name: "x", start: 0, len: 4 };
        assert!(matches!(region.cell::<Pair>(wrong_size), Err(RegionError::SizeMismatch { .. })));

        let past_end = SubRegion { name: "x", start: 12, len: 8 };
        assert!(matches!(region.cell::<Pair>(past_end), Err(RegionError::OutOfBounds { .. })));
    }

    #[test]
    fn test_cell_update() {
        let region = SharedRegion::heap(16);
        let cell = region.cell::<Pair>(SubRegion { name: "p", start: 8, len: 8 }).unwrap();

        cell.store(&Pair { a: 1, b: 2 });
        let old = cell.update(|p| {
            let old = p.a;
            p.a += 10;
            old
        });

        assert_eq!(old, 1);
        assert_eq!(cell.load(), Pair { a: 11, b: 2 });
    }

    #[test]
    fn test_table_cells_are_disjoint() {
        let region = SharedRegion::heap(32);
        let slice = region.slice(SubRegion { name: "t", start: 0, len: 32 }).unwrap();
        let table = slice.table::<Pair>().unwrap();
        assert_eq!(table.len(), 4);

        table[2].store(&Pair { a: 5, b: 6 });
        assert_eq!(table[1].load(), Pair { a: 0, b: 0 });
        assert_eq!(table[2].load(), Pair { a: 5, b: 6 });

        slice.zero();
        assert_eq!(table[2].load(), Pair { a: 0, b: 0 });
    }

    #[test]
    fn test_split_at() {
        let region = SharedRegion::heap(24);
        let slice = region.slice(SubRegion { name: "s", start: 0, len: 24 }).unwrap();

        let (head, tail) = slice.split_at(8).unwrap();
        assert_eq!(head.len(), 8);
        assert_eq!(tail.len(), 16);

        head.as_cell::<Pair>().unwrap().store(&Pair { a: 1, b: 1 });
        tail.with_mut(|bytes| bytes[0] = 9);
        slice.with(|bytes| {
            assert_eq!(bytes[0], 1);
            assert_eq!(bytes[8], 9);
        });

        assert!(slice.split_at(25).is_err());
    }

    #[test]
    fn test_shared_region_survives_reopen() {
        let dir = temp_shm_dir("region");
        let sub = SubRegion { name: "p", start: 0, len: 8 };

        {
            let (region, created) = SharedRegion::open_or_create(&dir, 0xae00_1000, 64).unwrap();
            assert!(created);
            region.cell::<Pair>(sub).unwrap().store(&Pair { a: 3, b: 4 });
        }

        let (region, created) = SharedRegion::open_or_create(&dir, 0xae00_1000, 64).unwrap();
        assert!(!created);
        assert_eq!(region.cell::<Pair>(sub).unwrap().load(), Pair { a: 3, b: 4 });

        std::fs::remove_dir_all(dir.root()).ok();
    }
}
