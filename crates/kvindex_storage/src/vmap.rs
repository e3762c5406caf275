//! # Name Maps
//!
//! Append-only vectors of fixed-size values, each value beginning with its
//! NUL-padded name, plus a name → index hash.
//!
//! ## Persistence
//!
//! Only the header and the value vector live in the persistent slot. The
//! hash is process-local and is rebuilt from the stored names on resume,
//! so an index handed out before a restart names the same value after it.
//!
//! ```text
//! [ value_size | max_count | count | key_size ][ value 0 ][ value 1 ] ...
//! ```

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use kvindex_core::{RegionCell, RegionSlice};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::VmapError;

/// Persisted map header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct VmapHeader {
    value_size: u32,
    max_count: u32,
    count: u32,
    key_size: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<VmapHeader>();

/// A persistent name map.
pub struct NameMap {
    header: RegionCell<VmapHeader>,
    values: RegionSlice,
    value_size: usize,
    key_size: usize,
    /// Name → index. Also serializes writers.
    index: Mutex<HashMap<Vec<u8>, u32>>,
}

impl std::fmt::Debug for NameMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameMap")
            .field("value_size", &self.value_size)
            .field("key_size", &self.key_size)
            .field("count", &self.count())
            .finish()
    }
}

impl NameMap {
    /// Bytes a map of `max_count` values of `value_size` bytes occupies.
    #[must_use]
    pub const fn size_of(value_size: u32, max_count: u32) -> usize {
        HEADER_SIZE + value_size as usize * max_count as usize
    }

    /// Creates an empty map in `slot`, discarding whatever it held.
    ///
    /// # Errors
    ///
    /// Returns [`VmapError::BadParam`] if `value_size` is not a multiple of
    /// 4, if a count or size is zero, or if `slot` is too small.
    pub fn create(
        slot: &RegionSlice,
        value_size: u32,
        max_count: u32,
        hash_size: u32,
        max_name_size: u32,
    ) -> Result<Self, VmapError> {
        check_params(value_size, max_count, hash_size, max_name_size)?;
        let map = Self::carve(slot, value_size, max_count, hash_size, max_name_size)?;

        map.header.store(&VmapHeader {
            value_size,
            max_count,
            count: 0,
            key_size: max_name_size,
        });

        Ok(map)
    }

    /// Resumes a map a previous process left in `slot`.
    ///
    /// The value geometry comes from the persisted header; the hash is
    /// rebuilt from the stored names.
    ///
    /// # Errors
    ///
    /// Returns [`VmapError::BadParam`] if the header is unusable, does not
    /// fit `slot`, or records two values with the same name.
    pub fn resume(slot: &RegionSlice, hash_size: u32, max_name_size: u32) -> Result<Self, VmapError> {
        let (head, _) = slot
            .split_at(HEADER_SIZE)
            .map_err(|e| VmapError::BadParam(e.to_string()))?;
        let persisted = head
            .as_cell::<VmapHeader>()
            .map_err(|e| VmapError::BadParam(e.to_string()))?
            .load();

        check_params(persisted.value_size, persisted.max_count, hash_size, max_name_size)?;
        if persisted.count > persisted.max_count {
            return Err(VmapError::BadParam(format!(
                "persisted count {} exceeds max {}",
                persisted.count, persisted.max_count
            )));
        }

        let map = Self::carve(
            slot,
            persisted.value_size,
            persisted.max_count,
            hash_size,
            max_name_size,
        )?;

        {
            let mut index = map.index.lock();
            for i in 0..persisted.count {
                let key = map.values.with(|bytes| {
                    let value = &bytes[map.value_range(i)];
                    name_key(value, map.key_size)
                });
                if let Some(first) = index.insert(key, i) {
                    return Err(VmapError::BadParam(format!(
                        "values {first} and {i} share a name"
                    )));
                }
            }
        }

        map.header.update(|h| h.key_size = max_name_size);
        debug!(count = persisted.count, "resumed name map");

        Ok(map)
    }

    fn carve(
        slot: &RegionSlice,
        value_size: u32,
        max_count: u32,
        hash_size: u32,
        max_name_size: u32,
    ) -> Result<Self, VmapError> {
        let needed = Self::size_of(value_size, max_count);
        if slot.len() < needed {
            return Err(VmapError::BadParam(format!(
                "slot of {} bytes cannot hold {needed}",
                slot.len()
            )));
        }

        let bad = |e: kvindex_core::RegionError| VmapError::BadParam(e.to_string());
        let (head, rest) = slot.split_at(HEADER_SIZE).map_err(bad)?;
        let (values, _) = rest.split_at(needed - HEADER_SIZE).map_err(bad)?;

        Ok(Self {
            header: head.as_cell().map_err(bad)?,
            values,
            value_size: value_size as usize,
            key_size: max_name_size as usize,
            index: Mutex::new(HashMap::with_capacity(hash_size as usize)),
        })
    }

    fn value_range(&self, index: u32) -> std::ops::Range<usize> {
        let start = index as usize * self.value_size;
        start..start + self.value_size
    }

    /// Number of values stored.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.header.load().count
    }

    /// Bytes per value.
    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.value_size
    }

    /// Copies out the value at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`VmapError::BadParam`] if `index` is not below the count.
    pub fn get_by_index(&self, index: u32) -> Result<Vec<u8>, VmapError> {
        if index >= self.count() {
            return Err(VmapError::BadParam(format!("index {index} out of range")));
        }
        Ok(self.values.with(|bytes| bytes[self.value_range(index)].to_vec()))
    }

    /// Copies out the value named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VmapError::NameNotFound`] if no value has that name.
    pub fn get_by_name(&self, name: &str) -> Result<Vec<u8>, VmapError> {
        let index = self.get_index(name)?;
        self.get_by_index(index)
    }

    /// Index of the value named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VmapError::NameNotFound`] if no value has that name.
    pub fn get_index(&self, name: &str) -> Result<u32, VmapError> {
        let key = name_key(name.as_bytes(), self.key_size);
        self.index.lock().get(&key).copied().ok_or(VmapError::NameNotFound)
    }

    /// Appends `value` unless its name is already present.
    ///
    /// `value` must begin with the name, NUL-terminated or filling the key
    /// size, and is zero-padded to the value size. Returns the new index.
    ///
    /// # Errors
    ///
    /// - [`VmapError::NameExists`] with the existing index if the name is taken
    /// - [`VmapError::Full`] if the map holds `max_count` values
    /// - [`VmapError::BadParam`] if the value is too long or has an empty name
    pub fn put_unique(&self, value: &[u8]) -> Result<u32, VmapError> {
        if value.len() > self.value_size {
            return Err(VmapError::BadParam(format!(
                "value of {} bytes exceeds {}",
                value.len(),
                self.value_size
            )));
        }

        let key = name_key(value, self.key_size);
        if key.is_empty() {
            return Err(VmapError::BadParam("empty name".to_string()));
        }

        let mut index = self.index.lock();
        if let Some(&existing) = index.get(&key) {
            return Err(VmapError::NameExists { index: existing });
        }

        let header = self.header.load();
        if header.count >= header.max_count {
            return Err(VmapError::Full);
        }

        let slot = header.count;
        self.values.with_mut(|bytes| {
            let dest = &mut bytes[self.value_range(slot)];
            dest.fill(0);
            dest[..value.len()].copy_from_slice(value);
        });
        self.header.update(|h| h.count += 1);
        index.insert(key, slot);

        Ok(slot)
    }
}

/// Hash key of a value: its name bytes, cut at the first NUL or at
/// `key_size`, whichever comes first.
fn name_key(value: &[u8], key_size: usize) -> Vec<u8> {
    let window = &value[..value.len().min(key_size)];
    let end = window.iter().position(|b| *b == 0).unwrap_or(window.len());
    window[..end].to_vec()
}

fn check_params(
    value_size: u32,
    max_count: u32,
    hash_size: u32,
    max_name_size: u32,
) -> Result<(), VmapError> {
    if value_size & 3 != 0 || value_size == 0 {
        return Err(VmapError::BadParam(format!(
            "value size {value_size} is not a positive multiple of 4"
        )));
    }
    if max_count == 0 || hash_size == 0 || max_name_size == 0 {
        return Err(VmapError::BadParam(
            "max count, hash size and name size must be nonzero".to_string(),
        ));
    }
    Ok(())
}
