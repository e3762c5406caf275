//! Element handles.

use std::fmt;

/// Opaque reference to one arena element.
///
/// A handle names a `(stage, element)` slot, not an address, so it stays
/// valid across a restart as long as the arena geometry is unchanged.
/// Handle `0:0` is reserved as the null handle when an arena is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementHandle {
    stage_id: u32,
    element_id: u32,
}

impl ElementHandle {
    /// The reserved null handle.
    pub const NULL: Self = Self::new(0, 0);

    /// Creates a handle.
    #[inline]
    #[must_use]
    pub const fn new(stage_id: u32, element_id: u32) -> Self {
        Self { stage_id, element_id }
    }

    /// Stage the element lives in.
    #[inline]
    #[must_use]
    pub const fn stage_id(self) -> u32 {
        self.stage_id
    }

    /// Element index within its stage.
    #[inline]
    #[must_use]
    pub const fn element_id(self) -> u32 {
        self.element_id
    }

    /// Whether this is the null handle.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.stage_id == 0 && self.element_id == 0
    }

    /// Packs the handle for storage inside persisted elements.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.stage_id as u64) << 32) | self.element_id as u64
    }

    /// Unpacks a handle written by [`ElementHandle::to_raw`].
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            stage_id: (raw >> 32) as u32,
            element_id: raw as u32,
        }
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage_id, self.element_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_packing() {
        let handle = ElementHandle::new(3, 0x00ab_cdef);
        assert_eq!(handle.to_raw(), 0x0000_0003_00ab_cdef);
        assert_eq!(ElementHandle::from_raw(handle.to_raw()), handle);
        assert!(ElementHandle::from_raw(0).is_null());
        assert!(!handle.is_null());
    }
}
