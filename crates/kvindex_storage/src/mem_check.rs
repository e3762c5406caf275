//! # Capacity Probe
//!
//! Picks the arena stage capacity before any namespace is set up.
//!
//! Every namespace needs at least one index stage and, in the worst case,
//! as much again for record data. The probe asks for both at once for all
//! namespaces, halving the candidate capacity until the whole set fits.

use tracing::info;

use kvindex_shared::{MAX_STAGE_CAPACITY, MIN_STAGE_CAPACITY};

use crate::error::{SetupError, SetupResult};

const MIB: u64 = 1024 * 1024;

/// Allocation source the probe tries.
pub trait ProbeAllocator {
    /// Memory held until dropped.
    type Block;

    /// Tries to obtain `bytes` bytes. `None` means the allocation failed.
    fn try_alloc(&mut self, bytes: u64) -> Option<Self::Block>;
}

/// Probes the process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapProbe;

impl ProbeAllocator for HeapProbe {
    type Block = Vec<u8>;

    fn try_alloc(&mut self, bytes: u64) -> Option<Vec<u8>> {
        let len = usize::try_from(bytes).ok()?;
        let mut block = Vec::new();
        block.try_reserve_exact(len).ok()?;
        Some(block)
    }
}

/// Megabytes one namespace needs at the smallest stage capacity.
#[must_use]
pub const fn min_memory_mb(index_element_size: u32) -> u64 {
    index_element_size as u64 * MIN_STAGE_CAPACITY as u64 * 2 / MIB
}

/// Finds the largest stage capacity, halving down from the maximum, for
/// which two stage-sized blocks per namespace can be held together.
///
/// `index_sizes` has one index element size per namespace.
///
/// # Errors
///
/// Returns [`SetupError::InsufficientMemory`] if even the minimum capacity
/// does not fit.
pub fn probe_stage_capacity<A: ProbeAllocator>(
    alloc: &mut A,
    index_sizes: &[u32],
) -> SetupResult<u32> {
    let mut capacity = MAX_STAGE_CAPACITY;

    while capacity >= MIN_STAGE_CAPACITY {
        if fits(alloc, index_sizes, capacity) {
            if capacity < MAX_STAGE_CAPACITY {
                info!(
                    "detected small memory profile - will size arena stages 1/{} max",
                    MAX_STAGE_CAPACITY / capacity
                );
            }
            return Ok(capacity);
        }
        capacity /= 2;
    }

    let min_mb = index_sizes.iter().copied().map(min_memory_mb).max().unwrap_or(0);
    Err(SetupError::InsufficientMemory { min_mb })
}

fn fits<A: ProbeAllocator>(alloc: &mut A, index_sizes: &[u32], capacity: u32) -> bool {
    let mut held = Vec::with_capacity(index_sizes.len() * 2);

    for &size in index_sizes {
        let bytes = u64::from(size) * u64::from(capacity);
        for _ in 0..2 {
            match alloc.try_alloc(bytes) {
                Some(block) => held.push(block),
                None => return false,
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Grants allocations until a byte budget is spent; blocks give the
    /// budget back when dropped.
    struct Budget {
        left: std::rc::Rc<std::cell::Cell<u64>>,
    }

    struct Grant {
        bytes: u64,
        left: std::rc::Rc<std::cell::Cell<u64>>,
    }

    impl Drop for Grant {
        fn drop(&mut self) {
            self.left.set(self.left.get() + self.bytes);
        }
    }

    impl Budget {
        fn new(bytes: u64) -> Self {
            Self {
                left: std::rc::Rc::new(std::cell::Cell::new(bytes)),
            }
        }
    }

    impl ProbeAllocator for Budget {
        type Block = Grant;

        fn try_alloc(&mut self, bytes: u64) -> Option<Grant> {
            let left = self.left.get();
            if bytes > left {
                return None;
            }
            self.left.set(left - bytes);
            Some(Grant {
                bytes,
                left: std::rc::Rc::clone(&self.left),
            })
        }
    }

    #[test]
    fn test_plenty_of_memory_gives_max() {
        let mut budget = Budget::new(u64::MAX / 2);
        assert_eq!(
            probe_stage_capacity(&mut budget, &[64, 64]).unwrap(),
            MAX_STAGE_CAPACITY
        );
        assert_eq!(budget.left.get(), u64::MAX / 2);
    }

    #[test]
    fn test_halves_until_all_namespaces_fit() {
        // Two namespaces need 4 blocks; give room for 4 blocks at max / 4.
        let block = 64 * u64::from(MAX_STAGE_CAPACITY / 4);
        let mut budget = Budget::new(4 * block + 1);

        assert_eq!(
            probe_stage_capacity(&mut budget, &[64, 64]).unwrap(),
            MAX_STAGE_CAPACITY / 4
        );
    }

    #[test]
    fn test_insufficient_memory() {
        let mut budget = Budget::new(1024);
        let err = probe_stage_capacity(&mut budget, &[64]).unwrap_err();

        // 64 bytes * 2^21 elements * 2 / 1 MiB
        assert!(matches!(err, SetupError::InsufficientMemory { min_mb: 256 }));
        assert_eq!(budget.left.get(), 1024);
    }

    #[test]
    fn test_min_memory_mb() {
        assert_eq!(min_memory_mb(64), 256);
        assert_eq!(min_memory_mb(128), 512);
    }
}
