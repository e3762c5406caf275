//! # Core Error Types
//!
//! All errors that can occur while laying out or growing persistent memory.

use std::io;

use thiserror::Error;

/// Errors that can occur in the staged arena.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// A geometry value exceeds a hard limit.
    #[error("bad arena parameter: {0}")]
    BadParameter(String),

    /// Every stage the geometry allows is already attached.
    #[error("arena already holds its maximum of {max_stages} stages")]
    StageLimitExceeded {
        /// The configured stage limit.
        max_stages: u32,
    },

    /// A stage could not be allocated or attached.
    #[error("could not attach {stage_size}-byte arena stage {stage_id}: {source}")]
    StageCreateFailed {
        /// Stage that failed.
        stage_id: u32,
        /// Bytes requested for the stage.
        stage_size: u64,
        /// Underlying allocation or mapping error.
        #[source]
        source: io::Error,
    },

    /// Persisted geometry disagrees with the requested geometry.
    #[error("persistent memory does not match: {field} is {persisted}, requested {requested}")]
    GeometryMismatch {
        /// Name of the mismatching parameter.
        field: &'static str,
        /// Value recorded when the arena was created.
        persisted: u64,
        /// Value requested now.
        requested: u64,
    },

    /// The persisted control block cannot describe a usable arena.
    #[error("corrupt arena control block: {stage_count} stages, cursor {at_stage_id}:{at_element_id}")]
    CorruptControl {
        /// Recorded stage count.
        stage_count: u32,
        /// Recorded cursor stage.
        at_stage_id: u32,
        /// Recorded cursor element.
        at_element_id: u32,
    },

    /// A handle points outside the attached stages or the allocated range.
    #[error("invalid element handle {0:#x}")]
    InvalidHandle(u64),

    /// A typed access used a type whose size differs from the element size.
    #[error("element size is {element_size} bytes, access used {requested}")]
    ElementSize {
        /// Arena element size.
        element_size: u32,
        /// Size of the type used for the access.
        requested: usize,
    },

    /// The control block could not be read or written.
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Errors that can occur while carving or viewing a persistent region.
#[derive(Error, Debug)]
pub enum RegionError {
    /// A view extends beyond the end of the region.
    #[error("sub-region {name} ({start}..{end}) exceeds region of {len} bytes")]
    OutOfBounds {
        /// Sub-region name.
        name: &'static str,
        /// First byte of the view.
        start: usize,
        /// One past the last byte of the view.
        end: usize,
        /// Region length.
        len: usize,
    },

    /// A typed view was requested over a range of the wrong size.
    #[error("sub-region {name} is {len} bytes, type needs {needed}")]
    SizeMismatch {
        /// Sub-region name.
        name: &'static str,
        /// Range length.
        len: usize,
        /// Size of the requested type.
        needed: usize,
    },

    /// The layout does not name the requested sub-region.
    #[error("layout has no sub-region {0}")]
    Missing(&'static str),

    /// Opening, creating or mapping a segment failed.
    #[error("segment {key:#x}: {source}")]
    Io {
        /// Persistence key.
        key: u32,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result type for arena operations.
pub type ArenaResult<T> = Result<T, ArenaError>;

/// Result type for region operations.
pub type RegionResult<T> = Result<T, RegionError>;
