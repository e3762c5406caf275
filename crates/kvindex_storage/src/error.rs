//! # Storage Error Types
//!
//! Errors raised while setting up namespace memory or walking the index.
//! Every one of them is fatal at startup; the caller decides how to exit.

use kvindex_core::{ArenaError, RegionError};
use thiserror::Error;

/// Errors returned by a [`NameMap`](crate::vmap::NameMap).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmapError {
    /// A parameter or persisted header value is unusable.
    #[error("bad name map parameter: {0}")]
    BadParam(String),

    /// The map already holds its maximum number of values.
    #[error("name map is full")]
    Full,

    /// The name is already present.
    #[error("name already present at index {index}")]
    NameExists {
        /// Index of the existing value.
        index: u32,
    },

    /// No value carries the name.
    #[error("name not found")]
    NameNotFound,
}

/// Errors raised by an index tree.
#[derive(Error, Debug)]
pub enum TreeError {
    /// A node could not be allocated or resolved.
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// The walk visited more nodes than the arena can hold.
    #[error("index tree is corrupt: walked past {limit} nodes")]
    Corrupt {
        /// Node limit that was exceeded.
        limit: u64,
    },
}

/// Errors that make a namespace unusable at startup.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The namespace region could not be attached or carved.
    #[error("ns {ns} can't attach persistent region: {source}")]
    Region {
        /// Namespace name.
        ns: String,
        /// Underlying error.
        #[source]
        source: RegionError,
    },

    /// A name map could not be created or resumed.
    #[error("ns {ns} can't create {map} vmap: {source}")]
    Vmap {
        /// Namespace name.
        ns: String,
        /// Which map (`sets` or `bins`).
        map: &'static str,
        /// Underlying error.
        #[source]
        source: VmapError,
    },

    /// A configured set could not be registered.
    #[error("ns {ns} can't configure set {set}: {source}")]
    ConfigureSets {
        /// Namespace name.
        ns: String,
        /// Offending set.
        set: String,
        /// Underlying error.
        #[source]
        source: VmapError,
    },

    /// The index arena could not be created or resumed.
    #[error("ns {ns} can't create arena: {source}")]
    Arena {
        /// Namespace name.
        ns: String,
        /// Underlying error.
        #[source]
        source: ArenaError,
    },

    /// Not enough memory for even the smallest stage capacity.
    #[error("server requires at least {min_mb}MB of memory per namespace")]
    InsufficientMemory {
        /// Megabytes needed per namespace.
        min_mb: u64,
    },
}

/// Errors that abort the cold-start reduction of a namespace.
#[derive(Error, Debug)]
pub enum ColdStartError {
    /// A partition tree could not be walked.
    #[error("ns {ns} partition {partition} ({tree} tree) can't be reduced: {source}")]
    Tree {
        /// Namespace name.
        ns: String,
        /// Partition id.
        partition: usize,
        /// `primary` or `sub`.
        tree: &'static str,
        /// Underlying error.
        #[source]
        source: TreeError,
    },
}

/// Result alias for index tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Result alias for namespace setup.
pub type SetupResult<T> = Result<T, SetupError>;
