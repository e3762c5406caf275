//! # KVINDEX
//!
//! Persistent index memory for a distributed key-value store.
//!
//! ## Crates
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           kvindex                            │
//! │                 boot: probe → setup → reduce                 │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │        kvindex_storage       │         kvindex_shared        │
//! │  name maps, index trees,     │  constants, configuration     │
//! │  namespace setup, reducer    │                               │
//! ├──────────────────────────────┘                               │
//! │         kvindex_core                                         │
//! │  shm segments, regions, staged arena                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod startup;

pub use kvindex_core as core;
pub use kvindex_shared as shared;
pub use kvindex_storage as storage;

pub use startup::{boot, boot_with, BootError, Node};
