//! # KVINDEX Shared
//!
//! Constants and configuration shared by the memory and recovery layers.
//!
//! Nothing in this crate touches memory or devices. It only describes
//! what the other crates lay out.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod constants;

pub use config::{
    ConfigError, ConfigResult, DeviceConfig, NamespaceConfig, ServiceConfig, SetConfig,
    StorageConfig, StorageEngine,
};
pub use constants::*;
