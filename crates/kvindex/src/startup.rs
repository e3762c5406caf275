//! # Startup
//!
//! Brings every configured namespace up, in order, on one thread.
//!
//! 1. Probe the stage capacity for all namespaces together
//! 2. Set up each namespace's memory (cold or warm)
//! 3. Take partition ownership and fix the startup expiry thresholds
//! 4. Rebuild device accounting for every warm namespace
//!
//! Any failure stops startup and is returned with the namespace it hit.

use kvindex_core::ShmDir;
use kvindex_shared::{ConfigError, ServiceConfig};
use kvindex_storage::{
    now_void_time, probe_stage_capacity, resume_devices, setup, ColdStartError, DeviceSet,
    HeapProbe, Namespace, OwnAll, PartitionOwnership, ProbeAllocator, ReduceSummary, SetupError, SetupOptions,
    INDEX_RECORD_SIZE,
};
use thiserror::Error;
use tracing::info;

/// Errors that stop a node from starting.
#[derive(Error, Debug)]
pub enum BootError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A namespace could not be set up.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// A warm namespace could not be rebuilt.
    #[error(transparent)]
    ColdStart(#[from] ColdStartError),
}

/// A started node.
#[derive(Debug)]
pub struct Node {
    stage_capacity: u32,
    namespaces: Vec<Namespace>,
    recoveries: Vec<Option<ReduceSummary>>,
}

impl Node {
    /// Stage capacity chosen by the probe.
    #[must_use]
    pub const fn stage_capacity(&self) -> u32 {
        self.stage_capacity
    }

    /// Namespaces in configuration order.
    #[must_use]
    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// Namespaces in configuration order, mutably.
    pub fn namespaces_mut(&mut self) -> &mut [Namespace] {
        &mut self.namespaces
    }

    /// Namespace called `name`.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.name() == name)
    }

    /// Reduction summary of namespace `name`; `None` if it started cold.
    #[must_use]
    pub fn recovery(&self, name: &str) -> Option<&ReduceSummary> {
        let index = self.namespaces.iter().position(|ns| ns.name() == name)?;
        self.recoveries[index].as_ref()
    }
}

/// Starts a lone node: heap capacity probe, every partition owned, system
/// clock.
///
/// # Errors
///
/// See [`boot_with`].
pub fn boot(config: &ServiceConfig) -> Result<Node, BootError> {
    boot_with(config, &mut HeapProbe, &OwnAll, now_void_time())
}

/// Starts a node.
///
/// `ownership` decides which partitions of each namespace this node owns;
/// the others are left untouched by the reduction. `now` is the current
/// time in seconds since the void-time epoch.
///
/// # Errors
///
/// Fails on invalid configuration, if the probe finds too little memory,
/// if a namespace cannot be set up, or if a warm index cannot be walked.
pub fn boot_with<A: ProbeAllocator, O: PartitionOwnership>(
    config: &ServiceConfig,
    probe: &mut A,
    ownership: &O,
    now: u32,
) -> Result<Node, BootError> {
    config.validate()?;

    let index_sizes = vec![INDEX_RECORD_SIZE; config.namespaces.len()];
    let stage_capacity = probe_stage_capacity(probe, &index_sizes)?;
    info!(stage_capacity, namespaces = config.namespaces.len(), "probed memory");

    let options = SetupOptions {
        shm_dir: ShmDir::new(config.shm_dir.clone()),
        cold_start: config.cold_start,
        instance: config.instance,
    };

    let mut namespaces = Vec::with_capacity(config.namespaces.len());
    let mut recoveries = Vec::with_capacity(config.namespaces.len());

    for (ns_id, ns_config) in (1u32..).zip(&config.namespaces) {
        let memory = setup(ns_id, ns_config, stage_capacity, &options)?;
        let mut devices = DeviceSet::from_configs(&ns_config.storage.devices);
        devices.apply_ownership(&ns_config.name, ownership);
        let mut ns = Namespace::new(ns_id, ns_config.clone(), memory, devices);

        ns.prepare_cold_start_times(now);

        let recovery = if ns.cold_start() {
            None
        } else {
            Some(resume_devices(&mut ns)?)
        };

        info!(
            ns = ns.name(),
            id = ns_id,
            cold = ns.cold_start(),
            objects = ns.stats().n_objects(),
            "namespace ready"
        );

        namespaces.push(ns);
        recoveries.push(recovery);
    }

    Ok(Node {
        stage_capacity,
        namespaces,
        recoveries,
    })
}
