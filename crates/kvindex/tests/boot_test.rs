//! # Boot Tests
//!
//! Full node startups over a temporary shared memory directory.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use kvindex::shared::{ServiceConfig, MIN_STAGE_CAPACITY};
use kvindex::storage::{
    IndexEntry, IndexTree, OwnAll, ProbeAllocator, SetupError, TreeKind, INDEX_RECORD_SIZE,
};
use kvindex::{boot_with, BootError};

/// Grants only blocks sized for the minimum stage capacity.
struct SmallMemory;

impl ProbeAllocator for SmallMemory {
    type Block = ();

    fn try_alloc(&mut self, bytes: u64) -> Option<()> {
        (bytes <= u64::from(INDEX_RECORD_SIZE) * u64::from(MIN_STAGE_CAPACITY)).then_some(())
    }
}

/// Grants nothing.
struct NoMemory;

impl ProbeAllocator for NoMemory {
    type Block = ();

    fn try_alloc(&mut self, _bytes: u64) -> Option<()> {
        None
    }
}

fn temp_dir(tag: &str) -> PathBuf {
    let id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("kvindex_boot_{tag}_{id}"))
}

fn config(shm_dir: &PathBuf) -> ServiceConfig {
    let text = format!(
        r#"
shm_dir = "{}"

[[namespaces]]
name = "persistent"
max_ttl = 1000

[namespaces.storage]
engine = "device"

[[namespaces.storage.devices]]
name = "/dev/nvme0n1"
file_id = 1
size = 16777216

[[namespaces.sets]]
name = "users"

[[namespaces]]
name = "volatile"

[namespaces.storage]
engine = "memory"
"#,
        shm_dir.display()
    );
    ServiceConfig::from_toml_str(&text).unwrap()
}

fn entry(n: u8, void_time: u32) -> IndexEntry {
    let mut digest = [0u8; 20];
    digest[0] = n;
    IndexEntry {
        digest,
        void_time,
        file_id: 1,
        rblock_id: u64::from(n) * 8192,
        n_rblocks: 1,
        ..IndexEntry::default()
    }
}

#[test]
fn test_cold_then_warm_boot() {
    let dir = temp_dir("warm");
    let config = config(&dir);

    {
        let mut node = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap();
        assert_eq!(node.stage_capacity(), MIN_STAGE_CAPACITY);
        assert!(node.namespace("persistent").unwrap().cold_start());
        assert!(node.recovery("persistent").is_none());

        let ns = &mut node.namespaces_mut()[0];
        for (n, void_time) in [(1, 0), (2, 400), (3, 700), (4, 1600)] {
            ns.index_entry(&entry(n, void_time), TreeKind::Primary).unwrap();
        }
        assert_eq!(ns.stats().n_objects(), 4);
    }

    let node = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap();

    let ns = node.namespace("persistent").unwrap();
    assert!(!ns.cold_start());
    assert_eq!(ns.memory().sets.get_index("users").unwrap(), 0);

    let summary = node.recovery("persistent").unwrap();
    assert_eq!(summary.kept, 2);
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.max_ttl, 1);
    assert_eq!(ns.stats().n_objects(), 2);
    assert_eq!(ns.element_count(), 2);
    assert_eq!(ns.devices().inuse_size(), 2 * 128);

    let volatile = node.namespace("volatile").unwrap();
    assert!(volatile.cold_start());
    assert!(node.recovery("volatile").is_none());

    drop(node);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_cold_start_flag_discards_index() {
    let dir = temp_dir("cold");
    let mut config = config(&dir);

    {
        let mut node = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap();
        node.namespaces_mut()[0]
            .index_entry(&entry(1, 0), TreeKind::Primary)
            .unwrap();
    }

    config.cold_start = true;
    let node = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap();
    let ns = node.namespace("persistent").unwrap();
    assert!(ns.cold_start());
    assert!(node.recovery("persistent").is_none());
    assert!(ns.partition(1).unwrap().tree.is_empty());

    drop(node);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_unowned_partition_left_alone() {
    let dir = temp_dir("owned");
    let config = config(&dir);

    {
        let mut node = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap();
        let ns = &mut node.namespaces_mut()[0];
        for (n, void_time) in [(1, 0), (2, 400), (3, 700), (4, 1600)] {
            ns.index_entry(&entry(n, void_time), TreeKind::Primary).unwrap();
        }
    }

    let not_three = |ns: &str, pid: usize| ns != "persistent" || pid != 3;
    let node = boot_with(&config, &mut SmallMemory, &not_three, 500).unwrap();

    let summary = node.recovery("persistent").unwrap();
    assert_eq!(summary.skipped_partitions, 1);
    assert_eq!(summary.kept, 1);
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.max_ttl, 1);

    let ns = node.namespace("persistent").unwrap();
    assert!(!ns.devices().owns_partition(3));
    assert_eq!(ns.devices().inuse_size(), 128);
    assert_eq!(ns.partition(3).unwrap().tree.entries().unwrap().len(), 1);
    assert_eq!(ns.partition(3).unwrap().tree.element_count(), 0);

    drop(node);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_insufficient_memory_is_fatal() {
    let dir = temp_dir("nomem");
    let err = boot_with(&config(&dir), &mut NoMemory, &OwnAll, 500).unwrap_err();

    assert!(matches!(
        err,
        BootError::Setup(SetupError::InsufficientMemory { min_mb: 256 })
    ));
    assert!(err.to_string().contains("256MB"));
    assert!(!dir.exists());
}

#[test]
fn test_invalid_config_rejected_before_setup() {
    let dir = temp_dir("invalid");
    let mut config = config(&dir);
    config.namespaces.clear();

    let err = boot_with(&config, &mut SmallMemory, &OwnAll, 500).unwrap_err();
    assert!(matches!(err, BootError::Config(_)));
    assert!(!dir.exists());
}
