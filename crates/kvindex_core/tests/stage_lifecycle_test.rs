//! Integration tests for the arena stage lifecycle.
//!
//! Run with: cargo test --package kvindex_core --test stage_lifecycle_test

use kvindex_core::{
    Arena, ArenaControl, ArenaError, ArenaFlags, ArenaGeometry, HeapBacking, RegionCell,
    RegionLayout, SharedRegion, ShmBacking, ShmDir,
};

fn temp_shm_dir(tag: &str) -> ShmDir {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    ShmDir::new(std::env::temp_dir().join(format!("kvindex_lifecycle_{tag}_{id}")))
}

#[test]
fn test_add_stage_succeeds_exactly_max_stages_times() {
    for (element_size, stage_capacity, max_stages) in [(8, 1, 1), (64, 16, 4), (24, 3, 9)] {
        let geometry = ArenaGeometry::new(0, element_size, stage_capacity, max_stages, ArenaFlags::NONE);
        let arena = Arena::create(RegionCell::detached(), Box::new(HeapBacking), geometry).unwrap();

        // Creation attaches the first stage.
        for expected in 1..max_stages {
            assert_eq!(arena.add_stage().unwrap(), expected);
        }

        let err = arena.add_stage().unwrap_err();
        assert!(matches!(err, ArenaError::StageLimitExceeded { .. }));
        assert_eq!(arena.stage_count(), max_stages);
        assert_eq!(arena.control().stage_count, max_stages);
    }
}

#[test]
fn test_exhaustion_through_alloc() {
    let geometry = ArenaGeometry::new(0, 8, 4, 2, ArenaFlags::BIG_LOCK);
    let arena = Arena::create(RegionCell::detached(), Box::new(HeapBacking), geometry).unwrap();

    // 2 stages of 4, minus the reserved null element.
    for _ in 0..7 {
        arena.alloc().unwrap();
    }
    assert!(matches!(arena.alloc(), Err(ArenaError::StageLimitExceeded { max_stages: 2 })));
}

#[test]
fn test_capacity_off_by_one_attaches_nothing() {
    let dir = temp_shm_dir("mismatch");
    let key = 0xae00_3000;
    let layout = RegionLayout::new().push("arena", ArenaControl::SIZE);
    let sub = layout.get("arena").unwrap();
    let geometry = ArenaGeometry::new(key, 64, 32, 0, ArenaFlags::BIG_LOCK);

    {
        let (region, created) = SharedRegion::open_or_create(&dir, key, layout.total_len()).unwrap();
        assert!(created);
        let arena = Arena::create(region.cell(sub).unwrap(), Box::new(ShmBacking::new(dir.clone(), key)), geometry).unwrap();
        for _ in 0..40 {
            arena.alloc().unwrap();
        }
        assert_eq!(arena.stage_count(), 2);
    }

    // Remove the stage segments: a resume that attached anything would recreate them.
    let backing = ShmBacking::new(dir.clone(), key);
    dir.remove(backing.stage_key(0)).unwrap();
    dir.remove(backing.stage_key(1)).unwrap();

    let (region, created) = SharedRegion::open_or_create(&dir, key, layout.total_len()).unwrap();
    assert!(!created);
    let altered = ArenaGeometry {
        stage_capacity: 33,
        ..geometry
    };
    let err = Arena::resume(region.cell(sub).unwrap(), Box::new(backing.clone()), altered).unwrap_err();

    assert!(matches!(
        err,
        ArenaError::GeometryMismatch {
            field: "stage_capacity",
            persisted: 32,
            requested: 33
        }
    ));
    assert!(!dir.exists(backing.stage_key(0)));
    assert!(!dir.exists(backing.stage_key(1)));

    std::fs::remove_dir_all(dir.root()).ok();
}
