//! End-to-end tests over the metadata stack: format, reopen, mapping
//! round-trips, crash atomicity, pool accounting, and the shared registry.

use hc_block::MemByteDevice;
use hc_error::HcError;
use hc_metadata::{CacheMetadata, MetadataRegistry};
use hc_types::{DataBlockSize, DevId, OBlock, PBlock, BLOCK_DIRTY, BLOCK_UPTODATE};
use std::sync::Arc;

const META_BLOCKS: usize = 512;
const DEV: DevId = DevId(1);

fn mem_device() -> Arc<MemByteDevice> {
    Arc::new(MemByteDevice::new(META_BLOCKS * 4096))
}

fn open_on(dev: &Arc<MemByteDevice>, data_nr_blocks: u64) -> CacheMetadata {
    CacheMetadata::open(
        Box::new(Arc::clone(dev)),
        DataBlockSize::new(8).unwrap(),
        data_nr_blocks,
    )
    .unwrap()
}

#[test]
fn format_then_reopen() {
    let dev = mem_device();
    {
        let md = open_on(&dev, 1024);
        assert_eq!(md.get_data_dev_size(DEV), 1024);
        assert_eq!(md.get_data_block_size(DEV), 8);
        assert_eq!(md.get_provisioned_blocks(DEV), 0);
        md.close().unwrap();
    }
    let md = open_on(&dev, 1024);
    assert_eq!(md.get_data_dev_size(DEV), 1024);
    assert_eq!(md.get_provisioned_blocks(DEV), 0);
}

#[test]
fn insert_lookup_update_remove() {
    let dev = mem_device();
    let md = open_on(&dev, 1024);

    let (pb, flags) = md.insert(DEV, OBlock(0)).unwrap();
    assert_eq!(pb, PBlock(0));
    assert_eq!(flags, 0);
    assert_eq!(md.get_provisioned_blocks(DEV), 1);

    md.update(DEV, OBlock(0), BLOCK_DIRTY | BLOCK_UPTODATE).unwrap();
    let (pb2, flags) = md.lookup(DEV, OBlock(0), true).unwrap();
    assert_eq!(pb2, pb);
    assert_eq!(flags, BLOCK_DIRTY | BLOCK_UPTODATE);

    assert_eq!(md.lookup_reverse(DEV, pb, true).unwrap(), OBlock(0));

    md.remove(DEV, OBlock(0)).unwrap();
    assert!(matches!(
        md.lookup(DEV, OBlock(0), true),
        Err(HcError::NotFound(_))
    ));
    assert!(md.lookup_reverse(DEV, pb, true).is_err());
    // Refcounts and the pool return to their pre-insert state.
    assert_eq!(md.get_provisioned_blocks(DEV), 0);
}

#[test]
fn lookup_is_idempotent() {
    let dev = mem_device();
    let md = open_on(&dev, 64);
    let _ = md.insert(DEV, OBlock(9)).unwrap();
    let first = md.lookup(DEV, OBlock(9), true).unwrap();
    let second = md.lookup(DEV, OBlock(9), true).unwrap();
    assert_eq!(first, second);
}

#[test]
fn forward_and_reverse_stay_inverse() {
    let dev = mem_device();
    let md = open_on(&dev, 256);

    for ob in [5_u64, 17, 3, 99, 42] {
        let _ = md.insert(DEV, OBlock(ob)).unwrap();
    }
    md.remove(DEV, OBlock(17)).unwrap();
    md.commit().unwrap();

    let mut pairs = Vec::new();
    md.walk_mappings(DEV, &mut |ob, pb, _flags| {
        pairs.push((ob, pb));
        Ok(())
    })
    .unwrap();
    assert_eq!(pairs.len(), 4);
    for (ob, pb) in pairs {
        assert_eq!(md.lookup_reverse(DEV, pb, true).unwrap(), ob);
        assert_eq!(md.lookup(DEV, ob, true).unwrap().0, pb);
    }
}

#[test]
fn mappings_survive_commit_and_reopen() {
    let dev = mem_device();
    {
        let md = open_on(&dev, 1024);
        for ob in 0..100_u64 {
            let _ = md.insert(DEV, OBlock(ob)).unwrap();
        }
        md.update(DEV, OBlock(7), BLOCK_DIRTY).unwrap();
        md.commit().unwrap();
    }

    let md = open_on(&dev, 1024);
    assert_eq!(md.get_provisioned_blocks(DEV), 100);
    for ob in 0..100_u64 {
        let (pb, flags) = md.lookup(DEV, OBlock(ob), true).unwrap();
        assert_eq!(md.lookup_reverse(DEV, pb, true).unwrap(), OBlock(ob));
        if ob == 7 {
            assert_eq!(flags, BLOCK_DIRTY);
        } else {
            assert_eq!(flags, 0);
        }
    }
}

#[test]
fn crash_before_commit_rolls_back() {
    let dev = mem_device();
    {
        let md = open_on(&dev, 1024);
        let _ = md.insert(DEV, OBlock(50)).unwrap();
        md.commit().unwrap();

        // A second transaction that never commits: power fails here.
        let _ = md.insert(DEV, OBlock(100)).unwrap();
        drop(md);
    }

    let md = open_on(&dev, 1024);
    assert!(md.lookup(DEV, OBlock(50), true).is_ok());
    assert!(matches!(
        md.lookup(DEV, OBlock(100), true),
        Err(HcError::NotFound(_))
    ));
    assert_eq!(md.get_provisioned_blocks(DEV), 1);

    // The reopened store keeps working.
    let (pb, _) = md.insert(DEV, OBlock(100)).unwrap();
    assert_eq!(md.lookup_reverse(DEV, pb, true).unwrap(), OBlock(100));
}

#[test]
fn pool_exhaustion_and_reclaim() {
    let dev = mem_device();
    let md = open_on(&dev, 2);

    let _ = md.insert(DEV, OBlock(10)).unwrap();
    let (pb20, _) = md.insert(DEV, OBlock(20)).unwrap();
    assert!(matches!(
        md.insert(DEV, OBlock(30)),
        Err(HcError::NoDataSpace)
    ));

    // Freeing a mapping makes its pool block reusable.
    md.remove(DEV, OBlock(20)).unwrap();
    let (pb30, _) = md.insert(DEV, OBlock(30)).unwrap();
    assert_eq!(pb30, pb20);
    assert_eq!(md.get_provisioned_blocks(DEV), 2);
}

#[test]
fn resize_rejects_truncation() {
    let dev = mem_device();
    let md = open_on(&dev, 16);
    for ob in 0..4_u64 {
        let _ = md.insert(DEV, OBlock(ob)).unwrap();
    }
    assert!(matches!(
        md.resize_data_dev(DEV, 3),
        Err(HcError::NoDataSpace)
    ));
    md.resize_data_dev(DEV, 64).unwrap();
    assert_eq!(md.get_data_dev_size(DEV), 64);
}

#[test]
fn delete_device_clears_both_trees() {
    let dev = mem_device();
    let md = open_on(&dev, 64);
    let other = DevId(2);

    for ob in 0..10_u64 {
        let _ = md.insert(DEV, OBlock(ob)).unwrap();
    }
    let _ = md.insert(other, OBlock(3)).unwrap();
    md.commit().unwrap();

    md.delete(DEV).unwrap();
    md.commit().unwrap();

    for ob in 0..10_u64 {
        assert!(md.lookup(DEV, OBlock(ob), true).is_err());
    }
    assert!(md.lookup(other, OBlock(3), true).is_ok());
    assert_eq!(md.devices().unwrap(), vec![other]);

    // All ten pool blocks are free again.
    for ob in 20..30_u64 {
        assert!(md.insert(DEV, OBlock(ob)).is_ok());
    }
}

#[test]
fn non_blocking_lookup_would_block_when_cold() {
    let dev = mem_device();
    {
        let md = open_on(&dev, 1024);
        for ob in 0..200_u64 {
            let _ = md.insert(DEV, OBlock(ob)).unwrap();
        }
        md.commit().unwrap();
    }

    // Fresh handle: nothing resident, so the fast path cannot serve it.
    let md = open_on(&dev, 1024);
    let mut saw_would_block = false;
    for ob in 0..200_u64 {
        match md.lookup(DEV, OBlock(ob), false) {
            Err(HcError::WouldBlock) => {
                saw_would_block = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_would_block);

    // Warm it with a blocking lookup, then the fast path hits.
    let (pb, _) = md.lookup(DEV, OBlock(0), true).unwrap();
    assert_eq!(md.lookup(DEV, OBlock(0), false).unwrap().0, pb);
}

#[test]
fn registry_shares_one_handle_per_device() {
    let dev = mem_device();
    let registry = MetadataRegistry::new();

    let a = registry
        .acquire("meta0", || {
            Ok(CacheMetadata::open(
                Box::new(Arc::clone(&dev)),
                DataBlockSize::new(8).unwrap(),
                128,
            )?)
        })
        .unwrap();
    let b = registry
        .acquire("meta0", || unreachable!("second open must share"))
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 1);

    let _ = a.insert(DEV, OBlock(1)).unwrap();
    registry.release("meta0").unwrap();
    assert_eq!(registry.len(), 1);
    registry.release("meta0").unwrap();
    assert!(registry.is_empty());

    // The final release committed the insert.
    drop((a, b));
    let md = open_on(&dev, 128);
    assert!(md.lookup(DEV, OBlock(1), true).is_ok());
}

#[test]
fn commit_with_no_writes_is_free() {
    let dev = mem_device();
    let md = open_on(&dev, 64);
    md.commit().unwrap();

    let before = dev.snapshot();
    md.commit().unwrap();
    md.commit().unwrap();
    assert_eq!(dev.snapshot(), before);
}
