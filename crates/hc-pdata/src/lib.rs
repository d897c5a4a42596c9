#![forbid(unsafe_code)]
//! Persistent-data engine: the crash-consistent storage layer under the
//! hcache metadata.
//!
//! Three tightly coupled pieces live here:
//!
//! - [`space_map`]: per-block reference counts on the metadata device, with
//!   the bounded recursion queue that lets the map describe its own blocks.
//! - [`tm`]: the transaction manager, which turns the block manager into a
//!   shadow copy-on-write store with a single-superblock-write commit.
//! - [`btree`]: the shadowed, multi-level B-tree built on both.

pub mod btree;
pub mod space_map;
pub mod tm;

pub use space_map::SM_ROOT_SIZE;
pub use tm::{NonBlockingTm, TmRead, TransactionManager};

#[cfg(test)]
mod tests {
    use crate::btree::{self, BtreeInfo, ValueType};
    use crate::tm::{TmRead, TransactionManager};
    use hc_block::{
        Block, BlockManager, MemByteDevice, TrailingCrcValidator, Validator,
    };
    use hc_error::HcError;
    use hc_types::BlockId;
    use std::sync::Arc;

    const SUPERBLOCK: BlockId = BlockId(0);

    fn sb_validator() -> Arc<dyn Validator> {
        Arc::new(TrailingCrcValidator)
    }

    fn fresh_tm(nr_blocks: usize) -> (TransactionManager, Block) {
        let dev = MemByteDevice::new(nr_blocks * 4096);
        let bm = BlockManager::new(Box::new(dev), 4096, 128).unwrap();
        TransactionManager::create_with_sm(bm, SUPERBLOCK, &sb_validator()).unwrap()
    }

    fn value_info() -> BtreeInfo {
        BtreeInfo {
            levels: 1,
            value_type: ValueType {
                size: 8,
                inc: None,
                del: None,
            },
        }
    }

    fn two_level_info() -> BtreeInfo {
        BtreeInfo {
            levels: 2,
            value_type: ValueType {
                size: 8,
                inc: None,
                del: None,
            },
        }
    }

    fn commit(tm: &mut TransactionManager, sb: Block) -> Block {
        tm.pre_commit().unwrap();
        tm.commit(sb).unwrap();
        tm.write_lock(SUPERBLOCK, &sb_validator()).unwrap()
    }

    #[test]
    fn test_create_then_insert_lookup() {
        let (mut tm, sb) = fresh_tm(256);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();

        for key in 0..100_u64 {
            root = btree::insert(&mut tm, &info, root, &[key], &(key * 3).to_le_bytes())
                .unwrap();
        }
        let _sb = commit(&mut tm, sb);

        for key in 0..100_u64 {
            let value = btree::lookup(&tm, &info, root, &[key]).unwrap();
            assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), key * 3);
        }
        assert!(matches!(
            btree::lookup(&tm, &info, root, &[100]),
            Err(HcError::NotFound(_))
        ));
    }

    #[test]
    fn test_insert_enough_to_split() {
        // max_entries for 8-byte values is 254; 2000 keys force internal
        // levels and sibling splits in shuffled order.
        let (mut tm, sb) = fresh_tm(512);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();

        let keys: Vec<u64> = (0..2000_u64).map(|i| (i * 7919) % 20_011).collect();
        for key in &keys {
            root = btree::insert(&mut tm, &info, root, &[*key], &(key ^ 0xFFFF).to_le_bytes())
                .unwrap();
        }
        let _sb = commit(&mut tm, sb);

        for key in &keys {
            let value = btree::lookup(&tm, &info, root, &[*key]).unwrap();
            assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), key ^ 0xFFFF);
        }
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let (mut tm, sb) = fresh_tm(256);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();

        root = btree::insert(&mut tm, &info, root, &[7], &1_u64.to_le_bytes()).unwrap();
        root = btree::insert(&mut tm, &info, root, &[7], &2_u64.to_le_bytes()).unwrap();
        let _sb = commit(&mut tm, sb);

        let value = btree::lookup(&tm, &info, root, &[7]).unwrap();
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 2);

        let mut seen = Vec::new();
        btree::walk(&tm, root, 8, &mut |key, _| {
            seen.push(key);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn test_remove_round_trip() {
        let (mut tm, sb) = fresh_tm(512);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();

        for key in 0..600_u64 {
            root = btree::insert(&mut tm, &info, root, &[key], &key.to_le_bytes()).unwrap();
        }
        for key in (0..600_u64).step_by(2) {
            let (new_root, removed) = btree::remove(&mut tm, &info, root, &[key]).unwrap();
            assert!(removed, "key {key}");
            root = new_root;
        }
        let _sb = commit(&mut tm, sb);

        for key in 0..600_u64 {
            let found = btree::lookup(&tm, &info, root, &[key]);
            if key % 2 == 0 {
                assert!(found.is_err(), "key {key} should be gone");
            } else {
                assert!(found.is_ok(), "key {key} should remain");
            }
        }

        // Removing an absent key reports false and leaves the rest intact.
        let (new_root, removed) = btree::remove(&mut tm, &info, root, &[0]).unwrap();
        assert!(!removed);
        assert!(btree::lookup(&tm, &info, new_root, &[1]).is_ok());
    }

    #[test]
    fn test_two_level_tree() {
        let (mut tm, sb) = fresh_tm(512);
        let info = two_level_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();

        for dev in 1..4_u64 {
            for block in 0..50_u64 {
                root = btree::insert(
                    &mut tm,
                    &info,
                    root,
                    &[dev, block],
                    &(dev * 1000 + block).to_le_bytes(),
                )
                .unwrap();
            }
        }
        let _sb = commit(&mut tm, sb);

        for dev in 1..4_u64 {
            for block in 0..50_u64 {
                let value = btree::lookup(&tm, &info, root, &[dev, block]).unwrap();
                assert_eq!(
                    u64::from_le_bytes(value.try_into().unwrap()),
                    dev * 1000 + block
                );
            }
        }
        assert!(btree::lookup(&tm, &info, root, &[9, 0]).is_err());
        assert!(btree::lookup(&tm, &info, root, &[1, 50]).is_err());

        let (new_root, removed) = btree::remove(&mut tm, &info, root, &[2, 25]).unwrap();
        assert!(removed);
        assert!(btree::lookup(&tm, &info, new_root, &[2, 25]).is_err());
        assert!(btree::lookup(&tm, &info, new_root, &[2, 24]).is_ok());
    }

    #[test]
    fn test_shadow_idempotent_within_transaction() {
        let (mut tm, sb) = fresh_tm(256);
        let info = value_info();
        let root = btree::empty(&mut tm, &info).unwrap();
        let sb = commit(&mut tm, sb);

        // First shadow in the new transaction allocates.
        let validator = Arc::clone(tm.node_validator());
        let (block, _inc) = tm.shadow_block(root, &validator).unwrap();
        let first = block.location();
        assert_ne!(first, root);
        tm.unlock(block).unwrap();
        let count_after_first = tm.ref_count(first).unwrap();

        // Second shadow of the shadow is a no-op.
        let (block, inc) = tm.shadow_block(first, &validator).unwrap();
        assert_eq!(block.location(), first);
        assert!(!inc);
        tm.unlock(block).unwrap();
        assert_eq!(tm.ref_count(first).unwrap(), count_after_first);
        let _sb = sb;
    }

    #[test]
    fn test_freed_blocks_not_reused_before_commit() {
        let (mut tm, sb) = fresh_tm(256);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();
        root = btree::insert(&mut tm, &info, root, &[1], &1_u64.to_le_bytes()).unwrap();
        let sb = commit(&mut tm, sb);

        // Shadowing frees the old root within this transaction; the
        // allocator must not hand it back out before commit.
        let old_root = root;
        root = btree::insert(&mut tm, &info, root, &[2], &2_u64.to_le_bytes()).unwrap();
        assert_ne!(root, old_root);
        let validator = Arc::clone(tm.node_validator());
        for _ in 0..4 {
            let block = tm.new_block(&validator).unwrap();
            assert_ne!(block.location(), old_root);
            let loc = block.location();
            tm.unlock(block).unwrap();
            tm.dec(loc).unwrap();
        }
        let _sb = commit(&mut tm, sb);
    }

    #[test]
    fn test_del_returns_space() {
        let (mut tm, sb) = fresh_tm(512);
        let info = value_info();

        let free_before = tm.sm_nr_free();
        let mut root = btree::empty(&mut tm, &info).unwrap();
        for key in 0..1000_u64 {
            root = btree::insert(&mut tm, &info, root, &[key], &key.to_le_bytes()).unwrap();
        }
        let sb = commit(&mut tm, sb);
        assert!(tm.sm_nr_free() < free_before);

        btree::del(&mut tm, &info, root).unwrap();
        let _sb = commit(&mut tm, sb);
        assert_eq!(tm.sm_nr_free(), free_before);
    }

    #[test]
    fn test_non_blocking_clone_would_block_when_cold() {
        let dev = Arc::new(MemByteDevice::new(256 * 4096));
        let info = value_info();

        let root = {
            let bm =
                BlockManager::new(Box::new(Arc::clone(&dev)), 4096, 128).unwrap();
            let (mut tm, mut sb) =
                TransactionManager::create_with_sm(bm, SUPERBLOCK, &sb_validator()).unwrap();
            let mut root = btree::empty(&mut tm, &info).unwrap();
            for key in 0..100_u64 {
                root = btree::insert(&mut tm, &info, root, &[key], &key.to_le_bytes())
                    .unwrap();
            }
            tm.pre_commit().unwrap();
            sb.data_mut()[..32].copy_from_slice(&tm.sm_root_bytes());
            tm.commit(sb).unwrap();
            root
        };

        // Fresh manager over the same bytes: nothing is resident, so the
        // non-blocking clone must refuse rather than touch the device.
        let bm = BlockManager::new(Box::new(Arc::clone(&dev)), 4096, 128).unwrap();
        let (tm, sb) =
            TransactionManager::open_with_sm(bm, SUPERBLOCK, 0, 32, &sb_validator()).unwrap();
        tm.unlock(sb).unwrap();
        let nb = tm.non_blocking_clone();
        assert!(matches!(
            btree::lookup(&nb, &info, root, &[0]),
            Err(HcError::WouldBlock)
        ));

        // A blocking lookup warms the path; the fast path then serves it.
        let value = btree::lookup(&tm, &info, root, &[0]).unwrap();
        assert_eq!(btree::lookup(&nb, &info, root, &[0]).unwrap(), value);
    }

    #[test]
    fn test_refcount_queue_survives_btree_churn() {
        // Space-map updates shadow bitmap blocks, which recurse into the
        // space map. A long run of inserts and removes exercises the
        // uncommitted queue; the invariant is simply that counts stay sane.
        let (mut tm, sb) = fresh_tm(512);
        let info = value_info();
        let mut root = btree::empty(&mut tm, &info).unwrap();
        let mut sb = commit(&mut tm, sb);

        for round in 0..5_u64 {
            for key in 0..300_u64 {
                root = btree::insert(
                    &mut tm,
                    &info,
                    root,
                    &[key],
                    &(round * 1000 + key).to_le_bytes(),
                )
                .unwrap();
            }
            for key in (0..300_u64).step_by(3) {
                root = btree::remove(&mut tm, &info, root, &[key]).unwrap().0;
            }
            sb = commit(&mut tm, sb);
            assert!(tm.ref_count(root).unwrap() >= 1);
        }
        let _sb = sb;
    }
}
