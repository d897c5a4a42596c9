#![forbid(unsafe_code)]
//! Persistent cache metadata.
//!
//! Two logical B-trees over one transaction manager track where origin
//! blocks live in the data pool:
//!
//! - forward: `(device, origin block) -> (pool block | flags << 60)`
//! - reverse: `(device, pool block) -> origin block`
//!
//! The superblock holds both roots, the pool watermark and the embedded
//! space-map root; one superblock write commits a whole transaction. A
//! process-wide [`MetadataRegistry`] shares one open handle per backing
//! device between targets.

use hc_block::{BlockManager, ByteDevice, NoopValidator, TrailingCrcValidator, Validator};
use hc_error::{HcError, Result};
use hc_pdata::btree::{self, BtreeInfo, ValueType};
use hc_pdata::tm::{NonBlockingTm, TransactionManager};
use hc_pdata::SM_ROOT_SIZE;
use hc_types::{
    pack_value, read_le_u64, unpack_value, write_le_u64, BlockId, DataBlockSize, DevId, OBlock,
    PBlock, METADATA_BLOCK_SIZE, METADATA_CACHE_SIZE, SECTOR_TO_BLOCK_SHIFT,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SUPERBLOCK_MAGIC: u64 = 21_081_990;
pub const SUPERBLOCK_VERSION: u64 = 1;
pub const SUPERBLOCK_LOCATION: BlockId = BlockId(0);

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_METADATA_BLOCK_SIZE: usize = 16;
const OFF_METADATA_NR_BLOCKS: usize = 24;
const OFF_DATA_BLOCK_SIZE: usize = 32;
const OFF_DATA_NR_BLOCKS: usize = 40;
const OFF_FIRST_FREE_BLOCK: usize = 48;
const OFF_FORWARD_ROOT: usize = 56;
const OFF_REVERSE_ROOT: usize = 64;
const OFF_SM_ROOT: usize = 72;

/// In-memory copy of the superblock fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Superblock {
    magic: u64,
    version: u64,
    metadata_block_size: u64,
    metadata_nr_blocks: u64,
    data_block_size: u64,
    data_nr_blocks: u64,
    first_free_block: u64,
    forward_root: BlockId,
    reverse_root: BlockId,
}

impl Superblock {
    fn unpack(data: &[u8]) -> Result<Self> {
        let get = |off| read_le_u64(data, off).map_err(|e| HcError::Format(e.to_string()));
        Ok(Self {
            magic: get(OFF_MAGIC)?,
            version: get(OFF_VERSION)?,
            metadata_block_size: get(OFF_METADATA_BLOCK_SIZE)?,
            metadata_nr_blocks: get(OFF_METADATA_NR_BLOCKS)?,
            data_block_size: get(OFF_DATA_BLOCK_SIZE)?,
            data_nr_blocks: get(OFF_DATA_NR_BLOCKS)?,
            first_free_block: get(OFF_FIRST_FREE_BLOCK)?,
            forward_root: BlockId(get(OFF_FORWARD_ROOT)?),
            reverse_root: BlockId(get(OFF_REVERSE_ROOT)?),
        })
    }

    fn pack(&self, data: &mut [u8]) -> Result<()> {
        let mut put = |off, value| {
            write_le_u64(data, off, value).map_err(|e| HcError::Format(e.to_string()))
        };
        put(OFF_MAGIC, self.magic)?;
        put(OFF_VERSION, self.version)?;
        put(OFF_METADATA_BLOCK_SIZE, self.metadata_block_size)?;
        put(OFF_METADATA_NR_BLOCKS, self.metadata_nr_blocks)?;
        put(OFF_DATA_BLOCK_SIZE, self.data_block_size)?;
        put(OFF_DATA_NR_BLOCKS, self.data_nr_blocks)?;
        put(OFF_FIRST_FREE_BLOCK, self.first_free_block)?;
        put(OFF_FORWARD_ROOT, self.forward_root.0)?;
        put(OFF_REVERSE_ROOT, self.reverse_root.0)?;
        Ok(())
    }
}

fn mapping_info() -> BtreeInfo {
    BtreeInfo {
        levels: 2,
        value_type: ValueType {
            // Pool/origin blocks live on a separate device; the tree does no
            // refcount bookkeeping for them.
            size: 8,
            inc: None,
            del: None,
        },
    }
}

fn dev_info() -> BtreeInfo {
    BtreeInfo {
        levels: 1,
        value_type: ValueType {
            size: 8,
            inc: None,
            del: None,
        },
    }
}

struct Inner {
    tm: TransactionManager,
    nb_tm: NonBlockingTm,
    sblock: Option<hc_block::Block>,
    sb: Superblock,
    have_inserted: bool,
    /// Sticky after a failed commit; every further mutation is rejected.
    failed: bool,
    /// Pool blocks below `first_free_block` whose mapping was removed;
    /// reused before the watermark advances.
    free_pool: Vec<PBlock>,
}

/// An open metadata device.
pub struct CacheMetadata {
    inner: RwLock<Inner>,
}

impl CacheMetadata {
    /// Open or create the metadata on `dev`.
    ///
    /// A device whose superblock is all zeroes is formatted; anything else
    /// must carry a valid magic.
    pub fn open(
        dev: Box<dyn ByteDevice>,
        data_block_size: DataBlockSize,
        data_nr_blocks: u64,
    ) -> Result<Self> {
        let bm = BlockManager::new(dev, METADATA_BLOCK_SIZE, METADATA_CACHE_SIZE)?;
        let sb_validator: Arc<dyn Validator> = Arc::new(TrailingCrcValidator);

        let create = superblock_all_zeroes(&bm)?;
        if create {
            Self::format(bm, &sb_validator, data_block_size, data_nr_blocks)
        } else {
            Self::reopen(bm, &sb_validator, data_block_size, data_nr_blocks)
        }
    }

    fn format(
        bm: BlockManager,
        sb_validator: &Arc<dyn Validator>,
        data_block_size: DataBlockSize,
        data_nr_blocks: u64,
    ) -> Result<Self> {
        let metadata_nr_blocks = bm.nr_blocks();
        let (mut tm, sblock) =
            TransactionManager::create_with_sm(bm, SUPERBLOCK_LOCATION, sb_validator)?;
        // Make the bare space map durable before building the trees.
        tm.pre_commit()?;
        tm.commit(sblock)?;

        let sblock = tm.write_lock(SUPERBLOCK_LOCATION, sb_validator)?;
        let forward_root = btree::empty(&mut tm, &mapping_info())?;
        let reverse_root = btree::empty(&mut tm, &mapping_info())?;

        let sb = Superblock {
            magic: SUPERBLOCK_MAGIC,
            version: SUPERBLOCK_VERSION,
            metadata_block_size: 1 << SECTOR_TO_BLOCK_SHIFT,
            metadata_nr_blocks,
            data_block_size: data_block_size.sectors(),
            data_nr_blocks,
            first_free_block: 0,
            forward_root,
            reverse_root,
        };

        let nb_tm = tm.non_blocking_clone();
        let md = Self {
            inner: RwLock::new(Inner {
                tm,
                nb_tm,
                sblock: Some(sblock),
                sb,
                have_inserted: true,
                failed: false,
                free_pool: Vec::new(),
            }),
        };
        md.commit()?;
        info!(
            target: "hcache::metadata",
            event = "metadata_format",
            metadata_nr_blocks,
            data_nr_blocks,
            data_block_size = data_block_size.sectors()
        );
        Ok(md)
    }

    fn reopen(
        bm: BlockManager,
        sb_validator: &Arc<dyn Validator>,
        data_block_size: DataBlockSize,
        _data_nr_blocks: u64,
    ) -> Result<Self> {
        let (mut tm, sblock) = TransactionManager::open_with_sm(
            bm,
            SUPERBLOCK_LOCATION,
            OFF_SM_ROOT,
            SM_ROOT_SIZE,
            sb_validator,
        )?;
        let sb = Superblock::unpack(sblock.data())?;
        tm.unlock(sblock)?;
        if sb.magic != SUPERBLOCK_MAGIC {
            return Err(HcError::Format(format!(
                "bad superblock magic {:#x}, wanted {SUPERBLOCK_MAGIC:#x}",
                sb.magic
            )));
        }
        if sb.version != SUPERBLOCK_VERSION {
            return Err(HcError::Format(format!(
                "unsupported metadata version {}",
                sb.version
            )));
        }
        if sb.data_block_size != data_block_size.sectors() {
            warn!(
                target: "hcache::metadata",
                event = "block_size_mismatch",
                on_disk = sb.data_block_size,
                requested = data_block_size.sectors()
            );
        }
        tm.reserve_block(SUPERBLOCK_LOCATION)?;

        let sblock = tm.write_lock(SUPERBLOCK_LOCATION, sb_validator)?;
        let free_pool = rebuild_free_pool(&tm, &sb)?;
        let nb_tm = tm.non_blocking_clone();
        info!(
            target: "hcache::metadata",
            event = "metadata_open",
            first_free_block = sb.first_free_block,
            data_nr_blocks = sb.data_nr_blocks,
            reclaimable = free_pool.len()
        );
        Ok(Self {
            inner: RwLock::new(Inner {
                tm,
                nb_tm,
                sblock: Some(sblock),
                sb,
                have_inserted: false,
                failed: false,
                free_pool,
            }),
        })
    }

    /// Commit the open transaction and begin the next one.
    ///
    /// A read-only epoch is free: with nothing inserted this returns without
    /// touching the device.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.commit_locked(&mut inner)
    }

    fn commit_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.failed {
            return Err(HcError::ConsistencyFailed);
        }
        if !inner.have_inserted {
            return Ok(());
        }

        let result = (|| {
            inner.tm.pre_commit()?;
            let mut sblock = inner
                .sblock
                .take()
                .ok_or_else(|| HcError::Format("no open transaction".to_owned()))?;
            inner.sb.pack(sblock.data_mut())?;
            let sm_root = inner.tm.sm_root_bytes();
            sblock.data_mut()[OFF_SM_ROOT..OFF_SM_ROOT + SM_ROOT_SIZE]
                .copy_from_slice(&sm_root);
            inner.tm.commit(sblock)?;

            // Open the next transaction.
            let sb_validator: Arc<dyn Validator> = Arc::new(TrailingCrcValidator);
            let sblock = inner.tm.write_lock(SUPERBLOCK_LOCATION, &sb_validator)?;
            let on_disk = Superblock::unpack(sblock.data())?;
            inner.sb.forward_root = on_disk.forward_root;
            inner.sb.reverse_root = on_disk.reverse_root;
            inner.sb.first_free_block = on_disk.first_free_block;
            inner.sblock = Some(sblock);
            inner.have_inserted = false;
            Ok(())
        })();

        if result.is_err() {
            inner.failed = true;
            warn!(target: "hcache::metadata", event = "commit_failed");
        } else {
            debug!(target: "hcache::metadata", event = "metadata_commit");
        }
        result
    }

    fn check_writable(inner: &Inner) -> Result<()> {
        if inner.failed {
            return Err(HcError::ConsistencyFailed);
        }
        Ok(())
    }

    /// Map `(dev, ob)` to a fresh pool block.
    ///
    /// Fails with `NoDataSpace` when the pool is exhausted; the caller parks
    /// the request and waits for reclamation or a resize.
    pub fn insert(&self, dev: DevId, ob: OBlock) -> Result<(PBlock, u8)> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;

        let pb = match inner.free_pool.pop() {
            Some(pb) => pb,
            None => {
                let b = inner.sb.first_free_block;
                if b >= inner.sb.data_nr_blocks {
                    debug!(
                        target: "hcache::metadata",
                        event = "pool_exhausted",
                        data_nr_blocks = inner.sb.data_nr_blocks
                    );
                    return Err(HcError::NoDataSpace);
                }
                inner.sb.first_free_block = b + 1;
                PBlock(b)
            }
        };

        inner.have_inserted = true;
        let info = mapping_info();
        let value = pack_value(pb, 0);
        let root = inner.sb.forward_root;
        inner.sb.forward_root =
            btree::insert(&mut inner.tm, &info, root, &[dev.0, ob.0], &value.to_le_bytes())?;
        let root = inner.sb.reverse_root;
        inner.sb.reverse_root =
            btree::insert(&mut inner.tm, &info, root, &[dev.0, pb.0], &ob.0.to_le_bytes())?;
        Ok((pb, 0))
    }

    /// Drop the mapping for `(dev, ob)` from both trees; the pool block
    /// becomes reusable.
    pub fn remove(&self, dev: DevId, ob: OBlock) -> Result<()> {
        let (pb, _flags) = self.lookup(dev, ob, true)?;
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner.have_inserted = true;

        let info = mapping_info();
        let root = inner.sb.forward_root;
        inner.sb.forward_root = btree::remove(&mut inner.tm, &info, root, &[dev.0, ob.0])?.0;
        let root = inner.sb.reverse_root;
        inner.sb.reverse_root = btree::remove(&mut inner.tm, &info, root, &[dev.0, pb.0])?.0;
        inner.free_pool.push(pb);
        Ok(())
    }

    /// Look up the mapping for `(dev, ob)`.
    ///
    /// With `can_block = false` the non-blocking view is used and contention
    /// or a cold cache yields `WouldBlock`.
    pub fn lookup(&self, dev: DevId, ob: OBlock, can_block: bool) -> Result<(PBlock, u8)> {
        let info = mapping_info();
        let value = if can_block {
            let inner = self.inner.read();
            btree::lookup(&inner.tm, &info, inner.sb.forward_root, &[dev.0, ob.0])?
        } else {
            let inner = self.inner.try_read().ok_or(HcError::WouldBlock)?;
            btree::lookup(&inner.nb_tm, &info, inner.sb.forward_root, &[dev.0, ob.0])?
        };
        let packed = read_le_u64(&value, 0).map_err(|e| HcError::Format(e.to_string()))?;
        Ok(unpack_value(packed))
    }

    /// Re-insert the mapping for `(dev, ob)` with new flag bits.
    pub fn update(&self, dev: DevId, ob: OBlock, flags: u8) -> Result<()> {
        let (pb, _old) = self.lookup(dev, ob, true)?;
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner.have_inserted = true;
        let info = mapping_info();
        let value = pack_value(pb, flags);
        let root = inner.sb.forward_root;
        inner.sb.forward_root =
            btree::insert(&mut inner.tm, &info, root, &[dev.0, ob.0], &value.to_le_bytes())?;
        Ok(())
    }

    /// Which origin block does pool block `pb` hold?
    pub fn lookup_reverse(&self, dev: DevId, pb: PBlock, can_block: bool) -> Result<OBlock> {
        let info = mapping_info();
        let value = if can_block {
            let inner = self.inner.read();
            btree::lookup(&inner.tm, &info, inner.sb.reverse_root, &[dev.0, pb.0])?
        } else {
            let inner = self.inner.try_read().ok_or(HcError::WouldBlock)?;
            btree::lookup(&inner.nb_tm, &info, inner.sb.reverse_root, &[dev.0, pb.0])?
        };
        Ok(OBlock(
            read_le_u64(&value, 0).map_err(|e| HcError::Format(e.to_string()))?,
        ))
    }

    /// Remove every `(dev, *)` mapping from both trees.
    pub fn delete(&self, dev: DevId) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        let devs = dev_info();

        for forward in [true, false] {
            let outer_root = if forward {
                inner.sb.forward_root
            } else {
                inner.sb.reverse_root
            };
            let subtree = match btree::lookup(&inner.tm, &devs, outer_root, &[dev.0]) {
                Ok(value) => {
                    BlockId(read_le_u64(&value, 0).map_err(|e| HcError::Format(e.to_string()))?)
                }
                Err(HcError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if forward {
                // Mapped pool blocks become reusable.
                let mut freed = Vec::new();
                btree::walk(&inner.tm, subtree, 8, &mut |_ob, value| {
                    let packed =
                        read_le_u64(value, 0).map_err(|e| HcError::Format(e.to_string()))?;
                    freed.push(unpack_value(packed).0);
                    Ok(())
                })?;
                inner.free_pool.extend(freed);
            }
            inner.have_inserted = true;
            btree::del(&mut inner.tm, &devs, subtree)?;
            let (new_root, _removed) = btree::remove(&mut inner.tm, &devs, outer_root, &[dev.0])?;
            if forward {
                inner.sb.forward_root = new_root;
            } else {
                inner.sb.reverse_root = new_root;
            }
        }
        info!(target: "hcache::metadata", event = "device_deleted", dev = dev.0);
        Ok(())
    }

    /// Enumerate `(ob, pb, flags)` for every mapping of `dev`.
    pub fn walk_mappings(
        &self,
        dev: DevId,
        visit: &mut dyn FnMut(OBlock, PBlock, u8) -> Result<()>,
    ) -> Result<()> {
        let inner = self.inner.read();
        let devs = dev_info();
        let subtree = match btree::lookup(&inner.tm, &devs, inner.sb.forward_root, &[dev.0]) {
            Ok(value) => {
                BlockId(read_le_u64(&value, 0).map_err(|e| HcError::Format(e.to_string()))?)
            }
            Err(HcError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        btree::walk(&inner.tm, subtree, 8, &mut |ob, value| {
            let packed = read_le_u64(value, 0).map_err(|e| HcError::Format(e.to_string()))?;
            let (pb, flags) = unpack_value(packed);
            visit(OBlock(ob), pb, flags)
        })
    }

    /// Devices present in the forward tree.
    pub fn devices(&self) -> Result<Vec<DevId>> {
        let inner = self.inner.read();
        let mut devs = Vec::new();
        btree::walk(&inner.tm, inner.sb.forward_root, 8, &mut |dev, _| {
            devs.push(DevId(dev));
            Ok(())
        })?;
        Ok(devs)
    }

    pub fn get_data_block_size(&self, _dev: DevId) -> u64 {
        self.inner.read().sb.data_block_size
    }

    pub fn get_data_dev_size(&self, _dev: DevId) -> u64 {
        self.inner.read().sb.data_nr_blocks
    }

    /// Pool blocks handed out so far (the allocation watermark).
    pub fn get_provisioned_blocks(&self, _dev: DevId) -> u64 {
        let inner = self.inner.read();
        inner.sb.first_free_block - inner.free_pool.len() as u64
    }

    /// Grow (never shrink below the watermark) the data pool.
    pub fn resize_data_dev(&self, _dev: DevId, new_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        if inner.sb.first_free_block > new_size {
            return Err(HcError::NoDataSpace);
        }
        if inner.sb.data_nr_blocks != new_size {
            info!(
                target: "hcache::metadata",
                event = "pool_resize",
                old = inner.sb.data_nr_blocks,
                new = new_size
            );
            inner.sb.data_nr_blocks = new_size;
            inner.have_inserted = true;
        }
        Ok(())
    }

    /// Commit any outstanding writes; called by the registry on final
    /// release.
    pub fn close(&self) -> Result<()> {
        self.commit()
    }
}

fn superblock_all_zeroes(bm: &BlockManager) -> Result<bool> {
    let validator: Arc<dyn Validator> = Arc::new(NoopValidator);
    let block = bm.read_lock(SUPERBLOCK_LOCATION, &validator)?;
    let zero = block.data().iter().all(|b| *b == 0);
    bm.unlock(block)?;
    Ok(zero)
}

/// Reconstruct the reusable-pool-block list on open: every block below the
/// watermark that no reverse mapping claims.
fn rebuild_free_pool(tm: &TransactionManager, sb: &Superblock) -> Result<Vec<PBlock>> {
    let mut mapped = BTreeSet::new();
    let mut subtrees = Vec::new();
    btree::walk(tm, sb.reverse_root, 8, &mut |_dev, value| {
        subtrees.push(BlockId(
            read_le_u64(value, 0).map_err(|e| HcError::Format(e.to_string()))?,
        ));
        Ok(())
    })?;
    for subtree in subtrees {
        btree::walk(tm, subtree, 8, &mut |pb, _| {
            mapped.insert(pb);
            Ok(())
        })?;
    }
    Ok((0..sb.first_free_block)
        .filter(|pb| !mapped.contains(pb))
        .map(PBlock)
        .collect())
}

// ── Open-metadata registry ──────────────────────────────────────────────────

struct RegistryEntry {
    md: Arc<CacheMetadata>,
    refs: u32,
}

/// Process-wide table of open metadata devices keyed by device identifier.
///
/// Two targets over the same backing device share one handle; the second and
/// later openers bump a reference count without reopening.
#[derive(Default)]
pub struct MetadataRegistry {
    table: Mutex<HashMap<String, RegistryEntry>>,
}

impl MetadataRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the handle for `key`, opening it with `open` on first use.
    pub fn acquire(
        &self,
        key: &str,
        open: impl FnOnce() -> Result<CacheMetadata>,
    ) -> Result<Arc<CacheMetadata>> {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(key) {
            entry.refs += 1;
            debug!(
                target: "hcache::metadata",
                event = "registry_share",
                key,
                refs = entry.refs
            );
            return Ok(Arc::clone(&entry.md));
        }
        let md = Arc::new(open()?);
        table.insert(
            key.to_owned(),
            RegistryEntry {
                md: Arc::clone(&md),
                refs: 1,
            },
        );
        debug!(target: "hcache::metadata", event = "registry_open", key);
        Ok(md)
    }

    /// Drop one reference; the final release commits and closes the handle.
    pub fn release(&self, key: &str) -> Result<()> {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(key) else {
            return Err(HcError::NotFound(format!("metadata handle {key}")));
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = table.remove(key).expect("entry checked above");
            drop(table);
            entry.md.close()?;
            debug!(target: "hcache::metadata", event = "registry_close", key);
        }
        Ok(())
    }

    /// Number of open handles; used by shutdown checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
