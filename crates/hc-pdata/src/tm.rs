//! Transaction manager: shadow copy-on-write over the block manager.
//!
//! The TM owns the disk space map and enforces immutability of committed
//! data: the only way to modify a block is to allocate a fresh one
//! (`new_block`) or shadow an existing one (`shadow_block`). A shadow of a
//! block already shadowed in this transaction is coalesced to a plain write
//! lock, so repeated updates of one node cost one allocation per transaction.
//!
//! Commit is two-phase: `pre_commit` flushes every dirty block, then
//! `commit` writes the superblock last via the block manager. The superblock
//! write is the durability boundary.

use crate::space_map::SpaceMapDisk;
use hc_block::{Block, BlockManager, NoopValidator, Validator};
use hc_error::{HcError, Result};
use hc_types::BlockId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Read access shared by the blocking TM and its non-blocking clone.
///
/// Lookup paths are generic over this trait so the request-mapping hot path
/// can run against `NonBlockingTm` and fail with `WouldBlock` instead of
/// waiting on disk.
pub trait TmRead {
    fn read_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block>;

    fn unlock(&self, block: Block) -> Result<()>;

    fn node_validator(&self) -> &Arc<dyn Validator>;
}

/// The real transaction manager.
pub struct TransactionManager {
    bm: BlockManager,
    pub(crate) sm: SpaceMapDisk,
    /// Blocks allocated or shadowed in the open transaction; shadow requests
    /// for members are idempotent.
    shadows: HashSet<BlockId>,
    /// Diagnostics only: shadow operations performed over the TM's lifetime.
    shadow_count: u64,
    node_validator: Arc<dyn Validator>,
    pub(crate) bitmap_validator: Arc<dyn Validator>,
}

impl TransactionManager {
    fn new(bm: BlockManager, sm: SpaceMapDisk) -> Self {
        Self {
            bm,
            sm,
            shadows: HashSet::new(),
            shadow_count: 0,
            node_validator: Arc::new(crate::btree::NodeValidator),
            bitmap_validator: Arc::new(NoopValidator),
        }
    }

    /// Create a fresh metadata device: ties the knot by building a space map
    /// whose own structures are tracked by this TM.
    ///
    /// Returns the TM with an open transaction plus the write-locked, zeroed
    /// superblock. The caller fills the superblock and commits.
    pub fn create_with_sm(
        bm: BlockManager,
        superblock: BlockId,
        sb_validator: &Arc<dyn Validator>,
    ) -> Result<(Self, Block)> {
        let sb = bm.write_lock_zero(superblock, sb_validator)?;
        let nr_blocks = bm.nr_blocks();
        let entries_per_block = crate::space_map::entries_per_block(bm.block_size());
        let sm = SpaceMapDisk::bootstrap(superblock.0 + 1, nr_blocks, entries_per_block);
        let mut tm = Self::new(bm, sm);
        tm.sm_create(superblock)?;
        debug!(
            target: "hcache::pdata::tm",
            event = "tm_create",
            nr_blocks,
            superblock = superblock.0
        );
        Ok((tm, sb))
    }

    /// Open an existing metadata device; the space-map root is read from the
    /// superblock region `[root_offset, root_offset + root_len)`.
    ///
    /// Returns the TM plus the read-locked superblock so the caller can
    /// verify magic before unlocking.
    pub fn open_with_sm(
        bm: BlockManager,
        superblock: BlockId,
        root_offset: usize,
        root_len: usize,
        sb_validator: &Arc<dyn Validator>,
    ) -> Result<(Self, Block)> {
        let sb = bm.read_lock(superblock, sb_validator)?;
        let entries_per_block = crate::space_map::entries_per_block(bm.block_size());
        let root = hc_types::ensure_slice(sb.data(), root_offset, root_len)
            .map_err(|e| HcError::Format(e.to_string()))?;
        let sm = SpaceMapDisk::from_root(root, entries_per_block)?;
        let mut tm = Self::new(bm, sm);
        tm.sm_open();
        debug!(
            target: "hcache::pdata::tm",
            event = "tm_open",
            nr_blocks = tm.bm.nr_blocks(),
            superblock = superblock.0
        );
        Ok((tm, sb))
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.bm.block_size()
    }

    /// Allocate a block and return it zeroed under a write lock. The caller
    /// must fill it before unlocking; it is never read from disk first.
    pub fn new_block(&mut self, validator: &Arc<dyn Validator>) -> Result<Block> {
        let b = self.sm_new_block()?;
        let block = self.bm.write_lock_zero(b, validator)?;
        self.shadows.insert(b);
        trace!(target: "hcache::pdata::tm", event = "new_block", block = b.0);
        Ok(block)
    }

    /// Shadow `orig`: allocate a new block, copy the contents, and drop a
    /// reference on `orig`.
    ///
    /// Returns `inc_children = true` when `orig` had a reference count above
    /// one before the decrement; the caller must then bump the reference
    /// counts of everything `orig` points at.
    ///
    /// Shadowing a block that is itself a shadow from this transaction is a
    /// no-op: the same block comes back write locked, with
    /// `inc_children = false`.
    pub fn shadow_block(
        &mut self,
        orig: BlockId,
        validator: &Arc<dyn Validator>,
    ) -> Result<(Block, bool)> {
        if self.shadows.contains(&orig) {
            let block = self.bm.write_lock(orig, validator)?;
            return Ok((block, false));
        }

        let inc_children = self.sm_count_is_more_than_one(orig)?;
        let new = self.sm_new_block()?;
        let mut shadow = self.bm.write_lock_zero(new, validator)?;
        let old = self.bm.read_lock(orig, validator)?;
        shadow.data_mut().copy_from_slice(old.data());
        self.bm.unlock(old)?;
        self.dec(orig)?;
        self.shadows.insert(new);
        self.shadow_count += 1;
        trace!(
            target: "hcache::pdata::tm",
            event = "shadow_block",
            orig = orig.0,
            shadow = new.0,
            inc_children
        );
        Ok((shadow, inc_children))
    }

    /// Reserve `b` so the allocator never hands it out (the superblock).
    pub fn reserve_block(&mut self, b: BlockId) -> Result<()> {
        if self.ref_count(b)? == 0 {
            self.inc(b)?;
        }
        Ok(())
    }

    /// First commit phase: make every data block durable. After this the
    /// space-map root serialised by `sm_root_bytes` matches what is on disk.
    pub fn pre_commit(&mut self) -> Result<()> {
        self.bm.flush()
    }

    /// Second commit phase: write `superblock` last and unlock it. This is
    /// the atomicity point; the transaction's shadow set resets and the
    /// space map opens its next epoch.
    pub fn commit(&mut self, superblock: Block) -> Result<()> {
        self.bm.flush_and_unlock(superblock)?;
        self.sm_commit();
        self.shadows.clear();
        debug!(
            target: "hcache::pdata::tm",
            event = "tm_commit",
            shadow_count = self.shadow_count
        );
        Ok(())
    }

    /// Secondary handle sharing this TM's cache whose lock operations fail
    /// with `WouldBlock` rather than waiting.
    #[must_use]
    pub fn non_blocking_clone(&self) -> NonBlockingTm {
        NonBlockingTm {
            bm: self.bm.clone(),
            node_validator: Arc::clone(&self.node_validator),
        }
    }

    /// Shadow operations performed so far. Diagnostics only.
    #[must_use]
    pub fn shadow_count(&self) -> u64 {
        self.shadow_count
    }

    pub(crate) fn bm(&self) -> &BlockManager {
        &self.bm
    }

    /// Pass-through write lock for client-managed blocks (the superblock).
    pub fn write_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.bm.write_lock(b, validator)
    }

    pub fn write_lock_zero(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.bm.write_lock_zero(b, validator)
    }

    /// Pass-through read lock; blocks while a writer holds `b`.
    pub fn read_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.bm.read_lock(b, validator)
    }

    pub fn unlock(&self, block: Block) -> Result<()> {
        self.bm.unlock(block)
    }
}

impl TmRead for TransactionManager {
    fn read_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.bm.read_lock(b, validator)
    }

    fn unlock(&self, block: Block) -> Result<()> {
        self.bm.unlock(block)
    }

    fn node_validator(&self) -> &Arc<dyn Validator> {
        &self.node_validator
    }
}

/// Non-blocking view of a transaction manager for fast-path lookups.
///
/// Shares the cache with the real TM; anything that is not resident or is
/// write locked yields `WouldBlock`.
pub struct NonBlockingTm {
    bm: BlockManager,
    node_validator: Arc<dyn Validator>,
}

impl TmRead for NonBlockingTm {
    fn read_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.bm.read_try_lock(b, validator)
    }

    fn unlock(&self, block: Block) -> Result<()> {
        self.bm.unlock(block)
    }

    fn node_validator(&self) -> &Arc<dyn Validator> {
        &self.node_validator
    }
}
