//! Disk space map: per-block reference counts over the metadata device.
//!
//! Two bits per block live in bitmap blocks (0 unused, 1, 2, 3 = "many");
//! counts above two spill into a ref-count B-tree. Bitmap blocks are indexed
//! by a second B-tree mapping bitmap-block-index to an `IndexEntry`.
//!
//! Because the space map's own structures live on the device it describes,
//! an `inc`/`dec` may shadow a B-tree node which calls straight back into the
//! space map. Nested operations are therefore queued in a bounded
//! `uncommitted` list and applied when the outermost frame exits, and
//! allocation searches run against the pre-transaction view (`old_ll`) so
//! blocks freed this transaction are not reused while COW still reads them.
//!
//! The very first creation bootstraps with a bump allocator until the real
//! structures exist, then a fix-up loop records the blocks the bootstrap
//! handed out.

use crate::btree::{self, BtreeInfo, ValueType};
use crate::tm::TransactionManager;
use hc_error::{HcError, Result};
use hc_types::{read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockId};
use tracing::{debug, trace, warn};

/// Upper bound on nested refcount operations queued by a single outermost
/// space-map operation. Dominates the recursion fan-out of one shadow.
const MAX_RECURSIVE_ALLOCATIONS: usize = 32;

/// Two-bit entries: four per byte.
const ENTRIES_PER_BYTE: u64 = 4;

/// Serialised space-map root: nr_blocks, nr_allocated, bitmap_root,
/// ref_count_root, each 8 bytes little-endian.
pub const SM_ROOT_SIZE: usize = 32;

const INDEX_ENTRY_SIZE: usize = 16;

#[must_use]
pub(crate) fn entries_per_block(block_size: usize) -> u64 {
    block_size as u64 * ENTRIES_PER_BYTE
}

fn div_up(v: u64, n: u64) -> u64 {
    v / n + u64::from(v % n > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BopType {
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy)]
struct Bop {
    op: BopType,
    block: BlockId,
}

/// Low-level view of the on-disk structures: sizes plus tree roots.
#[derive(Debug, Clone)]
pub(crate) struct LlData {
    nr_blocks: u64,
    nr_allocated: u64,
    bitmap_root: BlockId,
    ref_count_root: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmMode {
    /// Bump allocator over `[begin, end)`; used only while the real
    /// structures are being built.
    Bootstrap,
    Disk,
}

/// State of the disk space map, embedded in the transaction manager.
pub struct SpaceMapDisk {
    mode: SmMode,
    entries_per_block: u64,
    ll: LlData,
    old_ll: LlData,
    begin: u64,
    end: u64,
    recursion_count: u32,
    allocated_this_transaction: u64,
    uncommitted: Vec<Bop>,
}

impl SpaceMapDisk {
    pub(crate) fn bootstrap(begin: u64, nr_blocks: u64, entries_per_block: u64) -> Self {
        let ll = LlData {
            nr_blocks,
            nr_allocated: 0,
            bitmap_root: BlockId(0),
            ref_count_root: BlockId(0),
        };
        Self {
            mode: SmMode::Bootstrap,
            entries_per_block,
            old_ll: ll.clone(),
            ll,
            begin,
            end: nr_blocks,
            recursion_count: 0,
            allocated_this_transaction: 0,
            uncommitted: Vec::with_capacity(MAX_RECURSIVE_ALLOCATIONS),
        }
    }

    pub(crate) fn from_root(root: &[u8], entries_per_block: u64) -> Result<Self> {
        if root.len() < SM_ROOT_SIZE {
            return Err(HcError::Format(format!(
                "space map root too small: {} bytes",
                root.len()
            )));
        }
        let ll = LlData {
            nr_blocks: read_le_u64(root, 0).map_err(|e| HcError::Format(e.to_string()))?,
            nr_allocated: read_le_u64(root, 8).map_err(|e| HcError::Format(e.to_string()))?,
            bitmap_root: BlockId(
                read_le_u64(root, 16).map_err(|e| HcError::Format(e.to_string()))?,
            ),
            ref_count_root: BlockId(
                read_le_u64(root, 24).map_err(|e| HcError::Format(e.to_string()))?,
            ),
        };
        Ok(Self {
            mode: SmMode::Disk,
            entries_per_block,
            old_ll: ll.clone(),
            ll,
            begin: 0,
            end: 0,
            recursion_count: 0,
            allocated_this_transaction: 0,
            uncommitted: Vec::with_capacity(MAX_RECURSIVE_ALLOCATIONS),
        })
    }
}

/// Index-tree value describing one bitmap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    blocknr: BlockId,
    nr_free: u32,
    /// Bit index within this bitmap block before which no entry is free.
    none_free_before: u32,
}

impl IndexEntry {
    fn pack(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut out = [0_u8; INDEX_ENTRY_SIZE];
        let _ = write_le_u64(&mut out, 0, self.blocknr.0);
        let _ = write_le_u32(&mut out, 8, self.nr_free);
        let _ = write_le_u32(&mut out, 12, self.none_free_before);
        out
    }

    fn unpack(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            blocknr: BlockId(read_le_u64(bytes, 0).map_err(|e| HcError::Format(e.to_string()))?),
            nr_free: read_le_u32(bytes, 8).map_err(|e| HcError::Format(e.to_string()))?,
            none_free_before: read_le_u32(bytes, 12)
                .map_err(|e| HcError::Format(e.to_string()))?,
        })
    }
}

fn bitmap_info() -> BtreeInfo {
    BtreeInfo {
        levels: 1,
        value_type: ValueType {
            size: INDEX_ENTRY_SIZE,
            inc: None,
            del: None,
        },
    }
}

fn ref_count_info() -> BtreeInfo {
    BtreeInfo {
        levels: 1,
        value_type: ValueType {
            size: 4,
            inc: None,
            del: None,
        },
    }
}

/// Read the two-bit entry `e` from a bitmap block.
///
/// Bit order matches the little-endian u64 word layout: entry `e` occupies
/// bits `2e` (high) and `2e + 1` (low) of word `e / 32`.
fn bitmap_get(data: &[u8], e: u64) -> u32 {
    let w = (e / 32) as usize * 8;
    let word = u64::from_le_bytes([
        data[w],
        data[w + 1],
        data[w + 2],
        data[w + 3],
        data[w + 4],
        data[w + 5],
        data[w + 6],
        data[w + 7],
    ]);
    let bit = (e % 32) * 2;
    ((((word >> bit) & 1) << 1) | ((word >> (bit + 1)) & 1)) as u32
}

fn bitmap_set(data: &mut [u8], e: u64, val: u32) {
    let w = (e / 32) as usize * 8;
    let mut word = u64::from_le_bytes([
        data[w],
        data[w + 1],
        data[w + 2],
        data[w + 3],
        data[w + 4],
        data[w + 5],
        data[w + 6],
        data[w + 7],
    ]);
    let bit = (e % 32) * 2;
    word &= !(0b11 << bit);
    if val & 0b10 != 0 {
        word |= 1 << bit;
    }
    if val & 0b01 != 0 {
        word |= 1 << (bit + 1);
    }
    data[w..w + 8].copy_from_slice(&word.to_le_bytes());
}

impl TransactionManager {
    // ── Public space-map surface ────────────────────────────────────────────

    /// Increment the reference count of `b`.
    pub fn inc(&mut self, b: BlockId) -> Result<()> {
        match self.sm.mode {
            SmMode::Bootstrap => Err(HcError::Format(
                "refcount increment during space-map bootstrap".to_owned(),
            )),
            SmMode::Disk => {
                if self.sm.recursion_count > 0 {
                    self.push_bop(BopType::Inc, b)
                } else {
                    self.with_recursion_guard(|tm| tm.ll_inc(b))
                }
            }
        }
    }

    /// Decrement the reference count of `b`.
    pub fn dec(&mut self, b: BlockId) -> Result<()> {
        match self.sm.mode {
            SmMode::Bootstrap => {
                // The bootstrap allocator cannot record frees; the fix-up
                // loop at creation settles the final counts.
                trace!(target: "hcache::pdata::sm", event = "bootstrap_leak", block = b.0);
                Ok(())
            }
            SmMode::Disk => {
                if self.sm.recursion_count > 0 {
                    self.push_bop(BopType::Dec, b)
                } else {
                    self.with_recursion_guard(|tm| tm.ll_dec(b))
                }
            }
        }
    }

    /// Current reference count of `b`, including queued adjustments.
    pub fn ref_count(&mut self, b: BlockId) -> Result<u32> {
        let mut adjustment: i64 = 0;
        for bop in &self.sm.uncommitted {
            if bop.block == b {
                match bop.op {
                    BopType::Inc => adjustment += 1,
                    BopType::Dec => adjustment -= 1,
                }
            }
        }
        if self.sm.mode == SmMode::Bootstrap {
            return Ok(u32::from(b.0 < self.sm.begin));
        }
        let count = i64::from(self.ll_lookup(b)?) + adjustment;
        u32::try_from(count)
            .map_err(|_| HcError::Format(format!("negative refcount for block {b}")))
    }

    /// Blocks still free in this transaction's allocation view.
    #[must_use]
    pub fn sm_nr_free(&self) -> u64 {
        self.sm
            .old_ll
            .nr_blocks
            .saturating_sub(self.sm.old_ll.nr_allocated)
            .saturating_sub(self.sm.allocated_this_transaction)
    }

    #[must_use]
    pub fn sm_nr_blocks(&self) -> u64 {
        self.sm.ll.nr_blocks
    }

    /// Serialise the space-map root for embedding in the superblock.
    #[must_use]
    pub fn sm_root_bytes(&self) -> [u8; SM_ROOT_SIZE] {
        let mut out = [0_u8; SM_ROOT_SIZE];
        let _ = write_le_u64(&mut out, 0, self.sm.ll.nr_blocks);
        let _ = write_le_u64(&mut out, 8, self.sm.ll.nr_allocated);
        let _ = write_le_u64(&mut out, 16, self.sm.ll.bitmap_root.0);
        let _ = write_le_u64(&mut out, 24, self.sm.ll.ref_count_root.0);
        out
    }

    // ── Allocation ─────────────────────────────────────────────────────────

    pub(crate) fn sm_new_block(&mut self) -> Result<BlockId> {
        match self.sm.mode {
            SmMode::Bootstrap => {
                if self.sm.begin == self.sm.end {
                    return Err(HcError::NoMetadataSpace);
                }
                let b = BlockId(self.sm.begin);
                self.sm.begin += 1;
                trace!(target: "hcache::pdata::sm", event = "bootstrap_alloc", block = b.0);
                Ok(b)
            }
            SmMode::Disk => {
                let (begin, end) = (self.sm.begin, self.sm.end);
                let b = self.ll_find_free(begin, end)?;
                self.sm.begin = b.0 + 1;
                if self.sm.recursion_count > 0 {
                    self.push_bop(BopType::Inc, b)?;
                } else {
                    self.with_recursion_guard(|tm| tm.ll_inc(b))?;
                }
                self.sm.allocated_this_transaction += 1;
                trace!(target: "hcache::pdata::sm", event = "alloc", block = b.0);
                Ok(b)
            }
        }
    }

    pub(crate) fn sm_count_is_more_than_one(&mut self, b: BlockId) -> Result<bool> {
        let mut adjustment: i64 = 0;
        for bop in &self.sm.uncommitted {
            if bop.block == b {
                match bop.op {
                    BopType::Inc => adjustment += 1,
                    BopType::Dec => adjustment -= 1,
                }
            }
        }
        if self.sm.mode == SmMode::Bootstrap {
            return Ok(false);
        }
        if adjustment > 1 {
            return Ok(true);
        }
        let rc = self.ll_lookup_bitmap(b)?;
        if rc == 3 {
            // Erring on the side of caution: "many" is always more than one.
            return Ok(true);
        }
        Ok(i64::from(rc) + adjustment > 1)
    }

    // ── Transaction boundaries ─────────────────────────────────────────────

    /// Snapshot the live view for the next transaction's allocations.
    pub(crate) fn sm_commit(&mut self) {
        debug_assert!(self.sm.uncommitted.is_empty());
        self.sm.old_ll = self.sm.ll.clone();
        self.sm.begin = 0;
        self.sm.end = self.sm.ll.nr_blocks;
        self.sm.allocated_this_transaction = 0;
    }

    pub(crate) fn sm_open(&mut self) {
        self.sm_commit();
    }

    /// Build the on-disk structures from the bootstrap allocator, then record
    /// the blocks the bootstrap produced, including the superblock.
    pub(crate) fn sm_create(&mut self, superblock: BlockId) -> Result<()> {
        let nr_blocks = self.sm.end;
        self.ll_new(nr_blocks)?;
        self.sm.mode = SmMode::Disk;

        let handed_out = self.sm.begin;
        for i in 0..handed_out {
            self.inc(BlockId(i))?;
        }
        self.inc(superblock)?;
        self.sm_commit();
        debug!(
            target: "hcache::pdata::sm",
            event = "sm_create",
            nr_blocks,
            bootstrap_blocks = handed_out
        );
        Ok(())
    }

    // ── Recursion plumbing ─────────────────────────────────────────────────

    fn push_bop(&mut self, op: BopType, block: BlockId) -> Result<()> {
        if self.sm.uncommitted.len() == MAX_RECURSIVE_ALLOCATIONS {
            warn!(
                target: "hcache::pdata::sm",
                event = "bop_queue_overflow",
                block = block.0
            );
            return Err(HcError::Format(
                "space map recursion queue overflow".to_owned(),
            ));
        }
        trace!(
            target: "hcache::pdata::sm",
            event = "bop_queued",
            op = ?op,
            block = block.0
        );
        self.sm.uncommitted.push(Bop { op, block });
        Ok(())
    }

    /// Run `f` as the outermost space-map frame, draining queued operations
    /// on the way out.
    fn with_recursion_guard(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.sm.recursion_count += 1;
        let mut result = f(self);
        if self.sm.recursion_count == 1 {
            while result.is_ok() {
                let Some(bop) = self.sm.uncommitted.pop() else {
                    break;
                };
                result = match bop.op {
                    BopType::Inc => self.ll_inc(bop.block),
                    BopType::Dec => self.ll_dec(bop.block),
                };
            }
        }
        self.sm.recursion_count -= 1;
        result
    }

    // ── Low-level operations on the on-disk structures ─────────────────────

    fn ll_new(&mut self, nr_blocks: u64) -> Result<()> {
        self.sm.ll.nr_blocks = nr_blocks;
        self.sm.ll.nr_allocated = 0;

        let info = bitmap_info();
        let mut bitmap_root = btree::empty(self, &info)?;
        let epb = self.sm.entries_per_block;
        let blocks = div_up(nr_blocks, epb);
        for i in 0..blocks {
            let validator = std::sync::Arc::clone(&self.bitmap_validator);
            let block = self.new_block(&validator)?;
            let loc = block.location();
            self.unlock(block)?;
            let ie = IndexEntry {
                blocknr: loc,
                nr_free: u32::try_from(epb).unwrap_or(u32::MAX),
                none_free_before: 0,
            };
            bitmap_root = btree::insert(self, &info, bitmap_root, &[i], &ie.pack())?;
        }
        self.sm.ll.bitmap_root = bitmap_root;

        let rc_info = ref_count_info();
        self.sm.ll.ref_count_root = btree::empty(self, &rc_info)?;
        Ok(())
    }

    fn lookup_index_entry(&mut self, root: BlockId, index: u64) -> Result<IndexEntry> {
        let info = bitmap_info();
        let bytes = btree::lookup(self, &info, root, &[index])?;
        IndexEntry::unpack(&bytes)
    }

    fn ll_lookup_bitmap(&mut self, b: BlockId) -> Result<u32> {
        let epb = self.sm.entries_per_block;
        let root = self.sm.ll.bitmap_root;
        let ie = self.lookup_index_entry(root, b.0 / epb)?;
        let validator = std::sync::Arc::clone(&self.bitmap_validator);
        let block = self.read_lock(ie.blocknr, &validator)?;
        let val = bitmap_get(block.data(), b.0 % epb);
        self.unlock(block)?;
        Ok(val)
    }

    fn ll_lookup(&mut self, b: BlockId) -> Result<u32> {
        let rc = self.ll_lookup_bitmap(b)?;
        if rc != 3 {
            return Ok(rc);
        }
        let info = ref_count_info();
        let root = self.sm.ll.ref_count_root;
        let bytes = btree::lookup(self, &info, root, &[b.0])?;
        read_le_u32(&bytes, 0).map_err(|e| HcError::Format(e.to_string()))
    }

    fn ll_inc(&mut self, b: BlockId) -> Result<()> {
        let rc = self.ll_lookup(b)?;
        self.ll_insert(b, rc + 1)
    }

    fn ll_dec(&mut self, b: BlockId) -> Result<()> {
        let rc = self.ll_lookup(b)?;
        if rc == 0 {
            return Err(HcError::Format(format!(
                "refcount underflow for block {b}"
            )));
        }
        self.ll_insert(b, rc - 1)
    }

    /// Set the reference count of `b`, handling bitmap/ref-count-tree
    /// transitions in both directions.
    fn ll_insert(&mut self, b: BlockId, ref_count: u32) -> Result<()> {
        let epb = self.sm.entries_per_block;
        let index = b.0 / epb;
        let bit = b.0 % epb;
        let root = self.sm.ll.bitmap_root;
        let mut ie = self.lookup_index_entry(root, index)?;

        let validator = std::sync::Arc::clone(&self.bitmap_validator);
        let (mut shadow, _inc) = self.shadow_block(ie.blocknr, &validator)?;
        let old = bitmap_get(shadow.data(), bit);

        if ref_count <= 2 {
            bitmap_set(shadow.data_mut(), bit, ref_count);
        } else {
            bitmap_set(shadow.data_mut(), bit, 3);
        }
        let new_loc = shadow.location();
        self.unlock(shadow)?;

        if ref_count > 2 {
            let info = ref_count_info();
            let rc_root = self.sm.ll.ref_count_root;
            let mut value = [0_u8; 4];
            let _ = write_le_u32(&mut value, 0, ref_count);
            self.sm.ll.ref_count_root = btree::insert(self, &info, rc_root, &[b.0], &value)?;
        } else if old > 2 {
            let info = ref_count_info();
            let rc_root = self.sm.ll.ref_count_root;
            self.sm.ll.ref_count_root = btree::remove(self, &info, rc_root, &[b.0])?.0;
        }

        #[allow(clippy::cast_possible_truncation)] // bit < entries_per_block <= u32 range
        let bit32 = bit as u32;
        if ref_count != 0 && old == 0 {
            self.sm.ll.nr_allocated += 1;
            ie.nr_free -= 1;
            if ie.none_free_before == bit32 {
                ie.none_free_before = bit32 + 1;
            }
        } else if old != 0 && ref_count == 0 {
            self.sm.ll.nr_allocated -= 1;
            ie.nr_free += 1;
            ie.none_free_before = ie.none_free_before.min(bit32);
        }
        ie.blocknr = new_loc;

        let info = bitmap_info();
        let root = self.sm.ll.bitmap_root;
        self.sm.ll.bitmap_root = btree::insert(self, &info, root, &[index], &ie.pack())?;
        Ok(())
    }

    /// Find the lowest free block in `[begin, end)` using the
    /// pre-transaction view, so blocks freed in this transaction are not
    /// handed back out before commit.
    fn ll_find_free(&mut self, begin: u64, end: u64) -> Result<BlockId> {
        let epb = self.sm.entries_per_block;
        let old_root = self.sm.old_ll.bitmap_root;
        let index_begin = begin / epb;
        let index_end = div_up(end, epb);

        let mut begin = begin;
        for i in index_begin..index_end {
            let ie = self.lookup_index_entry(old_root, i)?;
            if ie.nr_free == 0 {
                begin = 0;
                continue;
            }
            let bit_begin = (begin % epb).max(u64::from(ie.none_free_before));
            let bit_end = if i == index_end - 1 && end % epb != 0 {
                end % epb
            } else {
                epb
            };
            let validator = std::sync::Arc::clone(&self.bitmap_validator);
            let block = self.read_lock(ie.blocknr, &validator)?;
            let mut found = None;
            for bit in bit_begin..bit_end {
                if bitmap_get(block.data(), bit) == 0 {
                    found = Some(bit);
                    break;
                }
            }
            self.unlock(block)?;
            if let Some(bit) = found {
                return Ok(BlockId(i * epb + bit));
            }
            begin = 0;
        }
        Err(HcError::NoMetadataSpace)
    }
}
