#![forbid(unsafe_code)]
//! Block I/O layer for the hcache metadata device.
//!
//! Provides the `ByteDevice` trait, a fixed-block-size `BlockManager` with a
//! small warm cache, per-block reader/writer locks, and content validators
//! that run on every read from disk and before every write to disk.
//!
//! The superblock commit protocol lives here too: `flush_and_unlock` writes
//! every dirty block, syncs, and only then writes the superblock, making the
//! superblock write the durability boundary of a transaction.

use hc_error::{HcError, Result};
use hc_types::BlockId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                HcError::Format("read length overflows u64".to_owned())
            })?)
            .ok_or_else(|| HcError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(HcError::Format(format!(
                "read out of bounds: offset={offset} len={} dev_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                HcError::Format("write length overflows u64".to_owned())
            })?)
            .ok_or_else(|| HcError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(HcError::Format(format!(
                "write out of bounds: offset={offset} len={} dev_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Backs unit and integration tests across the workspace; also handy as a
/// scratch metadata device for the CLI `check` path.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Snapshot the full device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Replace the device contents, e.g. to rewind to a snapshot.
    pub fn restore(&self, bytes: Vec<u8>) {
        *self.bytes.lock() = bytes;
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| HcError::Format("offset overflow".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| HcError::Format("range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(HcError::Format("read out of bounds".to_owned()));
        }
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| HcError::Format("offset overflow".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| HcError::Format("range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(HcError::Format("write out of bounds".to_owned()));
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Content validator attached to a block while it lives in the cache.
///
/// `check` runs after every read from the device; `prepare_for_write` runs on
/// the cached buffer just before it is written back. Be consistent with your
/// use of validators per block; the only time a block's validator may change
/// is through `write_lock_zero`.
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    fn prepare_for_write(&self, loc: BlockId, data: &mut [u8]);

    fn check(&self, loc: BlockId, data: &[u8]) -> Result<()>;
}

/// Validator that performs no checks.
#[derive(Debug, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn prepare_for_write(&self, _loc: BlockId, _data: &mut [u8]) {}

    fn check(&self, _loc: BlockId, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Validator storing a CRC32C over the block in its trailing four bytes.
///
/// Used for the superblock: the checksum covers everything before it.
#[derive(Debug, Default)]
pub struct TrailingCrcValidator;

const CSUM_SIZE: usize = 4;

fn trailing_crc(data: &[u8]) -> u32 {
    crc32c::crc32c(&data[..data.len() - CSUM_SIZE])
}

impl Validator for TrailingCrcValidator {
    fn name(&self) -> &'static str {
        "trailing_crc"
    }

    fn prepare_for_write(&self, _loc: BlockId, data: &mut [u8]) {
        let csum = trailing_crc(data);
        let at = data.len() - CSUM_SIZE;
        data[at..].copy_from_slice(&csum.to_le_bytes());
    }

    fn check(&self, loc: BlockId, data: &[u8]) -> Result<()> {
        let at = data.len() - CSUM_SIZE;
        let stored = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        // An all-zero block has never been written through this validator.
        if stored == 0 && data[..at].iter().all(|b| *b == 0) {
            return Ok(());
        }
        let actual = trailing_crc(data);
        if stored != actual {
            warn!(
                target: "hcache::block",
                event = "csum_mismatch",
                block = loc.0,
                stored,
                actual
            );
            return Err(HcError::ChecksumFail {
                block: loc.0,
                detail: format!("stored {stored:#x}, computed {actual:#x}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

/// A locked block: an owned copy of the block's contents plus lock identity.
///
/// Write-locked blocks must be handed back via `BlockManager::unlock` for
/// their modifications to reach the cache (and eventually the device).
#[derive(Debug)]
pub struct Block {
    loc: BlockId,
    data: Vec<u8>,
    mode: LockMode,
}

impl Block {
    #[must_use]
    pub fn location(&self) -> BlockId {
        self.loc
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access; only meaningful on write-locked blocks.
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.mode, LockMode::Write, "mutating a read-locked block");
        &mut self.data
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.mode == LockMode::Write
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    readers: u32,
    writer: bool,
}

struct Slot {
    data: Vec<u8>,
    dirty: bool,
    validator: Arc<dyn Validator>,
}

struct BmState {
    slots: HashMap<BlockId, Slot>,
    locks: HashMap<BlockId, LockState>,
    /// Approximate recency order for eviction; only unlocked clean slots are
    /// eligible victims.
    lru: VecDeque<BlockId>,
}

impl BmState {
    fn touch(&mut self, b: BlockId) {
        if let Some(pos) = self.lru.iter().position(|x| *x == b) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(b);
    }
}

struct BmInner {
    dev: Box<dyn ByteDevice>,
    block_size: usize,
    nr_blocks: u64,
    capacity: usize,
    state: Mutex<BmState>,
    cond: Condvar,
}

/// Fixed-block-size manager over a byte device.
///
/// Cloning is cheap and yields a handle to the same cache and lock table.
#[derive(Clone)]
pub struct BlockManager {
    inner: Arc<BmInner>,
}

impl BlockManager {
    /// Create a manager with `block_size` bytes per block and a warm cache of
    /// `capacity` blocks.
    pub fn new(dev: Box<dyn ByteDevice>, block_size: u32, capacity: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(HcError::InvalidArgument(format!(
                "block_size={block_size} must be a power of two"
            )));
        }
        let len = dev.len_bytes();
        let nr_blocks = len / u64::from(block_size);
        if nr_blocks == 0 {
            return Err(HcError::InvalidArgument(format!(
                "device too small: {len} bytes with block_size={block_size}"
            )));
        }
        debug!(
            target: "hcache::block",
            event = "block_manager_create",
            block_size,
            nr_blocks,
            capacity
        );
        Ok(Self {
            inner: Arc::new(BmInner {
                dev,
                block_size: block_size as usize,
                nr_blocks,
                capacity: capacity.max(1),
                state: Mutex::new(BmState {
                    slots: HashMap::new(),
                    locks: HashMap::new(),
                    lru: VecDeque::new(),
                }),
                cond: Condvar::new(),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.inner.nr_blocks
    }

    fn check_bounds(&self, b: BlockId) -> Result<()> {
        if b.0 >= self.inner.nr_blocks {
            return Err(HcError::Format(format!(
                "block out of range: block={} nr_blocks={}",
                b.0, self.inner.nr_blocks
            )));
        }
        Ok(())
    }

    /// Ensure `b` is resident, reading and validating from the device when
    /// needed. Called with the state lock held.
    fn fill_slot(
        &self,
        state: &mut BmState,
        b: BlockId,
        validator: &Arc<dyn Validator>,
    ) -> Result<()> {
        if state.slots.contains_key(&b) {
            return Ok(());
        }
        let mut data = vec![0_u8; self.inner.block_size];
        let offset = b.0 * self.inner.block_size as u64;
        self.inner.dev.read_exact_at(offset, &mut data)?;
        validator.check(b, &data)?;
        trace!(target: "hcache::block", event = "cache_fill", block = b.0);
        self.evict_to_capacity(state)?;
        state.slots.insert(
            b,
            Slot {
                data,
                dirty: false,
                validator: Arc::clone(validator),
            },
        );
        state.touch(b);
        Ok(())
    }

    fn evict_to_capacity(&self, state: &mut BmState) -> Result<()> {
        while state.slots.len() >= self.inner.capacity {
            let victim = state
                .lru
                .iter()
                .copied()
                .find(|cand| {
                    let locked = state
                        .locks
                        .get(cand)
                        .is_some_and(|l| l.writer || l.readers > 0);
                    !locked
                })
                .ok_or_else(|| {
                    HcError::Format("metadata cache exhausted by held locks".to_owned())
                })?;
            let slot = state.slots.get_mut(&victim).ok_or_else(|| {
                HcError::Format("lru entry without cache slot".to_owned())
            })?;
            if slot.dirty {
                slot.validator.prepare_for_write(victim, &mut slot.data);
                let offset = victim.0 * self.inner.block_size as u64;
                self.inner.dev.write_all_at(offset, &slot.data)?;
                slot.dirty = false;
            }
            let _ = state.slots.remove(&victim);
            if let Some(pos) = state.lru.iter().position(|x| *x == victim) {
                let _ = state.lru.remove(pos);
            }
            trace!(target: "hcache::block", event = "cache_evict", block = victim.0);
        }
        Ok(())
    }

    /// Take a shared lock on `b`, blocking while a writer holds it.
    pub fn read_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.check_bounds(b)?;
        let mut state = self.inner.state.lock();
        loop {
            let lock = state.locks.entry(b).or_default();
            if !lock.writer {
                lock.readers += 1;
                break;
            }
            self.inner.cond.wait(&mut state);
        }
        match self.fill_slot(&mut state, b, validator) {
            Ok(()) => {}
            Err(err) => {
                self.release_lock(&mut state, b, LockMode::Read);
                return Err(err);
            }
        }
        let data = state
            .slots
            .get(&b)
            .map(|slot| slot.data.clone())
            .ok_or_else(|| HcError::Format("slot vanished under lock".to_owned()))?;
        Ok(Block {
            loc: b,
            data,
            mode: LockMode::Read,
        })
    }

    /// Non-blocking read lock: fails with `WouldBlock` if the block is write
    /// locked or not resident (the fast path must never touch the device).
    pub fn read_try_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        let _ = validator;
        self.check_bounds(b)?;
        let mut state = self.inner.state.lock();
        if state.locks.get(&b).is_some_and(|lock| lock.writer) {
            return Err(HcError::WouldBlock);
        }
        let Some(slot) = state.slots.get(&b) else {
            return Err(HcError::WouldBlock);
        };
        let data = slot.data.clone();
        state.locks.entry(b).or_default().readers += 1;
        Ok(Block {
            loc: b,
            data,
            mode: LockMode::Read,
        })
    }

    /// Take an exclusive lock on `b`, blocking while readers or a writer hold it.
    pub fn write_lock(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.check_bounds(b)?;
        let mut state = self.inner.state.lock();
        loop {
            let lock = state.locks.entry(b).or_default();
            if !lock.writer && lock.readers == 0 {
                lock.writer = true;
                break;
            }
            self.inner.cond.wait(&mut state);
        }
        match self.fill_slot(&mut state, b, validator) {
            Ok(()) => {}
            Err(err) => {
                self.release_lock(&mut state, b, LockMode::Write);
                return Err(err);
            }
        }
        let data = state
            .slots
            .get(&b)
            .map(|slot| slot.data.clone())
            .ok_or_else(|| HcError::Format("slot vanished under lock".to_owned()))?;
        Ok(Block {
            loc: b,
            data,
            mode: LockMode::Write,
        })
    }

    /// Exclusive lock without reading the device; the buffer starts zeroed.
    ///
    /// The caller takes responsibility for writing the whole block. This is
    /// also the only operation that may change a block's validator.
    pub fn write_lock_zero(&self, b: BlockId, validator: &Arc<dyn Validator>) -> Result<Block> {
        self.check_bounds(b)?;
        let mut state = self.inner.state.lock();
        loop {
            let lock = state.locks.entry(b).or_default();
            if !lock.writer && lock.readers == 0 {
                lock.writer = true;
                break;
            }
            self.inner.cond.wait(&mut state);
        }
        self.evict_to_capacity(&mut state)?;
        state.slots.insert(
            b,
            Slot {
                data: vec![0_u8; self.inner.block_size],
                dirty: false,
                validator: Arc::clone(validator),
            },
        );
        state.touch(b);
        Ok(Block {
            loc: b,
            data: vec![0_u8; self.inner.block_size],
            mode: LockMode::Write,
        })
    }

    fn release_lock(&self, state: &mut BmState, b: BlockId, mode: LockMode) {
        let lock = state.locks.entry(b).or_default();
        match mode {
            LockMode::Read => {
                debug_assert!(lock.readers > 0);
                lock.readers = lock.readers.saturating_sub(1);
            }
            LockMode::Write => {
                debug_assert!(lock.writer);
                lock.writer = false;
            }
        }
        if lock.readers == 0 && !lock.writer {
            let _ = state.locks.remove(&b);
        }
        self.inner.cond.notify_all();
    }

    /// Release a lock. Write-locked contents are stored back into the cache
    /// and marked dirty.
    pub fn unlock(&self, block: Block) -> Result<()> {
        let mut state = self.inner.state.lock();
        if block.mode == LockMode::Write {
            let slot = state.slots.get_mut(&block.loc).ok_or_else(|| {
                HcError::Format("unlock of block without cache slot".to_owned())
            })?;
            slot.data = block.data;
            slot.dirty = true;
            state.touch(block.loc);
        }
        self.release_lock(&mut state, block.loc, block.mode);
        Ok(())
    }

    /// Write every dirty block back to the device and sync.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.flush_locked(&mut state, None)?;
        self.inner.dev.sync()
    }

    fn flush_locked(&self, state: &mut BmState, skip: Option<BlockId>) -> Result<()> {
        let mut dirty: Vec<BlockId> = state
            .slots
            .iter()
            .filter(|(loc, slot)| slot.dirty && Some(**loc) != skip)
            .map(|(loc, _)| *loc)
            .collect();
        dirty.sort_unstable();
        for loc in dirty {
            let slot = state.slots.get_mut(&loc).ok_or_else(|| {
                HcError::Format("dirty slot vanished during flush".to_owned())
            })?;
            slot.validator.prepare_for_write(loc, &mut slot.data);
            let offset = loc.0 * self.inner.block_size as u64;
            self.inner.dev.write_all_at(offset, &slot.data)?;
            slot.dirty = false;
            trace!(target: "hcache::block", event = "flush_block", block = loc.0);
        }
        Ok(())
    }

    /// Commit protocol: flush all dirty blocks except the superblock, sync,
    /// then unlock and write the superblock, and sync again.
    ///
    /// `superblock` must be write locked. All earlier writes are durable
    /// before the superblock write completes.
    pub fn flush_and_unlock(&self, superblock: Block) -> Result<()> {
        if !superblock.is_write_locked() {
            return Err(HcError::InvalidArgument(
                "flush_and_unlock needs a write-locked superblock".to_owned(),
            ));
        }
        let sb_loc = superblock.location();
        {
            let mut state = self.inner.state.lock();
            self.flush_locked(&mut state, Some(sb_loc))?;
        }
        self.inner.dev.sync()?;

        self.unlock(superblock)?;

        let mut state = self.inner.state.lock();
        let slot = state.slots.get_mut(&sb_loc).ok_or_else(|| {
            HcError::Format("superblock slot missing at commit".to_owned())
        })?;
        slot.validator.prepare_for_write(sb_loc, &mut slot.data);
        let offset = sb_loc.0 * self.inner.block_size as u64;
        self.inner.dev.write_all_at(offset, &slot.data)?;
        slot.dirty = false;
        drop(state);
        self.inner.dev.sync()?;
        debug!(target: "hcache::block", event = "superblock_commit", block = sb_loc.0);
        Ok(())
    }

    /// Number of locks currently held; used by shutdown assertions.
    #[must_use]
    pub fn locks_held(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .locks
            .values()
            .map(|l| l.readers as usize + usize::from(l.writer))
            .sum()
    }
}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("block_size", &self.inner.block_size)
            .field("nr_blocks", &self.inner.nr_blocks)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Arc<dyn Validator> {
        Arc::new(NoopValidator)
    }

    fn new_bm(blocks: usize) -> BlockManager {
        let dev = MemByteDevice::new(blocks * 4096);
        BlockManager::new(Box::new(dev), 4096, 16).unwrap()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let bm = new_bm(8);
        let v = validator();

        let mut block = bm.write_lock(BlockId(3), &v).unwrap();
        block.data_mut()[0] = 0xAB;
        block.data_mut()[4095] = 0xCD;
        bm.unlock(block).unwrap();

        let block = bm.read_lock(BlockId(3), &v).unwrap();
        assert_eq!(block.data()[0], 0xAB);
        assert_eq!(block.data()[4095], 0xCD);
        bm.unlock(block).unwrap();
        assert_eq!(bm.locks_held(), 0);
    }

    #[test]
    fn test_try_lock_fails_on_writer() {
        let bm = new_bm(8);
        let v = validator();

        let block = bm.write_lock(BlockId(1), &v).unwrap();
        let err = bm.read_try_lock(BlockId(1), &v).unwrap_err();
        assert!(matches!(err, HcError::WouldBlock));
        bm.unlock(block).unwrap();

        // Resident and unlocked: try lock succeeds now.
        let block = bm.read_try_lock(BlockId(1), &v).unwrap();
        bm.unlock(block).unwrap();
    }

    #[test]
    fn test_try_lock_fails_when_not_resident() {
        let bm = new_bm(8);
        let v = validator();
        let err = bm.read_try_lock(BlockId(2), &v).unwrap_err();
        assert!(matches!(err, HcError::WouldBlock));
    }

    #[test]
    fn test_shared_readers() {
        let bm = new_bm(8);
        let v = validator();
        let a = bm.read_lock(BlockId(0), &v).unwrap();
        let b = bm.read_lock(BlockId(0), &v).unwrap();
        assert_eq!(bm.locks_held(), 2);
        bm.unlock(a).unwrap();
        bm.unlock(b).unwrap();
        assert_eq!(bm.locks_held(), 0);
    }

    #[test]
    fn test_dirty_data_survives_eviction() {
        let dev = MemByteDevice::new(64 * 4096);
        let bm = BlockManager::new(Box::new(dev), 4096, 4).unwrap();
        let v = validator();

        for i in 0..32_u64 {
            let mut block = bm.write_lock(BlockId(i), &v).unwrap();
            block.data_mut()[0] = 0x40 | i as u8;
            bm.unlock(block).unwrap();
        }

        for i in 0..32_u64 {
            let block = bm.read_lock(BlockId(i), &v).unwrap();
            assert_eq!(block.data()[0], 0x40 | i as u8, "block {i}");
            bm.unlock(block).unwrap();
        }
    }

    #[test]
    fn test_flush_and_unlock_orders_superblock_last() {
        let dev = MemByteDevice::new(8 * 4096);
        let bm = BlockManager::new(Box::new(dev), 4096, 16).unwrap();
        let v: Arc<dyn Validator> = Arc::new(TrailingCrcValidator);
        let nv = validator();

        let mut sb = bm.write_lock_zero(BlockId(0), &v).unwrap();
        sb.data_mut()[0] = 0x11;
        let mut other = bm.write_lock(BlockId(5), &nv).unwrap();
        other.data_mut()[0] = 0x22;
        bm.unlock(other).unwrap();

        bm.flush_and_unlock(sb).unwrap();

        // Both blocks durable; superblock checksum verifies on re-read.
        let sb = bm.read_lock(BlockId(0), &v).unwrap();
        assert_eq!(sb.data()[0], 0x11);
        bm.unlock(sb).unwrap();
    }

    #[test]
    fn test_trailing_crc_round_trip_and_corruption() {
        let v = TrailingCrcValidator;
        let mut data = vec![0_u8; 4096];
        data[7] = 0x5A;
        v.prepare_for_write(BlockId(1), &mut data);
        v.check(BlockId(1), &data).unwrap();

        // Flip one payload bit; the stored checksum no longer matches.
        data[7] = 0x5B;
        let err = v.check(BlockId(1), &data).unwrap_err();
        assert!(matches!(err, HcError::ChecksumFail { block: 1, .. }));
    }

    #[test]
    fn test_trailing_crc_accepts_all_zero_block() {
        let v = TrailingCrcValidator;
        let data = vec![0_u8; 4096];
        v.check(BlockId(0), &data).unwrap();
    }

    #[test]
    fn test_file_device_round_trip() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0_u8; 16 * 4096]).unwrap();
        file.flush().unwrap();

        let dev = FileByteDevice::open(file.path()).unwrap();
        assert_eq!(dev.len_bytes(), 16 * 4096);
        let bm = BlockManager::new(Box::new(dev), 4096, 8).unwrap();
        let v = validator();

        let mut block = bm.write_lock(BlockId(9), &v).unwrap();
        block.data_mut()[123] = 0x7E;
        bm.unlock(block).unwrap();
        bm.flush().unwrap();

        // A second manager over the same file sees the flushed bytes.
        let dev = FileByteDevice::open(file.path()).unwrap();
        let bm2 = BlockManager::new(Box::new(dev), 4096, 8).unwrap();
        let block = bm2.read_lock(BlockId(9), &v).unwrap();
        assert_eq!(block.data()[123], 0x7E);
        bm2.unlock(block).unwrap();
    }

    #[test]
    fn test_out_of_range_block_rejected() {
        let bm = new_bm(4);
        let v = validator();
        assert!(bm.read_lock(BlockId(4), &v).is_err());
        assert!(bm.write_lock(BlockId(99), &v).is_err());
    }
}
