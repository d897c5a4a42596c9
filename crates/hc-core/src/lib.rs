#![forbid(unsafe_code)]
//! The cache core: the data-plane state machine between the block layer,
//! the replacement policy, and the persistent metadata.
//!
//! All mutation runs on one worker thread per cache. The ingress path does a
//! bounds check, queues the request, and wakes the worker; the worker drains
//! three lists in order: copy completions, incoming requests, and dirty
//! blocks whose writeback deadline passed. Suspension points exist only in
//! the metadata transaction manager and the external copy engine; the policy
//! and all in-memory structures never block.
//!
//! Per cache block (one `BlockState` per origin block with outstanding
//! work):
//!
//! ```text
//! UNMAPPED -- insert -> MAPPED_CLEAN
//! MAPPED_CLEAN -- write -> MAPPED_DIRTY (writeback timer armed)
//! MAPPED_DIRTY -- copy complete -> MAPPED_CLEAN | MAPPED_DIRTY (FORCE_DIRTY)
//! MAPPED_* -- remove -> UNMAPPED (only when quiescent)
//! ```

mod copy;

pub use copy::{CopyCallback, CopyEngine, CopyRegion, CopySide, ThreadedCopier};

use hc_error::{HcError, Result};
use hc_metadata::CacheMetadata;
use hc_policy::{policy_stack_create, IoDesc, Policy, PolicyResult};
use hc_types::{CBlock, DataBlockSize, DevId, OBlock, PBlock, BLOCK_DIRTY, BLOCK_UPTODATE};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Copies allowed in flight at once; new writebacks throttle at half.
const PARALLEL_COPIES: u32 = 16;

/// Construction parameters for a cache target.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dev: DevId,
    pub block_size: DataBlockSize,
    /// Policy or policy-stack string, e.g. `"mq"` or `"trace+cleaner+mq"`.
    pub policy: String,
    /// Deferral before a dirty block is written back.
    pub writeback_delay: Duration,
}

impl CacheConfig {
    #[must_use]
    pub fn new(dev: DevId, block_size: DataBlockSize, policy: &str) -> Self {
        Self {
            dev,
            block_size,
            policy: policy.to_owned(),
            writeback_delay: Duration::from_secs(3),
        }
    }
}

/// A block-aligned request entering the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest {
    pub sector: u64,
    pub nr_sectors: u64,
    pub is_write: bool,
    /// FUA/FLUSH semantics: metadata is committed before completion.
    pub flush: bool,
}

/// Where the request's data lives after mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remap {
    Origin { sector: u64 },
    Pool { sector: u64 },
}

/// Final disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Remapped(Remap),
    /// The cache is suspending; resubmit later.
    Requeue,
}

pub type RequestResult = Result<RequestOutcome>;

/// Status line counters: `<free> <used> <dirty>`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatus {
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub dirty_blocks: u64,
}

struct Pending {
    req: CacheRequest,
    done: mpsc::Sender<RequestResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyKind {
    /// origin -> cache
    Promote,
    /// cache -> origin
    Writeback,
}

struct Endio {
    ob: OBlock,
    kind: CopyKind,
    result: Result<()>,
}

struct BlockState {
    refs: u32,
    pool_block: PBlock,
    policy_cblock: CBlock,
    uptodate: bool,
    dirty: bool,
    active: bool,
    error: bool,
    force_dirty: bool,
    /// Drop the mapping once the pending writeback lands.
    evicting: bool,
    deadline: Option<Instant>,
    pending: VecDeque<Pending>,
}

impl BlockState {
    fn new(pool_block: PBlock, policy_cblock: CBlock) -> Self {
        Self {
            refs: 0,
            pool_block,
            policy_cblock,
            uptodate: false,
            dirty: false,
            active: false,
            error: false,
            force_dirty: false,
            evicting: false,
            deadline: None,
            pending: VecDeque::new(),
        }
    }

    fn persistent_flags(&self) -> u8 {
        let mut flags = 0;
        if self.dirty {
            flags |= BLOCK_DIRTY;
        }
        if self.uptodate {
            flags |= BLOCK_UPTODATE;
        }
        flags
    }
}

struct CoreState {
    incoming: VecDeque<Pending>,
    endios: VecDeque<Endio>,
    no_space: VecDeque<Pending>,
    blocks: HashMap<OBlock, BlockState>,
    flush_queue: BTreeSet<(Instant, OBlock)>,
    inflight_copies: u32,
    dirty_blocks: u64,
    reflushed: bool,
    stopping: bool,
    busy: bool,
    reclaim_seed: u64,
}

struct Shared {
    md: Arc<CacheMetadata>,
    dev: DevId,
    block_size: DataBlockSize,
    policy: Mutex<Box<dyn Policy>>,
    copier: Arc<dyn CopyEngine>,
    state: Mutex<CoreState>,
    wake: Condvar,
    /// Signalled at the end of every worker pass; used by flush and suspend.
    drained: Condvar,
    bounce_mode: AtomicBool,
    error_event: AtomicBool,
    no_space_flag: AtomicBool,
    writeback_delay: Duration,
}

/// An active cache target over one metadata handle.
pub struct Cache {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Cache {
    pub fn new(
        md: Arc<CacheMetadata>,
        copier: Arc<dyn CopyEngine>,
        config: CacheConfig,
    ) -> Result<Self> {
        let cache_size = md.get_data_dev_size(config.dev);
        let policy = policy_stack_create(&config.policy, cache_size)?;
        Self::with_policy(md, copier, config, policy)
    }

    /// Build a cache around an already-constructed policy object.
    pub fn with_policy(
        md: Arc<CacheMetadata>,
        copier: Arc<dyn CopyEngine>,
        config: CacheConfig,
        policy: Box<dyn Policy>,
    ) -> Result<Self> {
        info!(
            target: "hcache::core",
            event = "cache_create",
            dev = config.dev.0,
            cache_size = md.get_data_dev_size(config.dev),
            policy = policy.name()
        );

        let shared = Arc::new(Shared {
            md,
            dev: config.dev,
            block_size: config.block_size,
            policy: Mutex::new(policy),
            copier,
            state: Mutex::new(CoreState {
                incoming: VecDeque::new(),
                endios: VecDeque::new(),
                no_space: VecDeque::new(),
                blocks: HashMap::new(),
                flush_queue: BTreeSet::new(),
                inflight_copies: 0,
                dirty_blocks: 0,
                reflushed: false,
                stopping: false,
                busy: false,
                reclaim_seed: 0x9E37_79B9_7F4A_7C15,
            }),
            wake: Condvar::new(),
            drained: Condvar::new(),
            bounce_mode: AtomicBool::new(false),
            error_event: AtomicBool::new(false),
            no_space_flag: AtomicBool::new(false),
            writeback_delay: config.writeback_delay,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("hcache-worker".to_owned())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(HcError::Io)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue a request. Runs on the caller's thread and does only a bounds
    /// check, an enqueue, and a wakeup.
    pub fn submit(&self, req: CacheRequest) -> Result<mpsc::Receiver<RequestResult>> {
        let block_sectors = self.shared.block_size.sectors();
        let offset = req.sector & self.shared.block_size.offset_mask();
        if req.nr_sectors == 0 || offset + req.nr_sectors > block_sectors {
            return Err(HcError::InvalidArgument(format!(
                "request crosses a block boundary: sector={} nr_sectors={}",
                req.sector, req.nr_sectors
            )));
        }

        let (tx, rx) = mpsc::channel();
        if self.shared.bounce_mode.load(Ordering::Acquire) {
            let _ = tx.send(Ok(RequestOutcome::Requeue));
            return Ok(rx);
        }
        {
            let mut state = self.shared.state.lock();
            state.incoming.push_back(Pending { req, done: tx });
        }
        self.shared.wake.notify_all();
        Ok(rx)
    }

    /// Wait until queued work has been processed, then commit metadata.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.busy || !(state.incoming.is_empty() && state.endios.is_empty()) {
            self.shared.wake.notify_all();
            self.shared.drained.wait(&mut state);
        }
        drop(state);
        self.shared.md.commit()
    }

    /// Stop accepting work, drain every in-flight block, and commit.
    pub fn presuspend(&self) -> Result<()> {
        self.shared.bounce_mode.store(true, Ordering::Release);
        self.shared.wake.notify_all();

        let mut state = self.shared.state.lock();
        // Disarm pending writebacks; their dirty flags are persistent and
        // the post-resume scan re-queues them.
        let disarmed: Vec<OBlock> = state.flush_queue.iter().map(|(_, ob)| *ob).collect();
        state.flush_queue.clear();
        for ob in disarmed {
            if let Some(block) = state.blocks.get_mut(&ob) {
                block.deadline = None;
                block.refs = block.refs.saturating_sub(1);
            }
            drop_if_quiescent(&self.shared, &mut state, ob);
        }
        let parked: Vec<Pending> = state.no_space.drain(..).collect();
        for pending in parked {
            let _ = pending.done.send(Ok(RequestOutcome::Requeue));
        }

        while state.busy
            || !state.blocks.is_empty()
            || !state.incoming.is_empty()
            || !state.endios.is_empty()
        {
            self.shared.wake.notify_all();
            self.shared.drained.wait(&mut state);
        }
        drop(state);
        info!(target: "hcache::core", event = "presuspend_drained", dev = self.shared.dev.0);
        self.shared.md.commit()
    }

    /// Re-enable the cache; grows the pool if the data device grew.
    pub fn resume(&self, pool_nr_blocks: u64) -> Result<()> {
        let current = self.shared.md.get_data_dev_size(self.shared.dev);
        if pool_nr_blocks < current {
            warn!(
                target: "hcache::core",
                event = "pool_shrunk",
                current,
                reported = pool_nr_blocks
            );
        } else if pool_nr_blocks > current {
            self.shared
                .md
                .resize_data_dev(self.shared.dev, pool_nr_blocks)?;
        }
        self.shared.error_event.store(false, Ordering::Release);
        self.shared.bounce_mode.store(false, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            state.reflushed = false;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> CacheStatus {
        let used = self.shared.md.get_provisioned_blocks(self.shared.dev);
        let total = self.shared.md.get_data_dev_size(self.shared.dev);
        let dirty = self.shared.state.lock().dirty_blocks;
        CacheStatus {
            free_blocks: total.saturating_sub(used),
            used_blocks: used,
            dirty_blocks: dirty,
        }
    }

    /// True while parked requests wait for pool space.
    #[must_use]
    pub fn congested(&self) -> bool {
        self.shared.no_space_flag.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn had_error_event(&self) -> bool {
        self.shared.error_event.load(Ordering::Acquire)
    }

    pub fn policy_status(&self) -> String {
        self.shared.policy.lock().status()
    }

    pub fn policy_message(&self, msg: &str) -> Result<()> {
        self.shared.policy.lock().message(msg)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shared.bounce_mode.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        {
            let mut state = shared.state.lock();
            if state.stopping {
                break;
            }
            let has_work = !state.incoming.is_empty()
                || !state.endios.is_empty()
                || flush_due(&state, Instant::now());
            if !has_work {
                shared.drained.notify_all();
                match next_deadline(&state) {
                    Some(deadline) => {
                        let _ = shared.wake.wait_until(&mut state, deadline);
                    }
                    None => shared.wake.wait(&mut state),
                }
                continue;
            }
            state.busy = true;
        }

        let bounce = shared.bounce_mode.load(Ordering::Acquire);
        if !bounce {
            let scan_needed = {
                let mut state = shared.state.lock();
                let needed = !state.reflushed;
                state.reflushed = true;
                needed
            };
            if scan_needed {
                startup_scan(shared);
            }
        }

        do_endios(shared);

        let batch: Vec<Pending> = {
            let mut state = shared.state.lock();
            state.incoming.drain(..).collect()
        };
        if bounce {
            for pending in batch {
                let _ = pending.done.send(Ok(RequestOutcome::Requeue));
            }
        } else {
            do_bios(shared, batch);
        }

        if !bounce {
            do_block_flushes(shared);
            do_block_free(shared);
        }

        {
            let mut state = shared.state.lock();
            state.busy = false;
        }
        shared.drained.notify_all();
    }
    shared.drained.notify_all();
}

fn flush_due(state: &CoreState, now: Instant) -> bool {
    state
        .flush_queue
        .iter()
        .next()
        .is_some_and(|(deadline, _)| *deadline <= now)
}

fn next_deadline(state: &CoreState) -> Option<Instant> {
    state.flush_queue.iter().next().map(|(deadline, _)| *deadline)
}

fn pool_sector(shared: &Arc<Shared>, pb: PBlock, request_sector: u64) -> u64 {
    shared.block_size.block_to_sector(pb) + (request_sector & shared.block_size.offset_mask())
}

fn complete(shared: &Arc<Shared>, pending: Pending, outcome: RequestResult) {
    let outcome = match outcome {
        Ok(ok) if pending.req.flush => shared.md.commit().map(|()| ok),
        other => other,
    };
    let _ = pending.done.send(outcome);
}

fn raise_error_event(shared: &Arc<Shared>, context: &str) {
    if !shared.error_event.swap(true, Ordering::AcqRel) {
        error!(target: "hcache::core", event = "error_event", context);
    }
}

/// Commit metadata; a failure flips the sticky error event.
fn commit_metadata(shared: &Arc<Shared>) -> Result<()> {
    let result = shared.md.commit();
    if result.is_err() {
        raise_error_event(shared, "metadata commit");
    }
    result
}

fn drop_if_quiescent(shared: &Arc<Shared>, state: &mut CoreState, ob: OBlock) {
    let quiescent = state
        .blocks
        .get(&ob)
        .is_some_and(|block| block.refs == 0 && block.pending.is_empty() && !block.active);
    if quiescent {
        let _ = state.blocks.remove(&ob);
        if state.blocks.is_empty() {
            shared.drained.notify_all();
        }
    }
}

/// Arm the deferred-writeback timer for `ob`. The flush queue holds one
/// reference per armed block.
fn arm_flush(shared: &Arc<Shared>, state: &mut CoreState, ob: OBlock) {
    let deadline = Instant::now() + shared.writeback_delay;
    let Some(block) = state.blocks.get_mut(&ob) else {
        return;
    };
    if block.deadline.is_some() {
        return;
    }
    block.refs += 1;
    block.deadline = Some(deadline);
    state.flush_queue.insert((deadline, ob));
}

/// First worker pass after (re)start: feed persisted mappings to the policy
/// and put leftover dirty blocks back on the writeback queue.
fn startup_scan(shared: &Arc<Shared>) {
    let mut loaded = 0_u64;
    let mut dirty = Vec::new();
    let result = shared.md.walk_mappings(shared.dev, &mut |ob, pb, flags| {
        let mut policy = shared.policy.lock();
        policy.load_mapping(ob, CBlock(pb.0), None)?;
        if flags & BLOCK_DIRTY != 0 {
            policy.set_dirty(CBlock(pb.0));
            dirty.push((ob, pb, flags));
        }
        loaded += 1;
        Ok(())
    });
    if let Err(err) = result {
        error!(
            target: "hcache::core",
            event = "startup_scan_failed",
            error = %err
        );
        raise_error_event(shared, "startup scan");
        return;
    }

    let mut state = shared.state.lock();
    let nr_dirty = dirty.len() as u64;
    for (ob, pb, flags) in dirty {
        let block = state
            .blocks
            .entry(ob)
            .or_insert_with(|| BlockState::new(pb, CBlock(pb.0)));
        block.uptodate = flags & BLOCK_UPTODATE != 0;
        block.dirty = true;
        arm_flush(shared, &mut state, ob);
    }
    state.dirty_blocks += nr_dirty;
    info!(
        target: "hcache::core",
        event = "startup_scan",
        mappings = loaded,
        leftover_dirty = nr_dirty
    );
}

/// Ingest a batch of requests: consult the policy, take or create mappings,
/// then start copies or complete directly.
fn do_bios(shared: &Arc<Shared>, batch: Vec<Pending>) {
    if batch.is_empty() {
        return;
    }
    shared.policy.lock().tick();

    // 1/3: attach each request to a block object, creating mappings.
    for pending in batch {
        let ob = shared.block_size.sector_to_block(pending.req.sector);

        // A block mid-eviction cannot take new work; the mapping is about
        // to disappear.
        let evicting = {
            let state = shared.state.lock();
            state.blocks.get(&ob).is_some_and(|block| block.evicting)
        };
        if evicting {
            let _ = pending.done.send(Ok(RequestOutcome::Requeue));
            continue;
        }

        let io = IoDesc {
            sector: pending.req.sector,
            nr_sectors: pending.req.nr_sectors,
            is_write: pending.req.is_write,
        };
        let decision = shared.policy.lock().map(ob, true, false, &io);
        match decision {
            Err(HcError::WouldBlock) | Ok(PolicyResult::Miss) => {
                complete(
                    shared,
                    pending,
                    Ok(RequestOutcome::Remapped(Remap::Origin {
                        sector: io.sector,
                    })),
                );
            }
            Err(err) => {
                warn!(target: "hcache::core", event = "policy_map_failed", error = %err);
                complete(shared, pending, Err(err));
            }
            Ok(PolicyResult::Hit { cblock }) => match shared.md.lookup(shared.dev, ob, true) {
                Ok((pb, flags)) => attach(shared, ob, pb, cblock, flags, pending),
                Err(HcError::NotFound(_)) => insert_new(shared, ob, cblock, pending),
                Err(err) => {
                    raise_error_event(shared, "mapping lookup");
                    complete(shared, pending, Err(err));
                }
            },
            Ok(PolicyResult::New { cblock }) => insert_new(shared, ob, cblock, pending),
            Ok(PolicyResult::Replace { cblock, old_oblock }) => {
                evict_old(shared, old_oblock);
                insert_new(shared, ob, cblock, pending);
            }
        }
    }

    // 2/3: blocks fully covered by queued writes skip the origin read;
    // everything else not yet up to date needs a promote copy.
    let mut to_promote = Vec::new();
    {
        let mut state = shared.state.lock();
        let block_sectors = shared.block_size.sectors();
        let obs: Vec<OBlock> = state.blocks.keys().copied().collect();
        for ob in obs {
            let (newly_dirty, flags, cblock) = {
                let Some(block) = state.blocks.get_mut(&ob) else {
                    continue;
                };
                if block.uptodate || block.active || block.pending.is_empty() {
                    continue;
                }
                let write_sectors: u64 = block
                    .pending
                    .iter()
                    .filter(|p| p.req.is_write)
                    .map(|p| p.req.nr_sectors)
                    .sum();
                if write_sectors != block_sectors {
                    to_promote.push(ob);
                    continue;
                }
                block.uptodate = true;
                let newly_dirty = !block.dirty;
                block.dirty = true;
                (newly_dirty, block.persistent_flags(), block.policy_cblock)
            };
            if newly_dirty {
                state.dirty_blocks += 1;
                arm_flush(shared, &mut state, ob);
                shared.policy.lock().set_dirty(cblock);
            }
            if let Err(err) = shared.md.update(shared.dev, ob, flags) {
                warn!(target: "hcache::core", event = "flag_update_failed", error = %err);
                raise_error_event(shared, "flag update");
                if let Some(block) = state.blocks.get_mut(&ob) {
                    block.error = true;
                }
            }
        }
    }
    for ob in to_promote {
        start_copy(shared, ob, CopyKind::Promote);
    }

    let _ = commit_metadata(shared);

    // 3/3: complete whatever is servable now.
    release_ready(shared);
    let _ = commit_metadata(shared);
}

fn insert_new(shared: &Arc<Shared>, ob: OBlock, cblock: CBlock, pending: Pending) {
    match shared.md.insert(shared.dev, ob) {
        Ok((pb, flags)) => attach(shared, ob, pb, cblock, flags, pending),
        Err(HcError::NoDataSpace) => {
            // Park until reclamation or a resize; the policy must forget the
            // admission it just granted.
            shared.policy.lock().remove_mapping(ob);
            shared.no_space_flag.store(true, Ordering::Release);
            debug!(target: "hcache::core", event = "request_parked", oblock = ob.0);
            let mut state = shared.state.lock();
            state.no_space.push_back(pending);
        }
        Err(err) => {
            shared.policy.lock().remove_mapping(ob);
            raise_error_event(shared, "mapping insert");
            complete(shared, pending, Err(err));
        }
    }
}

fn attach(
    shared: &Arc<Shared>,
    ob: OBlock,
    pb: PBlock,
    cblock: CBlock,
    flags: u8,
    pending: Pending,
) {
    let mut state = shared.state.lock();
    let block = state
        .blocks
        .entry(ob)
        .or_insert_with(|| BlockState::new(pb, cblock));
    if block.refs == 0 && block.pending.is_empty() {
        // Fresh object: seed state from the persistent flags.
        block.pool_block = pb;
        block.policy_cblock = cblock;
        block.uptodate = flags & BLOCK_UPTODATE != 0;
        block.dirty |= flags & BLOCK_DIRTY != 0;
    }
    block.refs += 1;
    block.pending.push_back(pending);
}

/// Drop the old mapping behind a `Replace` decision: clean blocks go at
/// once, dirty blocks after one final writeback.
fn evict_old(shared: &Arc<Shared>, old_ob: OBlock) {
    let (pb, flags) = match shared.md.lookup(shared.dev, old_ob, true) {
        Ok(found) => found,
        Err(HcError::NotFound(_)) => return,
        Err(err) => {
            warn!(target: "hcache::core", event = "evict_lookup_failed", error = %err);
            raise_error_event(shared, "evict lookup");
            return;
        }
    };

    if flags & BLOCK_DIRTY != 0 {
        {
            let mut state = shared.state.lock();
            let block = state
                .blocks
                .entry(old_ob)
                .or_insert_with(|| BlockState::new(pb, CBlock(pb.0)));
            block.uptodate = true;
            block.dirty = true;
            block.evicting = true;
        }
        start_copy(shared, old_ob, CopyKind::Writeback);
    } else {
        if let Err(err) = shared.md.remove(shared.dev, old_ob) {
            warn!(target: "hcache::core", event = "evict_remove_failed", error = %err);
            raise_error_event(shared, "evict remove");
            return;
        }
        trace!(target: "hcache::core", event = "evicted_clean", oblock = old_ob.0);
        unpark_no_space(shared);
    }
}

/// Begin a copy for `ob`; no further copy may start while one is active.
fn start_copy(shared: &Arc<Shared>, ob: OBlock, kind: CopyKind) {
    let pb = {
        let mut state = shared.state.lock();
        let Some(block) = state.blocks.get_mut(&ob) else {
            return;
        };
        if block.active {
            return;
        }
        block.active = true;
        block.refs += 1;
        let pb = block.pool_block;
        state.inflight_copies += 1;
        pb
    };

    let block_sectors = shared.block_size.sectors();
    let origin = CopyRegion {
        side: CopySide::Origin,
        sector: ob.0 * block_sectors,
        nr_sectors: block_sectors,
    };
    let pool = CopyRegion {
        side: CopySide::Pool,
        sector: shared.block_size.block_to_sector(pb),
        nr_sectors: block_sectors,
    };
    let (from, to) = match kind {
        CopyKind::Promote => (origin, pool),
        CopyKind::Writeback => (pool, origin),
    };

    let cb_shared = Arc::clone(shared);
    shared.copier.copy(
        from,
        to,
        Box::new(move |result| {
            let mut state = cb_shared.state.lock();
            state.endios.push_back(Endio { ob, kind, result });
            drop(state);
            cb_shared.wake.notify_all();
        }),
    );
}

/// Handle copy completions: metadata first, in one transaction, then release
/// the waiters.
fn do_endios(shared: &Arc<Shared>) {
    let events: Vec<Endio> = {
        let mut state = shared.state.lock();
        state.endios.drain(..).collect()
    };
    if events.is_empty() {
        return;
    }

    let mut meta_err = false;

    // First round: every mandatory metadata update, before any dependent
    // completion may be submitted.
    for event in &events {
        let updated = {
            let mut state = shared.state.lock();
            state.inflight_copies = state.inflight_copies.saturating_sub(1);
            let Some(block) = state.blocks.get_mut(&event.ob) else {
                continue;
            };
            block.active = false;

            if event.result.is_err() {
                block.error = true;
                None
            } else {
                let mut cleared_dirty = false;
                match event.kind {
                    CopyKind::Promote => {
                        block.uptodate = true;
                    }
                    CopyKind::Writeback => {
                        if block.force_dirty {
                            // Written to again mid-writeback; go around once
                            // more.
                            block.force_dirty = false;
                        } else if block.dirty {
                            block.dirty = false;
                            cleared_dirty = true;
                        }
                    }
                }
                let flags = block.persistent_flags();
                let cblock = block.policy_cblock;
                if cleared_dirty {
                    state.dirty_blocks = state.dirty_blocks.saturating_sub(1);
                }
                Some((flags, cblock, cleared_dirty))
            }
        };

        match updated {
            None => raise_error_event(shared, "copy"),
            Some((flags, cblock, cleared_dirty)) => {
                if cleared_dirty {
                    shared.policy.lock().clear_dirty(cblock);
                }
                if let Err(err) = shared.md.update(shared.dev, event.ob, flags) {
                    warn!(
                        target: "hcache::core",
                        event = "endio_update_failed",
                        error = %err
                    );
                    meta_err = true;
                }
            }
        }
    }

    if meta_err {
        raise_error_event(shared, "endio metadata");
    } else {
        meta_err = commit_metadata(shared).is_err();
    }

    // Second round: evictions, timer re-arming, and waiter release, after
    // the commit.
    for event in &events {
        let mut evict_now = false;
        {
            let mut state = shared.state.lock();
            let Some(block) = state.blocks.get_mut(&event.ob) else {
                continue;
            };
            block.refs = block.refs.saturating_sub(1);
            if block.evicting && !block.dirty && !block.error && !meta_err {
                block.evicting = false;
                evict_now = true;
            }
            let rearm = block.dirty && block.deadline.is_none() && !block.evicting;
            if rearm {
                arm_flush(shared, &mut state, event.ob);
            }
        }
        if evict_now {
            // Requests that raced with the eviction go back to the origin;
            // the block's content has just been written there.
            let stranded: Vec<Pending> = {
                let mut state = shared.state.lock();
                match state.blocks.get_mut(&event.ob) {
                    Some(block) => {
                        let drained: Vec<Pending> = block.pending.drain(..).collect();
                        block.refs = block.refs.saturating_sub(drained.len() as u32);
                        drained
                    }
                    None => Vec::new(),
                }
            };
            match shared.md.remove(shared.dev, event.ob) {
                Ok(()) => {
                    trace!(
                        target: "hcache::core",
                        event = "evicted_after_writeback",
                        oblock = event.ob.0
                    );
                    for pending in stranded {
                        let sector = pending.req.sector;
                        complete(
                            shared,
                            pending,
                            Ok(RequestOutcome::Remapped(Remap::Origin { sector })),
                        );
                    }
                    unpark_no_space(shared);
                }
                Err(err) => {
                    warn!(target: "hcache::core", event = "evict_remove_failed", error = %err);
                    raise_error_event(shared, "evict remove");
                    for pending in stranded {
                        let _ = pending.done.send(Ok(RequestOutcome::Requeue));
                    }
                }
            }
        }
    }

    release_ready(shared);
    if meta_err {
        fail_all_pending(shared);
    }
    let _ = commit_metadata(shared);

    let mut state = shared.state.lock();
    for event in &events {
        drop_if_quiescent(shared, &mut state, event.ob);
    }
}

/// Complete every request whose block is up to date, handling write dirty
/// marking on the way.
fn release_ready(shared: &Arc<Shared>) {
    let mut completions: Vec<(Pending, RequestResult)> = Vec::new();
    let mut dirty_marks: Vec<(OBlock, u8, CBlock)> = Vec::new();
    let mut quiesce: Vec<OBlock> = Vec::new();
    {
        let mut state = shared.state.lock();
        let obs: Vec<OBlock> = state.blocks.keys().copied().collect();
        for ob in obs {
            let newly_dirty = {
                let Some(block) = state.blocks.get_mut(&ob) else {
                    continue;
                };
                if block.pending.is_empty() {
                    continue;
                }
                if block.error {
                    let failed: Vec<Pending> = block.pending.drain(..).collect();
                    block.refs = block.refs.saturating_sub(failed.len() as u32);
                    for pending in failed {
                        completions.push((
                            pending,
                            Err(HcError::Io(std::io::Error::other("cache copy failed"))),
                        ));
                    }
                    quiesce.push(ob);
                    continue;
                }
                if !block.uptodate || block.evicting {
                    // Evicting blocks release their waiters once the final
                    // writeback lands and the mapping is gone.
                    continue;
                }

                let drained: Vec<Pending> = block.pending.drain(..).collect();
                block.refs = block.refs.saturating_sub(drained.len() as u32);
                let mut newly_dirty = false;
                for pending in drained {
                    if pending.req.is_write {
                        if block.dirty && !newly_dirty {
                            if block.active || block.deadline.is_none() {
                                // A writeback is under way (or already
                                // finished its scan); force a second pass.
                                block.force_dirty = true;
                            }
                        } else {
                            block.dirty = true;
                            newly_dirty = true;
                        }
                    }
                    let sector = pool_sector(shared, block.pool_block, pending.req.sector);
                    completions
                        .push((pending, Ok(RequestOutcome::Remapped(Remap::Pool { sector }))));
                }
                newly_dirty
            };
            if newly_dirty {
                state.dirty_blocks += 1;
                arm_flush(shared, &mut state, ob);
                let block = state.blocks.get(&ob).expect("armed above");
                dirty_marks.push((ob, block.persistent_flags(), block.policy_cblock));
            } else {
                quiesce.push(ob);
            }
        }
        for ob in quiesce {
            drop_if_quiescent(shared, &mut state, ob);
        }
    }

    for (ob, flags, cblock) in dirty_marks {
        shared.policy.lock().set_dirty(cblock);
        if let Err(err) = shared.md.update(shared.dev, ob, flags) {
            warn!(target: "hcache::core", event = "dirty_update_failed", error = %err);
            raise_error_event(shared, "dirty update");
        }
    }
    for (pending, outcome) in completions {
        complete(shared, pending, outcome);
    }
}

fn fail_all_pending(shared: &Arc<Shared>) {
    let failed: Vec<Pending> = {
        let mut state = shared.state.lock();
        let mut failed = Vec::new();
        let obs: Vec<OBlock> = state.blocks.keys().copied().collect();
        for ob in obs {
            let block = state.blocks.get_mut(&ob).expect("iterating live keys");
            let drained: Vec<Pending> = block.pending.drain(..).collect();
            block.refs = block.refs.saturating_sub(drained.len() as u32);
            failed.extend(drained);
        }
        failed
    };
    for pending in failed {
        complete(shared, pending, Err(HcError::ConsistencyFailed));
    }
}

/// Start writebacks for dirty blocks whose deadline passed, plus whatever
/// the policy wants cleaned, bounded by the copy throttle.
fn do_block_flushes(shared: &Arc<Shared>) {
    let now = Instant::now();
    let mut to_write = Vec::new();
    {
        let mut state = shared.state.lock();
        while state.inflight_copies + to_write.len() as u32 <= PARALLEL_COPIES / 2 {
            let Some(&(deadline, ob)) = state.flush_queue.iter().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            let _ = state.flush_queue.remove(&(deadline, ob));
            let Some(block) = state.blocks.get_mut(&ob) else {
                continue;
            };
            block.deadline = None;
            block.refs = block.refs.saturating_sub(1);
            if block.dirty && !block.active {
                to_write.push(ob);
            } else {
                drop_if_quiescent(shared, &mut state, ob);
            }
        }
    }
    for ob in to_write {
        start_copy(shared, ob, CopyKind::Writeback);
    }

    // Writeback-capable policies can volunteer more work.
    loop {
        {
            let state = shared.state.lock();
            if state.inflight_copies >= PARALLEL_COPIES / 2 {
                return;
            }
        }
        let work = shared.policy.lock().writeback_work();
        let Some((ob, _cblock)) = work else {
            return;
        };
        let (pb, flags) = match shared.md.lookup(shared.dev, ob, true) {
            Ok(found) => found,
            Err(_) => continue,
        };
        if flags & BLOCK_DIRTY == 0 {
            continue;
        }
        {
            let mut state = shared.state.lock();
            let block = state
                .blocks
                .entry(ob)
                .or_insert_with(|| BlockState::new(pb, CBlock(pb.0)));
            block.uptodate = true;
            block.dirty = true;
        }
        start_copy(shared, ob, CopyKind::Writeback);
    }
}

fn xorshift(seed: &mut u64) -> u64 {
    let mut x = *seed;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *seed = x;
    x
}

/// Under pool pressure, drop one quiescent mapping (pseudo-random start
/// point) and retry the parked requests.
fn do_block_free(shared: &Arc<Shared>) {
    if !shared.no_space_flag.load(Ordering::Acquire) {
        return;
    }
    let total = shared.md.get_data_dev_size(shared.dev);
    if total == 0 {
        return;
    }
    let start = {
        let mut state = shared.state.lock();
        xorshift(&mut state.reclaim_seed) % total
    };

    for i in 0..total {
        let pb = PBlock((start + i) % total);
        let ob = match shared.md.lookup_reverse(shared.dev, pb, false) {
            Ok(ob) => ob,
            Err(_) => continue,
        };
        let quiescent = {
            let state = shared.state.lock();
            !state.blocks.contains_key(&ob)
        };
        if !quiescent {
            continue;
        }
        match shared.md.remove(shared.dev, ob) {
            Ok(()) => {
                shared.policy.lock().remove_mapping(ob);
                let _ = commit_metadata(shared);
                info!(
                    target: "hcache::core",
                    event = "reclaimed_block",
                    oblock = ob.0,
                    pool_block = pb.0
                );
                unpark_no_space(shared);
                return;
            }
            Err(err) => {
                warn!(target: "hcache::core", event = "reclaim_failed", error = %err);
                return;
            }
        }
    }
}

/// Re-admit parked requests after space was freed.
fn unpark_no_space(shared: &Arc<Shared>) {
    if !shared.no_space_flag.swap(false, Ordering::AcqRel) {
        return;
    }
    let mut state = shared.state.lock();
    let parked: Vec<Pending> = state.no_space.drain(..).collect();
    for pending in parked {
        state.incoming.push_back(pending);
    }
    drop(state);
    shared.wake.notify_all();
}
