//! Multiqueue policy: two 16-level queues with periodic demotion.
//!
//! New origin blocks are observed in a pre-cache queue; once a block's hit
//! count crosses the promotion threshold (and the request stream looks
//! random) it is promoted into the cache queue, evicting the oldest entry of
//! the lowest level when the cache is full. Sequential streams bypass the
//! cache entirely. Every `demote_period` hits all levels shift down one, so
//! stale popularity decays.

use crate::util::{next_power, Bitset, Link, List, OpenTable};
use crate::{IoDesc, Policy, PolicyResult, POLICY_VERSION_SIZE};
use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};
use tracing::{debug, trace};

const NR_MQ_LEVELS: usize = 16;
const PROMOTE_THRESHOLD: u32 = 128;
/// Random samples needed to flip a sequential stream back to random.
const RANDOM_THRESHOLD: u32 = 4;
const DEFAULT_SEQ_IO_THRESHOLD: u32 = 16;
const HINT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    oblock: OBlock,
    cblock: CBlock,
    in_cache: bool,
    hit_count: u32,
    tick: u32,
    /// Queue level the entry currently sits on; periodic demotion moves
    /// entries without touching their hit counts.
    level: u8,
}

struct Multiqueue {
    levels: [List; NR_MQ_LEVELS],
}

impl Multiqueue {
    fn new() -> Self {
        Self {
            levels: [List::new(); NR_MQ_LEVELS],
        }
    }

    fn level_of(hit_count: u32) -> usize {
        (31 - hit_count.max(1).leading_zeros() as usize).min(NR_MQ_LEVELS - 1)
    }

    fn push(&mut self, links: &mut [Link], idx: u32, level: usize) {
        self.levels[level].push_tail(links, idx);
    }

    fn remove(&mut self, links: &mut [Link], idx: u32, level: usize) {
        self.levels[level].remove(links, idx);
    }

    /// Oldest entry of the lowest populated level.
    fn pop(&mut self, links: &mut [Link]) -> Option<u32> {
        self.levels
            .iter_mut()
            .find(|level| !level.is_empty())
            .and_then(|level| level.pop_head(links))
    }

    fn len(&self) -> usize {
        self.levels.iter().map(List::len).sum()
    }

    fn iter<'a>(&'a self, links: &'a [Link]) -> impl Iterator<Item = u32> + 'a {
        self.levels.iter().flat_map(move |level| level.iter(links))
    }
}

/// The queue an entry currently lives on is derived from its `in_cache`
/// flag and recorded level, so queue membership never needs a link back.
pub struct MqPolicy {
    cache_size: u64,
    tick_count: u32,
    hits: u32,
    demote_period_mask: u32,

    pre_cache: Multiqueue,
    cache: Multiqueue,

    entries: Vec<Entry>,
    links: Vec<Link>,
    free: Vec<u32>,
    table: OpenTable,

    allocation: Bitset,

    // Request stream classification.
    seq_stream: bool,
    nr_seq_samples: u32,
    nr_rand_samples: u32,
    last_end_sector: u64,
    seq_io_threshold: u32,

    last_lookup: Option<OBlock>,
}

impl MqPolicy {
    pub fn new(cache_size: u64) -> Result<Self> {
        if cache_size == 0 {
            return Err(HcError::InvalidArgument(
                "cache_size must be > 0".to_owned(),
            ));
        }
        let nr_entries = usize::try_from(3 * cache_size)
            .map_err(|_| HcError::InvalidArgument("cache_size too large".to_owned()))?;
        #[allow(clippy::cast_possible_truncation)] // masked to u32 by next_power bound
        let demote_period_mask = (next_power(cache_size, 1024) - 1) as u32;
        Ok(Self {
            cache_size,
            tick_count: 0,
            hits: 0,
            demote_period_mask,
            pre_cache: Multiqueue::new(),
            cache: Multiqueue::new(),
            entries: vec![
                Entry {
                    oblock: OBlock(0),
                    cblock: CBlock(0),
                    in_cache: false,
                    hit_count: 1,
                    tick: 0,
                    level: 0,
                };
                nr_entries
            ],
            links: vec![Link::default(); nr_entries],
            free: (0..nr_entries as u32).rev().collect(),
            table: OpenTable::with_capacity(3 * cache_size),
            allocation: Bitset::new(cache_size),
            seq_stream: false,
            nr_seq_samples: 0,
            nr_rand_samples: 0,
            last_end_sector: 0,
            seq_io_threshold: DEFAULT_SEQ_IO_THRESHOLD,
            last_lookup: None,
        })
    }

    fn random_stream(&self) -> bool {
        !self.seq_stream
    }

    fn update_io_stream(&mut self, io: &IoDesc) {
        if io.sector == self.last_end_sector + 1 {
            self.nr_seq_samples += 1;
        } else {
            // One non-sequential request resets the sequential run.
            if self.nr_seq_samples > 0 {
                self.nr_seq_samples = 0;
                self.nr_rand_samples = 0;
            }
            self.nr_rand_samples += 1;
        }
        self.last_end_sector = io.sector + io.nr_sectors.max(1) - 1;

        if self.seq_stream && self.nr_rand_samples >= RANDOM_THRESHOLD {
            self.seq_stream = false;
            debug!(
                target: "hcache::policy::mq",
                event = "stream_random",
                nr_rand = self.nr_rand_samples,
                nr_seq = self.nr_seq_samples
            );
            self.nr_seq_samples = 0;
            self.nr_rand_samples = 0;
        } else if !self.seq_stream
            && self.seq_io_threshold > 0
            && self.nr_seq_samples >= self.seq_io_threshold
        {
            self.seq_stream = true;
            debug!(
                target: "hcache::policy::mq",
                event = "stream_sequential",
                nr_rand = self.nr_rand_samples,
                nr_seq = self.nr_seq_samples
            );
            self.nr_seq_samples = 0;
            self.nr_rand_samples = 0;
        }
    }

    fn alloc_entry(&mut self) -> Option<u32> {
        let idx = self.free.pop()?;
        self.entries[idx as usize].tick = self.tick_count;
        Some(idx)
    }

    /// Queue and hash an entry according to its flags, at the level its hit
    /// count earns.
    fn push(&mut self, idx: u32) {
        let level = Multiqueue::level_of(self.entries[idx as usize].hit_count);
        #[allow(clippy::cast_possible_truncation)] // level < 16
        {
            self.entries[idx as usize].level = level as u8;
        }
        self.entries[idx as usize].tick = self.tick_count;
        let entry = self.entries[idx as usize];
        self.table.insert(entry.oblock.0, idx);
        if entry.in_cache {
            self.allocation.set(entry.cblock.0);
            self.cache.push(&mut self.links, idx, level);
        } else {
            self.pre_cache.push(&mut self.links, idx, level);
        }
    }

    fn del(&mut self, idx: u32) {
        let entry = self.entries[idx as usize];
        if entry.in_cache {
            self.cache
                .remove(&mut self.links, idx, entry.level as usize);
            self.allocation.clear(entry.cblock.0);
        } else {
            self.pre_cache
                .remove(&mut self.links, idx, entry.level as usize);
        }
        let _ = self.table.remove(entry.oblock.0);
        if self.last_lookup == Some(entry.oblock) {
            self.last_lookup = None;
        }
    }

    /// Shift every level of both queues down by one, recording the new level
    /// on each moved entry.
    fn demote_all(&mut self) {
        for cache_area in [false, true] {
            for level in 1..NR_MQ_LEVELS {
                let moved: Vec<u32> = {
                    let queue = if cache_area { &self.cache } else { &self.pre_cache };
                    queue.levels[level].iter(&self.links).collect()
                };
                for idx in &moved {
                    self.entries[*idx as usize].level -= 1;
                }
                let queue = if cache_area {
                    &mut self.cache
                } else {
                    &mut self.pre_cache
                };
                let (lower, upper) = queue.levels.split_at_mut(level);
                lower[level - 1].splice_tail(&mut self.links, &mut upper[0]);
            }
        }
    }

    fn updated_this_tick(&self, idx: u32) -> bool {
        self.entries[idx as usize].tick == self.tick_count
    }

    /// Count a hit: requeue at the (possibly higher) level and run the
    /// periodic demotion.
    fn hit(&mut self, idx: u32) {
        if self.updated_this_tick(idx) {
            return;
        }
        self.del(idx);
        self.entries[idx as usize].hit_count += 1;
        self.push(idx);

        self.hits = self.hits.wrapping_add(1);
        if self.hits & self.demote_period_mask == 0 {
            trace!(target: "hcache::policy::mq", event = "demote_period");
            self.demote_all();
            self.hits = 0;
        }
    }

    /// Evict the coldest cache entry; it lives on in the pre-cache until it
    /// ages out.
    fn demote_cblock(&mut self) -> Option<(CBlock, OBlock)> {
        let idx = self.cache.pop(&mut self.links)?;
        let entry = self.entries[idx as usize];
        self.allocation.clear(entry.cblock.0);
        let _ = self.table.remove(entry.oblock.0);
        self.entries[idx as usize].in_cache = false;
        self.push(idx);
        Some((entry.cblock, entry.oblock))
    }

    fn should_promote(&self, idx: u32, can_migrate: bool, cheap_copy: bool) -> bool {
        if !can_migrate || !self.random_stream() {
            return false;
        }
        let possible_migration = self.entries[idx as usize].hit_count >= PROMOTE_THRESHOLD;
        let possible_new = cheap_copy && self.allocation.any_clear();
        possible_new || possible_migration
    }

    fn map_found(
        &mut self,
        idx: u32,
        can_migrate: bool,
        cheap_copy: bool,
    ) -> PolicyResult {
        let updated = self.updated_this_tick(idx);
        self.hit(idx);

        let entry = self.entries[idx as usize];
        if entry.in_cache {
            return PolicyResult::Hit {
                cblock: entry.cblock,
            };
        }
        if updated || !self.should_promote(idx, can_migrate, cheap_copy) {
            return PolicyResult::Miss;
        }

        let (result, cblock) = match self.allocation.find_clear() {
            Some(free) => (PolicyResult::New { cblock: CBlock(free) }, CBlock(free)),
            None => {
                let Some((cblock, old_oblock)) = self.demote_cblock() else {
                    return PolicyResult::Miss;
                };
                (
                    PolicyResult::Replace {
                        cblock,
                        old_oblock,
                    },
                    cblock,
                )
            }
        };

        self.del(idx);
        self.entries[idx as usize].in_cache = true;
        self.entries[idx as usize].cblock = cblock;
        self.push(idx);
        result
    }

    /// A first observation goes into the pre-cache, recycling the coldest
    /// pre-cache entry when the arena is exhausted.
    fn to_pre_cache(&mut self, oblock: OBlock) -> PolicyResult {
        let idx = match self.alloc_entry() {
            Some(idx) => idx,
            None => match self.pre_cache.pop(&mut self.links) {
                Some(idx) => {
                    let old = self.entries[idx as usize].oblock;
                    let _ = self.table.remove(old.0);
                    idx
                }
                None => return PolicyResult::Miss,
            },
        };
        self.entries[idx as usize] = Entry {
            oblock,
            cblock: CBlock(0),
            in_cache: false,
            hit_count: 1,
            tick: self.tick_count,
            level: 0,
        };
        self.push(idx);
        PolicyResult::Miss
    }

    /// A discarded origin block with a free cache slot is admitted at once.
    fn straight_to_cache(&mut self, oblock: OBlock) -> PolicyResult {
        let Some(idx) = self.alloc_entry() else {
            return PolicyResult::Miss;
        };
        let Some(free) = self.allocation.find_clear() else {
            self.free.push(idx);
            return PolicyResult::Miss;
        };
        self.entries[idx as usize] = Entry {
            oblock,
            cblock: CBlock(free),
            in_cache: true,
            hit_count: 1,
            tick: self.tick_count,
            level: 0,
        };
        self.push(idx);
        PolicyResult::New {
            cblock: CBlock(free),
        }
    }
}

impl Policy for MqPolicy {
    fn name(&self) -> &str {
        "mq"
    }

    fn version(&self) -> [u32; POLICY_VERSION_SIZE] {
        [1, 0, 0]
    }

    fn hint_size(&self) -> usize {
        HINT_SIZE
    }

    fn map(
        &mut self,
        oblock: OBlock,
        can_migrate: bool,
        discarded: bool,
        io: &IoDesc,
    ) -> Result<PolicyResult> {
        self.update_io_stream(io);

        let result = if let Some(idx) = self.table.get(oblock.0) {
            self.map_found(idx, can_migrate, discarded)
        } else if !self.random_stream() {
            // Sequential streams bypass the cache.
            PolicyResult::Miss
        } else if can_migrate && discarded && self.allocation.any_clear() {
            self.straight_to_cache(oblock)
        } else {
            self.to_pre_cache(oblock)
        };
        self.last_lookup = Some(oblock);
        Ok(result)
    }

    fn load_mapping(
        &mut self,
        oblock: OBlock,
        cblock: CBlock,
        hint: Option<&[u8]>,
    ) -> Result<()> {
        let hit_count = match hint {
            Some(bytes) if bytes.len() == HINT_SIZE => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).max(1)
            }
            _ => 1,
        };
        let idx = self
            .alloc_entry()
            .ok_or(HcError::OutOfMemory("mq entry arena"))?;
        self.entries[idx as usize] = Entry {
            oblock,
            cblock,
            in_cache: true,
            hit_count,
            tick: self.tick_count,
            level: 0,
        };
        self.push(idx);
        Ok(())
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for idx in self.cache.iter(&self.links) {
            let entry = self.entries[idx as usize];
            visit(entry.oblock, entry.cblock, &entry.hit_count.to_le_bytes())?;
        }
        Ok(())
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        let Some(idx) = self.table.get(oblock.0) else {
            return;
        };
        self.del(idx);
        self.entries[idx as usize].in_cache = false;
        self.push(idx);
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        let Some(idx) = self.table.get(current_oblock.0) else {
            return;
        };
        self.del(idx);
        self.entries[idx as usize].oblock = new_oblock;
        self.push(idx);
    }

    fn residency(&self) -> u64 {
        self.allocation.count()
    }

    fn tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
    }

    fn status(&self) -> String {
        format!(
            "{} {} {}",
            self.allocation.count(),
            self.pre_cache.len() + self.cache.len(),
            u8::from(self.seq_stream)
        )
    }

    fn message(&mut self, msg: &str) -> Result<()> {
        let mut parts = msg.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("sequential_threshold"), Some(value), None) => {
                self.seq_io_threshold = value.parse().map_err(|_| {
                    HcError::InvalidArgument(format!("bad sequential_threshold {value:?}"))
                })?;
                Ok(())
            }
            _ => Err(HcError::InvalidArgument(format!(
                "mq: unknown message {msg:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_io(ob: OBlock) -> IoDesc {
        IoDesc {
            // Scatter sectors so the stream never looks sequential.
            sector: ob.0 * 1024,
            nr_sectors: 8,
            is_write: true,
        }
    }

    /// Drive `oblock` hot enough to cross the promotion threshold,
    /// advancing the tick so each map call counts.
    fn heat(policy: &mut MqPolicy, ob: OBlock, times: u32) -> PolicyResult {
        let mut last = PolicyResult::Miss;
        for _ in 0..times {
            policy.tick();
            last = policy.map(ob, true, false, &random_io(ob)).unwrap();
        }
        last
    }

    #[test]
    fn test_promotion_after_threshold() {
        let mut policy = MqPolicy::new(4).unwrap();
        // Call 1 is the first observation; the hit count reaches the
        // promotion threshold exactly on call PROMOTE_THRESHOLD.
        let result = heat(&mut policy, OBlock(7), PROMOTE_THRESHOLD);
        assert!(matches!(result, PolicyResult::New { .. }));
        assert_eq!(policy.residency(), 1);

        // Once admitted, further requests hit.
        policy.tick();
        let result = policy.map(OBlock(7), true, false, &random_io(OBlock(7))).unwrap();
        assert!(matches!(result, PolicyResult::Hit { .. }));
    }

    #[test]
    fn test_replace_when_cache_full() {
        let mut policy = MqPolicy::new(2).unwrap();
        policy.load_mapping(OBlock(1), CBlock(0), None).unwrap();
        policy.load_mapping(OBlock(2), CBlock(1), None).unwrap();
        assert_eq!(policy.residency(), 2);

        let result = heat(&mut policy, OBlock(50), PROMOTE_THRESHOLD);
        match result {
            PolicyResult::Replace { old_oblock, .. } => {
                assert!(old_oblock == OBlock(1) || old_oblock == OBlock(2));
            }
            other => panic!("expected Replace, got {other:?}"),
        }
        assert_eq!(policy.residency(), 2);
    }

    #[test]
    fn test_sequential_stream_bypasses() {
        let mut policy = MqPolicy::new(64).unwrap();
        // 32 adjacent full-block writes flip the stream to sequential.
        for i in 0..32_u64 {
            policy.tick();
            let io = IoDesc {
                sector: i * 8,
                nr_sectors: 8,
                is_write: true,
            };
            let _ = policy.map(OBlock(i), true, false, &io).unwrap();
        }
        assert!(policy.seq_stream);

        // New blocks get MISS even when discarded and migratable.
        let io = IoDesc {
            sector: 32 * 8,
            nr_sectors: 8,
            is_write: true,
        };
        let result = policy.map(OBlock(32), true, true, &io).unwrap();
        assert_eq!(result, PolicyResult::Miss);
        assert_eq!(policy.residency(), 0);
    }

    #[test]
    fn test_random_io_resets_sequential_state() {
        let mut policy = MqPolicy::new(64).unwrap();
        for i in 0..32_u64 {
            let io = IoDesc {
                sector: i * 8,
                nr_sectors: 8,
                is_write: true,
            };
            let _ = policy.map(OBlock(i), true, false, &io).unwrap();
        }
        assert!(policy.seq_stream);
        for i in 0..RANDOM_THRESHOLD as u64 {
            let io = IoDesc {
                sector: 100_000 + i * 999,
                nr_sectors: 8,
                is_write: false,
            };
            let _ = policy.map(OBlock(900 + i), true, false, &io).unwrap();
        }
        assert!(!policy.seq_stream);
    }

    #[test]
    fn test_discarded_block_goes_straight_to_cache() {
        let mut policy = MqPolicy::new(4).unwrap();
        let ob = OBlock(3);
        policy.tick();
        let result = policy.map(ob, true, true, &random_io(ob)).unwrap();
        assert!(matches!(result, PolicyResult::New { .. }));
    }

    #[test]
    fn test_tick_dedupes_rapid_hits() {
        let mut policy = MqPolicy::new(4).unwrap();
        let ob = OBlock(9);
        policy.tick();
        // Many map calls within a single tick count as one observation.
        for _ in 0..(PROMOTE_THRESHOLD * 2) {
            let result = policy.map(ob, true, false, &random_io(ob)).unwrap();
            assert_eq!(result, PolicyResult::Miss);
        }
        assert_eq!(policy.residency(), 0);
    }

    #[test]
    fn test_demotion_ages_entries_out() {
        let mut policy = MqPolicy::new(2).unwrap();
        // A hot entry loads at level log2(200) = 7.
        policy
            .load_mapping(OBlock(1), CBlock(0), Some(&200_u32.to_le_bytes()))
            .unwrap();
        let hot_level = Multiqueue::level_of(200);
        assert!(!policy.cache.levels[hot_level].is_empty());

        // The demote period for tiny caches is 1024 hits; hammer unrelated
        // blocks long enough and every level shifts down.
        for i in 0..3000_u64 {
            policy.tick();
            let ob = OBlock(100 + (i % 50));
            let _ = policy.map(ob, true, false, &random_io(ob)).unwrap();
        }
        // Still resident (nothing evicted it), just colder.
        assert_eq!(policy.residency(), 1);
        assert!(policy.cache.levels[hot_level].is_empty());
    }
}
