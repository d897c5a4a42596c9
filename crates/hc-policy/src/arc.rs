//! ARC policy: adaptive replacement with ghost lists.
//!
//! Resident entries live on T1 (seen once recently) or T2 (seen at least
//! twice); evicted identifiers live on in the ghost lists B1/B2 without
//! their data. A hit in B1 says T1 was too small and grows the target `p`;
//! a hit in B2 shrinks it. Demotion picks T1 while it exceeds `p`, else T2.
//!
//! One-shot admissions are dampened by the "interesting blocks" filter: an
//! unknown origin block is only admitted once it has been observed twice
//! within a short window.

use crate::util::{Bitset, Link, List, OpenTable};
use crate::{IoDesc, Policy, PolicyResult, POLICY_VERSION_SIZE};
use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};
use tracing::trace;

const HINT_SIZE: usize = 4;
const BIG_PRIME: u64 = 4_294_967_291;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcState {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: ArcState,
    oblock: OBlock,
    cblock: CBlock,
}

/// Construction-time tunables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArcConfig {
    /// Size of the one-shot admission filter; defaults to `cache_size / 2`.
    pub interesting_size: Option<u64>,
}

pub struct ArcPolicy {
    cache_size: u64,
    /// Target size for T1; the balance between recency and frequency.
    p: u64,
    t1: List,
    t2: List,
    b1: List,
    b2: List,
    entries: Vec<Entry>,
    links: Vec<Link>,
    free: Vec<u32>,
    table: OpenTable,
    allocation: Bitset,
    interesting_blocks: Vec<u64>,
    last_lookup: Option<OBlock>,
}

impl ArcPolicy {
    pub fn new(cache_size: u64, config: ArcConfig) -> Result<Self> {
        if cache_size == 0 {
            return Err(HcError::InvalidArgument(
                "cache_size must be > 0".to_owned(),
            ));
        }
        let nr_entries = usize::try_from(2 * cache_size)
            .map_err(|_| HcError::InvalidArgument("cache_size too large".to_owned()))?;
        let interesting_size = config
            .interesting_size
            .unwrap_or(cache_size / 2)
            .max(1);
        Ok(Self {
            cache_size,
            p: 0,
            t1: List::new(),
            t2: List::new(),
            b1: List::new(),
            b2: List::new(),
            entries: vec![
                Entry {
                    state: ArcState::T1,
                    oblock: OBlock(0),
                    cblock: CBlock(0),
                };
                nr_entries
            ],
            links: vec![Link::default(); nr_entries],
            free: (0..nr_entries as u32).rev().collect(),
            table: OpenTable::with_capacity(2 * cache_size),
            allocation: Bitset::new(cache_size),
            interesting_blocks: vec![u64::MAX; interesting_size as usize],
            last_lookup: None,
        })
    }

    fn queue_mut(&mut self, state: ArcState) -> &mut List {
        match state {
            ArcState::T1 => &mut self.t1,
            ArcState::T2 => &mut self.t2,
            ArcState::B1 => &mut self.b1,
            ArcState::B2 => &mut self.b2,
        }
    }

    fn push(&mut self, state: ArcState, idx: u32) {
        self.entries[idx as usize].state = state;
        let entry = self.entries[idx as usize];
        if matches!(state, ArcState::T1 | ArcState::T2) {
            self.allocation.set(entry.cblock.0);
        }
        let mut links = std::mem::take(&mut self.links);
        self.queue_mut(state).push_tail(&mut links, idx);
        self.links = links;
        self.table.insert(entry.oblock.0, idx);
    }

    /// Detach `idx` from its queue and the hash; resident entries give their
    /// cache block back.
    fn del(&mut self, idx: u32) {
        let entry = self.entries[idx as usize];
        let mut links = std::mem::take(&mut self.links);
        self.queue_mut(entry.state).remove(&mut links, idx);
        self.links = links;
        if matches!(entry.state, ArcState::T1 | ArcState::T2) {
            self.allocation.clear(entry.cblock.0);
        }
        let _ = self.table.remove(entry.oblock.0);
    }

    fn pop(&mut self, state: ArcState) -> Option<u32> {
        let mut links = std::mem::take(&mut self.links);
        let idx = self.queue_mut(state).pop_head(&mut links);
        self.links = links;
        let idx = idx?;
        let entry = self.entries[idx as usize];
        if matches!(entry.state, ArcState::T1 | ArcState::T2) {
            self.allocation.clear(entry.cblock.0);
        }
        let _ = self.table.remove(entry.oblock.0);
        Some(idx)
    }

    /// Evict from T1 or T2 per the adaptive target, pushing the identifier
    /// onto the matching ghost list. Returns the victim mapping.
    fn demote(&mut self, is_b2_hit: bool) -> Option<(OBlock, CBlock)> {
        let t1_size = self.t1.len() as u64;
        let from_t1 = t1_size > 0 && (t1_size > self.p || (is_b2_hit && t1_size == self.p));
        let (take, ghost) = if from_t1 {
            (ArcState::T1, ArcState::B1)
        } else {
            (ArcState::T2, ArcState::B2)
        };
        let idx = self.pop(take).or_else(|| {
            // The preferred side can be empty at the margins of p.
            let other = if from_t1 { ArcState::T2 } else { ArcState::T1 };
            self.pop(other)
        })?;
        let victim = self.entries[idx as usize];
        self.push(ghost, idx);
        trace!(
            target: "hcache::policy::arc",
            event = "demote",
            oblock = victim.oblock.0,
            cblock = victim.cblock.0,
            ghost = ?ghost
        );
        Some((victim.oblock, victim.cblock))
    }

    /// Admission gate: a block is interesting once it has been seen twice
    /// within the filter's window.
    fn interesting_block(&mut self, oblock: OBlock) -> bool {
        if self.last_lookup == Some(oblock) {
            return false;
        }
        let h = (oblock.0.wrapping_mul(BIG_PRIME) % self.interesting_blocks.len() as u64) as usize;
        if self.interesting_blocks[h] == oblock.0 {
            return true;
        }
        self.interesting_blocks[h] = oblock.0;
        false
    }

    fn alloc_entry(&mut self) -> Option<u32> {
        self.free.pop()
    }

    fn any_free_entries(&self) -> bool {
        self.allocation.any_clear()
    }

    fn map_found(&mut self, idx: u32, oblock: OBlock, can_migrate: bool) -> PolicyResult {
        let entry = self.entries[idx as usize];
        match entry.state {
            ArcState::T1 | ArcState::T2 => {
                if self.last_lookup != Some(oblock) {
                    self.del(idx);
                    self.push(ArcState::T2, idx);
                }
                PolicyResult::Hit {
                    cblock: entry.cblock,
                }
            }
            ArcState::B1 => {
                if !can_migrate {
                    return PolicyResult::Miss;
                }
                // The entry sits on B1, so b1_size >= 1.
                let b1_size = self.b1.len() as u64;
                let b2_size = self.b2.len() as u64;
                let delta = if b1_size > b2_size {
                    1
                } else {
                    (b2_size / b1_size).max(1)
                };
                self.p = (self.p + delta).min(self.cache_size);
                let Some((old_oblock, cblock)) = self.demote(false) else {
                    return PolicyResult::Miss;
                };
                self.del(idx);
                self.entries[idx as usize].cblock = cblock;
                self.push(ArcState::T2, idx);
                PolicyResult::Replace { cblock, old_oblock }
            }
            ArcState::B2 => {
                if !can_migrate {
                    return PolicyResult::Miss;
                }
                let b1_size = self.b1.len() as u64;
                let b2_size = self.b2.len() as u64;
                let delta = if b2_size >= b1_size {
                    1
                } else {
                    (b1_size / b2_size).max(1)
                };
                self.p = self.p.saturating_sub(delta);
                let Some((old_oblock, cblock)) = self.demote(true) else {
                    return PolicyResult::Miss;
                };
                self.del(idx);
                self.entries[idx as usize].cblock = cblock;
                self.push(ArcState::T2, idx);
                PolicyResult::Replace { cblock, old_oblock }
            }
        }
    }

    fn map_absent(
        &mut self,
        oblock: OBlock,
        can_migrate: bool,
        discarded: bool,
    ) -> PolicyResult {
        let cheap_copy = discarded && self.any_free_entries();
        if !can_migrate || !(cheap_copy || self.interesting_block(oblock)) {
            return PolicyResult::Miss;
        }

        let l1 = (self.t1.len() + self.b1.len()) as u64;
        let l2 = (self.t2.len() + self.b2.len()) as u64;

        let (idx, result) = if l1 == self.cache_size {
            // Recency side is saturated.
            if (self.t1.len() as u64) < self.cache_size {
                let Some(idx) = self.pop(ArcState::B1) else {
                    return PolicyResult::Miss;
                };
                let Some((old_oblock, cblock)) = self.demote(false) else {
                    self.free.push(idx);
                    return PolicyResult::Miss;
                };
                self.entries[idx as usize].cblock = cblock;
                (idx, PolicyResult::Replace { cblock, old_oblock })
            } else {
                let Some(idx) = self.pop(ArcState::T1) else {
                    return PolicyResult::Miss;
                };
                let victim = self.entries[idx as usize];
                (
                    idx,
                    PolicyResult::Replace {
                        cblock: victim.cblock,
                        old_oblock: victim.oblock,
                    },
                )
            }
        } else if l1 < self.cache_size && l1 + l2 >= self.cache_size {
            let idx = if l1 + l2 == 2 * self.cache_size {
                match self.pop(ArcState::B2) {
                    Some(idx) => idx,
                    None => return PolicyResult::Miss,
                }
            } else {
                match self.alloc_entry() {
                    Some(idx) => idx,
                    None => return PolicyResult::Miss,
                }
            };
            let Some((old_oblock, cblock)) = self.demote(false) else {
                self.free.push(idx);
                return PolicyResult::Miss;
            };
            self.entries[idx as usize].cblock = cblock;
            (idx, PolicyResult::Replace { cblock, old_oblock })
        } else {
            let Some(idx) = self.alloc_entry() else {
                return PolicyResult::Miss;
            };
            let Some(free) = self.allocation.find_clear() else {
                self.free.push(idx);
                return PolicyResult::Miss;
            };
            self.entries[idx as usize].cblock = CBlock(free);
            (idx, PolicyResult::New { cblock: CBlock(free) })
        };

        self.entries[idx as usize].oblock = oblock;
        self.push(ArcState::T1, idx);
        result
    }
}

impl Policy for ArcPolicy {
    fn name(&self) -> &str {
        "arc"
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
        _io: &IoDesc,
    ) -> Result<PolicyResult> {
        let result = match self.table.get(oblock.0) {
            Some(idx) => self.map_found(idx, oblock, can_migrate),
            None => self.map_absent(oblock, can_migrate, discarded),
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
        let state = match hint {
            Some(bytes)
                if bytes.len() == HINT_SIZE
                    && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == 2 =>
            {
                ArcState::T2
            }
            _ => ArcState::T1,
        };
        let idx = self
            .alloc_entry()
            .ok_or(HcError::OutOfMemory("arc entry arena"))?;
        self.entries[idx as usize] = Entry {
            state,
            oblock,
            cblock,
        };
        self.push(state, idx);
        Ok(())
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for (list, hint) in [(&self.t1, 1_u32), (&self.t2, 2_u32)] {
            for idx in list.iter(&self.links) {
                let entry = self.entries[idx as usize];
                visit(entry.oblock, entry.cblock, &hint.to_le_bytes())?;
            }
        }
        Ok(())
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        let Some(idx) = self.table.get(oblock.0) else {
            return;
        };
        let state = self.entries[idx as usize].state;
        if matches!(state, ArcState::T1 | ArcState::T2) {
            let ghost = if state == ArcState::T1 {
                ArcState::B1
            } else {
                ArcState::B2
            };
            self.del(idx);
            self.push(ghost, idx);
        }
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        let Some(idx) = self.table.get(current_oblock.0) else {
            return;
        };
        let _ = self.table.remove(current_oblock.0);
        self.entries[idx as usize].oblock = new_oblock;
        self.table.insert(new_oblock.0, idx);
        if self.last_lookup == Some(current_oblock) {
            self.last_lookup = None;
        }
    }

    fn residency(&self) -> u64 {
        self.allocation.count()
    }

    fn status(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.p,
            self.t1.len(),
            self.t2.len(),
            self.b1.len(),
            self.b2.len(),
            self.allocation.count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io() -> IoDesc {
        IoDesc {
            sector: 0,
            nr_sectors: 8,
            is_write: false,
        }
    }

    /// Two observations make a block interesting enough to admit.
    fn admit(policy: &mut ArcPolicy, ob: OBlock) -> PolicyResult {
        let _ = policy.map(ob, true, false, &io()).unwrap();
        // An unrelated lookup in between, so the dedupe filter does not
        // swallow the second observation.
        let _ = policy.map(OBlock(ob.0 + 100_000), false, false, &io()).unwrap();
        policy.map(ob, true, false, &io()).unwrap()
    }

    #[test]
    fn test_one_shot_blocks_are_not_admitted() {
        let mut policy = ArcPolicy::new(8, ArcConfig::default()).unwrap();
        let result = policy.map(OBlock(5), true, false, &io()).unwrap();
        assert_eq!(result, PolicyResult::Miss);
        assert_eq!(policy.residency(), 0);
    }

    #[test]
    fn test_second_observation_admits() {
        let mut policy = ArcPolicy::new(8, ArcConfig::default()).unwrap();
        let result = admit(&mut policy, OBlock(5));
        assert!(matches!(result, PolicyResult::New { .. }));
        assert_eq!(policy.residency(), 1);

        let result = policy.map(OBlock(5), true, false, &io()).unwrap();
        assert!(matches!(result, PolicyResult::Hit { .. }));
    }

    #[test]
    fn test_discarded_blocks_admit_at_once() {
        let mut policy = ArcPolicy::new(8, ArcConfig::default()).unwrap();
        let result = policy.map(OBlock(5), true, true, &io()).unwrap();
        assert!(matches!(result, PolicyResult::New { .. }));
    }

    #[test]
    fn test_full_cache_replaces() {
        let cache_size = 4;
        let mut policy = ArcPolicy::new(cache_size, ArcConfig::default()).unwrap();
        for i in 0..cache_size {
            let result = policy.map(OBlock(i), true, true, &io()).unwrap();
            assert!(matches!(result, PolicyResult::New { .. }), "block {i}");
        }
        assert_eq!(policy.residency(), cache_size);

        // The cache is full: the next admission must evict someone.
        let result = admit(&mut policy, OBlock(77));
        match result {
            PolicyResult::Replace { old_oblock, .. } => {
                assert!(old_oblock.0 < cache_size);
            }
            other => panic!("expected Replace, got {other:?}"),
        }
        assert_eq!(policy.residency(), cache_size);
    }

    #[test]
    fn test_ghost_hit_adapts_p() {
        let cache_size = 4;
        let mut policy = ArcPolicy::new(cache_size, ArcConfig::default()).unwrap();
        for i in 0..cache_size {
            let _ = policy.map(OBlock(i), true, true, &io()).unwrap();
        }
        // Promote two entries to T2 so the next admission demotes from T1
        // into the B1 ghost list rather than recycling an entry in place.
        for i in 0..2 {
            let result = policy.map(OBlock(i), true, false, &io()).unwrap();
            assert!(matches!(result, PolicyResult::Hit { .. }));
        }
        let evicted = match admit(&mut policy, OBlock(50)) {
            PolicyResult::Replace { old_oblock, .. } => old_oblock,
            other => panic!("expected Replace, got {other:?}"),
        };
        assert!(!policy.b1.is_empty());
        let p_before = policy.p;

        // Touch the ghost: it comes back resident on T2 and p adapts.
        let result = policy.map(evicted, true, false, &io()).unwrap();
        assert!(matches!(result, PolicyResult::Replace { .. }));
        assert_ne!(policy.p, p_before);
        let idx = policy.table.get(evicted.0).unwrap();
        assert_eq!(policy.entries[idx as usize].state, ArcState::T2);
    }

    #[test]
    fn test_remove_mapping_moves_to_ghost() {
        let mut policy = ArcPolicy::new(4, ArcConfig::default()).unwrap();
        let result = admit(&mut policy, OBlock(9));
        assert!(matches!(result, PolicyResult::New { .. }));
        policy.remove_mapping(OBlock(9));
        assert_eq!(policy.residency(), 0);
        let idx = policy.table.get(9).unwrap();
        assert_eq!(policy.entries[idx as usize].state, ArcState::B1);
    }

    #[test]
    fn test_force_mapping_rekeys() {
        let mut policy = ArcPolicy::new(4, ArcConfig::default()).unwrap();
        let cblock = match admit(&mut policy, OBlock(9)) {
            PolicyResult::New { cblock } => cblock,
            other => panic!("expected New, got {other:?}"),
        };
        policy.force_mapping(OBlock(9), OBlock(13));
        assert_eq!(
            policy.map(OBlock(13), true, false, &io()).unwrap(),
            PolicyResult::Hit { cblock }
        );
        assert_eq!(policy.map(OBlock(9), false, false, &io()).unwrap(), PolicyResult::Miss);
    }

    #[test]
    fn test_load_mapping_hint_restores_state() {
        let mut policy = ArcPolicy::new(4, ArcConfig::default()).unwrap();
        policy
            .load_mapping(OBlock(1), CBlock(0), Some(&1_u32.to_le_bytes()))
            .unwrap();
        policy
            .load_mapping(OBlock(2), CBlock(1), Some(&2_u32.to_le_bytes()))
            .unwrap();
        assert_eq!(policy.t1.len(), 1);
        assert_eq!(policy.t2.len(), 1);
        assert_eq!(policy.residency(), 2);
    }
}
