//! Writeback policy: dirty tracking over a hash-indexed LRU.
//!
//! `map` only decides hit or miss; this policy admits nothing by itself.
//! Admission is driven by an outer policy stacked above it. Its job is the
//! bookkeeping that feeds `writeback_work`: which cache blocks are dirty and
//! which should be cleaned next.

use crate::util::{Link, List, OpenTable, NIL};
use crate::{IoDesc, Policy, PolicyResult, POLICY_VERSION_SIZE};
use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};
use tracing::trace;

const HINT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    oblock: OBlock,
    cblock: CBlock,
    dirty: bool,
    /// Monotonic insertion stamp, persisted as the mapping hint so reloads
    /// reproduce the writeback order.
    age: u32,
}

pub struct WritebackPolicy {
    cache_size: u64,
    entries: Vec<Entry>,
    links: Vec<Link>,
    free: Vec<u32>,
    /// Oldest entry at the head.
    lru: List,
    table: OpenTable,
    /// Arena slot per cache block, for dirty marking by cblock.
    by_cblock: Vec<u32>,
    nr_dirty: u64,
    next_age: u32,
}

impl WritebackPolicy {
    pub fn new(cache_size: u64) -> Result<Self> {
        if cache_size == 0 {
            return Err(HcError::InvalidArgument(
                "cache_size must be > 0".to_owned(),
            ));
        }
        let n = usize::try_from(cache_size)
            .map_err(|_| HcError::InvalidArgument("cache_size too large".to_owned()))?;
        Ok(Self {
            cache_size,
            entries: vec![
                Entry {
                    oblock: OBlock(0),
                    cblock: CBlock(0),
                    dirty: false,
                    age: 0,
                };
                n
            ],
            links: vec![Link::default(); n],
            free: (0..n as u32).rev().collect(),
            lru: List::new(),
            table: OpenTable::with_capacity(cache_size),
            by_cblock: vec![NIL; n],
            nr_dirty: 0,
            next_age: 0,
        })
    }

    fn add_entry(&mut self, oblock: OBlock, cblock: CBlock, age: u32) -> Result<()> {
        let Some(idx) = self.free.pop() else {
            return Err(HcError::OutOfMemory("writeback entry arena"));
        };
        if cblock.0 >= self.cache_size || self.by_cblock[cblock.0 as usize] != NIL {
            return Err(HcError::InvalidArgument(format!(
                "cache block {cblock} out of range or already mapped"
            )));
        }
        self.entries[idx as usize] = Entry {
            oblock,
            cblock,
            dirty: false,
            age,
        };
        self.table.insert(oblock.0, idx);
        self.by_cblock[cblock.0 as usize] = idx;
        self.lru.push_tail(&mut self.links, idx);
        Ok(())
    }

    fn drop_entry(&mut self, idx: u32) {
        let entry = self.entries[idx as usize];
        if entry.dirty {
            self.nr_dirty -= 1;
        }
        let _ = self.table.remove(entry.oblock.0);
        self.by_cblock[entry.cblock.0 as usize] = NIL;
        self.lru.remove(&mut self.links, idx);
        self.free.push(idx);
    }
}

impl Policy for WritebackPolicy {
    fn name(&self) -> &str {
        "writeback"
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
        _can_migrate: bool,
        _discarded: bool,
        _io: &IoDesc,
    ) -> Result<PolicyResult> {
        Ok(match self.table.get(oblock.0) {
            Some(idx) => PolicyResult::Hit {
                cblock: self.entries[idx as usize].cblock,
            },
            None => PolicyResult::Miss,
        })
    }

    fn load_mapping(
        &mut self,
        oblock: OBlock,
        cblock: CBlock,
        hint: Option<&[u8]>,
    ) -> Result<()> {
        let age = match hint {
            Some(bytes) if bytes.len() == HINT_SIZE => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => self.next_age,
        };
        self.next_age = self.next_age.max(age).wrapping_add(1);
        self.add_entry(oblock, cblock, age)
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for idx in self.lru.iter(&self.links) {
            let entry = self.entries[idx as usize];
            visit(entry.oblock, entry.cblock, &entry.age.to_le_bytes())?;
        }
        Ok(())
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        if let Some(idx) = self.table.get(oblock.0) {
            self.drop_entry(idx);
        }
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        if let Some(idx) = self.table.get(current_oblock.0) {
            let _ = self.table.remove(current_oblock.0);
            self.entries[idx as usize].oblock = new_oblock;
            self.table.insert(new_oblock.0, idx);
        }
    }

    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        if self.nr_dirty == 0 {
            return None;
        }
        let idx = self
            .lru
            .iter(&self.links)
            .find(|idx| self.entries[*idx as usize].dirty)?;
        let entry = &mut self.entries[idx as usize];
        entry.dirty = false;
        let out = (entry.oblock, entry.cblock);
        self.nr_dirty -= 1;
        // Rotate to the tail so repeated dirtying cycles fairly.
        self.lru.remove(&mut self.links, idx);
        self.lru.push_tail(&mut self.links, idx);
        trace!(
            target: "hcache::policy::writeback",
            event = "writeback_work",
            oblock = out.0 .0,
            cblock = out.1 .0
        );
        Some(out)
    }

    fn set_dirty(&mut self, cblock: CBlock) {
        if cblock.0 >= self.cache_size {
            return;
        }
        let idx = self.by_cblock[cblock.0 as usize];
        if idx == NIL {
            return;
        }
        let entry = &mut self.entries[idx as usize];
        if !entry.dirty {
            entry.dirty = true;
            self.nr_dirty += 1;
        }
    }

    fn clear_dirty(&mut self, cblock: CBlock) {
        if cblock.0 >= self.cache_size {
            return;
        }
        let idx = self.by_cblock[cblock.0 as usize];
        if idx == NIL {
            return;
        }
        let entry = &mut self.entries[idx as usize];
        if entry.dirty {
            entry.dirty = false;
            self.nr_dirty -= 1;
        }
    }

    fn residency(&self) -> u64 {
        self.lru.len() as u64
    }

    fn status(&self) -> String {
        format!("{}", self.nr_dirty)
    }
}
