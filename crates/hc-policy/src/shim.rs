//! Shim policies: layers stacked above a terminal policy.
//!
//! A shim forwards every operation to its child unless it has a reason to
//! intervene. Hintless shims (trace) have no persisted footprint and are
//! omitted from a stack's canonical name, so they can be inserted or removed
//! without invalidating on-disk metadata.

use crate::{IoDesc, Policy, PolicyResult, POLICY_VERSION_SIZE};
use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};
use tracing::debug;

/// Debug shim: logs every decision and forwards it unchanged. Hintless.
pub struct TraceShim {
    child: Box<dyn Policy>,
}

impl TraceShim {
    #[must_use]
    pub fn new(child: Box<dyn Policy>) -> Self {
        Self { child }
    }
}

impl Policy for TraceShim {
    fn name(&self) -> &str {
        "trace"
    }

    fn version(&self) -> [u32; POLICY_VERSION_SIZE] {
        [1, 0, 0]
    }

    fn hint_size(&self) -> usize {
        0
    }

    fn map(
        &mut self,
        oblock: OBlock,
        can_migrate: bool,
        discarded: bool,
        io: &IoDesc,
    ) -> Result<PolicyResult> {
        let result = self.child.map(oblock, can_migrate, discarded, io);
        debug!(
            target: "hcache::policy::trace",
            event = "map",
            oblock = oblock.0,
            can_migrate,
            discarded,
            result = ?result
        );
        result
    }

    fn load_mapping(
        &mut self,
        oblock: OBlock,
        cblock: CBlock,
        hint: Option<&[u8]>,
    ) -> Result<()> {
        self.child.load_mapping(oblock, cblock, hint)
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.child.walk_mappings(visit)
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        debug!(target: "hcache::policy::trace", event = "remove_mapping", oblock = oblock.0);
        self.child.remove_mapping(oblock);
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        debug!(
            target: "hcache::policy::trace",
            event = "force_mapping",
            current = current_oblock.0,
            new = new_oblock.0
        );
        self.child.force_mapping(current_oblock, new_oblock);
    }

    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        self.child.writeback_work()
    }

    fn set_dirty(&mut self, cblock: CBlock) {
        self.child.set_dirty(cblock);
    }

    fn clear_dirty(&mut self, cblock: CBlock) {
        self.child.clear_dirty(cblock);
    }

    fn residency(&self) -> u64 {
        self.child.residency()
    }

    fn tick(&mut self) {
        self.child.tick();
    }

    fn status(&self) -> String {
        self.child.status()
    }

    fn message(&mut self, msg: &str) -> Result<()> {
        self.child.message(msg)
    }
}

const CLEANER_HINT_SIZE: usize = 4;

/// Decommissioning shim: denies new admissions (`can_migrate` is forced off
/// on the way down) while writeback work keeps draining, so the cache
/// empties of dirty data. Carries a reserved four-byte hint.
pub struct CleanerShim {
    child: Box<dyn Policy>,
}

impl CleanerShim {
    #[must_use]
    pub fn new(child: Box<dyn Policy>) -> Self {
        Self { child }
    }
}

impl Policy for CleanerShim {
    fn name(&self) -> &str {
        "cleaner"
    }

    fn version(&self) -> [u32; POLICY_VERSION_SIZE] {
        [1, 0, 0]
    }

    fn hint_size(&self) -> usize {
        CLEANER_HINT_SIZE
    }

    fn map(
        &mut self,
        oblock: OBlock,
        _can_migrate: bool,
        discarded: bool,
        io: &IoDesc,
    ) -> Result<PolicyResult> {
        self.child.map(oblock, false, discarded, io)
    }

    fn load_mapping(
        &mut self,
        oblock: OBlock,
        cblock: CBlock,
        hint: Option<&[u8]>,
    ) -> Result<()> {
        // The composite hint carries this shim's bytes first.
        let child_hint = match hint {
            Some(bytes) => {
                if bytes.len() < CLEANER_HINT_SIZE {
                    return Err(HcError::Format(format!(
                        "cleaner hint too short: {} bytes",
                        bytes.len()
                    )));
                }
                Some(&bytes[CLEANER_HINT_SIZE..])
            }
            None => None,
        };
        self.child.load_mapping(oblock, cblock, child_hint)
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.child.walk_mappings(&mut |oblock, cblock, child_hint| {
            let mut hint = [0_u8; CLEANER_HINT_SIZE].to_vec();
            hint.extend_from_slice(child_hint);
            visit(oblock, cblock, &hint)
        })
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        self.child.remove_mapping(oblock);
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        self.child.force_mapping(current_oblock, new_oblock);
    }

    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        self.child.writeback_work()
    }

    fn set_dirty(&mut self, cblock: CBlock) {
        self.child.set_dirty(cblock);
    }

    fn clear_dirty(&mut self, cblock: CBlock) {
        self.child.clear_dirty(cblock);
    }

    fn residency(&self) -> u64 {
        self.child.residency()
    }

    fn tick(&mut self) {
        self.child.tick();
    }

    fn status(&self) -> String {
        self.child.status()
    }

    fn message(&mut self, msg: &str) -> Result<()> {
        self.child.message(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_create;

    fn io() -> IoDesc {
        IoDesc {
            sector: 0,
            nr_sectors: 8,
            is_write: true,
        }
    }

    #[test]
    fn test_trace_forwards_unchanged() {
        let mut shim = TraceShim::new(policy_create("writeback", 4).unwrap());
        shim.load_mapping(OBlock(10), CBlock(0), None).unwrap();
        assert_eq!(
            shim.map(OBlock(10), true, false, &io()).unwrap(),
            PolicyResult::Hit { cblock: CBlock(0) }
        );
        assert_eq!(shim.residency(), 1);
        assert_eq!(shim.hint_size(), 0);
    }

    #[test]
    fn test_cleaner_denies_admissions() {
        // A discarded block would normally be admitted straight away.
        let mut bare = policy_create("mq", 4).unwrap();
        bare.tick();
        assert!(matches!(
            bare.map(OBlock(1), true, true, &io()).unwrap(),
            PolicyResult::New { .. }
        ));

        let mut shim = CleanerShim::new(policy_create("mq", 4).unwrap());
        shim.tick();
        assert_eq!(
            shim.map(OBlock(1), true, true, &io()).unwrap(),
            PolicyResult::Miss
        );
    }

    #[test]
    fn test_cleaner_hint_framing() {
        let mut shim = CleanerShim::new(policy_create("mq", 4).unwrap());
        let composite_hint = [0_u8; 8]; // 4 cleaner + 4 mq
        shim.load_mapping(OBlock(3), CBlock(1), Some(&composite_hint))
            .unwrap();

        let mut seen = 0;
        shim.walk_mappings(&mut |ob, cb, hint| {
            assert_eq!((ob, cb), (OBlock(3), CBlock(1)));
            assert_eq!(hint.len(), 8);
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }
}
