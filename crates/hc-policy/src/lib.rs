#![forbid(unsafe_code)]
//! Cache replacement policies.
//!
//! The policy decides which origin blocks get to live on the faster cache
//! device. For every request the core calls [`Policy::map`], which returns an
//! instruction:
//!
//! - `Hit`: the block is in the cache; remap and carry on.
//! - `Miss`: the block stays on the origin.
//! - `New`: admit into a free cache block; the core quiesces I/O to the
//!   origin block, copies origin to cache, then remaps.
//! - `Replace`: as `New`, but the target cache block currently holds another
//!   mapping that needs writeback and eviction first.
//!
//! Should the core run into trouble acting on `New` or `Replace` it rolls the
//! policy back with [`Policy::remove_mapping`] or [`Policy::force_mapping`];
//! those must succeed. This keeps transactional complexity in the core, not
//! the policy.
//!
//! Policy methods never block and never allocate on the map path; entries
//! come from arenas sized at construction.

mod arc;
mod mq;
mod shim;
mod stack;
mod util;
mod writeback;

pub use arc::{ArcConfig, ArcPolicy};
pub use mq::MqPolicy;
pub use shim::{CleanerShim, TraceShim};
pub use stack::{is_policy_stack_string, policy_stack_create, PolicyStack};
pub use writeback::WritebackPolicy;

use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};

/// Components of a policy version vector.
pub const POLICY_VERSION_SIZE: usize = 3;

/// Instruction returned to the core by [`Policy::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyResult {
    Hit { cblock: CBlock },
    Miss,
    New { cblock: CBlock },
    Replace { cblock: CBlock, old_oblock: OBlock },
}

/// Shape of the request that triggered a `map` call; used for sequential
/// stream detection.
#[derive(Debug, Clone, Copy)]
pub struct IoDesc {
    pub sector: u64,
    pub nr_sectors: u64,
    pub is_write: bool,
}

/// The uniform policy contract consumed by the cache core.
///
/// Writeback-capable policies override the dirty-tracking and
/// `writeback_work` entries; the defaults make a policy read-only from the
/// core's point of view.
pub trait Policy: Send {
    fn name(&self) -> &str;

    fn version(&self) -> [u32; POLICY_VERSION_SIZE];

    /// Bytes of per-mapping hint this policy persists.
    fn hint_size(&self) -> usize;

    /// Decide what to do with a request for `oblock`.
    ///
    /// With `can_migrate = false` the result is never `New` or `Replace`.
    /// `discarded` marks an origin block whose content is known stale, which
    /// makes the copy cheap.
    fn map(
        &mut self,
        oblock: OBlock,
        can_migrate: bool,
        discarded: bool,
        io: &IoDesc,
    ) -> Result<PolicyResult>;

    /// Replay one persisted mapping at startup.
    fn load_mapping(&mut self, oblock: OBlock, cblock: CBlock, hint: Option<&[u8]>)
        -> Result<()>;

    /// Enumerate `(oblock, cblock, hint)` for persistence.
    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Roll back a `New`/`Replace` the core could not complete. Must succeed.
    fn remove_mapping(&mut self, oblock: OBlock);

    /// Re-key an entry after a failed migration. Must succeed.
    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock);

    /// Next dirty block to clean, if any.
    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        None
    }

    fn set_dirty(&mut self, _cblock: CBlock) {}

    fn clear_dirty(&mut self, _cblock: CBlock) {}

    /// Number of cache blocks currently allocated to mappings.
    fn residency(&self) -> u64;

    /// Coarse clock advanced by the core; dedupes rapid re-references.
    fn tick(&mut self) {}

    fn status(&self) -> String {
        String::new()
    }

    fn message(&mut self, msg: &str) -> Result<()> {
        Err(HcError::InvalidArgument(format!(
            "policy {} accepts no messages, got {msg:?}",
            self.name()
        )))
    }
}

/// Create a terminal policy by name.
pub fn policy_create(name: &str, cache_size: u64) -> Result<Box<dyn Policy>> {
    match name {
        "writeback" => Ok(Box::new(WritebackPolicy::new(cache_size)?)),
        "mq" => Ok(Box::new(MqPolicy::new(cache_size)?)),
        "arc" => Ok(Box::new(ArcPolicy::new(cache_size, ArcConfig::default())?)),
        _ => Err(HcError::InvalidArgument(format!(
            "unknown cache policy {name:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_at(sector: u64) -> IoDesc {
        IoDesc {
            sector,
            nr_sectors: 8,
            is_write: true,
        }
    }

    /// Contract shared by every policy: `can_migrate = false` never yields a
    /// migration instruction.
    #[test]
    fn test_no_migration_without_permission() {
        for name in ["writeback", "mq", "arc"] {
            let mut policy = policy_create(name, 16).unwrap();
            for i in 0..200_u64 {
                // Scattered blocks, repeated to build up hit counts.
                let ob = OBlock((i * 37) % 64);
                let result = policy
                    .map(ob, false, i % 2 == 0, &io_at(ob.0 * 8))
                    .unwrap();
                assert!(
                    !matches!(
                        result,
                        PolicyResult::New { .. } | PolicyResult::Replace { .. }
                    ),
                    "policy {name} migrated without permission"
                );
            }
        }
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(matches!(
            policy_create("lru", 16),
            Err(HcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_load_then_walk_round_trip() {
        for name in ["writeback", "mq", "arc"] {
            let mut policy = policy_create(name, 8).unwrap();
            let hint = vec![0_u8; policy.hint_size()];
            for i in 0..4_u64 {
                policy
                    .load_mapping(OBlock(i * 10), CBlock(i), Some(&hint))
                    .unwrap();
            }
            assert_eq!(policy.residency(), 4, "policy {name}");

            let mut seen = Vec::new();
            policy
                .walk_mappings(&mut |ob, cb, hint| {
                    assert_eq!(hint.len(), policy.hint_size());
                    seen.push((ob, cb));
                    Ok(())
                })
                .unwrap();
            seen.sort_unstable_by_key(|(ob, _)| ob.0);
            assert_eq!(
                seen,
                (0..4_u64)
                    .map(|i| (OBlock(i * 10), CBlock(i)))
                    .collect::<Vec<_>>(),
                "policy {name}"
            );
        }
    }
}
