//! Policy stack composition.
//!
//! A stack string is a `+`-separated chain of shim policies ending in a
//! terminal policy, e.g. `trace+cleaner+mq`. A trailing `+` marks a single
//! policy rather than a stack (`mq+`), which keeps single-segment shims
//! distinguishable while the stack is being parsed.
//!
//! The canonical composite name concatenates segment names but skips
//! hintless inner shims, and the composite version sums the version vectors
//! of the segments that remain. Hintless debug shims can therefore be
//! hot-inserted without invalidating persisted metadata, whose policy name
//! and hint layout stay unchanged.

use crate::shim::{CleanerShim, TraceShim};
use crate::{policy_create, IoDesc, Policy, PolicyResult, POLICY_VERSION_SIZE};
use hc_error::{HcError, Result};
use hc_types::{CBlock, OBlock};
use tracing::info;

pub const POLICY_STACK_DELIM: char = '+';

/// A string specifies a policy stack (instead of a single policy) if it
/// contains a delimiter anywhere but at the end.
#[must_use]
pub fn is_policy_stack_string(s: &str) -> bool {
    match s.find(POLICY_STACK_DELIM) {
        Some(at) => at + 1 < s.len(),
        None => false,
    }
}

#[derive(Debug, Clone)]
struct Segment {
    name: String,
    version: [u32; POLICY_VERSION_SIZE],
    hint_size: usize,
}

/// A composed chain of shims over one terminal policy.
///
/// Dispatches every operation into the head of the chain; reports the
/// canonical composite name, version, and hint size.
pub struct PolicyStack {
    head: Box<dyn Policy>,
    name: String,
    version: [u32; POLICY_VERSION_SIZE],
    hint_size: usize,
}

/// Build a policy or policy stack from `stack_str`.
pub fn policy_stack_create(stack_str: &str, cache_size: u64) -> Result<Box<dyn Policy>> {
    let segments: Vec<&str> = stack_str
        .split(POLICY_STACK_DELIM)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return Err(HcError::InvalidArgument(
            "empty policy stack string".to_owned(),
        ));
    }
    if segments.len() == 1 {
        return policy_create(segments[0], cache_size);
    }

    // Build from the terminal outwards, recording each segment's identity.
    let terminal_name = segments[segments.len() - 1];
    let mut head = policy_create(terminal_name, cache_size)?;
    let mut metas = vec![Segment {
        name: head.name().to_owned(),
        version: head.version(),
        hint_size: head.hint_size(),
    }];

    for shim_name in segments[..segments.len() - 1].iter().rev() {
        head = match *shim_name {
            "trace" => Box::new(TraceShim::new(head)),
            "cleaner" => Box::new(CleanerShim::new(head)),
            other => {
                return Err(HcError::InvalidArgument(format!(
                    "{other:?} is not a shim policy; only the last stack segment may be a \
                     terminal policy"
                )))
            }
        };
        metas.push(Segment {
            name: head.name().to_owned(),
            version: head.version(),
            hint_size: head.hint_size(),
        });
    }
    metas.reverse();

    // Canonical identity: skip hintless inner shims.
    let mut name = String::new();
    let mut version = [0_u32; POLICY_VERSION_SIZE];
    let mut hint_size = 0;
    for (i, segment) in metas.iter().enumerate() {
        let inner = i + 1 < metas.len();
        if segment.hint_size == 0 && inner {
            continue;
        }
        name.push_str(&segment.name);
        for (total, part) in version.iter_mut().zip(segment.version.iter()) {
            *total += part;
        }
        hint_size += segment.hint_size;
    }

    info!(
        target: "hcache::policy::stack",
        event = "stack_created",
        stack = stack_str,
        canonical = name.as_str(),
        hint_size
    );
    Ok(Box::new(PolicyStack {
        head,
        name,
        version,
        hint_size,
    }))
}

impl Policy for PolicyStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> [u32; POLICY_VERSION_SIZE] {
        self.version
    }

    fn hint_size(&self) -> usize {
        self.hint_size
    }

    fn map(
        &mut self,
        oblock: OBlock,
        can_migrate: bool,
        discarded: bool,
        io: &IoDesc,
    ) -> Result<PolicyResult> {
        self.head.map(oblock, can_migrate, discarded, io)
    }

    fn load_mapping(
        &mut self,
        oblock: OBlock,
        cblock: CBlock,
        hint: Option<&[u8]>,
    ) -> Result<()> {
        self.head.load_mapping(oblock, cblock, hint)
    }

    fn walk_mappings(
        &self,
        visit: &mut dyn FnMut(OBlock, CBlock, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.head.walk_mappings(visit)
    }

    fn remove_mapping(&mut self, oblock: OBlock) {
        self.head.remove_mapping(oblock);
    }

    fn force_mapping(&mut self, current_oblock: OBlock, new_oblock: OBlock) {
        self.head.force_mapping(current_oblock, new_oblock);
    }

    fn writeback_work(&mut self) -> Option<(OBlock, CBlock)> {
        self.head.writeback_work()
    }

    fn set_dirty(&mut self, cblock: CBlock) {
        self.head.set_dirty(cblock);
    }

    fn clear_dirty(&mut self, cblock: CBlock) {
        self.head.clear_dirty(cblock);
    }

    fn residency(&self) -> u64 {
        self.head.residency()
    }

    fn tick(&mut self) {
        self.head.tick();
    }

    fn status(&self) -> String {
        self.head.status()
    }

    fn message(&mut self, msg: &str) -> Result<()> {
        self.head.message(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_string_detection() {
        assert!(is_policy_stack_string("trace+mq"));
        assert!(is_policy_stack_string("trace+cleaner+mq"));
        // A trailing delimiter denotes a single policy.
        assert!(!is_policy_stack_string("mq+"));
        assert!(!is_policy_stack_string("mq"));
    }

    #[test]
    fn test_single_policy_from_stack_string() {
        let policy = policy_stack_create("mq+", 8).unwrap();
        assert_eq!(policy.name(), "mq");
    }

    #[test]
    fn test_canonical_name_skips_hintless_shims() {
        let stack = policy_stack_create("trace+cleaner+mq", 8).unwrap();
        assert_eq!(stack.name(), "cleanermq");

        // Removing the hintless shim yields the same canonical identity.
        let bare = policy_stack_create("cleaner+mq", 8).unwrap();
        assert_eq!(bare.name(), stack.name());
        assert_eq!(bare.version(), stack.version());
        assert_eq!(bare.hint_size(), stack.hint_size());
    }

    #[test]
    fn test_composite_version_and_hint_sum() {
        let cleaner = CleanerShim::new(policy_create("mq", 8).unwrap());
        let mq = policy_create("mq", 8).unwrap();
        let expected_version = [
            cleaner.version()[0] + mq.version()[0],
            cleaner.version()[1] + mq.version()[1],
            cleaner.version()[2] + mq.version()[2],
        ];
        let expected_hint = cleaner.hint_size() + mq.hint_size();

        let stack = policy_stack_create("trace+cleaner+mq", 8).unwrap();
        assert_eq!(stack.version(), expected_version);
        assert_eq!(stack.hint_size(), expected_hint);
    }

    #[test]
    fn test_terminal_hintless_segment_is_kept() {
        // The last segment is always part of the identity, hints or not.
        let stack = policy_stack_create("cleaner+arc", 8).unwrap();
        assert_eq!(stack.name(), "cleanerarc");
    }

    #[test]
    fn test_non_shim_inner_segment_rejected() {
        assert!(matches!(
            policy_stack_create("mq+arc", 8),
            Err(HcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stack_round_trip_hints() {
        let mut stack = policy_stack_create("trace+cleaner+writeback", 4).unwrap();
        assert_eq!(stack.hint_size(), 8);

        let hint = vec![0_u8; 8];
        stack
            .load_mapping(OBlock(11), CBlock(2), Some(&hint))
            .unwrap();
        let mut count = 0;
        stack
            .walk_mappings(&mut |ob, cb, hint| {
                assert_eq!((ob, cb), (OBlock(11), CBlock(2)));
                assert_eq!(hint.len(), 8);
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
