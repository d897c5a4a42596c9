//! Shadowed, ordered, multi-level B-tree.
//!
//! Keys are 64-bit integers; values are fixed-size opaque payloads declared
//! per tree. A tree with `levels = n` is logically `(k1, .., kn) -> V`,
//! implemented as nested trees whose non-terminal leaves store child tree
//! roots.
//!
//! Updates go through the shadow spine: every node on the root-to-leaf path
//! is copied-on-write, inserts split full nodes on the way down and removes
//! rebalance thin children on the way down, so a modification touches a
//! single path and the spine never holds more than two locks.
//!
//! Based on the ideas in ["B-trees, Shadowing, and Clones", Ohad Rodeh].

mod node;
mod spine;

pub use node::{calc_max_entries, NodeValidator};

use crate::tm::{TmRead, TransactionManager};
use hc_block::Block;
use hc_error::{HcError, Result};
use hc_types::{read_le_u64, BlockId};
use node::{Node, NodeMut, INTERNAL_NODE, LEAF_NODE};
use spine::{RoSpine, ShadowSpine};
use std::sync::Arc;
use tracing::trace;

/// Hooks invoked when an entry is logically duplicated (a shared node is
/// shadowed) or dropped (removed, or its tree deleted). Trees whose values
/// reference other blocks use these to keep reference counts honest.
#[derive(Clone, Copy)]
pub struct ValueType {
    pub size: usize,
    pub inc: Option<fn(&mut TransactionManager, &[u8]) -> Result<()>>,
    pub del: Option<fn(&mut TransactionManager, &[u8]) -> Result<()>>,
}

/// Shape of one tree: nesting depth and the terminal value type.
#[derive(Clone, Copy)]
pub struct BtreeInfo {
    pub levels: usize,
    pub value_type: ValueType,
}

fn vt_inc_block(tm: &mut TransactionManager, value: &[u8]) -> Result<()> {
    let b = read_le_u64(value, 0).map_err(|e| HcError::Format(e.to_string()))?;
    tm.inc(BlockId(b))
}

fn vt_dec_block(tm: &mut TransactionManager, value: &[u8]) -> Result<()> {
    let b = read_le_u64(value, 0).map_err(|e| HcError::Format(e.to_string()))?;
    tm.dec(BlockId(b))
}

/// Value type for non-terminal levels: 8-byte child tree roots.
pub(crate) fn internal_value_type() -> ValueType {
    ValueType {
        size: 8,
        inc: Some(vt_inc_block),
        del: Some(vt_dec_block),
    }
}

/// Bump the reference counts of everything `block` points at: child blocks
/// for internal nodes, value-type references for leaves.
pub(crate) fn inc_children(
    tm: &mut TransactionManager,
    block: &Block,
    vt: &ValueType,
) -> Result<()> {
    let n = Node::new(block.data())?;
    if n.is_internal() {
        for i in 0..n.nr_entries() {
            tm.inc(BlockId(n.value_u64(i)))?;
        }
    } else if let Some(inc) = vt.inc {
        for i in 0..n.nr_entries() {
            inc(tm, n.value(i, vt.size))?;
        }
    }
    Ok(())
}

fn leaf_value_size(info: &BtreeInfo, level: usize) -> usize {
    if level + 1 == info.levels {
        info.value_type.size
    } else {
        8
    }
}

/// Create an empty tree: a single empty leaf.
pub fn empty(tm: &mut TransactionManager, info: &BtreeInfo) -> Result<BlockId> {
    let vsize = leaf_value_size(info, 0);
    empty_sized(tm, vsize)
}

fn empty_sized(tm: &mut TransactionManager, value_size: usize) -> Result<BlockId> {
    let max = calc_max_entries(value_size, tm.block_size());
    let validator = Arc::clone(tm.node_validator());
    let mut block = tm.new_block(&validator)?;
    NodeMut::init(block.data_mut(), LEAF_NODE, max)?;
    let loc = block.location();
    tm.unlock(block)?;
    Ok(loc)
}

/// Insert `value` under `keys` (one key per level), returning the new root.
/// An existing entry is overwritten in place.
pub fn insert(
    tm: &mut TransactionManager,
    info: &BtreeInfo,
    root: BlockId,
    keys: &[u64],
    value: &[u8],
) -> Result<BlockId> {
    debug_assert_eq!(keys.len(), info.levels);
    debug_assert_eq!(value.len(), info.value_type.size);

    let mut spine = ShadowSpine::new(tm);
    let mut block = root;
    // Index of the entry in the previous level's leaf that points at this
    // level's root; shadowing the root must patch it.
    let mut link_index: Option<usize> = None;
    for level in 0..info.levels {
        let last = level + 1 == info.levels;
        let vt = if last {
            info.value_type
        } else {
            internal_value_type()
        };
        let index = insert_raw(&mut spine, &vt, block, keys[level], link_index)?;

        let (nr, key_at) = {
            let n = spine.current_node()?;
            let key_at = if index < n.nr_entries() {
                Some(n.key(index))
            } else {
                None
            };
            (n.nr_entries(), key_at)
        };
        let need_insert = index >= nr || key_at != Some(keys[level]);

        if last {
            let mut nm = NodeMut::new(spine.current_mut().data_mut())?;
            if need_insert {
                nm.insert_at(index, keys[level], value, vt.size);
            } else {
                nm.set_value(index, value, vt.size);
            }
        } else {
            if need_insert {
                let child_vsize = leaf_value_size(info, level + 1);
                let subtree = empty_sized(spine.tm(), child_vsize)?;
                let mut nm = NodeMut::new(spine.current_mut().data_mut())?;
                nm.insert_at(index, keys[level], &subtree.0.to_le_bytes(), 8);
            }
            block = BlockId(spine.current_node()?.value_u64(index));
        }
        link_index = Some(index);
    }
    spine.exit()
}

/// Descend to the leaf for `key`, splitting full nodes on the way, and
/// return the index where `key` lives or should be inserted.
///
/// `parent_index` seeds the parent patch for the first step: when this level
/// is an inner tree, the previous level's leaf points at its root.
fn insert_raw(
    spine: &mut ShadowSpine<'_>,
    vt: &ValueType,
    mut block: BlockId,
    key: u64,
    mut parent_index: Option<usize>,
) -> Result<usize> {
    let mut top = true;
    loop {
        spine.step(vt, block, parent_index)?;

        let full = {
            let n = spine.current_node()?;
            n.nr_entries() == n.max_entries()
        };
        if full {
            if top {
                split_beneath(spine, vt)?;
            } else {
                let pi = parent_index.ok_or_else(|| {
                    HcError::Format("full non-root node without parent".to_owned())
                })?;
                split_sibling(spine, vt, pi, key)?;
            }
        }

        let (is_leaf, bound, bound_key) = {
            let n = spine.current_node()?;
            let bound = n.lower_bound(key);
            let bound_key = bound.map(|i| n.key(i));
            (n.is_leaf(), bound, bound_key)
        };

        if is_leaf {
            return Ok(match (bound, bound_key) {
                (Some(i), Some(k)) if k == key => i,
                (Some(i), _) => i + 1,
                _ => 0,
            });
        }

        let i = match bound {
            Some(i) => i,
            None => {
                // Keep parent separators <= all descendants: adopt the new
                // lowest key on the way down.
                let mut nm = NodeMut::new(spine.current_mut().data_mut())?;
                nm.set_key(0, key);
                0
            }
        };
        block = BlockId(spine.current_node()?.value_u64(i));
        parent_index = Some(i);
        top = false;
    }
}

/// Split a full root: its entries move into two fresh children and the root
/// becomes an internal node with two entries. Grows the tree by one level.
fn split_beneath(spine: &mut ShadowSpine<'_>, vt: &ValueType) -> Result<()> {
    let (flags, nr, max, vsize) = {
        let n = spine.current_node()?;
        let vsize = if n.is_leaf() { vt.size } else { 8 };
        let flags = if n.is_leaf() { LEAF_NODE } else { INTERNAL_NODE };
        (flags, n.nr_entries(), n.max_entries(), vsize)
    };
    let nr_left = nr / 2;
    let nr_right = nr - nr_left;

    let validator = Arc::clone(spine.tm_ref().node_validator());

    let mut left = spine.tm().new_block(&validator)?;
    {
        let mut lm = NodeMut::init(left.data_mut(), flags, max)?;
        lm.copy_entries(0, &spine.current_node()?, 0, nr_left, vsize);
        lm.set_nr_entries(nr_left);
    }
    let left_loc = left.location();
    spine.tm().unlock(left)?;

    let mut right = spine.tm().new_block(&validator)?;
    {
        let mut rm = NodeMut::init(right.data_mut(), flags, max)?;
        rm.copy_entries(0, &spine.current_node()?, nr_left, nr_right, vsize);
        rm.set_nr_entries(nr_right);
    }
    let right_loc = right.location();
    spine.tm().unlock(right)?;

    let (left_key, right_key) = {
        let n = spine.current_node()?;
        (n.key(0), n.key(nr_left))
    };

    let parent_max = calc_max_entries(8, spine.tm_ref().block_size());
    let mut nm = NodeMut::new(spine.current_mut().data_mut())?;
    nm.set_flags(INTERNAL_NODE);
    nm.set_max_entries(parent_max);
    nm.set_nr_entries(0);
    nm.insert_at(0, left_key, &left_loc.0.to_le_bytes(), 8);
    nm.insert_at(1, right_key, &right_loc.0.to_le_bytes(), 8);
    trace!(
        target: "hcache::pdata::btree",
        event = "split_beneath",
        left = left_loc.0,
        right = right_loc.0
    );
    Ok(())
}

/// Split a full non-root node, giving half its entries to a new sibling on
/// the right. The spine keeps whichever half contains `key`.
fn split_sibling(
    spine: &mut ShadowSpine<'_>,
    vt: &ValueType,
    parent_index: usize,
    key: u64,
) -> Result<()> {
    let (flags, nr, max, vsize) = {
        let n = spine.current_node()?;
        let vsize = if n.is_leaf() { vt.size } else { 8 };
        let flags = if n.is_leaf() { LEAF_NODE } else { INTERNAL_NODE };
        (flags, n.nr_entries(), n.max_entries(), vsize)
    };
    let nr_left = nr / 2;
    let nr_right = nr - nr_left;

    let validator = Arc::clone(spine.tm_ref().node_validator());
    let mut right = spine.tm().new_block(&validator)?;
    {
        let mut rm = NodeMut::init(right.data_mut(), flags, max)?;
        rm.copy_entries(0, &spine.current_node()?, nr_left, nr_right, vsize);
        rm.set_nr_entries(nr_right);
    }
    {
        let mut cm = NodeMut::new(spine.current_mut().data_mut())?;
        cm.set_nr_entries(nr_left);
    }

    let right_key = Node::new(right.data())?.key(0);
    let right_loc = right.location();
    {
        let mut pm = NodeMut::new(spine.parent_mut().data_mut())?;
        pm.insert_at(parent_index + 1, right_key, &right_loc.0.to_le_bytes(), 8);
    }
    trace!(
        target: "hcache::pdata::btree",
        event = "split_sibling",
        right = right_loc.0
    );

    if key >= right_key {
        spine.replace_current(right)?;
    } else {
        spine.tm().unlock(right)?;
    }
    Ok(())
}

/// Remove `keys`, returning the new root and whether an entry was removed.
pub fn remove(
    tm: &mut TransactionManager,
    info: &BtreeInfo,
    root: BlockId,
    keys: &[u64],
) -> Result<(BlockId, bool)> {
    debug_assert_eq!(keys.len(), info.levels);

    let mut spine = ShadowSpine::new(tm);
    let mut block = root;
    let mut removed = false;
    let mut link_index: Option<usize> = None;
    for level in 0..info.levels {
        let last = level + 1 == info.levels;
        let vt = if last {
            info.value_type
        } else {
            internal_value_type()
        };
        match remove_raw(&mut spine, &vt, block, keys[level], link_index)? {
            None => {
                removed = false;
                break;
            }
            Some(index) => {
                if last {
                    let value = spine.current_node()?.value(index, vt.size).to_vec();
                    if let Some(del) = vt.del {
                        del(spine.tm(), &value)?;
                    }
                    let mut nm = NodeMut::new(spine.current_mut().data_mut())?;
                    nm.remove_at(index, vt.size);
                    removed = true;
                } else {
                    block = BlockId(spine.current_node()?.value_u64(index));
                }
                link_index = Some(index);
            }
        }
    }
    let new_root = spine.exit()?;
    Ok((new_root, removed))
}

/// Descend to the leaf for `key`, rebalancing thin children on the way so no
/// node on the path can underflow. Returns the leaf index of `key`, or
/// `None` if absent.
fn remove_raw(
    spine: &mut ShadowSpine<'_>,
    vt: &ValueType,
    mut block: BlockId,
    key: u64,
    mut parent_index: Option<usize>,
) -> Result<Option<usize>> {
    loop {
        spine.step(vt, block, parent_index)?;

        loop {
            let (is_leaf, nr) = {
                let n = spine.current_node()?;
                (n.is_leaf(), n.nr_entries())
            };
            if is_leaf {
                let n = spine.current_node()?;
                return Ok(match n.lower_bound(key) {
                    Some(i) if n.key(i) == key => Some(i),
                    _ => None,
                });
            }
            if nr == 1 {
                collapse_single_child(spine, vt)?;
                continue;
            }
            rebalance_children(spine, vt, key)?;
            break;
        }

        let (bound, child) = {
            let n = spine.current_node()?;
            let bound = n.lower_bound(key);
            let child = bound.map(|i| n.value_u64(i));
            (bound, child)
        };
        let Some(i) = bound else {
            return Ok(None);
        };
        block = BlockId(child.unwrap_or_default());
        parent_index = Some(i);
    }
}

/// An internal node with a single child absorbs it, shrinking the tree by
/// one level.
fn collapse_single_child(spine: &mut ShadowSpine<'_>, vt: &ValueType) -> Result<()> {
    let child_loc = BlockId(spine.current_node()?.value_u64(0));
    let validator = Arc::clone(spine.tm_ref().node_validator());
    let (child, inc) = spine.tm().shadow_block(child_loc, &validator)?;
    if inc {
        inc_children(spine.tm(), &child, vt)?;
    }
    let bytes = child.data().to_vec();
    let shadow_loc = child.location();
    spine.tm().unlock(child)?;
    spine.current_mut().data_mut().copy_from_slice(&bytes);
    spine.tm().dec(shadow_loc)?;
    trace!(
        target: "hcache::pdata::btree",
        event = "collapse_root",
        absorbed = shadow_loc.0
    );
    Ok(())
}

fn peek_node(tm: &TransactionManager, loc: BlockId) -> Result<(usize, usize)> {
    let validator = Arc::clone(tm.node_validator());
    let block = tm.read_lock(loc, &validator)?;
    let out = {
        let n = Node::new(block.data())?;
        (n.nr_entries(), n.max_entries())
    };
    tm.unlock(block)?;
    Ok(out)
}

/// If the child we are about to descend into is thin (<= ceil(max/3)
/// entries), merge it with a sibling when the pair fits in one node, else
/// redistribute entries evenly, taking from the larger sibling.
fn rebalance_children(spine: &mut ShadowSpine<'_>, vt: &ValueType, key: u64) -> Result<()> {
    let (child_index, nr_parent, child_loc) = {
        let n = spine.current_node()?;
        let Some(i) = n.lower_bound(key) else {
            return Ok(());
        };
        (i, n.nr_entries(), BlockId(n.value_u64(i)))
    };

    let (child_nr, child_max) = peek_node(spine.tm_ref(), child_loc)?;
    let threshold = child_max.div_ceil(3);
    if child_nr > threshold {
        return Ok(());
    }

    let left_loc = if child_index > 0 {
        let n = spine.current_node()?;
        Some(BlockId(n.value_u64(child_index - 1)))
    } else {
        None
    };
    let right_loc = if child_index + 1 < nr_parent {
        let n = spine.current_node()?;
        Some(BlockId(n.value_u64(child_index + 1)))
    } else {
        None
    };

    let left_nr = match left_loc {
        Some(loc) => Some(peek_node(spine.tm_ref(), loc)?.0),
        None => None,
    };
    let right_nr = match right_loc {
        Some(loc) => Some(peek_node(spine.tm_ref(), loc)?.0),
        None => None,
    };

    // Prefer a sibling the child can merge with; otherwise redistribute with
    // the larger sibling.
    let use_left = match (left_nr, right_nr) {
        (Some(l), Some(r)) => {
            if child_nr + l.min(r) <= child_max {
                l <= r
            } else {
                l > r
            }
        }
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => return Ok(()),
    };

    let (l_index, l_loc, l_nr, r_loc, r_nr) = if use_left {
        (
            child_index - 1,
            left_loc.unwrap_or(child_loc),
            left_nr.unwrap_or(0),
            child_loc,
            child_nr,
        )
    } else {
        (
            child_index,
            child_loc,
            child_nr,
            right_loc.unwrap_or(child_loc),
            right_nr.unwrap_or(0),
        )
    };

    let validator = Arc::clone(spine.tm_ref().node_validator());
    let (mut l_block, l_inc) = spine.tm().shadow_block(l_loc, &validator)?;
    if l_inc {
        inc_children(spine.tm(), &l_block, vt)?;
    }
    {
        let mut pm = NodeMut::new(spine.current_mut().data_mut())?;
        pm.set_value(l_index, &l_block.location().0.to_le_bytes(), 8);
    }
    let (mut r_block, r_inc) = spine.tm().shadow_block(r_loc, &validator)?;
    if r_inc {
        inc_children(spine.tm(), &r_block, vt)?;
    }
    {
        let mut pm = NodeMut::new(spine.current_mut().data_mut())?;
        pm.set_value(l_index + 1, &r_block.location().0.to_le_bytes(), 8);
    }

    let vsize = {
        let n = Node::new(l_block.data())?;
        if n.is_leaf() {
            vt.size
        } else {
            8
        }
    };

    if l_nr + r_nr <= child_max {
        // Merge right into left and drop the right node.
        {
            let r_node = Node::new(r_block.data())?;
            let mut lm = NodeMut::new(l_block.data_mut())?;
            lm.copy_entries(l_nr, &r_node, 0, r_nr, vsize);
            lm.set_nr_entries(l_nr + r_nr);
        }
        let r_shadow_loc = r_block.location();
        spine.tm().unlock(r_block)?;
        spine.tm().unlock(l_block)?;
        {
            let mut pm = NodeMut::new(spine.current_mut().data_mut())?;
            pm.remove_at(l_index + 1, 8);
        }
        spine.tm().dec(r_shadow_loc)?;
        trace!(
            target: "hcache::pdata::btree",
            event = "rebalance_merge",
            survivor = l_loc.0
        );
    } else {
        // Redistribute evenly; the larger side keeps the odd entry.
        let total = l_nr + r_nr;
        let target_l = if l_nr >= r_nr {
            total - total / 2
        } else {
            total / 2
        };
        if l_nr > target_l {
            move_to_right(&mut l_block, &mut r_block, l_nr - target_l, vsize)?;
        } else if l_nr < target_l {
            move_to_left(&mut l_block, &mut r_block, target_l - l_nr, vsize)?;
        }
        let new_right_key = Node::new(r_block.data())?.key(0);
        spine.tm().unlock(l_block)?;
        spine.tm().unlock(r_block)?;
        {
            let mut pm = NodeMut::new(spine.current_mut().data_mut())?;
            pm.set_key(l_index + 1, new_right_key);
        }
        trace!(
            target: "hcache::pdata::btree",
            event = "rebalance_redistribute",
            left = l_loc.0,
            right = r_loc.0
        );
    }
    Ok(())
}

/// Move the last `count` entries of `l` to the front of `r`.
fn move_to_right(l: &mut Block, r: &mut Block, count: usize, vsize: usize) -> Result<()> {
    let l_nr = Node::new(l.data())?.nr_entries();
    let r_nr = Node::new(r.data())?.nr_entries();
    {
        let mut rm = NodeMut::new(r.data_mut())?;
        // Shift existing right entries out of the way, back to front.
        for i in (0..r_nr).rev() {
            let k = rm.as_ref().key(i);
            rm.set_key(i + count, k);
            let v = rm.as_ref().value(i, vsize).to_vec();
            rm.set_value(i + count, &v, vsize);
        }
        let l_node = Node::new(l.data())?;
        rm.copy_entries(0, &l_node, l_nr - count, count, vsize);
        rm.set_nr_entries(r_nr + count);
    }
    let mut lm = NodeMut::new(l.data_mut())?;
    lm.set_nr_entries(l_nr - count);
    Ok(())
}

/// Move the first `count` entries of `r` to the tail of `l`.
fn move_to_left(l: &mut Block, r: &mut Block, count: usize, vsize: usize) -> Result<()> {
    let l_nr = Node::new(l.data())?.nr_entries();
    let r_nr = Node::new(r.data())?.nr_entries();
    {
        let r_node = Node::new(r.data())?;
        let mut lm = NodeMut::new(l.data_mut())?;
        lm.copy_entries(l_nr, &r_node, 0, count, vsize);
        lm.set_nr_entries(l_nr + count);
    }
    let mut rm = NodeMut::new(r.data_mut())?;
    for i in 0..r_nr - count {
        let k = rm.as_ref().key(i + count);
        rm.set_key(i, k);
        let v = rm.as_ref().value(i + count, vsize).to_vec();
        rm.set_value(i, &v, vsize);
    }
    rm.set_nr_entries(r_nr - count);
    Ok(())
}

/// Exact-match lookup through every level.
pub fn lookup(
    tm: &dyn TmRead,
    info: &BtreeInfo,
    root: BlockId,
    keys: &[u64],
) -> Result<Vec<u8>> {
    debug_assert_eq!(keys.len(), info.levels);
    let mut root = root;
    for level in 0..info.levels {
        let last = level + 1 == info.levels;
        let vsize = leaf_value_size(info, level);
        let value = lookup_raw(tm, root, keys[level], vsize)?;
        if last {
            return Ok(value);
        }
        root = BlockId(read_le_u64(&value, 0).map_err(|e| HcError::Format(e.to_string()))?);
    }
    Err(HcError::Format("btree with zero levels".to_owned()))
}

fn lookup_raw(tm: &dyn TmRead, root: BlockId, key: u64, vsize: usize) -> Result<Vec<u8>> {
    let mut spine = RoSpine::new(tm);
    let mut block = root;
    loop {
        spine.step(block)?;
        let mut found: Option<Vec<u8>> = None;
        {
            let n = Node::new(spine.current().data())?;
            let Some(i) = n.lower_bound(key) else {
                return Err(HcError::NotFound(format!("key {key}")));
            };
            if n.is_leaf() {
                if n.key(i) != key {
                    return Err(HcError::NotFound(format!("key {key}")));
                }
                found = Some(n.value(i, vsize).to_vec());
            } else {
                block = BlockId(n.value_u64(i));
            }
        }
        if let Some(value) = found {
            spine.exit()?;
            return Ok(value);
        }
    }
}

/// In-order traversal of one tree, invoking `visit` for each leaf entry.
/// Takes read locks only, so it is safe against concurrent writers.
pub fn walk(
    tm: &dyn TmRead,
    root: BlockId,
    value_size: usize,
    visit: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
) -> Result<()> {
    let validator = Arc::clone(tm.node_validator());
    let block = tm.read_lock(root, &validator)?;
    let result = walk_node(tm, &block, value_size, visit);
    let unlock = tm.unlock(block);
    result.and(unlock)
}

fn walk_node(
    tm: &dyn TmRead,
    block: &Block,
    value_size: usize,
    visit: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
) -> Result<()> {
    let n = Node::new(block.data())?;
    if n.is_internal() {
        for i in 0..n.nr_entries() {
            walk(tm, BlockId(n.value_u64(i)), value_size, visit)?;
        }
    } else {
        for i in 0..n.nr_entries() {
            visit(n.key(i), n.value(i, value_size))?;
        }
    }
    Ok(())
}

/// Release every block owned by the tree at `root`. Shared subtrees lose one
/// reference; exclusively owned nodes recurse.
pub fn del(tm: &mut TransactionManager, info: &BtreeInfo, root: BlockId) -> Result<()> {
    del_level(tm, info, root, 0)
}

enum DelKids {
    Internal(Vec<BlockId>),
    Subtrees(Vec<BlockId>),
    Values(Vec<Vec<u8>>),
}

fn del_level(
    tm: &mut TransactionManager,
    info: &BtreeInfo,
    root: BlockId,
    level: usize,
) -> Result<()> {
    if tm.ref_count(root)? > 1 {
        return tm.dec(root);
    }

    let last = level + 1 == info.levels;
    let vsize = leaf_value_size(info, level);
    let validator = Arc::clone(tm.node_validator());
    let block = tm.read_lock(root, &validator)?;
    let kids = {
        let n = Node::new(block.data())?;
        if n.is_internal() {
            DelKids::Internal((0..n.nr_entries()).map(|i| BlockId(n.value_u64(i))).collect())
        } else if !last {
            DelKids::Subtrees((0..n.nr_entries()).map(|i| BlockId(n.value_u64(i))).collect())
        } else {
            DelKids::Values(
                (0..n.nr_entries())
                    .map(|i| n.value(i, vsize).to_vec())
                    .collect(),
            )
        }
    };
    tm.unlock(block)?;

    match kids {
        DelKids::Internal(children) => {
            for child in children {
                del_level(tm, info, child, level)?;
            }
        }
        DelKids::Subtrees(roots) => {
            for child in roots {
                del_level(tm, info, child, level + 1)?;
            }
        }
        DelKids::Values(values) => {
            if let Some(del_fn) = info.value_type.del {
                for value in values {
                    del_fn(tm, &value)?;
                }
            }
        }
    }
    tm.dec(root)
}
