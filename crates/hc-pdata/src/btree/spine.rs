//! Spines: the rolling pair of locks held during a B-tree descent.
//!
//! A descent never holds more than (parent, current). The read-only spine
//! takes read locks; the shadow spine shadows every node it visits and
//! patches the parent's child pointer to the shadow's new location. Both
//! release whatever they still hold when they go out of scope, success or
//! failure.

use crate::btree::node::{Node, NodeMut};
use crate::btree::{inc_children, ValueType};
use crate::tm::{TmRead, TransactionManager};
use hc_block::Block;
use hc_error::Result;
use hc_types::BlockId;
use std::sync::Arc;

/// Read-locked descent holding at most two nodes.
pub(crate) struct RoSpine<'a> {
    tm: &'a dyn TmRead,
    nodes: Vec<Block>,
}

impl<'a> RoSpine<'a> {
    pub fn new(tm: &'a dyn TmRead) -> Self {
        Self {
            tm,
            nodes: Vec::with_capacity(2),
        }
    }

    pub fn step(&mut self, b: BlockId) -> Result<()> {
        if self.nodes.len() == 2 {
            let oldest = self.nodes.remove(0);
            self.tm.unlock(oldest)?;
        }
        let validator = Arc::clone(self.tm.node_validator());
        let block = self.tm.read_lock(b, &validator)?;
        self.nodes.push(block);
        Ok(())
    }

    pub fn current(&self) -> &Block {
        self.nodes.last().expect("empty ro spine")
    }

    pub fn exit(mut self) -> Result<()> {
        while let Some(block) = self.nodes.pop() {
            self.tm.unlock(block)?;
        }
        Ok(())
    }
}

impl Drop for RoSpine<'_> {
    fn drop(&mut self) {
        while let Some(block) = self.nodes.pop() {
            let _ = self.tm.unlock(block);
        }
    }
}

/// Shadowing descent: every visited node is copied-on-write, and the parent's
/// pointer to it is rewritten to the shadow's location.
pub(crate) struct ShadowSpine<'a> {
    tm: &'a mut TransactionManager,
    nodes: Vec<Block>,
    root: BlockId,
}

impl<'a> ShadowSpine<'a> {
    pub fn new(tm: &'a mut TransactionManager) -> Self {
        Self {
            tm,
            nodes: Vec::with_capacity(2),
            root: BlockId(0),
        }
    }

    /// Shadow `b` and make it the current node. `parent_index` is the entry
    /// in the previous node through which we descended; its value is patched
    /// to the shadow's location.
    pub fn step(&mut self, vt: &ValueType, b: BlockId, parent_index: Option<usize>) -> Result<()> {
        if self.nodes.len() == 2 {
            let oldest = self.nodes.remove(0);
            self.tm.unlock(oldest)?;
        }

        let validator = Arc::clone(self.tm.node_validator());
        let (block, inc) = self.tm.shadow_block(b, &validator)?;
        if inc {
            inc_children(self.tm, &block, vt)?;
        }

        if let (Some(index), Some(parent)) = (parent_index, self.nodes.last_mut()) {
            let mut parent_node = NodeMut::new(parent.data_mut())?;
            parent_node.set_value(index, &block.location().0.to_le_bytes(), 8);
        }

        if self.nodes.is_empty() {
            self.root = block.location();
        }
        self.nodes.push(block);
        Ok(())
    }

    pub fn has_parent(&self) -> bool {
        self.nodes.len() == 2
    }

    pub fn current(&self) -> &Block {
        self.nodes.last().expect("empty shadow spine")
    }

    pub fn current_mut(&mut self) -> &mut Block {
        self.nodes.last_mut().expect("empty shadow spine")
    }

    pub fn parent_mut(&mut self) -> &mut Block {
        debug_assert!(self.has_parent());
        &mut self.nodes[0]
    }

    /// Replace the current node with `block`, unlocking the old one. Used by
    /// sibling splits to keep the half that contains the search key.
    pub fn replace_current(&mut self, block: Block) -> Result<()> {
        let old = self.nodes.pop().expect("empty shadow spine");
        self.tm.unlock(old)?;
        if self.nodes.is_empty() {
            self.root = block.location();
        }
        self.nodes.push(block);
        Ok(())
    }

    pub fn tm(&mut self) -> &mut TransactionManager {
        self.tm
    }

    pub fn tm_ref(&self) -> &TransactionManager {
        self.tm
    }

    /// Read-only view of the current node.
    pub fn current_node(&self) -> Result<Node<'_>> {
        Node::new(self.current().data())
    }

    #[must_use]
    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn exit(mut self) -> Result<BlockId> {
        while let Some(block) = self.nodes.pop() {
            self.tm.unlock(block)?;
        }
        Ok(self.root)
    }
}

impl Drop for ShadowSpine<'_> {
    fn drop(&mut self) {
        while let Some(block) = self.nodes.pop() {
            let _ = self.tm.unlock(block);
        }
    }
}
