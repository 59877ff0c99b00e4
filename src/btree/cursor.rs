//! A forward cursor over leaf slots, for range scans (spec §4.1.4).
//!
//! Positioned by a starting key (or the first leaf for an unbounded
//! scan), it then walks leaf-to-leaf via the double-linked leaf chain
//! ([`NodePage::next_leaf`]) rather than re-descending the tree for
//! every slot.

use crate::error::{Result, StorageError};
use crate::types::{FieldValue, ObjectId, PageId};

use super::tree::BTree;

/// One tuple's worth of cursor output: its decoded key and its value
/// object ID.
pub struct ScanEntry {
    pub key: Vec<FieldValue>,
    pub value: ObjectId,
}

pub struct Cursor<'a> {
    tree: &'a BTree,
    leaf: Option<PageId>,
    index: usize,
}

impl<'a> Cursor<'a> {
    /// A cursor positioned at the first slot of the tree, for an
    /// unbounded forward scan.
    pub fn first(tree: &'a BTree) -> Result<Self> {
        let leaf = tree.first_leaf()?;
        Ok(Self { tree, leaf, index: 0 })
    }

    /// A cursor positioned at the first slot whose key is `>= key`.
    pub fn seek(tree: &'a BTree, key: &[FieldValue]) -> Result<Self> {
        let path = tree.descend(key)?;
        let leaf_id = match path.last() {
            Some(id) => *id,
            None => return Ok(Self { tree, leaf: None, index: 0 }),
        };
        let idx = tree.leaf_lower_bound(leaf_id, key)?;
        let count = tree.leaf_cell_count(leaf_id)?;
        if idx >= count {
            let next = tree.leaf_next(leaf_id)?;
            let leaf = if next.is_valid() { Some(next) } else { None };
            Ok(Self { tree, leaf, index: 0 })
        } else {
            Ok(Self {
                tree,
                leaf: Some(leaf_id),
                index: idx,
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.leaf.is_some()
    }

    /// The entry at the cursor's current position, without advancing.
    pub fn current(&self) -> Result<Option<ScanEntry>> {
        let leaf = match self.leaf {
            Some(id) => id,
            None => return Ok(None),
        };
        let cell = self.tree.leaf_cell(leaf, self.index)?;
        let key = self.tree.decode_cell_key(&cell)?;
        let value = cell
            .value()
            .ok_or_else(|| StorageError::corruption("leaf cell missing a value payload"))?;
        Ok(Some(ScanEntry { key, value }))
    }

    /// Advance to the next slot, crossing into the following leaf when
    /// the current one is exhausted. Returns whether the cursor is still
    /// valid after advancing.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        let leaf = match self.leaf {
            Some(id) => id,
            None => return Ok(false),
        };
        self.index += 1;
        let count = self.tree.leaf_cell_count(leaf)?;
        if self.index >= count {
            let next = self.tree.leaf_next(leaf)?;
            self.leaf = if next.is_valid() { Some(next) } else { None };
            self.index = 0;
        }
        Ok(self.leaf.is_some())
    }
}
