//! Structural verification: re-establishes every B+-tree invariant from
//! on-disk state without attempting repair (spec §4.5).
//!
//! The tree and value file otherwise trust their own bookkeeping (parent
//! hints, tuple counts, back-links); this module re-derives it all from
//! the page contents and compares. It never repairs what it finds.

use std::cmp::Ordering;
use std::fmt;

use crate::btree::{BTree, PageSnapshot};
use crate::error::{Result, StorageError};
use crate::types::{FieldValue, ObjectId, PageId, Schema, Uniqueness};
use crate::valuefile::ValueFile;

/// One structural inconsistency found during a verify pass.
#[derive(Debug, Clone)]
pub enum Inconsistency {
    /// Two adjacent slots in a page do not compare non-decreasing.
    Ordering { page: PageId, index: usize },
    /// An internal slot's key does not equal its child's last key.
    Delegate { parent: PageId, slot: usize, child: PageId },
    /// A leaf boundary crosses parents without sitting at the last/first
    /// slot of its respective parent.
    LeafLinkage { left: PageId, right: PageId },
    /// The walked leaf-slot total does not match the header's tuple count.
    TupleCount { header: u64, counted: u64 },
    /// The top leaf has a predecessor, or the last leaf has a successor.
    LeafChainEnd { leaf: PageId, which: &'static str },
    /// The empty-tree invariant does not hold.
    EmptyTree { tree_depth: u32 },
    /// Two tuples compare equal (or, under `TupleUnique`, have equal
    /// value tuples) where the schema's uniqueness mode forbids it.
    Uniqueness { leaf: PageId, index: usize, mode: Uniqueness },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::Ordering { page, index } => {
                write!(f, "page {page} slot {index} is not ordered before its successor")
            }
            Inconsistency::Delegate { parent, slot, child } => {
                write!(f, "parent {parent} slot {slot} does not match child {child}'s last key")
            }
            Inconsistency::LeafLinkage { left, right } => {
                write!(f, "leaves {left} and {right} cross a parent boundary off the edge slots")
            }
            Inconsistency::TupleCount { header, counted } => {
                write!(f, "header tuple count {header} does not match counted {counted}")
            }
            Inconsistency::LeafChainEnd { leaf, which } => {
                write!(f, "leaf {leaf} unexpectedly has a {which}")
            }
            Inconsistency::EmptyTree { tree_depth } => {
                write!(f, "empty-tree invariant violated: tree_depth = {tree_depth}")
            }
            Inconsistency::Uniqueness { leaf, index, mode } => {
                write!(f, "leaf {leaf} slot {index} violates {mode:?} uniqueness")
            }
        }
    }
}

/// An abstract sink the verifier reports inconsistencies to, owned by the
/// caller rather than the engine.
pub trait VerifyProgress {
    fn report(&mut self, issue: Inconsistency);
}

/// A [`VerifyProgress`] that just collects every issue reported.
#[derive(Default)]
pub struct CollectingProgress {
    pub issues: Vec<Inconsistency>,
}

impl VerifyProgress for CollectingProgress {
    fn report(&mut self, issue: Inconsistency) {
        log::error!("verify: {issue}");
        self.issues.push(issue);
    }
}

/// Walk the whole index, reporting every inconsistency found to
/// `progress`. Returns whether the index was found fully consistent.
pub fn verify(tree: &BTree, values: &ValueFile, progress: &mut dyn VerifyProgress) -> Result<bool> {
    let mut ok = true;

    match tree.root_page_id() {
        None => {
            if tree.tuple_count() != 0 || tree.tree_depth() != 0 {
                progress.report(Inconsistency::EmptyTree { tree_depth: tree.tree_depth() });
                ok = false;
            }
            return Ok(ok);
        }
        Some(root_id) => {
            ok &= verify_subtree(tree, root_id, progress)?;
        }
    }

    ok &= verify_leaf_chain(tree, values, progress)?;
    Ok(ok)
}

/// Ordering within every page, and the delegate-key invariant between a
/// parent slot and its child's last key.
fn verify_subtree(tree: &BTree, page_id: PageId, progress: &mut dyn VerifyProgress) -> Result<bool> {
    let mut ok = true;
    let snapshot = tree.snapshot(page_id)?;
    ok &= verify_ordering(tree, page_id, &snapshot, progress)?;

    if !snapshot.is_leaf {
        for (slot, cell) in snapshot.cells.iter().enumerate() {
            let child = match cell.child() {
                Some(c) => c,
                None => continue,
            };
            let child_snapshot = tree.snapshot(child)?;
            if let Some(last_cell) = child_snapshot.cells.last() {
                if cell.key != last_cell.key {
                    progress.report(Inconsistency::Delegate { parent: page_id, slot, child });
                    ok = false;
                }
            }
            ok &= verify_subtree(tree, child, progress)?;
        }
    }
    Ok(ok)
}

fn verify_ordering(
    tree: &BTree,
    page_id: PageId,
    snapshot: &PageSnapshot,
    progress: &mut dyn VerifyProgress,
) -> Result<bool> {
    let mut ok = true;
    let mut prev: Option<Vec<FieldValue>> = None;
    for (index, cell) in snapshot.cells.iter().enumerate() {
        let key = tree.decode_cell_key(cell)?;
        if let Some(prev_key) = &prev {
            if tree.schema().compare_keys(prev_key, &key) == Ordering::Greater {
                progress.report(Inconsistency::Ordering { page: page_id, index: index - 1 });
                ok = false;
            }
        }
        prev = Some(key);
    }
    Ok(ok)
}

/// Leaf-to-leaf pass: chain-end conditions, ordering/uniqueness across
/// every adjacent pair of tuples (including across a leaf boundary), the
/// parent-slot-edge condition for leaves split across different parents,
/// and the leaf-count-vs-tuple_count invariant.
fn verify_leaf_chain(tree: &BTree, values: &ValueFile, progress: &mut dyn VerifyProgress) -> Result<bool> {
    let mut ok = true;

    let top = tree.top_leaf_id();
    if top.is_valid() && tree.leaf_prev(top)?.is_valid() {
        progress.report(Inconsistency::LeafChainEnd { leaf: top, which: "predecessor" });
        ok = false;
    }
    let last = tree.last_leaf_id();
    if last.is_valid() && tree.leaf_next(last)?.is_valid() {
        progress.report(Inconsistency::LeafChainEnd { leaf: last, which: "successor" });
        ok = false;
    }

    let mut counted: u64 = 0;
    let mut running_prev: Option<(Vec<FieldValue>, ObjectId)> = None;
    let mut boundary_prev: Option<(PageId, PageId)> = None;

    let mut current = tree.first_leaf()?;
    while let Some(leaf_id) = current {
        let snapshot = tree.snapshot(leaf_id)?;
        counted += snapshot.cells.len() as u64;

        if let Some((prev_leaf_id, prev_parent)) = boundary_prev {
            if prev_parent != snapshot.parent {
                let left_ok = is_last_child_slot(tree, prev_parent, prev_leaf_id)?;
                let right_ok = is_first_child_slot(tree, snapshot.parent, leaf_id)?;
                if !(left_ok && right_ok) {
                    progress.report(Inconsistency::LeafLinkage { left: prev_leaf_id, right: leaf_id });
                    ok = false;
                }
            }
        }

        for (index, cell) in snapshot.cells.iter().enumerate() {
            let key = tree.decode_cell_key(cell)?;
            let value = cell
                .value()
                .ok_or_else(|| StorageError::corruption("leaf cell missing a value payload"))?;
            if let Some((prev_key, prev_value)) = &running_prev {
                ok &= check_pair(tree, values, prev_key, *prev_value, &key, value, leaf_id, index, progress)?;
            }
            running_prev = Some((key, value));
        }

        boundary_prev = Some((leaf_id, snapshot.parent));
        let next = tree.leaf_next(leaf_id)?;
        current = if next.is_valid() { Some(next) } else { None };
    }

    if counted != tree.tuple_count() {
        progress.report(Inconsistency::TupleCount { header: tree.tuple_count(), counted });
        ok = false;
    }

    Ok(ok)
}

fn is_last_child_slot(tree: &BTree, parent: PageId, child: PageId) -> Result<bool> {
    if !parent.is_valid() {
        return Ok(true);
    }
    let snapshot = tree.snapshot(parent)?;
    Ok(snapshot.cells.last().and_then(|c| c.child()) == Some(child))
}

fn is_first_child_slot(tree: &BTree, parent: PageId, child: PageId) -> Result<bool> {
    if !parent.is_valid() {
        return Ok(true);
    }
    let snapshot = tree.snapshot(parent)?;
    Ok(snapshot.cells.first().and_then(|c| c.child()) == Some(child))
}

#[allow(clippy::too_many_arguments)]
fn check_pair(
    tree: &BTree,
    values: &ValueFile,
    prev_key: &[FieldValue],
    prev_value: ObjectId,
    key: &[FieldValue],
    value: ObjectId,
    leaf_id: PageId,
    index: usize,
    progress: &mut dyn VerifyProgress,
) -> Result<bool> {
    let schema = tree.schema();
    match schema.compare_keys(prev_key, key) {
        Ordering::Greater => {
            progress.report(Inconsistency::Ordering { page: leaf_id, index });
            Ok(false)
        }
        Ordering::Equal => match schema.uniqueness {
            Uniqueness::NotUnique => Ok(true),
            Uniqueness::KeyUnique => {
                progress.report(Inconsistency::Uniqueness {
                    leaf: leaf_id,
                    index,
                    mode: Uniqueness::KeyUnique,
                });
                Ok(false)
            }
            Uniqueness::TupleUnique => {
                if tuple_unique_conflict(schema, values, prev_value, value)? {
                    progress.report(Inconsistency::Uniqueness {
                        leaf: leaf_id,
                        index,
                        mode: Uniqueness::TupleUnique,
                    });
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        },
        Ordering::Less => Ok(true),
    }
}

fn tuple_unique_conflict(schema: &Schema, values: &ValueFile, a: ObjectId, b: ObjectId) -> Result<bool> {
    let ra = values.read(schema, a)?;
    let rb = values.read(schema, b)?;
    if ra.values.iter().any(FieldValue::is_null) || rb.values.iter().any(FieldValue::is_null) {
        return Ok(false);
    }
    Ok(ra.values == rb.values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskManagerImpl, FileInformation};
    use crate::types::{FieldDescriptor, FieldType, FieldValue as FV};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn schema(uniqueness: Uniqueness) -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 32 }),
            ],
            1,
            uniqueness,
        )
    }

    fn open(dir: &std::path::Path, uniqueness: Uniqueness) -> (BTree, ValueFile) {
        let disk = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.join("tree.db"), false).unwrap());
        let tree = BTree::open(disk, 64, schema(uniqueness));
        let values = ValueFile::open(&dir.join("value.dat"), 64, false).unwrap();
        (tree, values)
    }

    #[test]
    fn empty_tree_is_consistent() {
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), Uniqueness::KeyUnique);
        let mut progress = CollectingProgress::default();
        assert!(verify(&tree, &values, &mut progress).unwrap());
        assert!(progress.issues.is_empty());
    }

    #[test]
    fn consistent_after_inserts_and_deletes() {
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), Uniqueness::KeyUnique);
        for i in 0..200i32 {
            let id = values
                .insert(tree.schema(), PageId::INVALID, 0, &[FV::String(format!("v{i}"))])
                .unwrap();
            tree.insert(&[FV::Int32(i)], id, None).unwrap();
        }
        for i in (0..200i32).step_by(2) {
            let id = tree.delete(&[FV::Int32(i)], None).unwrap();
            values.expunge(tree.schema(), id).unwrap();
        }
        let mut progress = CollectingProgress::default();
        let ok = verify(&tree, &values, &mut progress).unwrap();
        assert!(ok, "unexpected issues: {:?}", progress.issues.iter().map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn tuple_unique_violation_bypassed_at_tree_level_is_caught() {
        // `BTree::insert` only enforces `KeyUnique`; under `TupleUnique`
        // the facade is responsible for rejecting a duplicate tuple
        // before it reaches the tree. Inserting straight through the
        // tree, as done here, bypasses that check entirely, and the
        // verifier should flag the resulting pair of equal tuples.
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), Uniqueness::TupleUnique);
        let id_a = values
            .insert(tree.schema(), PageId::INVALID, 0, &[FV::String("dup".into())])
            .unwrap();
        let id_b = values
            .insert(tree.schema(), PageId::INVALID, 0, &[FV::String("dup".into())])
            .unwrap();
        tree.insert(&[FV::Int32(1)], id_a, None).unwrap();
        tree.insert(&[FV::Int32(1)], id_b, None).unwrap();

        let mut progress = CollectingProgress::default();
        let ok = verify(&tree, &values, &mut progress).unwrap();
        assert!(!ok);
        assert!(progress
            .issues
            .iter()
            .any(|i| matches!(i, Inconsistency::Uniqueness { mode: Uniqueness::TupleUnique, .. })));
    }
}
