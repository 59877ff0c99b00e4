//! The `Index` facade: wires the Tree file's ordering (`btree::BTree`)
//! to the Value file's tuple storage (`valuefile::ValueFile`) behind one
//! schema-aware map from key tuple to value tuple (spec §2 "the two
//! files together form one logical index", §4.1.4).

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::btree::{BTree, Cursor};
use crate::error::{Result, StorageError};
use crate::estimate::{self, Estimate};
use crate::storage::{DiskManagerImpl, FileInformation};
use crate::types::{FieldValue, Schema, Uniqueness};
use crate::valuefile::ValueFile;
use crate::verify::{self, VerifyProgress};

/// How an `Index` is opened: file paths, buffer pool sizes, durability,
/// the schema it enforces, and the planner calibration constant its
/// cost estimates use.
#[derive(Clone)]
pub struct IndexConfig {
    pub tree_path: PathBuf,
    pub value_path: PathBuf,
    pub schema: Schema,
    pub tree_buffer_pool_size: usize,
    pub value_buffer_pool_size: usize,
    pub sync_on_write: bool,
    /// Planner calibration constant for `estimate()` (spec §4.6
    /// "file-to-memory-bytes-per-second ... read from a shared
    /// configuration source").
    pub file_to_memory_bytes_per_second: u64,
}

impl IndexConfig {
    /// An index rooted at `dir`, holding the Tree file and Value file in
    /// separate subdirectories beneath it (spec §6 "one subdirectory per
    /// side, named for it").
    pub fn new(dir: impl AsRef<Path>, schema: Schema) -> Self {
        let dir = dir.as_ref();
        Self {
            tree_path: dir.join("Tree").join("index.db"),
            value_path: dir.join("Value").join("index.dat"),
            schema,
            tree_buffer_pool_size: 256,
            value_buffer_pool_size: 256,
            sync_on_write: false,
            file_to_memory_bytes_per_second: 50_000_000,
        }
    }

    pub fn buffer_pool_sizes(mut self, tree: usize, value: usize) -> Self {
        self.tree_buffer_pool_size = tree;
        self.value_buffer_pool_size = value;
        self
    }

    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    pub fn file_to_memory_bytes_per_second(mut self, bytes_per_second: u64) -> Self {
        self.file_to_memory_bytes_per_second = bytes_per_second;
        self
    }
}

/// Summary counters for introspection and tooling.
#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub tuple_count: u64,
    pub tree_depth: u32,
    pub tree_page_count: usize,
    pub value_page_count: usize,
}

/// An open index: the Tree file half (ordering, structure) plus the
/// Value file half (tuple storage), presented as one schema-aware map.
pub struct Index {
    tree: BTree,
    values: ValueFile,
    schema: Schema,
    bytes_per_second: u64,
}

impl Index {
    pub fn open(config: IndexConfig) -> Result<Self> {
        if let Some(parent) = config.tree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = config.value_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let disk = Arc::new(DiskManagerImpl::<FileInformation>::open(
            &config.tree_path,
            config.sync_on_write,
        )?);
        let tree = BTree::open(disk, config.tree_buffer_pool_size, config.schema.clone());
        let values = ValueFile::open(&config.value_path, config.value_buffer_pool_size, config.sync_on_write)?;
        Ok(Self {
            tree,
            values,
            schema: config.schema,
            bytes_per_second: config.file_to_memory_bytes_per_second,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn tuple_count(&self) -> u64 {
        self.tree.tuple_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn contains(&self, key: &[FieldValue]) -> Result<bool> {
        Ok(self.tree.get(key)?.is_some())
    }

    pub fn get(&self, key: &[FieldValue]) -> Result<Option<Vec<FieldValue>>> {
        match self.tree.get(key)? {
            Some(id) => Ok(Some(self.values.read(&self.schema, id)?.values)),
            None => Ok(None),
        }
    }

    /// Insert `key -> value` (spec §4.1.1). `KeyUnique` is enforced
    /// inside the tree itself; `TupleUnique` additionally needs the
    /// candidate's value fields, which the tree never sees, so it is
    /// checked here by scanning every existing entry with an equal key
    /// (duplicate keys are adjacent, never deduplicated, under
    /// `TupleUnique`) before writing anything.
    pub fn insert(&self, key: &[FieldValue], value: &[FieldValue]) -> Result<()> {
        if self.schema.uniqueness == Uniqueness::TupleUnique && self.tuple_unique_conflict(key, value)? {
            return Err(StorageError::UniquenessViolation {
                mode: Uniqueness::TupleUnique,
            });
        }

        let id = self
            .values
            .insert(&self.schema, crate::types::PageId::INVALID, 0, value)?;
        if let Err(e) = self.tree.insert(key, id, Some(&self.values)) {
            self.values.expunge(&self.schema, id).ok();
            return Err(e);
        }
        Ok(())
    }

    /// Replace a tuple's value fields in place, leaving its key (and
    /// thus its position in the tree) untouched — the in-place rewrite
    /// path of spec §4.1.4, always available when the key itself does
    /// not move.
    pub fn update(&self, key: &[FieldValue], new_value: &[FieldValue]) -> Result<()> {
        let id = self.tree.get(key)?.ok_or(StorageError::KeyNotFound)?;

        if self.schema.uniqueness == Uniqueness::TupleUnique {
            let has_null = key.iter().chain(new_value.iter()).any(FieldValue::is_null);
            if !has_null {
                let mut cursor = Cursor::seek(&self.tree, key)?;
                while cursor.is_valid() {
                    let entry = match cursor.current()? {
                        Some(e) => e,
                        None => break,
                    };
                    if self.schema.compare_keys(&entry.key, key) != Ordering::Equal {
                        break;
                    }
                    if entry.value != id {
                        let existing = self.values.read(&self.schema, entry.value)?;
                        if existing.values == new_value {
                            return Err(StorageError::UniquenessViolation {
                                mode: Uniqueness::TupleUnique,
                            });
                        }
                    }
                    if !cursor.next()? {
                        break;
                    }
                }
            }
        }

        let path = self.tree.descend(key)?;
        let leaf_id = *path
            .last()
            .ok_or_else(|| StorageError::corruption("missing leaf for update"))?;
        let idx = self.tree.leaf_lower_bound(leaf_id, key)?;
        self.values.update_value(&self.schema, id, leaf_id, idx as u32, new_value)
    }

    /// Move a tuple to a new key (spec §4.1.4 "delete old slot, insert
    /// new slot" path), re-checking uniqueness against the post-image.
    pub fn update_key(&self, old_key: &[FieldValue], new_key: &[FieldValue], new_value: &[FieldValue]) -> Result<()> {
        self.delete(old_key)?;
        self.insert(new_key, new_value)
    }

    pub fn delete(&self, key: &[FieldValue]) -> Result<()> {
        let id = self.tree.delete(key, Some(&self.values))?;
        self.values.expunge(&self.schema, id)
    }

    /// Delete every tuple. `O(n)` in the tuple count: this engine has no
    /// file-level truncate primitive to reset both files in one step
    /// (see `DESIGN.md`).
    pub fn clear(&self) -> Result<()> {
        loop {
            let leaf_id = match self.tree.first_leaf()? {
                Some(id) => id,
                None => break,
            };
            if self.tree.leaf_cell_count(leaf_id)? == 0 {
                break;
            }
            let cell = self.tree.leaf_cell(leaf_id, 0)?;
            let key = self.tree.decode_cell_key(&cell)?;
            self.delete(&key)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        self.values.flush()
    }

    /// A forward scan over every tuple, in key order.
    pub fn scan(&self) -> Result<Scan<'_>> {
        Ok(Scan {
            cursor: Cursor::first(&self.tree)?,
            values: &self.values,
            schema: &self.schema,
        })
    }

    /// A forward scan starting at the first tuple whose key is `>= key`.
    pub fn scan_from(&self, key: &[FieldValue]) -> Result<Scan<'_>> {
        Ok(Scan {
            cursor: Cursor::seek(&self.tree, key)?,
            values: &self.values,
            schema: &self.schema,
        })
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            tuple_count: self.tree.tuple_count(),
            tree_depth: self.tree.tree_depth(),
            tree_page_count: self.tree.page_count(),
            value_page_count: self.values.page_count(),
        }
    }

    /// Re-establish every structural and uniqueness invariant from
    /// on-disk state, reporting inconsistencies through `progress`
    /// without attempting repair (spec §4.5).
    pub fn verify(&self, progress: &mut dyn VerifyProgress) -> Result<bool> {
        verify::verify(&self.tree, &self.values, progress)
    }

    /// Planner inputs: on-disk size, tuple count, and the per-seek and
    /// per-tuple-read cost terms (spec §4.6).
    pub fn estimate(&self) -> Result<Estimate> {
        estimate::estimate(&self.tree, &self.values, self.bytes_per_second)
    }

    fn tuple_unique_conflict(&self, key: &[FieldValue], value: &[FieldValue]) -> Result<bool> {
        let has_null = key.iter().chain(value.iter()).any(FieldValue::is_null);
        if has_null {
            return Ok(false);
        }
        let mut cursor = Cursor::seek(&self.tree, key)?;
        while cursor.is_valid() {
            let entry = match cursor.current()? {
                Some(e) => e,
                None => break,
            };
            if self.schema.compare_keys(&entry.key, key) != Ordering::Equal {
                break;
            }
            let existing = self.values.read(&self.schema, entry.value)?;
            if existing.values == value {
                return Ok(true);
            }
            if !cursor.next()? {
                break;
            }
        }
        Ok(false)
    }
}

/// A forward cursor over `(key, value)` tuples, backed by the tree's
/// leaf-to-leaf scan.
pub struct Scan<'a> {
    cursor: Cursor<'a>,
    values: &'a ValueFile,
    schema: &'a Schema,
}

impl<'a> Scan<'a> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(Vec<FieldValue>, Vec<FieldValue>)>> {
        if !self.cursor.is_valid() {
            return Ok(None);
        }
        let entry = match self.cursor.current()? {
            Some(e) => e,
            None => return Ok(None),
        };
        let value = self.values.read(self.schema, entry.value)?.values;
        self.cursor.next()?;
        Ok(Some((entry.key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor, FieldType};
    use tempfile::tempdir;

    fn key_unique_schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 64 }),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    fn tuple_unique_schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 64 }),
            ],
            1,
            Uniqueness::TupleUnique,
        )
    }

    #[test]
    fn insert_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();

        index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("one".into())])
            .unwrap();
        assert_eq!(
            index.get(&[FieldValue::Int32(1)]).unwrap(),
            Some(vec![FieldValue::String("one".into())])
        );

        index
            .update(&[FieldValue::Int32(1)], &[FieldValue::String("uno".into())])
            .unwrap();
        assert_eq!(
            index.get(&[FieldValue::Int32(1)]).unwrap(),
            Some(vec![FieldValue::String("uno".into())])
        );

        index.delete(&[FieldValue::Int32(1)]).unwrap();
        assert_eq!(index.get(&[FieldValue::Int32(1)]).unwrap(), None);
        assert_eq!(index.tuple_count(), 0);
    }

    #[test]
    fn duplicate_key_rejected_under_key_unique() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();
        index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("a".into())])
            .unwrap();
        let err = index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("b".into())])
            .unwrap_err();
        assert!(matches!(err, StorageError::UniquenessViolation { .. }));
        // the rejected insert must not have left a stray value object behind
        assert_eq!(index.tuple_count(), 1);
    }

    #[test]
    fn duplicate_tuple_rejected_under_tuple_unique_even_with_distinct_keys() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), tuple_unique_schema())).unwrap();
        index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("same".into())])
            .unwrap();
        // same key, same value tuple: rejected
        let err = index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("same".into())])
            .unwrap_err();
        assert!(matches!(err, StorageError::UniquenessViolation { .. }));
        // same key, different value: allowed under TupleUnique
        index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("different".into())])
            .unwrap();
        assert_eq!(index.tuple_count(), 2);
    }

    #[test]
    fn scan_is_ordered_and_covers_every_tuple() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();
        for i in (0..30i32).rev() {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }
        let mut scan = index.scan().unwrap();
        let mut prev: Option<Vec<FieldValue>> = None;
        let mut count = 0;
        while let Some((key, _)) = scan.next().unwrap() {
            if let Some(p) = &prev {
                assert_eq!(index.schema().compare_keys(p, &key), Ordering::Less);
            }
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 30);
    }

    #[test]
    fn clear_empties_the_index() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();
        for i in 0..10i32 {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }
        index.clear().unwrap();
        assert_eq!(index.tuple_count(), 0);
        assert!(index.is_empty());
        let mut scan = index.scan().unwrap();
        assert!(scan.next().unwrap().is_none());
    }

    #[test]
    fn verify_reports_consistent_after_normal_use() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();
        for i in 0..100i32 {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }
        let mut progress = crate::verify::CollectingProgress::default();
        assert!(index.verify(&mut progress).unwrap());
        assert!(progress.issues.is_empty());
    }

    #[test]
    fn estimate_reflects_tuple_count() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), key_unique_schema())).unwrap();
        for i in 0..40i32 {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }
        let est = index.estimate().unwrap();
        assert_eq!(est.tuple_count, 40);
        assert!(est.file_size_bytes > 0);
    }
}
