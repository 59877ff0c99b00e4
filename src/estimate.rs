//! Cost and size observations exposed to a query planner (spec §4.6).
//!
//! Four numbers: on-disk file size, tuple count, and the two per-access
//! cost terms a nested-loop or index-scan plan multiplies by — one for
//! the descent to a leaf, one for reading the tuple once there.

use crate::btree::BTree;
use crate::error::Result;
use crate::page::KeyRepr;
use crate::types::PAGE_SIZE;
use crate::valuefile::{object, ValueFile};

/// Nominal fanout the tree layer uses for its own fill-ratio thresholds;
/// mirrored here for the per-seek cost term's `log2(fanout)` (spec §4.6).
const NOMINAL_FANOUT: usize = 64;

/// The planner-facing observations for one open index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub file_size_bytes: u64,
    pub tuple_count: u64,
    pub per_seek_overhead_seconds: f64,
    pub per_tuple_read_seconds: f64,
}

/// Compute the four observations. `file_to_memory_bytes_per_second`
/// calibrates both cost terms and is supplied by the caller rather than
/// measured (spec §4.6 "read from a shared configuration source").
pub fn estimate(tree: &BTree, values: &ValueFile, file_to_memory_bytes_per_second: u64) -> Result<Estimate> {
    let file_size_bytes = (tree.page_count() as u64 + values.page_count() as u64) * PAGE_SIZE as u64;
    let tuple_count = tree.tuple_count();

    let bps = file_to_memory_bytes_per_second.max(1) as f64;
    let avg_value_bytes = object::representative_size(tree.schema()) as f64;
    let per_tuple_read_seconds = avg_value_bytes / bps;

    let per_seek_overhead_seconds = if tuple_count == 0 {
        0.0
    } else {
        let avg_key_bytes = average_key_bytes(tree)?;
        let depth = tree.tree_depth().max(1) as f64;
        ((NOMINAL_FANOUT as f64).log2() / 2.0) * avg_key_bytes * depth / bps
    };

    Ok(Estimate {
        file_size_bytes,
        tuple_count,
        per_seek_overhead_seconds,
        per_tuple_read_seconds,
    })
}

/// Exact when every key field is fixed-width. Otherwise approximated by
/// summing the encoded length of every leaf slot's key as actually
/// stored on disk and dividing by the tuple count — standing in for
/// spec §4.6's `(used_leaf_bytes - key_table_bytes - leaf_free) /
/// tuple_count`, a page-level byte accounting this crate's `NodePage`
/// does not expose in those exact terms (see `DESIGN.md`).
fn average_key_bytes(tree: &BTree) -> Result<f64> {
    let schema = tree.schema();
    if schema.has_fixed_width_key() {
        let bytes: usize = schema.key_fields().iter().map(|f| f.ty.fixed_cell_size()).sum();
        return Ok(bytes as f64);
    }

    let mut total_bytes: u64 = 0;
    let mut total_tuples: u64 = 0;
    let mut current = tree.first_leaf()?;
    while let Some(leaf_id) = current {
        let count = tree.leaf_cell_count(leaf_id)?;
        for i in 0..count {
            let cell = tree.leaf_cell(leaf_id, i)?;
            if let KeyRepr::Inline(bytes) = &cell.key {
                total_bytes += bytes.len() as u64;
            }
            total_tuples += 1;
        }
        let next = tree.leaf_next(leaf_id)?;
        current = if next.is_valid() { Some(next) } else { None };
    }

    if total_tuples == 0 {
        Ok(0.0)
    } else {
        Ok(total_bytes as f64 / total_tuples as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskManagerImpl, FileInformation};
    use crate::types::{FieldDescriptor, FieldType, FieldValue, PageId, Schema, Uniqueness};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fixed_schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::Int64),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    fn variable_schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::String { max_len: 64 }),
                FieldDescriptor::new(FieldType::Int64),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    fn open(dir: &std::path::Path, schema: Schema) -> (BTree, ValueFile) {
        let disk = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.join("tree.db"), false).unwrap());
        let tree = BTree::open(disk, 64, schema);
        let values = ValueFile::open(&dir.join("value.dat"), 64, false).unwrap();
        (tree, values)
    }

    #[test]
    fn file_size_grows_with_inserts() {
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), fixed_schema());
        let before = estimate(&tree, &values, 50_000_000).unwrap();
        for i in 0..500i32 {
            let id = values
                .insert(tree.schema(), PageId::INVALID, 0, &[FieldValue::Int64(i as i64)])
                .unwrap();
            tree.insert(&[FieldValue::Int32(i)], id, None).unwrap();
        }
        let after = estimate(&tree, &values, 50_000_000).unwrap();
        assert!(after.file_size_bytes > before.file_size_bytes);
        assert_eq!(after.tuple_count, 500);
    }

    #[test]
    fn fixed_width_key_average_is_exact() {
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), fixed_schema());
        let id = values
            .insert(tree.schema(), PageId::INVALID, 0, &[FieldValue::Int64(1)])
            .unwrap();
        tree.insert(&[FieldValue::Int32(1)], id, None).unwrap();
        let est = estimate(&tree, &values, 50_000_000).unwrap();
        // fixed key cost is proportionate to a single Int32 cell (4 bytes)
        // times depth 1; just assert it is finite and positive.
        assert!(est.per_seek_overhead_seconds > 0.0);
    }

    #[test]
    fn variable_width_key_average_tracks_observed_bytes() {
        let dir = tempdir().unwrap();
        let (tree, values) = open(dir.path(), variable_schema());
        for i in 0..50i32 {
            let key = format!("key-{i:04}");
            let id = values
                .insert(tree.schema(), PageId::INVALID, 0, &[FieldValue::Int64(i as i64)])
                .unwrap();
            tree.insert(&[FieldValue::String(key)], id, None).unwrap();
        }
        let est = estimate(&tree, &values, 50_000_000).unwrap();
        assert!(est.per_seek_overhead_seconds > 0.0);
        assert!(est.per_tuple_read_seconds > 0.0);
    }
}
