//! # index-core
//!
//! A disk-resident B+-tree storage engine with paired variable-length
//! value storage.
//!
//! ## Architecture
//!
//! - **Page layer** (`page`): slotted node/leaf pages and the key-object
//!   framing they hold, shared by the Tree file and the Value file.
//! - **Storage layer** (`storage`): disk I/O, file headers, free lists —
//!   one instance per file (Tree file, Value file).
//! - **Buffer layer** (`buffer`): LRU page cache with pin tracking,
//!   generic over the page and file-header types.
//! - **Types** (`types`): the field schema, value tuples, object IDs.
//! - **Chain** (`chain`): out-of-row fragment framing shared by key
//!   objects and Value-file outside/array objects.
//! - **Value file** (`valuefile`): representative value objects and the
//!   outside objects they reference.
//! - **B+-tree** (`btree`): schema-aware key ordering, insert/delete,
//!   split/redistribute/concatenate, recovery set, range cursor.
//! - **Verifier** (`verify`) and **cost estimator** (`estimate`): offline
//!   consistency checking and planner inputs.
//! - **Index** (`index`): the facade tying the Tree file and Value file
//!   together into one schema-aware map from key tuple to value tuple.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_core::{FieldDescriptor, FieldType, FieldValue, Index, IndexConfig, Schema, Uniqueness};
//!
//! let schema = Schema::new(
//!     vec![
//!         FieldDescriptor::new(FieldType::Int32),
//!         FieldDescriptor::new(FieldType::String { max_len: 64 }),
//!     ],
//!     1,
//!     Uniqueness::KeyUnique,
//! );
//! let index = Index::open(IndexConfig::new("my_index", schema))?;
//! index.insert(&[FieldValue::Int32(1)], &[FieldValue::String("hello".into())])?;
//! let value = index.get(&[FieldValue::Int32(1)])?;
//! # Ok::<(), index_core::StorageError>(())
//! ```

pub mod btree;
pub mod buffer;
pub mod chain;
pub mod error;
pub mod estimate;
mod index;
pub mod page;
pub mod storage;
pub mod types;
pub mod valuefile;
pub mod verify;

pub use error::{Result, StorageError};
pub use estimate::Estimate;
pub use index::{Index, IndexConfig, IndexStats, Scan};
pub use types::{Direction, FieldDescriptor, FieldType, FieldValue, Placement, Schema, Uniqueness};
pub use verify::{CollectingProgress, Inconsistency, VerifyProgress};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 64 }),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    #[test]
    fn test_basic_operations() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), schema())).unwrap();

        index
            .insert(&[FieldValue::Int32(1)], &[FieldValue::String("one".into())])
            .unwrap();
        index
            .insert(&[FieldValue::Int32(2)], &[FieldValue::String("two".into())])
            .unwrap();

        assert_eq!(
            index.get(&[FieldValue::Int32(1)]).unwrap(),
            Some(vec![FieldValue::String("one".into())])
        );
        assert!(index.contains(&[FieldValue::Int32(2)]).unwrap());

        index.delete(&[FieldValue::Int32(1)]).unwrap();
        assert_eq!(index.get(&[FieldValue::Int32(1)]).unwrap(), None);
        assert_eq!(index.tuple_count(), 1);
    }

    #[test]
    fn test_range_scan() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), schema())).unwrap();

        for i in 0..20i32 {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }

        let mut scan = index.scan().unwrap();
        let mut count = 0;
        let mut prev: Option<Vec<FieldValue>> = None;
        while let Some((key, _value)) = scan.next().unwrap() {
            if let Some(p) = prev {
                assert_eq!(schema().compare_keys(&p, &key), std::cmp::Ordering::Less);
            }
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_verify_reports_consistent() {
        let dir = tempdir().unwrap();
        let index = Index::open(IndexConfig::new(dir.path(), schema())).unwrap();
        for i in 0..50i32 {
            index
                .insert(&[FieldValue::Int32(i)], &[FieldValue::String(format!("v{i}"))])
                .unwrap();
        }
        let mut progress = CollectingProgress::default();
        let ok = index.verify(&mut progress).unwrap();
        assert!(ok);
        assert!(progress.issues.is_empty());
    }
}
