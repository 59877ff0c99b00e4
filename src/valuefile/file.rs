//! The Value file: a paged file of area-addressable [`ObjectPage`]s
//! holding representative value objects and the outside variable-length
//! and array objects they reference (spec §3 "Value File", §4.2).
//!
//! Page selection is a deliberate simplification of the spec's working-set
//! heuristic (spec §4.2 "prefer the most recently touched page, then a
//! last-page estimate, then a free-page search, then fresh allocation"):
//! this implementation only tracks the single most-recently-touched page
//! and falls straight through to a fresh allocation on a miss, trading a
//! free-page search for simplicity (see `DESIGN.md`).

use crate::btree::BackLinkSink;
use crate::buffer::{BufferPool, BufferPoolImpl};
use crate::chain::AreaStore;
use crate::error::{Result, StorageError};
use crate::page::ObjectPage;
use crate::storage::{DiskManager, DiskManagerImpl, FileHeader};
use crate::types::{ObjectId, PageId, Schema};
use crate::valuefile::object::{self, Representative};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// The Value file.
pub struct ValueFile {
    disk: Arc<DiskManagerImpl<FileHeader>>,
    pool: BufferPoolImpl<ObjectPage, FileHeader>,
    last_page: RwLock<Option<PageId>>,
}

impl ValueFile {
    pub fn open(path: &Path, buffer_pool_size: usize, sync_on_write: bool) -> Result<Self> {
        let disk = Arc::new(DiskManagerImpl::<FileHeader>::open(path, sync_on_write)?);
        let pool = BufferPoolImpl::new(disk.clone(), buffer_pool_size);
        Ok(Self {
            disk,
            pool,
            last_page: RwLock::new(None),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all()
    }

    /// Number of pages currently allocated in the Value file, for the
    /// cost estimator's file-size observation (spec §4.6).
    pub fn page_count(&self) -> usize {
        self.pool.page_count()
    }

    /// Encode and store a brand-new representative object, returning its
    /// [`ObjectId`] for the owning leaf's key slot to reference.
    pub fn insert(
        &self,
        schema: &Schema,
        leaf_pid: PageId,
        key_slot: u32,
        values: &[crate::types::FieldValue],
    ) -> Result<ObjectId> {
        let bytes = object::encode_representative(schema, leaf_pid, key_slot, values, self)?;
        self.alloc(&bytes)
    }

    /// Read and fully decode the representative object at `id`.
    pub fn read(&self, schema: &Schema, id: ObjectId) -> Result<Representative> {
        let bytes = self.area_read(id)?;
        object::decode_representative(schema, &bytes, self)
    }

    /// Replace a representative object's value fields in place. The
    /// object's own area keeps its ID and size (representative objects
    /// are fixed-size per schema); only the outside chains it used to
    /// reference are freed and re-chained.
    pub fn update_value(
        &self,
        schema: &Schema,
        id: ObjectId,
        leaf_pid: PageId,
        key_slot: u32,
        values: &[crate::types::FieldValue],
    ) -> Result<()> {
        let old = self.area_read(id)?;
        object::free_representative_references(schema, &old, self)?;
        let bytes = object::encode_representative(schema, leaf_pid, key_slot, values, self)?;
        self.area_rewrite(id, &bytes)
    }

    /// Patch only the leaf-back-link fields, leaving every value field
    /// untouched. Used when a key redistributes or a leaf splits and the
    /// owning leaf or slot index changes, but the value itself does not.
    pub fn update_backlink(&self, id: ObjectId, leaf_pid: PageId, key_slot: u32) -> Result<()> {
        let mut bytes = self.area_read(id)?;
        if bytes.len() < object::FIELDS_OFFSET_BASE {
            return Err(StorageError::corruption("representative object truncated"));
        }
        bytes[object::LEAF_PID_OFFSET..object::LEAF_PID_OFFSET + 4]
            .copy_from_slice(&leaf_pid.value().to_be_bytes());
        bytes[object::KEY_SLOT_OFFSET..object::KEY_SLOT_OFFSET + 4]
            .copy_from_slice(&key_slot.to_be_bytes());
        self.area_rewrite(id, &bytes)
    }

    /// Free a representative object and every outside chain it
    /// references, then compact the owning page and free it outright if
    /// it is left empty (spec §4.2 "compacts the owning page, and — if
    /// the page becomes empty and is not page 0 — frees it"). Freeing
    /// the page that held a file's sole remaining tuple leaves the
    /// Value file holding nothing but its header, the "file contained
    /// exactly one tuple" case spec §4.2 calls out separately.
    pub fn expunge(&self, schema: &Schema, id: ObjectId) -> Result<()> {
        let bytes = self.area_read(id)?;
        object::free_representative_references(schema, &bytes, self)?;
        self.area_free(id)?;

        let page_id = id.page_id();
        let is_empty = {
            let guard = self.pool.fetch_page_mut(page_id)?;
            let mut page = guard.write();
            page.compact()?;
            page.is_empty()
        };
        if is_empty && page_id != PageId::HEADER {
            self.pool.free_page(page_id)?;
            let mut last = self.last_page.write();
            if *last == Some(page_id) {
                *last = None;
            }
        }
        Ok(())
    }

    fn area_read(&self, id: ObjectId) -> Result<Vec<u8>> {
        let guard = self.pool.fetch_page(id.page_id())?;
        let page = guard.read();
        Ok(page.get(id.area_id())?.to_vec())
    }

    fn area_rewrite(&self, id: ObjectId, bytes: &[u8]) -> Result<()> {
        let guard = self.pool.fetch_page_mut(id.page_id())?;
        guard.write().rewrite(id.area_id(), bytes)
    }

    fn area_free(&self, id: ObjectId) -> Result<()> {
        let guard = self.pool.fetch_page_mut(id.page_id())?;
        guard.write().free(id.area_id())
    }
}

impl AreaStore for ValueFile {
    fn alloc(&self, bytes: &[u8]) -> Result<ObjectId> {
        if let Some(page_id) = *self.last_page.read() {
            if let Ok(guard) = self.pool.fetch_page_mut(page_id) {
                let mut page = guard.write();
                if page.free_space() >= bytes.len() || {
                    page.compact()?;
                    page.free_space() >= bytes.len()
                } {
                    let area_id = page.allocate(bytes)?;
                    drop(page);
                    return Ok(ObjectId::new(page_id, area_id));
                }
            }
        }

        let (page_id, guard) = self.pool.new_page()?;
        let area_id = {
            let mut page = guard.write();
            page.allocate(bytes)?
        };
        *self.last_page.write() = Some(page_id);
        Ok(ObjectId::new(page_id, area_id))
    }

    fn read(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.area_read(id)
    }

    fn rewrite(&self, id: ObjectId, bytes: &[u8]) -> Result<()> {
        self.area_rewrite(id, bytes)
    }

    fn free(&self, id: ObjectId) -> Result<()> {
        self.area_free(id)
    }

    fn max_fragment_payload(&self) -> usize {
        ObjectPage::max_single_area_payload()
    }
}

impl BackLinkSink for ValueFile {
    fn update_backlink(&self, value: ObjectId, leaf_pid: PageId, key_slot: u32) -> Result<()> {
        ValueFile::update_backlink(self, value, leaf_pid, key_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor, FieldType, FieldValue, Uniqueness};
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 32 }),
                FieldDescriptor::new(FieldType::String { max_len: 8192 }).outside(),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    #[test]
    fn insert_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let vf = ValueFile::open(&dir.path().join("v.dat"), 16, false).unwrap();
        let schema = schema();
        let values = vec![
            FieldValue::String("short".into()),
            FieldValue::String("x".repeat(5000)),
        ];
        let id = vf.insert(&schema, PageId::new(1), 0, &values).unwrap();
        let read = vf.read(&schema, id).unwrap();
        assert_eq!(read.values, values);
        assert_eq!(read.leaf_pid, PageId::new(1));
    }

    #[test]
    fn update_value_keeps_same_id() {
        let dir = tempdir().unwrap();
        let vf = ValueFile::open(&dir.path().join("v.dat"), 16, false).unwrap();
        let schema = schema();
        let values = vec![FieldValue::String("a".into()), FieldValue::String("b".into())];
        let id = vf.insert(&schema, PageId::new(1), 0, &values).unwrap();
        let new_values = vec![
            FieldValue::String("changed".into()),
            FieldValue::String("c".repeat(2000)),
        ];
        vf.update_value(&schema, id, PageId::new(2), 3, &new_values).unwrap();
        let read = vf.read(&schema, id).unwrap();
        assert_eq!(read.values, new_values);
        assert_eq!(read.leaf_pid, PageId::new(2));
        assert_eq!(read.key_slot, 3);
    }

    #[test]
    fn expunge_frees_representative_and_chains() {
        let dir = tempdir().unwrap();
        let vf = ValueFile::open(&dir.path().join("v.dat"), 16, false).unwrap();
        let schema = schema();
        let values = vec![FieldValue::String("a".into()), FieldValue::String("b".into())];
        let id = vf.insert(&schema, PageId::new(1), 0, &values).unwrap();
        vf.expunge(&schema, id).unwrap();
        assert!(vf.area_read(id).is_err());
    }

    #[test]
    fn expunge_of_sole_tuple_reclaims_the_page() {
        let dir = tempdir().unwrap();
        let vf = ValueFile::open(&dir.path().join("v.dat"), 16, false).unwrap();
        let schema = schema();
        let values = vec![FieldValue::String("a".into()), FieldValue::String("b".into())];
        let id = vf.insert(&schema, PageId::new(1), 0, &values).unwrap();
        let page_id = id.page_id();
        assert_eq!(vf.page_count(), 1);

        vf.expunge(&schema, id).unwrap();

        // The page that held the only representative is freed outright,
        // not merely compacted; fetching it must fail.
        assert!(vf.pool.fetch_page(page_id).is_err());
        assert_eq!(*vf.last_page.read(), None);
    }

    #[test]
    fn expunge_leaves_other_tuples_on_a_shared_page_intact() {
        let dir = tempdir().unwrap();
        let vf = ValueFile::open(&dir.path().join("v.dat"), 16, false).unwrap();
        let schema = schema();
        let values = vec![FieldValue::String("a".into()), FieldValue::String("b".into())];
        let id1 = vf.insert(&schema, PageId::new(1), 0, &values).unwrap();
        let id2 = vf.insert(&schema, PageId::new(1), 1, &values).unwrap();
        assert_eq!(id1.page_id(), id2.page_id());

        vf.expunge(&schema, id1).unwrap();

        // The shared page is still live because id2's representative
        // remains on it.
        let read = vf.read(&schema, id2).unwrap();
        assert_eq!(read.values, values);
    }
}
