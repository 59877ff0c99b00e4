//! Node/leaf page: a slotted sequence of key cells.
//!
//! Unlike the teacher's `SlottedPage`, which special-cases an interior
//! page's rightmost child as a header field, here every slot (leaf or
//! interior) carries its own payload: a leaf slot points at a value
//! object, an interior slot points at the child whose **last** key
//! equals the slot's key (the delegate-key invariant, spec §4.1.3).
//! There is no separate "rightmost child" — it is simply the child of
//! the last slot.

use crate::error::{Result, StorageError};
use crate::page::header::{NodeKind, NodePageHeader, NODE_HEADER_SIZE};
use crate::page::keyslot::{KeyRepr, NodeCell, Payload};
use crate::page::PageBuf;
use crate::types::{ObjectId, PageId, PAGE_SIZE};

#[derive(Clone)]
pub struct NodePage {
    data: PageBuf,
    header: NodePageHeader,
}

impl NodePage {
    pub fn new_leaf() -> Self {
        let mut data = PageBuf::new();
        let header = NodePageHeader::new_leaf(PAGE_SIZE);
        header.write(&mut data);
        Self { data, header }
    }

    pub fn new_interior() -> Self {
        let mut data = PageBuf::new();
        let header = NodePageHeader::new_internal(PAGE_SIZE);
        header.write(&mut data);
        Self { data, header }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data = PageBuf::from_bytes(bytes);
        let header = NodePageHeader::read(&data)
            .ok_or_else(|| StorageError::invalid_page("invalid node page header"))?;
        Ok(Self { data, header })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn header(&self) -> &NodePageHeader {
        &self.header
    }

    pub fn is_leaf(&self) -> bool {
        self.header.kind.is_leaf()
    }

    pub fn cell_count(&self) -> usize {
        self.header.used_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }

    pub fn parent(&self) -> PageId {
        self.header.parent
    }

    pub fn set_parent(&mut self, parent: PageId) {
        self.header.parent = parent;
        self.sync_header();
    }

    pub fn prev_physical(&self) -> PageId {
        self.header.prev_physical
    }

    pub fn next_physical(&self) -> PageId {
        self.header.next_physical
    }

    pub fn set_prev_physical(&mut self, id: PageId) {
        self.header.prev_physical = id;
        self.sync_header();
    }

    pub fn set_next_physical(&mut self, id: PageId) {
        self.header.next_physical = id;
        self.sync_header();
    }

    pub fn prev_leaf(&self) -> PageId {
        self.header.prev_leaf
    }

    pub fn next_leaf(&self) -> PageId {
        self.header.next_leaf
    }

    pub fn set_prev_leaf(&mut self, id: PageId) {
        self.header.prev_leaf = id;
        self.sync_header();
    }

    pub fn set_next_leaf(&mut self, id: PageId) {
        self.header.next_leaf = id;
        self.sync_header();
    }

    fn cell_pointer(&self, index: usize) -> u16 {
        let offset = self.header.cell_pointer_offset() + index * 2;
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn set_cell_pointer(&mut self, index: usize, pointer: u16) {
        let offset = self.header.cell_pointer_offset() + index * 2;
        self.data[offset..offset + 2].copy_from_slice(&pointer.to_be_bytes());
    }

    pub fn get(&self, index: usize) -> Result<NodeCell> {
        if index >= self.cell_count() {
            return Err(StorageError::invalid_operation(format!(
                "cell index {} out of bounds (count {})",
                index,
                self.cell_count()
            )));
        }
        let pointer = self.cell_pointer(index) as usize;
        let bytes = &self.data[pointer..];
        let (cell, _) = if self.is_leaf() {
            NodeCell::decode_leaf(bytes)
        } else {
            NodeCell::decode_interior(bytes)
        }
        .ok_or_else(|| StorageError::corruption("failed to decode node cell"))?;
        Ok(cell)
    }

    pub fn all_cells(&self) -> Result<Vec<NodeCell>> {
        (0..self.cell_count()).map(|i| self.get(i)).collect()
    }

    /// Last slot's key, the page's delegate key (spec §4.1.3).
    pub fn last_key(&self) -> Result<Option<KeyRepr>> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.get(self.cell_count() - 1)?.key))
    }

    pub fn free_space(&self) -> usize {
        self.header.free_space().saturating_sub(2)
    }

    pub fn can_fit(&self, cell_size: usize) -> bool {
        self.free_space() >= cell_size
    }

    /// Insert at an explicit position (the caller has already located it
    /// via a schema-aware comparison — `NodePage` has no notion of field
    /// ordering itself).
    pub fn insert_at(&mut self, index: usize, cell: &NodeCell) -> Result<()> {
        let encoded = cell.encode();
        let cell_size = encoded.len();
        if !self.can_fit(cell_size) {
            return Err(StorageError::PageFull {
                page_id: PageId::INVALID,
                needed: cell_size + 2,
                available: self.free_space(),
            });
        }

        let new_content_start = self.header.content_start as usize - cell_size;
        self.data[new_content_start..new_content_start + cell_size].copy_from_slice(&encoded);

        let count = self.cell_count();
        for i in (index..count).rev() {
            let ptr = self.cell_pointer(i);
            self.set_cell_pointer(i + 1, ptr);
        }
        self.set_cell_pointer(index, new_content_start as u16);

        self.header.used_count += 1;
        self.header.content_start = new_content_start as u16;
        self.sync_header();
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<NodeCell> {
        if index >= self.cell_count() {
            return Err(StorageError::invalid_operation("remove index out of bounds"));
        }
        let cell = self.get(index)?;
        let count = self.cell_count();
        for i in index..count - 1 {
            let ptr = self.cell_pointer(i + 1);
            self.set_cell_pointer(i, ptr);
        }
        self.header.used_count -= 1;
        self.header.fragmented_bytes += cell.encoded_size() as u16;
        self.sync_header();
        Ok(cell)
    }

    pub fn replace_at(&mut self, index: usize, cell: &NodeCell) -> Result<()> {
        self.remove_at(index)?;
        self.insert_at(index, cell)
    }

    /// Fill ratio against a nominal fanout, used by the redistribute/
    /// concatenate thresholds (spec §4.1.1 steps 4a/6).
    pub fn fill_ratio(&self, fanout: usize) -> f64 {
        if fanout == 0 {
            return 1.0;
        }
        self.cell_count() as f64 / fanout as f64
    }

    pub fn defragment(&mut self) -> Result<()> {
        let cells = self.all_cells()?;
        let mut fresh = if self.is_leaf() {
            NodePage::new_leaf()
        } else {
            NodePage::new_interior()
        };
        for cell in &cells {
            fresh.insert_at(fresh.cell_count(), cell)?;
        }
        fresh.header.parent = self.header.parent;
        fresh.header.prev_physical = self.header.prev_physical;
        fresh.header.next_physical = self.header.next_physical;
        fresh.header.prev_leaf = self.header.prev_leaf;
        fresh.header.next_leaf = self.header.next_leaf;
        fresh.sync_header();
        self.data = fresh.data;
        self.header = fresh.header;
        Ok(())
    }

    /// Split this page in two, returning the new (right) page holding
    /// the upper half of cells.
    ///
    /// Two-way split primitive; the 2→3 split the tree layer performs
    /// (spec §4.1.1 step 4b) calls this twice against a freshly allocated
    /// middle page.
    pub fn split_in_half(&mut self) -> Result<NodePage> {
        let count = self.cell_count();
        let mid = count / 2;
        let mut right = if self.is_leaf() {
            NodePage::new_leaf()
        } else {
            NodePage::new_interior()
        };
        let moved: Vec<NodeCell> = (mid..count).map(|i| self.get(i)).collect::<Result<_>>()?;
        for cell in &moved {
            right.insert_at(right.cell_count(), cell)?;
        }
        for i in (mid..count).rev() {
            self.remove_at(i)?;
        }
        self.defragment()?;
        Ok(right)
    }

    fn sync_header(&mut self) {
        self.header.write(&mut self.data);
    }
}

pub fn object_id_cell_value(cell: &NodeCell) -> Option<ObjectId> {
    match cell.payload {
        Payload::Value(v) => Some(v),
        Payload::Child(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_cell(n: u8) -> NodeCell {
        NodeCell::new_leaf(KeyRepr::Inline(vec![n]), ObjectId::new(PageId::new(1), n as u16))
    }

    #[test]
    fn insert_and_get() {
        let mut page = NodePage::new_leaf();
        for i in 0..5u8 {
            page.insert_at(page.cell_count(), &leaf_cell(i)).unwrap();
        }
        assert_eq!(page.cell_count(), 5);
        assert_eq!(page.get(2).unwrap(), leaf_cell(2));
    }

    #[test]
    fn remove_shifts_tail() {
        let mut page = NodePage::new_leaf();
        for i in 0..3u8 {
            page.insert_at(page.cell_count(), &leaf_cell(i)).unwrap();
        }
        page.remove_at(0).unwrap();
        assert_eq!(page.cell_count(), 2);
        assert_eq!(page.get(0).unwrap(), leaf_cell(1));
    }

    #[test]
    fn split_in_half_divides_cells() {
        let mut page = NodePage::new_leaf();
        for i in 0..10u8 {
            page.insert_at(page.cell_count(), &leaf_cell(i)).unwrap();
        }
        let right = page.split_in_half().unwrap();
        assert_eq!(page.cell_count() + right.cell_count(), 10);
        assert_eq!(page.get(0).unwrap(), leaf_cell(0));
    }

    #[test]
    fn bytes_roundtrip() {
        let mut page = NodePage::new_leaf();
        page.insert_at(0, &leaf_cell(7)).unwrap();
        let restored = NodePage::from_bytes(page.as_bytes()).unwrap();
        assert_eq!(restored.get(0).unwrap(), leaf_cell(7));
    }
}
