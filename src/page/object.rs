//! Object page: an area-addressable slotted page.
//!
//! Unlike [`crate::page::NodePage`], whose slots are an *ordered* key
//! table, an object page's areas have no ordering relationship to each
//! other — each is addressed solely by its area ID, the lower 16 bits of
//! an [`crate::types::ObjectId`] (spec §3 "Value object", §4.1 "Key
//! object"). This is the shape both the Value file's representative/
//! outside/array objects and the Tree file's outside key objects live
//! on, so one type backs both (spec §6 paged-file "area-level on a page"
//! contract: `allocateArea`/`freeArea`/`compaction`/`getAreaSize`/
//! `getFreeAreaSize`/`getTopAreaID`).
//!
//! Layout: a one-byte marker (distinguishing this page from a
//! [`crate::page::NodePage`] when both share one [`crate::page::TreePage`]
//! buffer pool), then a small header, then an area table (growing
//! forward from the header) of `(offset: u16, length: u16)` pairs, then
//! area content (growing backward from the end of the page). A freed
//! area becomes a tombstone (`length == 0`) so that area IDs — which may
//! be referenced by other objects or by a leaf slot's back-link — never
//! change underneath their referrers.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::types::{PageId, PAGE_SIZE};

/// Marker byte at offset 0 identifying this as an object page rather
/// than a [`crate::page::NodePage`] (whose byte 0 is always 0 or 1, its
/// `NodeKind` tag).
pub const OBJECT_PAGE_MARKER: u8 = 0xFE;

const HEADER_SIZE: usize = 1 + 4 + 4 + 2 + 2 + 2; // marker, prev, next, area_count, content_start, fragmented_bytes
const ENTRY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
struct ObjectPageHeader {
    prev_physical: PageId,
    next_physical: PageId,
    area_count: u16,
    content_start: u16,
    fragmented_bytes: u16,
}

impl ObjectPageHeader {
    fn blank() -> Self {
        Self {
            prev_physical: PageId::INVALID,
            next_physical: PageId::INVALID,
            area_count: 0,
            content_start: PAGE_SIZE as u16,
            fragmented_bytes: 0,
        }
    }

    fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0] != OBJECT_PAGE_MARKER {
            return None;
        }
        Some(Self {
            prev_physical: PageId::new(u32::from_be_bytes(bytes[1..5].try_into().ok()?)),
            next_physical: PageId::new(u32::from_be_bytes(bytes[5..9].try_into().ok()?)),
            area_count: u16::from_be_bytes(bytes[9..11].try_into().ok()?),
            content_start: u16::from_be_bytes(bytes[11..13].try_into().ok()?),
            fragmented_bytes: u16::from_be_bytes(bytes[13..15].try_into().ok()?),
        })
    }

    fn write(&self, bytes: &mut [u8]) {
        bytes[0] = OBJECT_PAGE_MARKER;
        bytes[1..5].copy_from_slice(&self.prev_physical.value().to_be_bytes());
        bytes[5..9].copy_from_slice(&self.next_physical.value().to_be_bytes());
        bytes[9..11].copy_from_slice(&self.area_count.to_be_bytes());
        bytes[11..13].copy_from_slice(&self.content_start.to_be_bytes());
        bytes[13..15].copy_from_slice(&self.fragmented_bytes.to_be_bytes());
    }
}

#[derive(Clone)]
pub struct ObjectPage {
    data: PageBuf,
    header: ObjectPageHeader,
}

impl ObjectPage {
    pub fn new() -> Self {
        let mut data = PageBuf::new();
        let header = ObjectPageHeader::blank();
        header.write(&mut data);
        Self { data, header }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data = PageBuf::from_bytes(bytes);
        let header = ObjectPageHeader::read(&data)
            .ok_or_else(|| StorageError::invalid_page("invalid object page header"))?;
        Ok(Self { data, header })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
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

    fn entry_offset(index: u16) -> usize {
        HEADER_SIZE + index as usize * ENTRY_SIZE
    }

    fn read_entry(&self, index: u16) -> (u16, u16) {
        let off = Self::entry_offset(index);
        let offset = u16::from_be_bytes([self.data[off], self.data[off + 1]]);
        let length = u16::from_be_bytes([self.data[off + 2], self.data[off + 3]]);
        (offset, length)
    }

    fn write_entry(&mut self, index: u16, offset: u16, length: u16) {
        let off = Self::entry_offset(index);
        self.data[off..off + 2].copy_from_slice(&offset.to_be_bytes());
        self.data[off + 2..off + 4].copy_from_slice(&length.to_be_bytes());
    }

    pub fn area_count(&self) -> u16 {
        self.header.area_count
    }

    /// The next fresh area ID this page would assign (spec §6
    /// `getTopAreaID`); tombstoned areas below it may still be reused by
    /// [`ObjectPage::allocate`].
    pub fn top_area_id(&self) -> u16 {
        self.header.area_count
    }

    fn table_end(&self) -> usize {
        Self::entry_offset(self.header.area_count)
    }

    pub fn free_space(&self) -> usize {
        (self.header.content_start as usize).saturating_sub(self.table_end())
    }

    /// Free space available after reclaiming tombstoned and fragmented
    /// bytes via [`ObjectPage::compact`] (spec's `getFreeAreaSize`).
    pub fn free_space_after_compaction(&self) -> usize {
        self.free_space() + self.header.fragmented_bytes as usize
    }

    pub fn get(&self, area_id: u16) -> Result<&[u8]> {
        if area_id >= self.header.area_count {
            return Err(StorageError::invalid_operation("area id out of range"));
        }
        let (offset, length) = self.read_entry(area_id);
        if length == 0 {
            return Err(StorageError::invalid_operation("area has been freed"));
        }
        Ok(&self.data[offset as usize..offset as usize + length as usize])
    }

    pub fn area_size(&self, area_id: u16) -> Result<usize> {
        Ok(self.get(area_id)?.len())
    }

    /// Allocate a fresh area and write `bytes` into it, reusing a
    /// tombstoned entry of sufficient size before growing the table.
    pub fn allocate(&mut self, bytes: &[u8]) -> Result<u16> {
        let len = bytes.len();
        if len > u16::MAX as usize {
            return Err(StorageError::invalid_operation("area too large"));
        }

        for id in 0..self.header.area_count {
            let (offset, length) = self.read_entry(id);
            if length == 0 && offset as usize >= len {
                // A tombstone whose reserved slot is big enough; reuse
                // its id without touching the content frontier.
                let write_at = offset as usize;
                self.data[write_at..write_at + len].copy_from_slice(bytes);
                self.write_entry(id, offset, len as u16);
                return Ok(id);
            }
        }

        if self.free_space() < len + ENTRY_SIZE {
            return Err(StorageError::PageFull {
                page_id: PageId::INVALID,
                needed: len + ENTRY_SIZE,
                available: self.free_space(),
            });
        }

        let new_start = self.header.content_start as usize - len;
        self.data[new_start..new_start + len].copy_from_slice(bytes);
        let id = self.header.area_count;
        self.header.area_count += 1;
        self.header.content_start = new_start as u16;
        self.write_entry(id, new_start as u16, len as u16);
        self.sync_header();
        Ok(id)
    }

    /// Rewrite an existing area's bytes, keeping its ID stable. Grows in
    /// place within this page's free space when the new payload is
    /// larger than what is already reserved for it.
    pub fn rewrite(&mut self, area_id: u16, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        let (offset, length) = self.read_entry(area_id);
        if length == 0 {
            return Err(StorageError::invalid_operation("area has been freed"));
        }
        if len <= length as usize {
            let at = offset as usize;
            self.data[at..at + len].copy_from_slice(bytes);
            self.header.fragmented_bytes += (length as usize - len) as u16;
            self.write_entry(area_id, offset, len as u16);
            self.sync_header();
            return Ok(());
        }
        if self.free_space() < len {
            return Err(StorageError::PageFull {
                page_id: PageId::INVALID,
                needed: len,
                available: self.free_space(),
            });
        }
        self.header.fragmented_bytes += length;
        let new_start = self.header.content_start as usize - len;
        self.data[new_start..new_start + len].copy_from_slice(bytes);
        self.header.content_start = new_start as u16;
        self.write_entry(area_id, new_start as u16, len as u16);
        self.sync_header();
        Ok(())
    }

    /// Tombstone an area. The reserved byte range stays dedicated to
    /// this area ID (reusable by a later, no-larger [`ObjectPage::allocate`])
    /// until a [`ObjectPage::compact`] pass reclaims it entirely.
    pub fn free(&mut self, area_id: u16) -> Result<()> {
        let (offset, length) = self.read_entry(area_id);
        if length == 0 {
            return Err(StorageError::invalid_operation("area already freed"));
        }
        self.header.fragmented_bytes += length;
        self.write_entry(area_id, offset, 0);
        self.sync_header();
        Ok(())
    }

    /// Largest payload a single, freshly allocated area on a blank page
    /// can hold — the figure an [`crate::chain::AreaStore`] reports as
    /// its per-fragment budget.
    pub fn max_single_area_payload() -> usize {
        PAGE_SIZE - HEADER_SIZE - ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        (0..self.header.area_count).all(|id| self.read_entry(id).1 == 0)
    }

    /// Repack content, reclaiming tombstoned and over-reserved bytes.
    /// Area IDs are preserved; tombstones remain tombstones.
    pub fn compact(&mut self) -> Result<()> {
        let mut live: Vec<(u16, Vec<u8>)> = Vec::new();
        for id in 0..self.header.area_count {
            let (_, length) = self.read_entry(id);
            if length > 0 {
                live.push((id, self.get(id)?.to_vec()));
            }
        }
        let mut content_start = PAGE_SIZE;
        for (id, bytes) in &live {
            content_start -= bytes.len();
            self.data[content_start..content_start + bytes.len()].copy_from_slice(bytes);
            self.write_entry(*id, content_start as u16, bytes.len() as u16);
        }
        for id in 0..self.header.area_count {
            let (_, length) = self.read_entry(id);
            if length == 0 {
                self.write_entry(id, 0, 0);
            }
        }
        self.header.content_start = content_start as u16;
        self.header.fragmented_bytes = 0;
        self.sync_header();
        Ok(())
    }

    fn sync_header(&mut self) {
        self.header.write(&mut self.data);
    }
}

impl Default for ObjectPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_read() {
        let mut page = ObjectPage::new();
        let a = page.allocate(b"hello").unwrap();
        let b = page.allocate(b"world!!").unwrap();
        assert_eq!(page.get(a).unwrap(), b"hello");
        assert_eq!(page.get(b).unwrap(), b"world!!");
    }

    #[test]
    fn free_then_compact_reclaims_space() {
        let mut page = ObjectPage::new();
        let a = page.allocate(&vec![1u8; 200]).unwrap();
        let before = page.free_space();
        page.free(a).unwrap();
        assert!(page.get(a).is_err());
        page.compact().unwrap();
        assert_eq!(page.free_space(), before + 200);
    }

    #[test]
    fn rewrite_grows_in_place() {
        let mut page = ObjectPage::new();
        let a = page.allocate(b"hi").unwrap();
        page.rewrite(a, b"hello there").unwrap();
        assert_eq!(page.get(a).unwrap(), b"hello there");
    }

    #[test]
    fn bytes_roundtrip() {
        let mut page = ObjectPage::new();
        page.allocate(b"payload").unwrap();
        let restored = ObjectPage::from_bytes(page.as_bytes()).unwrap();
        assert_eq!(restored.get(0).unwrap(), b"payload");
    }
}
