//! Tree-file management information.
//!
//! Recorded in the header page of the Tree file. Carries both the plain
//! paging bookkeeping every file needs (page count, free list) and the
//! tree-specific state: version, last-modified time, current tree depth,
//! and the root/top-leaf/last-leaf page identifiers, plus the running
//! count of tuples held by the index. Grounded on the on-disk layout of
//! the original Btree driver's file information record (version, modified
//! time, tree depth, root/top-leaf/last-leaf page ids, object count).

use crate::error::{Result, StorageError};
use crate::storage::FileHeaderLike;
use crate::types::{PageId, PAGE_SIZE};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAGIC: &[u8; 16] = b"IndexTreeFileV01";

pub const FILE_INFO_SIZE: usize = PAGE_SIZE;

pub const CURRENT_VERSION: u32 = 1;

/// Tree-file header.
///
/// Layout:
/// ```text
/// Offset  Size  Description
/// 0       16    Magic string
/// 16      4     Page size
/// 20      4     Total page count
/// 24      4     First free page ID
/// 28      4     Free page count
/// 32      4     File version
/// 36      8     Last-modified time, milliseconds since the Unix epoch
/// 44      4     Current tree depth
/// 48      4     Root node page ID
/// 52      4     Top (leftmost) leaf page ID
/// 56      4     Last (rightmost) leaf page ID
/// 60      8     Tuple count
/// 68      4     Checksum (CRC32)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FileInformation {
    pub page_size: u32,
    pub page_count: u32,
    pub first_free_page: PageId,
    pub free_page_count: u32,
    pub version: u32,
    pub last_modified_millis: u64,
    pub tree_depth: u32,
    pub root_node_id: PageId,
    pub top_leaf_id: PageId,
    pub last_leaf_id: PageId,
    pub tuple_count: u64,
}

impl FileInformation {
    pub fn new() -> Self {
        Self {
            page_size: PAGE_SIZE as u32,
            page_count: 1,
            first_free_page: PageId::new(0),
            free_page_count: 0,
            version: CURRENT_VERSION,
            last_modified_millis: 0,
            tree_depth: 0,
            root_node_id: PageId::INVALID,
            top_leaf_id: PageId::INVALID,
            last_leaf_id: PageId::INVALID,
            tuple_count: 0,
        }
    }

    /// Record the current wall-clock time as the last-modified timestamp.
    pub fn touch_modification_time(&mut self) {
        self.last_modified_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
    }

    pub fn inc_tree_depth(&mut self) {
        self.tree_depth += 1;
    }

    /// Collapsing the root reduces the tree's depth by one. The original
    /// driver marks the matching decrement routine obsolete; a B+-tree
    /// that rebalances on delete needs it, so it is kept here.
    pub fn dec_tree_depth(&mut self) {
        self.tree_depth = self.tree_depth.saturating_sub(1);
    }

    pub fn inc_tuple_count(&mut self) {
        self.tuple_count += 1;
    }

    pub fn dec_tuple_count(&mut self) {
        self.tuple_count = self.tuple_count.saturating_sub(1);
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 72 {
            return Err(StorageError::invalid_db("file information too short"));
        }
        if &bytes[0..16] != MAGIC {
            return Err(StorageError::invalid_db("invalid magic bytes"));
        }

        let page_size = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        let page_count = u32::from_be_bytes(bytes[20..24].try_into().unwrap());
        let first_free_page = u32::from_be_bytes(bytes[24..28].try_into().unwrap());
        let free_page_count = u32::from_be_bytes(bytes[28..32].try_into().unwrap());
        let version = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let last_modified_millis = u64::from_be_bytes(bytes[36..44].try_into().unwrap());
        let tree_depth = u32::from_be_bytes(bytes[44..48].try_into().unwrap());
        let root_node_id = u32::from_be_bytes(bytes[48..52].try_into().unwrap());
        let top_leaf_id = u32::from_be_bytes(bytes[52..56].try_into().unwrap());
        let last_leaf_id = u32::from_be_bytes(bytes[56..60].try_into().unwrap());
        let tuple_count = u64::from_be_bytes(bytes[60..68].try_into().unwrap());

        let stored_checksum = u32::from_be_bytes(bytes[68..72].try_into().unwrap());
        let computed_checksum = crc32fast::hash(&bytes[0..68]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::corruption("tree file header checksum mismatch"));
        }

        if page_size != PAGE_SIZE as u32 {
            return Err(StorageError::invalid_db(format!(
                "unsupported page size: {} (expected {})",
                page_size, PAGE_SIZE
            )));
        }

        Ok(Self {
            page_size,
            page_count,
            first_free_page: PageId::new(first_free_page),
            free_page_count,
            version,
            last_modified_millis,
            tree_depth,
            root_node_id: PageId::new(root_node_id),
            top_leaf_id: PageId::new(top_leaf_id),
            last_leaf_id: PageId::new(last_leaf_id),
            tuple_count,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..FILE_INFO_SIZE].fill(0);
        bytes[0..16].copy_from_slice(MAGIC);
        bytes[16..20].copy_from_slice(&self.page_size.to_be_bytes());
        bytes[20..24].copy_from_slice(&self.page_count.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.first_free_page.value().to_be_bytes());
        bytes[28..32].copy_from_slice(&self.free_page_count.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.version.to_be_bytes());
        bytes[36..44].copy_from_slice(&self.last_modified_millis.to_be_bytes());
        bytes[44..48].copy_from_slice(&self.tree_depth.to_be_bytes());
        bytes[48..52].copy_from_slice(&self.root_node_id.value().to_be_bytes());
        bytes[52..56].copy_from_slice(&self.top_leaf_id.value().to_be_bytes());
        bytes[56..60].copy_from_slice(&self.last_leaf_id.value().to_be_bytes());
        bytes[60..68].copy_from_slice(&self.tuple_count.to_be_bytes());
        let checksum = crc32fast::hash(&bytes[0..68]);
        bytes[68..72].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl Default for FileInformation {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHeaderLike for FileInformation {
    fn new() -> Self {
        FileInformation::new()
    }

    fn read(bytes: &[u8]) -> Result<Self> {
        FileInformation::read(bytes)
    }

    fn write(&self, bytes: &mut [u8]) {
        FileInformation::write(self, bytes)
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn allocate_page_id(&mut self) -> PageId {
        let page_id = PageId::new(self.page_count);
        self.page_count += 1;
        page_id
    }

    fn first_free_page(&self) -> PageId {
        self.first_free_page
    }

    fn set_first_free_page(&mut self, p: PageId) {
        self.first_free_page = p;
    }

    fn free_page_count(&self) -> u32 {
        self.free_page_count
    }

    fn set_free_page_count(&mut self, n: u32) {
        self.free_page_count = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut info = FileInformation::new();
        info.tree_depth = 3;
        info.root_node_id = PageId::new(7);
        info.top_leaf_id = PageId::new(2);
        info.last_leaf_id = PageId::new(9);
        info.tuple_count = 1234;
        info.touch_modification_time();

        let mut bytes = vec![0u8; FILE_INFO_SIZE];
        info.write(&mut bytes);
        let restored = FileInformation::read(&bytes).unwrap();

        assert_eq!(restored.tree_depth, 3);
        assert_eq!(restored.root_node_id, PageId::new(7));
        assert_eq!(restored.tuple_count, 1234);
        assert_eq!(restored.last_modified_millis, info.last_modified_millis);
    }

    #[test]
    fn depth_and_tuple_count_increments() {
        let mut info = FileInformation::new();
        info.inc_tree_depth();
        info.inc_tree_depth();
        assert_eq!(info.tree_depth, 2);
        info.dec_tree_depth();
        assert_eq!(info.tree_depth, 1);

        info.inc_tuple_count();
        info.inc_tuple_count();
        info.dec_tuple_count();
        assert_eq!(info.tuple_count, 1);
    }

    #[test]
    fn checksum_catches_corruption() {
        let info = FileInformation::new();
        let mut bytes = vec![0u8; FILE_INFO_SIZE];
        info.write(&mut bytes);
        bytes[50] ^= 0xFF;
        assert!(FileInformation::read(&bytes).is_err());
    }
}
