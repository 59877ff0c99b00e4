//! Node/leaf page header.
//!
//! Occupies the first bytes of every Tree-file node page. Carries the
//! parent hint (§9 "Parent back-pointers" — verified on use, never
//! trusted blindly), the physical sibling chain, the leaf double-link,
//! and the slotted bookkeeping needed to manage the variable-size key
//! cells that follow.

pub const NODE_HEADER_SIZE: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Leaf)
    }
}

use crate::types::PageId;

#[derive(Debug, Clone, Copy)]
pub struct NodePageHeader {
    pub kind: NodeKind,
    /// Hint only — always re-derived from the descent path during a
    /// mutating operation and persisted at the end of it.
    pub parent: PageId,
    pub prev_physical: PageId,
    pub next_physical: PageId,
    /// Leaves only; `PageId::INVALID` otherwise.
    pub prev_leaf: PageId,
    pub next_leaf: PageId,
    pub used_count: u16,
    /// Offset to the start of the cell content area (grows downward from
    /// the end of the page).
    pub content_start: u16,
    /// Bytes reclaimable by a defragment pass.
    pub fragmented_bytes: u16,
}

impl NodePageHeader {
    pub fn new_leaf(page_size: usize) -> Self {
        Self {
            kind: NodeKind::Leaf,
            parent: PageId::INVALID,
            prev_physical: PageId::INVALID,
            next_physical: PageId::INVALID,
            prev_leaf: PageId::INVALID,
            next_leaf: PageId::INVALID,
            used_count: 0,
            content_start: page_size as u16,
            fragmented_bytes: 0,
        }
    }

    pub fn new_internal(page_size: usize) -> Self {
        Self {
            kind: NodeKind::Internal,
            ..Self::new_leaf(page_size)
        }
    }

    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return None;
        }
        let kind = match bytes[0] {
            0 => NodeKind::Leaf,
            1 => NodeKind::Internal,
            _ => return None,
        };
        let parent = PageId::new(u32::from_be_bytes(bytes[1..5].try_into().ok()?));
        let prev_physical = PageId::new(u32::from_be_bytes(bytes[5..9].try_into().ok()?));
        let next_physical = PageId::new(u32::from_be_bytes(bytes[9..13].try_into().ok()?));
        let prev_leaf = PageId::new(u32::from_be_bytes(bytes[13..17].try_into().ok()?));
        let next_leaf = PageId::new(u32::from_be_bytes(bytes[17..21].try_into().ok()?));
        let used_count = u16::from_be_bytes(bytes[21..23].try_into().ok()?);
        let content_start = u16::from_be_bytes(bytes[23..25].try_into().ok()?);
        let fragmented_bytes = u16::from_be_bytes(bytes[25..27].try_into().ok()?);
        Some(Self {
            kind,
            parent,
            prev_physical,
            next_physical,
            prev_leaf,
            next_leaf,
            used_count,
            content_start,
            fragmented_bytes,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0] = match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Internal => 1,
        };
        bytes[1..5].copy_from_slice(&self.parent.value().to_be_bytes());
        bytes[5..9].copy_from_slice(&self.prev_physical.value().to_be_bytes());
        bytes[9..13].copy_from_slice(&self.next_physical.value().to_be_bytes());
        bytes[13..17].copy_from_slice(&self.prev_leaf.value().to_be_bytes());
        bytes[17..21].copy_from_slice(&self.next_leaf.value().to_be_bytes());
        bytes[21..23].copy_from_slice(&self.used_count.to_be_bytes());
        bytes[23..25].copy_from_slice(&self.content_start.to_be_bytes());
        bytes[25..27].copy_from_slice(&self.fragmented_bytes.to_be_bytes());
    }

    pub fn cell_pointer_offset(&self) -> usize {
        NODE_HEADER_SIZE
    }

    pub fn cell_pointer_array_end(&self) -> usize {
        self.cell_pointer_offset() + self.used_count as usize * 2
    }

    pub fn free_space(&self) -> usize {
        (self.content_start as usize).saturating_sub(self.cell_pointer_array_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAGE_SIZE;

    #[test]
    fn roundtrip() {
        let mut header = NodePageHeader::new_internal(PAGE_SIZE);
        header.used_count = 4;
        header.parent = PageId::new(9);
        header.next_leaf = PageId::new(3);

        let mut buf = [0u8; NODE_HEADER_SIZE];
        header.write(&mut buf);
        let restored = NodePageHeader::read(&buf).unwrap();

        assert_eq!(restored.kind, NodeKind::Internal);
        assert_eq!(restored.used_count, 4);
        assert_eq!(restored.parent, PageId::new(9));
        assert_eq!(restored.next_leaf, PageId::new(3));
    }

    #[test]
    fn fresh_leaf_has_full_free_space() {
        let header = NodePageHeader::new_leaf(PAGE_SIZE);
        assert_eq!(header.free_space(), PAGE_SIZE - NODE_HEADER_SIZE);
    }
}
