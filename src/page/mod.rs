//! Page layer: slotted page format shared by node pages and value pages.
//!
//! Both the Tree file's node pages and the Value file's object pages use
//! the same physical shape: a fixed header, a cell-pointer array growing
//! from the header, and cell content growing from the end of the page
//! toward the header. [`Page`] is the common interface the buffer pool
//! needs to cache either kind.

pub mod header;
pub mod keyslot;
pub mod node;
pub mod object;

pub use header::{NodeKind, NodePageHeader};
pub use keyslot::{KeyRepr, NodeCell, Payload};
pub use node::NodePage;
pub use object::ObjectPage;

use crate::error::Result;
use crate::types::PAGE_SIZE;

/// A raw page buffer
#[derive(Clone)]
pub struct PageBuf {
    data: [u8; PAGE_SIZE],
}

impl PageBuf {
    /// Create a new zeroed page buffer
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Create a page buffer from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; PAGE_SIZE];
        let len = bytes.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }

    /// Get a reference to the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the raw bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PageBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A page the buffer pool can cache: decodable from and encodable to a
/// fixed-size on-disk buffer, with a default ("blank") value used right
/// after allocation, before the caller initialises it further.
pub trait Page: Send + Sync + 'static {
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
    fn encode(&self) -> PageBuf;
    fn blank() -> Self
    where
        Self: Sized;
}

impl Page for NodePage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        NodePage::from_bytes(bytes)
    }

    fn encode(&self) -> PageBuf {
        PageBuf::from_bytes(self.as_bytes())
    }

    fn blank() -> Self {
        NodePage::new_leaf()
    }
}

impl Page for ObjectPage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        ObjectPage::from_bytes(bytes)
    }

    fn encode(&self) -> PageBuf {
        PageBuf::from_bytes(self.as_bytes())
    }

    fn blank() -> Self {
        ObjectPage::new()
    }
}

/// A Tree-file page is either a node/leaf page or an outside key object
/// page (spec §3 "Tree file ... Other pages hold either node/leaf
/// pages, or key objects for outside keys"). One buffer pool instance
/// backs the whole file, so both kinds must share a `Page` impl; the
/// leading marker byte (`NodeKind` tag vs. [`object::OBJECT_PAGE_MARKER`])
/// disambiguates on decode.
#[derive(Clone)]
pub enum TreePage {
    Node(NodePage),
    Object(ObjectPage),
}

impl TreePage {
    pub fn as_node(&self) -> Result<&NodePage> {
        match self {
            TreePage::Node(p) => Ok(p),
            TreePage::Object(_) => Err(crate::error::StorageError::invalid_operation(
                "expected a node page, found a key-object page",
            )),
        }
    }

    pub fn as_node_mut(&mut self) -> Result<&mut NodePage> {
        match self {
            TreePage::Node(p) => Ok(p),
            TreePage::Object(_) => Err(crate::error::StorageError::invalid_operation(
                "expected a node page, found a key-object page",
            )),
        }
    }

    pub fn as_object(&self) -> Result<&ObjectPage> {
        match self {
            TreePage::Object(p) => Ok(p),
            TreePage::Node(_) => Err(crate::error::StorageError::invalid_operation(
                "expected a key-object page, found a node page",
            )),
        }
    }

    pub fn as_object_mut(&mut self) -> Result<&mut ObjectPage> {
        match self {
            TreePage::Object(p) => Ok(p),
            TreePage::Node(_) => Err(crate::error::StorageError::invalid_operation(
                "expected a key-object page, found a node page",
            )),
        }
    }
}

impl Page for TreePage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.first() == Some(&object::OBJECT_PAGE_MARKER) {
            Ok(TreePage::Object(ObjectPage::from_bytes(bytes)?))
        } else {
            Ok(TreePage::Node(NodePage::from_bytes(bytes)?))
        }
    }

    fn encode(&self) -> PageBuf {
        match self {
            TreePage::Node(p) => p.encode(),
            TreePage::Object(p) => p.encode(),
        }
    }

    fn blank() -> Self {
        TreePage::Node(NodePage::new_leaf())
    }
}
