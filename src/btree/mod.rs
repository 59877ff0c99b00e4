//! The B+-tree half of an index: schema-aware key ordering and
//! structural maintenance over the Tree file's node/leaf pages.
//!
//! Supports:
//! - Point lookups (get)
//! - Insertions (insert), enforcing key-level uniqueness
//! - Deletions (delete), with redistribute/concatenate rebalancing
//! - Range scans via the leaf-to-leaf forward/backward cursor

mod cursor;
mod recovery;
mod tree;

pub use cursor::Cursor;
pub use recovery::RecoverySet;
pub use tree::{BackLinkSink, BTree, PageSnapshot};
