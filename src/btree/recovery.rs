//! Recovery set: a scoped record of the pages one mutating tree
//! operation touches, so a failure partway through a split/redistribute/
//! concatenate can undo it (spec §4.4).
//!
//! Grounded in the teacher's `PageGuard`/`PageGuardMut` RAII pattern
//! (release-unconditionally-on-`Drop`): here the guarded resource is not
//! a single page's pin count but the whole set of pages an operation
//! attached, allocated, or freed. The happy path calls
//! [`RecoverySet::commit`]; any other exit rolls the operation all the
//! way back:
//!
//! - pages allocated by this operation are returned to the free list;
//! - pages attached (pre-existing pages this operation mutated in place)
//!   are restored to the image they held before the operation touched
//!   them, via [`RecoverySet::track`];
//! - pages this operation freed are never actually handed back to the
//!   disk manager until `commit()` runs, so a failed operation simply
//!   discards that list — there is nothing to undo.
//!
//! Fields use interior mutability so the set can be threaded as a shared
//! reference into helpers (like a key-object chain store) that only need
//! `&self` access to record what they touched.

use std::cell::{Cell, RefCell};

use crate::buffer::{BufferPool, BufferPoolImpl};
use crate::error::Result;
use crate::page::Page;
use crate::storage::FileHeaderLike;
use crate::types::PageId;

pub struct RecoverySet<'a, P: Page + Clone, H: FileHeaderLike> {
    pool: &'a BufferPoolImpl<P, H>,
    allocated: RefCell<Vec<PageId>>,
    attached: RefCell<Vec<(PageId, P)>>,
    freed: RefCell<Vec<PageId>>,
    committed: Cell<bool>,
}

impl<'a, P: Page + Clone, H: FileHeaderLike> RecoverySet<'a, P, H> {
    pub fn new(pool: &'a BufferPoolImpl<P, H>) -> Self {
        Self {
            pool,
            allocated: RefCell::new(Vec::new()),
            attached: RefCell::new(Vec::new()),
            freed: RefCell::new(Vec::new()),
            committed: Cell::new(false),
        }
    }

    /// Record that `page_id` was freshly allocated by this operation.
    pub fn record_allocated(&self, page_id: PageId) {
        self.allocated.borrow_mut().push(page_id);
    }

    /// Snapshot `page_id`'s current on-disk image before this operation
    /// mutates it in place, so a failure can restore it byte-for-byte
    /// (spec §8 scenario 5). A no-op if `page_id` was allocated by this
    /// same operation (nothing to roll back *to*) or has already been
    /// tracked.
    pub fn track(&self, page_id: PageId) -> Result<()> {
        if self.allocated.borrow().contains(&page_id) {
            return Ok(());
        }
        if self.attached.borrow().iter().any(|(id, _)| *id == page_id) {
            return Ok(());
        }
        let guard = self.pool.fetch_page(page_id)?;
        let image = guard.read().clone();
        self.attached.borrow_mut().push((page_id, image));
        Ok(())
    }

    /// Record that `page_id` was freed by this operation. The actual
    /// disk-manager deallocation is deferred to [`RecoverySet::commit`],
    /// so the page stays fully live (and trivially restorable) until the
    /// operation is known to have succeeded.
    pub fn record_freed(&self, page_id: PageId) {
        self.freed.borrow_mut().push(page_id);
    }

    /// Declare the operation successful: frees whatever this operation
    /// recorded as freed, and makes `Drop` a no-op.
    pub fn commit(&self) {
        self.committed.set(true);
        for page_id in self.freed.borrow_mut().drain(..) {
            if let Err(e) = self.pool.free_page(page_id) {
                log::error!("recovery: failed to free page {} on commit: {}", page_id, e);
            }
        }
    }
}

impl<'a, P: Page + Clone, H: FileHeaderLike> Drop for RecoverySet<'a, P, H> {
    fn drop(&mut self) {
        if self.committed.get() {
            return;
        }
        for (page_id, image) in self.attached.get_mut().drain(..) {
            match self.pool.fetch_page_mut(page_id) {
                Ok(guard) => {
                    *guard.write() = image;
                    log::warn!("recovery: restored pre-fix image of page {}", page_id);
                }
                Err(e) => log::error!("recovery: failed to restore page {}: {}", page_id, e),
            }
        }
        for page_id in self.allocated.get_mut().drain(..) {
            if let Err(e) = self.pool.free_page(page_id) {
                log::error!("recovery: failed to roll back allocated page {}: {}", page_id, e);
            } else {
                log::warn!("recovery: rolled back allocated page {}", page_id);
            }
        }
        let freed = self.freed.get_mut();
        if !freed.is_empty() {
            log::warn!(
                "recovery: discarding {} page free(s) recorded by a failed operation; pages remain live",
                freed.len()
            );
            freed.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{KeyRepr, NodeCell, NodePage};
    use crate::storage::{DiskManagerImpl, FileInformation};
    use crate::types::ObjectId;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn rollback_returns_allocated_page_to_the_free_list() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.path().join("t.db"), false).unwrap());
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 8);
        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);
        {
            let rs = RecoverySet::new(&pool);
            rs.record_allocated(page_id);
        }
        let (reused, guard) = pool.new_page().unwrap();
        drop(guard);
        assert_eq!(reused, page_id);
    }

    #[test]
    fn commit_keeps_allocated_pages() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.path().join("t.db"), false).unwrap());
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 8);
        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);
        {
            let rs = RecoverySet::new(&pool);
            rs.record_allocated(page_id);
            rs.commit();
        }
        assert!(pool.fetch_page(page_id).is_ok());
    }

    #[test]
    fn rollback_restores_pre_fix_image_of_a_tracked_page() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.path().join("t.db"), false).unwrap());
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 8);
        let (page_id, guard) = pool.new_page().unwrap();
        {
            let mut page = guard.write();
            page.insert_at(
                0,
                &NodeCell::new_leaf(KeyRepr::Inline(vec![1]), ObjectId::new(PageId::new(1), 0)),
            )
            .unwrap();
        }
        drop(guard);

        {
            let rs = RecoverySet::new(&pool);
            rs.track(page_id).unwrap();
            let guard = pool.fetch_page_mut(page_id).unwrap();
            guard
                .write()
                .insert_at(
                    1,
                    &NodeCell::new_leaf(KeyRepr::Inline(vec![2]), ObjectId::new(PageId::new(1), 1)),
                )
                .unwrap();
        }

        let guard = pool.fetch_page(page_id).unwrap();
        assert_eq!(guard.read().cell_count(), 1);
    }

    #[test]
    fn commit_leaves_tracked_page_mutation_in_place() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&dir.path().join("t.db"), false).unwrap());
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 8);
        let (page_id, guard) = pool.new_page().unwrap();
        drop(guard);

        {
            let rs = RecoverySet::new(&pool);
            rs.track(page_id).unwrap();
            let guard = pool.fetch_page_mut(page_id).unwrap();
            guard
                .write()
                .insert_at(
                    0,
                    &NodeCell::new_leaf(KeyRepr::Inline(vec![9]), ObjectId::new(PageId::new(1), 0)),
                )
                .unwrap();
            rs.commit();
        }

        let guard = pool.fetch_page(page_id).unwrap();
        assert_eq!(guard.read().cell_count(), 1);
    }
}
