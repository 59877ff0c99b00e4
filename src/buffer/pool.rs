//! Buffer pool implementation.
//!
//! The buffer pool manages a fixed number of in-memory page frames,
//! caching pages read from disk and writing dirty pages back. It is
//! generic over the page type so one implementation backs both the
//! Tree file's [`crate::page::NodePage`]s and the Value file's object
//! pages.

use crate::buffer::lru::LruCache;
use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::storage::{DiskManager, FileHeaderLike};
use crate::types::PageId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for buffer pool operations
pub trait BufferPool<P: Page>: Send + Sync {
    fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_, P>>;
    fn fetch_page_mut(&self, page_id: PageId) -> Result<PageGuardMut<'_, P>>;
    fn new_page(&self) -> Result<(PageId, PageGuardMut<'_, P>)>;
    fn flush_page(&self, page_id: PageId) -> Result<()>;
    fn flush_all(&self) -> Result<()>;
    fn free_page(&self, page_id: PageId) -> Result<()>;
    fn page_count(&self) -> usize;
    fn capacity(&self) -> usize;
}

struct BufferFrame<P> {
    page: P,
    dirty: bool,
    pin_count: u32,
}

impl<P> BufferFrame<P> {
    fn new(page: P) -> Self {
        Self {
            page,
            dirty: false,
            pin_count: 0,
        }
    }
}

/// Buffer pool implementation, generic over the page type `P` and the
/// backing file's header type `H`.
pub struct BufferPoolImpl<P: Page, H: FileHeaderLike> {
    disk_manager: Arc<dyn DiskManager<H>>,
    frames: RwLock<HashMap<PageId, Arc<RwLock<BufferFrame<P>>>>>,
    lru: RwLock<LruCache>,
    capacity: usize,
}

impl<P: Page, H: FileHeaderLike> BufferPoolImpl<P, H> {
    pub fn new(disk_manager: Arc<dyn DiskManager<H>>, capacity: usize) -> Self {
        Self {
            disk_manager,
            frames: RwLock::new(HashMap::with_capacity(capacity)),
            lru: RwLock::new(LruCache::new(capacity)),
            capacity,
        }
    }

    fn get_frame(&self, page_id: PageId) -> Result<Arc<RwLock<BufferFrame<P>>>> {
        {
            let frames = self.frames.read();
            if let Some(frame) = frames.get(&page_id) {
                let mut lru = self.lru.write();
                lru.access(page_id.value());
                return Ok(Arc::clone(frame));
            }
        }
        self.load_page(page_id)
    }

    fn load_page(&self, page_id: PageId) -> Result<Arc<RwLock<BufferFrame<P>>>> {
        let page_buf = self.disk_manager.read_page(page_id)?;
        let page = P::decode(page_buf.as_bytes())?;

        {
            let frames = self.frames.read();
            if frames.len() >= self.capacity {
                drop(frames);
                self.evict_one()?;
            }
        }

        let frame = Arc::new(RwLock::new(BufferFrame::new(page)));
        {
            let mut frames = self.frames.write();
            frames.insert(page_id, Arc::clone(&frame));
        }
        {
            let mut lru = self.lru.write();
            lru.access(page_id.value());
        }

        Ok(frame)
    }

    /// Evict one unpinned page. Per spec §5 "Memory pressure", the tree
    /// layer retries a failed operation once after a `BufferPoolExhausted`
    /// signal with any page-caching flag it holds relaxed; this method
    /// itself just reports exhaustion so that policy can run.
    fn evict_one(&self) -> Result<()> {
        let mut lru = self.lru.write();

        loop {
            let page_id = match lru.pop_lru() {
                Some(id) => PageId::new(id),
                None => {
                    log::warn!("buffer pool exhausted: no unpinned frame to evict");
                    return Err(StorageError::BufferPoolExhausted);
                }
            };

            let frames = self.frames.read();
            if let Some(frame) = frames.get(&page_id) {
                let frame_guard = frame.read();
                if frame_guard.pin_count == 0 {
                    drop(frame_guard);
                    drop(frames);

                    self.flush_page(page_id)?;

                    let mut frames = self.frames.write();
                    frames.remove(&page_id);
                    return Ok(());
                }
                lru.access(page_id.value());
            }
        }
    }
}

impl<P: Page, H: FileHeaderLike> BufferPool<P> for BufferPoolImpl<P, H> {
    fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_, P>> {
        let frame = self.get_frame(page_id)?;
        {
            let mut f = frame.write();
            f.pin_count += 1;
        }
        Ok(PageGuard {
            page_id,
            frame,
            pool: self,
        })
    }

    fn fetch_page_mut(&self, page_id: PageId) -> Result<PageGuardMut<'_, P>> {
        let frame = self.get_frame(page_id)?;
        {
            let mut f = frame.write();
            f.pin_count += 1;
            f.dirty = true;
        }
        Ok(PageGuardMut {
            page_id,
            frame,
            pool: self,
        })
    }

    fn new_page(&self) -> Result<(PageId, PageGuardMut<'_, P>)> {
        let page_id = self.disk_manager.allocate_page()?;
        log::debug!("allocated page {}", page_id);

        let page = P::blank();
        let frame = Arc::new(RwLock::new(BufferFrame {
            page,
            dirty: true,
            pin_count: 1,
        }));

        {
            let mut frames = self.frames.write();
            frames.insert(page_id, Arc::clone(&frame));
        }
        {
            let mut lru = self.lru.write();
            lru.access(page_id.value());
        }

        Ok((
            page_id,
            PageGuardMut {
                page_id,
                frame,
                pool: self,
            },
        ))
    }

    fn flush_page(&self, page_id: PageId) -> Result<()> {
        let frames = self.frames.read();
        if let Some(frame) = frames.get(&page_id) {
            let mut frame_guard = frame.write();
            if frame_guard.dirty {
                let data = frame_guard.page.encode();
                self.disk_manager.write_page(page_id, data.as_bytes())?;
                frame_guard.dirty = false;
            }
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let frames = self.frames.read();
        for (&page_id, frame) in frames.iter() {
            let mut frame_guard = frame.write();
            if frame_guard.dirty {
                let data = frame_guard.page.encode();
                self.disk_manager.write_page(page_id, data.as_bytes())?;
                frame_guard.dirty = false;
            }
        }
        self.disk_manager.sync()?;
        Ok(())
    }

    fn free_page(&self, page_id: PageId) -> Result<()> {
        {
            let mut frames = self.frames.write();
            frames.remove(&page_id);
        }
        {
            let mut lru = self.lru.write();
            lru.remove(page_id.value());
        }
        self.disk_manager.deallocate_page(page_id)?;
        log::debug!("freed page {}", page_id);
        Ok(())
    }

    fn page_count(&self) -> usize {
        self.disk_manager.header().page_count() as usize
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII guard for read access to a page
pub struct PageGuard<'a, P: Page> {
    page_id: PageId,
    frame: Arc<RwLock<BufferFrame<P>>>,
    pool: &'a dyn BufferPoolLru,
}

/// The subset of pool state a guard's `Drop` needs to update; kept as a
/// separate object-safe trait so guards don't need to know the pool's
/// header type parameter.
trait BufferPoolLru: Send + Sync {
    fn touch_lru(&self, page_id: PageId);
}

impl<P: Page, H: FileHeaderLike> BufferPoolLru for BufferPoolImpl<P, H> {
    fn touch_lru(&self, page_id: PageId) {
        let mut lru = self.lru.write();
        lru.access(page_id.value());
    }
}

impl<'a, P: Page> PageGuard<'a, P> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> PageRef<'_, P> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a, P: Page> Drop for PageGuard<'a, P> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.pool.touch_lru(self.page_id);
    }
}

pub struct PageRef<'a, P: Page> {
    guard: RwLockReadGuard<'a, BufferFrame<P>>,
}

impl<'a, P: Page> std::ops::Deref for PageRef<'a, P> {
    type Target = P;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

/// RAII guard for write access to a page
pub struct PageGuardMut<'a, P: Page> {
    page_id: PageId,
    frame: Arc<RwLock<BufferFrame<P>>>,
    pool: &'a dyn BufferPoolLru,
}

impl<'a, P: Page> PageGuardMut<'a, P> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn write(&self) -> PageRefMut<'_, P> {
        let mut guard = self.frame.write();
        guard.dirty = true;
        PageRefMut { guard }
    }

    pub fn read(&self) -> PageRef<'_, P> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a, P: Page> Drop for PageGuardMut<'a, P> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.pool.touch_lru(self.page_id);
    }
}

pub struct PageRefMut<'a, P: Page> {
    guard: RwLockWriteGuard<'a, BufferFrame<P>>,
}

impl<'a, P: Page> std::ops::Deref for PageRefMut<'a, P> {
    type Target = P;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

impl<'a, P: Page> std::ops::DerefMut for PageRefMut<'a, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{KeyRepr, NodeCell, NodePage};
    use crate::storage::{DiskManagerImpl, FileInformation};
    use crate::types::ObjectId;
    use tempfile::tempdir;

    #[test]
    fn new_page_and_fetch_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&path, false)?);
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 10);

        let page_id = {
            let (page_id, guard) = pool.new_page()?;
            {
                let mut page = guard.write();
                page.insert_at(
                    0,
                    &NodeCell::new_leaf(
                        KeyRepr::Inline(b"hello".to_vec()),
                        ObjectId::new(PageId::new(1), 0),
                    ),
                )?;
            }
            page_id
        };

        pool.flush_all()?;

        let guard = pool.fetch_page(page_id)?;
        let page = guard.read();
        assert_eq!(page.cell_count(), 1);

        Ok(())
    }

    #[test]
    fn eviction_reclaims_unpinned_frames() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let dm = Arc::new(DiskManagerImpl::<FileInformation>::open(&path, false)?);
        let pool: BufferPoolImpl<NodePage, FileInformation> = BufferPoolImpl::new(dm, 2);

        for _ in 0..5 {
            let (_, guard) = pool.new_page()?;
            drop(guard);
        }
        pool.flush_all()?;
        Ok(())
    }
}
