//! Scoped latch and pin bookkeeping for tree operations.

use log::debug;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use strata_buffer::{BufferPoolManager, Frame};
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::Result;

type ReadGuard<'a> = RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>;
type WriteGuard<'a> = RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>;

/// A latch held on a pinned page.
pub(crate) enum PageLatch<'a> {
    Shared(ReadGuard<'a>),
    Exclusive(WriteGuard<'a>),
}

/// One pinned-and-latched page tracked by a [`LatchContext`].
pub(crate) struct LatchedPage<'a> {
    pub page_id: PageId,
    frame: &'a Frame,
    latch: Option<PageLatch<'a>>,
    /// Whether this operation mutated the page; drives the unpin flag.
    pub dirty: bool,
}

impl<'a> LatchedPage<'a> {
    pub fn data(&self) -> &[u8] {
        match self.latch.as_ref().expect("page is latched") {
            PageLatch::Shared(guard) => &(**guard)[..],
            PageLatch::Exclusive(guard) => &(**guard)[..],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.latch.as_mut().expect("page is latched") {
            PageLatch::Exclusive(guard) => &mut (**guard)[..],
            PageLatch::Shared(_) => panic!("page is latched for reading"),
        }
    }

    /// Drops the latch but keeps the pin, so the frame cannot be recycled.
    pub fn unlatch(&mut self) {
        self.latch = None;
    }

    /// Re-takes the write latch after [`unlatch`](Self::unlatch).
    pub fn relatch_write(&mut self) {
        debug_assert!(self.latch.is_none());
        self.latch = Some(PageLatch::Exclusive(self.frame.write_data()));
    }
}

/// The ordered set of pages latched by one tree operation.
///
/// Pages are pushed in descent order and released either eagerly (when
/// crabbing proves a child safe) or all at once when the operation
/// finishes. Every release drops the latch first and then the pin,
/// carrying the recorded dirty flag. Pages scheduled for deletion are
/// deleted only after the last latch is gone.
///
/// Dropping the context releases everything, so early returns and error
/// paths cannot leak a latch or a pin.
pub(crate) struct LatchContext<'a> {
    pool: &'a BufferPoolManager,
    pages: Vec<LatchedPage<'a>>,
    deleted: Vec<PageId>,
}

impl<'a> LatchContext<'a> {
    pub fn new(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> &LatchedPage<'a> {
        &self.pages[index]
    }

    pub fn page_mut(&mut self, index: usize) -> &mut LatchedPage<'a> {
        &mut self.pages[index]
    }

    pub fn last(&self) -> &LatchedPage<'a> {
        self.pages.last().expect("context is not empty")
    }

    pub fn last_mut(&mut self) -> &mut LatchedPage<'a> {
        self.pages.last_mut().expect("context is not empty")
    }

    /// Position of a page in the context, if latched by this operation.
    pub fn position(&self, page_id: PageId) -> Option<usize> {
        self.pages.iter().position(|p| p.page_id == page_id)
    }

    /// Pins `page_id` and pushes it latched for reading.
    pub fn latch_read(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.pool.fetch_page(page_id)?;
        let guard = frame.read_data();
        self.pages.push(LatchedPage {
            page_id,
            frame,
            latch: Some(PageLatch::Shared(guard)),
            dirty: false,
        });
        Ok(())
    }

    /// Pins `page_id` and pushes it latched for writing.
    pub fn latch_write(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.pool.fetch_page(page_id)?;
        let guard = frame.write_data();
        self.pages.push(LatchedPage {
            page_id,
            frame,
            latch: Some(PageLatch::Exclusive(guard)),
            dirty: false,
        });
        Ok(())
    }

    /// Pushes a page whose pin and write latch the caller already holds.
    pub fn push_latched_write(
        &mut self,
        page_id: PageId,
        frame: &'a Frame,
        guard: WriteGuard<'a>,
    ) {
        self.pages.push(LatchedPage {
            page_id,
            frame,
            latch: Some(PageLatch::Exclusive(guard)),
            dirty: false,
        });
    }

    fn release(&self, mut page: LatchedPage<'a>) {
        page.latch = None;
        self.pool.unpin_page(page.page_id, page.dirty);
    }

    /// Releases every page above the deepest one, oldest first.
    pub fn release_ancestors(&mut self) {
        while self.pages.len() > 1 {
            let page = self.pages.remove(0);
            self.release(page);
        }
    }

    /// Releases the deepest page.
    pub fn pop_release(&mut self) {
        let page = self.pages.pop().expect("context is not empty");
        self.release(page);
    }

    /// Schedules a page for deletion once all latches are released.
    pub fn schedule_delete(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    /// Releases every page, deepest first, then performs scheduled deletions.
    pub fn release_all(&mut self) {
        while let Some(page) = self.pages.pop() {
            self.release(page);
        }
        for page_id in std::mem::take(&mut self.deleted) {
            match self.pool.delete_page(page_id) {
                Ok(true) => {}
                Ok(false) => debug!("deferred delete of pinned {}", page_id),
                Err(err) => debug!("delete of {} failed: {}", page_id, err),
            }
        }
    }
}

impl Drop for LatchContext<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
