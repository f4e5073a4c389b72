//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{Frame, FrameId};
use crate::hash_table::ExtendibleHashTable;
use crate::replacer::{LruKReplacer, Replacer};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{Result, StorageConfig, StrataError};
use sysinfo::System;

/// Entries per page-table bucket before it splits.
const PAGE_TABLE_BUCKET_SIZE: usize = 4;

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page id to frame id mapping (extendible hash directory)
/// - Free frame list for initial allocation
/// - LRU-K replacement for eviction
/// - Pin counting and dirty tracking per frame
///
/// A single pool latch serialises all bookkeeping, including the disk
/// I/O performed on eviction and fetch. Page data itself is protected by
/// the per-frame read/write latch, which callers take after pinning.
pub struct BufferPoolManager {
    /// Number of frames in the pool.
    pool_size: usize,
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Page id to frame id mapping.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Page replacement policy.
    replacer: LruKReplacer,
    /// Frames never yet used, handed out before eviction kicks in.
    free_list: Mutex<VecDeque<FrameId>>,
    /// The disk device.
    disk: Arc<DiskManager>,
    /// Pool-wide bookkeeping latch.
    latch: Mutex<()>,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames and LRU-K parameter `replacer_k`.
    pub fn new(pool_size: usize, replacer_k: usize, disk: Arc<DiskManager>) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");

        let frames: Vec<_> = (0..pool_size)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();
        let free_list: VecDeque<_> = (0..pool_size).map(|i| FrameId(i as u32)).collect();

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            free_list: Mutex::new(free_list),
            disk,
            latch: Mutex::new(()),
        }
    }

    /// Opens a buffer pool as described by a storage configuration.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::new(&config.data_path, config.fsync_enabled)?);
        Ok(Self::new(config.pool_frames, config.replacer_k, disk))
    }

    /// Creates a buffer pool sized to 25% of available system RAM,
    /// with a floor of 64 frames.
    pub fn auto_sized(replacer_k: usize, disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let pool_size = ((available_bytes / 4) / PAGE_SIZE).max(64);

        Self::new(pool_size, replacer_k, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of never-used frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the disk manager backing this pool.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns the frame holding a resident page, if any. Does not pin.
    pub fn peek_frame(&self, page_id: PageId) -> Option<&Frame> {
        let frame_id = self.page_table.find(&page_id)?;
        Some(&self.frames[frame_id.0 as usize])
    }

    /// Picks a frame to receive a page: the free list first, then a
    /// replacer victim whose old contents are written back if dirty.
    ///
    /// Caller must hold the pool latch.
    fn acquire_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.evict().ok_or(StrataError::PoolFull)?;
        let frame = &self.frames[frame_id.0 as usize];

        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(old_page_id, &data)?;
                frame.set_dirty(false);
            }
            self.page_table.remove(&old_page_id);
            debug!("evicted {} from {}", old_page_id, frame_id);
        }

        Ok(frame_id)
    }

    /// Allocates a fresh page and pins it into a frame.
    ///
    /// The returned frame is zeroed, pinned once, and marked clean.
    /// Fails with `PoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PageId, &Frame)> {
        let _guard = self.latch.lock();

        let frame_id = self.acquire_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        let page_id = self.disk.allocate_page();
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        trace!("new {} in {}", page_id, frame_id);
        Ok((page_id, frame))
    }

    /// Fetches a page, loading it from disk if it is not resident.
    ///
    /// The page is pinned before being returned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId);
        }
        let _guard = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame);
        }

        let frame_id = self.acquire_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        frame.reset();
        {
            let mut data = frame.write_data();
            self.disk.read_page(page_id, &mut data)?;
        }
        frame.set_page_id(page_id);
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        trace!("fetched {} into {}", page_id, frame_id);
        Ok(frame)
    }

    /// Drops one pin on a page, OR-ing `is_dirty` into its dirty flag.
    ///
    /// When the pin count reaches zero the frame becomes evictable.
    /// Returns false if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes a resident page to disk and clears its dirty flag.
    ///
    /// Returns true if the page was resident. The pool latch is dropped
    /// around the write itself: the frame is pinned across the I/O so it
    /// cannot be recycled, and the page latch alone orders the read
    /// against concurrent writers.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Ok(false);
        }

        let frame = {
            let _guard = self.latch.lock();
            let Some(frame_id) = self.page_table.find(&page_id) else {
                return Ok(false);
            };
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.set_evictable(frame_id, false);
            frame
        };

        let result = {
            let data = frame.read_data();
            self.disk.write_page(page_id, &data)
        };

        let _guard = self.latch.lock();
        if result.is_ok() {
            frame.set_dirty(false);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame.frame_id(), true);
        }
        result.map(|_| true)
    }

    /// Writes every resident page to disk and clears all dirty flags.
    pub fn flush_all(&self) -> Result<()> {
        let resident: Vec<PageId> = {
            let _guard = self.latch.lock();
            self.frames
                .iter()
                .map(|frame| frame.page_id())
                .filter(|page_id| page_id.is_valid())
                .collect()
        };
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Discards a page from the pool and deallocates it on disk.
    ///
    /// Returns false if the page is resident and pinned. A page that is
    /// not resident is deallocated directly.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            self.disk.deallocate_page(page_id);
            return Ok(true);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        self.replacer.set_evictable(frame_id, true);
        self.replacer.remove(frame_id);
        self.page_table.remove(&page_id);
        frame.reset();
        self.free_list.lock().push_back(frame_id);
        self.disk.deallocate_page(page_id);

        trace!("deleted {} from {}", page_id, frame_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_pool(pool_size: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("test.db"), false).unwrap());
        (BufferPoolManager::new(pool_size, 2, disk), dir)
    }

    #[test]
    fn test_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.pool_size(), 10);
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_pool_open_from_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_path: dir.path().join("cfg.db"),
            pool_frames: 8,
            replacer_k: 2,
            fsync_enabled: false,
        };

        let pool = BufferPoolManager::open(&config).unwrap();
        assert_eq!(pool.pool_size(), 8);

        let (page_id, _) = pool.new_page().unwrap();
        assert_eq!(page_id, PageId(0));
    }

    #[test]
    fn test_pool_new_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        assert_eq!(page_id, PageId(0));
        assert_eq!(frame.page_id(), page_id);
        assert_eq!(frame.pin_count(), 1);
        assert!(!frame.is_dirty());
        assert_eq!(pool.free_count(), 9);
    }

    #[test]
    fn test_pool_new_page_ids_monotonic() {
        let (pool, _dir) = create_test_pool(10);

        for expected in 0u32..5 {
            let (page_id, _) = pool.new_page().unwrap();
            assert_eq!(page_id, PageId(expected));
        }
    }

    #[test]
    fn test_pool_fetch_resident() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), page_id);
        assert_eq!(frame.pin_count(), 1);
    }

    #[test]
    fn test_pool_fetch_invalid() {
        let (pool, _dir) = create_test_pool(10);
        assert!(matches!(
            pool.fetch_page(PageId::INVALID),
            Err(StrataError::InvalidPageId)
        ));
    }

    #[test]
    fn test_pool_fetch_reloads_from_disk() {
        let (pool, _dir) = create_test_pool(1);

        let (p0, frame) = pool.new_page().unwrap();
        {
            let mut data = frame.write_data();
            data[0] = 0xAB;
        }
        pool.unpin_page(p0, true);

        // Evict p0 by allocating into the only frame
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p1, false);

        // Fetching p0 again reads it back from disk
        let frame = pool.fetch_page(p0).unwrap();
        assert_eq!(frame.read_data()[0], 0xAB);
    }

    #[test]
    fn test_pool_unpin_semantics() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        assert!(pool.unpin_page(page_id, false));
        assert_eq!(frame.pin_count(), 0);

        // Unpinning an unpinned page fails
        assert!(!pool.unpin_page(page_id, false));

        // Unpinning an unknown page fails
        assert!(!pool.unpin_page(PageId(999), false));
    }

    #[test]
    fn test_pool_dirty_flag_is_sticky() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        pool.fetch_page(page_id).unwrap();

        pool.unpin_page(page_id, true);
        // A later clean unpin must not clear the dirty flag
        pool.unpin_page(page_id, false);
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_pool_exhaustion_and_eviction() {
        let (pool, _dir) = create_test_pool(3);

        // Fill the pool with pinned pages
        let (p0, frame0) = pool.new_page().unwrap();
        let (p1, _) = pool.new_page().unwrap();
        let (p2, _) = pool.new_page().unwrap();
        assert_eq!((p0, p1, p2), (PageId(0), PageId(1), PageId(2)));

        // All pinned: no frame available
        assert!(matches!(pool.new_page(), Err(StrataError::PoolFull)));

        // Dirty up page 0 and release it
        {
            let mut data = frame0.write_data();
            data[0] = 0x42;
        }
        pool.unpin_page(p0, true);

        // The next allocation reuses frame 0 and writes page 0 back
        let (p3, frame) = pool.new_page().unwrap();
        assert_eq!(p3, PageId(3));
        assert_eq!(frame.frame_id(), FrameId(0));

        let mut buf = [0u8; PAGE_SIZE];
        pool.disk().read_page(p0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn test_pool_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        {
            let mut data = frame.write_data();
            data[7] = 0x77;
        }
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id).unwrap());
        assert!(!frame.is_dirty());

        let mut buf = [0u8; PAGE_SIZE];
        pool.disk().read_page(page_id, &mut buf).unwrap();
        assert_eq!(buf[7], 0x77);

        // Flushing a non-resident page reports a miss
        assert!(!pool.flush_page(PageId(500)).unwrap());
    }

    #[test]
    fn test_pool_flush_all() {
        let (pool, _dir) = create_test_pool(10);

        let mut pids = Vec::new();
        for i in 0..5u8 {
            let (page_id, frame) = pool.new_page().unwrap();
            frame.write_data()[0] = i;
            pool.unpin_page(page_id, true);
            pids.push(page_id);
        }

        pool.flush_all().unwrap();

        for (i, &page_id) in pids.iter().enumerate() {
            let mut buf = [0u8; PAGE_SIZE];
            pool.disk().read_page(page_id, &mut buf).unwrap();
            assert_eq!(buf[0], i as u8);
            assert!(!pool.peek_frame(page_id).unwrap().is_dirty());
        }
    }

    #[test]
    fn test_pool_delete_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();

        // Pinned pages cannot be deleted
        assert!(!pool.delete_page(page_id).unwrap());

        pool.unpin_page(page_id, false);
        assert!(pool.delete_page(page_id).unwrap());
        assert!(pool.peek_frame(page_id).is_none());
        assert_eq!(pool.free_count(), 10);

        // Deleting a non-resident page succeeds
        assert!(pool.delete_page(PageId(321)).unwrap());
    }

    #[test]
    fn test_pool_pin_balance_roundtrip() {
        let (pool, _dir) = create_test_pool(4);

        let (page_id, frame) = pool.new_page().unwrap();
        pool.fetch_page(page_id).unwrap();
        pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.pin_count(), 3);

        for _ in 0..3 {
            assert!(pool.unpin_page(page_id, false));
        }
        assert_eq!(frame.pin_count(), 0);

        // Balanced pins leave the page evictable again
        assert!(pool.delete_page(page_id).unwrap());
    }

    #[test]
    fn test_pool_scan_resistance() {
        let (pool, _dir) = create_test_pool(4);

        // A page with K recorded accesses holds a finite k-distance
        let (hot, _) = pool.new_page().unwrap();
        pool.unpin_page(hot, false);
        pool.fetch_page(hot).unwrap();
        pool.unpin_page(hot, false);

        // Churn single-use pages through the pool: they stay at infinite
        // distance and evict each other, never the hot page
        for _ in 0..8 {
            let (p, _) = pool.new_page().unwrap();
            pool.unpin_page(p, false);
        }
        assert!(pool.peek_frame(hot).is_some());
    }

    #[test]
    fn test_pool_lru_k_victim_order() {
        let (pool, _dir) = create_test_pool(2);

        let (p0, _) = pool.new_page().unwrap();
        let (p1, _) = pool.new_page().unwrap();
        pool.unpin_page(p0, false);
        pool.unpin_page(p1, false);

        // Touch p0 so p1 becomes the older candidate
        pool.fetch_page(p0).unwrap();
        pool.unpin_page(p0, false);

        let (_, _) = pool.new_page().unwrap();
        // p1 was evicted, p0 survives
        assert!(pool.peek_frame(p0).is_some());
        assert!(pool.peek_frame(p1).is_none());
    }
}
