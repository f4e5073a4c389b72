//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::Result;

/// Manages reading and writing pages of a single data file.
///
/// Page ids are allocated monotonically and map directly to file
/// offsets (`pid * PAGE_SIZE`). Deallocation is a logical release
/// only; the file is never shrunk.
pub struct DiskManager {
    /// Path to the data file.
    path: PathBuf,
    /// The open file handle.
    file: Mutex<File>,
    /// Next page id to hand out.
    next_page_id: AtomicU32,
    /// Enable fsync after writes.
    fsync_enabled: bool,
}

impl DiskManager {
    /// Opens or creates the data file at the given path.
    ///
    /// If the file already contains pages, allocation resumes after the
    /// last existing page.
    pub fn new(path: impl AsRef<Path>, fsync_enabled: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            path,
            file: Mutex::new(file),
            next_page_id: AtomicU32::new(num_pages),
            fsync_enabled,
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a page from disk into the given buffer.
    ///
    /// Pages that were allocated but never written read back as zeroes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        debug_assert!(page_id.is_valid());

        let mut file = self.file.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        let file_size = file.metadata()?.len();

        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        if offset + PAGE_SIZE as u64 <= file_size {
            file.read_exact(buf)?;
        } else {
            // Partial trailing page: read what exists, zero the rest
            let avail = (file_size - offset) as usize;
            file.read_exact(&mut buf[..avail])?;
            buf[avail..].fill(0);
        }
        Ok(())
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        debug_assert!(page_id.is_valid());

        let mut file = self.file.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;

        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Allocates a new page id.
    ///
    /// Allocation is monotonic; the page is materialised in the file on
    /// first write.
    pub fn allocate_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Logically releases a page id.
    ///
    /// Freed pages are not reused and the file is not shrunk.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Returns the number of pages allocated so far.
    pub fn num_allocated(&self) -> u32 {
        self.next_page_id.load(Ordering::Acquire)
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
