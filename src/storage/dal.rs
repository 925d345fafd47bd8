//! # Data Access Layer
//!
//! The DAL owns the database file on disk. It keeps track of the structure
//! of the file (which pages are free, where the meta and free-list pages
//! live) and provides whole-page reads and writes. Interpreting page
//! contents is entirely the callers' business.
//!
//! ## Page Allocation
//!
//! New pages come from the free list: a released page is recycled first,
//! and only when the queue is empty is a fresh high-water page number
//! minted. Minting a fresh number is the only thing that grows the file,
//! and the DAL is the only component allowed to do it.
//!
//! ## Bootstrap Reads
//!
//! Page validity is judged against the free list, but the free list itself
//! is loaded from a page. Opening an existing database therefore reads the
//! meta page and the free-list page in unchecked mode; every other read is
//! validated.
//!
//! ## Concurrency
//!
//! File I/O happens under a reader-writer lock: page reads take it shared,
//! page writes and file growth take it exclusive. The free list and meta
//! record each sit behind their own mutex. Lock order within the DAL is
//! free list -> file.
//!
//! ## Shutdown
//!
//! Dropping the DAL re-serializes the meta record and, if it changed, the
//! free list. Both writes are best-effort: failures are logged, not raised.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::config::{DB_FILE_NAME, DEFAULT_PAGE_SIZE_POWER, META_PAGE_NUMBER};
use crate::storage::{FreeList, Meta, PageNumber};

pub struct DataAccessLayer {
    file_path: PathBuf,
    file: RwLock<File>,
    meta: Mutex<Meta>,
    free_list: Mutex<FreeList>,
    page_size: usize,
}

impl DataAccessLayer {
    /// Creates or opens the database file `neversql.db` inside `dir`,
    /// using the default page size for new databases.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_page_size_power(dir, DEFAULT_PAGE_SIZE_POWER)
    }

    /// Like [`open`](Self::open) with an explicit page size (2^power
    /// bytes) for new databases. An existing database keeps the page size
    /// recorded in its meta page.
    pub fn open_with_page_size_power(dir: &Path, page_size_power: u8) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create database directory {:?}", dir))?;
        let file_path = dir.join(DB_FILE_NAME);

        if file_path.exists() {
            Self::open_existing(file_path)
        } else {
            Self::create_new(file_path, page_size_power)
        }
    }

    fn create_new(file_path: PathBuf, page_size_power: u8) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_path)
            .wrap_err_with(|| format!("failed to create database file {:?}", file_path))?;

        let meta = Meta::new(page_size_power)?;
        let page_size = meta.page_size();

        let dal = Self {
            file_path,
            file: RwLock::new(file),
            meta: Mutex::new(meta),
            free_list: Mutex::new(FreeList::new()),
            page_size,
        };

        // Page 0 is the meta page, the next page holds the free list.
        let meta_page = dal.allocate_page()?;
        ensure!(
            meta_page == META_PAGE_NUMBER,
            "page 0 is not free in a new database, got page {}",
            meta_page
        );
        let free_list_page = dal.allocate_page()?;
        dal.meta.lock().set_free_list_page(free_list_page);

        dal.persist_meta()?;
        dal.persist_free_list()?;

        debug!(
            path = ?dal.file_path,
            page_size,
            free_list_page,
            "created new database file"
        );
        Ok(dal)
    }

    fn open_existing(file_path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
            .wrap_err_with(|| format!("failed to open database file {:?}", file_path))?;

        // The page size is not known until the meta page has been read, so
        // bootstrap with a minimal read of the meta header region.
        let mut probe = vec![0u8; 64];
        file.read_exact_at(&mut probe, 0)
            .wrap_err("failed to read meta page header")?;
        let meta = Meta::read_from(&probe)?;
        let page_size = meta.page_size();

        let dal = Self {
            file_path,
            file: RwLock::new(file),
            meta: Mutex::new(meta),
            free_list: Mutex::new(FreeList::new()),
            page_size,
        };

        // The free list has not been loaded yet, so its own page must be
        // read in unchecked mode.
        let free_list_page = dal.meta.lock().free_list_page();
        let mut buffer = vec![0u8; page_size];
        dal.read_page_unchecked(free_list_page, &mut buffer)?;
        *dal.free_list.lock() = FreeList::read_from(&buffer)?;

        debug!(
            path = ?dal.file_path,
            page_size,
            num_pages = dal.num_pages(),
            "opened existing database file"
        );
        Ok(dal)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages ever allocated (the free list's high-water mark).
    pub fn num_pages(&self) -> PageNumber {
        self.free_list.lock().num_allocated()
    }

    pub fn index_page(&self) -> PageNumber {
        self.meta.lock().index_page()
    }

    /// Records the collection-index root in the meta record and persists
    /// the meta page immediately.
    pub fn set_index_page(&self, page: PageNumber) -> Result<()> {
        self.meta.lock().set_index_page(page);
        self.persist_meta()
    }

    /// Pops a page from the free list or, if the queue is empty, assigns
    /// the next high-water number and grows the file by one page.
    pub fn allocate_page(&self) -> Result<PageNumber> {
        let mut free_list = self.free_list.lock();
        let page = free_list
            .pop()
            .expect("allocating free list always yields a page");
        if page == free_list.num_allocated() - 1 {
            // Fresh high-water page: the file has to grow to cover it.
            let file = self.file.write();
            let new_len = (page + 1) * self.page_size as u64;
            file.set_len(new_len)
                .wrap_err_with(|| format!("failed to grow database file to {} bytes", new_len))?;
            debug!(page, new_len, "extended database file for new page");
        }
        Ok(page)
    }

    /// Returns a page to the free list. Releasing a page that is already
    /// free is a silent no-op.
    pub fn release_page(&self, page: PageNumber) -> Result<()> {
        self.free_list.lock().release(page)?;
        Ok(())
    }

    /// Reads one whole page. Fails if the page is unallocated or free.
    pub fn read_page(&self, page: PageNumber, buffer: &mut [u8]) -> Result<()> {
        ensure!(
            self.free_list.lock().is_page_valid(page),
            "invalid page: page {} is not allocated",
            page
        );
        self.read_page_unchecked(page, buffer)
    }

    /// Reads one whole page without consulting the free list. Needed while
    /// bootstrapping (the meta and free-list pages themselves).
    pub fn read_page_unchecked(&self, page: PageNumber, buffer: &mut [u8]) -> Result<()> {
        ensure!(
            buffer.len() == self.page_size,
            "read buffer must be exactly one page: {} != {}",
            buffer.len(),
            self.page_size
        );
        let file = self.file.read();
        file.read_exact_at(buffer, page * self.page_size as u64)
            .wrap_err_with(|| format!("failed to read page {}", page))?;
        Ok(())
    }

    /// Writes one whole page under the exclusive file lock.
    pub fn write_page(&self, page: PageNumber, buffer: &[u8]) -> Result<()> {
        ensure!(
            buffer.len() == self.page_size,
            "write buffer must be exactly one page: {} != {}",
            buffer.len(),
            self.page_size
        );
        ensure!(
            page < self.free_list.lock().num_allocated(),
            "invalid page: page {} is beyond the allocated range",
            page
        );
        let file = self.file.write();
        file.write_all_at(buffer, page * self.page_size as u64)
            .wrap_err_with(|| format!("failed to write page {}", page))?;
        Ok(())
    }

    /// Re-serializes the meta record and, if it changed, the free list.
    /// Called on drop and at explicit checkpoints so the file stays
    /// self-consistent.
    pub fn persist(&self) -> Result<()> {
        self.persist_meta()?;
        self.persist_free_list()
    }

    fn persist_meta(&self) -> Result<()> {
        let mut buffer = vec![0u8; self.page_size];
        self.meta.lock().write_to(&mut buffer)?;
        let file = self.file.write();
        file.write_all_at(&buffer, META_PAGE_NUMBER * self.page_size as u64)
            .wrap_err("failed to write meta page")?;
        Ok(())
    }

    fn persist_free_list(&self) -> Result<()> {
        let free_list_page = self.meta.lock().free_list_page();
        if free_list_page == 0 {
            return Ok(());
        }
        let mut free_list = self.free_list.lock();
        if !free_list.is_dirty() {
            return Ok(());
        }
        let mut buffer = vec![0u8; self.page_size];
        free_list.write_to(&mut buffer)?;
        let file = self.file.write();
        file.write_all_at(&buffer, free_list_page * self.page_size as u64)
            .wrap_err("failed to write free list page")?;
        free_list.mark_clean();
        Ok(())
    }
}

impl Drop for DataAccessLayer {
    fn drop(&mut self) {
        if let Err(err) = self.persist_meta() {
            error!(?err, "failed to persist meta record on shutdown");
        }
        if let Err(err) = self.persist_free_list() {
            error!(?err, "failed to persist free list on shutdown");
        }
    }
}

impl std::fmt::Debug for DataAccessLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccessLayer")
            .field("file_path", &self.file_path)
            .field("page_size", &self.page_size)
            .field("num_pages", &self.num_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dal_create_allocates_meta_and_free_list_pages() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        assert_eq!(dal.num_pages(), 2);
        assert_eq!(dal.page_size(), 4096);
        assert_eq!(dal.index_page(), 0);
    }

    #[test]
    fn dal_reopen_preserves_meta() {
        let dir = tempdir().unwrap();
        {
            let dal = DataAccessLayer::open(dir.path()).unwrap();
            dal.set_index_page(17).unwrap();
        }
        let dal = DataAccessLayer::open(dir.path()).unwrap();
        assert_eq!(dal.index_page(), 17);
        assert_eq!(dal.num_pages(), 2);
    }

    #[test]
    fn dal_allocate_grows_the_file() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let page = dal.allocate_page().unwrap();
        assert_eq!(page, 2);

        let len = std::fs::metadata(dir.path().join(DB_FILE_NAME)).unwrap().len();
        assert_eq!(len, 3 * 4096);
    }

    #[test]
    fn dal_page_round_trip() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let page = dal.allocate_page().unwrap();
        let mut buffer = vec![0u8; 4096];
        buffer[0] = 0xAB;
        buffer[4095] = 0xCD;
        dal.write_page(page, &buffer).unwrap();

        let mut read_back = vec![0u8; 4096];
        dal.read_page(page, &mut read_back).unwrap();
        assert_eq!(read_back, buffer);
    }

    #[test]
    fn dal_read_rejects_unallocated_page() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let mut buffer = vec![0u8; 4096];
        let result = dal.read_page(9, &mut buffer);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid page"));
    }

    #[test]
    fn dal_read_rejects_released_page() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let page = dal.allocate_page().unwrap();
        dal.release_page(page).unwrap();

        let mut buffer = vec![0u8; 4096];
        assert!(dal.read_page(page, &mut buffer).is_err());
    }

    #[test]
    fn dal_released_page_is_recycled_fifo() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let a = dal.allocate_page().unwrap();
        let b = dal.allocate_page().unwrap();
        dal.release_page(a).unwrap();
        dal.release_page(b).unwrap();

        assert_eq!(dal.allocate_page().unwrap(), a);
        assert_eq!(dal.allocate_page().unwrap(), b);
    }

    #[test]
    fn dal_release_twice_is_silent() {
        let dir = tempdir().unwrap();
        let dal = DataAccessLayer::open(dir.path()).unwrap();

        let page = dal.allocate_page().unwrap();
        dal.release_page(page).unwrap();
        dal.release_page(page).unwrap();

        // Only one copy in the queue: both fresh allocations differ.
        let first = dal.allocate_page().unwrap();
        let second = dal.allocate_page().unwrap();
        assert_eq!(first, page);
        assert_ne!(second, page);
    }

    #[test]
    fn dal_free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let dal = DataAccessLayer::open(dir.path()).unwrap();
            let a = dal.allocate_page().unwrap();
            let _b = dal.allocate_page().unwrap();
            dal.release_page(a).unwrap();
        }
        let dal = DataAccessLayer::open(dir.path()).unwrap();
        assert_eq!(dal.num_pages(), 4);
        // The released page comes back before any new high-water page.
        assert_eq!(dal.allocate_page().unwrap(), 2);
    }
}
