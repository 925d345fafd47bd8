//! # Transaction
//!
//! A transaction is an identifier, not an isolation boundary. It exists so
//! that every page mutation pairs `(transaction id, old bytes, new bytes)`
//! into the write-ahead log. A future rollback implementation would scan
//! the log backwards applying compensation records; the present engine
//! only needs the forward log.
//!
//! All typed writes return the offset just past the written bytes, so
//! serialization code can thread a cursor through consecutive writes:
//!
//! ```ignore
//! let mut offset = start;
//! offset = txn.write(&page, offset, key)?;
//! offset = txn.write(&page, offset, entry_size)?;
//! ```

use eyre::{ensure, Result};
use zerocopy::{Immutable, IntoBytes};

use crate::storage::{PageHandle, PageOffset};

#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes one trivially-copyable value at `offset`, returning the
    /// offset after it.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        page: &PageHandle,
        offset: PageOffset,
        value: T,
    ) -> Result<PageOffset> {
        page.write_logged(self.id, offset, &value)
    }

    /// Writes a raw byte span at `offset`, returning the offset after it.
    pub fn write_bytes(
        &self,
        page: &PageHandle,
        offset: PageOffset,
        bytes: &[u8],
    ) -> Result<PageOffset> {
        page.write_logged(self.id, offset, bytes)
    }

    /// Writes a typed span at `offset`, returning the offset after it.
    pub fn write_span<T: IntoBytes + Immutable>(
        &self,
        page: &PageHandle,
        offset: PageOffset,
        values: &[T],
    ) -> Result<PageOffset> {
        page.write_logged(self.id, offset, values)
    }

    /// Copies `size` bytes within one page. Logged as a single update for
    /// the destination range; the source range is not logged.
    pub fn move_in_page(
        &self,
        page: &PageHandle,
        src: PageOffset,
        dst: PageOffset,
        size: PageOffset,
    ) -> Result<()> {
        let page_size = page.page_size();
        ensure!(
            src as usize + size as usize <= page_size,
            "move source {}..{} exceeds page size {}",
            src,
            src + size,
            page_size
        );
        ensure!(
            dst as usize + size as usize <= page_size,
            "move destination {}..{} exceeds page size {}",
            dst,
            dst + size,
            page_size
        );
        // Copy out first so overlapping ranges behave like memmove.
        let bytes = page.read_bytes(src, size as usize).to_vec();
        self.write_bytes(page, dst, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DataAccessLayer, PageCache, WriteAheadLog};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_cache(dir: &std::path::Path) -> Arc<PageCache> {
        let dal = Arc::new(DataAccessLayer::open(dir).unwrap());
        let wal = WriteAheadLog::open(&dir.join(crate::config::WAL_DIR_NAME)).unwrap();
        PageCache::new(dal, wal, 8).unwrap()
    }

    #[test]
    fn transaction_write_advances_offset() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let txn = Transaction::new(1);
        let page = cache.get_new().unwrap();

        let mut offset = 0;
        offset = txn.write(&page, offset, 0xAABBu16).unwrap();
        offset = txn.write(&page, offset, 0x11223344u32).unwrap();
        assert_eq!(offset, 6);

        assert_eq!(page.read::<u16>(0), 0xAABB);
        assert_eq!(page.read::<u32>(2), 0x11223344);
    }

    #[test]
    fn transaction_write_span_round_trips() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let txn = Transaction::new(1);
        let page = cache.get_new().unwrap();

        let values: [u16; 4] = [10, 20, 30, 40];
        let after = txn.write_span(&page, 64, &values).unwrap();
        assert_eq!(after, 64 + 8);

        assert_eq!(page.read_span::<u16>(64, 4), vec![10, 20, 30, 40]);
    }

    #[test]
    fn transaction_move_in_page_copies_bytes() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let txn = Transaction::new(1);
        let page = cache.get_new().unwrap();

        txn.write_bytes(&page, 10, b"hello").unwrap();
        txn.move_in_page(&page, 10, 100, 5).unwrap();

        assert_eq!(page.read_bytes(100, 5), b"hello");
        // Source is untouched.
        assert_eq!(page.read_bytes(10, 5), b"hello");
    }

    #[test]
    fn transaction_move_handles_overlap() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let txn = Transaction::new(1);
        let page = cache.get_new().unwrap();

        txn.write_bytes(&page, 20, b"abcdef").unwrap();
        txn.move_in_page(&page, 20, 23, 6).unwrap();

        assert_eq!(page.read_bytes(23, 6), b"abcdef");
    }

    #[test]
    fn transaction_move_rejects_out_of_bounds() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let txn = Transaction::new(1);
        let page = cache.get_new().unwrap();

        assert!(txn.move_in_page(&page, 4000, 100, 200).is_err());
        assert!(txn.move_in_page(&page, 100, 4000, 200).is_err());
    }
}
