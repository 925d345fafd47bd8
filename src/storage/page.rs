//! # Page Handle
//!
//! A `PageHandle` is a pinned reference to one page resident in the cache.
//! While a handle is alive its frame cannot be evicted or remapped, so the
//! page bytes stay valid and stable. Dropping the handle releases the pin.
//!
//! ## Reading
//!
//! Reads are typed byte copies: `read::<T>` copies `size_of::<T>()` bytes
//! out of the page into a value. The page buffer is never reinterpreted in
//! place, so alignment of the target type is irrelevant and layout is
//! exactly the little-endian on-disk bytes.
//!
//! ## Writing
//!
//! There is no mutable access here. All writes go through a
//! [`Transaction`](crate::storage::Transaction), which records the old and
//! new bytes into the write-ahead log and marks the frame dirty.
//!
//! ## Cloning Ownership
//!
//! `new_handle` returns a second pinned handle to the same page, bumping
//! the frame's usage count. Iterators use this to hand out entries that
//! outlive the node object currently pointing at the leaf.

use std::sync::Arc;

use eyre::Result;
use zerocopy::{FromBytes, Immutable};

use crate::storage::cache::PageCache;
use crate::storage::{PageNumber, PageOffset};

pub struct PageHandle {
    cache: Arc<PageCache>,
    slot: usize,
    page_number: PageNumber,
}

impl PageHandle {
    pub(crate) fn new(cache: Arc<PageCache>, slot: usize, page_number: PageNumber) -> Self {
        Self {
            cache,
            slot,
            page_number,
        }
    }

    pub fn page_number(&self) -> PageNumber {
        self.page_number
    }

    pub fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    /// Reads a value of type `T` at `offset` by copying bytes out of the
    /// page.
    ///
    /// Panics if the read would run past the end of the page; offsets are
    /// derived from validated headers, so that is a corruption bug, not a
    /// recoverable condition.
    pub fn read<T: FromBytes>(&self, offset: PageOffset) -> T {
        let bytes = self.read_bytes(offset, size_of::<T>());
        T::read_from_bytes(bytes).expect("size checked by read_bytes")
    }

    /// Borrows `len` raw bytes starting at `offset`.
    ///
    /// Panics if the range runs past the end of the page.
    pub fn read_bytes(&self, offset: PageOffset, len: usize) -> &[u8] {
        let offset = offset as usize;
        let data = self.cache.frame_bytes(self.slot);
        assert!(
            offset + len <= data.len(),
            "page read out of bounds: offset {} + len {} > page size {}",
            offset,
            len,
            data.len()
        );
        &data[offset..offset + len]
    }

    /// Reads `count` consecutive values of type `T` starting at `offset`,
    /// copying each one out of the page.
    pub fn read_span<T: FromBytes>(&self, offset: PageOffset, count: usize) -> Vec<T> {
        let bytes = self.read_bytes(offset, count * size_of::<T>());
        bytes
            .chunks_exact(size_of::<T>())
            .map(|chunk| T::read_from_bytes(chunk).expect("chunk size matches T"))
            .collect()
    }

    /// Returns another pinned handle to the same page.
    pub fn new_handle(&self) -> PageHandle {
        self.cache.pin_again(self.slot);
        PageHandle {
            cache: Arc::clone(&self.cache),
            slot: self.slot,
            page_number: self.page_number,
        }
    }

    pub(crate) fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Write path used by [`Transaction`](crate::storage::Transaction):
    /// logs (old, new) into the WAL, copies the new bytes into the frame
    /// and marks it dirty.
    pub(crate) fn write_logged<T: zerocopy::IntoBytes + Immutable + ?Sized>(
        &self,
        transaction: u64,
        offset: PageOffset,
        value: &T,
    ) -> Result<PageOffset> {
        let bytes = value.as_bytes();
        self.cache
            .write_to_page(transaction, self.slot, self.page_number, offset, bytes)?;
        Ok(offset + bytes.len() as PageOffset)
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cache.unpin(self.slot);
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_number", &self.page_number)
            .field("slot", &self.slot)
            .finish()
    }
}
