//! # Entry Creation
//!
//! An entry is the value portion of a data cell. The B-tree writes the
//! cell's flags and key, then hands the cursor to an [`EntryBuilder`] to
//! produce the entry itself. Three shapes exist:
//!
//! ```text
//! Single page entry:
//! [entry_size: 2] [entry_data: entry_size bytes]
//!
//! Overflow header (payload did not fit inline):
//! [overflow_key: 8] [first_overflow_page: 8]
//!
//! Overflow continuation (cell on an overflow page, keyed by overflow_key):
//! [entry_size: 2] [next_page: 8] [chunk bytes]        entry_size = 8 + chunk
//! ```
//!
//! A continuation reads back as an ordinary single-page entry whose first
//! eight payload bytes name the next overflow page (zero terminates the
//! chain); the chain-walking logic lives in the reader.
//!
//! ## Payload Serializers
//!
//! Payload bytes come from a [`PayloadSerializer`], a byte generator with
//! `has_data` / `next_byte` / `required_size`. Implementations exist for
//! raw byte slices and for documents (which serialize themselves to a
//! buffer up front).
//!
//! ## Chain Population
//!
//! When a payload overflows, the creator mints an overflow key from the
//! tree, writes the 16-byte header on the originating leaf and then feeds
//! the payload through continuation cells: each chunk fills as much of the
//! current overflow page as possible, a fresh overflow page is allocated
//! whenever the current one cannot hold the continuation header plus a
//! minimum chunk, and continuations are linked forward by page number.
//!
//! ## Copying
//!
//! Splits re-emit existing cells verbatim through [`EntryCopier`], which
//! replays the stored payload with the cell's original flags. An overflow
//! header copied this way stays an overflow header; the chain it points to
//! is untouched.

use eyre::{ensure, Result};
use tracing::trace;
use zerocopy::{Immutable, IntoBytes};

use super::header::{cell_entry_size_serialized, CellFlags};
use super::node::NodePage;
use super::tree::{BTreeManager, StoreData};
use crate::config::{
    MIN_OVERFLOW_CHUNK, OVERFLOW_CONTINUATION_HEADER_SIZE, OVERFLOW_HEADER_SIZE,
};
use crate::document::Document;
use crate::storage::{PageHandle, PageNumber, PageOffset, Transaction};

/// Byte generator for entry payloads.
pub trait PayloadSerializer {
    /// Whether any payload bytes remain.
    fn has_data(&self) -> bool;

    /// The next payload byte. Only valid while `has_data` returns true.
    fn next_byte(&mut self) -> u8;

    /// Total size of the payload in bytes.
    fn required_size(&self) -> usize;
}

/// Payload backed by an owned byte buffer.
pub struct SlicePayload {
    bytes: Vec<u8>,
    position: usize,
}

impl SlicePayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, position: 0 }
    }

    /// Payload holding the little-endian bytes of one value, typically a
    /// child page number.
    pub fn from_value<T: IntoBytes + Immutable>(value: T) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl PayloadSerializer for SlicePayload {
    fn has_data(&self) -> bool {
        self.position < self.bytes.len()
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.bytes[self.position];
        self.position += 1;
        byte
    }

    fn required_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Payload that serializes a document (with its leading tag byte) up
/// front and then streams the buffer.
pub struct DocumentPayload {
    inner: SlicePayload,
}

impl DocumentPayload {
    pub fn new(document: &Document) -> Self {
        Self {
            inner: SlicePayload::new(crate::document::encode_document(document, true)),
        }
    }
}

impl PayloadSerializer for DocumentPayload {
    fn has_data(&self) -> bool {
        self.inner.has_data()
    }

    fn next_byte(&mut self) -> u8 {
        self.inner.next_byte()
    }

    fn required_size(&self) -> usize {
        self.inner.required_size()
    }
}

/// Object that knows how to create the entry portion of a cell.
///
/// The B-tree calls `requested_size` (which may flip the builder into
/// overflow mode), writes flags and key, then calls `create` with the
/// cursor positioned at the entry start.
pub trait EntryBuilder {
    /// Smallest entry this builder can currently produce. An overflow
    /// header needs 16 bytes, so that is the default floor.
    fn minimum_entry_size(&self) -> PageOffset {
        OVERFLOW_HEADER_SIZE
    }

    /// How much entry space the builder wants given the space available.
    /// May decide that an overflow chain is needed, in which case the
    /// answer collapses to the 16-byte header.
    fn requested_size(&mut self, maximum_entry_size: PageOffset) -> Result<PageOffset>;

    /// The builder's share of the cell flags. Called after
    /// `requested_size`.
    fn generate_flags(&self) -> u8;

    /// Whether `requested_size` decided on an overflow chain.
    fn needs_overflow(&self) -> bool;

    /// Writes the entry at `offset`, returning the offset after it.
    fn create(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        tree: &BTreeManager,
        txn: &Transaction,
    ) -> Result<PageOffset>;
}

/// The standard entry builder over a payload serializer.
pub struct EntryCreator<P: PayloadSerializer> {
    payload: P,
    serialize_size: bool,
    overflow_needed: bool,
    /// Set while populating an overflow chain: size of the chunk the next
    /// continuation cell carries.
    next_chunk_size: PageOffset,
    /// Page the next continuation links to; zero terminates the chain.
    next_overflow_page: PageNumber,
}

impl<P: PayloadSerializer> EntryCreator<P> {
    pub fn new(payload: P, serialize_size: bool) -> Self {
        Self {
            payload,
            serialize_size,
            overflow_needed: false,
            next_chunk_size: 0,
            next_overflow_page: 0,
        }
    }

    fn create_single_page_entry(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        txn: &Transaction,
    ) -> Result<PageOffset> {
        let mut offset = offset;
        if self.serialize_size {
            let entry_size = self.payload.required_size() as PageOffset;
            offset = txn.write(page, offset, entry_size)?;
        }
        let mut bytes = Vec::with_capacity(self.payload.required_size());
        while self.payload.has_data() {
            bytes.push(self.payload.next_byte());
        }
        txn.write_bytes(page, offset, &bytes)
    }

    fn create_continuation_entry(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        txn: &Transaction,
    ) -> Result<PageOffset> {
        // Reads back as a single-page entry: [entry_size][next_page][chunk].
        let entry_size = 8 + self.next_chunk_size;
        let mut offset = txn.write(page, offset, entry_size)?;
        offset = txn.write(page, offset, self.next_overflow_page)?;

        let mut chunk = Vec::with_capacity(self.next_chunk_size as usize);
        for _ in 0..self.next_chunk_size {
            debug_assert!(self.payload.has_data(), "chunk larger than payload");
            chunk.push(self.payload.next_byte());
        }
        trace!(
            page = page.page_number(),
            chunk = chunk.len(),
            next_page = self.next_overflow_page,
            "wrote overflow continuation"
        );
        txn.write_bytes(page, offset, &chunk)
    }

    fn create_overflow_entry(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        tree: &BTreeManager,
        txn: &Transaction,
    ) -> Result<PageOffset> {
        let overflow_key = tree.next_overflow_entry_number(txn)?;
        let mut offset = txn.write(page, offset, overflow_key)?;

        let first_page = self.pick_first_overflow_page(tree, txn)?;
        offset = txn.write(page, offset, first_page)?;
        trace!(
            overflow_key,
            first_page,
            size = self.payload.required_size(),
            "writing overflow chain"
        );

        self.write_chain(tree, txn, first_page, overflow_key)?;
        Ok(offset)
    }

    /// The tree's current overflow page if it can hold at least a
    /// continuation header, otherwise a fresh one.
    fn pick_first_overflow_page(
        &self,
        tree: &BTreeManager,
        txn: &Transaction,
    ) -> Result<PageNumber> {
        let mut page_number = tree.current_overflow_page(txn)?;
        let node = tree.load_node_page(page_number)?;
        let key_bytes = 0u64.to_le_bytes();
        if node.space_requirements(&key_bytes).max_entry_space <= OVERFLOW_CONTINUATION_HEADER_SIZE
        {
            page_number = self.allocate_suitable_page(tree, txn, MIN_OVERFLOW_CHUNK)?.0;
        }
        Ok(page_number)
    }

    /// Allocates overflow pages until one can hold the continuation
    /// header plus `wanted` payload bytes (a fresh page always can).
    fn allocate_suitable_page(
        &self,
        tree: &BTreeManager,
        txn: &Transaction,
        wanted: PageOffset,
    ) -> Result<(PageNumber, NodePage)> {
        let key_bytes = 0u64.to_le_bytes();
        loop {
            let page_number = tree.next_overflow_page(txn)?;
            let node = tree.load_node_page(page_number)?;
            let max = node.space_requirements(&key_bytes).max_entry_space;
            if OVERFLOW_CONTINUATION_HEADER_SIZE + wanted.min(MIN_OVERFLOW_CHUNK) < max {
                return Ok((page_number, node));
            }
        }
    }

    /// Streams the payload into continuation cells across one or more
    /// overflow pages, linking them forward.
    fn write_chain(
        &mut self,
        tree: &BTreeManager,
        txn: &Transaction,
        first_page: PageNumber,
        overflow_key: u64,
    ) -> Result<()> {
        let key_bytes = overflow_key.to_le_bytes();
        let total = self.payload.required_size();
        let mut written = 0usize;
        let mut node = tree.load_node_page(first_page)?;

        while self.payload.has_data() {
            let max = node.space_requirements(&key_bytes).max_entry_space;
            ensure!(
                max > OVERFLOW_CONTINUATION_HEADER_SIZE,
                "overflow page {} cannot hold a continuation header",
                node.page_number()
            );
            let capacity = max - OVERFLOW_CONTINUATION_HEADER_SIZE;
            let remaining = total - written;
            let needs_next_page = (capacity as usize) < remaining;

            let next = if needs_next_page {
                let remaining_after = remaining - capacity as usize;
                let wanted = remaining_after.min(MIN_OVERFLOW_CHUNK as usize) as PageOffset;
                Some(self.allocate_suitable_page(tree, txn, wanted)?)
            } else {
                None
            };

            self.next_chunk_size = (capacity as usize).min(remaining) as PageOffset;
            self.next_overflow_page = next.as_ref().map_or(0, |(page, _)| *page);

            let chunk = self.next_chunk_size as usize;
            let mut store = StoreData {
                key: &key_bytes,
                creator: self,
            };
            let added = tree.add_element_to_node(txn, &node, &mut store, true)?;
            ensure!(
                added,
                "failed to place overflow chunk for key {} on page {}",
                overflow_key,
                node.page_number()
            );
            written += chunk;

            if let Some((_, next_node)) = next {
                node = next_node;
            }
        }
        self.next_chunk_size = 0;
        self.next_overflow_page = 0;
        Ok(())
    }
}

impl<P: PayloadSerializer> EntryBuilder for EntryCreator<P> {
    fn minimum_entry_size(&self) -> PageOffset {
        if self.next_chunk_size != 0 {
            OVERFLOW_CONTINUATION_HEADER_SIZE + self.next_chunk_size
        } else {
            OVERFLOW_HEADER_SIZE
        }
    }

    fn requested_size(&mut self, maximum_entry_size: PageOffset) -> Result<PageOffset> {
        // Mid-chain: the size was fixed when the chunk was planned.
        if self.next_chunk_size != 0 {
            return Ok(OVERFLOW_CONTINUATION_HEADER_SIZE + self.next_chunk_size);
        }

        ensure!(
            OVERFLOW_HEADER_SIZE <= maximum_entry_size,
            "maximum entry size too small ({}, minimum is {})",
            maximum_entry_size,
            OVERFLOW_HEADER_SIZE
        );

        // Re-evaluated from scratch on every call: a creator that was
        // routed to overflow for a cramped page may fit inline after a
        // split moved it to a fresh one.
        let size = (if self.serialize_size { 2 } else { 0 }) + self.payload.required_size();
        self.overflow_needed = (maximum_entry_size as usize) < size;
        if self.overflow_needed {
            trace!(
                size,
                maximum_entry_size,
                "entry does not fit inline, overflow page needed"
            );
            return Ok(OVERFLOW_HEADER_SIZE);
        }
        Ok(size as PageOffset)
    }

    fn generate_flags(&self) -> u8 {
        let mut flags = CellFlags::ACTIVE;
        if self.serialize_size || self.overflow_needed {
            flags |= CellFlags::NOTE;
        }
        // An overflow header is the only non-single-page shape; cells on
        // the overflow pages themselves read back as single-page entries.
        if !(self.overflow_needed && self.next_chunk_size == 0) {
            flags |= CellFlags::SINGLE_PAGE_ENTRY;
        }
        flags
    }

    fn needs_overflow(&self) -> bool {
        self.overflow_needed
    }

    fn create(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        tree: &BTreeManager,
        txn: &Transaction,
    ) -> Result<PageOffset> {
        if self.next_chunk_size != 0 {
            return self.create_continuation_entry(offset, page, txn);
        }
        if self.overflow_needed {
            return self.create_overflow_entry(offset, page, tree, txn);
        }
        self.create_single_page_entry(offset, page, txn)
    }
}

/// Re-emits an existing cell's entry verbatim, preserving its original
/// flags. Used when splits copy cells between pages; an overflow header
/// stays an overflow header without touching its chain.
pub struct EntryCopier {
    inner: EntryCreator<SlicePayload>,
    flags: u8,
}

impl EntryCopier {
    pub fn new(flags: u8, payload: &[u8]) -> Self {
        Self {
            inner: EntryCreator::new(
                SlicePayload::new(payload.to_vec()),
                cell_entry_size_serialized(flags),
            ),
            flags,
        }
    }
}

impl EntryBuilder for EntryCopier {
    fn requested_size(&mut self, maximum_entry_size: PageOffset) -> Result<PageOffset> {
        let size = self.inner.requested_size(maximum_entry_size)?;
        // A copier replays the original flags, so it must never be
        // re-routed through a fresh overflow chain.
        ensure!(
            !self.inner.needs_overflow(),
            "copied cell of {} bytes does not fit in {} bytes of target space",
            self.inner.payload.required_size(),
            maximum_entry_size
        );
        Ok(size)
    }

    fn generate_flags(&self) -> u8 {
        self.flags
    }

    fn needs_overflow(&self) -> bool {
        self.inner.needs_overflow()
    }

    fn create(
        &mut self,
        offset: PageOffset,
        page: &PageHandle,
        tree: &BTreeManager,
        txn: &Transaction,
    ) -> Result<PageOffset> {
        self.inner.create(offset, page, tree, txn)
    }
}
