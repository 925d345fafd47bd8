//! # Entry Reading
//!
//! Decodes the value portion of a data cell back out of the tree. The
//! flags byte at the cell start says which shape follows:
//!
//! - a **single-page entry** yields its payload in one shot from the page
//!   it lives on;
//! - an **overflow entry** starts from the 16-byte header on the leaf,
//!   loads the first overflow page, and walks the chain one page at a
//!   time; each continuation's first eight payload bytes name the next
//!   page (zero terminates).
//!
//! Entries hold pinned page handles of their own (cloned via
//! `new_handle`), so they stay valid after the node object that produced
//! them is gone. `collect` concatenates every chunk into one owned buffer,
//! which for an overflow chain is exactly the original payload.

use eyre::{ensure, eyre, Result};

use super::header::{
    cell_is_active, cell_is_single_page, cell_key_size_serialized,
};
use super::node::{Cell, NodePage};
use super::tree::BTreeManager;
use crate::storage::{PageHandle, PageNumber, PageOffset};

/// A readable entry: either fully inline or spread over an overflow
/// chain.
pub enum DatabaseEntry<'t> {
    SinglePage(SinglePageEntry),
    Overflow(OverflowEntry<'t>),
}

pub struct SinglePageEntry {
    page: PageHandle,
    payload_offset: PageOffset,
    payload_size: PageOffset,
}

pub struct OverflowEntry<'t> {
    overflow_key: u64,
    next_page: PageNumber,
    node: NodePage,
    tree: &'t BTreeManager,
}

impl<'t> DatabaseEntry<'t> {
    /// The payload bytes visible on the current page: everything for a
    /// single-page entry, the current chunk for an overflow entry.
    pub fn data(&self) -> Result<&[u8]> {
        match self {
            DatabaseEntry::SinglePage(entry) => Ok(entry
                .page
                .read_bytes(entry.payload_offset, entry.payload_size as usize)),
            DatabaseEntry::Overflow(entry) => entry.chunk(),
        }
    }

    /// Advances an overflow entry to its next chunk. Returns `false` when
    /// there is nothing further (always, for a single-page entry).
    pub fn advance(&mut self) -> Result<bool> {
        match self {
            DatabaseEntry::SinglePage(_) => Ok(false),
            DatabaseEntry::Overflow(entry) => entry.advance(),
        }
    }

    /// Concatenates every chunk into one owned buffer.
    pub fn collect(mut self) -> Result<Vec<u8>> {
        let mut bytes = self.data()?.to_vec();
        while self.advance()? {
            bytes.extend_from_slice(self.data()?);
        }
        Ok(bytes)
    }
}

impl<'t> OverflowEntry<'t> {
    fn chunk_payload(&self) -> Result<&[u8]> {
        let node = &self.node;
        let offset = node.cell_by_key(&self.overflow_key.to_le_bytes()).ok_or_else(|| {
            eyre!(
                "overflow chain broken: no cell for overflow key {} on page {}",
                self.overflow_key,
                node.page_number()
            )
        })?;
        match node.cell(offset)? {
            Cell::Data(cell) => Ok(cell.payload),
            Cell::Pointers(_) => Err(eyre!(
                "corrupt page: pointers cell on overflow page {}",
                node.page_number()
            )),
        }
    }

    /// The chunk bytes on the current page, with the 8-byte next-page
    /// link stripped.
    fn chunk(&self) -> Result<&[u8]> {
        let payload = self.chunk_payload()?;
        ensure!(
            payload.len() >= 8,
            "overflow continuation on page {} is shorter than its link",
            self.node.page_number()
        );
        Ok(&payload[8..])
    }

    fn read_next_link(&self) -> Result<PageNumber> {
        let payload = self.chunk_payload()?;
        ensure!(
            payload.len() >= 8,
            "overflow continuation on page {} is shorter than its link",
            self.node.page_number()
        );
        Ok(u64::from_le_bytes(payload[..8].try_into().unwrap()))
    }

    fn advance(&mut self) -> Result<bool> {
        if self.next_page == 0 {
            return Ok(false);
        }
        self.node = self.tree.load_node_page(self.next_page)?;
        self.next_page = self.read_next_link()?;
        Ok(true)
    }
}

/// Decodes the cell starting at `cell_offset` on `page` into a readable
/// entry. The handle is consumed so the entry can outlive the caller's
/// node object.
pub(crate) fn read_entry(
    cell_offset: PageOffset,
    page: PageHandle,
    tree: &BTreeManager,
) -> Result<DatabaseEntry<'_>> {
    let flags: u8 = page.read(cell_offset);
    ensure!(
        cell_is_active(flags),
        "cannot load entry: inactive cell at offset {} on page {}",
        cell_offset,
        page.page_number()
    );

    // Skip flags and key.
    let mut entry_offset = cell_offset + 1;
    if cell_key_size_serialized(flags) {
        let key_size: u16 = page.read(entry_offset);
        entry_offset += 2 + key_size;
    } else {
        entry_offset += 8;
    }

    if cell_is_single_page(flags) {
        let entry_size: u16 = page.read(entry_offset);
        return Ok(DatabaseEntry::SinglePage(SinglePageEntry {
            page,
            payload_offset: entry_offset + 2,
            payload_size: entry_size,
        }));
    }

    // Overflow header: [overflow_key: 8][first_overflow_page: 8].
    let overflow_key: u64 = page.read(entry_offset);
    let first_page: PageNumber = page.read(entry_offset + 8);
    drop(page);

    let node = tree.load_node_page(first_page)?;
    let mut entry = OverflowEntry {
        overflow_key,
        next_page: 0,
        node,
        tree,
    };
    entry.next_page = entry.read_next_link()?;
    Ok(DatabaseEntry::Overflow(entry))
}
