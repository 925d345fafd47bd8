//! # Slotted Node
//!
//! Interprets one pinned page as a slotted B-tree node: the fixed header,
//! a growing array of 2-byte cell offsets sorted by key, a free gap, and
//! a cell heap growing down from `reserved_start`.
//!
//! ```text
//! ┌────────────┬─────────────┬────────────┬─────────────┬──────────────┐
//! │ Header     │ Pointers    │ Free space │ Cell heap   │ Reserved     │
//! │ 31 bytes   │ ..free_begin│ ..free_end │ ..reserved  │ ..page_size  │
//! └────────────┴─────────────┴────────────┴─────────────┴──────────────┘
//! ```
//!
//! ## Cell Shapes
//!
//! Data cell (leaf or overflow page):
//!
//! ```text
//! [flags: 1] [key_size: 2]? [key] [entry_size: 2]? [payload]
//! ```
//!
//! An overflow header cell omits the entry size; its payload is exactly 16
//! bytes (`[overflow_key: 8][first_overflow_page: 8]`), which the flags
//! byte distinguishes from a single-page entry.
//!
//! Pointers cell (interior or root page):
//!
//! ```text
//! [flags: 1] [key_size: 2]? [key] [child_page: 8]
//! ```
//!
//! A pointers page additionally stores its rightmost child in the header's
//! `additional_data` slot: a page with N cells has N + 1 children.
//!
//! ## Key Comparison
//!
//! The comparator is a tree property, not stored on the page: u64 keys
//! compare numerically (8-byte little-endian), string keys compare
//! lexicographically. Overflow pages always compare their 8-byte overflow
//! keys numerically regardless of the tree's key type.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use super::header::{
    cell_entry_size_serialized, cell_is_active, cell_is_single_page, cell_key_size_serialized,
    offsets, NodeFlags, PageType, NODE_MAGIC, OVERFLOW_MAGIC, POINTER_SIZE,
};
use crate::config::OVERFLOW_HEADER_SIZE;
use crate::storage::{PageHandle, PageNumber, PageOffset, Transaction};

/// How keys on a page are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyOrder {
    /// 8-byte little-endian unsigned integers, compared numerically.
    UInt64,
    /// Raw bytes, compared lexicographically.
    Lexicographic,
}

impl KeyOrder {
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::UInt64 => {
                debug_assert!(a.len() == 8 && b.len() == 8, "u64 keys must be 8 bytes");
                let left = u64::from_le_bytes(a.try_into().unwrap_or_default());
                let right = u64::from_le_bytes(b.try_into().unwrap_or_default());
                left.cmp(&right)
            }
            KeyOrder::Lexicographic => a.cmp(b),
        }
    }
}

/// Space accounting for inserting a cell with a given key.
#[derive(Debug, Clone, Copy)]
pub struct SpaceRequirement {
    /// Bytes for the new pointer-array slot (always 2).
    pub pointer_space: PageOffset,
    /// Bytes for flags, optional key-size prefix and the key itself.
    pub cell_header_space: PageOffset,
    /// Largest entry that still fits in the defragmented free space after
    /// the pointer and cell header are accounted for.
    pub max_entry_space: PageOffset,
}

/// One decoded data cell. `payload` excludes the entry-size prefix for
/// single-page entries and is the raw 16 header bytes for overflow
/// headers.
#[derive(Debug)]
pub struct DataCell<'a> {
    pub flags: u8,
    pub key: &'a [u8],
    pub payload: &'a [u8],
    pub cell_size: PageOffset,
}

impl DataCell<'_> {
    pub fn is_single_page(&self) -> bool {
        cell_is_single_page(self.flags)
    }
}

/// One decoded pointers cell.
#[derive(Debug)]
pub struct PointersCell<'a> {
    pub flags: u8,
    pub key: &'a [u8],
    pub child: PageNumber,
    pub cell_size: PageOffset,
}

#[derive(Debug)]
pub enum Cell<'a> {
    Data(DataCell<'a>),
    Pointers(PointersCell<'a>),
}

impl Cell<'_> {
    pub fn key(&self) -> &[u8] {
        match self {
            Cell::Data(cell) => cell.key,
            Cell::Pointers(cell) => cell.key,
        }
    }

    pub fn cell_size(&self) -> PageOffset {
        match self {
            Cell::Data(cell) => cell.cell_size,
            Cell::Pointers(cell) => cell.cell_size,
        }
    }
}

/// A slotted node over one pinned page.
pub struct NodePage {
    handle: PageHandle,
    order: KeyOrder,
}

impl NodePage {
    /// Initializes a fresh tree page (leaf, interior or root) and returns
    /// the node. The reserved tail sits at the very end of the page.
    pub(crate) fn init(
        handle: PageHandle,
        txn: &Transaction,
        page_type: PageType,
        reserved: PageOffset,
        keys_serialized: bool,
        order: KeyOrder,
    ) -> Result<Self> {
        let page_number = handle.page_number();
        let page_size = handle.page_size();
        let reserved_start = (page_size - reserved as usize) as PageOffset;

        let mut flags = page_type as u8;
        if keys_serialized {
            flags |= NodeFlags::KEY_SIZES_SERIALIZED;
        }

        txn.write(&handle, offsets::MAGIC, NODE_MAGIC)?;
        txn.write(&handle, offsets::FLAGS, flags)?;
        txn.write(&handle, offsets::FREE_BEGIN, offsets::POINTERS_START)?;
        txn.write(&handle, offsets::FREE_END, reserved_start)?;
        txn.write(&handle, offsets::RESERVED_START, reserved_start)?;
        txn.write(&handle, offsets::PAGE_NUMBER, page_number)?;
        txn.write(&handle, offsets::ADDITIONAL_DATA, 0u64)?;

        Ok(Self { handle, order })
    }

    /// Initializes a fresh overflow page. Overflow pages have no reserved
    /// tail and always use u64 keys.
    pub(crate) fn init_overflow(handle: PageHandle, txn: &Transaction) -> Result<Self> {
        let page_number = handle.page_number();
        let page_size = handle.page_size();
        let reserved_start = page_size as PageOffset;

        txn.write(&handle, offsets::MAGIC, OVERFLOW_MAGIC)?;
        txn.write(&handle, offsets::FLAGS, NodeFlags::OVERFLOW_PAGE)?;
        txn.write(&handle, offsets::FREE_BEGIN, offsets::POINTERS_START)?;
        txn.write(&handle, offsets::FREE_END, reserved_start)?;
        txn.write(&handle, offsets::RESERVED_START, reserved_start)?;
        txn.write(&handle, offsets::PAGE_NUMBER, page_number)?;
        txn.write(&handle, offsets::ADDITIONAL_DATA, 0u64)?;

        Ok(Self {
            handle,
            order: KeyOrder::UInt64,
        })
    }

    /// Wraps an already-initialized page, validating its magic and
    /// back-reference.
    pub(crate) fn load(handle: PageHandle, order: KeyOrder) -> Result<Self> {
        let magic: u64 = handle.read(offsets::MAGIC);
        ensure!(
            magic == NODE_MAGIC || magic == OVERFLOW_MAGIC,
            "corrupt page: invalid magic {:#018x} in page {}",
            magic,
            handle.page_number()
        );
        let stored: PageNumber = handle.read(offsets::PAGE_NUMBER);
        ensure!(
            stored == handle.page_number(),
            "corrupt page: page {} claims to be page {}",
            handle.page_number(),
            stored
        );

        let order = if magic == OVERFLOW_MAGIC {
            KeyOrder::UInt64
        } else {
            order
        };
        let node = Self { handle, order };
        ensure!(
            !node.is_pointers_page() || node.additional_data() != 0,
            "corrupt page: pointers page {} has no rightmost child",
            node.page_number()
        );
        Ok(node)
    }

    pub fn handle(&self) -> &PageHandle {
        &self.handle
    }

    pub(crate) fn order(&self) -> KeyOrder {
        self.order
    }

    pub fn page_number(&self) -> PageNumber {
        self.handle.page_number()
    }

    // ===========================================================================
    //  Header accessors.
    // ===========================================================================

    pub fn flags(&self) -> u8 {
        self.handle.read(offsets::FLAGS)
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_flags(self.flags())
    }

    pub fn free_begin(&self) -> PageOffset {
        self.handle.read(offsets::FREE_BEGIN)
    }

    pub fn free_end(&self) -> PageOffset {
        self.handle.read(offsets::FREE_END)
    }

    pub fn reserved_start(&self) -> PageOffset {
        self.handle.read(offsets::RESERVED_START)
    }

    pub fn additional_data(&self) -> PageNumber {
        self.handle.read(offsets::ADDITIONAL_DATA)
    }

    pub fn is_pointers_page(&self) -> bool {
        self.flags() & NodeFlags::POINTERS_PAGE != 0
    }

    pub fn is_root_page(&self) -> bool {
        self.flags() & NodeFlags::ROOT_PAGE != 0
    }

    pub fn is_overflow_page(&self) -> bool {
        self.flags() & NodeFlags::OVERFLOW_PAGE != 0
    }

    pub fn is_data_page(&self) -> bool {
        !self.is_pointers_page()
    }

    pub fn keys_serialized(&self) -> bool {
        self.flags() & NodeFlags::KEY_SIZES_SERIALIZED != 0
    }

    pub(crate) fn set_flags(&self, txn: &Transaction, flags: u8) -> Result<()> {
        txn.write(&self.handle, offsets::FLAGS, flags)?;
        Ok(())
    }

    pub(crate) fn set_free_begin(&self, txn: &Transaction, value: PageOffset) -> Result<()> {
        txn.write(&self.handle, offsets::FREE_BEGIN, value)?;
        Ok(())
    }

    pub(crate) fn set_free_end(&self, txn: &Transaction, value: PageOffset) -> Result<()> {
        txn.write(&self.handle, offsets::FREE_END, value)?;
        Ok(())
    }

    pub(crate) fn set_additional_data(&self, txn: &Transaction, value: PageNumber) -> Result<()> {
        txn.write(&self.handle, offsets::ADDITIONAL_DATA, value)?;
        Ok(())
    }

    // ===========================================================================
    //  Pointer array.
    // ===========================================================================

    pub fn num_pointers(&self) -> PageOffset {
        (self.free_begin() - offsets::POINTERS_START) / POINTER_SIZE
    }

    pub fn defragmented_free_space(&self) -> PageOffset {
        self.free_end() - self.free_begin()
    }

    /// Copies the pointer array out of the page.
    pub fn pointers(&self) -> SmallVec<[PageOffset; 32]> {
        let count = self.num_pointers() as usize;
        let bytes = self
            .handle
            .read_bytes(offsets::POINTERS_START, count * POINTER_SIZE as usize);
        bytes
            .chunks_exact(2)
            .map(|pair| PageOffset::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    pub fn cell_offset_by_index(&self, index: PageOffset) -> Result<PageOffset> {
        let count = self.num_pointers();
        ensure!(
            index < count,
            "cell index {} out of range (page {} has {} cells)",
            index,
            self.page_number(),
            count
        );
        Ok(self
            .handle
            .read(offsets::POINTERS_START + index * POINTER_SIZE))
    }

    // ===========================================================================
    //  Keys and cells.
    // ===========================================================================

    /// The key of the cell at the given heap offset.
    pub fn key_for_cell(&self, cell_offset: PageOffset) -> &[u8] {
        // Bypass the flags byte.
        let mut offset = cell_offset + 1;
        if self.keys_serialized() {
            let key_size: u16 = self.handle.read(offset);
            offset += 2;
            self.handle.read_bytes(offset, key_size as usize)
        } else {
            self.handle.read_bytes(offset, 8)
        }
    }

    pub fn key_for_nth_cell(&self, index: PageOffset) -> Result<&[u8]> {
        Ok(self.key_for_cell(self.cell_offset_by_index(index)?))
    }

    pub fn largest_key(&self) -> Option<&[u8]> {
        let pointers = self.pointers();
        pointers.last().map(|&offset| self.key_for_cell(offset))
    }

    /// Decodes the cell at the given heap offset.
    pub fn cell(&self, cell_offset: PageOffset) -> Result<Cell<'_>> {
        let flags: u8 = self.handle.read(cell_offset);
        ensure!(
            cell_is_active(flags),
            "corrupt cell: inactive cell at offset {} on page {}",
            cell_offset,
            self.page_number()
        );

        let mut offset = cell_offset + 1;
        let key = if cell_key_size_serialized(flags) {
            let key_size: u16 = self.handle.read(offset);
            offset += 2;
            let key = self.handle.read_bytes(offset, key_size as usize);
            offset += key_size;
            key
        } else {
            let key = self.handle.read_bytes(offset, 8);
            offset += 8;
            key
        };

        if self.is_pointers_page() {
            let child: PageNumber = self.handle.read(offset);
            return Ok(Cell::Pointers(PointersCell {
                flags,
                key,
                child,
                cell_size: offset + 8 - cell_offset,
            }));
        }

        if cell_is_single_page(flags) {
            let size_prefix = cell_entry_size_serialized(flags);
            let entry_size: u16 = self.handle.read(offset);
            let payload = if size_prefix {
                self.handle.read_bytes(offset + 2, entry_size as usize)
            } else {
                bail!(
                    "corrupt cell: single-page entry without a size prefix at offset {} on page {}",
                    cell_offset,
                    self.page_number()
                );
            };
            let cell_size = offset + 2 + entry_size - cell_offset;
            Ok(Cell::Data(DataCell {
                flags,
                key,
                payload,
                cell_size,
            }))
        } else {
            // Overflow header: exactly 16 payload bytes.
            let payload = self.handle.read_bytes(offset, OVERFLOW_HEADER_SIZE as usize);
            Ok(Cell::Data(DataCell {
                flags,
                key,
                payload,
                cell_size: offset + OVERFLOW_HEADER_SIZE - cell_offset,
            }))
        }
    }

    pub fn nth_cell(&self, index: PageOffset) -> Result<Cell<'_>> {
        self.cell(self.cell_offset_by_index(index)?)
    }

    // ===========================================================================
    //  Searching.
    // ===========================================================================

    /// Heap offset of the cell with exactly this key, if present.
    pub fn cell_by_key(&self, key: &[u8]) -> Option<PageOffset> {
        let (offset, _) = self.lower_bound(key)?;
        let cell_key = self.key_for_cell(offset);
        (self.order.compare(cell_key, key) == Ordering::Equal).then_some(offset)
    }

    /// First cell whose key is >= the search key, as (heap offset, index).
    pub fn lower_bound(&self, key: &[u8]) -> Option<(PageOffset, PageOffset)> {
        let pointers = self.pointers();
        let index = pointers.partition_point(|&ptr| {
            self.order.compare(self.key_for_cell(ptr), key) == Ordering::Less
        });
        (index < pointers.len()).then(|| (pointers[index], index as PageOffset))
    }

    /// For an interior page: the child to descend into for this key,
    /// together with the index of the chosen pointer (the pointer count
    /// itself designates the rightmost child).
    pub fn next_page_in_pointers(&self, key: &[u8]) -> Result<(PageNumber, PageOffset)> {
        ensure!(
            self.is_pointers_page(),
            "cannot descend from page {}: not a pointers page",
            self.page_number()
        );

        let num_pointers = self.num_pointers();
        if num_pointers == 0 {
            let next = self.additional_data();
            ensure!(
                next != 0,
                "corrupt page: empty pointers page {} with no rightmost child",
                self.page_number()
            );
            return Ok((next, 0));
        }

        let last_key = self.key_for_nth_cell(num_pointers - 1)?;
        if self.order.compare(last_key, key) == Ordering::Less {
            let next = self.additional_data();
            ensure!(
                next != 0,
                "corrupt page: rightmost pointer of page {} is zero",
                self.page_number()
            );
            return Ok((next, num_pointers));
        }

        let (offset, index) = self
            .lower_bound(key)
            .expect("a cell with key >= search key exists, the last key is >=");
        match self.cell(offset)? {
            Cell::Pointers(cell) => Ok((cell.child, index)),
            Cell::Data(_) => bail!(
                "corrupt page: data cell on pointers page {}",
                self.page_number()
            ),
        }
    }

    // ===========================================================================
    //  Mutation helpers.
    // ===========================================================================

    /// Re-sorts the pointer array by cell key. Needed after an insert that
    /// was not a strictly rightmost append.
    pub fn sort_keys(&self, txn: &Transaction) -> Result<()> {
        let mut pointers = self.pointers();
        pointers.sort_by(|&a, &b| self.order.compare(self.key_for_cell(a), self.key_for_cell(b)));
        txn.write_span(&self.handle, offsets::POINTERS_START, &pointers)?;
        Ok(())
    }

    /// Space accounting for inserting a cell keyed by `key`.
    pub fn space_requirements(&self, key: &[u8]) -> SpaceRequirement {
        let pointer_space = POINTER_SIZE;
        let mut cell_header_space = 1 + key.len() as PageOffset;
        if self.keys_serialized() {
            cell_header_space += 2;
        }
        let free = self.defragmented_free_space();
        let overhead = pointer_space + cell_header_space;
        SpaceRequirement {
            pointer_space,
            cell_header_space,
            max_entry_space: free.saturating_sub(overhead),
        }
    }
}

impl std::fmt::Debug for NodePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePage")
            .field("page_number", &self.page_number())
            .field("page_type", &self.page_type())
            .field("num_pointers", &self.num_pointers())
            .field("free_space", &self.defragmented_free_space())
            .finish()
    }
}
