//! # Node Page Header
//!
//! Every B-tree page starts with a fixed 31-byte header followed by the
//! pointer array, the free gap, the cell heap growing down from
//! `reserved_start`, and an optional reserved tail.
//!
//! ## Header Layout (31 bytes)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       8     magic            "NOSQLBTR" (tree page) or "OVERFLOW"
//! 8       1     flags            page role bits, see below
//! 9       2     free_begin       one past the end of the pointer array
//! 11      2     free_end         start of the cell heap
//! 13      2     reserved_start   end of the cell heap / start of tail
//! 15      8     page_number      this page's own number (back-reference)
//! 23      8     additional_data  rightmost child for pointers pages
//! ```
//!
//! The pointer array holds 2-byte cell offsets sorted by cell key; its
//! length is `(free_begin - 31) / 2`. The free-space frame invariant is
//! `31 <= free_begin <= free_end <= reserved_start <= page_size`.
//!
//! ## Flags
//!
//! ```text
//! Bit  Name                 Meaning
//! ---  -------------------  ------------------------------------------
//! 0    PointersPage         cells hold child page numbers, not data
//! 1    RootPage             this page is the tree's root
//! 2    KeySizesSerialized   cells carry a 2-byte key size prefix
//! 3    OverflowPage         page stores overflow chain cells
//! ```
//!
//! Bits 0 and 1 together encode the page type: Leaf (00), Internal (01),
//! RootLeaf (10) and RootInternal (11).

use crate::storage::PageOffset;

/// u64 little-endian reading of the ASCII tag "NOSQLBTR".
pub const NODE_MAGIC: u64 = u64::from_le_bytes(*b"NOSQLBTR");

/// u64 little-endian reading of the ASCII tag "OVERFLOW".
pub const OVERFLOW_MAGIC: u64 = u64::from_le_bytes(*b"OVERFLOW");

/// Byte offsets of the header fields inside a node page.
pub(crate) mod offsets {
    use crate::storage::PageOffset;

    pub const MAGIC: PageOffset = 0;
    pub const FLAGS: PageOffset = 8;
    pub const FREE_BEGIN: PageOffset = 9;
    pub const FREE_END: PageOffset = 11;
    pub const RESERVED_START: PageOffset = 13;
    pub const PAGE_NUMBER: PageOffset = 15;
    pub const ADDITIONAL_DATA: PageOffset = 23;
    pub const POINTERS_START: PageOffset = 31;
}

/// Page role flag bits.
pub struct NodeFlags;

impl NodeFlags {
    pub const POINTERS_PAGE: u8 = 0b0001;
    pub const ROOT_PAGE: u8 = 0b0010;
    pub const KEY_SIZES_SERIALIZED: u8 = 0b0100;
    pub const OVERFLOW_PAGE: u8 = 0b1000;
}

/// Page type as encoded by the low two flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Leaf = 0b00,
    Internal = 0b01,
    RootLeaf = 0b10,
    RootInternal = 0b11,
}

impl PageType {
    pub fn from_flags(flags: u8) -> Self {
        match flags & 0b11 {
            0b01 => PageType::Internal,
            0b10 => PageType::RootLeaf,
            0b11 => PageType::RootInternal,
            _ => PageType::Leaf,
        }
    }

    pub fn is_pointers(self) -> bool {
        matches!(self, PageType::Internal | PageType::RootInternal)
    }

    pub fn is_root(self) -> bool {
        matches!(self, PageType::RootLeaf | PageType::RootInternal)
    }

    /// The type a child created by splitting a node of this type gets.
    pub fn child_type(self) -> PageType {
        if self.is_pointers() {
            PageType::Internal
        } else {
            PageType::Leaf
        }
    }
}

/// Flag bits inside an individual cell.
pub(crate) struct CellFlags;

impl CellFlags {
    pub const ACTIVE: u8 = 0b1000_0000;
    pub const KEY_SIZE_SERIALIZED: u8 = 0b0100_0000;
    /// For single-page entries: the entry size is serialized. For overflow
    /// entries: a continuation header follows.
    pub const NOTE: u8 = 0b0000_0010;
    pub const SINGLE_PAGE_ENTRY: u8 = 0b0000_0001;
}

pub(crate) fn cell_is_active(flags: u8) -> bool {
    flags & CellFlags::ACTIVE != 0
}

pub(crate) fn cell_key_size_serialized(flags: u8) -> bool {
    flags & CellFlags::KEY_SIZE_SERIALIZED != 0
}

pub(crate) fn cell_note_flag(flags: u8) -> bool {
    flags & CellFlags::NOTE != 0
}

pub(crate) fn cell_is_single_page(flags: u8) -> bool {
    flags & CellFlags::SINGLE_PAGE_ENTRY != 0
}

/// A single-page entry with the note flag carries its size inline.
pub(crate) fn cell_entry_size_serialized(flags: u8) -> bool {
    cell_note_flag(flags) && cell_is_single_page(flags)
}

const _: () = assert!(offsets::POINTERS_START == crate::config::NODE_HEADER_SIZE);

/// Size of one pointer-array entry.
pub(crate) const POINTER_SIZE: PageOffset = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_round_trips_through_flags() {
        for page_type in [
            PageType::Leaf,
            PageType::Internal,
            PageType::RootLeaf,
            PageType::RootInternal,
        ] {
            assert_eq!(PageType::from_flags(page_type as u8), page_type);
        }
    }

    #[test]
    fn page_type_predicates() {
        assert!(!PageType::Leaf.is_pointers());
        assert!(PageType::Internal.is_pointers());
        assert!(PageType::RootLeaf.is_root());
        assert!(PageType::RootInternal.is_root());
        assert!(PageType::RootInternal.is_pointers());
    }

    #[test]
    fn child_types_lose_root_bit() {
        assert_eq!(PageType::RootLeaf.child_type(), PageType::Leaf);
        assert_eq!(PageType::RootInternal.child_type(), PageType::Internal);
        assert_eq!(PageType::Leaf.child_type(), PageType::Leaf);
        assert_eq!(PageType::Internal.child_type(), PageType::Internal);
    }

    #[test]
    fn magics_match_ascii_tags() {
        assert_eq!(&NODE_MAGIC.to_le_bytes(), b"NOSQLBTR");
        assert_eq!(&OVERFLOW_MAGIC.to_le_bytes(), b"OVERFLOW");
    }

    #[test]
    fn cell_flag_helpers() {
        let flags = CellFlags::ACTIVE | CellFlags::NOTE | CellFlags::SINGLE_PAGE_ENTRY;
        assert!(cell_is_active(flags));
        assert!(cell_is_single_page(flags));
        assert!(cell_entry_size_serialized(flags));
        assert!(!cell_key_size_serialized(flags));

        let overflow_header = CellFlags::ACTIVE | CellFlags::NOTE;
        assert!(!cell_is_single_page(overflow_header));
        assert!(!cell_entry_size_serialized(overflow_header));
    }
}
