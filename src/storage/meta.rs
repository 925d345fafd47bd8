//! # Meta Record
//!
//! Page 0 of the database file holds the meta record, the root from which
//! everything else in the file is reachable.
//!
//! ## On-Disk Layout
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       8     magic            u64 LE of the ASCII bytes "NeverSQL"
//! 8       1     page_size_power  page size is 2^power, 9 <= power <= 16
//! 9       8     free_list_page   page holding the serialized free list
//! 17      8     index_page       root page of the collection index B-tree
//! ```
//!
//! All multi-byte integers are little-endian. The record is written on
//! database creation and re-written on clean shutdown; `index_page` is 0
//! until the data manager creates the collection index.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{MAX_PAGE_SIZE_POWER, MIN_PAGE_SIZE_POWER};
use crate::storage::PageNumber;

/// u64 little-endian reading of the ASCII tag "NeverSQL".
pub const META_MAGIC: u64 = u64::from_le_bytes(*b"NeverSQL");

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MetaHeader {
    magic: u64,
    page_size_power: u8,
    free_list_page: u64,
    index_page: u64,
}

/// In-memory representation of the meta page.
#[derive(Debug, Clone)]
pub struct Meta {
    page_size_power: u8,
    page_size: u32,
    free_list_page: PageNumber,
    index_page: PageNumber,
}

impl Meta {
    pub fn new(page_size_power: u8) -> Result<Self> {
        ensure!(
            (MIN_PAGE_SIZE_POWER..=MAX_PAGE_SIZE_POWER).contains(&page_size_power),
            "page size power out of range, must be between {} and {}, was {}",
            MIN_PAGE_SIZE_POWER,
            MAX_PAGE_SIZE_POWER,
            page_size_power
        );
        Ok(Self {
            page_size_power,
            page_size: 1u32 << page_size_power,
            free_list_page: 0,
            index_page: 0,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn page_size_power(&self) -> u8 {
        self.page_size_power
    }

    pub fn free_list_page(&self) -> PageNumber {
        self.free_list_page
    }

    pub fn set_free_list_page(&mut self, page: PageNumber) {
        self.free_list_page = page;
    }

    pub fn index_page(&self) -> PageNumber {
        self.index_page
    }

    pub fn set_index_page(&mut self, page: PageNumber) {
        self.index_page = page;
    }

    /// Serializes the meta record into the start of a page buffer.
    pub fn write_to(&self, page: &mut [u8]) -> Result<()> {
        let header = MetaHeader {
            magic: META_MAGIC,
            page_size_power: self.page_size_power,
            free_list_page: self.free_list_page,
            index_page: self.index_page,
        };
        let bytes = header.as_bytes();
        ensure!(
            page.len() >= bytes.len(),
            "page buffer too small for meta record: {} < {}",
            page.len(),
            bytes.len()
        );
        page[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Deserializes the meta record from the start of a page buffer,
    /// validating the magic number and the page size power.
    pub fn read_from(page: &[u8]) -> Result<Self> {
        let size = size_of::<MetaHeader>();
        ensure!(
            page.len() >= size,
            "page buffer too small for meta record: {} < {}",
            page.len(),
            size
        );
        let header = MetaHeader::read_from_bytes(&page[..size])
            .map_err(|e| eyre::eyre!("failed to read meta record: {:?}", e))?;

        let magic = header.magic;
        ensure!(
            magic == META_MAGIC,
            "meta magic mismatch, expected {:#018x}, got {:#018x}",
            META_MAGIC,
            magic
        );

        let mut meta = Meta::new(header.page_size_power)?;
        meta.free_list_page = header.free_list_page;
        meta.index_page = header.index_page;
        Ok(meta)
    }
}
