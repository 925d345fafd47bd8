//! # Storage Module
//!
//! This module provides the foundational storage layer for NeverSQL: a paged
//! database file with a persistent free list, a buffered page cache with
//! clock eviction, and a write-ahead log for durable updates.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  PageHandle / Transaction            │   typed reads; logged writes
//! ├──────────────────────────────────────┤
//! │  PageCache            WriteAheadLog  │   frames + clock; record buffer
//! ├──────────────────────────────────────┤
//! │  DataAccessLayer                     │   page allocation, file I/O
//! ├──────────────────────────────────────┤
//! │  neversql.db          walfiles/      │   on-disk state
//! └──────────────────────────────────────┘
//! ```
//!
//! The `DataAccessLayer` (DAL) owns the database file. It hands out whole
//! pages by number and knows nothing about their contents. Page numbers come
//! from a persistent free list: released pages are recycled in FIFO order
//! before the file is grown.
//!
//! ## Database Directory Layout
//!
//! ```text
//! <db>/
//!   neversql.db       # paged file, page 0 is the meta page
//!   walfiles/
//!     wal.log         # append-only write-ahead log
//! ```
//!
//! ## Page Access Discipline
//!
//! Pages are read and written through `PageHandle`s obtained from the cache.
//! A handle pins its frame for as long as it lives; a pinned frame is never
//! evicted or remapped. Reads are plain byte copies (never in-place casts of
//! the page buffer). Writes go through a [`Transaction`], which records an
//! UPDATE (old bytes, new bytes) in the WAL before the frame is modified.
//!
//! ## Lock Order
//!
//! Within one operation, locks are always taken in the order
//! cache state -> WAL buffer -> DAL (free list, then file). Eviction follows
//! the same order: it flushes the WAL before writing a dirty frame back
//! through the DAL, which is also what guarantees WAL-before-data.
//!
//! ## Module Organization
//!
//! - `meta`: the page-0 meta record
//! - `freelist`: FIFO free-page queue with a high-water mark
//! - `dal`: the data access layer owning the file
//! - `cache`: fixed frame pool with second-chance clock eviction
//! - `page`: pinned page handles with typed, copy-based reads
//! - `wal`: append-only write-ahead log
//! - `transaction`: logged typed writes through a page handle

mod cache;
mod dal;
mod freelist;
mod meta;
mod page;
mod transaction;
mod wal;

pub use cache::PageCache;
pub use dal::DataAccessLayer;
pub use freelist::FreeList;
pub use meta::{Meta, META_MAGIC};
pub use page::PageHandle;
pub use transaction::Transaction;
pub use wal::{RecordType, WriteAheadLog};

/// 64-bit page identifier. Page 0 is the meta page.
pub type PageNumber = u64;

/// Offset or length inside one page. Pages are at most 2^16 bytes.
pub type PageOffset = u16;
