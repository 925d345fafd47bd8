//! # NeverSQL Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE_POWER (9..=16, default 12 -> 4096 byte pages)
//!       │
//!       ├─> NODE_HEADER_SIZE (31 bytes, fixed by the on-disk format)
//!       │
//!       └─> all in-page offsets are u16; the node layer assumes a page
//!           fits the header plus at least one cell
//!
//! OVERFLOW_HEADER_SIZE (16 bytes)
//!       │
//!       └─> the entry creator reports this as its minimum entry size;
//!           a leaf must be able to hold at least an overflow header for
//!           any payload to be storable
//!
//! OVERFLOW_CONTINUATION_HEADER_SIZE (10 bytes)
//!       │
//!       └─> MIN_OVERFLOW_CHUNK (16 bytes)
//!             An overflow page is reused only while it can hold the
//!             continuation header plus the minimum chunk; otherwise a
//!             fresh overflow page is allocated.
//!
//! WAL_BUFFER_SIZE (16 KiB)
//!       │
//!       └─> a WAL record larger than the buffer is written through
//!           directly after a flush
//!
//! DEFAULT_MAX_ENTRY_SIZE (256 bytes)
//!       │
//!       └─> payloads larger than this are routed to overflow pages
//! ```
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{DEFAULT_PAGE_SIZE_POWER, WAL_BUFFER_SIZE};
//! ```

/// Smallest supported page size exponent (2^9 = 512 bytes).
pub const MIN_PAGE_SIZE_POWER: u8 = 9;

/// Largest supported page size exponent (2^16 = 65536 bytes).
pub const MAX_PAGE_SIZE_POWER: u8 = 16;

/// Default page size exponent (2^12 = 4096 bytes).
pub const DEFAULT_PAGE_SIZE_POWER: u8 = 12;

/// Default number of frames in the page cache.
pub const DEFAULT_CACHE_FRAMES: usize = 256;

/// Size of the write-ahead log's in-memory buffer. The buffer is flushed
/// to disk whenever the next record would not fit.
pub const WAL_BUFFER_SIZE: usize = 16 * 1024;

/// Size of the fixed header at the start of every B-tree node page.
pub const NODE_HEADER_SIZE: u16 = 31;

/// Size of the entry portion of an overflow header cell:
/// `[overflow_key: 8][first_overflow_page: 8]`.
pub const OVERFLOW_HEADER_SIZE: u16 = 16;

/// Size of the control fields at the start of an overflow continuation
/// entry: `[entry_size: 2][next_page: 8]`.
pub const OVERFLOW_CONTINUATION_HEADER_SIZE: u16 = 10;

/// Minimum chunk of payload worth writing to an overflow page. A page that
/// cannot hold the continuation header plus this many bytes is skipped and
/// a new overflow page is allocated. Tuning parameter, not an invariant.
pub const MIN_OVERFLOW_CHUNK: u16 = 16;

/// Largest payload stored inline in a leaf cell. Anything bigger goes
/// through an overflow chain. Per-tree default.
pub const DEFAULT_MAX_ENTRY_SIZE: u16 = 256;

/// Upper bound on the number of cells in one node. Keeps the pointer
/// array, and therefore vacuum scratch space, bounded.
pub const DEFAULT_MAX_ENTRIES_PER_PAGE: u16 = 256;

/// A node must have at least this much defragmented free space before an
/// insert is attempted without splitting.
pub const DEFAULT_MIN_SPACE_FOR_ENTRY: u16 = 64;

/// Name of the paged database file inside the database directory.
pub const DB_FILE_NAME: &str = "neversql.db";

/// Name of the directory holding write-ahead log files.
pub const WAL_DIR_NAME: &str = "walfiles";

/// Name of the write-ahead log file inside [`WAL_DIR_NAME`].
pub const WAL_FILE_NAME: &str = "wal.log";

/// The meta record always lives on page 0.
pub const META_PAGE_NUMBER: u64 = 0;

const _: () = assert!(MIN_OVERFLOW_CHUNK >= 1);
const _: () = assert!(OVERFLOW_HEADER_SIZE == 16);
const _: () = assert!(MIN_PAGE_SIZE_POWER <= DEFAULT_PAGE_SIZE_POWER);
const _: () = assert!(DEFAULT_PAGE_SIZE_POWER <= MAX_PAGE_SIZE_POWER);
