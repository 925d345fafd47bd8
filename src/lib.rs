//! # NeverSQL
//!
//! A document-oriented, single-node embedded database storage engine.
//! Collections of self-describing documents are keyed either by an
//! auto-incrementing 64-bit integer or by a variable-length byte string,
//! with point lookup, ordered iteration and filtered iteration.
//!
//! ## Quick Start
//!
//! ```ignore
//! use neversql::{DataManager, DataType, Document};
//!
//! let mut db = DataManager::open(Path::new("./mydb"))?;
//! db.add_collection("elements", DataType::UInt64)?;
//!
//! let mut doc = Document::new();
//! doc.insert("pk", 1u64).insert("data", "Entry 1");
//! db.add_value("elements", 1u64, &doc)?;
//!
//! let found = db.retrieve("elements", 1u64)?;
//! assert_eq!(found.unwrap().get_str("data"), Some("Entry 1"));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        DataManager / collections         │
//! ├──────────────────────────────────────────┤
//! │   B+ tree (slotted pages, overflow)      │
//! ├──────────────────────────────────────────┤
//! │   Document codec / entry creation        │
//! ├──────────────────────────────────────────┤
//! │   Page cache (clock) │ Write-ahead log   │
//! ├──────────────────────┴───────────────────┤
//! │   Data access layer (paged file)         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Directory Layout
//!
//! ```text
//! <db>/
//!   neversql.db       # paged file, page 0 is the meta page
//!   walfiles/
//!     wal.log         # append-only write-ahead log
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: paged file, free list, page cache, write-ahead log
//! - [`btree`]: slotted-page B+ tree with overflow chains
//! - [`document`]: self-describing document values and their codec
//! - [`database`]: collection registry and the public surface
//! - [`config`]: layout and tuning constants
//!
//! ## Observability
//!
//! The engine emits structured [`tracing`] events on the insert, split,
//! evict and flush paths. No subscriber is installed; hosts that want the
//! events install their own, and without one the events are no-ops.

pub mod btree;
pub mod config;
pub mod database;
pub mod document;
pub mod storage;

pub use database::{
    CollectionKey, Compare, DataManager, DataManagerBuilder, DocumentIter, Filter, FilteredIter,
};
pub use document::{Array, DataType, Document, Value};
