//! # Database Layer
//!
//! The process-wide handle over one database directory. A
//! [`DataManager`] aggregates the data access layer, the page cache and
//! the collection registry: a string-keyed B-tree whose values are small
//! documents `{collection_name, index_page_number}`, one per collection.
//! Each collection is its own B-tree sharing the same cache.
//!
//! ```text
//! DataManager
//!   ├── DataAccessLayer          (neversql.db)
//!   ├── PageCache ── WriteAheadLog (walfiles/wal.log)
//!   ├── collection index B-tree  (root recorded in the meta page)
//!   └── {name -> collection B-tree}
//! ```
//!
//! Every mutation runs under a fresh transaction id bracketed by
//! BEGIN/COMMIT (or ABORT) records, and the WAL is flushed before a
//! commit is reported back to the caller.
//!
//! ## Module Organization
//!
//! - `manager`: open/create, collections, insert/retrieve/iterate
//! - `query`: document predicates for filtered iteration

mod builder;
mod manager;
mod query;

pub use builder::DataManagerBuilder;
pub use manager::{CollectionKey, DataManager, DocumentIter};
pub use query::{Compare, Filter, FilteredIter};
