//! # Data Manager Builder
//!
//! Fluent configuration for opening a database with non-default settings.
//! Settings are chained before `open()`:
//!
//! ```ignore
//! let db = DataManager::builder()
//!     .page_size_power(9)     // 512-byte pages
//!     .cache_frames(64)
//!     .open(Path::new("./mydb"))?;
//! ```
//!
//! ## Configuration Options
//!
//! | Option          | Default | Description                             |
//! |-----------------|---------|-----------------------------------------|
//! | page_size_power | 12      | Page size is 2^power bytes (9..=16).    |
//! | cache_frames    | 256     | Number of frames in the page cache.     |
//!
//! The page size only applies when the database is created; opening an
//! existing database keeps the page size recorded in its meta page.

use std::path::Path;

use eyre::Result;

use crate::config::{DEFAULT_CACHE_FRAMES, DEFAULT_PAGE_SIZE_POWER};

use super::manager::DataManager;

/// Builder for configuring and opening a [`DataManager`].
#[derive(Debug, Clone)]
pub struct DataManagerBuilder {
    page_size_power: u8,
    cache_frames: usize,
}

impl DataManagerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            page_size_power: DEFAULT_PAGE_SIZE_POWER,
            cache_frames: DEFAULT_CACHE_FRAMES,
        }
    }

    /// Page size for newly created databases, as a power of two
    /// (9..=16). Ignored when opening an existing database.
    pub fn page_size_power(mut self, power: u8) -> Self {
        self.page_size_power = power;
        self
    }

    /// Number of frames in the page cache.
    pub fn cache_frames(mut self, frames: usize) -> Self {
        self.cache_frames = frames;
        self
    }

    /// Opens (or creates) the database at `path` with these settings.
    pub fn open(self, path: &Path) -> Result<DataManager> {
        DataManager::open_with(path, self.page_size_power, self.cache_frames)
    }
}

impl Default for DataManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
