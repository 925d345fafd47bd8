//! # Write-Ahead Log
//!
//! Append-only record stream providing durability for page updates. Every
//! write to a page goes through a transaction, which pairs the old and new
//! bytes into an UPDATE record here before the page buffer is touched.
//!
//! ## Record Format
//!
//! Each record begins with a one-byte type tag followed by the u64
//! transaction id:
//!
//! ```text
//! Tag   Record      Additional fields
//! ----  ----------  ------------------------------------------------------
//! 'b'   BEGIN       -
//! 'c'   COMMIT      -
//! 'a'   ABORT       -
//! 'p'   CHECKPOINT  -
//! 'l'   CLR         -
//! 'u'   UPDATE      lsn: u64, page: u64, offset: u16, size: i64,
//!                   old_bytes: size bytes, new_bytes: size bytes
//! ```
//!
//! All integers are little-endian. `old_bytes` and `new_bytes` are always
//! the same length. CHECKPOINT and CLR are part of the record set for the
//! benefit of a future replayer; this producer emits CHECKPOINT at explicit
//! flush points and never emits CLR.
//!
//! ## Buffering
//!
//! Records accumulate in a 16 KiB in-memory buffer. The buffer is flushed
//! when the next record would not fit, and on explicit [`flush`]. A record
//! larger than the whole buffer is written through directly after a flush.
//! A COMMIT is only durable once `flush` has returned; callers must flush
//! before externalizing a commit.
//!
//! ## LSNs
//!
//! Log sequence numbers start at 1 and increase strictly monotonically for
//! the lifetime of the process. They are assigned only to UPDATE records.
//!
//! ## Concurrency
//!
//! The buffer, the file and the LSN counter sit behind one mutex; records
//! from concurrent writers serialize there.
//!
//! [`flush`]: WriteAheadLog::flush

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{WAL_BUFFER_SIZE, WAL_FILE_NAME};
use crate::storage::{PageNumber, PageOffset};

/// Record type tags as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Begin = b'b',
    Commit = b'c',
    Update = b'u',
    Abort = b'a',
    Checkpoint = b'p',
    Clr = b'l',
}

struct WalInner {
    file: File,
    buffer: Vec<u8>,
    next_lsn: u64,
    last_flushed_lsn: u64,
}

pub struct WriteAheadLog {
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// Creates or opens `wal.log` inside the given directory, appending to
    /// an existing log.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create WAL directory {:?}", dir))?;
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL file {:?}", path))?;

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                buffer: Vec::with_capacity(WAL_BUFFER_SIZE),
                next_lsn: 1,
                last_flushed_lsn: 0,
            }),
        })
    }

    pub fn begin(&self, transaction: u64) -> Result<()> {
        trace!(transaction, "wal begin");
        self.append_control(RecordType::Begin, transaction)
    }

    pub fn commit(&self, transaction: u64) -> Result<()> {
        trace!(transaction, "wal commit");
        self.append_control(RecordType::Commit, transaction)
    }

    pub fn abort(&self, transaction: u64) -> Result<()> {
        trace!(transaction, "wal abort");
        self.append_control(RecordType::Abort, transaction)
    }

    pub fn checkpoint(&self, transaction: u64) -> Result<()> {
        trace!(transaction, "wal checkpoint");
        self.append_control(RecordType::Checkpoint, transaction)
    }

    /// Appends an UPDATE record and returns its LSN. `old` and `new` must
    /// be the same length.
    pub fn update(
        &self,
        transaction: u64,
        page: PageNumber,
        offset: PageOffset,
        old: &[u8],
        new: &[u8],
    ) -> Result<u64> {
        ensure!(
            old.len() == new.len(),
            "old and new byte ranges must be the same size: {} != {}",
            old.len(),
            new.len()
        );

        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;

        // tag + txn + lsn + page + offset + size + old + new
        let record_size = 1 + 8 + 8 + 8 + 2 + 8 + old.len() * 2;
        inner.reserve(record_size)?;

        let mut record = Vec::with_capacity(record_size);
        record.push(RecordType::Update as u8);
        record.extend_from_slice(&transaction.to_le_bytes());
        record.extend_from_slice(&lsn.to_le_bytes());
        record.extend_from_slice(&page.to_le_bytes());
        record.extend_from_slice(&offset.to_le_bytes());
        record.extend_from_slice(&(old.len() as i64).to_le_bytes());
        record.extend_from_slice(old);
        record.extend_from_slice(new);

        inner.append(&record)?;
        trace!(transaction, lsn, page, offset, size = old.len(), "wal update");
        Ok(lsn)
    }

    /// Flushes the buffer to the file and syncs it. After this returns,
    /// every previously appended record is durable.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.flush_buffer()?;
        let flushed = inner.next_lsn - 1;
        inner.last_flushed_lsn = flushed;
        debug!(last_flushed_lsn = flushed, "wal flushed");
        Ok(())
    }

    /// Highest LSN known to be durable.
    pub fn last_flushed_lsn(&self) -> u64 {
        self.inner.lock().last_flushed_lsn
    }

    /// LSN that the next UPDATE record will receive.
    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    fn append_control(&self, record_type: RecordType, transaction: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.reserve(1 + 8)?;
        let mut record = [0u8; 9];
        record[0] = record_type as u8;
        record[1..9].copy_from_slice(&transaction.to_le_bytes());
        inner.append(&record)
    }
}

impl WalInner {
    /// Makes room for a record of `size` bytes, flushing the buffer first
    /// when it would overflow.
    fn reserve(&mut self, size: usize) -> Result<()> {
        if self.buffer.len() + size > WAL_BUFFER_SIZE {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        if record.len() > WAL_BUFFER_SIZE {
            // Oversized record: write through, the buffer was just flushed.
            self.file
                .write_all(record)
                .wrap_err("failed to write oversized WAL record")?;
            return Ok(());
        }
        self.buffer.extend_from_slice(record);
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file
                .write_all(&self.buffer)
                .wrap_err("failed to write WAL buffer")?;
            self.buffer.clear();
        }
        self.file.sync_data().wrap_err("failed to sync WAL file")?;
        Ok(())
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        // Best effort: shutdown flush failures are logged, not raised.
        let mut inner = self.inner.lock();
        if let Err(err) = inner.flush_buffer() {
            tracing::error!(?err, "failed to flush WAL on shutdown");
        }
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WriteAheadLog")
            .field("next_lsn", &inner.next_lsn)
            .field("buffered_bytes", &inner.buffer.len())
            .finish()
    }
}
