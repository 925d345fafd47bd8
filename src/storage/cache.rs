//! # Page Cache
//!
//! Fixed-capacity frame pool mapping page numbers to in-memory frames,
//! with clock (second-chance) eviction and dirty write-back.
//!
//! ## Frame Pool
//!
//! All frames are allocated up front: one page-sized buffer per frame plus
//! a descriptor (page number, valid, second-chance) and two lock-free
//! fields (pin count, dirty bit). Free slot indices are handed out by a
//! non-allocating [`FreeList`], the same structure the data access layer
//! uses for pages.
//!
//! ## Slot Acquisition
//!
//! `get` and `get_new` first try the slot free list. When it is empty the
//! clock runs: starting at the hand, a set second-chance bit is cleared
//! and the hand advances; the first frame whose second-chance bit is
//! already clear and whose pin count is zero becomes the victim. If two
//! full sweeps find nothing, every frame is pinned and the operation fails
//! ("cache exhausted") so the caller may retry.
//!
//! A dirty victim is flushed before its slot is reused, and the WAL is
//! flushed first: no page ever reaches the file before the UPDATE records
//! that produced its bytes are durable (WAL-before-data).
//!
//! ## Pin Protocol
//!
//! Every successful `get` pins the frame (pin count + 1) and sets its
//! second-chance bit; handles unpin on drop. A pinned frame is never
//! evicted and its buffer never moves, which is what makes the slices
//! handed out by [`PageHandle`] valid for the handle's lifetime.
//!
//! ## Concurrency
//!
//! The frame index, descriptors, slot free list and clock hand sit behind
//! one mutex. Pin counts and dirty bits are atomics so the read and write
//! paths of a held handle never take that lock. Lock order is
//! cache state -> WAL -> DAL.
//!
//! ## Safety Model
//!
//! Frame buffers are reached through raw pointers so that a handle can
//! read its page without holding the cache lock. The pin protocol is the
//! safety argument: a frame's bytes are only reached through a handle that
//! pins it, eviction requires a pin count of zero under the lock, and the
//! boxed buffers themselves never move after construction.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::storage::{DataAccessLayer, FreeList, PageHandle, PageNumber, PageOffset, WriteAheadLog};

struct FrameBuffer(std::cell::UnsafeCell<Box<[u8]>>);

// SAFETY: access to the buffer contents is governed by the pin protocol
// described in the module docs; the cache never mutates a frame that has a
// pinned handle, and handles require exclusive ownership of the write path
// through the transaction layer.
unsafe impl Sync for FrameBuffer {}

#[derive(Debug, Clone, Copy, Default)]
struct FrameDescriptor {
    page_number: PageNumber,
    valid: bool,
    second_chance: bool,
}

struct CacheState {
    table: HashMap<PageNumber, usize>,
    descriptors: Vec<FrameDescriptor>,
    slot_free_list: FreeList,
    clock_hand: usize,
}

pub struct PageCache {
    dal: Arc<DataAccessLayer>,
    wal: WriteAheadLog,
    page_size: usize,
    buffers: Vec<FrameBuffer>,
    usage: Vec<AtomicU32>,
    dirty: Vec<AtomicBool>,
    state: Mutex<CacheState>,
    /// Back-reference to the owning `Arc` so handles can clone ownership.
    self_ref: Weak<PageCache>,
}

impl PageCache {
    pub fn new(
        dal: Arc<DataAccessLayer>,
        wal: WriteAheadLog,
        cache_size: usize,
    ) -> Result<Arc<Self>> {
        ensure!(cache_size > 0, "cache must have at least one frame");
        let page_size = dal.page_size();
        let buffers = (0..cache_size)
            .map(|_| FrameBuffer(std::cell::UnsafeCell::new(vec![0u8; page_size].into_boxed_slice())))
            .collect();
        Ok(Arc::new_cyclic(|self_ref| Self {
            dal,
            wal,
            page_size,
            buffers,
            usage: (0..cache_size).map(|_| AtomicU32::new(0)).collect(),
            dirty: (0..cache_size).map(|_| AtomicBool::new(false)).collect(),
            state: Mutex::new(CacheState {
                table: HashMap::with_capacity(cache_size),
                descriptors: vec![FrameDescriptor::default(); cache_size],
                slot_free_list: FreeList::with_slots(cache_size),
                clock_hand: 0,
            }),
            self_ref: self_ref.clone(),
        }))
    }

    fn arc(&self) -> Arc<PageCache> {
        // The weak back-reference points at the Arc this method was
        // reached through, so the upgrade cannot fail.
        self.self_ref.upgrade().expect("cache is alive while borrowed")
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn dal(&self) -> &Arc<DataAccessLayer> {
        &self.dal
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// Returns a pinned handle to the given page, loading it from the data
    /// access layer on a miss.
    pub fn get(&self, page_number: PageNumber) -> Result<PageHandle> {
        let mut state = self.state.lock();

        if let Some(&slot) = state.table.get(&page_number) {
            self.usage[slot].fetch_add(1, Ordering::AcqRel);
            state.descriptors[slot].second_chance = true;
            trace!(page_number, slot, "cache hit");
            return Ok(PageHandle::new(self.arc(), slot, page_number));
        }

        let slot = self.acquire_slot(&mut state)?;
        // SAFETY: the slot was just taken from the free path with a pin
        // count of zero, so no handle can be reading this buffer.
        let buffer = unsafe { &mut *self.buffers[slot].0.get() };
        if let Err(err) = self.dal.read_page(page_number, buffer) {
            // Hand the slot back so a failed load does not leak a frame.
            let _ = state.slot_free_list.release(slot as PageNumber);
            return Err(err)
                .wrap_err_with(|| format!("failed to load page {} into the cache", page_number));
        }

        self.install(&mut state, slot, page_number);
        trace!(page_number, slot, "cache miss, loaded from file");
        Ok(PageHandle::new(self.arc(), slot, page_number))
    }

    /// Allocates a brand new page through the data access layer and
    /// returns a pinned handle to its zeroed frame.
    pub fn get_new(&self) -> Result<PageHandle> {
        let mut state = self.state.lock();
        let slot = self.acquire_slot(&mut state)?;

        let page_number = match self.dal.allocate_page() {
            Ok(page_number) => page_number,
            Err(err) => {
                let _ = state.slot_free_list.release(slot as PageNumber);
                return Err(err);
            }
        };
        // SAFETY: slot acquired with a pin count of zero, see `get`.
        let buffer = unsafe { &mut *self.buffers[slot].0.get() };
        buffer.fill(0);

        self.install(&mut state, slot, page_number);
        trace!(page_number, slot, "allocated new page");
        Ok(PageHandle::new(self.arc(), slot, page_number))
    }

    /// Writes back every dirty frame, flushing the WAL first.
    pub fn flush_all(&self) -> Result<()> {
        let state = self.state.lock();
        self.wal.flush()?;
        let mut flushed = 0usize;
        for (slot, descriptor) in state.descriptors.iter().enumerate() {
            if descriptor.valid && self.dirty[slot].load(Ordering::Acquire) {
                // SAFETY: shared read of a resident frame for write-back;
                // writers go through handles which are quiesced by the
                // single-writer discipline during a flush.
                let buffer = unsafe { &*self.buffers[slot].0.get() };
                self.dal.write_page(descriptor.page_number, buffer)?;
                self.dirty[slot].store(false, Ordering::Release);
                flushed += 1;
            }
        }
        debug!(flushed, "cache flushed dirty frames");
        Ok(())
    }

    fn install(&self, state: &mut CacheState, slot: usize, page_number: PageNumber) {
        state.table.insert(page_number, slot);
        state.descriptors[slot] = FrameDescriptor {
            page_number,
            valid: true,
            second_chance: true,
        };
        self.usage[slot].store(1, Ordering::Release);
        self.dirty[slot].store(false, Ordering::Release);
        debug_assert!(state.table.len() <= self.capacity());
    }

    /// Takes a free slot, running the clock algorithm when none is free.
    fn acquire_slot(&self, state: &mut CacheState) -> Result<usize> {
        if let Some(slot) = state.slot_free_list.pop() {
            return Ok(slot as usize);
        }
        self.evict_next_victim(state)
    }

    /// Clock with second chance: clear set bits while advancing; the first
    /// unpinned frame whose bit is already clear is the victim.
    fn evict_next_victim(&self, state: &mut CacheState) -> Result<usize> {
        let capacity = self.capacity();
        for _ in 0..2 * capacity {
            let hand = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % capacity;

            if state.descriptors[hand].second_chance {
                state.descriptors[hand].second_chance = false;
                continue;
            }
            if self.usage[hand].load(Ordering::Acquire) > 0 {
                continue;
            }
            self.evict(state, hand)?;
            return Ok(hand);
        }
        bail!("cache exhausted: all {} frames are pinned", capacity);
    }

    fn evict(&self, state: &mut CacheState, slot: usize) -> Result<()> {
        let descriptor = state.descriptors[slot];
        if !descriptor.valid {
            return Ok(());
        }

        if self.dirty[slot].load(Ordering::Acquire) {
            // WAL-before-data: the records that produced these bytes must
            // be durable before the page itself is.
            self.wal.flush()?;
            // SAFETY: pin count is zero, no handle is touching the frame.
            let buffer = unsafe { &*self.buffers[slot].0.get() };
            self.dal.write_page(descriptor.page_number, buffer)?;
            self.dirty[slot].store(false, Ordering::Release);
        }

        debug!(
            page_number = descriptor.page_number,
            slot, "evicted page from cache"
        );
        state.table.remove(&descriptor.page_number);
        state.descriptors[slot].valid = false;
        Ok(())
    }

    /// Bytes of a resident frame. Callers hold a pinned handle.
    pub(crate) fn frame_bytes(&self, slot: usize) -> &[u8] {
        debug_assert!(self.usage[slot].load(Ordering::Acquire) > 0);
        // SAFETY: the frame is pinned by the calling handle, so it cannot
        // be evicted or remapped while the returned slice is alive.
        unsafe { &*self.buffers[slot].0.get() }
    }

    pub(crate) fn pin_again(&self, slot: usize) {
        let previous = self.usage[slot].fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pin_again on an unpinned frame");
    }

    pub(crate) fn unpin(&self, slot: usize) {
        let previous = self.usage[slot].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpin on an unpinned frame");
    }

    /// Transactional write path: records (old, new) into the WAL, copies
    /// the new bytes into the frame and marks it dirty.
    pub(crate) fn write_to_page(
        &self,
        transaction: u64,
        slot: usize,
        page_number: PageNumber,
        offset: PageOffset,
        bytes: &[u8],
    ) -> Result<()> {
        let offset_usize = offset as usize;
        ensure!(
            offset_usize + bytes.len() <= self.page_size,
            "page write out of bounds: offset {} + len {} > page size {}",
            offset,
            bytes.len(),
            self.page_size
        );
        debug_assert!(self.usage[slot].load(Ordering::Acquire) > 0);

        // SAFETY: the calling handle pins this frame and the single-writer
        // discipline means no other reference is live across this write.
        let buffer = unsafe { &mut *self.buffers[slot].0.get() };
        let old = buffer[offset_usize..offset_usize + bytes.len()].to_vec();
        self.wal.update(transaction, page_number, offset, &old, bytes)?;
        buffer[offset_usize..offset_usize + bytes.len()].copy_from_slice(bytes);
        self.dirty[slot].store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // Dirty frames that failed to flush earlier get retried here,
        // best-effort.
        if let Err(err) = self.flush_all() {
            error!(?err, "failed to flush cache on shutdown");
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PageCache")
            .field("capacity", &self.capacity())
            .field("resident", &state.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Transaction;
    use tempfile::tempdir;

    fn open_cache(dir: &std::path::Path, frames: usize) -> Arc<PageCache> {
        let dal = Arc::new(DataAccessLayer::open(dir).unwrap());
        let wal = WriteAheadLog::open(&dir.join(crate::config::WAL_DIR_NAME)).unwrap();
        PageCache::new(dal, wal, frames).unwrap()
    }

    #[test]
    fn cache_get_new_returns_zeroed_page() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 4);

        let page = cache.get_new().unwrap();
        assert_eq!(page.read::<u64>(0), 0);
        assert_eq!(page.read_bytes(0, 4096).iter().filter(|&&b| b != 0).count(), 0);
    }

    #[test]
    fn cache_hit_returns_same_contents() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 4);
        let txn = Transaction::new(1);

        let page = cache.get_new().unwrap();
        let page_number = page.page_number();
        txn.write(&page, 100, 0xDEADBEEFu32).unwrap();
        drop(page);

        let again = cache.get(page_number).unwrap();
        assert_eq!(again.read::<u32>(100), 0xDEADBEEF);
    }

    #[test]
    fn cache_eviction_writes_dirty_page_back() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);
        let txn = Transaction::new(1);

        let page = cache.get_new().unwrap();
        let page_number = page.page_number();
        txn.write(&page, 0, 0xABu8).unwrap();
        drop(page);

        // Force the dirty page out by filling the tiny cache.
        for _ in 0..4 {
            let p = cache.get_new().unwrap();
            drop(p);
        }

        // Read the page back through the DAL directly.
        let mut buffer = vec![0u8; 4096];
        cache.dal().read_page(page_number, &mut buffer).unwrap();
        assert_eq!(buffer[0], 0xAB);
    }

    #[test]
    fn cache_fails_when_every_frame_is_pinned() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);

        let _a = cache.get_new().unwrap();
        let _b = cache.get_new().unwrap();

        let result = cache.get_new();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cache exhausted"));
    }

    #[test]
    fn cache_unpinned_frames_are_reusable() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);

        let a = cache.get_new().unwrap();
        let b = cache.get_new().unwrap();
        drop(a);
        drop(b);

        // Plenty of room once the pins are gone.
        for _ in 0..6 {
            let page = cache.get_new().unwrap();
            drop(page);
        }
    }

    #[test]
    fn cache_new_handle_keeps_frame_resident() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);
        let txn = Transaction::new(1);

        let page = cache.get_new().unwrap();
        txn.write(&page, 8, 0x55AAu16).unwrap();
        let second = page.new_handle();
        drop(page);

        // One frame is still pinned through `second`; churn the other.
        for _ in 0..3 {
            let p = cache.get_new().unwrap();
            drop(p);
        }
        assert_eq!(second.read::<u16>(8), 0x55AA);
    }

    #[test]
    fn cache_write_records_old_and_new_bytes_in_wal() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 4);
        let txn = Transaction::new(9);

        let page = cache.get_new().unwrap();
        txn.write(&page, 0, 0x11u8).unwrap();
        txn.write(&page, 0, 0x22u8).unwrap();
        cache.wal().flush().unwrap();

        let log = std::fs::read(
            dir.path()
                .join(crate::config::WAL_DIR_NAME)
                .join(crate::config::WAL_FILE_NAME),
        )
        .unwrap();
        // Two UPDATE records of 37 bytes each (1-byte payloads).
        assert_eq!(log.len(), 2 * 37);
        // Second record's old byte must equal the first record's new byte.
        let first_new = log[36];
        let second_old = log[37 + 35];
        assert_eq!(first_new, 0x11);
        assert_eq!(second_old, 0x11);
        assert_eq!(log[37 + 36], 0x22);
    }

    #[test]
    fn cache_eviction_under_pressure_keeps_data_intact() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);
        let txn = Transaction::new(1);

        // Three times more pages than frames, each with a distinct value.
        let mut pages = Vec::new();
        for i in 0..6u64 {
            let page = cache.get_new().unwrap();
            txn.write(&page, 0, 0xAA00 + i).unwrap();
            pages.push(page.page_number());
        }

        // Everything reads back correctly whether it survived in a frame
        // or was evicted and reloaded from the file.
        for (i, &page_number) in pages.iter().enumerate() {
            let page = cache.get(page_number).unwrap();
            assert_eq!(page.read::<u64>(0), 0xAA00 + i as u64);
        }
    }

    #[test]
    fn cache_clock_eventually_cycles_all_frames() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);

        // Far more pages than frames: every allocation must find a slot.
        for _ in 0..20 {
            drop(cache.get_new().unwrap());
        }
        assert_eq!(cache.dal().num_pages(), 2 + 20);
    }

    #[test]
    fn cache_reload_after_eviction_round_trips() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 2);
        let txn = Transaction::new(1);

        let page = cache.get_new().unwrap();
        let page_number = page.page_number();
        txn.write(&page, 500, 0x1234567890ABCDEFu64).unwrap();
        drop(page);

        for _ in 0..4 {
            drop(cache.get_new().unwrap());
        }

        let reloaded = cache.get(page_number).unwrap();
        assert_eq!(reloaded.read::<u64>(500), 0x1234567890ABCDEF);
    }
}
