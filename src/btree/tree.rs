//! # B+ Tree Manager
//!
//! Search, insertion with splits, vacuum and the tree-level counters.
//! One manager exists per collection plus one for the collection index;
//! they all share the page cache.
//!
//! ## Root Reserved Tail
//!
//! The root page reserves a tail for tree state, addressed relative to
//! `reserved_start`:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------------
//! 0       1     key type tag (String = 2, UInt64 = 10)
//! 1       1     flags (unused)
//! 2       8     current overflow page number (0 = none yet)
//! 10      8     next overflow key
//! 18      8     auto-increment counter (u64 key type only)
//! ```
//!
//! The counters are mutated through transactions, so they serialize with
//! other writers through the cache/WAL path and survive reopen.
//!
//! ## Insert Path
//!
//! ```text
//! add(key, creator)
//!   └─ search(key) -> path of (page, index) frames + the leaf
//!        ├─ leaf has room        -> add_element_to_node
//!        └─ leaf is full         -> split_node
//!              ├─ root           -> split_root (tree grows one level)
//!              └─ otherwise      -> split_single_node,
//!                                   install separator in the parent,
//!                                   recursing upward while parents are full
//! ```
//!
//! Splits are unbalanced (all but one cell moves left) for u64 keys,
//! which keeps sequential auto-increment inserts dense, and balanced
//! (half and half) otherwise. When cells are copied between pages during
//! a split they are re-emitted verbatim with their original flags, so an
//! overflow header stays an overflow header.
//!
//! ## Vacuum
//!
//! After a split the donor page's cell heap is compacted in place: cells
//! are moved one by one toward `reserved_start` in descending offset
//! order and their pointers rewritten, then `free_end` snaps up to the
//! lowest cell. Scratch space is a heap vector, so the pointer count is
//! not limited by the compaction.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::entry::{EntryBuilder, EntryCopier, EntryCreator, SlicePayload};
use super::header::{offsets, CellFlags, NodeFlags, PageType};
use super::iter::TreeIterator;
use super::node::{Cell, KeyOrder, NodePage};
use super::reader::{read_entry, DatabaseEntry};
use crate::config::{
    DEFAULT_MAX_ENTRIES_PER_PAGE, DEFAULT_MAX_ENTRY_SIZE, DEFAULT_MIN_SPACE_FOR_ENTRY,
};
use crate::document::DataType;
use crate::storage::{PageCache, PageNumber, PageOffset, Transaction};

/// Reserved-tail field offsets, relative to the root's `reserved_start`.
mod reserved {
    use crate::storage::PageOffset;

    pub const KEY_TYPE: PageOffset = 0;
    pub const FLAGS: PageOffset = 1;
    pub const OVERFLOW_PAGE: PageOffset = 2;
    pub const OVERFLOW_KEY: PageOffset = 10;
    pub const AUTO_INCREMENT: PageOffset = 18;

    pub const BASE_SIZE: PageOffset = 18;
    pub const COUNTER_SIZE: PageOffset = 8;
}

/// Everything `add` needs to place one cell: the key and the builder that
/// produces the entry bytes.
pub struct StoreData<'a> {
    pub key: &'a [u8],
    pub creator: &'a mut dyn EntryBuilder,
}

/// Path from the root to the leaf a key belongs in, plus the leaf itself.
/// Each frame is (page number, descent index); the leaf frame's index is
/// the key's lower bound there.
pub struct SearchResult {
    pub(crate) path: SmallVec<[(PageNumber, PageOffset); 8]>,
    pub(crate) node: NodePage,
}

impl SearchResult {
    pub fn leaf_page(&self) -> PageNumber {
        self.node.page_number()
    }

    /// Number of pages on the root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Whether the leaf actually holds the searched key.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.node.cell_by_key(key).is_some()
    }
}

struct SplitOutcome {
    left_page: PageNumber,
    #[allow(dead_code)]
    right_page: PageNumber,
    split_key: Vec<u8>,
}

pub struct BTreeManager {
    cache: Arc<PageCache>,
    root_page: PageNumber,
    key_type: DataType,
    serialize_key_size: bool,
    order: KeyOrder,
    max_entry_size: PageOffset,
    max_entries_per_page: PageOffset,
    min_space_for_entry: PageOffset,
}

impl BTreeManager {
    /// Allocates and initializes a new tree. The root starts as a leaf
    /// with the reserved tail laid out for the given key type.
    pub fn create_new(cache: Arc<PageCache>, key_type: DataType, txn: &Transaction) -> Result<Self> {
        ensure!(
            matches!(key_type, DataType::String | DataType::UInt64),
            "unsupported key type {:?}, trees take String or UInt64 keys",
            key_type
        );

        let mut reserved = reserved::BASE_SIZE;
        if key_type == DataType::UInt64 {
            reserved += reserved::COUNTER_SIZE;
        }

        let order = order_for(key_type);
        let serialize_key_size = key_type == DataType::String;
        let handle = cache.get_new()?;
        let node = NodePage::init(
            handle,
            txn,
            PageType::RootLeaf,
            reserved,
            serialize_key_size,
            order,
        )?;

        let tail = node.reserved_start();
        txn.write(node.handle(), tail + reserved::KEY_TYPE, key_type as u8)?;
        txn.write(node.handle(), tail + reserved::FLAGS, 0u8)?;
        txn.write(node.handle(), tail + reserved::OVERFLOW_PAGE, 0u64)?;
        txn.write(node.handle(), tail + reserved::OVERFLOW_KEY, 0u64)?;
        if key_type == DataType::UInt64 {
            txn.write(node.handle(), tail + reserved::AUTO_INCREMENT, 0u64)?;
        }

        debug!(
            root_page = node.page_number(),
            ?key_type,
            "created new B-tree"
        );

        Ok(Self {
            cache,
            root_page: node.page_number(),
            key_type,
            serialize_key_size,
            order,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            max_entries_per_page: DEFAULT_MAX_ENTRIES_PER_PAGE,
            min_space_for_entry: DEFAULT_MIN_SPACE_FOR_ENTRY,
        })
    }

    /// Opens an existing tree rooted at `root_page`, reading the key type
    /// from the reserved tail.
    pub fn open(root_page: PageNumber, cache: Arc<PageCache>) -> Result<Self> {
        let handle = cache.get(root_page)?;
        // The order is not known before the tail is read; load with the
        // u64 comparator and only use the header here.
        let node = NodePage::load(handle, KeyOrder::UInt64)?;
        ensure!(
            node.is_root_page(),
            "page {} is not a tree root",
            root_page
        );
        let tag: u8 = node.handle().read(node.reserved_start() + reserved::KEY_TYPE);
        let key_type = DataType::from_tag(tag)?;
        ensure!(
            matches!(key_type, DataType::String | DataType::UInt64),
            "tree at page {} has unsupported key type {:?}",
            root_page,
            key_type
        );

        Ok(Self {
            cache,
            root_page,
            key_type,
            serialize_key_size: key_type == DataType::String,
            order: order_for(key_type),
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            max_entries_per_page: DEFAULT_MAX_ENTRIES_PER_PAGE,
            min_space_for_entry: DEFAULT_MIN_SPACE_FOR_ENTRY,
        })
    }

    pub fn root_page(&self) -> PageNumber {
        self.root_page
    }

    pub fn key_type(&self) -> DataType {
        self.key_type
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn max_entry_size(&self) -> PageOffset {
        self.max_entry_size
    }

    /// In-order iterator over the tree's leaf cells.
    pub fn iter(&self) -> Result<TreeIterator<'_>> {
        TreeIterator::new(self)
    }

    // ===========================================================================
    //  Insertion.
    // ===========================================================================

    /// Inserts `key` with the entry produced by `creator`. Returns false
    /// (without modifying anything) when the key already exists.
    pub fn add(
        &self,
        txn: &Transaction,
        key: &[u8],
        creator: &mut dyn EntryBuilder,
    ) -> Result<bool> {
        self.check_key(key)?;
        trace!(root = self.root_page, key_len = key.len(), "tree add");

        let result = self.search(key)?;
        if result.contains(key) {
            trace!(page = result.node.page_number(), "duplicate key rejected");
            return Ok(false);
        }

        let space_available = result.node.defragmented_free_space();
        let mut necessary = 2 + creator.minimum_entry_size() + 1 + key.len() as PageOffset;
        if !creator.needs_overflow() {
            necessary += 2; // entry size prefix
        }
        if self.serialize_key_size {
            necessary += 2;
        }
        let num_elements = result.node.num_pointers();

        let mut store = StoreData { key, creator };
        let fits = self.min_space_for_entry <= space_available
            && necessary <= space_available
            && num_elements + 1 <= self.max_entries_per_page;

        // The pre-check is an estimate; add_element_to_node re-measures
        // with the creator's real size and may still come up short.
        if !fits || !self.add_element_to_node(txn, &result.node, &mut store, true)? {
            trace!(
                page = result.node.page_number(),
                space_available,
                necessary,
                "leaf is full, splitting"
            );
            let SearchResult { mut path, node } = result;
            self.split_node(txn, node, &mut path, Some(&mut store))?;
        }
        Ok(true)
    }

    /// Inserts with an auto-incrementing key, only available on u64
    /// trees. Returns the key that was assigned.
    pub fn add_auto_key(
        &self,
        txn: &Transaction,
        creator: &mut dyn EntryBuilder,
    ) -> Result<u64> {
        ensure!(
            self.key_type == DataType::UInt64,
            "auto-increment keys require a UInt64-keyed tree"
        );
        let key = self.next_primary_key(txn)?;
        let added = self.add(txn, &key.to_le_bytes(), creator)?;
        ensure!(added, "auto-increment key {} already present", key);
        Ok(key)
    }

    /// Places one cell into the node. Returns false if the key exists
    /// (when `unique` is set) or the node lacks space; nothing is written
    /// in either case.
    pub(crate) fn add_element_to_node(
        &self,
        txn: &Transaction,
        node: &NodePage,
        data: &mut StoreData<'_>,
        unique: bool,
    ) -> Result<bool> {
        if unique && node.cell_by_key(data.key).is_some() {
            trace!(
                page = node.page_number(),
                "key already present in node"
            );
            return Ok(false);
        }

        // Snapshot before mutation so the sort decision below compares
        // against the pre-insert largest key.
        let greatest: Option<Vec<u8>> = node.largest_key().map(<[u8]>::to_vec);

        let requirements = node.space_requirements(data.key);
        let page_max = if node.is_overflow_page() {
            PageOffset::MAX
        } else {
            self.max_entry_size
        };
        let maximum_entry_size = page_max.min(requirements.max_entry_space);
        if maximum_entry_size < data.creator.minimum_entry_size() {
            return Ok(false);
        }

        let entry_size = data.creator.requested_size(maximum_entry_size)?;
        let cell_space = requirements.cell_header_space + entry_size;
        let required_space = requirements.pointer_space + cell_space;
        if node.defragmented_free_space() < required_space {
            trace!(
                page = node.page_number(),
                required_space,
                free = node.defragmented_free_space(),
                "not enough space to add element"
            );
            return Ok(false);
        }

        let entry_end = node.free_end();
        let entry_start = entry_end - cell_space;
        let mut offset = entry_start;

        // Flags: the builder's bits plus the ones the tree owns.
        let mut flags = data.creator.generate_flags() | CellFlags::ACTIVE;
        if node.keys_serialized() {
            flags |= CellFlags::KEY_SIZE_SERIALIZED;
        }
        offset = txn.write(node.handle(), offset, flags)?;

        // Key, with its size prefix when the page serializes key sizes.
        if node.keys_serialized() {
            offset = txn.write(node.handle(), offset, data.key.len() as u16)?;
        }
        offset = txn.write_bytes(node.handle(), offset, data.key)?;

        // Entry.
        offset = data.creator.create(offset, node.handle(), self, txn)?;
        ensure!(
            offset == entry_end,
            "incorrect amount of data written to cell in page {}: expected {} bytes, wrote {}",
            node.page_number(),
            cell_space,
            offset - entry_start
        );

        // Commit the cell: shrink the heap, append the pointer.
        let free_begin = node.free_begin();
        node.set_free_end(txn, entry_start)?;
        txn.write(node.handle(), free_begin, entry_start)?;
        node.set_free_begin(txn, free_begin + 2)?;

        // Keep the pointer array sorted unless this was a rightmost
        // append. The node's own order matters here: overflow pages use
        // u64 keys regardless of the tree's key type.
        if let Some(greatest) = greatest {
            if node.order().compare(data.key, &greatest) == Ordering::Less {
                node.sort_keys(txn)?;
            }
        }
        Ok(true)
    }

    // ===========================================================================
    //  Splitting.
    // ===========================================================================

    fn split_node(
        &self,
        txn: &Transaction,
        node: NodePage,
        path: &mut SmallVec<[(PageNumber, PageOffset); 8]>,
        data: Option<&mut StoreData<'_>>,
    ) -> Result<()> {
        if node.is_root_page() {
            return self.split_root(txn, data);
        }

        let outcome = self.split_single_node(txn, &node, data)?;
        path.pop();
        let &(parent_page, _) = path.last().ok_or_else(|| {
            eyre::eyre!(
                "split of non-root page {} reached an empty path",
                node.page_number()
            )
        })?;

        debug!(
            split = node.page_number(),
            left = outcome.left_page,
            parent = parent_page,
            "installing separator after split"
        );
        let parent = self.load_node_page(parent_page)?;

        // The left (new) page gets a separator cell in the parent; the
        // right page keeps the parent link it already had.
        let mut creator = EntryCreator::new(SlicePayload::from_value(outcome.left_page), false);
        let mut store = StoreData {
            key: &outcome.split_key,
            creator: &mut creator,
        };

        let requirements = parent.space_requirements(&outcome.split_key);
        let maximum_entry_size = self.max_entry_size.min(requirements.max_entry_space);
        let parent_full = parent.num_pointers() + 1 > self.max_entries_per_page
            || maximum_entry_size < store.creator.minimum_entry_size();

        if parent_full || !self.add_element_to_node(txn, &parent, &mut store, true)? {
            self.split_node(txn, parent, path, Some(&mut store))?;
        }
        Ok(())
    }

    /// Splits one non-root node: a new sibling takes the low cells and
    /// the original keeps the high ones, so the original's parent link
    /// stays valid. Returns the new sibling (left), the original (right)
    /// and the separator key.
    fn split_single_node(
        &self,
        txn: &Transaction,
        node: &NodePage,
        data: Option<&mut StoreData<'_>>,
    ) -> Result<SplitOutcome> {
        // Unbalanced splits keep sequential auto-increment inserts dense.
        let balanced = self.key_type != DataType::UInt64;
        let num_elements = node.num_pointers();
        ensure!(
            num_elements >= 2,
            "cannot split page {} with {} cells",
            node.page_number(),
            num_elements
        );
        let num_to_move = if balanced {
            num_elements / 2
        } else {
            num_elements - 1
        };

        let new_node = self.new_node_page(txn, node.page_type(), 0)?;
        debug!(
            from = node.page_number(),
            to = new_node.page_number(),
            num_to_move,
            balanced,
            "splitting node"
        );

        let pointers = node.pointers();
        let separator_offset = pointers[num_to_move as usize - 1];

        // For a pointers page the separator cell's child becomes the new
        // sibling's rightmost child and the cell itself moves up into the
        // parent; for a leaf the separator cell stays in the sibling.
        let split_key: Vec<u8>;
        let copy_count: PageOffset;
        if node.is_pointers_page() {
            match node.cell(separator_offset)? {
                Cell::Pointers(cell) => {
                    new_node.set_additional_data(txn, cell.child)?;
                    split_key = cell.key.to_vec();
                }
                Cell::Data(_) => bail!(
                    "corrupt page: data cell on pointers page {}",
                    node.page_number()
                ),
            }
            copy_count = num_to_move - 1;
        } else {
            split_key = node.key_for_cell(separator_offset).to_vec();
            copy_count = num_to_move;
        }

        for i in 0..copy_count {
            self.copy_cell_to(txn, node, pointers[i as usize], &new_node)?;
        }

        // Compact the original's pointer array down to the kept cells.
        let remaining: Vec<PageOffset> = pointers[num_to_move as usize..].to_vec();
        txn.write_span(node.handle(), offsets::POINTERS_START, &remaining)?;
        node.set_free_begin(
            txn,
            offsets::POINTERS_START + remaining.len() as PageOffset * 2,
        )?;

        // Reclaim the heap space of the moved cells before any re-insert.
        self.vacuum(txn, node)?;

        if let Some(data) = data {
            let target = if self.lte(data.key, &split_key) {
                &new_node
            } else {
                node
            };
            let added = self.add_element_to_node(txn, target, data, true)?;
            ensure!(
                added,
                "could not re-insert provoking entry into page {} after split",
                target.page_number()
            );
        }

        debug_assert!(!node.is_pointers_page() || node.additional_data() != 0);
        debug_assert!(!new_node.is_pointers_page() || new_node.additional_data() != 0);

        Ok(SplitOutcome {
            left_page: new_node.page_number(),
            right_page: node.page_number(),
            split_key,
        })
    }

    /// Splits the root, raising the tree height by one: two fresh
    /// children take the cells and the root becomes a pointers page with
    /// a single separator.
    fn split_root(&self, txn: &Transaction, data: Option<&mut StoreData<'_>>) -> Result<()> {
        let balanced = self.key_type != DataType::UInt64;
        let root = self.load_node_page(self.root_page)?;
        let was_pointers = root.is_pointers_page();
        let child_type = if was_pointers {
            PageType::Internal
        } else {
            PageType::Leaf
        };

        let left = self.new_node_page(txn, child_type, 0)?;
        let right = self.new_node_page(txn, child_type, 0)?;
        debug!(
            root = self.root_page,
            left = left.page_number(),
            right = right.page_number(),
            "splitting root"
        );

        let num_elements = root.num_pointers();
        ensure!(
            num_elements >= 2,
            "cannot split root {} with {} cells",
            self.root_page,
            num_elements
        );
        let num_for_left = if balanced {
            num_elements / 2
        } else {
            num_elements - 1
        };
        let split_key = root.key_for_nth_cell(num_for_left)?.to_vec();

        let pointers = root.pointers();
        for i in 0..num_elements {
            let target = if i <= num_for_left { &left } else { &right };
            let cell_offset = pointers[i as usize];
            if was_pointers && i == num_for_left {
                // The separator cell's child becomes the left child's
                // rightmost pointer; the key lives on in the root.
                match root.cell(cell_offset)? {
                    Cell::Pointers(cell) => left.set_additional_data(txn, cell.child)?,
                    Cell::Data(_) => bail!(
                        "corrupt page: data cell on pointers page {}",
                        root.page_number()
                    ),
                }
                continue;
            }
            self.copy_cell_to(txn, &root, cell_offset, target)?;
        }

        if was_pointers {
            right.set_additional_data(txn, root.additional_data())?;
        }

        if let Some(data) = data {
            let target = if self.lte(data.key, &split_key) {
                &left
            } else {
                &right
            };
            let added = self.add_element_to_node(txn, target, data, !was_pointers)?;
            ensure!(
                added,
                "could not re-insert provoking entry into page {} after root split",
                target.page_number()
            );
        }

        // Wipe the root's cell area and turn it into a pointers page with
        // one separator and the right child as rightmost. The reserved
        // tail (key type, counters) is untouched.
        root.set_free_begin(txn, offsets::POINTERS_START)?;
        root.set_free_end(txn, root.reserved_start())?;
        root.set_flags(txn, root.flags() | NodeFlags::POINTERS_PAGE)?;

        let mut creator = EntryCreator::new(SlicePayload::from_value(left.page_number()), false);
        let mut store = StoreData {
            key: &split_key,
            creator: &mut creator,
        };
        let added = self.add_element_to_node(txn, &root, &mut store, true)?;
        ensure!(added, "could not install separator in the new root");
        root.set_additional_data(txn, right.page_number())?;
        Ok(())
    }

    /// Re-emits one cell on another page, preserving payload shape and
    /// flags.
    fn copy_cell_to(
        &self,
        txn: &Transaction,
        from: &NodePage,
        cell_offset: PageOffset,
        to: &NodePage,
    ) -> Result<()> {
        let cell = from.cell(cell_offset)?;
        let added = match &cell {
            Cell::Pointers(pointers_cell) => {
                let mut creator =
                    EntryCreator::new(SlicePayload::from_value(pointers_cell.child), false);
                let mut store = StoreData {
                    key: pointers_cell.key,
                    creator: &mut creator,
                };
                self.add_element_to_node(txn, to, &mut store, true)?
            }
            Cell::Data(data_cell) => {
                let mut creator = EntryCopier::new(data_cell.flags, data_cell.payload);
                let mut store = StoreData {
                    key: data_cell.key,
                    creator: &mut creator,
                };
                self.add_element_to_node(txn, to, &mut store, true)?
            }
        };
        ensure!(
            added,
            "could not copy cell from page {} to page {}",
            from.page_number(),
            to.page_number()
        );
        Ok(())
    }

    /// In-place compaction of a node's cell heap: cells move toward
    /// `reserved_start` in descending offset order, pointers follow, and
    /// `free_end` snaps up to the lowest cell.
    pub(crate) fn vacuum(&self, txn: &Transaction, node: &NodePage) -> Result<()> {
        let pointers = node.pointers();
        let mut by_offset: Vec<(PageOffset, PageOffset)> = pointers
            .iter()
            .enumerate()
            .map(|(index, &offset)| (offset, index as PageOffset))
            .collect();
        by_offset.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        trace!(
            page = node.page_number(),
            free_before = node.defragmented_free_space(),
            "vacuuming node"
        );

        let mut next_point = node.reserved_start();
        for (cell_offset, pointer_index) in by_offset {
            let cell_size = node.cell(cell_offset)?.cell_size();
            next_point -= cell_size;
            if next_point != cell_offset {
                txn.move_in_page(node.handle(), cell_offset, next_point, cell_size)?;
                txn.write(
                    node.handle(),
                    offsets::POINTERS_START + pointer_index * 2,
                    next_point,
                )?;
            }
        }
        node.set_free_end(txn, next_point)?;

        trace!(
            page = node.page_number(),
            free_after = node.defragmented_free_space(),
            "vacuum finished"
        );
        Ok(())
    }

    // ===========================================================================
    //  Search and retrieval.
    // ===========================================================================

    /// Descends from the root to the leaf this key belongs in.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let mut node = self.load_node_page(self.root_page)?;
        let mut current_page = node.page_number();
        let mut path: SmallVec<[(PageNumber, PageOffset); 8]> = SmallVec::new();

        loop {
            if !node.is_pointers_page() {
                let index = node
                    .lower_bound(key)
                    .map_or(node.num_pointers(), |(_, index)| index);
                path.push((current_page, index));
                return Ok(SearchResult { path, node });
            }

            let (next_page, index) = node.next_page_in_pointers(key)?;
            ensure!(
                next_page != current_page,
                "corrupt page: search loops on page {}",
                current_page
            );
            path.push((current_page, index));
            current_page = next_page;
            node = self.load_node_page(next_page)?;
        }
    }

    /// Point lookup. `None` when the key is absent; that is a result, not
    /// an error.
    pub fn retrieve(&self, key: &[u8]) -> Result<Option<DatabaseEntry<'_>>> {
        self.check_key(key)?;
        let result = self.search(key)?;
        match result.node.cell_by_key(key) {
            Some(cell_offset) => {
                let entry = read_entry(cell_offset, result.node.handle().new_handle(), self)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    // ===========================================================================
    //  Tree counters (root reserved tail).
    // ===========================================================================

    /// Mints the next auto-increment key.
    fn next_primary_key(&self, txn: &Transaction) -> Result<u64> {
        let root = self.load_node_page(self.root_page)?;
        let offset = root.reserved_start() + reserved::AUTO_INCREMENT;
        let key: u64 = root.handle().read(offset);
        txn.write(root.handle(), offset, key + 1)?;
        Ok(key)
    }

    /// The overflow page new chains currently land on, allocating the
    /// first one on demand.
    pub(crate) fn current_overflow_page(&self, txn: &Transaction) -> Result<PageNumber> {
        let root = self.load_node_page(self.root_page)?;
        let page: PageNumber = root
            .handle()
            .read(root.reserved_start() + reserved::OVERFLOW_PAGE);
        if page == 0 {
            return self.next_overflow_page(txn);
        }
        Ok(page)
    }

    /// Allocates a fresh overflow page and records it as current.
    pub(crate) fn next_overflow_page(&self, txn: &Transaction) -> Result<PageNumber> {
        let handle = self.cache.get_new()?;
        let node = NodePage::init_overflow(handle, txn)?;
        let page_number = node.page_number();

        let root = self.load_node_page(self.root_page)?;
        txn.write(
            root.handle(),
            root.reserved_start() + reserved::OVERFLOW_PAGE,
            page_number,
        )?;
        debug!(page_number, "allocated overflow page");
        Ok(page_number)
    }

    /// Mints the next overflow key.
    pub(crate) fn next_overflow_entry_number(&self, txn: &Transaction) -> Result<u64> {
        let root = self.load_node_page(self.root_page)?;
        let offset = root.reserved_start() + reserved::OVERFLOW_KEY;
        let key: u64 = root.handle().read(offset);
        txn.write(root.handle(), offset, key + 1)?;
        Ok(key)
    }

    // ===========================================================================
    //  Helpers.
    // ===========================================================================

    pub(crate) fn load_node_page(&self, page_number: PageNumber) -> Result<NodePage> {
        let handle = self.cache.get(page_number)?;
        NodePage::load(handle, self.order)
    }

    fn new_node_page(
        &self,
        txn: &Transaction,
        page_type: PageType,
        reserved: PageOffset,
    ) -> Result<NodePage> {
        let handle = self.cache.get_new()?;
        NodePage::init(
            handle,
            txn,
            page_type,
            reserved,
            self.serialize_key_size,
            self.order,
        )
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        match self.key_type {
            DataType::UInt64 => ensure!(
                key.len() == 8,
                "u64 keys must be exactly 8 bytes, got {}",
                key.len()
            ),
            _ => ensure!(
                !key.is_empty() && key.len() <= u16::MAX as usize,
                "string keys must be 1..=65535 bytes, got {}",
                key.len()
            ),
        }
        Ok(())
    }

    fn lte(&self, a: &[u8], b: &[u8]) -> bool {
        self.order.compare(a, b) != Ordering::Greater
    }
}

impl std::fmt::Debug for BTreeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeManager")
            .field("root_page", &self.root_page)
            .field("key_type", &self.key_type)
            .finish()
    }
}

fn order_for(key_type: DataType) -> KeyOrder {
    if key_type == DataType::String {
        KeyOrder::Lexicographic
    } else {
        KeyOrder::UInt64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DataAccessLayer, WriteAheadLog};
    use tempfile::tempdir;

    fn open_cache(dir: &std::path::Path, power: u8) -> Arc<PageCache> {
        let dal = Arc::new(DataAccessLayer::open_with_page_size_power(dir, power).unwrap());
        let wal = WriteAheadLog::open(&dir.join(crate::config::WAL_DIR_NAME)).unwrap();
        PageCache::new(dal, wal, 64).unwrap()
    }

    fn u64_tree(cache: &Arc<PageCache>) -> BTreeManager {
        let txn = Transaction::new(1);
        BTreeManager::create_new(Arc::clone(cache), DataType::UInt64, &txn).unwrap()
    }

    fn insert(tree: &BTreeManager, key: u64, payload: &[u8]) -> bool {
        let txn = Transaction::new(1);
        let mut creator = EntryCreator::new(SlicePayload::new(payload.to_vec()), true);
        tree.add(&txn, &key.to_le_bytes(), &mut creator).unwrap()
    }

    /// Walks the whole tree checking the structural invariants: the
    /// free-space frame, pointer ordering, key separation between
    /// subtrees, and uniform leaf depth. Returns (min, max) key of the
    /// subtree.
    fn check_subtree(
        tree: &BTreeManager,
        page: PageNumber,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let node = tree.load_node_page(page).unwrap();

        // Free-space frame.
        assert!(offsets::POINTERS_START <= node.free_begin());
        assert!(node.free_begin() <= node.free_end());
        assert!(node.free_end() <= node.reserved_start());
        assert!(node.reserved_start() as usize <= node.handle().page_size());

        // Pointer ordering: strictly ascending keys, every pointer lands
        // in the live cell heap.
        let pointers = node.pointers();
        for &pointer in &pointers {
            assert!(pointer >= node.free_end(), "pointer into the free gap");
        }
        for pair in pointers.windows(2) {
            let left = node.key_for_cell(pair[0]);
            let right = node.key_for_cell(pair[1]);
            assert_eq!(
                node.order().compare(left, right),
                Ordering::Less,
                "pointer array out of order on page {}",
                page
            );
        }

        if !node.is_pointers_page() {
            leaf_depths.push(depth);
            let min = pointers.first().map(|&p| node.key_for_cell(p).to_vec())?;
            let max = pointers.last().map(|&p| node.key_for_cell(p).to_vec())?;
            return Some((min, max));
        }

        // Key separation: subtree(child_i) <= key_i < subtree(child_i+1).
        let mut bounds = Vec::new();
        for i in 0..node.num_pointers() {
            let (child, key) = match node.nth_cell(i).unwrap() {
                Cell::Pointers(cell) => (cell.child, cell.key.to_vec()),
                Cell::Data(_) => panic!("data cell on pointers page {}", page),
            };
            bounds.push((check_subtree(tree, child, depth + 1, leaf_depths), Some(key)));
        }
        bounds.push((
            check_subtree(tree, node.additional_data(), depth + 1, leaf_depths),
            None,
        ));

        let mut overall: Option<(Vec<u8>, Vec<u8>)> = None;
        let mut previous_separator: Option<Vec<u8>> = None;
        for (subtree, separator) in bounds {
            if let Some((min, max)) = &subtree {
                if let Some(previous) = &previous_separator {
                    assert_eq!(
                        node.order().compare(min, previous),
                        Ordering::Greater,
                        "subtree key {:?} not above separator {:?} on page {}",
                        min,
                        previous,
                        page
                    );
                }
                if let Some(separator) = &separator {
                    assert_ne!(
                        node.order().compare(max, separator),
                        Ordering::Greater,
                        "subtree key {:?} above its separator {:?} on page {}",
                        max,
                        separator,
                        page
                    );
                }
                overall = match overall {
                    None => Some((min.clone(), max.clone())),
                    Some((o_min, _)) => Some((o_min, max.clone())),
                };
            }
            previous_separator = separator;
        }
        overall
    }

    fn assert_tree_well_formed(tree: &BTreeManager) {
        let mut leaf_depths = Vec::new();
        check_subtree(tree, tree.root_page(), 1, &mut leaf_depths);
        let distinct: std::collections::BTreeSet<usize> = leaf_depths.iter().copied().collect();
        assert!(distinct.len() <= 1, "leaves at depths {:?}", distinct);
    }

    #[test]
    fn create_new_writes_key_type_into_reserved_tail() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        let root = tree.load_node_page(tree.root_page()).unwrap();
        let tag: u8 = root.handle().read(root.reserved_start());
        assert_eq!(tag, DataType::UInt64 as u8);
        assert!(root.is_root_page());
        assert!(!root.is_pointers_page());
    }

    #[test]
    fn open_recovers_key_type_and_comparator() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let txn = Transaction::new(1);
        let created =
            BTreeManager::create_new(Arc::clone(&cache), DataType::String, &txn).unwrap();

        let opened = BTreeManager::open(created.root_page(), Arc::clone(&cache)).unwrap();
        assert_eq!(opened.key_type(), DataType::String);
    }

    #[test]
    fn open_rejects_non_root_pages() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        for key in 0..400u64 {
            insert(&tree, key, &[7u8; 40]);
        }
        // Any leaf is a non-root page now.
        let result = tree.search(&0u64.to_le_bytes()).unwrap();
        let leaf = result.leaf_page();
        assert_ne!(leaf, tree.root_page());
        assert!(BTreeManager::open(leaf, Arc::clone(&cache)).is_err());
    }

    #[test]
    fn duplicate_add_returns_false_without_writes() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        assert!(insert(&tree, 7, b"first"));
        let lsn_before = cache.wal().next_lsn();
        assert!(!insert(&tree, 7, b"second"));
        assert_eq!(cache.wal().next_lsn(), lsn_before, "duplicate produced writes");

        let entry = tree.retrieve(&7u64.to_le_bytes()).unwrap().unwrap();
        assert_eq!(entry.collect().unwrap(), b"first");
    }

    #[test]
    fn out_of_order_inserts_keep_pointer_array_sorted() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        for key in [50u64, 10, 90, 30, 70, 20] {
            insert(&tree, key, &key.to_le_bytes());
        }

        let root = tree.load_node_page(tree.root_page()).unwrap();
        let pointers = root.pointers();
        let keys: Vec<u64> = pointers
            .iter()
            .map(|&p| u64::from_le_bytes(root.key_for_cell(p).try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![10, 20, 30, 50, 70, 90]);
    }

    #[test]
    fn tree_invariants_hold_through_sequential_growth() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 9);
        let tree = u64_tree(&cache);

        for key in 0..500u64 {
            insert(&tree, key, &[0x11; 24]);
        }
        assert_tree_well_formed(&tree);
    }

    #[test]
    fn tree_invariants_hold_through_scattered_growth() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 9);
        let txn = Transaction::new(1);
        let tree = BTreeManager::create_new(Arc::clone(&cache), DataType::String, &txn).unwrap();

        // Multiplicative stepping scatters the insert order.
        let modulus = 509u64;
        let mut value = 1u64;
        for _ in 0..modulus - 1 {
            let key = format!("k{:06}", value);
            let mut creator = EntryCreator::new(SlicePayload::new(vec![0x22; 20]), true);
            assert!(tree.add(&txn, key.as_bytes(), &mut creator).unwrap());
            value = value * 2 % modulus;
        }
        assert_tree_well_formed(&tree);
    }

    #[test]
    fn overflow_counters_advance_in_the_reserved_tail() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);
        let txn = Transaction::new(1);

        assert_eq!(tree.next_overflow_entry_number(&txn).unwrap(), 0);
        assert_eq!(tree.next_overflow_entry_number(&txn).unwrap(), 1);

        let first = tree.current_overflow_page(&txn).unwrap();
        assert_ne!(first, 0);
        // Stable until a fresh page is requested.
        assert_eq!(tree.current_overflow_page(&txn).unwrap(), first);
        let second = tree.next_overflow_page(&txn).unwrap();
        assert_ne!(second, first);
        assert_eq!(tree.current_overflow_page(&txn).unwrap(), second);
    }

    #[test]
    fn large_entries_round_trip_through_overflow_chains() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert!(insert(&tree, 1, &payload));

        let entry = tree.retrieve(&1u64.to_le_bytes()).unwrap().unwrap();
        assert_eq!(entry.collect().unwrap(), payload);
        assert_tree_well_formed(&tree);
    }

    #[test]
    fn vacuum_compacts_donor_pages_after_splits() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 9);
        let tree = u64_tree(&cache);

        for key in 0..40u64 {
            insert(&tree, key, &[0x33; 40]);
        }

        // Every data page's heap must be contiguous: the sum of its cell
        // sizes equals the span from free_end to reserved_start.
        let mut leaf_depths = Vec::new();
        let mut stack = vec![tree.root_page()];
        while let Some(page) = stack.pop() {
            let node = tree.load_node_page(page).unwrap();
            if node.is_pointers_page() {
                for i in 0..node.num_pointers() {
                    match node.nth_cell(i).unwrap() {
                        Cell::Pointers(cell) => stack.push(cell.child),
                        Cell::Data(_) => unreachable!(),
                    }
                }
                stack.push(node.additional_data());
                continue;
            }
            leaf_depths.push(page);
            let total: usize = node
                .pointers()
                .iter()
                .map(|&p| node.cell(p).unwrap().cell_size() as usize)
                .sum();
            assert_eq!(
                total,
                (node.reserved_start() - node.free_end()) as usize,
                "fragmented heap on page {}",
                page
            );
        }
        assert!(!leaf_depths.is_empty());
    }

    #[test]
    fn retrieve_missing_key_is_none_not_error() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);

        insert(&tree, 1, b"one");
        assert!(tree.retrieve(&2u64.to_le_bytes()).unwrap().is_none());
    }

    #[test]
    fn check_key_rejects_malformed_keys() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path(), 12);
        let tree = u64_tree(&cache);
        let txn = Transaction::new(1);

        let mut creator = EntryCreator::new(SlicePayload::new(vec![1]), true);
        assert!(tree.add(&txn, b"short", &mut creator).is_err());
    }
}
