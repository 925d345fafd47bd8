//! # Tree Iteration
//!
//! In-order traversal over a tree's leaf cells. The iterator keeps a
//! stack of (page, index) frames from the root down to the current leaf
//! position; construction descends always-leftward, and exhaustion of a
//! leaf pops back to the parent and descends into its next child. The
//! index of a pointers-page frame may equal its pointer count, which
//! designates the rightmost child.
//!
//! Entries are yielded with their own pinned page handles (via
//! `new_handle`), so an entry stays readable after the iterator moves on
//! or is dropped. Dropping the iterator releases every pin it holds.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use super::node::{Cell, NodePage};
use super::reader::{read_entry, DatabaseEntry};
use super::tree::BTreeManager;
use crate::storage::{PageNumber, PageOffset};

pub struct TreeIterator<'t> {
    tree: &'t BTreeManager,
    /// (page, index) frames from the root to the current position. Empty
    /// means exhausted.
    stack: SmallVec<[(PageNumber, PageOffset); 8]>,
}

impl<'t> TreeIterator<'t> {
    pub(crate) fn new(tree: &'t BTreeManager) -> Result<Self> {
        let mut iterator = Self {
            tree,
            stack: SmallVec::new(),
        };
        let root = tree.load_node_page(tree.root_page())?;
        // An empty root leaf means an empty tree.
        if root.num_pointers() != 0 {
            iterator.stack.push((tree.root_page(), 0));
            iterator.descend(&root, 0)?;
        }
        Ok(iterator)
    }

    /// Pushes frames for the leftmost path under `node`'s `index`-th
    /// child. No-op if `node` is already a data page.
    fn descend(&mut self, node: &NodePage, index: PageOffset) -> Result<()> {
        if !node.is_pointers_page() {
            return Ok(());
        }
        let mut next = child_at(node, index)?;
        loop {
            self.stack.push((next, 0));
            let node = self.tree.load_node_page(next)?;
            if !node.is_pointers_page() {
                return Ok(());
            }
            next = child_at(&node, 0)?;
        }
    }

    /// Moves past the current leaf cell, popping exhausted frames.
    fn advance(&mut self) -> Result<()> {
        // The top frame is the current data page.
        let last = self.stack.len() - 1;
        let (page_number, index) = self.stack[last];
        let node = self.tree.load_node_page(page_number)?;
        if index + 1 < node.num_pointers() {
            self.stack[last].1 = index + 1;
            return Ok(());
        }
        self.stack.pop();
        self.climb()
    }

    /// Climbs until a parent still has a child to visit, then descends
    /// into it; the index may equal the pointer count to reach the
    /// rightmost child.
    fn climb(&mut self) -> Result<()> {
        while !self.stack.is_empty() {
            let last = self.stack.len() - 1;
            let (page_number, index) = self.stack[last];
            let node = self.tree.load_node_page(page_number)?;
            let next_index = index + 1;
            if next_index <= node.num_pointers() {
                self.stack[last].1 = next_index;
                self.descend(&node, next_index)?;
                return Ok(());
            }
            self.stack.pop();
        }
        Ok(())
    }

    fn current_entry(&self) -> Result<DatabaseEntry<'t>> {
        let &(page_number, index) = self.stack.last().expect("checked by next()");
        let node = self.tree.load_node_page(page_number)?;
        ensure!(
            node.is_data_page(),
            "iterator stopped on pointers page {}",
            page_number
        );
        let cell_offset = node.cell_offset_by_index(index)?;
        read_entry(cell_offset, node.handle().new_handle(), self.tree)
    }
}

impl<'t> Iterator for TreeIterator<'t> {
    type Item = Result<DatabaseEntry<'t>>;

    fn next(&mut self) -> Option<Self::Item> {
        // Skip over exhausted frames and empty leaves (an unbalanced
        // split can leave a data page with zero cells).
        loop {
            let &(page_number, index) = self.stack.last()?;
            let in_range = match self.tree.load_node_page(page_number) {
                Ok(node) => index < node.num_pointers(),
                Err(err) => {
                    self.stack.clear();
                    return Some(Err(err));
                }
            };
            if in_range {
                break;
            }
            self.stack.pop();
            if let Err(err) = self.climb() {
                self.stack.clear();
                return Some(Err(err));
            }
        }

        match self.current_entry() {
            Ok(entry) => {
                if let Err(err) = self.advance() {
                    self.stack.clear();
                    return Some(Err(err));
                }
                Some(Ok(entry))
            }
            Err(err) => {
                // Stop after surfacing the error once.
                self.stack.clear();
                Some(Err(err))
            }
        }
    }
}

/// The `index`-th child of a pointers page; the pointer count designates
/// the rightmost child stored in the header.
fn child_at(node: &NodePage, index: PageOffset) -> Result<PageNumber> {
    if index == node.num_pointers() {
        let next = node.additional_data();
        ensure!(
            next != 0,
            "corrupt page: rightmost pointer of page {} is zero",
            node.page_number()
        );
        return Ok(next);
    }
    match node.nth_cell(index)? {
        Cell::Pointers(cell) => Ok(cell.child),
        Cell::Data(_) => bail!(
            "corrupt page: data cell on pointers page {}",
            node.page_number()
        ),
    }
}
