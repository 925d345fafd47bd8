//! # Data Manager
//!
//! Owns everything under one database directory. Opening either creates
//! the directory layout (meta page, free list, collection index) or loads
//! the existing collection registry into memory.
//!
//! Collections are keyed either by auto-incrementing u64 or by byte
//! string, chosen at creation time. Values are documents; payloads larger
//! than the per-tree inline maximum transparently go through overflow
//! chains and come back byte-identical.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::btree::{
    BTreeManager, DatabaseEntry, DocumentPayload, EntryCreator, SearchResult, TreeIterator,
};
use crate::config::{DEFAULT_CACHE_FRAMES, WAL_DIR_NAME};
use crate::document::{decode_document, DataType, Document};
use crate::storage::{DataAccessLayer, PageCache, Transaction, WriteAheadLog};

use super::query::FilteredIter;

/// A collection key: u64 collections take integers, string collections
/// take byte strings.
#[derive(Debug, Clone, Copy)]
pub enum CollectionKey<'a> {
    UInt64(u64),
    Bytes(&'a [u8]),
}

impl CollectionKey<'_> {
    pub(crate) fn encoded(&self) -> SmallVec<[u8; 16]> {
        match self {
            CollectionKey::UInt64(value) => SmallVec::from_slice(&value.to_le_bytes()),
            CollectionKey::Bytes(bytes) => SmallVec::from_slice(bytes),
        }
    }
}

impl From<u64> for CollectionKey<'_> {
    fn from(value: u64) -> Self {
        CollectionKey::UInt64(value)
    }
}

impl<'a> From<&'a str> for CollectionKey<'a> {
    fn from(value: &'a str) -> Self {
        CollectionKey::Bytes(value.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for CollectionKey<'a> {
    fn from(value: &'a [u8]) -> Self {
        CollectionKey::Bytes(value)
    }
}

/// Registry field names inside the collection index documents.
const FIELD_COLLECTION_NAME: &str = "collection_name";
const FIELD_INDEX_PAGE: &str = "index_page_number";

pub struct DataManager {
    dal: Arc<DataAccessLayer>,
    cache: Arc<PageCache>,
    collection_index: BTreeManager,
    collections: HashMap<String, BTreeManager>,
    next_transaction: AtomicU64,
}

impl DataManager {
    /// Opens (or creates) the database at `path` with default settings.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, crate::config::DEFAULT_PAGE_SIZE_POWER, DEFAULT_CACHE_FRAMES)
    }

    /// Builder for opening with non-default page size or cache capacity.
    pub fn builder() -> super::builder::DataManagerBuilder {
        super::builder::DataManagerBuilder::new()
    }

    pub(crate) fn open_with(
        path: &Path,
        page_size_power: u8,
        cache_frames: usize,
    ) -> Result<Self> {
        let dal = Arc::new(DataAccessLayer::open_with_page_size_power(
            path,
            page_size_power,
        )?);
        let wal = WriteAheadLog::open(&path.join(WAL_DIR_NAME))?;
        let cache = PageCache::new(Arc::clone(&dal), wal, cache_frames)?;

        let mut collections = HashMap::new();
        let collection_index = if dal.index_page() == 0 {
            // Fresh database: the collection index does not exist yet.
            let txn = Transaction::new(0);
            cache.wal().begin(txn.id())?;
            let index = BTreeManager::create_new(Arc::clone(&cache), DataType::String, &txn)?;
            dal.set_index_page(index.root_page())?;
            cache.wal().commit(txn.id())?;
            cache.wal().flush()?;
            info!(
                index_page = index.root_page(),
                "initialized new collection index"
            );
            index
        } else {
            let index = BTreeManager::open(dal.index_page(), Arc::clone(&cache))?;
            let mut registered: Vec<(String, u64)> = Vec::new();
            for entry in index.iter()? {
                let document = document_from_entry(entry?)?;
                let name = document
                    .get_str(FIELD_COLLECTION_NAME)
                    .ok_or_else(|| eyre::eyre!("collection index entry without a name"))?
                    .to_owned();
                let page = document.get_u64(FIELD_INDEX_PAGE).ok_or_else(|| {
                    eyre::eyre!("collection index entry for '{}' without a root page", name)
                })?;
                registered.push((name, page));
            }
            for (name, page) in registered {
                debug!(collection = %name, root_page = page, "loaded collection");
                collections.insert(name, BTreeManager::open(page, Arc::clone(&cache))?);
            }
            info!(count = collections.len(), "opened existing database");
            index
        };

        Ok(Self {
            dal,
            cache,
            collection_index,
            collections,
            next_transaction: AtomicU64::new(1),
        })
    }

    fn begin_transaction(&self) -> Result<Transaction> {
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        self.cache.wal().begin(id)?;
        Ok(Transaction::new(id))
    }

    fn commit_transaction(&self, txn: &Transaction) -> Result<()> {
        self.cache.wal().commit(txn.id())?;
        self.cache.wal().flush()
    }

    fn abort_transaction(&self, txn: &Transaction) {
        // Best effort; the abort record is advisory for a future redo
        // pass.
        let _ = self.cache.wal().abort(txn.id());
    }

    fn collection(&self, name: &str) -> Result<&BTreeManager> {
        self.collections
            .get(name)
            .ok_or_else(|| eyre::eyre!("collection '{}' does not exist", name))
    }

    /// Creates a collection keyed by `key_type` (String or UInt64).
    pub fn add_collection(&mut self, name: &str, key_type: DataType) -> Result<()> {
        ensure!(!name.is_empty(), "collection name cannot be empty");
        if self.collections.contains_key(name) {
            bail!("collection '{}' already exists", name);
        }

        let txn = self.begin_transaction()?;
        let tree = BTreeManager::create_new(Arc::clone(&self.cache), key_type, &txn)?;

        let mut registry_entry = Document::new();
        registry_entry
            .insert(FIELD_COLLECTION_NAME, name)
            .insert(FIELD_INDEX_PAGE, tree.root_page());

        let mut creator = EntryCreator::new(DocumentPayload::new(&registry_entry), true);
        let added = self
            .collection_index
            .add(&txn, name.as_bytes(), &mut creator)
            .wrap_err_with(|| format!("failed to register collection '{}'", name))?;
        if !added {
            self.abort_transaction(&txn);
            bail!("collection '{}' already registered in the index", name);
        }
        self.commit_transaction(&txn)?;

        info!(collection = %name, root_page = tree.root_page(), ?key_type, "created collection");
        self.collections.insert(name.to_owned(), tree);
        Ok(())
    }

    /// Inserts a document under an explicit key. Returns false when the
    /// key is already present (the stored value is unchanged).
    pub fn add_value<'k>(
        &self,
        collection: &str,
        key: impl Into<CollectionKey<'k>>,
        document: &Document,
    ) -> Result<bool> {
        let tree = self.collection(collection)?;
        let key = key.into().encoded();

        let txn = self.begin_transaction()?;
        let mut creator = EntryCreator::new(DocumentPayload::new(document), true);
        match tree.add(&txn, &key, &mut creator) {
            Ok(true) => {
                self.commit_transaction(&txn)?;
                Ok(true)
            }
            Ok(false) => {
                self.abort_transaction(&txn);
                Ok(false)
            }
            Err(err) => {
                self.abort_transaction(&txn);
                Err(err)
            }
        }
    }

    /// Inserts a document under the collection's auto-increment counter
    /// and returns the assigned key. Only valid on u64-keyed collections.
    pub fn add_value_auto(&self, collection: &str, document: &Document) -> Result<u64> {
        let tree = self.collection(collection)?;

        let txn = self.begin_transaction()?;
        let mut creator = EntryCreator::new(DocumentPayload::new(document), true);
        match tree.add_auto_key(&txn, &mut creator) {
            Ok(key) => {
                self.commit_transaction(&txn)?;
                Ok(key)
            }
            Err(err) => {
                self.abort_transaction(&txn);
                Err(err)
            }
        }
    }

    /// Descends to the leaf the key belongs in. The result says whether
    /// the key is present without materializing the value.
    pub fn search<'k>(
        &self,
        collection: &str,
        key: impl Into<CollectionKey<'k>>,
    ) -> Result<SearchResult> {
        self.collection(collection)?.search(&key.into().encoded())
    }

    /// Point lookup returning the stored document, or `None` when the key
    /// is absent.
    pub fn retrieve<'k>(
        &self,
        collection: &str,
        key: impl Into<CollectionKey<'k>>,
    ) -> Result<Option<Document>> {
        let tree = self.collection(collection)?;
        match tree.retrieve(&key.into().encoded())? {
            Some(entry) => Ok(Some(document_from_entry(entry)?)),
            None => Ok(None),
        }
    }

    /// Iterates a collection's documents in key order.
    pub fn iter(&self, collection: &str) -> Result<DocumentIter<'_>> {
        Ok(DocumentIter {
            inner: self.collection(collection)?.iter()?,
        })
    }

    /// Iterates the documents matching `predicate`, in key order.
    pub fn iter_where<P>(&self, collection: &str, predicate: P) -> Result<FilteredIter<'_, P>>
    where
        P: Fn(&Document) -> bool,
    {
        Ok(FilteredIter::new(
            self.collection(collection)?.iter()?,
            predicate,
        ))
    }

    /// Writes every dirty page back (WAL first), persists the meta record
    /// and free list, and appends a CHECKPOINT record to the log.
    pub fn checkpoint(&self) -> Result<()> {
        self.cache.flush_all()?;
        self.dal.persist()?;
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        self.cache.wal().checkpoint(id)?;
        self.cache.wal().flush()
    }

    /// Names of all collections, ordered.
    pub fn collection_names(&self) -> BTreeSet<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("collections", &self.collection_names())
            .finish()
    }
}

/// Materializes an entry (following its overflow chain if any) and
/// decodes the payload as a document.
pub(crate) fn document_from_entry(entry: DatabaseEntry<'_>) -> Result<Document> {
    let bytes = entry.collect()?;
    decode_document(&bytes, true)
}

/// Iterator over a collection's documents in key order.
pub struct DocumentIter<'t> {
    inner: TreeIterator<'t>,
}

impl Iterator for DocumentIter<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.and_then(document_from_entry))
    }
}
