//! # Database Engine
//!
//! [`Db`] ties the storage layer, the snapshot trie, and the mutable
//! overlay into the public API. A handle is always anchored at a
//! *checkpoint* (the byte offset ending a committed snapshot) and, when
//! writable, carries an overlay of pending changes on top of it.
//!
//! ## Snapshot Lifecycle
//!
//! ```text
//!  open ──> load latest snapshot ──> get / put / remove / get_mutable
//!                 ^                           │
//!                 │                           ▼
//!                 └── commit_changes: append delta + trailer, reload
//!                     revert_changes: reload, dropping the overlay
//! ```
//!
//! Commits only append. Every previous checkpoint remains a valid
//! read-only view forever and can be opened with [`Db::at_checkpoint`];
//! the bytes up to it never change (see `data_up_to_checkpoint`, which
//! tests rely on to prove it).
//!
//! ## Sharing
//!
//! Handles cloned with [`Db::at_checkpoint`] or [`Db::with_mode`] share
//! one mapped file. At most one writer may exist per file; readers are
//! unaffected by concurrent appends because their view length is captured
//! at load time.
//!
//! ## Module Organization
//!
//! - `builder`: fluent open configuration
//! - `recovery`: snapshot load and backward trailer scan
//! - `commit`: the append protocol and its durability barriers

mod builder;
mod commit;
mod recovery;

pub use builder::DbBuilder;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::storage::{MappedFile, OpenMode};
use crate::trie::{HashTrie, Overlay};
use crate::value::heap::HeapValue;
use crate::value::{CollectionKind, MutableDict, Value};

/// Conflict handling for [`Db::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Store only if the key does not exist yet.
    Insert,
    /// Store only if the key already exists.
    Update,
    /// Store unconditionally.
    Upsert,
}

/// Callback invoked after every successful commit with the new file size.
pub type CommitObserver = Box<dyn Fn(&Db, u64) + Send + Sync>;

/// An embedded document store over a single append-only file.
pub struct Db {
    file: Arc<MappedFile>,
    page_size: u64,
    /// Length of the loaded snapshot view; also the current checkpoint.
    data_len: u64,
    prev_checkpoint: u64,
    writeable: bool,
    damaged: bool,
    trie: HashTrie,
    overlay: Overlay,
    commit_observer: Option<CommitObserver>,
}

impl Db {
    /// Starts building a database handle with explicit configuration.
    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    /// Opens a database file and loads its latest valid snapshot.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        max_map_size: u64,
        page_size: u64,
    ) -> Result<Db> {
        ensure!(page_size > 0, "page size must be positive");
        let file = Arc::new(MappedFile::open(path, mode, max_map_size)?);
        let latest = file.len();
        let mut db = Db::bare(file, page_size, mode.is_writeable());
        db.load_checkpoint(latest)?;
        Ok(db)
    }

    /// A read-only view of this database at an earlier checkpoint,
    /// sharing the mapped file. The checkpoint must be legal.
    pub fn at_checkpoint(&self, checkpoint: u64) -> Result<Db> {
        ensure!(
            self.is_legal_checkpoint(checkpoint),
            "{:#x} is not a legal checkpoint",
            checkpoint
        );
        let mut db = Db::bare(Arc::clone(&self.file), self.page_size, false);
        db.load_checkpoint(checkpoint)?;
        Ok(db)
    }

    /// A view of this database at its current checkpoint with writability
    /// intersected with `mode`.
    pub fn with_mode(&self, mode: OpenMode) -> Result<Db> {
        let writeable = self.writeable && mode.is_writeable();
        let mut db = Db::bare(Arc::clone(&self.file), self.page_size, writeable);
        db.load_checkpoint(self.checkpoint())?;
        Ok(db)
    }

    fn bare(file: Arc<MappedFile>, page_size: u64, writeable: bool) -> Db {
        Db {
            file,
            page_size,
            data_len: 0,
            prev_checkpoint: 0,
            writeable,
            damaged: false,
            trie: HashTrie::empty(),
            overlay: Overlay::with_trie(HashTrie::empty()),
            commit_observer: None,
        }
    }

    /// The loaded snapshot bytes.
    pub(crate) fn data(&self) -> &[u8] {
        &self.file.contents()[..self.data_len as usize]
    }

    /// Reads the document stored at `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.overlay.get_value(self.data(), key)
    }

    /// Whether a document exists at `key`, without decoding it.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.overlay.contains(self.data(), key)
    }

    /// Returns a mutable handle to the dict stored at `key`, promoting it
    /// into the overlay. The handle stays wired to this database until
    /// the next commit or revert.
    pub fn get_mutable(&mut self, key: &[u8]) -> Result<Option<MutableDict>> {
        ensure!(self.writeable, "database is read-only");
        let file = Arc::clone(&self.file);
        let data = &file.contents()[..self.data_len as usize];
        let promoted = self.overlay.get_mutable(data, key, CollectionKind::Dict)?;
        Ok(promoted.and_then(|value| match value {
            HeapValue::Dict(dict) => Some(MutableDict::new(
                dict,
                Arc::clone(&self.file),
                self.data_len,
            )),
            _ => None,
        }))
    }

    /// Stores `value` at `key` under the given conflict mode. Returns
    /// false, leaving the state untouched, when the mode's precondition
    /// fails. A `None` value removes the key instead (except under
    /// `Insert`, which has nothing to insert and fails).
    pub fn put(&mut self, key: &[u8], mode: PutMode, value: Option<&Value>) -> Result<bool> {
        ensure!(self.writeable, "database is read-only");
        let Some(value) = value else {
            return if mode == PutMode::Insert {
                Ok(false)
            } else {
                self.remove(key)
            };
        };

        let exists = self.contains(key)?;
        if (mode == PutMode::Insert && exists) || (mode == PutMode::Update && !exists) {
            return Ok(false);
        }
        let file = Arc::clone(&self.file);
        let data = &file.contents()[..self.data_len as usize];
        self.overlay
            .set(data, key, HeapValue::Owned(value.clone()))?;
        Ok(true)
    }

    /// Read-modify-write in one step: `f` receives the current document
    /// (if any) and returns the replacement. Returning `None` aborts the
    /// put and reports failure.
    pub fn put_with<F>(&mut self, key: &[u8], mode: PutMode, f: F) -> Result<bool>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        ensure!(self.writeable, "database is read-only");
        let current = self.get(key)?;
        if (mode == PutMode::Insert && current.is_some())
            || (mode == PutMode::Update && current.is_none())
        {
            return Ok(false);
        }
        let Some(replacement) = f(current.as_ref()) else {
            return Ok(false);
        };
        let file = Arc::clone(&self.file);
        let data = &file.contents()[..self.data_len as usize];
        self.overlay.set(data, key, HeapValue::Owned(replacement))?;
        Ok(true)
    }

    /// Removes the document at `key`, returning whether one existed.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        ensure!(self.writeable, "database is read-only");
        let file = Arc::clone(&self.file);
        let data = &file.contents()[..self.data_len as usize];
        self.overlay.remove(data, key)
    }

    /// Appends a snapshot with the pending changes and reloads at the new
    /// checkpoint. A no-op when nothing changed.
    pub fn commit_changes(&mut self) -> Result<()> {
        if !self.overlay.is_changed() {
            return Ok(());
        }
        ensure!(self.writeable, "database is read-only");
        let new_size = self.append_snapshot()?;
        self.file.resize_to(new_size)?;
        self.load_checkpoint(new_size)?;

        if let Some(observer) = self.commit_observer.take() {
            observer(self, new_size);
            self.commit_observer = Some(observer);
        }
        Ok(())
    }

    /// Discards the pending changes by reloading the current checkpoint.
    pub fn revert_changes(&mut self) -> Result<()> {
        self.load_checkpoint(self.data_len)
    }

    /// Installs (or clears) the post-commit observer.
    pub fn set_commit_observer(&mut self, observer: Option<CommitObserver>) {
        self.commit_observer = observer;
    }

    /// The checkpoint this handle is anchored at: the end of the loaded
    /// snapshot.
    pub fn checkpoint(&self) -> u64 {
        self.data_len
    }

    /// The checkpoint of the snapshot before this one, or 0.
    pub fn previous_checkpoint(&self) -> u64 {
        self.prev_checkpoint
    }

    /// A checkpoint is legal when it lies within the loaded data on a
    /// page boundary.
    pub fn is_legal_checkpoint(&self, checkpoint: u64) -> bool {
        checkpoint <= self.data_len && checkpoint % self.page_size == 0
    }

    /// The immutable bytes `[0, checkpoint)`; `None` on an illegal
    /// checkpoint.
    pub fn data_up_to_checkpoint(&self, checkpoint: u64) -> Option<&[u8]> {
        self.is_legal_checkpoint(checkpoint)
            .then(|| &self.data()[..checkpoint as usize])
    }

    /// The bytes appended after `checkpoint`; `None` on an illegal
    /// checkpoint.
    pub fn data_since_checkpoint(&self, checkpoint: u64) -> Option<&[u8]> {
        self.is_legal_checkpoint(checkpoint)
            .then(|| &self.data()[checkpoint as usize..])
    }

    /// Every document, sorted by key, pending changes included.
    pub fn entries(&self) -> Result<Vec<(Box<[u8]>, Value)>> {
        let data = self.data();
        let mut out = Vec::with_capacity(self.overlay.count() as usize);
        for (key, value) in self.overlay.merged(data)? {
            out.push((key.into(), value.to_value(data)?));
        }
        Ok(out)
    }

    /// Number of documents, pending changes included.
    pub fn count(&self) -> u64 {
        self.overlay.count()
    }

    /// Size of the loaded snapshot in bytes.
    pub fn size(&self) -> u64 {
        self.data_len
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    /// Whether recovery had to discard a damaged tail to load this
    /// snapshot.
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    /// Whether the overlay holds uncommitted changes.
    pub fn has_changes(&self) -> bool {
        self.overlay.is_changed()
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.file.path())
            .field("checkpoint", &self.data_len)
            .field("page_size", &self.page_size)
            .field("writeable", &self.writeable)
            .field("damaged", &self.damaged)
            .field("count", &self.overlay.count())
            .finish()
    }
}
