//! # ShaleDB - Embedded Append-Only Document Store
//!
//! ShaleDB is an embedded key-value store whose values are structured
//! documents (nested dicts, arrays, and scalars) and whose file is a
//! sequence of immutable snapshots. Every commit appends a delta-encoded
//! image of a persistent hash-trie index plus a fixed trailer; nothing is
//! ever rewritten, so every previously committed snapshot remains
//! readable forever.
//!
//! ## Quick Start
//!
//! ```ignore
//! use shaledb::{Db, PutMode, Value};
//!
//! let mut db = Db::builder().path("./app.db").open()?;
//!
//! db.put(b"user:1", PutMode::Insert,
//!        Some(&Value::from_json(r#"{"name": "Alice", "age": 31}"#)?))?;
//! db.commit_changes()?;
//!
//! let doc = db.get(b"user:1")?.unwrap();
//! assert_eq!(doc.get("name").unwrap().as_str(), Some("Alice"));
//!
//! // Any earlier commit stays readable:
//! let history = db.at_checkpoint(db.previous_checkpoint())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            Public API (Db)                │
//! ├───────────────────────────────────────────┤
//! │  Mutable Overlay (pending changes,        │
//! │  tombstones, merged iteration)            │
//! ├───────────────────────────────────────────┤
//! │  Persistent Hash Trie (snapshot index,    │
//! │  copy-on-write delta serialization)       │
//! ├───────────────────────────────────────────┤
//! │  Value Codec (documents, zero-copy views) │
//! ├───────────────────────────────────────────┤
//! │  Storage (reservation mmap, header and    │
//! │  trailer layouts, durability barriers)    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! offset 0     file header (24 bytes, magic)
//! offset 24    snapshot 0:  trie image ... padding ... trailer (32B)
//! page bound   snapshot 1:  delta image ... padding ... trailer
//! ...
//! ```
//!
//! Each snapshot ends on a page boundary with a trailer whose magics,
//! tree offset, and previous-checkpoint pointer let recovery find the
//! last durable snapshot by scanning backward. A crash mid-commit costs
//! the uncommitted append and nothing else.
//!
//! ## Concurrency Model
//!
//! One writer per file; any number of read-only views. Readers are
//! isolated structurally, not by locks: the file only grows, a reader's
//! view length is captured when its snapshot loads, and the mapping base
//! never moves.
//!
//! ## Module Overview
//!
//! - [`db`]: the engine - open modes, document accessors, commit, revert,
//!   checkpoint access, compaction
//! - [`trie`]: persistent hash trie and its mutable overlay
//! - [`value`]: document model, binary codec, mutable heap collections
//! - [`storage`]: mapped file and on-disk record layouts
//! - [`encoding`]: varint and zigzag primitives
//! - [`parsing`]: numeric conversions and the JSON bridge
//! - [`error`]: typed error kinds raised through `eyre`

pub mod db;
pub mod encoding;
pub mod error;
pub mod parsing;
pub mod storage;
pub mod trie;
pub mod value;

pub use db::{CommitObserver, Db, DbBuilder, PutMode};
pub use error::StoreError;
pub use storage::OpenMode;
pub use value::{MutableArray, MutableDict, Value};
