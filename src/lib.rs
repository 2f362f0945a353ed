//! # pstore - Append-Only Content-Addressed Store
//!
//! `pstore` is a memory-mapped, append-only key/value store built to hold
//! the artifacts of a compilation pipeline (object-code fragments,
//! compilation records, debug-line headers, interned symbol names) across
//! many build invocations. Keys are content digests or interned strings;
//! values are opaque blobs from a few bytes to megabytes.
//!
//! The store is shared read/write by concurrent producers (compilers,
//! linkers) and read by consumers (debuggers, dump tools). Writers commit
//! through a single-writer transactional model; any number of readers
//! observe previously committed states without locks.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pstore::{AccessMode, Database, Digest, Extent};
//!
//! let db = Database::create("./artifacts.db")?;
//!
//! let mut txn = db.begin()?;
//! let mut fragments = db.fragment_index()?;
//!
//! let body = txn.alloc_and_write(&object_code, 1)?;
//! let digest = Digest::new(hi, lo);
//! fragments.insert(&mut txn, &digest, &Extent::new(body, object_code.len() as u64))?;
//!
//! fragments.flush(&mut txn)?;
//! txn.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |  Indexes (HAMT maps, interned-string adder)      |
//! +--------------------------------------------------+
//! |  Serialization (archives, per-type codecs)       |
//! +--------------------------------------------------+
//! |  Transactions (bump allocator, commit/abort)     |
//! +--------------------------------------------------+
//! |  Database handle (tip snapshot, read views)      |
//! +--------------------------------------------------+
//! |  Segmented storage (regions, SAT, protect)       |
//! +--------------------------------------------------+
//! |  Memory-mapped file + footer chain               |
//! +--------------------------------------------------+
//! ```
//!
//! ## File Format
//!
//! A fixed header (magic, version, atomic footer tip) is followed by
//! appended transaction payloads, each sealed by a footer that links back
//! to its predecessor. Readers snapshot the tip at open: every byte
//! reachable from that footer is immutable, so a snapshot is a consistent
//! multi-version view. Aborted or crashed transactions leave at most
//! unreachable garbage above the last sealed footer.
//!
//! ## Module Overview
//!
//! - [`address`]: store addresses, typed addresses, extents
//! - [`storage`]: regions, the segment address table, page protection
//! - [`database`]: open/close, snapshots, owning read views
//! - [`transaction`]: the transactional allocator
//! - [`serialize`]: archive readers/writers and the wire codecs
//! - [`index`]: the persistent HAMT and the four index kinds
//! - [`indirect_string`]: two-phase string interning

#[macro_use]
mod macros;

pub mod address;
pub mod database;
pub mod error;
pub mod index;
pub mod indirect_string;
pub mod serialize;
pub mod storage;
pub mod transaction;

pub use address::{Address, Extent, TypedAddress};
pub use database::{AccessMode, Database};
pub use error::{Error, Result};
pub use index::{
    CompilationIndex, DebugLineIndex, Digest, FragmentIndex, HamtMap, IndexKind, NameIndex,
    StableHashBuilder,
};
pub use indirect_string::{IndirectString, IndirectStringAdder};
pub use storage::file::Footer;
pub use storage::StoreRef;
pub use transaction::Transaction;
