//! # Indexes
//!
//! Four persistent indexes thread through every transaction, one per kind
//! of compilation artifact:
//!
//! | kind | key | value |
//! |---|---|---|
//! | [`IndexKind::Fragment`] | [`Digest`] | [`Extent`] of an object-code fragment |
//! | [`IndexKind::Compilation`] | [`Digest`] | [`Extent`] of a compilation record |
//! | [`IndexKind::DebugLine`] | [`Digest`] | [`Extent`] of a debug-line header |
//! | [`IndexKind::Name`] | interned string | nothing (a set) |
//!
//! All four are instances of the same [`HamtMap`]; a kind names the slot
//! its header block occupies in the footer's root table.
//!
//! ## Keys
//!
//! A key type implements [`Key`]: a stable content hash, an encoder for
//! the leaf record, a decoder, and an equality check. The methods take an
//! [`IndexContext`] because interned-string keys may need the database
//! (to read a committed body) or the current transaction's pending-string
//! table (to read a body that has not been flushed yet). Digest keys
//! ignore the context.

pub mod hamt;
pub mod node;

use std::hash::{BuildHasher, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::address::Extent;
use crate::database::Database;
use crate::error::Result;
use crate::indirect_string::{IndirectString, PendingStrings};
use crate::serialize::{DatabaseReader, ReadArchive, WriteArchive};

pub use hamt::{HamtIter, HamtMap};
pub use node::{HeaderBlock, HEADER_BLOCK_SIGNATURE, HEADER_BLOCK_SIZE};

/// The four index kinds, in footer-slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Fragment,
    Compilation,
    DebugLine,
    Name,
}

impl IndexKind {
    pub const COUNT: usize = crate::storage::file::INDEX_ROOT_SLOTS;

    /// The footer root-table slot this kind occupies.
    pub fn slot(self) -> usize {
        match self {
            IndexKind::Fragment => 0,
            IndexKind::Compilation => 1,
            IndexKind::DebugLine => 2,
            IndexKind::Name => 3,
        }
    }
}

/// The default key hasher: xxh3 with the zero seed, so hashes are stable
/// across processes and builds, which an on-disk trie requires.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableHashBuilder;

impl BuildHasher for StableHashBuilder {
    type Hasher = Xxh3;

    fn build_hasher(&self) -> Xxh3 {
        Xxh3::new()
    }
}

/// Context threaded through key operations.
#[derive(Clone, Copy)]
pub struct IndexContext<'a> {
    pub db: &'a Database,
    /// Bodies of strings added but not yet flushed in the open
    /// transaction; `None` outside the interning path.
    pub strings: Option<&'a PendingStrings>,
}

impl<'a> IndexContext<'a> {
    pub fn new(db: &'a Database) -> Self {
        IndexContext { db, strings: None }
    }
}

/// An index key: hashable, codable against the store, and comparable.
pub trait Key: Sized {
    /// A stable 64-bit hash of the key's content. Must agree for keys
    /// that [`Key::matches`], whatever their representation.
    fn stable_hash<S: BuildHasher>(&self, ctx: IndexContext<'_>, build: &S) -> Result<u64>;

    /// Serializes the key into a leaf record.
    fn encode<A: WriteArchive>(&self, archive: &mut A) -> Result<()>;

    /// Reads a key back from a leaf record.
    fn decode(ctx: IndexContext<'_>, reader: &mut DatabaseReader<'_>) -> Result<Self>;

    /// Content equality.
    fn matches(&self, ctx: IndexContext<'_>, other: &Self) -> Result<bool>;
}

/// A 128-bit content digest, the key of the artifact indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    pub high: u64,
    pub low: u64,
}

impl Digest {
    pub const fn new(high: u64, low: u64) -> Digest {
        Digest { high, low }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.low.to_le_bytes());
        bytes[8..].copy_from_slice(&self.high.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Digest {
        Digest {
            low: u64::from_le_bytes(bytes[..8].try_into().expect("16-byte array")),
            high: u64::from_le_bytes(bytes[8..].try_into().expect("16-byte array")),
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

impl Key for Digest {
    fn stable_hash<S: BuildHasher>(&self, _ctx: IndexContext<'_>, build: &S) -> Result<u64> {
        let mut hasher = build.build_hasher();
        hasher.write(&self.to_bytes());
        Ok(hasher.finish())
    }

    fn encode<A: WriteArchive>(&self, archive: &mut A) -> Result<()> {
        archive.put_bytes(&self.to_bytes(), 8)?;
        Ok(())
    }

    fn decode(_ctx: IndexContext<'_>, reader: &mut DatabaseReader<'_>) -> Result<Self> {
        let mut bytes = [0u8; 16];
        reader.get_bytes(&mut bytes, 8)?;
        Ok(Digest::from_bytes(bytes))
    }

    fn matches(&self, _ctx: IndexContext<'_>, other: &Self) -> Result<bool> {
        Ok(self == other)
    }
}

/// digest -> fragment extent.
pub type FragmentIndex = HamtMap<Digest, Extent>;
/// digest -> compilation-record extent.
pub type CompilationIndex = HamtMap<Digest, Extent>;
/// digest -> debug-line-header extent.
pub type DebugLineIndex = HamtMap<Digest, Extent>;
/// Interned-name set; generic over the hasher so tests can force
/// collisions.
pub type NameIndex<S = StableHashBuilder> = HamtMap<IndirectString, (), S>;

impl Database {
    /// Opens the fragment index at this handle's snapshot.
    pub fn fragment_index(&self) -> Result<FragmentIndex> {
        HamtMap::open(self, IndexKind::Fragment)
    }

    /// Opens the compilation index at this handle's snapshot.
    pub fn compilation_index(&self) -> Result<CompilationIndex> {
        HamtMap::open(self, IndexKind::Compilation)
    }

    /// Opens the debug-line index at this handle's snapshot.
    pub fn debug_line_index(&self) -> Result<DebugLineIndex> {
        HamtMap::open(self, IndexKind::DebugLine)
    }

    /// Opens the name index at this handle's snapshot.
    pub fn name_index(&self) -> Result<NameIndex> {
        HamtMap::open(self, IndexKind::Name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_byte_order_is_little_endian_low_first() {
        let digest = Digest::new(0x0102_0304_0506_0708, 0x1112_1314_1516_1718);
        let bytes = digest.to_bytes();
        assert_eq!(bytes[0], 0x18);
        assert_eq!(bytes[8], 0x08);
        assert_eq!(Digest::from_bytes(bytes), digest);
    }

    #[test]
    fn digest_displays_as_hex() {
        let digest = Digest::new(0xDEAD_BEEF_CAFE_BABE, 0x0123_4567_89AB_CDEF);
        assert_eq!(digest.to_string(), "deadbeefcafebabe0123456789abcdef");
    }

    #[test]
    fn kind_slots_are_distinct() {
        let kinds = [
            IndexKind::Fragment,
            IndexKind::Compilation,
            IndexKind::DebugLine,
            IndexKind::Name,
        ];
        for (n, kind) in kinds.iter().enumerate() {
            assert_eq!(kind.slot(), n);
        }
    }
}
