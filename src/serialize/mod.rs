//! # Serialization
//!
//! Values move between memory and the store through *archives*. A writer
//! archive accepts byte runs ([`WriteArchive::put_bytes`]) and a reader
//! archive produces them ([`ReadArchive::get_bytes`]); everything
//! type-shaped is layered on top through the [`Serialize`] and
//! [`Deserialize`] traits, so a new archive backing automatically supports
//! every serializable type and a new type works with every archive.
//!
//! Concrete archives:
//!
//! - [`VecWriter`] / [`BufferWriter`] / [`NullWriter`] for in-memory
//!   encoding, bounded encoding, and size measurement;
//! - [`DatabaseWriter`] appending through a transaction (each write result
//!   is the allocated store address);
//! - [`SliceReader`] (bounded), [`IterReader`] (any byte iterator), and
//!   [`DatabaseReader`] (store-backed).
//!
//! The wire format is little-endian. Multi-byte scalars are written at
//! their natural alignment with zero padding that readers skip
//! symmetrically. Strings are a varint length (padded to at least two
//! bytes) followed by the raw bytes; sequences are a u64 count followed by
//! their elements; pairs are first-then-second.

pub mod archive;
pub mod types;
pub mod varint;

pub use archive::{
    BufferWriter, DatabaseReader, DatabaseWriter, IterReader, NullWriter, ReadArchive,
    SliceReader, VecWriter, WriteArchive,
};
pub use types::{read_string, write_str};

use crate::error::Result;

/// A value that can be written to any archive.
pub trait Serialize {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output>;
}

/// A value that can be read back from any archive.
pub trait Deserialize: Sized {
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self>;
}

/// Writes one value, returning the archive's result for it.
#[inline]
pub fn write<A: WriteArchive, T: Serialize + ?Sized>(
    archive: &mut A,
    value: &T,
) -> Result<A::Output> {
    value.serialize(archive)
}

/// Writes a contiguous run of values, returning the result of the first
/// (or `None` for an empty run).
pub fn write_slice<A: WriteArchive, T: Serialize>(
    archive: &mut A,
    values: &[T],
) -> Result<Option<A::Output>> {
    let mut first = None;
    for value in values {
        let out = value.serialize(archive)?;
        if first.is_none() {
            first = Some(out);
        }
    }
    Ok(first)
}

/// Reads one value.
#[inline]
pub fn read<T: Deserialize, A: ReadArchive>(archive: &mut A) -> Result<T> {
    T::deserialize(archive)
}
