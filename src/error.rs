//! # Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. The error kinds
//! mirror the failure surface of the storage engine:
//!
//! - `Io`: an underlying OS failure (open, map, lock, truncate, sync). The
//!   original errno travels inside the wrapped `std::io::Error`.
//! - `BadAddress`: an address outside the mapped extent of the file.
//! - `ReadOnlyViolation`: an attempt to mutate bytes sealed by an earlier
//!   commit (or any byte of a read-only handle).
//! - `CorruptIndex`: a signature, bitmap, or size check failed while loading
//!   an on-disk structure.
//! - `VersionMismatch`: the file or footer was written by an unknown format
//!   version. Readers refuse to open rather than guess.
//! - `NoBufferSpace`: a bounded reader was asked to read past its input.
//! - `AlreadyOpen`: a second writer transaction was requested while one is
//!   in flight.
//!
//! Leaf I/O calls convert OS errors immediately; the allocation, index, and
//! serialization layers propagate unchanged with `?`. The only layer that
//! recovers locally is the non-blocking range-lock probe, which maps
//! `EAGAIN`/`EACCES` to a clean "not acquired" return instead of an error.

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// File I/O error from the operating system.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An address lies outside the mapped extent of the file.
    #[error("address {address:#x} is outside the store (size {size:#x})")]
    BadAddress { address: u64, size: u64 },

    /// An attempt was made to modify bytes sealed by a committed transaction.
    #[error("attempt to modify read-only bytes at {address:#x}")]
    ReadOnlyViolation { address: u64 },

    /// An on-disk index structure failed a signature, bitmap, or size check.
    #[error("index structure is corrupt: {detail}")]
    CorruptIndex { detail: String },

    /// The file or footer format version is not understood by this build.
    #[error("unsupported format version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    /// A bounded reader was asked to consume more bytes than it holds.
    #[error("read past the end of the input buffer")]
    NoBufferSpace,

    /// A writer transaction is already open on this database handle.
    #[error("a writer transaction is already open on '{path}'")]
    AlreadyOpen { path: PathBuf },
}

impl Error {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Error::CorruptIndex {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_carry_the_os_errno() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        match err {
            Error::Io(inner) => assert_eq!(inner.raw_os_error(), Some(libc::EACCES)),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn display_includes_the_offending_address() {
        let err = Error::BadAddress {
            address: 0x1000,
            size: 0x800,
        };
        assert!(err.to_string().contains("0x1000"));
    }
}
