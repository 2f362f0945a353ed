//! # On-Disk File Records
//!
//! Two fixed-layout records govern the file format:
//!
//! - the **file header**, written once at offset zero. It carries the
//!   magic, the format version, the page size the file was created with,
//!   and `footer_pos`, the atomic tip of the footer chain. `footer_pos`
//!   is the only header field ever rewritten.
//! - the **transaction footer**, appended at the end of every committed
//!   transaction. Footers form a singly linked list back to the genesis
//!   footer written at creation; each carries the generation number, a
//!   timestamp, the per-index table of header-block addresses, and a
//!   CRC-64/ECMA-182 checksum of the preceding footer bytes.
//!
//! ```text
//! +--------+===========+--------+===========+--------+
//! | header | txn 1 data| footer | txn 2 data| footer |<- footer_pos
//! +--------+===========+--------+===========+--------+
//!                         ^--------- prev ------|
//! ```
//!
//! Readers snapshot `footer_pos` at open: everything at or below the
//! referenced footer is sealed and immutable, so a snapshot is a
//! consistent view no matter what a concurrent writer appends.
//!
//! The footer layout is the cross-version compatibility boundary. A footer
//! (or header) whose version is unknown fails with `VersionMismatch`
//! rather than being guessed at.
//!
//! All multi-byte fields are little-endian via zerocopy wrapper types.

use crc::{Crc, CRC_64_ECMA_182};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::zerocopy_getters;

pub const FILE_MAGIC: &[u8; 16] = b"pstore archive\x00\x00";
pub const FOOTER_SIGNATURE: &[u8; 8] = b"pFooter\x00";

pub const FORMAT_VERSION: u32 = 1;

pub const FILE_HEADER_SIZE: usize = 64;
pub const FOOTER_SIZE: usize = 80;

/// Number of index-root slots carried by each footer.
pub const INDEX_ROOT_SLOTS: usize = 4;

/// Byte offset of `FileHeader::footer_pos`; the tip is rewritten in place
/// through this offset with a release store.
pub const FOOTER_POS_OFFSET: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    footer_pos: U64,
    reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(FileHeader, footer_pos) == FOOTER_POS_OFFSET);

impl FileHeader {
    pub fn new(page_size: u32, footer_pos: Address) -> Self {
        FileHeader {
            magic: *FILE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(page_size),
            footer_pos: U64::new(footer_pos.absolute()),
            reserved: [0u8; 32],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::corrupt("file too small for a header"));
        }
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|_| Error::corrupt("unreadable file header"))?;
        if &header.magic != FILE_MAGIC {
            return Err(Error::corrupt("bad magic: not a pstore file"));
        }
        if header.version.get() != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                found: header.version.get(),
                expected: FORMAT_VERSION,
            });
        }
        Ok(header)
    }

    zerocopy_getters! {
        version: u32,
        page_size: u32,
    }

    pub fn footer_pos(&self) -> Address {
        Address::new(self.footer_pos.get())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Footer {
    signature: [u8; 8],
    version: U32,
    _pad: [u8; 4],
    generation: U64,
    prev: U64,
    timestamp_ms: U64,
    index_roots: [U64; INDEX_ROOT_SLOTS],
    crc: U64,
}

const _: () = assert!(std::mem::size_of::<Footer>() == FOOTER_SIZE);

impl Footer {
    pub fn new(
        generation: u64,
        prev: Address,
        timestamp_ms: u64,
        index_roots: [Address; INDEX_ROOT_SLOTS],
    ) -> Self {
        let mut roots = [U64::new(0); INDEX_ROOT_SLOTS];
        for (slot, addr) in roots.iter_mut().zip(index_roots) {
            *slot = U64::new(addr.absolute());
        }
        let mut footer = Footer {
            signature: *FOOTER_SIGNATURE,
            version: U32::new(FORMAT_VERSION),
            _pad: [0u8; 4],
            generation: U64::new(generation),
            prev: U64::new(prev.absolute()),
            timestamp_ms: U64::new(timestamp_ms),
            index_roots: roots,
            crc: U64::new(0),
        };
        footer.crc = U64::new(footer.compute_crc());
        footer
    }

    /// The genesis footer written when a store is created.
    pub fn genesis(timestamp_ms: u64) -> Self {
        Footer::new(0, Address::NULL, timestamp_ms, [Address::NULL; INDEX_ROOT_SLOTS])
    }

    fn compute_crc(&self) -> u64 {
        let bytes = self.as_bytes();
        let mut digest = CRC64.digest();
        digest.update(&bytes[..FOOTER_SIZE - 8]);
        digest.finalize()
    }

    /// Parses and validates a footer image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Footer> {
        if bytes.len() < FOOTER_SIZE {
            return Err(Error::corrupt("truncated transaction footer"));
        }
        let footer = Footer::read_from_bytes(&bytes[..FOOTER_SIZE])
            .map_err(|_| Error::corrupt("unreadable transaction footer"))?;
        if &footer.signature != FOOTER_SIGNATURE {
            return Err(Error::corrupt("bad footer signature"));
        }
        if footer.version.get() != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                found: footer.version.get(),
                expected: FORMAT_VERSION,
            });
        }
        if footer.compute_crc() != footer.crc.get() {
            return Err(Error::corrupt("footer checksum mismatch"));
        }
        Ok(footer)
    }

    zerocopy_getters! {
        generation: u64,
        timestamp_ms: u64,
        crc: u64,
    }

    pub fn prev(&self) -> Address {
        Address::new(self.prev.get())
    }

    pub fn index_root(&self, slot: usize) -> Address {
        Address::new(self.index_roots[slot].get())
    }

    pub fn index_roots(&self) -> [Address; INDEX_ROOT_SLOTS] {
        let mut roots = [Address::NULL; INDEX_ROOT_SLOTS];
        for (out, slot) in roots.iter_mut().zip(&self.index_roots) {
            *out = Address::new(slot.get());
        }
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_64() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 64);
    }

    #[test]
    fn footer_size_is_80() {
        assert_eq!(std::mem::size_of::<Footer>(), 80);
    }

    #[test]
    fn header_roundtrip() {
        let header = FileHeader::new(4096, Address::new(64));
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.version(), FORMAT_VERSION);
        assert_eq!(parsed.page_size(), 4096);
        assert_eq!(parsed.footer_pos(), Address::new(64));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[..16].copy_from_slice(b"not a database!!");
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut header = FileHeader::new(4096, Address::new(64));
        header.version = U32::new(FORMAT_VERSION + 1);
        let err = FileHeader::from_bytes(header.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { found, .. } if found == FORMAT_VERSION + 1));
    }

    #[test]
    fn footer_roundtrip_with_roots() {
        let roots = [
            Address::new(0x100),
            Address::NULL,
            Address::new(0x300),
            Address::NULL,
        ];
        let footer = Footer::new(7, Address::new(64), 123_456, roots);
        let parsed = Footer::from_bytes(footer.as_bytes()).unwrap();
        assert_eq!(parsed.generation(), 7);
        assert_eq!(parsed.prev(), Address::new(64));
        assert_eq!(parsed.timestamp_ms(), 123_456);
        assert_eq!(parsed.index_roots(), roots);
    }

    #[test]
    fn footer_detects_corruption() {
        let footer = Footer::genesis(1);
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes.copy_from_slice(footer.as_bytes());
        bytes[20] ^= 0xFF;
        let err = Footer::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }

    #[test]
    fn genesis_footer_has_no_predecessor() {
        let footer = Footer::genesis(0);
        assert_eq!(footer.generation(), 0);
        assert!(footer.prev().is_null());
        assert!(footer.index_roots().iter().all(|r| r.is_null()));
    }
}
