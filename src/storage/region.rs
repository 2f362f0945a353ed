//! # Memory-Mapped Regions
//!
//! A [`Region`] is one `mmap` of a span of the store file. The file is
//! covered by a sequence of non-overlapping regions ordered by file offset;
//! growth appends new regions rather than remapping existing ones, so a
//! region's base pointer is stable for its entire lifetime. Regions are
//! handed out behind `Arc`: a read view taken from a region keeps the
//! mapping alive even after the storage layer has dropped it (shrink,
//! close).
//!
//! ## Safety Model
//!
//! The mapping is held as a raw `memmap2::MmapRaw` because the same pages
//! are read through shared views while the writer appends to the unsealed
//! tail. Rust's aliasing rules are upheld by the storage discipline rather
//! than the borrow checker:
//!
//! 1. Bytes below a transaction's start watermark are sealed: committed
//!    data is never written again (and is `mprotect`ed read-only besides).
//! 2. Bytes above the watermark are reachable only through the single open
//!    transaction, which is exclusive per database handle.
//! 3. A region's base pointer never moves; growth creates new regions.

use std::fs::File;
use std::io;

use memmap2::{MmapOptions, MmapRaw};

/// One contiguous mapping of the file.
#[derive(Debug)]
pub struct Region {
    raw: MmapRaw,
    file_offset: u64,
}

impl Region {
    /// Maps `len` bytes of `file` starting at `file_offset`. The caller
    /// must have extended the file to at least `file_offset + len`.
    pub fn map(file: &File, file_offset: u64, len: u64, writable: bool) -> io::Result<Region> {
        let mut options = MmapOptions::new();
        options.offset(file_offset).len(len as usize);
        let raw = if writable {
            options.map_raw(file)?
        } else {
            options.map_raw_read_only(file)?
        };
        Ok(Region { raw, file_offset })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.raw.len() as u64
    }

    /// File offset of the first byte covered by this region.
    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// File offset one past the last byte covered by this region.
    #[inline]
    pub fn end(&self) -> u64 {
        self.file_offset + self.len()
    }

    /// Base pointer of the mapping. Valid for the lifetime of the region;
    /// see the module-level safety model for the aliasing rules.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    /// Synchronously flushes `[offset, offset + len)` of this region to
    /// the file.
    pub fn flush_range(&self, offset: u64, len: u64) -> io::Result<()> {
        debug_assert!(offset + len <= self.len());
        self.raw.flush_range(offset as usize, len as usize)
    }

    /// Marks `[offset, offset + len)` read-only. Both bounds must be
    /// multiples of the OS page size.
    pub fn protect_read_only(&self, offset: u64, len: u64) -> io::Result<()> {
        debug_assert!(offset + len <= self.len());
        debug_assert_eq!(offset % os_page_size(), 0);
        if len == 0 {
            return Ok(());
        }
        #[cfg(unix)]
        {
            // SAFETY: the range lies within this mapping (checked above)
            // and is page-aligned. Revoking write access cannot create
            // undefined behavior on its own; writes through stale pointers
            // would fault, and the storage discipline forbids them anyway.
            let rc = unsafe {
                libc::mprotect(
                    self.base_ptr().add(offset as usize) as *mut libc::c_void,
                    len as usize,
                    libc::PROT_READ,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// The system page size, used to round protection ranges.
pub fn os_page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as u64;
        }
    }
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_and_exposes_file_contents() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 8192]).unwrap();
        let file = tmp.reopen().unwrap();

        let region = Region::map(&file, 0, 8192, true).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.file_offset(), 0);
        assert_eq!(region.end(), 8192);

        // SAFETY: the mapping is live and private to this test.
        unsafe {
            *region.base_ptr() = 0xAB;
        }
        region.flush_range(0, 8192).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { *region.base_ptr() }, 0xAB);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(os_page_size().is_power_of_two());
    }
}
