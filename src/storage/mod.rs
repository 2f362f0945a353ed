//! # Segmented Storage
//!
//! This module presents the store file as a flat 64-bit address space while
//! internally splitting it into memory-mapped [`Region`]s. It is the only
//! code that touches raw mapping pointers; everything above it works in
//! terms of [`Address`] values.
//!
//! ## Segments, Regions, and the SAT
//!
//! The address space is divided into fixed 4 MiB *segments*. A *region* is
//! one `mmap` covering a run of whole segments; full regions are 4 GiB and
//! growth regions are whatever multiple of 4 MiB is needed, never crossing
//! a 4 GiB region boundary. The **segment address table** (SAT) maps a
//! segment index to the base pointer of that segment inside its owning
//! region:
//!
//! ```text
//! sat[n] -> (region, base pointer)
//!
//! address lookup:  sat[addr.segment()].base + addr.offset()
//! ```
//!
//! Because growth appends new regions instead of remapping old ones, SAT
//! entries are stable once written: readers use the table without locking.
//!
//! ## Read Views
//!
//! [`Storage::slice`] returns a borrowed view of a range that lies within
//! one region. [`Storage::shared`] returns an owning [`StoreRef`] that
//! keeps the region's mapping alive independently of the storage object;
//! when the requested range spans regions it degrades to an owned shadow
//! copy assembled by [`Storage::copy_from_store`]. Callers that need to
//! know which case they are in ask [`Storage::request_spans_regions`].
//!
//! ## Sealing
//!
//! At commit, [`Storage::protect`] marks everything the finished
//! transaction wrote as read-only, rounding inward to page boundaries and
//! never touching the file header page (the footer tip lives there and is
//! rewritten on every commit).
//!
//! ## Failure
//!
//! A failed `mmap` or `ftruncate` surfaces as `Error::Io`. Regions mapped
//! before the failure are not unwound; callers treat the handle as
//! poisoned, which is safe because every mapped byte remains valid.

pub mod file;
pub mod lock;
pub mod region;

use std::fs::File;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::address::{aligned, Address, SAT_ENTRIES, SEGMENT_SHIFT, SEGMENT_SIZE};
use crate::error::{Error, Result};
use file::{FILE_HEADER_SIZE, FOOTER_POS_OFFSET};
use region::{os_page_size, Region};

/// Size of a fully grown region (also the largest single growth step).
pub const FULL_REGION_SIZE: u64 = 1 << 32;
/// Granularity of file growth; one segment.
pub const MIN_REGION_SIZE: u64 = SEGMENT_SIZE;

const _: () = assert!(FULL_REGION_SIZE % MIN_REGION_SIZE == 0);

/// One entry of the segment address table.
#[derive(Debug)]
struct SatEntry {
    /// Base pointer of this segment inside `region`; null when unmapped.
    base: *mut u8,
    region: Option<Arc<Region>>,
}

impl Default for SatEntry {
    fn default() -> Self {
        SatEntry {
            base: std::ptr::null_mut(),
            region: None,
        }
    }
}

/// The memory-mapped backing of a store file.
#[derive(Debug)]
pub struct Storage {
    file: File,
    writable: bool,
    regions: Vec<Arc<Region>>,
    sat: Box<[SatEntry]>,
    /// Logical extent of the store; reads beyond this fail with
    /// `BadAddress`.
    logical_size: u64,
    page_size: u64,
}

// SAFETY: the SAT holds raw pointers into the regions owned by the same
// struct. Pointers are stable (regions are never remapped) and the aliasing
// discipline described in `region` confines mutation to the single writer.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    /// Maps the existing contents of `file`.
    pub fn open(file: File, writable: bool) -> Result<Storage> {
        let len = file.metadata()?.len();
        let mut storage = Storage {
            file,
            writable,
            regions: Vec::new(),
            sat: (0..SAT_ENTRIES).map(|_| SatEntry::default()).collect(),
            logical_size: 0,
            page_size: os_page_size(),
        };
        if len > 0 {
            storage.map_bytes(len)?;
        }
        Ok(storage)
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    fn physical_size(&self) -> u64 {
        self.regions.last().map_or(0, |r| r.end())
    }

    /// Grows or shrinks the mapping to accommodate `new_logical` bytes.
    ///
    /// Growth extends the file to whole-segment granularity and maps new
    /// regions over the added extent; shrink releases trailing regions
    /// whose base lies at or beyond the new size.
    pub fn map_bytes(&mut self, new_logical: u64) -> Result<()> {
        let capacity = (SAT_ENTRIES as u64) << SEGMENT_SHIFT;
        if new_logical > capacity {
            return Err(Error::BadAddress {
                address: new_logical,
                size: capacity,
            });
        }
        if new_logical <= self.logical_size {
            self.shrink(new_logical);
            return Ok(());
        }

        let physical = aligned(new_logical, MIN_REGION_SIZE);
        let old_physical = self.physical_size();
        if physical > old_physical {
            if self.writable {
                self.file.set_len(physical)?;
            }
            let first_new = self.regions.len();
            let mut offset = old_physical;
            while offset < physical {
                // Stop at the next full-region boundary so that later
                // growth starts a fresh region instead of resizing.
                let boundary = (offset / FULL_REGION_SIZE + 1) * FULL_REGION_SIZE;
                let len = physical.min(boundary) - offset;
                let region = Region::map(&self.file, offset, len, self.writable)?;
                self.regions.push(Arc::new(region));
                offset += len;
            }
            self.update_sat(first_new);
            debug!(
                old = old_physical,
                new = physical,
                regions = self.regions.len(),
                "grew storage"
            );
        }
        self.logical_size = new_logical;
        Ok(())
    }

    /// Fills SAT entries for regions `from_region..`.
    fn update_sat(&mut self, from_region: usize) {
        for region in &self.regions[from_region..] {
            let first_segment = (region.file_offset() >> SEGMENT_SHIFT) as usize;
            let segments = (region.len() >> SEGMENT_SHIFT) as usize;
            for n in 0..segments {
                // SAFETY: n * SEGMENT_SIZE < region.len(), so the pointer
                // stays inside the mapping.
                let base = unsafe { region.base_ptr().add(n << SEGMENT_SHIFT) };
                self.sat[first_segment + n] = SatEntry {
                    base,
                    region: Some(Arc::clone(region)),
                };
            }
        }
    }

    fn shrink(&mut self, new_logical: u64) {
        let before = self.regions.len();
        while matches!(self.regions.last(), Some(r) if r.file_offset() >= new_logical) {
            let region = self.regions.pop().expect("matched above");
            let first_segment = (region.file_offset() >> SEGMENT_SHIFT) as usize;
            let segments = (region.len() >> SEGMENT_SHIFT) as usize;
            for entry in &mut self.sat[first_segment..first_segment + segments] {
                *entry = SatEntry::default();
            }
        }
        if self.regions.len() != before {
            debug!(
                released = before - self.regions.len(),
                new_logical, "shrank storage"
            );
        }
        self.logical_size = new_logical;
    }

    /// Truncates the file to match the mapped extent.
    pub fn truncate_to_physical_size(&mut self) -> Result<()> {
        self.file.set_len(self.physical_size())?;
        Ok(())
    }

    fn check_range(&self, addr: Address, len: u64) -> Result<()> {
        let end = addr.absolute().checked_add(len).ok_or(Error::BadAddress {
            address: addr.absolute(),
            size: self.logical_size,
        })?;
        if end > self.logical_size {
            return Err(Error::BadAddress {
                address: addr.absolute(),
                size: self.logical_size,
            });
        }
        Ok(())
    }

    fn sat_entry(&self, addr: Address) -> Result<&SatEntry> {
        let entry = &self.sat[addr.segment()];
        if entry.region.is_none() {
            return Err(Error::BadAddress {
                address: addr.absolute(),
                size: self.logical_size,
            });
        }
        Ok(entry)
    }

    /// Reports whether `[addr, addr + size)` crosses a region boundary.
    /// Unmapped ranges report as spanning.
    pub fn request_spans_regions(&self, addr: Address, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let last_segment = (addr + (size - 1)).segment();
        if addr.segment() >= SAT_ENTRIES || last_segment >= SAT_ENTRIES {
            return true;
        }
        let first = &self.sat[addr.segment()].region;
        let last = &self.sat[last_segment].region;
        match (first, last) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            _ => true,
        }
    }

    /// Borrowed view of a range that lies within a single region.
    pub fn slice(&self, addr: Address, len: u64) -> Result<&[u8]> {
        self.check_range(addr, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        if self.request_spans_regions(addr, len) {
            // Region mappings are not virtually contiguous; spanning
            // requests must go through shared() or the copy methods.
            return Err(Error::BadAddress {
                address: addr.absolute(),
                size: self.logical_size,
            });
        }
        let entry = self.sat_entry(addr)?;
        // SAFETY: the range was bounds-checked against the logical size and
        // lies within one region, whose segments are mapped contiguously.
        // The returned borrow of `self` prevents concurrent structural
        // mutation of the storage.
        Ok(unsafe {
            std::slice::from_raw_parts(entry.base.add(addr.offset() as usize), len as usize)
        })
    }

    /// Mutable view of a range that lies within a single region.
    pub fn slice_mut(&mut self, addr: Address, len: u64) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(Error::ReadOnlyViolation {
                address: addr.absolute(),
            });
        }
        self.check_range(addr, len)?;
        if len > 0 && self.request_spans_regions(addr, len) {
            return Err(Error::BadAddress {
                address: addr.absolute(),
                size: self.logical_size,
            });
        }
        let entry = self.sat_entry(addr)?;
        // SAFETY: as in `slice`, plus exclusivity: `&mut self` guarantees
        // no other view of this storage object exists in this process.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(entry.base.add(addr.offset() as usize), len as usize)
        })
    }

    /// Owning view of `[addr, addr + len)`. Shares ownership of the
    /// backing region; spanning requests return an owned copy instead.
    pub fn shared(&self, addr: Address, len: u64) -> Result<StoreRef> {
        self.check_range(addr, len)?;
        if len == 0 {
            return Ok(StoreRef {
                backing: Backing::Owned(Box::default()),
            });
        }
        if self.request_spans_regions(addr, len) {
            let mut buf = vec![0u8; len as usize];
            self.copy_from_store(addr, &mut buf)?;
            return Ok(StoreRef {
                backing: Backing::Owned(buf.into_boxed_slice()),
            });
        }
        let entry = self.sat_entry(addr)?;
        // SAFETY: bounds-checked, single region; the Arc clone keeps the
        // mapping alive for as long as the StoreRef exists.
        let ptr = unsafe { entry.base.add(addr.offset() as usize) as *const u8 };
        Ok(StoreRef {
            backing: Backing::Mapped {
                _region: Arc::clone(entry.region.as_ref().expect("checked by sat_entry")),
                ptr,
                len: len as usize,
            },
        })
    }

    /// Copies `out.len()` bytes out of the store, chunking per segment so
    /// that region-spanning ranges work.
    pub fn copy_from_store(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        self.check_range(addr, out.len() as u64)?;
        let mut cursor = addr;
        let mut done = 0usize;
        while done < out.len() {
            let in_segment = (SEGMENT_SIZE - cursor.offset()) as usize;
            let chunk = in_segment.min(out.len() - done);
            let entry = self.sat_entry(cursor)?;
            // SAFETY: chunk stays within the current segment and the whole
            // range was bounds-checked.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    entry.base.add(cursor.offset() as usize),
                    out[done..].as_mut_ptr(),
                    chunk,
                );
            }
            cursor += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into the store, chunking per segment.
    pub fn copy_to_store(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnlyViolation {
                address: addr.absolute(),
            });
        }
        self.check_range(addr, bytes.len() as u64)?;
        let mut cursor = addr;
        let mut done = 0usize;
        while done < bytes.len() {
            let in_segment = (SEGMENT_SIZE - cursor.offset()) as usize;
            let chunk = in_segment.min(bytes.len() - done);
            let entry = self.sat_entry(cursor)?;
            // SAFETY: as in copy_from_store, plus write exclusivity via
            // `&mut self`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[done..].as_ptr(),
                    entry.base.add(cursor.offset() as usize),
                    chunk,
                );
            }
            cursor += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    /// Marks `[first, last)` read-only, rounding `first` up and `last`
    /// down to page boundaries and skipping the file header.
    pub fn protect(&self, first: u64, last: u64) -> Result<()> {
        let first = aligned(first.max(FILE_HEADER_SIZE as u64), self.page_size);
        let last = last & !(self.page_size - 1);
        for region in &self.regions {
            let lo = first.max(region.file_offset());
            let hi = last.min(region.end());
            if lo < hi {
                region.protect_read_only(lo - region.file_offset(), hi - lo)?;
            }
        }
        Ok(())
    }

    /// Synchronously flushes `[first, last)` to the file.
    pub fn flush_range(&self, first: u64, last: u64) -> Result<()> {
        for region in &self.regions {
            let lo = first.max(region.file_offset());
            let hi = last.min(region.end());
            if lo < hi {
                region.flush_range(lo - region.file_offset(), hi - lo)?;
            }
        }
        Ok(())
    }

    /// Release-stores the footer tip into the mapped file header.
    pub fn publish_footer_pos(&self, addr: Address) -> Result<()> {
        let entry = self.sat_entry(Address::NULL)?;
        // SAFETY: FOOTER_POS_OFFSET is an 8-aligned offset inside the
        // header, which lies in segment 0; an aligned AtomicU64 view of
        // mapped memory is valid, and the release ordering pairs with the
        // acquire in `load_footer_pos`.
        let tip = unsafe { &*(entry.base.add(FOOTER_POS_OFFSET) as *const AtomicU64) };
        tip.store(addr.absolute().to_le(), Ordering::Release);
        Ok(())
    }

    /// Acquire-loads the footer tip from the mapped file header.
    pub fn load_footer_pos(&self) -> Result<Address> {
        let entry = self.sat_entry(Address::NULL)?;
        // SAFETY: as in publish_footer_pos.
        let tip = unsafe { &*(entry.base.add(FOOTER_POS_OFFSET) as *const AtomicU64) };
        Ok(Address::new(u64::from_le(tip.load(Ordering::Acquire))))
    }
}

#[derive(Debug)]
enum Backing {
    Mapped {
        _region: Arc<Region>,
        ptr: *const u8,
        len: usize,
    },
    Owned(Box<[u8]>),
}

/// An owning read view of store bytes.
///
/// Keeps the underlying region mapped for as long as the value lives, so
/// it remains valid across storage shrink and even database close.
#[derive(Debug)]
pub struct StoreRef {
    backing: Backing,
}

// SAFETY: the mapped variant points at sealed store bytes (or at the
// unsealed tail, which is only handed to the owning writer); the owned
// variant is plain memory.
unsafe impl Send for StoreRef {}
unsafe impl Sync for StoreRef {}

impl Deref for StoreRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: ptr/len were validated against the region when the
            // view was created and the region is kept alive by the Arc.
            Backing::Mapped { ptr, len, .. } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Backing::Owned(buf) => buf,
        }
    }
}
