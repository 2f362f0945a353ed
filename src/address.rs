//! # Store Addresses
//!
//! Every byte in the store is named by a 64-bit [`Address`] that splits into
//! a *segment* index (high bits) and an *offset* within that segment (low
//! bits). Segments are 4 MiB, which keeps the segment address table small
//! (2^14 entries covering a 64 GiB store) while still letting a single
//! memory-mapped region serve many segments.
//!
//! ```text
//! bit      63 .. 22                21 .. 0
//!         +------------------------+-----------------+
//!         | segment index          | offset (4 MiB)  |
//!         +------------------------+-----------------+
//! ```
//!
//! Address zero is the null sentinel: the file header occupies the first
//! bytes of the store, so no allocation can ever land there.
//!
//! [`TypedAddress<T>`] tags an address with its pointee type so that, for
//! example, the address of an index header block cannot be confused with
//! the address of a string body. [`Extent`] pairs an address with a byte
//! length to name a range.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign};

/// log2 of the segment size.
pub const SEGMENT_SHIFT: u32 = 22;
/// Size of one segment in bytes (4 MiB).
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;
/// Number of entries in the segment address table (64 GiB address space).
pub const SAT_ENTRIES: usize = 1 << 14;

/// A location within the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The null sentinel.
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(absolute: u64) -> Self {
        Address(absolute)
    }

    /// Builds an address from a segment index and an in-segment offset.
    /// Offset overflow carries into the segment field.
    #[inline]
    pub const fn from_parts(segment: u64, offset: u64) -> Self {
        Address((segment << SEGMENT_SHIFT).wrapping_add(offset))
    }

    #[inline]
    pub const fn absolute(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn segment(self) -> usize {
        (self.0 >> SEGMENT_SHIFT) as usize
    }

    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & (SEGMENT_SIZE - 1)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Bytes to add so that the address satisfies power-of-two `align`.
    #[inline]
    pub const fn alignment_to(self, align: u64) -> u64 {
        calc_alignment(self.0, align)
    }

    /// The address rounded up to power-of-two `align`.
    #[inline]
    pub const fn aligned_to(self, align: u64) -> Address {
        Address(aligned(self.0, align))
    }
}

impl Add<u64> for Address {
    type Output = Address;

    #[inline]
    fn add(self, rhs: u64) -> Address {
        Address(self.0 + rhs)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Bytes to add to `v` so that it satisfies power-of-two `align`.
#[inline]
pub const fn calc_alignment(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    align.wrapping_sub(v) & (align - 1)
}

/// `v` rounded up to the next multiple of power-of-two `align`.
#[inline]
pub const fn aligned(v: u64, align: u64) -> u64 {
    v + calc_alignment(v, align)
}

/// An address tagged with the type of the value it refers to.
///
/// The tag is purely a compile-time device (`PhantomData`); the on-disk
/// representation is the bare 64-bit address.
pub struct TypedAddress<T> {
    addr: Address,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedAddress<T> {
    pub const NULL: TypedAddress<T> = TypedAddress {
        addr: Address::NULL,
        _marker: PhantomData,
    };

    #[inline]
    pub const fn new(addr: Address) -> Self {
        TypedAddress {
            addr,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn to_address(self) -> Address {
        self.addr
    }

    #[inline]
    pub const fn absolute(self) -> u64 {
        self.addr.absolute()
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.addr.is_null()
    }
}

// Manual impls: derives would demand the bounds on T.
impl<T> Clone for TypedAddress<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TypedAddress<T> {}
impl<T> PartialEq for TypedAddress<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for TypedAddress<T> {}
impl<T> fmt::Debug for TypedAddress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.addr, f)
    }
}

/// A contiguous byte range of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub addr: Address,
    pub size: u64,
}

impl Extent {
    #[inline]
    pub const fn new(addr: Address, size: u64) -> Self {
        Extent { addr, size }
    }

    #[inline]
    pub const fn end(self) -> u64 {
        self.addr.absolute() + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_and_offset_split() {
        let addr = Address::from_parts(3, 0x1234);
        assert_eq!(addr.segment(), 3);
        assert_eq!(addr.offset(), 0x1234);
        assert_eq!(addr.absolute(), 3 * SEGMENT_SIZE + 0x1234);
    }

    #[test]
    fn offset_overflow_carries_into_segment() {
        let addr = Address::from_parts(0, SEGMENT_SIZE - 1) + 2;
        assert_eq!(addr.segment(), 1);
        assert_eq!(addr.offset(), 1);
    }

    #[test]
    fn null_is_address_zero() {
        assert!(Address::NULL.is_null());
        assert!(!Address::new(1).is_null());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(calc_alignment(0, 8), 0);
        assert_eq!(calc_alignment(1, 8), 7);
        assert_eq!(calc_alignment(8, 8), 0);
        assert_eq!(calc_alignment(9, 2), 1);
        assert_eq!(aligned(13, 4), 16);
        assert_eq!(Address::new(10).alignment_to(8), 6);
        assert_eq!(Address::new(10).aligned_to(8), Address::new(16));
    }

    #[test]
    fn addresses_are_ordered() {
        assert!(Address::new(1) < Address::new(2));
        let mut a = Address::new(16);
        a += 16;
        assert_eq!(a, Address::new(32));
    }

    #[test]
    fn typed_addresses_compare_by_address() {
        struct Marker;
        let a = TypedAddress::<Marker>::new(Address::new(64));
        let b = TypedAddress::<Marker>::new(Address::new(64));
        assert_eq!(a, b);
        assert!(!a.is_null());
        assert!(TypedAddress::<Marker>::NULL.is_null());
    }

    #[test]
    fn extent_end() {
        let e = Extent::new(Address::new(0x40), 0x10);
        assert_eq!(e.end(), 0x50);
    }
}
