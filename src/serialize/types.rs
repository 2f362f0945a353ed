//! # Per-Type Codecs
//!
//! [`Serialize`]/[`Deserialize`] implementations for the scalar and
//! container types the store works with. Compound serializers return the
//! archive result of their *first* write, which for the database writer is
//! the address of the whole record.

use crate::address::{Address, Extent, TypedAddress};
use crate::error::{Error, Result};
use crate::serialize::varint;
use crate::serialize::{Deserialize, ReadArchive, Serialize, WriteArchive};

macro_rules! scalar_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Serialize for $ty {
                #[inline]
                fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
                    archive.put_bytes(&self.to_le_bytes(), std::mem::align_of::<$ty>())
                }
            }

            impl Deserialize for $ty {
                #[inline]
                fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    archive.get_bytes(&mut raw, std::mem::align_of::<$ty>())?;
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

scalar_codec!(u8, u16, u32, u64, i64);

impl Serialize for () {
    #[inline]
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        archive.put_bytes(&[], 1)
    }
}

impl Deserialize for () {
    #[inline]
    fn deserialize<A: ReadArchive>(_archive: &mut A) -> Result<Self> {
        Ok(())
    }
}

impl Serialize for Address {
    #[inline]
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        self.absolute().serialize(archive)
    }
}

impl Deserialize for Address {
    #[inline]
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        Ok(Address::new(u64::deserialize(archive)?))
    }
}

impl<T> Serialize for TypedAddress<T> {
    #[inline]
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        self.to_address().serialize(archive)
    }
}

impl<T> Deserialize for TypedAddress<T> {
    #[inline]
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        Ok(TypedAddress::new(Address::deserialize(archive)?))
    }
}

impl Serialize for Extent {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        let out = self.addr.serialize(archive)?;
        self.size.serialize(archive)?;
        Ok(out)
    }
}

impl Deserialize for Extent {
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        let addr = Address::deserialize(archive)?;
        let size = u64::deserialize(archive)?;
        Ok(Extent::new(addr, size))
    }
}

impl<T: Serialize, U: Serialize> Serialize for (T, U) {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        let out = self.0.serialize(archive)?;
        self.1.serialize(archive)?;
        Ok(out)
    }
}

impl<T: Deserialize, U: Deserialize> Deserialize for (T, U) {
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        let first = T::deserialize(archive)?;
        let second = U::deserialize(archive)?;
        Ok((first, second))
    }
}

/// Writes a string: varint length padded to at least two bytes, then the
/// raw bytes. The two-byte minimum lets a reader fetch two bytes
/// unconditionally and still hold the complete length for short strings;
/// the prefix is 2-aligned so the returned result names a valid body
/// address for the interned-string index.
pub fn write_str<A: WriteArchive>(archive: &mut A, s: &str) -> Result<A::Output> {
    let mut prefix = [0u8; varint::MAX_VARINT_LENGTH];
    let mut n = varint::encode(s.len() as u64, &mut prefix);
    if n == 1 {
        prefix[1] = 0;
        n = 2;
    }
    let out = archive.put_bytes(&prefix[..n], 2)?;
    archive.put_bytes(s.as_bytes(), 1)?;
    Ok(out)
}

/// Reads a string written by [`write_str`].
pub fn read_string<A: ReadArchive>(archive: &mut A) -> Result<String> {
    let mut head = [0u8; 2];
    archive.get_bytes(&mut head, 2)?;
    let width = varint::decode_size(head[0]);
    let length = if width <= 2 {
        varint::decode(&head[..width])
            .ok_or(Error::NoBufferSpace)?
            .0
    } else {
        let mut raw = [0u8; varint::MAX_VARINT_LENGTH];
        raw[..2].copy_from_slice(&head);
        archive.get_bytes(&mut raw[2..width], 1)?;
        varint::decode(&raw[..width])
            .ok_or(Error::NoBufferSpace)?
            .0
    };
    let mut bytes = vec![0u8; length as usize];
    archive.get_bytes(&mut bytes, 1)?;
    String::from_utf8(bytes).map_err(|_| Error::corrupt("string body is not valid UTF-8"))
}

/// The number of bytes [`write_str`] emits for `s`.
pub fn str_encoded_size(s: &str) -> u64 {
    varint::encoded_size(s.len() as u64).max(2) as u64 + s.len() as u64
}

impl Serialize for str {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        write_str(archive, self)
    }
}

impl Serialize for String {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        write_str(archive, self)
    }
}

impl Deserialize for String {
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        read_string(archive)
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize<A: WriteArchive>(&self, archive: &mut A) -> Result<A::Output> {
        let out = (self.len() as u64).serialize(archive)?;
        for item in self {
            item.serialize(archive)?;
        }
        Ok(out)
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize<A: ReadArchive>(archive: &mut A) -> Result<Self> {
        let count = u64::deserialize(archive)?;
        let mut items = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            items.push(T::deserialize(archive)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{read, write, SliceReader, VecWriter};

    fn roundtrip<T: Serialize + Deserialize + PartialEq + std::fmt::Debug>(value: T) {
        let mut w = VecWriter::new();
        write(&mut w, &value).unwrap();
        let mut r = SliceReader::new(w.as_slice());
        let back: T = read(&mut r).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(0u8);
        roundtrip(0xABu8);
        roundtrip(0xAB_CDu16);
        roundtrip(0xDEAD_BEEFu32);
        roundtrip(u64::MAX);
        roundtrip(-42i64);
    }

    #[test]
    fn scalars_after_a_byte_are_aligned() {
        let mut w = VecWriter::new();
        write(&mut w, &1u8).unwrap();
        write(&mut w, &2u64).unwrap();
        // 1 payload byte, 7 padding, 8 value bytes.
        assert_eq!(w.bytes_produced(), 16);
        let mut r = SliceReader::new(w.as_slice());
        assert_eq!(read::<u8, _>(&mut r).unwrap(), 1);
        assert_eq!(read::<u64, _>(&mut r).unwrap(), 2);
    }

    #[test]
    fn pair_writes_first_then_second() {
        roundtrip((7u32, 9u64));
    }

    #[test]
    fn extent_roundtrip() {
        roundtrip(Extent::new(crate::address::Address::new(0x40), 16));
    }

    #[test]
    fn short_string_prefix_occupies_two_bytes() {
        let mut w = VecWriter::new();
        write_str(&mut w, "hi").unwrap();
        // 1-byte varint + 1 pad byte + 2 content bytes.
        assert_eq!(w.as_slice().len(), 4);
        assert_eq!(w.as_slice()[1], 0);
        assert_eq!(&w.as_slice()[2..], b"hi");
        assert_eq!(str_encoded_size("hi"), 4);
    }

    #[test]
    fn long_string_roundtrip() {
        let s = "x".repeat(300);
        let mut w = VecWriter::new();
        write_str(&mut w, &s).unwrap();
        assert_eq!(w.as_slice().len() as u64, str_encoded_size(&s));
        let mut r = SliceReader::new(w.as_slice());
        assert_eq!(read_string(&mut r).unwrap(), s);
    }

    #[test]
    fn equal_strings_encode_identically() {
        let mut a = VecWriter::new();
        let mut b = VecWriter::new();
        write_str(&mut a, "interned").unwrap();
        write_str(&mut b, "interned").unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn string_roundtrip_via_trait() {
        roundtrip(String::from("hello, store"));
        roundtrip(String::new());
    }

    #[test]
    fn truncated_string_fails_cleanly() {
        let mut w = VecWriter::new();
        write_str(&mut w, "truncate me").unwrap();
        let bytes = &w.as_slice()[..4];
        let mut r = SliceReader::new(bytes);
        assert!(matches!(read_string(&mut r), Err(Error::NoBufferSpace)));
    }

    #[test]
    fn vec_roundtrip() {
        roundtrip(vec![1u64, 2, 3]);
        roundtrip(Vec::<u64>::new());
    }

    #[test]
    fn write_slice_reports_the_first_result() {
        let mut w = VecWriter::new();
        let first = crate::serialize::write_slice(&mut w, &[10u64, 20, 30])
            .unwrap()
            .unwrap();
        assert_eq!(first, 0);
        assert!(crate::serialize::write_slice::<_, u64>(&mut w, &[])
            .unwrap()
            .is_none());

        let mut r = SliceReader::new(w.as_slice());
        for expected in [10u64, 20, 30] {
            assert_eq!(read::<u64, _>(&mut r).unwrap(), expected);
        }
    }

    #[test]
    fn iter_reader_decodes_the_same_bytes() {
        let mut w = VecWriter::new();
        write(&mut w, &0x1234_5678u32).unwrap();
        let mut r = crate::serialize::IterReader::new(w.as_slice().iter().copied());
        assert_eq!(read::<u32, _>(&mut r).unwrap(), 0x1234_5678);
    }
}
