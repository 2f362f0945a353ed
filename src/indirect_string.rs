//! # Interned Strings
//!
//! Names are interned: equal contents get equal addresses. The name index
//! needs a stable address for a string *before* its body is written (the
//! key comparator must work during the same transaction that adds it), so
//! insertion is two-phase, run by [`IndirectStringAdder`]:
//!
//! 1. **Add.** `add` inserts an [`IndirectString`] for the caller's text.
//!    If the index decides the string is new, the leaf record written to
//!    the store is an 8-byte slot holding a *tagged placeholder* (low bit
//!    set, remaining bits an id into the adder's pending table), and the
//!    adder remembers `(text, slot address)`.
//! 2. **Flush.** `flush` writes each pending body (varint length plus
//!    bytes, 2-aligned) and patches its slot with the body's address.
//!    Bodies are 2-aligned, so a patched slot has its low bit clear and
//!    the two states never collide.
//!
//! After flush every slot holds a plain body address; the placeholder form
//! never survives a commit.
//!
//! ## Equality
//!
//! Two in-store strings are equal exactly when their body addresses are
//! equal. That is the intern invariant, and it turns comparisons of
//! committed keys into a single integer compare. Any other combination
//! falls back to comparing content, resolving pending ids through the
//! adder's table.

use std::hash::{BuildHasher, Hasher};

use crate::address::{Address, TypedAddress};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::index::{IndexContext, Key, NameIndex};
use crate::serialize::{
    read_string, write_str, DatabaseReader, ReadArchive, VecWriter, WriteArchive,
};
use crate::transaction::Transaction;

/// Marker distinguishing a pending placeholder from a body address.
const PENDING_BIT: u64 = 1;

/// Lookup-only sentinel; see [`IndirectString::view`].
const VIEW_ID: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    /// Caller-owned text, not (or not yet) in the store. Carries the
    /// pending id it will be filed under if the insert goes through.
    Fresh { id: u32, text: Box<str> },
    /// A placeholder read back from the store: the body lives in the
    /// current transaction's pending table.
    Pending { id: u32 },
    /// A body in the store.
    Stored { addr: Address },
}

/// A string value that may live on the caller's side, in the pending
/// table of an open transaction, or as a committed body in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectString {
    repr: Repr,
}

impl IndirectString {
    pub(crate) fn fresh(id: u32, text: &str) -> IndirectString {
        IndirectString {
            repr: Repr::Fresh {
                id,
                text: text.into(),
            },
        }
    }

    /// A lookup-only view of caller-owned text. Suitable as a probe key
    /// for `find`; inserting it requires [`IndirectStringAdder`].
    pub fn view(text: &str) -> IndirectString {
        IndirectString::fresh(VIEW_ID, text)
    }

    /// A string whose body is already in the store.
    pub fn from_address(addr: Address) -> IndirectString {
        IndirectString {
            repr: Repr::Stored { addr },
        }
    }

    /// The body address, once the string is in the store.
    pub fn address(&self) -> Option<Address> {
        match self.repr {
            Repr::Stored { addr } => Some(addr),
            _ => None,
        }
    }

    pub fn is_in_store(&self) -> bool {
        matches!(self.repr, Repr::Stored { .. })
    }

    /// Resolves the content and hands it to `f`.
    fn with_content<R>(
        &self,
        ctx: IndexContext<'_>,
        f: impl FnOnce(&str) -> R,
    ) -> Result<R> {
        match &self.repr {
            Repr::Fresh { text, .. } => Ok(f(text)),
            Repr::Pending { id } => {
                let table = ctx
                    .strings
                    .ok_or_else(|| Error::corrupt("pending string with no table in scope"))?;
                let text = table
                    .get(*id)
                    .ok_or_else(|| Error::corrupt("pending string id out of range"))?;
                Ok(f(text))
            }
            Repr::Stored { addr } => {
                let mut reader = DatabaseReader::new(ctx.db, *addr);
                let text = read_string(&mut reader)?;
                Ok(f(&text))
            }
        }
    }

    /// The string's content as an owned value. Resolves a committed body
    /// through `db`; fails for a placeholder whose transaction is gone.
    pub fn to_string(&self, db: &Database) -> Result<String> {
        self.with_content(IndexContext::new(db), str::to_owned)
    }

    pub fn length(&self, ctx: IndexContext<'_>) -> Result<usize> {
        self.with_content(ctx, str::len)
    }

    /// Lexicographic comparison on content.
    pub fn compare(&self, ctx: IndexContext<'_>, other: &Self) -> Result<std::cmp::Ordering> {
        self.with_content(ctx, |a| other.with_content(ctx, |b| a.cmp(b)))?
    }
}

impl Key for IndirectString {
    fn stable_hash<S: BuildHasher>(&self, ctx: IndexContext<'_>, build: &S) -> Result<u64> {
        self.with_content(ctx, |text| {
            let mut hasher = build.build_hasher();
            hasher.write(text.as_bytes());
            hasher.finish()
        })
    }

    fn encode<A: WriteArchive>(&self, archive: &mut A) -> Result<()> {
        let slot = match &self.repr {
            Repr::Fresh { id: VIEW_ID, .. } => {
                return Err(Error::corrupt(
                    "indirect string views must be interned through the adder",
                ));
            }
            Repr::Fresh { id, .. } | Repr::Pending { id } => ((*id as u64) << 1) | PENDING_BIT,
            Repr::Stored { addr } => {
                debug_assert_eq!(addr.absolute() & PENDING_BIT, 0);
                addr.absolute()
            }
        };
        archive.put_bytes(&slot.to_le_bytes(), 8)?;
        Ok(())
    }

    fn decode(_ctx: IndexContext<'_>, reader: &mut DatabaseReader<'_>) -> Result<Self> {
        let mut raw = [0u8; 8];
        reader.get_bytes(&mut raw, 8)?;
        let slot = u64::from_le_bytes(raw);
        Ok(if slot & PENDING_BIT != 0 {
            IndirectString {
                repr: Repr::Pending {
                    id: (slot >> 1) as u32,
                },
            }
        } else {
            IndirectString::from_address(Address::new(slot))
        })
    }

    fn matches(&self, ctx: IndexContext<'_>, other: &Self) -> Result<bool> {
        // Committed bodies are interned: address equality is content
        // equality.
        if let (Repr::Stored { addr: a }, Repr::Stored { addr: b }) = (&self.repr, &other.repr) {
            return Ok(a == b);
        }
        self.with_content(ctx, |a| other.with_content(ctx, |b| a == b))?
    }
}

/// One recorded add: the text and the slot awaiting its body address.
#[derive(Debug)]
struct PendingEntry {
    text: Box<str>,
    slot: TypedAddress<Address>,
}

/// Bodies of strings added but not yet flushed, addressed by pending id.
#[derive(Debug, Default)]
pub struct PendingStrings {
    entries: Vec<PendingEntry>,
}

impl PendingStrings {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(id as usize).map(|e| &*e.text)
    }
}

/// Two-phase writer of interned strings; see the module docs.
#[derive(Debug, Default)]
pub struct IndirectStringAdder {
    pending: PendingStrings,
}

impl IndirectStringAdder {
    pub fn new() -> IndirectStringAdder {
        IndirectStringAdder::default()
    }

    /// `expected` is the anticipated number of adds, used to size the
    /// pending table.
    pub fn with_capacity(expected: usize) -> IndirectStringAdder {
        IndirectStringAdder {
            pending: PendingStrings {
                entries: Vec::with_capacity(expected),
            },
        }
    }

    /// Number of strings awaiting [`IndirectStringAdder::flush`].
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Interns `text` in the name index. Returns the leaf-slot address
    /// and whether the string was newly inserted.
    pub fn add<S: BuildHasher>(
        &mut self,
        txn: &mut Transaction<'_>,
        index: &mut NameIndex<S>,
        text: &str,
    ) -> Result<(Address, bool)> {
        let id = self.pending.len() as u32;
        let key = IndirectString::fresh(id, text);
        let (slot, inserted) = index.insert_with(txn, &self.pending, &key, &())?;
        if inserted {
            self.pending.entries.push(PendingEntry {
                text: text.into(),
                slot: TypedAddress::new(slot),
            });
        }
        Ok((slot, inserted))
    }

    /// Writes the pending bodies in insertion order and patches each slot
    /// with its body address.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        let entries = std::mem::take(&mut self.pending.entries);
        for entry in entries {
            let mut w = VecWriter::new();
            write_str(&mut w, &entry.text)?;
            // 2-aligned so the patched slot's low bit stays clear.
            let body = txn.alloc_and_write(w.as_slice(), 2)?;
            txn.write_at(entry.slot.to_address(), &body.absolute().to_le_bytes())?;
        }
        Ok(())
    }
}
