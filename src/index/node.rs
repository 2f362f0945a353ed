//! # HAMT Node Machinery
//!
//! The trie is built from three kinds of slot target:
//!
//! - a **leaf**: the store address of a serialized key/value record;
//! - a **branch**: an interior node with a 64-bit occupancy bitmap and a
//!   packed array of child pointers;
//! - a **linear** node: the collision tier at the bottom of the tree,
//!   holding the leaf addresses of keys whose full hashes coincide.
//!
//! ## Tagged Pointers
//!
//! A child slot is a single `u64` ([`IndexPointer`]). In-store internal
//! nodes are 8-aligned, so the two low bits are free for tags:
//!
//! ```text
//! bit 0 (INTERNAL)  set: branch or linear node; clear: leaf record
//! bit 1 (HEAP)      set: node lives in the transaction arena and the
//!                   remaining bits are an arena id; clear: store address
//! ```
//!
//! Whether an internal pointer is a branch or a linear node is not
//! recorded in the pointer: it follows from depth, because a linear node
//! only ever appears once the hash bits are exhausted.
//!
//! Heap nodes are identified by arena *ids* rather than raw pointers so
//! the tag bits never collide with pointer provenance; the arena lives in
//! the index object and is discarded when the tree is flushed.
//!
//! ## On-Disk Layout
//!
//! ```text
//! branch:  signature[8] | bitmap u64 | child u64 * popcount(bitmap)
//! linear:  signature[8] | count  u64 | leaf  u64 * count
//! ```
//!
//! Loads verify the signature, that a branch bitmap is non-zero and
//! matches the child count implied by the stored extent, and that a
//! linear node holds at least two and at most [`MAX_LINEAR_LEAVES`]
//! leaves. Any mismatch is `CorruptIndex`.

use smallvec::SmallVec;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::address::{Address, TypedAddress};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::zerocopy_getters;

/// Bits of hash consumed per branch level.
pub(crate) const HASH_INDEX_BITS: u32 = 6;
/// Bits in the hash type; the maximum fan-out of a branch.
pub(crate) const HASH_SIZE: u32 = 64;
/// Hash bits after rounding up to whole levels; the shift at which the
/// walk leaves branch territory.
pub(crate) const MAX_HASH_BITS: u32 =
    (HASH_SIZE + HASH_INDEX_BITS - 1) / HASH_INDEX_BITS * HASH_INDEX_BITS;
pub(crate) const HASH_INDEX_MASK: u64 = (1 << HASH_INDEX_BITS) - 1;
/// Number of branch levels.
pub(crate) const MAX_BRANCH_DEPTH: u32 = MAX_HASH_BITS / HASH_INDEX_BITS;
/// Branch levels plus the linear tier plus the leaf.
pub(crate) const MAX_TREE_DEPTH: usize = MAX_BRANCH_DEPTH as usize + 2;
/// Defensive cap on the collision tier.
pub(crate) const MAX_LINEAR_LEAVES: usize = 1 << 16;

const _: () = assert!(MAX_HASH_BITS == 66);
const _: () = assert!(MAX_BRANCH_DEPTH == 11);
const _: () = assert!(MAX_TREE_DEPTH == 13);

pub(crate) const BRANCH_SIGNATURE: &[u8; 8] = b"pBranch\x00";
pub(crate) const LINEAR_SIGNATURE: &[u8; 8] = b"pLinear\x00";
pub const HEADER_BLOCK_SIGNATURE: &[u8; 8] = b"pIdxHdr\x00";

/// The hash shard selecting a child slot at `shift`.
#[inline]
pub(crate) fn shard_at(hash: u64, shift: u32) -> u64 {
    if shift >= HASH_SIZE {
        0
    } else {
        (hash >> shift) & HASH_INDEX_MASK
    }
}

const INTERNAL_BIT: u64 = 1;
const HEAP_BIT: u64 = 2;

/// A tagged child slot; see the module docs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexPointer(u64);

impl IndexPointer {
    pub const EMPTY: IndexPointer = IndexPointer(0);

    #[inline]
    pub fn from_raw(raw: u64) -> IndexPointer {
        IndexPointer(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_leaf(addr: Address) -> IndexPointer {
        debug_assert_eq!(addr.absolute() & INTERNAL_BIT, 0);
        IndexPointer(addr.absolute())
    }

    #[inline]
    pub fn from_store_internal(addr: Address) -> IndexPointer {
        debug_assert_eq!(addr.absolute() % 8, 0);
        IndexPointer(addr.absolute() | INTERNAL_BIT)
    }

    #[inline]
    pub fn from_heap(id: usize) -> IndexPointer {
        IndexPointer(((id as u64) << 2) | HEAP_BIT | INTERNAL_BIT)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_internal(self) -> bool {
        self.0 & INTERNAL_BIT != 0
    }

    /// A non-empty pointer to a leaf record.
    #[inline]
    pub fn is_leaf(self) -> bool {
        !self.is_empty() && !self.is_internal()
    }

    #[inline]
    pub fn is_heap(self) -> bool {
        self.0 & HEAP_BIT != 0 && self.is_internal()
    }

    /// Address of the leaf record this slot names.
    #[inline]
    pub fn leaf_address(self) -> Address {
        debug_assert!(self.is_leaf());
        Address::new(self.0)
    }

    /// Store address of an in-store internal node.
    #[inline]
    pub fn store_address(self) -> Address {
        debug_assert!(self.is_internal() && !self.is_heap());
        Address::new(self.0 & !INTERNAL_BIT)
    }

    /// Arena id of an in-heap node.
    #[inline]
    pub fn heap_id(self) -> usize {
        debug_assert!(self.is_heap());
        (self.0 >> 2) as usize
    }
}

impl std::fmt::Debug for IndexPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "empty")
        } else if self.is_heap() {
            write!(f, "heap#{}", self.heap_id())
        } else if self.is_internal() {
            write!(f, "store@{}", self.store_address())
        } else {
            write!(f, "leaf@{}", self.leaf_address())
        }
    }
}

/// The per-index record published through the footer:
/// `{signature, key count, root pointer}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HeaderBlock {
    signature: [u8; 8],
    size: U64,
    root: U64,
}

pub const HEADER_BLOCK_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<HeaderBlock>() == HEADER_BLOCK_SIZE);

impl HeaderBlock {
    pub(crate) fn new(size: u64, root_raw: u64) -> Self {
        HeaderBlock {
            signature: *HEADER_BLOCK_SIGNATURE,
            size: U64::new(size),
            root: U64::new(root_raw),
        }
    }

    pub fn load(db: &Database, addr: TypedAddress<HeaderBlock>) -> Result<HeaderBlock> {
        let bytes = db.getro(addr.to_address(), HEADER_BLOCK_SIZE as u64)?;
        let block = HeaderBlock::read_from_bytes(&bytes[..HEADER_BLOCK_SIZE])
            .map_err(|_| Error::corrupt("unreadable index header block"))?;
        if &block.signature != HEADER_BLOCK_SIGNATURE {
            return Err(Error::corrupt("bad index header block signature"));
        }
        Ok(block)
    }

    zerocopy_getters! {
        size: u64,
        root: u64,
    }
}

/// An interior node: occupancy bitmap plus packed children.
#[derive(Debug, Clone)]
pub(crate) struct Branch {
    bitmap: u64,
    children: SmallVec<[IndexPointer; 4]>,
}

impl Branch {
    /// A branch with a single child.
    pub fn new_single(shard: u64, child: IndexPointer) -> Branch {
        debug_assert!(shard <= HASH_INDEX_MASK);
        let mut children = SmallVec::new();
        children.push(child);
        Branch {
            bitmap: 1u64 << shard,
            children,
        }
    }

    /// A branch with two children at distinct shards.
    pub fn new_pair(
        existing_shard: u64,
        existing: IndexPointer,
        new_shard: u64,
        new: IndexPointer,
    ) -> Branch {
        debug_assert_ne!(existing_shard, new_shard);
        let mut children = SmallVec::new();
        if existing_shard < new_shard {
            children.push(existing);
            children.push(new);
        } else {
            children.push(new);
            children.push(existing);
        }
        Branch {
            bitmap: (1u64 << existing_shard) | (1u64 << new_shard),
            children,
        }
    }

    #[inline]
    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn children(&self) -> &[IndexPointer] {
        &self.children
    }

    #[inline]
    pub fn children_mut(&mut self) -> &mut [IndexPointer] {
        &mut self.children
    }

    /// The packed slot a shard occupies (whether or not it is present).
    #[inline]
    fn packed_slot(&self, shard: u64) -> usize {
        (self.bitmap & ((1u64 << shard) - 1)).count_ones() as usize
    }

    /// Child pointer and packed slot for `shard`, if occupied.
    pub fn lookup(&self, shard: u64) -> Option<(IndexPointer, usize)> {
        debug_assert!(shard <= HASH_INDEX_MASK);
        if self.bitmap & (1u64 << shard) == 0 {
            return None;
        }
        let slot = self.packed_slot(shard);
        Some((self.children[slot], slot))
    }

    /// Inserts a child at `shard`, which must be unoccupied.
    pub fn insert_child(&mut self, shard: u64, child: IndexPointer) {
        debug_assert_eq!(self.bitmap & (1u64 << shard), 0);
        let slot = self.packed_slot(shard);
        self.bitmap |= 1u64 << shard;
        self.children.insert(slot, child);
    }

    pub fn set_child(&mut self, slot: usize, child: IndexPointer) {
        self.children[slot] = child;
    }

    /// Bytes occupied by an in-store branch with `n` children.
    pub const fn store_size_bytes(n: usize) -> usize {
        16 + 8 * n
    }

    /// Loads and validates an in-store branch.
    pub fn load(db: &Database, addr: Address) -> Result<Branch> {
        let head = db.getro(addr, 16)?;
        if &head[..8] != BRANCH_SIGNATURE {
            return Err(Error::corrupt(format!("bad branch signature at {addr}")));
        }
        let bitmap = u64::from_le_bytes(head[8..16].try_into().expect("16-byte view"));
        if bitmap == 0 {
            return Err(Error::corrupt(format!("empty branch bitmap at {addr}")));
        }
        let n = bitmap.count_ones() as usize;
        let body = db.getro(addr + 16, (n * 8) as u64)?;
        let mut children = SmallVec::with_capacity(n);
        for raw in body.chunks_exact(8) {
            let ptr = IndexPointer::from_raw(u64::from_le_bytes(
                raw.try_into().expect("8-byte chunk"),
            ));
            if ptr.is_empty() || ptr.is_heap() {
                return Err(Error::corrupt(format!("bad child pointer in branch at {addr}")));
            }
            children.push(ptr);
        }
        Ok(Branch { bitmap, children })
    }

    /// Writes this branch to the store; every child must already be an
    /// in-store pointer.
    pub fn store(&self, txn: &mut Transaction<'_>) -> Result<Address> {
        debug_assert!(self.bitmap != 0);
        debug_assert_eq!(self.bitmap.count_ones() as usize, self.children.len());
        let mut buf: SmallVec<[u8; 144]> = SmallVec::new();
        buf.extend_from_slice(BRANCH_SIGNATURE);
        buf.extend_from_slice(&self.bitmap.to_le_bytes());
        for child in &self.children {
            debug_assert!(!child.is_heap());
            buf.extend_from_slice(&child.raw().to_le_bytes());
        }
        debug_assert_eq!(buf.len(), Branch::store_size_bytes(self.children.len()));
        txn.alloc_and_write(&buf, 8)
    }
}

/// The collision tier: leaf addresses searched by key equality.
#[derive(Debug, Clone, Default)]
pub(crate) struct Linear {
    leaves: Vec<Address>,
}

impl Linear {
    /// A linear node exists only to separate keys with identical hashes,
    /// so it is born with two leaves.
    pub fn new_pair(existing: Address, new: Address) -> Linear {
        Linear {
            leaves: vec![existing, new],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[inline]
    pub fn leaves(&self) -> &[Address] {
        &self.leaves
    }

    pub fn set_leaf(&mut self, pos: usize, addr: Address) {
        self.leaves[pos] = addr;
    }

    pub fn push_leaf(&mut self, addr: Address) {
        self.leaves.push(addr);
    }

    /// Bytes occupied by an in-store linear node with `n` leaves.
    pub const fn store_size_bytes(n: usize) -> usize {
        16 + 8 * n
    }

    /// Loads and validates an in-store linear node.
    pub fn load(db: &Database, addr: Address) -> Result<Linear> {
        let head = db.getro(addr, 16)?;
        if &head[..8] != LINEAR_SIGNATURE {
            return Err(Error::corrupt(format!("bad linear-node signature at {addr}")));
        }
        let count = u64::from_le_bytes(head[8..16].try_into().expect("16-byte view")) as usize;
        if count < 2 {
            return Err(Error::corrupt(format!("underfull linear node at {addr}")));
        }
        if count > MAX_LINEAR_LEAVES {
            return Err(Error::corrupt(format!(
                "linear node at {addr} claims {count} leaves"
            )));
        }
        let body = db.getro(addr + 16, (count * 8) as u64)?;
        let mut leaves = Vec::with_capacity(count);
        for raw in body.chunks_exact(8) {
            let leaf = Address::new(u64::from_le_bytes(raw.try_into().expect("8-byte chunk")));
            if leaf.is_null() || leaf.absolute() & 1 != 0 {
                return Err(Error::corrupt(format!("bad leaf address in linear node at {addr}")));
            }
            leaves.push(leaf);
        }
        Ok(Linear { leaves })
    }

    /// Writes this linear node to the store.
    pub fn store(&self, txn: &mut Transaction<'_>) -> Result<Address> {
        debug_assert!(self.leaves.len() >= 2);
        let mut buf: Vec<u8> = Vec::with_capacity(Linear::store_size_bytes(self.leaves.len()));
        buf.extend_from_slice(LINEAR_SIGNATURE);
        buf.extend_from_slice(&(self.leaves.len() as u64).to_le_bytes());
        for leaf in &self.leaves {
            buf.extend_from_slice(&leaf.absolute().to_le_bytes());
        }
        txn.alloc_and_write(&buf, 8)
    }
}

/// A heap-resident node awaiting flush.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Branch(Branch),
    Linear(Linear),
}

/// Transaction-scoped storage for heap nodes, addressed by id.
///
/// Entries are never freed individually; the whole arena is cleared when
/// the index flushes or the transaction ends.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn get(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Removes a node for flushing, leaving a placeholder.
    pub fn take(&mut self, id: usize) -> Node {
        std::mem::replace(&mut self.nodes[id], Node::Linear(Linear::default()))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_tags_roundtrip() {
        let leaf = IndexPointer::from_leaf(Address::new(0x1000));
        assert!(leaf.is_leaf() && !leaf.is_internal() && !leaf.is_heap());
        assert_eq!(leaf.leaf_address(), Address::new(0x1000));

        let store = IndexPointer::from_store_internal(Address::new(0x2000));
        assert!(store.is_internal() && !store.is_heap());
        assert_eq!(store.store_address(), Address::new(0x2000));

        let heap = IndexPointer::from_heap(42);
        assert!(heap.is_internal() && heap.is_heap());
        assert_eq!(heap.heap_id(), 42);

        assert!(IndexPointer::EMPTY.is_empty());
        assert!(!IndexPointer::EMPTY.is_leaf());
    }

    #[test]
    fn branch_packs_children_by_shard() {
        let a = IndexPointer::from_leaf(Address::new(0x100));
        let b = IndexPointer::from_leaf(Address::new(0x200));
        let branch = Branch::new_pair(9, a, 3, b);

        assert_eq!(branch.size(), 2);
        assert_eq!(branch.bitmap().count_ones(), 2);
        // Shard 3 sorts before shard 9 in the packed array.
        assert_eq!(branch.lookup(3).unwrap(), (b, 0));
        assert_eq!(branch.lookup(9).unwrap(), (a, 1));
        assert!(branch.lookup(4).is_none());
    }

    #[test]
    fn branch_insert_keeps_packing() {
        let a = IndexPointer::from_leaf(Address::new(0x100));
        let mut branch = Branch::new_single(10, a);
        let b = IndexPointer::from_leaf(Address::new(0x200));
        branch.insert_child(2, b);
        let c = IndexPointer::from_leaf(Address::new(0x300));
        branch.insert_child(63, c);

        assert_eq!(branch.lookup(2).unwrap().1, 0);
        assert_eq!(branch.lookup(10).unwrap().1, 1);
        assert_eq!(branch.lookup(63).unwrap().1, 2);
        assert_eq!(branch.bitmap().count_ones() as usize, branch.size());
    }

    #[test]
    fn shard_extraction_past_hash_end_is_zero() {
        assert_eq!(shard_at(u64::MAX, 0), 63);
        assert_eq!(shard_at(u64::MAX, 60), 15);
        assert_eq!(shard_at(u64::MAX, 66), 0);
    }

    #[test]
    fn store_size_formulas() {
        assert_eq!(Branch::store_size_bytes(1), 24);
        assert_eq!(Branch::store_size_bytes(64), 528);
        assert_eq!(Linear::store_size_bytes(2), 32);
    }

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = Arena::default();
        let a = arena.push(Node::Linear(Linear::new_pair(
            Address::new(2),
            Address::new(4),
        )));
        let b = arena.push(Node::Branch(Branch::new_single(
            0,
            IndexPointer::from_leaf(Address::new(8)),
        )));
        assert_ne!(a, b);
        assert!(matches!(arena.get(a), Node::Linear(_)));
        assert!(matches!(arena.get(b), Node::Branch(_)));
    }
}
