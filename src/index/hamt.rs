//! # Persistent Hash-Array-Mapped Trie
//!
//! [`HamtMap`] is the index structure threaded through every transaction:
//! a copy-on-write trie keyed by a 64-bit hash of the user's key, with
//! leaves pointing at serialized key/value records in the store.
//!
//! ## Shape
//!
//! Each branch level consumes six hash bits (a shard selecting one of 64
//! slots). Eleven branch levels exhaust the 64-bit hash; keys whose full
//! hashes coincide land in a *linear* node below the last branch level and
//! are told apart by key equality alone. The walk is therefore bounded at
//! `MAX_TREE_DEPTH` frames, which the insertion stack relies on.
//!
//! ## Copy-on-Write
//!
//! Committed nodes are immutable. Modifying a path re-materializes each
//! node along it in the transaction's arena (tag flip from store to heap);
//! parents are rewritten bottom-up as the bounded stack unwinds. Until the
//! index is flushed, the root may point into the arena; lookups traverse
//! heap and store nodes alike.
//!
//! ## Flush
//!
//! [`HamtMap::flush`] walks the heap portion in post-order, writes every
//! node to the store (children first, so a parent always refers to final
//! addresses), collapses single-child branches whose child is an in-store
//! leaf, writes the `{signature, count, root}` header block, and registers
//! it with the transaction for the footer's per-index table.
//!
//! ## A Note on Single-Child Branches
//!
//! Two keys that agree on their first shards force a chain of single-child
//! branches down to the level where they diverge (or a linear node when
//! they never do). The chain is real on disk: depth decides whether an
//! internal node is a branch or a linear node, so the path must be walked
//! level by level. A lookup that reaches a leaf early simply compares keys
//! and is done.

use std::hash::BuildHasher;
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::address::{Address, TypedAddress};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::index::node::{
    shard_at, Arena, Branch, HeaderBlock, IndexPointer, Linear, Node, HASH_INDEX_BITS,
    MAX_HASH_BITS, MAX_LINEAR_LEAVES, MAX_TREE_DEPTH,
};
use crate::index::{IndexContext, IndexKind, Key};
use crate::indirect_string::PendingStrings;
use crate::serialize::{DatabaseReader, Deserialize, Serialize, VecWriter};
use crate::transaction::Transaction;

/// A persistent, copy-on-write hash-array-mapped trie.
pub struct HamtMap<K, V, S = crate::index::StableHashBuilder> {
    kind: IndexKind,
    root: IndexPointer,
    size: u64,
    hasher: S,
    arena: Arena,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, S> HamtMap<K, V, S>
where
    K: Key,
    V: Serialize + Deserialize,
    S: BuildHasher,
{
    /// Opens the index of `kind` from the footer this handle trusts. A
    /// kind that has never been flushed yields an empty index.
    pub fn open(db: &Database, kind: IndexKind) -> Result<Self>
    where
        S: Default,
    {
        Self::with_hasher(db, kind, S::default())
    }

    /// As [`HamtMap::open`] with an explicit hasher. The hasher must
    /// produce the same hashes as the one the index was written with.
    pub fn with_hasher(db: &Database, kind: IndexKind, hasher: S) -> Result<Self> {
        let root_addr = db.footer()?.index_root(kind.slot());
        let (root, size) = if root_addr.is_null() {
            (IndexPointer::EMPTY, 0)
        } else {
            let block = HeaderBlock::load(db, TypedAddress::new(root_addr))?;
            let root = IndexPointer::from_raw(block.root());
            if root.is_heap() {
                return Err(Error::corrupt("index root is not a store pointer"));
            }
            (root, block.size())
        };
        Ok(HamtMap {
            kind,
            root,
            size,
            hasher,
            arena: Arena::default(),
            _marker: PhantomData,
        })
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Number of keys in the index.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if the index holds modifications not yet flushed.
    pub fn is_dirty(&self) -> bool {
        !self.arena.is_empty()
    }

    /// Looks up `key`, returning the stored entry if present.
    pub fn find(&self, db: &Database, key: &K) -> Result<Option<(K, V)>> {
        self.find_in(IndexContext::new(db), key)
    }

    /// As [`HamtMap::find`] with an explicit context (needed to resolve
    /// interned strings added in the current transaction).
    pub fn find_in(&self, ctx: IndexContext<'_>, key: &K) -> Result<Option<(K, V)>> {
        match self.find_leaf(ctx, key)? {
            Some(addr) => Ok(Some(self.read_entry(ctx, addr)?)),
            None => Ok(None),
        }
    }

    /// Looks up `key`, returning the address of its leaf record.
    pub fn find_leaf(&self, ctx: IndexContext<'_>, key: &K) -> Result<Option<Address>> {
        if self.root.is_empty() {
            return Ok(None);
        }
        let hash = key.stable_hash(ctx, &self.hasher)?;
        let mut node = self.root;
        let mut shift = 0u32;
        loop {
            if node.is_leaf() {
                let addr = node.leaf_address();
                let stored = self.decode_key(ctx, addr)?;
                return Ok(if stored.matches(ctx, key)? {
                    Some(addr)
                } else {
                    None
                });
            }
            if shift >= MAX_HASH_BITS {
                for leaf in self.linear_leaves(ctx.db, node)? {
                    let stored = self.decode_key(ctx, leaf)?;
                    if stored.matches(ctx, key)? {
                        return Ok(Some(leaf));
                    }
                }
                return Ok(None);
            }
            match self.branch_child(ctx.db, node, shard_at(hash, shift))? {
                Some((child, _)) => {
                    node = child;
                    shift += HASH_INDEX_BITS;
                }
                None => return Ok(None),
            }
        }
    }

    /// Inserts `key -> value`. If the key is already present the stored
    /// entry is left untouched and `(existing leaf, false)` is returned.
    pub fn insert(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &K,
        value: &V,
    ) -> Result<(Address, bool)> {
        self.insert_impl(txn, None, key, value, false)
    }

    /// Inserts `key -> value`, replacing the payload of an existing key.
    /// The bool reports whether the key was newly inserted.
    pub fn insert_or_assign(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &K,
        value: &V,
    ) -> Result<(Address, bool)> {
        self.insert_impl(txn, None, key, value, true)
    }

    /// Insert with a pending-string table in scope; used by the
    /// interned-string adder.
    pub(crate) fn insert_with(
        &mut self,
        txn: &mut Transaction<'_>,
        strings: &PendingStrings,
        key: &K,
        value: &V,
    ) -> Result<(Address, bool)> {
        self.insert_impl(txn, Some(strings), key, value, false)
    }

    fn insert_impl(
        &mut self,
        txn: &mut Transaction<'_>,
        strings: Option<&PendingStrings>,
        key: &K,
        value: &V,
        upsert: bool,
    ) -> Result<(Address, bool)> {
        let db = txn.db();
        let ctx = IndexContext { db, strings };
        let hash = key.stable_hash(ctx, &self.hasher)?;

        if self.root.is_empty() {
            let leaf = self.write_leaf(txn, key, value)?;
            self.root = IndexPointer::from_leaf(leaf);
            self.size += 1;
            return Ok((leaf, true));
        }

        // The walk is bounded by construction: eleven branch levels, one
        // linear level, one leaf.
        let mut parents: SmallVec<[(IndexPointer, usize); MAX_TREE_DEPTH]> = SmallVec::new();
        let mut node = self.root;
        let mut shift = 0u32;
        loop {
            assert!(parents.len() < MAX_TREE_DEPTH, "hash walk exceeded tree depth");

            if node.is_leaf() {
                let existing_addr = node.leaf_address();
                let existing = self.decode_key(ctx, existing_addr)?;
                if existing.matches(ctx, key)? {
                    if !upsert {
                        return Ok((existing_addr, false));
                    }
                    let leaf = self.write_leaf(txn, key, value)?;
                    self.replace_through(db, &parents, IndexPointer::from_leaf(leaf))?;
                    return Ok((leaf, false));
                }
                let existing_hash = existing.stable_hash(ctx, &self.hasher)?;
                let leaf = self.write_leaf(txn, key, value)?;
                let split =
                    self.build_split(node, existing_hash, IndexPointer::from_leaf(leaf), hash, shift);
                self.replace_through(db, &parents, split)?;
                self.size += 1;
                return Ok((leaf, true));
            }

            if shift >= MAX_HASH_BITS {
                let leaves = self.linear_leaves(db, node)?;
                for (pos, leaf_addr) in leaves.iter().copied().enumerate() {
                    let stored = self.decode_key(ctx, leaf_addr)?;
                    if stored.matches(ctx, key)? {
                        if !upsert {
                            return Ok((leaf_addr, false));
                        }
                        let leaf = self.write_leaf(txn, key, value)?;
                        let id = self.make_writable_linear(db, node)?;
                        match self.arena.get_mut(id) {
                            Node::Linear(l) => l.set_leaf(pos, leaf),
                            Node::Branch(_) => unreachable!("writable linear is linear"),
                        }
                        self.replace_through(db, &parents, IndexPointer::from_heap(id))?;
                        return Ok((leaf, false));
                    }
                }
                if leaves.len() >= MAX_LINEAR_LEAVES {
                    return Err(Error::corrupt("linear collision bucket overflow"));
                }
                let leaf = self.write_leaf(txn, key, value)?;
                let id = self.make_writable_linear(db, node)?;
                match self.arena.get_mut(id) {
                    Node::Linear(l) => l.push_leaf(leaf),
                    Node::Branch(_) => unreachable!("writable linear is linear"),
                }
                self.replace_through(db, &parents, IndexPointer::from_heap(id))?;
                self.size += 1;
                return Ok((leaf, true));
            }

            let shard = shard_at(hash, shift);
            match self.branch_child(db, node, shard)? {
                Some((child, slot)) => {
                    parents.push((node, slot));
                    node = child;
                    shift += HASH_INDEX_BITS;
                }
                None => {
                    let leaf = self.write_leaf(txn, key, value)?;
                    let id = self.make_writable_branch(db, node)?;
                    match self.arena.get_mut(id) {
                        Node::Branch(b) => b.insert_child(shard, IndexPointer::from_leaf(leaf)),
                        Node::Linear(_) => unreachable!("writable branch is branch"),
                    }
                    self.replace_through(db, &parents, IndexPointer::from_heap(id))?;
                    self.size += 1;
                    return Ok((leaf, true));
                }
            }
        }
    }

    /// Writes the heap portion of the tree to the store, publishes a new
    /// header block, and registers it with the transaction.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<TypedAddress<HeaderBlock>> {
        let root = self.flush_node(txn, self.root)?;
        self.root = root;
        self.arena.clear();

        let block = HeaderBlock::new(self.size, root.raw());
        let addr = txn.alloc_and_write(zerocopy::IntoBytes::as_bytes(&block), 8)?;
        txn.set_index_root(self.kind.slot(), addr);
        Ok(TypedAddress::new(addr))
    }

    fn flush_node(&mut self, txn: &mut Transaction<'_>, ptr: IndexPointer) -> Result<IndexPointer> {
        if !ptr.is_heap() {
            return Ok(ptr);
        }
        match self.arena.take(ptr.heap_id()) {
            Node::Branch(mut branch) => {
                // Children first, so this node is written with final
                // addresses. Recursion depth is bounded by MAX_TREE_DEPTH.
                for slot in 0..branch.size() {
                    let child = branch.children()[slot];
                    branch.set_child(slot, self.flush_node(txn, child)?);
                }
                if branch.size() == 1 && branch.children()[0].is_leaf() {
                    // A one-child branch over an in-store leaf adds no
                    // information: a lookup reaching the leaf compares the
                    // full key anyway.
                    return Ok(branch.children()[0]);
                }
                Ok(IndexPointer::from_store_internal(branch.store(txn)?))
            }
            Node::Linear(linear) => Ok(IndexPointer::from_store_internal(linear.store(txn)?)),
        }
    }

    /// Reads the entry a leaf record stores.
    pub fn read_entry(&self, ctx: IndexContext<'_>, leaf: Address) -> Result<(K, V)> {
        let mut reader = DatabaseReader::new(ctx.db, leaf);
        let key = K::decode(ctx, &mut reader)?;
        let value = V::deserialize(&mut reader)?;
        Ok((key, value))
    }

    /// Iterates the leaf addresses of the tree in trie order.
    pub fn iter<'a>(&'a self, db: &'a Database) -> HamtIter<'a, K, V, S> {
        let mut stack = SmallVec::new();
        if !self.root.is_empty() {
            stack.push(Frame {
                node: self.root,
                pos: 0,
            });
        }
        HamtIter {
            map: self,
            db,
            stack,
        }
    }

    fn decode_key(&self, ctx: IndexContext<'_>, leaf: Address) -> Result<K> {
        let mut reader = DatabaseReader::new(ctx.db, leaf);
        K::decode(ctx, &mut reader)
    }

    fn write_leaf(&self, txn: &mut Transaction<'_>, key: &K, value: &V) -> Result<Address> {
        let mut w = VecWriter::new();
        key.encode(&mut w)?;
        value.serialize(&mut w)?;
        txn.alloc_and_write(w.as_slice(), 8)
    }

    /// Bitmap lookup in a branch that may live in the arena or the store.
    fn branch_child(
        &self,
        db: &Database,
        node: IndexPointer,
        shard: u64,
    ) -> Result<Option<(IndexPointer, usize)>> {
        if node.is_heap() {
            match self.arena.get(node.heap_id()) {
                Node::Branch(b) => Ok(b.lookup(shard)),
                Node::Linear(_) => Err(Error::corrupt("linear node above the collision tier")),
            }
        } else {
            Ok(Branch::load(db, node.store_address())?.lookup(shard))
        }
    }

    fn linear_leaves(&self, db: &Database, node: IndexPointer) -> Result<Vec<Address>> {
        if node.is_heap() {
            match self.arena.get(node.heap_id()) {
                Node::Linear(l) => Ok(l.leaves().to_vec()),
                Node::Branch(_) => Err(Error::corrupt("branch node in the collision tier")),
            }
        } else {
            Ok(Linear::load(db, node.store_address())?.leaves().to_vec())
        }
    }

    /// Returns the arena id of a writable copy of `node` (a branch).
    fn make_writable_branch(&mut self, db: &Database, node: IndexPointer) -> Result<usize> {
        if node.is_heap() {
            match self.arena.get(node.heap_id()) {
                Node::Branch(_) => Ok(node.heap_id()),
                Node::Linear(_) => Err(Error::corrupt("linear node above the collision tier")),
            }
        } else {
            let branch = Branch::load(db, node.store_address())?;
            Ok(self.arena.push(Node::Branch(branch)))
        }
    }

    /// Returns the arena id of a writable copy of `node` (a linear node).
    fn make_writable_linear(&mut self, db: &Database, node: IndexPointer) -> Result<usize> {
        if node.is_heap() {
            match self.arena.get(node.heap_id()) {
                Node::Linear(_) => Ok(node.heap_id()),
                Node::Branch(_) => Err(Error::corrupt("branch node in the collision tier")),
            }
        } else {
            let linear = Linear::load(db, node.store_address())?;
            Ok(self.arena.push(Node::Linear(linear)))
        }
    }

    /// Rewrites the walked path bottom-up so that every ancestor of the
    /// modified node is a heap copy pointing at its updated child.
    fn replace_through(
        &mut self,
        db: &Database,
        parents: &[(IndexPointer, usize)],
        mut child: IndexPointer,
    ) -> Result<()> {
        for &(parent, slot) in parents.iter().rev() {
            let id = self.make_writable_branch(db, parent)?;
            match self.arena.get_mut(id) {
                Node::Branch(b) => b.set_child(slot, child),
                Node::Linear(_) => unreachable!("writable branch is branch"),
            }
            child = IndexPointer::from_heap(id);
        }
        self.root = child;
        Ok(())
    }

    /// Builds the subtree that separates an existing leaf from a new one,
    /// starting at `shift`. Returns its topmost pointer.
    fn build_split(
        &mut self,
        existing: IndexPointer,
        existing_hash: u64,
        new: IndexPointer,
        new_hash: u64,
        shift: u32,
    ) -> IndexPointer {
        let mut diverge = shift;
        while diverge < MAX_HASH_BITS
            && shard_at(existing_hash, diverge) == shard_at(new_hash, diverge)
        {
            diverge += HASH_INDEX_BITS;
        }

        let (mut ptr, top) = if diverge >= MAX_HASH_BITS {
            // The hashes never part ways: the keys share all 64 bits and
            // must be separated by equality in a linear node.
            let linear = Linear::new_pair(existing.leaf_address(), new.leaf_address());
            (
                IndexPointer::from_heap(self.arena.push(Node::Linear(linear))),
                MAX_HASH_BITS,
            )
        } else {
            let branch = Branch::new_pair(
                shard_at(existing_hash, diverge),
                existing,
                shard_at(new_hash, diverge),
                new,
            );
            (
                IndexPointer::from_heap(self.arena.push(Node::Branch(branch))),
                diverge,
            )
        };

        // Wrap single-child branches over the levels the two hashes share.
        let mut level = top;
        while level > shift {
            level -= HASH_INDEX_BITS;
            let branch = Branch::new_single(shard_at(new_hash, level), ptr);
            ptr = IndexPointer::from_heap(self.arena.push(Node::Branch(branch)));
        }
        ptr
    }

    /// The `pos`-th child of an internal node, if any. Used by iteration.
    fn child_at(
        &self,
        db: &Database,
        node: IndexPointer,
        pos: usize,
    ) -> Result<Option<IndexPointer>> {
        if node.is_heap() {
            match self.arena.get(node.heap_id()) {
                Node::Branch(b) => Ok(b.children().get(pos).copied()),
                Node::Linear(l) => Ok(l
                    .leaves()
                    .get(pos)
                    .copied()
                    .map(IndexPointer::from_leaf)),
            }
        } else {
            // Depth information is lost here, so sniff the signature.
            let head = db.getro(node.store_address(), 8)?;
            if &head[..8] == crate::index::node::LINEAR_SIGNATURE {
                let linear = Linear::load(db, node.store_address())?;
                Ok(linear.leaves().get(pos).copied().map(IndexPointer::from_leaf))
            } else {
                let branch = Branch::load(db, node.store_address())?;
                Ok(branch.children().get(pos).copied())
            }
        }
    }
}

impl<K, V, S> std::fmt::Debug for HamtMap<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HamtMap")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("root", &self.root)
            .finish()
    }
}

struct Frame {
    node: IndexPointer,
    pos: usize,
}

/// Forward iterator over leaf addresses; `None` once the frame stack is
/// exhausted.
pub struct HamtIter<'a, K, V, S> {
    map: &'a HamtMap<K, V, S>,
    db: &'a Database,
    stack: SmallVec<[Frame; MAX_TREE_DEPTH + 1]>,
}

impl<K, V, S> Iterator for HamtIter<'_, K, V, S>
where
    K: Key,
    V: Serialize + Deserialize,
    S: BuildHasher,
{
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(top) = self.stack.last_mut() {
            let node = top.node;
            if node.is_leaf() {
                self.stack.pop();
                return Some(Ok(node.leaf_address()));
            }
            let pos = top.pos;
            match self.map.child_at(self.db, node, pos) {
                Ok(Some(child)) => {
                    top.pos += 1;
                    self.stack.push(Frame {
                        node: child,
                        pos: 0,
                    });
                }
                Ok(None) => {
                    self.stack.pop();
                }
                Err(err) => {
                    self.stack.clear();
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
