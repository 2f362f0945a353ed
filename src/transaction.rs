//! # Transactions
//!
//! A [`Transaction`] is the only way bytes enter the store. It is a bump
//! allocator over the file's unsealed tail plus the bookkeeping needed to
//! publish the result atomically:
//!
//! ```text
//! begin           allocate/write            commit
//!   |                  |                       |
//!   v                  v                       v
//! [ sealed store | new data........... | footer ]  -> protect, publish tip
//! ^ first                              ^ free
//! ```
//!
//! Addresses handed out by [`Transaction::allocate`] are strictly
//! monotonically increasing. [`Transaction::write_at`] may touch only bytes
//! at or above the begin watermark; anything below is sealed and fails with
//! `ReadOnlyViolation`.
//!
//! ## Commit
//!
//! Commit performs, in order: write the footer (prev link, generation,
//! timestamp, index-root table, CRC); flush the transaction's byte range;
//! publish the footer address in the file header with a release store
//! (readers acquire-load it, so a reader sees either the old or the new
//! tip, never a torn state, and never a tip whose bytes are not durable);
//! page-protect everything written; truncate the file to the mapped extent.
//!
//! ## Abort
//!
//! Abort shrinks storage back to the begin watermark and truncates the
//! file; nothing the transaction wrote remains reachable. Dropping an open
//! transaction aborts implicitly and logs a warning; the consuming
//! signatures of `commit` and `abort` make calling either twice a compile
//! error rather than a runtime one.

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::address::Address;
use crate::database::{now_millis, AccessMode, Database};
use crate::error::{Error, Result};
use crate::storage::file::{Footer, FILE_HEADER_SIZE, FOOTER_SIZE, INDEX_ROOT_SLOTS};
use crate::storage::lock;
use crate::storage::StoreRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Aborted,
}

/// An open writer transaction.
pub struct Transaction<'db> {
    db: &'db Database,
    _writer: MutexGuard<'db, ()>,
    prev_footer: Footer,
    /// Logical size of the store at begin; the first byte this
    /// transaction may write.
    first: Address,
    /// Bump pointer; the next free byte.
    free: Address,
    /// Header-block addresses registered by index flushes this
    /// transaction; null slots carry the previous footer's roots forward.
    index_roots: [Address; INDEX_ROOT_SLOTS],
    state: State,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db Database) -> Result<Transaction<'db>> {
        if db.access() == AccessMode::ReadOnly {
            return Err(Error::ReadOnlyViolation {
                address: db.first_free().absolute(),
            });
        }
        let writer = db
            .writer_token()
            .try_lock()
            .ok_or_else(|| Error::AlreadyOpen {
                path: db.path().to_path_buf(),
            })?;
        // Cross-process single-writer gate; blocks until the peer commits.
        lock::lock_range(db.storage().read().file())?;

        let prev_footer = match db.footer() {
            Ok(footer) => footer,
            Err(err) => {
                let _ = lock::unlock_range(db.storage().read().file());
                return Err(err);
            }
        };
        let first = db.first_free();
        debug!(generation = prev_footer.generation() + 1, first = %first, "begin transaction");
        Ok(Transaction {
            db,
            _writer: writer,
            prev_footer,
            first,
            free: first,
            index_roots: [Address::NULL; INDEX_ROOT_SLOTS],
            state: State::Open,
        })
    }

    pub fn db(&self) -> &'db Database {
        self.db
    }

    /// The generation number this transaction will commit as.
    pub fn generation(&self) -> u64 {
        self.prev_footer.generation() + 1
    }

    /// Total bytes allocated so far, alignment padding included.
    pub fn bytes_allocated(&self) -> u64 {
        self.free.absolute() - self.first.absolute()
    }

    /// Reserves `size` bytes at power-of-two `align`, growing the
    /// underlying storage as needed, and returns the aligned address.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<Address> {
        let addr = self.free.aligned_to(align);
        let new_free = addr + size;
        {
            let mut storage = self.db.storage().write();
            if new_free.absolute() > storage.logical_size() {
                storage.map_bytes(new_free.absolute())?;
            }
        }
        self.free = new_free;
        Ok(addr)
    }

    /// Allocates space for `bytes` and writes them; returns the address.
    pub fn alloc_and_write(&mut self, bytes: &[u8], align: u64) -> Result<Address> {
        let addr = self.allocate(bytes.len() as u64, align)?;
        self.write_at(addr, bytes)?;
        Ok(addr)
    }

    /// Overwrites bytes previously allocated by this transaction.
    ///
    /// Bytes below the begin watermark are sealed; touching them fails
    /// with `ReadOnlyViolation`.
    pub fn write_at(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        if addr < self.first {
            return Err(Error::ReadOnlyViolation {
                address: addr.absolute(),
            });
        }
        let end = addr.absolute() + bytes.len() as u64;
        if end > self.free.absolute() {
            return Err(Error::BadAddress {
                address: addr.absolute(),
                size: self.free.absolute(),
            });
        }
        self.db.storage().write().copy_to_store(addr, bytes)
    }

    /// An owning read view; may reach bytes written by this transaction.
    pub fn getro(&self, addr: Address, len: u64) -> Result<StoreRef> {
        self.db.storage().read().shared(addr, len)
    }

    /// Records the header block written by an index flush.
    pub(crate) fn set_index_root(&mut self, slot: usize, addr: Address) {
        self.index_roots[slot] = addr;
    }

    /// Seals the transaction and publishes a new footer; returns its
    /// address.
    pub fn commit(mut self) -> Result<Address> {
        let mut roots = self.prev_footer.index_roots();
        for (slot, new_root) in roots.iter_mut().zip(self.index_roots) {
            if !new_root.is_null() {
                *slot = new_root;
            }
        }
        let footer = Footer::new(self.generation(), self.db.tip(), now_millis(), roots);
        let footer_addr = self.allocate(FOOTER_SIZE as u64, 8)?;
        self.write_at(footer_addr, zerocopy::IntoBytes::as_bytes(&footer))?;

        {
            let storage = self.db.storage().read();
            // Durability before visibility: a reader that observes the new
            // tip must find the bytes it references on disk.
            storage.flush_range(self.first.absolute(), self.free.absolute())?;
            storage.publish_footer_pos(footer_addr)?;
            storage.flush_range(0, FILE_HEADER_SIZE as u64)?;
            storage.protect(self.first.absolute(), self.free.absolute())?;
        }
        self.db.storage().write().truncate_to_physical_size()?;
        self.db.advance_tip(footer_addr, self.free);
        self.state = State::Committed;

        debug!(
            generation = footer.generation(),
            footer = %footer_addr,
            bytes = self.free.absolute() - self.first.absolute(),
            "committed transaction"
        );
        Ok(footer_addr)
    }

    /// Discards everything the transaction wrote.
    pub fn abort(mut self) -> Result<()> {
        self.abort_inner()
    }

    fn abort_inner(&mut self) -> Result<()> {
        {
            let mut storage = self.db.storage().write();
            storage.map_bytes(self.first.absolute())?;
            storage.truncate_to_physical_size()?;
        }
        self.state = State::Aborted;
        debug!(first = %self.first, "aborted transaction");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == State::Open {
            warn!("transaction dropped while open; aborting implicitly");
            if let Err(err) = self.abort_inner() {
                warn!(%err, "implicit abort failed");
            }
        }
        if let Err(err) = lock::unlock_range(self.db.storage().read().file()) {
            warn!(%err, "failed to release the writer range lock");
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("first", &self.first)
            .field("free", &self.free)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn scratch_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("store.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn allocations_are_aligned_and_monotonic() {
        let (_dir, db) = scratch_db();
        let mut txn = db.begin().unwrap();

        let a = txn.allocate(3, 1).unwrap();
        let b = txn.allocate(8, 8).unwrap();
        let c = txn.allocate(1, 2).unwrap();

        assert_eq!(b.absolute() % 8, 0);
        assert_eq!(c.absolute() % 2, 0);
        assert!(a < b && b < c);
        assert_eq!(b.absolute(), crate::address::aligned(a.absolute() + 3, 8));

        txn.abort().unwrap();
    }

    #[test]
    fn only_one_transaction_per_handle() {
        let (_dir, db) = scratch_db();
        let txn = db.begin().unwrap();
        assert!(matches!(db.begin().err(), Some(Error::AlreadyOpen { .. })));
        drop(txn);
        // The implicit abort released the writer token.
        db.begin().unwrap().abort().unwrap();
    }

    #[test]
    fn writes_below_the_watermark_are_rejected() {
        let (_dir, db) = scratch_db();

        let mut txn = db.begin().unwrap();
        let addr = txn.alloc_and_write(b"payload", 1).unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin().unwrap();
        let err = txn.write_at(addr, b"overwrite").unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation { .. }));
        txn.abort().unwrap();
    }

    #[test]
    fn commit_publishes_a_new_footer() {
        let (_dir, db) = scratch_db();
        let old_tip = db.tip();

        let mut txn = db.begin().unwrap();
        txn.alloc_and_write(&[1, 2, 3, 4], 1).unwrap();
        let footer_addr = txn.commit().unwrap();

        assert_eq!(db.tip(), footer_addr);
        let footer = db.footer().unwrap();
        assert_eq!(footer.generation(), 1);
        assert_eq!(footer.prev(), old_tip);
    }

    #[test]
    fn abort_rolls_back_the_free_pointer() {
        let (_dir, db) = scratch_db();
        let before = db.first_free();

        let mut txn = db.begin().unwrap();
        txn.alloc_and_write(&[0xAA; 256], 1).unwrap();
        txn.abort().unwrap();

        assert_eq!(db.first_free(), before);
        assert_eq!(db.footer().unwrap().generation(), 0);
    }

    #[test]
    fn database_writer_reports_allocation_addresses() {
        use crate::serialize::{read, write, DatabaseReader, DatabaseWriter, WriteArchive};

        let (_dir, db) = scratch_db();
        let mut txn = db.begin().unwrap();

        let mut w = DatabaseWriter::new(&mut txn);
        let addr = write(&mut w, &0xABCDu32).unwrap();
        assert_eq!(w.bytes_consumed(), 4);
        drop(w);
        txn.commit().unwrap();

        let mut r = DatabaseReader::new(&db, addr);
        assert_eq!(read::<u32, _>(&mut r).unwrap(), 0xABCD);
    }

    #[test]
    fn committed_bytes_are_readable_through_getro() {
        let (_dir, db) = scratch_db();
        let mut txn = db.begin().unwrap();
        let addr = txn.alloc_and_write(b"fragment body", 1).unwrap();
        txn.commit().unwrap();

        let view = db.getro(addr, 13).unwrap();
        assert_eq!(&*view, b"fragment body");
    }
}
