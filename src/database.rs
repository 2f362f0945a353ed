//! # Database Handle
//!
//! A [`Database`] is one process's view of a store file: the mapped
//! [`Storage`], a snapshot of the footer tip taken at open, and the writer
//! token that serializes transactions within the handle.
//!
//! ## Snapshot Semantics
//!
//! Readers see the footer chain as it stood when the handle was opened (or
//! when [`Database::sync`] was last called). Everything reachable from that
//! footer is sealed and immutable, so reads need no coordination with a
//! concurrent writer, not even one in another process.
//!
//! ## Concurrency
//!
//! Within a handle, storage sits behind a `parking_lot::RwLock`: reads take
//! the shared lock briefly to manufacture an owning [`StoreRef`] and then
//! release it, so no lock is held while data is examined. The single open
//! transaction per handle is enforced by the writer token (a `Mutex<()>`
//! held for the life of the transaction); the single writer across
//! processes is enforced by an advisory range lock over the header bytes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::storage::file::{
    FileHeader, Footer, FILE_HEADER_SIZE, FOOTER_SIZE,
};
use crate::storage::region::os_page_size;
use crate::storage::{Storage, StoreRef};
use crate::transaction::Transaction;

/// The external compaction tool launched by [`Database::spawn_vacuum`].
pub const VACUUM_TOOL: &str = "pstore-vacuumd";

/// How a store file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    Writable,
}

/// An open store.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    storage: RwLock<Storage>,
    writer: Mutex<()>,
    /// Address of the footer this handle currently trusts.
    tip: AtomicU64,
    /// First byte the next transaction may allocate.
    first_free: AtomicU64,
    access: AccessMode,
}

impl Database {
    /// Creates a fresh store at `path`, overwriting any existing file.
    ///
    /// The new file carries the header and a genesis footer, so a created
    /// store is immediately openable by readers.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Database> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut storage = Storage::open(file, true)?;
        let genesis = Address::new(FILE_HEADER_SIZE as u64);
        let end = genesis + FOOTER_SIZE as u64;
        storage.map_bytes(end.absolute())?;

        let header = FileHeader::new(os_page_size() as u32, genesis);
        storage
            .slice_mut(Address::NULL, FILE_HEADER_SIZE as u64)?
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        let footer = Footer::genesis(now_millis());
        storage
            .slice_mut(genesis, FOOTER_SIZE as u64)?
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&footer));
        storage.flush_range(0, end.absolute())?;

        info!(path = %path.display(), "created store");
        Ok(Database {
            path: path.to_path_buf(),
            storage: RwLock::new(storage),
            writer: Mutex::new(()),
            tip: AtomicU64::new(genesis.absolute()),
            first_free: AtomicU64::new(end.absolute()),
            access: AccessMode::Writable,
        })
    }

    /// Opens an existing store.
    pub fn open<P: AsRef<Path>>(path: P, access: AccessMode) -> Result<Database> {
        let path = path.as_ref();
        let writable = access == AccessMode::Writable;
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let storage = Storage::open(file, writable)?;

        if storage.logical_size() < (FILE_HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::corrupt("file too small to hold a store"));
        }
        FileHeader::from_bytes(storage.slice(Address::NULL, FILE_HEADER_SIZE as u64)?)?;

        let tip = storage.load_footer_pos()?;
        let footer = read_footer_from(&storage, tip)?;
        let first_free = tip + FOOTER_SIZE as u64;

        info!(
            path = %path.display(),
            generation = footer.generation(),
            tip = %tip,
            "opened store"
        );
        Ok(Database {
            path: path.to_path_buf(),
            storage: RwLock::new(storage),
            writer: Mutex::new(()),
            tip: AtomicU64::new(tip.absolute()),
            first_free: AtomicU64::new(first_free.absolute()),
            access,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub(crate) fn storage(&self) -> &RwLock<Storage> {
        &self.storage
    }

    pub(crate) fn writer_token(&self) -> &Mutex<()> {
        &self.writer
    }

    /// The footer address this handle currently trusts.
    pub fn tip(&self) -> Address {
        Address::new(self.tip.load(Ordering::Acquire))
    }

    pub(crate) fn first_free(&self) -> Address {
        Address::new(self.first_free.load(Ordering::Acquire))
    }

    pub(crate) fn advance_tip(&self, tip: Address, first_free: Address) {
        self.first_free
            .store(first_free.absolute(), Ordering::Release);
        self.tip.store(tip.absolute(), Ordering::Release);
    }

    /// The footer this handle currently trusts.
    pub fn footer(&self) -> Result<Footer> {
        self.read_footer(self.tip())
    }

    /// Reads and validates the footer at `addr`.
    pub fn read_footer(&self, addr: Address) -> Result<Footer> {
        read_footer_from(&self.storage.read(), addr)
    }

    /// Walks the footer chain from the current tip back to genesis.
    pub fn footers(&self) -> FooterChain<'_> {
        FooterChain {
            db: self,
            next: self.tip(),
        }
    }

    /// An owning read-only view of `[addr, addr + len)`.
    ///
    /// The view keeps the underlying mapping alive for as long as it is
    /// held, independent of this handle.
    pub fn getro(&self, addr: Address, len: u64) -> Result<StoreRef> {
        self.storage.read().shared(addr, len)
    }

    /// Re-reads the published tip, picking up commits made by other
    /// handles since open. Grows the mapping if the file grew.
    pub fn sync(&self) -> Result<()> {
        let mut storage = self.storage.write();
        let file_len = storage.file().metadata()?.len();
        if file_len > storage.logical_size() {
            storage.map_bytes(file_len)?;
        }
        let tip = storage.load_footer_pos()?;
        read_footer_from(&storage, tip)?;
        drop(storage);
        self.advance_tip(tip, tip + FOOTER_SIZE as u64);
        Ok(())
    }

    /// Opens a writer transaction. Fails with [`Error::AlreadyOpen`] when
    /// one is already live on this handle.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// Flushes and drops the handle.
    pub fn close(self) -> Result<()> {
        let storage = self.storage.read();
        storage.flush_range(0, storage.logical_size())?;
        info!(path = %self.path.display(), "closed store");
        Ok(())
    }

    /// Launches the external vacuum process against `path`.
    ///
    /// The engine assumes nothing about the subprocess beyond: it reads
    /// the file, produces a compacted copy, and atomically renames it
    /// back.
    pub fn spawn_vacuum<P: AsRef<Path>>(path: P) -> Result<Child> {
        let child = Command::new(VACUUM_TOOL).arg(path.as_ref()).spawn()?;
        Ok(child)
    }
}

fn read_footer_from(storage: &Storage, addr: Address) -> Result<Footer> {
    if addr.absolute() < FILE_HEADER_SIZE as u64 || addr.absolute() % 8 != 0 {
        return Err(Error::BadAddress {
            address: addr.absolute(),
            size: storage.logical_size(),
        });
    }
    let bytes = storage.shared(addr, FOOTER_SIZE as u64)?;
    Footer::from_bytes(&bytes)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Iterator over the footer chain, newest first.
#[derive(Debug)]
pub struct FooterChain<'a> {
    db: &'a Database,
    next: Address,
}

impl Iterator for FooterChain<'_> {
    type Item = Result<(Address, Footer)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let addr = self.next;
        match self.db.read_footer(addr) {
            Ok(footer) => {
                self.next = footer.prev();
                Some(Ok((addr, footer)))
            }
            Err(err) => {
                self.next = Address::NULL;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let db = Database::create(&path).unwrap();
        let genesis_tip = db.tip();
        assert_eq!(db.footer().unwrap().generation(), 0);
        db.close().unwrap();

        let db = Database::open(&path, AccessMode::ReadOnly).unwrap();
        assert_eq!(db.tip(), genesis_tip);
        assert_eq!(db.footers().count(), 1);
    }

    #[test]
    fn open_rejects_non_store_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(Database::open(&path, AccessMode::ReadOnly).is_err());
    }

    #[test]
    fn read_only_handles_refuse_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        Database::create(&path).unwrap().close().unwrap();

        let db = Database::open(&path, AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            db.begin().err(),
            Some(Error::ReadOnlyViolation { .. })
        ));
    }

    #[test]
    fn getro_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("store.db")).unwrap();
        let past_end = Address::new(1 << 40);
        assert!(matches!(
            db.getro(past_end, 1),
            Err(Error::BadAddress { .. })
        ));
    }
}
