//! # Store Round-Trip Tests
//!
//! End-to-end scenarios over a real file:
//!
//! 1. An empty commit leaves a two-footer chain (genesis plus the empty
//!    transaction) and four empty indexes.
//! 2. A single digest insert survives close and reopen, and the extent it
//!    maps to reads back byte-for-byte.
//! 3. Allocations that never commit are invisible after reopen: the
//!    published tip still names the previous footer ("crash" simulated by
//!    leaking the transaction so its implicit abort never runs).
//! 4. Index structure is observable through header blocks: one key makes
//!    the root a leaf, a second (distinct-hash) key makes it a branch.

use pstore::index::HeaderBlock;
use pstore::{AccessMode, Database, Digest, Extent, IndexKind};

fn store_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("artifacts.db")
}

#[test]
fn empty_store_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    {
        let db = Database::create(&path).unwrap();
        let txn = db.begin().unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, AccessMode::ReadOnly).unwrap();
    let chain: Vec<_> = db
        .footers()
        .collect::<pstore::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chain.len(), 2, "genesis + empty commit");
    assert_eq!(chain[0].1.generation(), 1);
    assert_eq!(chain[1].1.generation(), 0);
    assert!(chain[1].1.prev().is_null());

    assert!(db.fragment_index().unwrap().is_empty());
    assert!(db.compilation_index().unwrap().is_empty());
    assert!(db.debug_line_index().unwrap().is_empty());
    assert!(db.name_index().unwrap().is_empty());
}

#[test]
fn single_digest_insert_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let digest = Digest::new(0xDEAD_BEEF_CAFE_BABE, 0x0123_4567_89AB_CDEF);
    let payload: Vec<u8> = (0u8..16).collect();

    {
        let db = Database::create(&path).unwrap();
        let mut txn = db.begin().unwrap();
        let mut fragments = db.fragment_index().unwrap();

        let body = txn.alloc_and_write(&payload, 1).unwrap();
        let (_, inserted) = fragments
            .insert(&mut txn, &digest, &Extent::new(body, 16))
            .unwrap();
        assert!(inserted);

        fragments.flush(&mut txn).unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, AccessMode::ReadOnly).unwrap();
    let fragments = db.fragment_index().unwrap();
    assert_eq!(fragments.len(), 1);

    let (key, extent) = fragments.find(&db, &digest).unwrap().expect("digest present");
    assert_eq!(key, digest);
    assert_eq!(extent.size, 16);
    let view = db.getro(extent.addr, extent.size).unwrap();
    assert_eq!(&*view, &payload[..]);
}

#[test]
fn latest_value_wins_for_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::create(store_path(&dir)).unwrap();
    let digest = Digest::new(1, 2);

    let mut txn = db.begin().unwrap();
    let mut fragments = db.fragment_index().unwrap();

    let first = txn.alloc_and_write(b"first", 1).unwrap();
    fragments
        .insert(&mut txn, &digest, &Extent::new(first, 5))
        .unwrap();

    // Plain insert refuses to replace.
    let second = txn.alloc_and_write(b"second", 1).unwrap();
    let (_, inserted) = fragments
        .insert(&mut txn, &digest, &Extent::new(second, 6))
        .unwrap();
    assert!(!inserted);
    let (_, extent) = fragments
        .find_in(pstore::index::IndexContext::new(&db), &digest)
        .unwrap()
        .unwrap();
    assert_eq!(extent.size, 5);

    // Upsert does.
    let (_, inserted) = fragments
        .insert_or_assign(&mut txn, &digest, &Extent::new(second, 6))
        .unwrap();
    assert!(!inserted);
    assert_eq!(fragments.len(), 1);

    fragments.flush(&mut txn).unwrap();
    txn.commit().unwrap();

    let (_, extent) = fragments.find(&db, &digest).unwrap().unwrap();
    assert_eq!(extent.addr, second);
    assert_eq!(extent.size, 6);
}

#[test]
fn uncommitted_allocations_are_invisible_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let digest = Digest::new(0xAAAA, 0xBBBB);

    let committed_tip;
    {
        let db = Database::create(&path).unwrap();
        let txn = db.begin().unwrap();
        committed_tip = txn.commit().unwrap();

        let mut txn = db.begin().unwrap();
        let mut fragments = db.fragment_index().unwrap();
        for n in 0..32u64 {
            let body = txn.alloc_and_write(&n.to_le_bytes(), 1).unwrap();
            fragments
                .insert(&mut txn, &Digest::new(n, n), &Extent::new(body, 8))
                .unwrap();
        }
        let body = txn.alloc_and_write(b"doomed", 1).unwrap();
        fragments
            .insert(&mut txn, &digest, &Extent::new(body, 6))
            .unwrap();
        fragments.flush(&mut txn).unwrap();

        // Simulate a crash: the implicit abort never runs, the footer is
        // never written, the handle simply goes away.
        std::mem::forget(txn);
        db.close().unwrap();
    }

    let db = Database::open(&path, AccessMode::Writable).unwrap();
    assert_eq!(db.tip(), committed_tip);
    assert_eq!(db.footers().count(), 2);

    let fragments = db.fragment_index().unwrap();
    assert!(fragments.is_empty());
    assert!(fragments.find(&db, &digest).unwrap().is_none());

    // The store is still writable after the lost transaction.
    let mut txn = db.begin().unwrap();
    let mut fragments = db.fragment_index().unwrap();
    let body = txn.alloc_and_write(b"survivor", 1).unwrap();
    fragments
        .insert(&mut txn, &digest, &Extent::new(body, 8))
        .unwrap();
    fragments.flush(&mut txn).unwrap();
    txn.commit().unwrap();
    assert!(fragments.find(&db, &digest).unwrap().is_some());
}

#[test]
fn root_grows_from_leaf_to_branch() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::create(store_path(&dir)).unwrap();

    let mut txn = db.begin().unwrap();
    let mut fragments = db.fragment_index().unwrap();
    let body = txn.alloc_and_write(b"x", 1).unwrap();

    fragments
        .insert(&mut txn, &Digest::new(1, 1), &Extent::new(body, 1))
        .unwrap();
    let block_addr = fragments.flush(&mut txn).unwrap();
    let block = HeaderBlock::load(&db, block_addr).unwrap();
    assert_eq!(block.size(), 1);
    assert_eq!(block.root() & 1, 0, "single entry: the root is a leaf");

    fragments
        .insert(&mut txn, &Digest::new(2, 2), &Extent::new(body, 1))
        .unwrap();
    let block_addr = fragments.flush(&mut txn).unwrap();
    let block = HeaderBlock::load(&db, block_addr).unwrap();
    assert_eq!(block.size(), 2);
    assert_eq!(block.root() & 1, 1, "two entries: the root is internal");

    txn.commit().unwrap();
}

#[test]
fn many_keys_across_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);

    {
        let db = Database::create(&path).unwrap();
        for round in 0..2u64 {
            let mut txn = db.begin().unwrap();
            let mut fragments = db.fragment_index().unwrap();
            for n in 0..100u64 {
                let key = Digest::new(round, n);
                let body = txn.alloc_and_write(&(round * 1000 + n).to_le_bytes(), 1).unwrap();
                let (_, inserted) = fragments
                    .insert(&mut txn, &key, &Extent::new(body, 8))
                    .unwrap();
                assert!(inserted);
            }
            fragments.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(&path, AccessMode::ReadOnly).unwrap();
    let fragments = db.fragment_index().unwrap();
    assert_eq!(fragments.len(), 200);

    for round in 0..2u64 {
        for n in 0..100u64 {
            let (_, extent) = fragments
                .find(&db, &Digest::new(round, n))
                .unwrap()
                .unwrap_or_else(|| panic!("digest {round}/{n} missing"));
            let view = db.getro(extent.addr, extent.size).unwrap();
            assert_eq!(&*view, &(round * 1000 + n).to_le_bytes());
        }
    }

    // Misses stay misses.
    assert!(fragments.find(&db, &Digest::new(9, 9)).unwrap().is_none());

    // The iterator visits every leaf exactly once.
    let leaves: Vec<_> = fragments
        .iter(&db)
        .collect::<pstore::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(leaves.len(), 200);
}

#[test]
fn generations_count_up_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::create(store_path(&dir)).unwrap();

    for expected in 1..=5u64 {
        let txn = db.begin().unwrap();
        assert_eq!(txn.generation(), expected);
        txn.commit().unwrap();
    }
    assert_eq!(db.footer().unwrap().generation(), 5);
    assert_eq!(db.footers().count(), 6);

    // Kind slots are stable across the chain.
    assert_eq!(IndexKind::Fragment.slot(), 0);
    assert_eq!(IndexKind::Name.slot(), 3);
}
