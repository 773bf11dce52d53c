//! End-to-end tests against the database engine, on both the in-memory
//! and the on-disk filesystem.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fpindex::index::{read_all_items, Item, ItemBuffer};
use fpindex::{Database, DatabaseConfig, DiskFileSystem, FileSystem, MemoryFileSystem};

fn mem_fs() -> Arc<dyn FileSystem> {
    Arc::new(MemoryFileSystem::new())
}

fn hits(pairs: &[(u32, u32)]) -> HashMap<u32, u32> {
    pairs.iter().copied().collect()
}

#[test]
fn test_single_doc_search() {
    let db = Database::open(mem_fs(), true).unwrap();

    db.add(
        1234,
        &[
            0xdcfc2563, 0xdcbc2421, 0xddbc3420, 0xdd9c1530, 0xdf9c6d40, 0x4f4ce540, 0x4f0ea5c0,
        ],
    )
    .unwrap();
    db.add(5678, &[123, 53]).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    for _ in 0..10 {
        let terms: Vec<u32> = (0..1000).map(|_| rng.gen()).collect();
        db.add(rng.gen(), &terms).unwrap();
    }

    let found = db
        .search(&[1, 2, 0xdcfc2563, 0xdcbc2421, 0xdeadbeef, 0xffffffff])
        .unwrap();
    assert_eq!(found, hits(&[(1234, 2)]));

    db.close();
}

#[test]
fn test_uncommitted_transaction_invisible() {
    let db = Database::open(mem_fs(), true).unwrap();

    let mut txn = db.transaction().unwrap();
    txn.add(1, &[7, 8, 9]).unwrap();
    txn.close().unwrap();

    assert!(db.search(&[9]).unwrap().is_empty());
    db.close();
}

#[test]
fn test_delete_inside_transaction() {
    let db = Database::open(mem_fs(), true).unwrap();

    let mut txn = db.transaction().unwrap();
    txn.add(1, &[7, 8, 9]).unwrap();
    txn.delete(1).unwrap();
    txn.commit().unwrap();
    txn.close().unwrap();

    assert!(db.search(&[9]).unwrap().is_empty());
    db.close();
}

#[test]
fn test_delete_visible_after_reopen() {
    let fs = mem_fs();

    {
        let db = Database::open(fs.clone(), true).unwrap();
        db.add(1, &[7, 8, 9]).unwrap();
        db.delete(1).unwrap();
        assert!(db.search(&[9]).unwrap().is_empty());
        db.close();
    }

    {
        let db = Database::open(fs, false).unwrap();
        assert!(db.search(&[9]).unwrap().is_empty());
        db.close();
    }
}

#[test]
fn test_update_semantics() {
    let fs = mem_fs();

    {
        let db = Database::open(fs.clone(), true).unwrap();
        db.add(1, &[7, 8, 9]).unwrap();
        db.update(1, &[3, 4, 5]).unwrap();

        assert!(db.search(&[9]).unwrap().is_empty());
        assert_eq!(db.search(&[3]).unwrap(), hits(&[(1, 1)]));
        db.close();
    }

    {
        let db = Database::open(fs, false).unwrap();
        assert!(db.search(&[9]).unwrap().is_empty());
        assert_eq!(db.search(&[3]).unwrap(), hits(&[(1, 1)]));
        db.close();
    }
}

#[test]
fn test_delete_all() {
    let fs = mem_fs();

    {
        let db = Database::open(fs.clone(), true).unwrap();
        db.add(1, &[7, 8, 9]).unwrap();
        db.add(2, &[3, 4, 5]).unwrap();
        db.delete_all().unwrap();
        assert!(db.search(&[7, 8, 9, 3, 4, 5]).unwrap().is_empty());
        db.close();
    }

    {
        let db = Database::open(fs, false).unwrap();
        assert!(db.search(&[7, 8, 9, 3, 4, 5]).unwrap().is_empty());
        db.close();
    }
}

#[test]
fn test_bulk_import() {
    let db = Database::open(mem_fs(), true).unwrap();

    let mut buffer = ItemBuffer::new();
    buffer.add(1, &[7, 8, 9]);
    buffer.add(2, &[3, 4, 5]);
    db.import(&mut buffer.into_reader()).unwrap();

    let found = db.search(&[3, 4, 5, 7, 8, 9]).unwrap();
    assert_eq!(found, hits(&[(1, 3), (2, 3)]));
    db.close();
}

#[test]
fn test_reader_yields_sorted_live_items() {
    let db = Database::open(mem_fs(), true).unwrap();

    db.add(1, &[7, 8, 9]).unwrap();
    db.add(2, &[3, 4, 5]).unwrap();

    let mut reader = db.reader().unwrap();
    let items = read_all_items(&mut reader).unwrap();
    assert_eq!(
        items,
        vec![
            Item::new(3, 2),
            Item::new(4, 2),
            Item::new(5, 2),
            Item::new(7, 1),
            Item::new(8, 1),
            Item::new(9, 1),
        ]
    );
    db.close();
}

#[test]
fn test_contains_and_stats() {
    let db = Database::open(mem_fs(), true).unwrap();

    db.add(1, &[7, 8]).unwrap();
    db.add(2, &[9]).unwrap();
    assert!(db.contains(1));
    assert!(db.contains(2));
    assert!(!db.contains(3));
    assert_eq!(db.num_docs(), 2);
    assert_eq!(db.num_deleted_docs(), 0);

    db.delete(1).unwrap();
    assert!(!db.contains(1));
    assert_eq!(db.num_deleted_docs(), 1);
    db.close();
}

#[test]
fn test_snapshot_stability_across_commits() {
    let db = Database::open(mem_fs(), true).unwrap();

    db.add(1, &[7, 8, 9]).unwrap();
    let snapshot = db.snapshot().unwrap();
    let before = snapshot.search(&[7, 8, 9]).unwrap();

    db.update(1, &[3, 4, 5]).unwrap();
    db.add(2, &[7]).unwrap();

    let after = snapshot.search(&[7, 8, 9]).unwrap();
    assert_eq!(before, after, "snapshot must not observe later commits");
    assert_eq!(after, hits(&[(1, 3)]));

    // a fresh snapshot sees the new state
    assert_eq!(db.search(&[7, 8, 9]).unwrap(), hits(&[(2, 1)]));

    drop(snapshot);
    db.close();
}

#[test]
fn test_transaction_is_exclusive() {
    let db = Database::open(mem_fs(), true).unwrap();

    let txn = db.transaction().unwrap();
    assert!(db.transaction().is_err());
    drop(txn);

    let mut txn = db.transaction().unwrap();
    txn.add(1, &[1]).unwrap();
    txn.commit().unwrap();
    txn.close().unwrap();
    db.close();
}

#[test]
fn test_transaction_done_after_commit() {
    let db = Database::open(mem_fs(), true).unwrap();

    let mut txn = db.transaction().unwrap();
    txn.add(1, &[1]).unwrap();
    txn.commit().unwrap();
    assert!(txn.add(2, &[2]).is_err());
    assert!(txn.commit().is_err());
    txn.close().unwrap();
    db.close();
}

#[test]
fn test_orphaned_files_removed_after_abort() {
    let fs = MemoryFileSystem::new();
    let db = Database::open(Arc::new(fs.clone()), true).unwrap();

    let mut txn = db.transaction().unwrap();
    let mut buffer = ItemBuffer::new();
    buffer.add(1, &[1, 2, 3]);
    txn.import(&mut buffer.into_reader()).unwrap();
    txn.close().unwrap();

    db.close();

    let names = fs.list_files().unwrap();
    assert!(
        names.iter().all(|name| !name.ends_with(".dat")),
        "aborted segment files must be cleaned up, found {names:?}"
    );
}

#[test]
fn test_old_segment_files_removed_after_update() {
    let fs = MemoryFileSystem::new();
    let db = Database::open_with_config(
        Arc::new(fs.clone()),
        true,
        DatabaseConfig::default().with_auto_compact(false),
    )
    .unwrap();

    db.add(1, &[1, 2, 3]).unwrap();
    db.add(2, &[4, 5, 6]).unwrap();
    db.delete_all().unwrap();
    db.close();

    let names = fs.list_files().unwrap();
    assert!(
        names.iter().all(|name| !name.ends_with(".dat")),
        "replaced segment files must be cleaned up, found {names:?}"
    );
}

#[test]
fn test_compaction_preserves_results() {
    let db = Database::open_with_config(
        mem_fs(),
        true,
        DatabaseConfig::default().with_auto_compact(false),
    )
    .unwrap();

    for doc_id in 1..=20u32 {
        db.add(doc_id, &[doc_id * 10, doc_id * 10 + 1]).unwrap();
    }
    db.delete(7).unwrap();
    assert_eq!(db.num_segments(), 20);

    db.compact().unwrap();
    assert!(db.num_segments() < 20);

    assert!(db.search(&[70]).unwrap().is_empty());
    assert_eq!(db.search(&[100, 101]).unwrap(), hits(&[(10, 2)]));
    assert_eq!(db.num_docs() - db.num_deleted_docs(), 19);
    db.close();
}

#[test]
fn test_on_disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    {
        let fs = Arc::new(DiskFileSystem::open(dir.path(), true).unwrap());
        let db = Database::open(fs, true).unwrap();
        db.add(1, &[7, 8, 9]).unwrap();
        db.add(2, &[3, 4, 5]).unwrap();
        db.delete(2).unwrap();
        db.close();
    }

    {
        let fs = Arc::new(DiskFileSystem::open(dir.path(), false).unwrap());
        let db = Database::open(fs, false).unwrap();
        assert_eq!(db.search(&[7, 8, 9]).unwrap(), hits(&[(1, 3)]));
        assert!(db.search(&[3]).unwrap().is_empty());
        db.close();
    }
}

#[test]
fn test_random_round_trip() {
    let db = Database::open(mem_fs(), true).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    // distinct docs with distinct term sets
    let mut docs: HashMap<u32, Vec<u32>> = HashMap::new();
    while docs.len() < 50 {
        let doc_id = rng.gen_range(1..1_000_000);
        let mut terms: Vec<u32> = (0..rng.gen_range(1..40)).map(|_| rng.gen()).collect();
        terms.sort_unstable();
        terms.dedup();
        docs.entry(doc_id).or_insert(terms);
    }

    db.run_in_transaction(|txn| {
        for (doc_id, terms) in &docs {
            txn.add(*doc_id, terms)?;
        }
        Ok(())
    })
    .unwrap();

    for (doc_id, terms) in &docs {
        let query: Vec<u32> = terms.iter().take(5).copied().collect();
        let found = db.search(&query).unwrap();
        assert_eq!(
            found.get(doc_id).copied(),
            Some(query.len() as u32),
            "doc {doc_id} should match its own terms"
        );
    }

    let manifest_checksum: u32 = {
        // checksum conservation: manifest checksum equals the sum over items
        let mut reader = db.reader().unwrap();
        read_all_items(&mut reader)
            .unwrap()
            .iter()
            .fold(0u32, |acc, item| {
                acc.wrapping_add(item.term).wrapping_add(item.doc_id)
            })
    };
    let expected: u32 = docs
        .iter()
        .flat_map(|(doc_id, terms)| terms.iter().map(move |t| t.wrapping_add(*doc_id)))
        .fold(0u32, |acc, x| acc.wrapping_add(x));
    assert_eq!(manifest_checksum, expected);

    db.close();
}

#[test]
fn test_delete_idempotence() {
    let db = Database::open(mem_fs(), true).unwrap();

    db.add(1, &[5, 6]).unwrap();
    db.add(2, &[5]).unwrap();
    db.delete(1).unwrap();
    db.delete(1).unwrap();

    assert_eq!(db.search(&[5, 6]).unwrap(), hits(&[(2, 1)]));
    assert_eq!(db.num_deleted_docs(), 1);
    db.close();
}
