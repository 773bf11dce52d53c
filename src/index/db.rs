//! The database engine.
//!
//! One `Database` owns a directory: the published manifest (an atomic
//! pointer readers clone per snapshot), the per-file reference counts
//! that keep segment files alive while any snapshot uses them, a
//! deletion worker that removes files whose refcount dropped to zero,
//! and the write-transaction lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::item::ItemReader;
use super::manifest::Manifest;
use super::merge::{MergePolicy, TieredMergePolicy};
use super::segment::Segment;
use super::snapshot::Snapshot;
use super::txn::Transaction;
use crate::config::DatabaseConfig;
use crate::error::{FpindexError, Result};
use crate::vfs::{FileSystem, LockGuard};

const WRITE_LOCK_NAME: &str = "write.lock";

struct DbState {
    refs: HashMap<String, usize>,
    wlock: Option<Box<dyn LockGuard>>,
    orphaned_tx: Option<Sender<String>>,
    cleaner: Option<JoinHandle<()>>,
    compactor: Option<JoinHandle<()>>,
    txn_active: bool,
    closed: bool,
}

struct DatabaseInner {
    fs: Arc<dyn FileSystem>,
    config: DatabaseConfig,
    merge_policy: TieredMergePolicy,
    manifest: ArcSwap<Manifest>,
    txid: AtomicU32,
    num_snapshots: AtomicI64,
    num_transactions: AtomicI64,
    state: Mutex<DbState>,
}

/// Handle to an opened index directory. Cheap to clone; all clones share
/// the same engine state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open a database, optionally creating an empty one if the directory
    /// holds no manifest.
    pub fn open(fs: Arc<dyn FileSystem>, create: bool) -> Result<Database> {
        Self::open_with_config(fs, create, DatabaseConfig::default())
    }

    pub fn open_with_config(
        fs: Arc<dyn FileSystem>,
        create: bool,
        config: DatabaseConfig,
    ) -> Result<Database> {
        let mut manifest = Manifest::load(&*fs, create)?;
        for segment in manifest.segments.values_mut() {
            segment.open(&*fs)?;
        }

        let (orphaned_tx, orphaned_rx) = unbounded::<String>();
        let cleaner = thread::spawn({
            let fs = fs.clone();
            move || {
                for name in orphaned_rx {
                    match fs.remove(&name) {
                        Ok(()) => debug!(file = %name, "deleted file"),
                        Err(err) => warn!(file = %name, error = %err, "failed to delete file"),
                    }
                }
            }
        });

        let mut refs = HashMap::new();
        for segment in manifest.segments.values() {
            for name in segment.file_names() {
                *refs.entry(name).or_insert(0) += 1;
            }
        }

        let txid = manifest.id;
        let db = Database {
            inner: Arc::new(DatabaseInner {
                fs,
                config,
                merge_policy: TieredMergePolicy::default(),
                manifest: ArcSwap::from_pointee(manifest),
                txid: AtomicU32::new(txid),
                num_snapshots: AtomicI64::new(0),
                num_transactions: AtomicI64::new(0),
                state: Mutex::new(DbState {
                    refs,
                    wlock: None,
                    orphaned_tx: Some(orphaned_tx),
                    cleaner: Some(cleaner),
                    compactor: None,
                    txn_active: false,
                    closed: false,
                }),
            }),
        };
        Ok(db)
    }

    /// Close the database: stop the background workers and release the
    /// write lock. Idempotent.
    pub fn close(&self) {
        let (cleaner, compactor) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.orphaned_tx = None;
            if state.wlock.take().is_some() {
                info!("released write lock");
            }
            (state.cleaner.take(), state.compactor.take())
        };
        if let Some(handle) = compactor {
            let _ = handle.join();
        }
        if let Some(handle) = cleaner {
            let _ = handle.join();
        }
    }

    pub(crate) fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Create a consistent read-only view of the index.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FpindexError::AlreadyClosed);
        }
        let manifest = self.inner.manifest.load_full();
        inc_file_refs(&mut state, &manifest);
        drop(state);

        let count = self.inner.num_snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(manifest = manifest.id, open = count, "created snapshot");
        Ok(Snapshot::new(manifest, self.clone()))
    }

    pub(crate) fn release_snapshot(&self, manifest: &Manifest) {
        let mut state = self.inner.state.lock();
        dec_file_refs(&mut state, manifest);
        drop(state);
        self.inner.num_snapshots.fetch_sub(1, Ordering::SeqCst);
    }

    /// Start a new write transaction. Changes become visible only after
    /// an explicit commit.
    pub fn transaction(&self) -> Result<Transaction> {
        let snapshot = self.snapshot()?;

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FpindexError::AlreadyClosed);
        }
        if state.txn_active {
            return Err(FpindexError::Conflict(
                "another write transaction is active".into(),
            ));
        }
        if state.wlock.is_none() {
            let lock = self.inner.fs.lock(WRITE_LOCK_NAME)?;
            info!("acquired write lock");
            state.wlock = Some(lock);
        }
        state.txn_active = true;
        drop(state);

        self.inner.num_transactions.fetch_add(1, Ordering::SeqCst);
        debug!(base = snapshot.manifest().id, "created transaction");
        Ok(Transaction::new(self.clone(), snapshot))
    }

    pub(crate) fn release_transaction(&self) {
        let mut state = self.inner.state.lock();
        state.txn_active = false;
        drop(state);
        self.inner.num_transactions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run `f` inside a transaction and commit if it succeeds.
    pub fn run_in_transaction<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut txn = self.transaction()?;
        let result = f(&mut txn).and_then(|_| txn.commit());
        let close_result = txn.close();
        result.and(close_result)
    }

    /// Add a document in its own transaction. An existing document with
    /// the same id is replaced.
    pub fn add(&self, doc_id: u32, terms: &[u32]) -> Result<()> {
        self.run_in_transaction(|txn| txn.add(doc_id, terms))
    }

    /// Replace a document in its own transaction.
    pub fn update(&self, doc_id: u32, terms: &[u32]) -> Result<()> {
        self.run_in_transaction(|txn| txn.update(doc_id, terms))
    }

    /// Delete a document in its own transaction.
    pub fn delete(&self, doc_id: u32) -> Result<()> {
        self.run_in_transaction(|txn| txn.delete(doc_id))
    }

    /// Drop all documents in one transaction.
    pub fn delete_all(&self) -> Result<()> {
        self.run_in_transaction(|txn| txn.delete_all())
    }

    /// Bulk-load a sorted item stream in its own transaction.
    pub fn import(&self, stream: &mut dyn ItemReader) -> Result<()> {
        self.run_in_transaction(|txn| txn.import(stream))
    }

    /// Count hits per document for the given terms.
    pub fn search(&self, query: &[u32]) -> Result<HashMap<u32, u32>> {
        self.snapshot()?.search(query)
    }

    /// Iterate over all live items in the index. The returned reader
    /// keeps a snapshot (and therefore the underlying files) alive.
    pub fn reader(&self) -> Result<DatabaseItemReader> {
        let snapshot = self.snapshot()?;
        Ok(DatabaseItemReader {
            inner: snapshot.reader(),
            _snapshot: snapshot,
        })
    }

    pub fn num_docs(&self) -> usize {
        self.inner.manifest.load().num_docs
    }

    pub fn num_deleted_docs(&self) -> usize {
        self.inner.manifest.load().num_deleted_docs
    }

    pub fn num_segments(&self) -> usize {
        self.inner.manifest.load().segments.len()
    }

    /// Check whether the index contains a live copy of `doc_id`.
    pub fn contains(&self, doc_id: u32) -> bool {
        self.inner
            .manifest
            .load()
            .segments
            .values()
            .any(|segment| segment.contains(doc_id))
    }

    /// Number of currently open snapshots.
    pub fn num_snapshots(&self) -> i64 {
        self.inner.num_snapshots.load(Ordering::SeqCst)
    }

    /// Number of currently open transactions.
    pub fn num_transactions(&self) -> i64 {
        self.inner.num_transactions.load(Ordering::SeqCst)
    }

    /// Build a new segment from a sorted item stream, minting its id from
    /// the transaction counter.
    pub(crate) fn create_segment(&self, input: &mut dyn ItemReader) -> Result<Segment> {
        let id = self.inner.txid.fetch_add(1, Ordering::SeqCst) + 1;
        Segment::create(&*self.inner.fs, id, input)
    }

    /// Queue the files of an unpublished segment for deletion.
    pub(crate) fn discard_segment(&self, segment: &Segment) -> Result<()> {
        let state = self.inner.state.lock();
        for name in segment.file_names() {
            if state.refs.contains_key(&name) {
                continue;
            }
            match &state.orphaned_tx {
                Some(tx) => {
                    let _ = tx.send(name);
                }
                None => self.inner.fs.remove(&name)?,
            }
        }
        Ok(())
    }

    /// Publish a new manifest. `prepare` receives the currently published
    /// base and returns the manifest to commit; the engine rebases it,
    /// swaps the manifest pointer and exchanges the file references, all
    /// under the engine mutex.
    pub(crate) fn commit_with<F>(&self, prepare: F) -> Result<Arc<Manifest>>
    where
        F: FnOnce(&Manifest) -> Result<Manifest>,
    {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(FpindexError::AlreadyClosed);
        }

        let base = self.inner.manifest.load_full();
        let mut manifest = prepare(&base)?;
        if !manifest.has_changes() {
            return Ok(base);
        }

        let id = self.inner.txid.fetch_add(1, Ordering::SeqCst) + 1;
        manifest.commit(&*self.inner.fs, id, Some(&*base))?;

        let published = Arc::new(manifest);
        inc_file_refs(&mut state, &published);
        dec_file_refs(&mut state, &base);
        self.inner.manifest.store(published.clone());

        info!(
            manifest = published.id,
            docs = published.num_live_docs(),
            items = published.num_items,
            segments = published.segments.len(),
            checksum = published.checksum,
            "committed transaction"
        );
        Ok(published)
    }

    /// Run the merge policy until the index needs no further merging.
    pub fn compact(&self) -> Result<()> {
        loop {
            let manifest = self.inner.manifest.load_full();
            let Some(mut merge) = self
                .inner
                .merge_policy
                .find_best_merge(&manifest, 0)
            else {
                return Ok(());
            };
            merge.run(self)?;
        }
    }

    /// Kick off a background compaction pass unless one is still running.
    pub(crate) fn schedule_auto_compact(&self) {
        if !self.inner.config.enable_auto_compact {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        if let Some(handle) = &state.compactor {
            if !handle.is_finished() {
                return;
            }
            let _ = state.compactor.take().map(JoinHandle::join);
        }
        let db = self.clone();
        state.compactor = Some(thread::spawn(move || {
            if let Err(err) = db.compact() {
                warn!(error = %err, "background compaction failed");
            }
        }));
    }
}

fn inc_file_refs(state: &mut DbState, manifest: &Manifest) {
    for segment in manifest.segments.values() {
        for name in segment.file_names() {
            *state.refs.entry(name).or_insert(0) += 1;
        }
    }
}

fn dec_file_refs(state: &mut DbState, manifest: &Manifest) {
    for segment in manifest.segments.values() {
        for name in segment.file_names() {
            let remove = match state.refs.get_mut(&name) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if remove {
                state.refs.remove(&name);
                debug!(file = %name, "file is no longer needed");
                if let Some(tx) = &state.orphaned_tx {
                    let _ = tx.send(name);
                }
            }
        }
    }
}

/// Item reader that owns the snapshot backing it.
pub struct DatabaseItemReader {
    inner: Box<dyn ItemReader>,
    _snapshot: Snapshot,
}

impl ItemReader for DatabaseItemReader {
    fn read_block(&mut self) -> Result<Option<Vec<super::item::Item>>> {
        self.inner.read_block()
    }
}
