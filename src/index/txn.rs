//! Write transactions.
//!
//! A transaction buffers `(doc_id, terms)` writes in memory, spills full
//! buffers to new segment files on background threads, and publishes all
//! of it atomically at commit. Exactly one transaction is active at a
//! time; concurrent readers are unaffected until the commit swaps the
//! manifest pointer.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

use super::db::Database;
use super::item::{ItemBuffer, ItemReader};
use super::manifest::Manifest;
use super::segment::Segment;
use super::snapshot::Snapshot;
use crate::error::{FpindexError, Result};

/// A single write session against the index.
pub struct Transaction {
    db: Database,
    snapshot: Snapshot,
    manifest: Manifest,
    buffer: ItemBuffer,
    results_tx: Sender<Result<Segment>>,
    results_rx: Receiver<Result<Segment>>,
    builders: Vec<JoinHandle<()>>,
    build_error: Option<FpindexError>,
    /// Every segment this transaction wrote, for orphan cleanup if it
    /// never gets published.
    created: Vec<Segment>,
    committed: bool,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(db: Database, snapshot: Snapshot) -> Self {
        let manifest = snapshot.manifest().clone_for_update();
        let (results_tx, results_rx) = unbounded();
        Self {
            db,
            snapshot,
            manifest,
            buffer: ItemBuffer::new(),
            results_tx,
            results_rx,
            builders: Vec::new(),
            build_error: None,
            created: Vec::new(),
            committed: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.committed {
            return Err(FpindexError::TransactionDone);
        }
        Ok(())
    }

    /// Add a document. An existing copy of the document inside this
    /// transaction's buffer is replaced.
    pub fn add(&mut self, doc_id: u32, terms: &[u32]) -> Result<()> {
        self.ensure_open()?;
        self.buffer.delete(doc_id);
        self.buffer.add(doc_id, terms);
        if self.buffer.num_items() > self.db.config().max_buffered_items {
            self.flush()?;
        }
        Ok(())
    }

    /// Replace a document: equivalent to a delete followed by an add
    /// within the same transaction.
    pub fn update(&mut self, doc_id: u32, terms: &[u32]) -> Result<()> {
        self.delete(doc_id)?;
        self.add(doc_id, terms)
    }

    /// Delete a document, both from the in-memory buffer and from all
    /// segments of the transaction's manifest.
    pub fn delete(&mut self, doc_id: u32) -> Result<()> {
        self.ensure_open()?;
        self.buffer.delete(doc_id);
        self.manifest.delete(doc_id);
        Ok(())
    }

    /// Drop everything: buffered writes and all segments.
    pub fn delete_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.buffer.reset();
        self.manifest.delete_all();
        debug!("removed all segments");
        Ok(())
    }

    /// Build a segment synchronously from an already-sorted item stream
    /// and add it to the transaction. Bulk-load path.
    pub fn import(&mut self, stream: &mut dyn ItemReader) -> Result<()> {
        self.ensure_open()?;
        let segment = self.db.create_segment(stream)?;
        self.created.push(segment.clone());
        self.manifest.add_segment(segment);
        Ok(())
    }

    /// Spill the current buffer into an asynchronous segment build and
    /// absorb any builds that finished in the meantime.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.drain_completed();

        if self.buffer.is_empty() {
            return Ok(());
        }

        let buffer = std::mem::take(&mut self.buffer);
        let db = self.db.clone();
        let results_tx = self.results_tx.clone();
        self.builders.push(thread::spawn(move || {
            let result = db.create_segment(&mut buffer.into_reader());
            let _ = results_tx.send(result);
        }));
        Ok(())
    }

    fn drain_completed(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            match result {
                Ok(segment) => {
                    self.created.push(segment.clone());
                    self.manifest.add_segment(segment);
                }
                Err(err) => {
                    if self.build_error.is_none() {
                        self.build_error = Some(err);
                    }
                }
            }
        }
    }

    fn wait_for_builds(&mut self) {
        for handle in self.builders.drain(..) {
            if handle.join().is_err() && self.build_error.is_none() {
                self.build_error = Some(FpindexError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "segment build worker panicked",
                )));
            }
        }
        self.drain_completed();
    }

    /// Apply all of the transaction's operations atomically. On conflict
    /// the transaction stays open and can be retried or closed.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.wait_for_builds();
        if let Some(err) = self.build_error.take() {
            return Err(FpindexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("commit failed: segment writer failed: {err}"),
            )));
        }

        let manifest = self.manifest.clone();
        let published = self.db.commit_with(move |_base| Ok(manifest))?;
        self.committed = true;

        // segments built but not part of the published manifest (replaced
        // or wiped within this transaction) are garbage now
        for segment in &self.created {
            if !published.segments.contains_key(&segment.id) {
                let _ = self.db.discard_segment(segment);
            }
        }

        self.db.schedule_auto_compact();
        Ok(())
    }

    /// Whether this transaction has been committed.
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Close the transaction. Without a prior commit, all segments it
    /// built are discarded. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.wait_for_builds();

        if !self.committed {
            for segment in &self.created {
                let _ = self.db.discard_segment(segment);
            }
        }

        self.snapshot.close();
        self.db.release_transaction();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
