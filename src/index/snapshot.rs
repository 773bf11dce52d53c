//! Read-only snapshots.
//!
//! A snapshot pins one published manifest and the files it references
//! (via the engine's per-file refcounts) for the duration of a set of
//! reads. Snapshots are fully parallel with writers and with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use super::db::Database;
use super::item::{merge_item_readers, ItemReader};
use super::manifest::Manifest;

use crate::error::{FpindexError, Result};

/// A consistent read-only view of the index.
pub struct Snapshot {
    manifest: Arc<Manifest>,
    db: Option<Database>,
}

impl Snapshot {
    pub(crate) fn new(manifest: Arc<Manifest>, db: Database) -> Self {
        Self {
            manifest,
            db: Some(db),
        }
    }

    pub(crate) fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Count hits per document for the given terms. The result maps each
    /// matching doc id to the number of query terms it contains. Segments
    /// are searched in parallel.
    pub fn search(&self, query: &[u32]) -> Result<HashMap<u32, u32>> {
        let mut sorted = query.to_vec();
        sorted.sort_unstable();

        let segments: Vec<_> = self.manifest.segments.values().collect();

        let results: Vec<Result<HashMap<u32, u32>>> = thread::scope(|scope| {
            let handles: Vec<_> = segments
                .iter()
                .map(|segment| {
                    let sorted = &sorted;
                    scope.spawn(move || {
                        let mut hits: HashMap<u32, u32> = HashMap::new();
                        segment.search(sorted, &mut |doc_id| {
                            *hits.entry(doc_id).or_insert(0) += 1;
                        })?;
                        Ok(hits)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(FpindexError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "segment search worker panicked",
                        )))
                    })
                })
                .collect()
        });

        let mut hits: HashMap<u32, u32> = HashMap::new();
        for result in results {
            for (doc_id, count) in result? {
                *hits.entry(doc_id).or_insert(0) += count;
            }
        }
        Ok(hits)
    }

    /// Iterate over all live items in the snapshot in `(term, doc_id)`
    /// order.
    pub fn reader(&self) -> Box<dyn ItemReader> {
        let readers: Vec<Box<dyn ItemReader>> = self
            .manifest
            .segments
            .values()
            .map(|segment| Box::new(segment.reader()) as Box<dyn ItemReader>)
            .collect();
        merge_item_readers(readers)
    }

    pub fn num_docs(&self) -> usize {
        self.manifest.num_docs
    }

    pub fn num_deleted_docs(&self) -> usize {
        self.manifest.num_deleted_docs
    }

    pub fn num_segments(&self) -> usize {
        self.manifest.segments.len()
    }

    /// Check whether the snapshot contains a live copy of `doc_id`.
    pub fn contains(&self, doc_id: u32) -> bool {
        self.manifest
            .segments
            .values()
            .any(|segment| segment.contains(doc_id))
    }

    /// Release the snapshot's file references. Idempotent; also invoked
    /// on drop.
    pub fn close(&mut self) {
        if let Some(db) = self.db.take() {
            db.release_snapshot(&self.manifest);
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.close();
    }
}
