//! Persistent inverted index over 32-bit integer terms.
//!
//! The underlying structure is essentially a u32 -> u32 (term -> doc id)
//! multimap, stored as immutable block-packed segments under a versioned
//! manifest, with snapshot isolation for readers and a single rebasing
//! writer.

mod db;
mod item;
mod manifest;
mod merge;
mod segment;
mod snapshot;
mod txn;

pub use db::*;
pub use item::*;
pub use manifest::*;
pub use merge::*;
pub use segment::*;
pub use snapshot::*;
pub use txn::*;

use std::collections::HashMap;

use crate::error::Result;

/// Read side of the internal protocol.
pub trait Searcher {
    /// Count hits per document for a set of terms.
    fn search(&self, terms: &[u32]) -> Result<HashMap<u32, u32>>;
}

impl Searcher for Database {
    fn search(&self, terms: &[u32]) -> Result<HashMap<u32, u32>> {
        Database::search(self, terms)
    }
}

impl Searcher for Snapshot {
    fn search(&self, terms: &[u32]) -> Result<HashMap<u32, u32>> {
        Snapshot::search(self, terms)
    }
}

/// Write side of the internal protocol.
pub trait Writer {
    /// Add a document to the index. An existing document with the same id
    /// is replaced.
    fn add(&mut self, doc_id: u32, terms: &[u32]) -> Result<()>;

    /// Replace a document.
    fn update(&mut self, doc_id: u32, terms: &[u32]) -> Result<()>;

    /// Delete a document from the index.
    fn delete(&mut self, doc_id: u32) -> Result<()>;

    /// Drop all documents.
    fn delete_all(&mut self) -> Result<()>;
}

/// A writer whose operations apply atomically on commit.
pub trait BulkWriter: Writer {
    /// Atomically apply all previous operations to the index.
    fn commit(&mut self) -> Result<()>;

    /// Close the writer, discarding uncommitted work.
    fn close(&mut self) -> Result<()>;
}

impl Writer for Transaction {
    fn add(&mut self, doc_id: u32, terms: &[u32]) -> Result<()> {
        Transaction::add(self, doc_id, terms)
    }

    fn update(&mut self, doc_id: u32, terms: &[u32]) -> Result<()> {
        Transaction::update(self, doc_id, terms)
    }

    fn delete(&mut self, doc_id: u32) -> Result<()> {
        Transaction::delete(self, doc_id)
    }

    fn delete_all(&mut self) -> Result<()> {
        Transaction::delete_all(self)
    }
}

impl BulkWriter for Transaction {
    fn commit(&mut self) -> Result<()> {
        Transaction::commit(self)
    }

    fn close(&mut self) -> Result<()> {
        Transaction::close(self)
    }
}
