//! fpindex: an audio-fingerprint search index.
//!
//! A persistent, segmented inverted index mapping 32-bit terms to 32-bit
//! document ids, with concurrent snapshot readers, a single rebasing
//! writer and tiered background merging, plus the codec for the
//! chromaprint fingerprint wire format.

pub mod chromaprint;
pub mod config;
pub mod error;
pub mod index;
pub mod util;
pub mod vfs;

pub use config::DatabaseConfig;
pub use error::{FpindexError, Result};
pub use index::{BulkWriter, Database, ItemBuffer, Searcher, Snapshot, Transaction, Writer};
pub use vfs::{DiskFileSystem, FileSystem, MemoryFileSystem};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
