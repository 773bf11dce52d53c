//! Small shared utilities: varint coding and the sparse doc-id bitset.

mod bitset;
mod varint;

pub use bitset::*;
pub use varint::*;
