//! Sparse bitset over u32 values.
//!
//! The set is sharded into fixed 2048-bit blocks (32 x u64 words) keyed by
//! `value >> 11`, so membership updates are constant time once a block
//! exists. The binary layout written by [`SparseBitSet::write_to`] is part
//! of the segment file format: a u32 LE block count followed by, for each
//! block in ascending order, the u32 LE block index and its 32 u64 LE words.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::Result;

const WORD_BITS: u32 = 64;
const BLOCK_WORDS: usize = 32;
const BLOCK_BITS: u32 = BLOCK_WORDS as u32 * WORD_BITS;

/// An efficient set of u32 elements.
#[derive(Clone, Debug, Default)]
pub struct SparseBitSet {
    blocks: HashMap<u32, Box<[u64; BLOCK_WORDS]>>,
}

impl SparseBitSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set with capacity for roughly `size` elements.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            blocks: HashMap::with_capacity(size / BLOCK_BITS as usize + 1),
        }
    }

    /// Add `x` to the set.
    pub fn add(&mut self, x: u32) {
        let block = self
            .blocks
            .entry(x / BLOCK_BITS)
            .or_insert_with(|| Box::new([0u64; BLOCK_WORDS]));
        let j = ((x % BLOCK_BITS) / WORD_BITS) as usize;
        block[j] |= 1u64 << (x % WORD_BITS);
    }

    /// Remove `x` from the set.
    pub fn remove(&mut self, x: u32) {
        if let Some(block) = self.blocks.get_mut(&(x / BLOCK_BITS)) {
            let j = ((x % BLOCK_BITS) / WORD_BITS) as usize;
            block[j] &= !(1u64 << (x % WORD_BITS));
        }
    }

    /// Check whether the set contains `x`.
    pub fn contains(&self, x: u32) -> bool {
        match self.blocks.get(&(x / BLOCK_BITS)) {
            Some(block) => {
                let j = ((x % BLOCK_BITS) / WORD_BITS) as usize;
                block[j] & (1u64 << (x % WORD_BITS)) != 0
            }
            None => false,
        }
    }

    /// Update the set to include all elements of `other`.
    pub fn union(&mut self, other: &SparseBitSet) {
        for (&i, other_block) in &other.blocks {
            let block = self
                .blocks
                .entry(i)
                .or_insert_with(|| Box::new([0u64; BLOCK_WORDS]));
            for (word, &mask) in block.iter_mut().zip(other_block.iter()) {
                *word |= mask;
            }
        }
    }

    /// Compute the intersection with `other`, returning the new set and its
    /// element count.
    pub fn intersection(&self, other: &SparseBitSet) -> (SparseBitSet, usize) {
        let mut result = SparseBitSet::new();
        let mut count = 0usize;
        for (&i, block) in &self.blocks {
            if let Some(other_block) = other.blocks.get(&i) {
                let mut words = Box::new([0u64; BLOCK_WORDS]);
                let mut nonzero = false;
                for (j, word) in words.iter_mut().enumerate() {
                    *word = block[j] & other_block[j];
                    count += word.count_ones() as usize;
                    nonzero |= *word != 0;
                }
                if nonzero {
                    result.blocks.insert(i, words);
                }
            }
        }
        (result, count)
    }

    /// Number of elements in the set. Runs in time proportional to the
    /// number of allocated blocks.
    pub fn len(&self) -> usize {
        self.blocks
            .values()
            .map(|block| block.iter().map(|w| w.count_ones() as usize).sum::<usize>())
            .sum()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(|block| block.iter().all(|&w| w == 0))
    }

    /// Smallest element of the set, or 0 if the set is empty.
    pub fn min(&self) -> u32 {
        let mut block_indexes: Vec<u32> = self.blocks.keys().copied().collect();
        block_indexes.sort_unstable();
        for i in block_indexes {
            let block = &self.blocks[&i];
            for (j, &word) in block.iter().enumerate() {
                if word != 0 {
                    return i * BLOCK_BITS + j as u32 * WORD_BITS + word.trailing_zeros();
                }
            }
        }
        0
    }

    /// Largest element of the set, or 0 if the set is empty.
    pub fn max(&self) -> u32 {
        let mut block_indexes: Vec<u32> = self.blocks.keys().copied().collect();
        block_indexes.sort_unstable();
        for i in block_indexes.into_iter().rev() {
            let block = &self.blocks[&i];
            for (j, &word) in block.iter().enumerate().rev() {
                if word != 0 {
                    return i * BLOCK_BITS + j as u32 * WORD_BITS + 63 - word.leading_zeros();
                }
            }
        }
        0
    }

    /// Drop all-zero blocks from the set.
    pub fn compact(&mut self) {
        self.blocks.retain(|_, block| block.iter().any(|&w| w != 0));
    }

    /// Write the set to `w` in the on-disk layout.
    pub fn write_to(&mut self, w: &mut dyn Write) -> Result<()> {
        self.compact();
        let mut block_indexes: Vec<u32> = self.blocks.keys().copied().collect();
        block_indexes.sort_unstable();
        w.write_all(&(block_indexes.len() as u32).to_le_bytes())?;
        for i in block_indexes {
            w.write_all(&i.to_le_bytes())?;
            for &word in self.blocks[&i].iter() {
                w.write_all(&word.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Read a set previously written with [`SparseBitSet::write_to`].
    pub fn read_from(r: &mut dyn Read) -> Result<SparseBitSet> {
        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let n = u32::from_le_bytes(buf4);
        let mut set = SparseBitSet::with_capacity(n as usize * BLOCK_BITS as usize);
        let mut buf8 = [0u8; 8];
        for _ in 0..n {
            r.read_exact(&mut buf4)?;
            let i = u32::from_le_bytes(buf4);
            let mut words = Box::new([0u64; BLOCK_WORDS]);
            for word in words.iter_mut() {
                r.read_exact(&mut buf8)?;
                *word = u64::from_le_bytes(buf8);
            }
            set.blocks.insert(i, words);
        }
        Ok(set)
    }
}

impl FromIterator<u32> for SparseBitSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = SparseBitSet::new();
        for x in iter {
            set.add(x);
        }
        set
    }
}
