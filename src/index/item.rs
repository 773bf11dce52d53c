//! Items and item streams.
//!
//! An [`Item`] is one `(term, doc_id)` pair of the inverted index. Streams
//! of items always flow in `(term, doc_id)` order; [`merge_item_readers`]
//! combines any number of sorted streams into one.

use crate::error::Result;
use crate::util::SparseBitSet;

/// One `(term, doc_id)` pair in the inverted index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub term: u32,
    pub doc_id: u32,
}

impl Item {
    pub fn new(term: u32, doc_id: u32) -> Self {
        Self { term, doc_id }
    }
}

/// Abstraction for iterating over items by blocks.
pub trait ItemReader: Send {
    /// Read the next block of items, or `None` at the end of the stream.
    fn read_block(&mut self) -> Result<Option<Vec<Item>>>;
}

/// Drain `reader` into a single vector.
pub fn read_all_items(reader: &mut dyn ItemReader) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    while let Some(block) = reader.read_block()? {
        items.extend_from_slice(&block);
    }
    Ok(items)
}

/// An item stream over a pre-sorted vector.
pub struct ItemSliceReader {
    items: Vec<Item>,
    done: bool,
}

impl ItemSliceReader {
    /// Create a reader over `items`, which must already be sorted by
    /// `(term, doc_id)`.
    pub fn new(items: Vec<Item>) -> Self {
        Self { items, done: false }
    }
}

impl ItemReader for ItemSliceReader {
    fn read_block(&mut self) -> Result<Option<Vec<Item>>> {
        if self.done || self.items.is_empty() {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(std::mem::take(&mut self.items)))
    }
}

/// Merge any number of sorted item streams into one sorted stream.
pub fn merge_item_readers(readers: Vec<Box<dyn ItemReader>>) -> Box<dyn ItemReader> {
    let mut readers = readers;
    match readers.len() {
        0 => Box::new(ItemSliceReader::new(Vec::new())),
        1 => readers.pop().expect("one reader"),
        2 => {
            let right = readers.pop().expect("two readers");
            let left = readers.pop().expect("two readers");
            Box::new(MergedItemReader::new(left, right))
        }
        n => {
            let tail = readers.split_off(n / 2);
            merge_item_readers(vec![merge_item_readers(readers), merge_item_readers(tail)])
        }
    }
}

const MERGE_BLOCK_SIZE: usize = 1024;

struct MergedItemReader {
    left: Option<Box<dyn ItemReader>>,
    right: Option<Box<dyn ItemReader>>,
    left_block: Vec<Item>,
    right_block: Vec<Item>,
    left_pos: usize,
    right_pos: usize,
}

impl MergedItemReader {
    fn new(left: Box<dyn ItemReader>, right: Box<dyn ItemReader>) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
            left_block: Vec::new(),
            right_block: Vec::new(),
            left_pos: 0,
            right_pos: 0,
        }
    }

    fn fill_left(&mut self) -> Result<()> {
        while self.left_pos >= self.left_block.len() {
            match &mut self.left {
                Some(reader) => match reader.read_block()? {
                    Some(block) => {
                        self.left_block = block;
                        self.left_pos = 0;
                    }
                    None => {
                        self.left = None;
                        self.left_block.clear();
                        self.left_pos = 0;
                        break;
                    }
                },
                None => break,
            }
        }
        Ok(())
    }

    fn fill_right(&mut self) -> Result<()> {
        while self.right_pos >= self.right_block.len() {
            match &mut self.right {
                Some(reader) => match reader.read_block()? {
                    Some(block) => {
                        self.right_block = block;
                        self.right_pos = 0;
                    }
                    None => {
                        self.right = None;
                        self.right_block.clear();
                        self.right_pos = 0;
                        break;
                    }
                },
                None => break,
            }
        }
        Ok(())
    }
}

impl ItemReader for MergedItemReader {
    fn read_block(&mut self) -> Result<Option<Vec<Item>>> {
        self.fill_left()?;
        self.fill_right()?;

        let left_len = self.left_block.len() - self.left_pos;
        let right_len = self.right_block.len() - self.right_pos;

        if left_len > 0 && right_len > 0 {
            let mut out = Vec::with_capacity(MERGE_BLOCK_SIZE);
            while out.len() < MERGE_BLOCK_SIZE {
                if self.left_pos >= self.left_block.len() || self.right_pos >= self.right_block.len()
                {
                    break;
                }
                let v1 = self.left_block[self.left_pos];
                let v2 = self.right_block[self.right_pos];
                if v1 <= v2 {
                    out.push(v1);
                    self.left_pos += 1;
                } else {
                    out.push(v2);
                    self.right_pos += 1;
                }
            }
            return Ok(Some(out));
        }

        if left_len > 0 {
            let out = self.left_block.split_off(self.left_pos);
            self.left_block.clear();
            self.left_pos = 0;
            return Ok(Some(out));
        }

        if right_len > 0 {
            let out = self.right_block.split_off(self.right_pos);
            self.right_block.clear();
            self.right_pos = 0;
            return Ok(Some(out));
        }

        Ok(None)
    }
}

/// Accumulates the `(doc_id, terms)` writes of one transaction and turns
/// them into a sorted item stream on flush.
#[derive(Default)]
pub struct ItemBuffer {
    num_docs: usize,
    min_doc_id: u32,
    max_doc_id: u32,
    items: Vec<Item>,
    docs: SparseBitSet,
}

impl ItemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_docs(&self) -> usize {
        self.num_docs
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn min_doc_id(&self) -> u32 {
        self.min_doc_id
    }

    pub fn max_doc_id(&self) -> u32 {
        self.max_doc_id
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn reset(&mut self) {
        self.num_docs = 0;
        self.min_doc_id = 0;
        self.max_doc_id = 0;
        self.items.clear();
        self.docs = SparseBitSet::new();
    }

    /// Add a document and its terms to the buffer.
    pub fn add(&mut self, doc_id: u32, terms: &[u32]) {
        self.num_docs += 1;
        if self.num_docs == 1 || self.min_doc_id > doc_id {
            self.min_doc_id = doc_id;
        }
        if self.num_docs == 1 || self.max_doc_id < doc_id {
            self.max_doc_id = doc_id;
        }
        for &term in terms {
            self.items.push(Item::new(term, doc_id));
        }
        self.docs.add(doc_id);
    }

    /// Remove a document from the buffer. Returns true if it was present.
    pub fn delete(&mut self, doc_id: u32) -> bool {
        if !self.docs.contains(doc_id) {
            return false;
        }

        let before = self.items.len();
        self.items.retain(|item| item.doc_id != doc_id);
        if self.items.len() == before {
            return false;
        }

        self.num_docs -= 1;
        self.docs.remove(doc_id);
        self.min_doc_id = self.docs.min();
        self.max_doc_id = self.docs.max();
        true
    }

    /// Turn the buffer into a sorted item stream.
    pub fn into_reader(mut self) -> ItemSliceReader {
        self.items.sort_unstable();
        ItemSliceReader::new(self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ordering() {
        let mut items = vec![
            Item::new(7, 1),
            Item::new(3, 2),
            Item::new(3, 1),
            Item::new(9, 1),
        ];
        items.sort_unstable();
        assert_eq!(
            items,
            vec![
                Item::new(3, 1),
                Item::new(3, 2),
                Item::new(7, 1),
                Item::new(9, 1),
            ]
        );
    }

    #[test]
    fn test_buffer_add() {
        let mut buffer = ItemBuffer::new();
        assert!(buffer.is_empty());

        buffer.add(5, &[1, 2, 3]);
        buffer.add(2, &[4]);
        buffer.add(9, &[5, 6]);

        assert_eq!(buffer.num_docs(), 3);
        assert_eq!(buffer.num_items(), 6);
        assert_eq!(buffer.min_doc_id(), 2);
        assert_eq!(buffer.max_doc_id(), 9);
    }

    #[test]
    fn test_buffer_delete() {
        let mut buffer = ItemBuffer::new();
        buffer.add(1, &[7, 8, 9]);
        buffer.add(2, &[3, 4, 5]);

        assert!(buffer.delete(1));
        assert!(!buffer.delete(1));
        assert_eq!(buffer.num_docs(), 1);
        assert_eq!(buffer.num_items(), 3);
        assert_eq!(buffer.min_doc_id(), 2);
        assert_eq!(buffer.max_doc_id(), 2);
    }

    #[test]
    fn test_buffer_reader_sorts() {
        let mut buffer = ItemBuffer::new();
        buffer.add(1, &[7, 8, 9]);
        buffer.add(2, &[3, 4, 5]);

        let items = read_all_items(&mut buffer.into_reader()).unwrap();
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
    }

    #[test]
    fn test_merge_item_readers() {
        let a = ItemSliceReader::new(vec![Item::new(1, 1), Item::new(5, 1), Item::new(5, 3)]);
        let b = ItemSliceReader::new(vec![Item::new(2, 1), Item::new(5, 2)]);
        let c = ItemSliceReader::new(vec![Item::new(3, 9)]);

        let mut merged =
            merge_item_readers(vec![Box::new(a), Box::new(b), Box::new(c)]);
        let items = read_all_items(&mut *merged).unwrap();
        assert_eq!(
            items,
            vec![
                Item::new(1, 1),
                Item::new(2, 1),
                Item::new(3, 9),
                Item::new(5, 1),
                Item::new(5, 2),
                Item::new(5, 3),
            ]
        );
    }

    #[test]
    fn test_merge_no_readers() {
        let mut merged = merge_item_readers(Vec::new());
        assert!(merged.read_block().unwrap().is_none());
    }
}
