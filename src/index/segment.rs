//! Immutable postings segments.
//!
//! A segment is a single `.dat` file of fixed-size blocks followed by the
//! block index (first term of every block), the serialized doc-id set, a
//! zero sentinel byte and a trailing JSON metadata record. Deletes never
//! touch the file; they accumulate in a separate `.del` overlay written
//! per `(segment_id, update_id)`.
//!
//! # Block layout
//!
//! Each block is exactly `block_size` bytes, zero-padded. The 8-byte
//! header holds the item count (low 12 bits) and codec flags (high 4 bits)
//! in a u16 LE word, the byte length of the term payload (u16 LE) and the
//! block's base doc id (u32 LE). Terms are varint deltas against the
//! previous term, doc ids varint deltas against the base doc id.

use std::fmt;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::item::{Item, ItemReader};
use crate::error::{FpindexError, Result};
use crate::util::{put_uvarint32, uvarint32, SparseBitSet, MAX_VARINT32_LEN};
use crate::vfs::{FileCursor, FileReader, FileSystem};

/// Current segment file format version.
pub const SEGMENT_FORMAT: u32 = 1;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Size of the per-block header.
pub const BLOCK_HEADER_SIZE: usize = 8;

const BLOCK_COUNT_MASK: u16 = 0x0fff;
const BLOCK_FLAGS_SHIFT: u16 = 12;

/// Term deltas stored as one raw byte each instead of varints. Emitted by
/// a historical writer; readers must understand it.
const BLOCK_FLAG_FIXED_TERM_DELTAS: u16 = 1;

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Persistent segment metadata, stored both in the manifest and as the
/// trailing record of the segment file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub format: u32,
    pub checksum: u32,
    #[serde(rename = "blocksize")]
    pub block_size: usize,
    #[serde(rename = "nblocks")]
    pub num_blocks: usize,
    #[serde(rename = "ndocs")]
    pub num_docs: usize,
    #[serde(rename = "ndeldocs", default, skip_serializing_if = "is_zero")]
    pub num_deleted_docs: usize,
    #[serde(rename = "nitems")]
    pub num_items: usize,
    #[serde(rename = "minterm")]
    pub min_term: u32,
    #[serde(rename = "maxterm")]
    pub max_term: u32,
    #[serde(rename = "mindocid")]
    pub min_doc_id: u32,
    #[serde(rename = "maxdocid")]
    pub max_doc_id: u32,
}

/// An immutable term->doc block file plus an optional deleted-docs
/// overlay. Published segments are never mutated; all changes happen on
/// clones whose overlay bitsets are copy-on-write.
#[derive(Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    #[serde(rename = "updateid", default, skip_serializing_if = "is_zero_u32")]
    pub update_id: u32,
    pub meta: SegmentMeta,
    #[serde(skip)]
    block_index: Arc<Vec<u32>>,
    #[serde(skip)]
    reader: Option<Arc<dyn FileReader>>,
    #[serde(skip)]
    docs: Arc<SparseBitSet>,
    #[serde(skip)]
    deleted_docs: Option<Arc<SparseBitSet>>,
    #[serde(skip)]
    dirty: bool,
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("update_id", &self.update_id)
            .field("meta", &self.meta)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Accumulates block data while a new segment file is written.
struct SegmentWriterState {
    meta: SegmentMeta,
    block_index: Vec<u32>,
    docs: SparseBitSet,
}

impl SegmentWriterState {
    fn new() -> Self {
        Self {
            meta: SegmentMeta {
                format: SEGMENT_FORMAT,
                block_size: DEFAULT_BLOCK_SIZE,
                ..SegmentMeta::default()
            },
            block_index: Vec::new(),
            docs: SparseBitSet::new(),
        }
    }

    /// Pack as many leading items of `input` into one block as the byte
    /// budget allows. Returns the number of items consumed.
    fn write_block(&mut self, writer: &mut dyn Write, input: &[Item]) -> Result<usize> {
        if input.is_empty() {
            return Err(FpindexError::InvalidInput("empty block".into()));
        }

        let block_size = self.meta.block_size;
        let mut terms = vec![0u8; block_size];
        let mut doc_ids = vec![0u8; block_size];
        let mut term_len = 0usize;
        let mut doc_len = 0usize;

        let base_doc_id = input.iter().map(|item| item.doc_id).min().unwrap_or(0);

        let mut n = input.len();
        let mut last_term = 0u32;
        let mut scratch = [0u8; MAX_VARINT32_LEN];
        for (i, item) in input.iter().enumerate() {
            if item.term < last_term {
                return Err(FpindexError::InvalidInput(
                    "items are not sorted by term".into(),
                ));
            }
            let n1 = put_uvarint32(&mut scratch, item.term - last_term);
            let n2 = put_uvarint32(&mut doc_ids[doc_len..], item.doc_id - base_doc_id);
            if BLOCK_HEADER_SIZE + term_len + doc_len + n1 + n2 >= block_size {
                n = i;
                break;
            }
            terms[term_len..term_len + n1].copy_from_slice(&scratch[..n1]);
            term_len += n1;
            doc_len += n2;
            last_term = item.term;
            self.meta.checksum = self
                .meta
                .checksum
                .wrapping_add(item.term)
                .wrapping_add(item.doc_id);
            self.docs.add(item.doc_id);
        }

        if self.meta.num_blocks > 0 {
            if self.meta.min_term > input[0].term {
                self.meta.min_term = input[0].term;
            }
            if self.meta.max_term < input[n - 1].term {
                self.meta.max_term = input[n - 1].term;
            }
        } else {
            self.meta.min_term = input[0].term;
            self.meta.max_term = input[n - 1].term;
        }

        self.meta.num_items += n;
        self.meta.num_blocks += 1;
        self.block_index.push(input[0].term);

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        header[0..2].copy_from_slice(&(n as u16).to_le_bytes());
        header[2..4].copy_from_slice(&(term_len as u16).to_le_bytes());
        header[4..8].copy_from_slice(&base_doc_id.to_le_bytes());

        writer.write_all(&header)?;
        writer.write_all(&terms[..term_len])?;
        writer.write_all(&doc_ids[..doc_len])?;
        let padding = block_size - BLOCK_HEADER_SIZE - term_len - doc_len;
        writer.write_all(&vec![0u8; padding])?;

        Ok(n)
    }

    fn write_data(&mut self, file: &mut dyn Write, input: &mut dyn ItemReader) -> Result<()> {
        let mut writer = BufWriter::new(file);

        let max_items_per_block = (self.meta.block_size - BLOCK_HEADER_SIZE) / 2;
        let mut remaining: Vec<Item> = Vec::with_capacity(max_items_per_block);
        loop {
            let block = input.read_block()?;
            let mut block = match &block {
                Some(items) if !items.is_empty() => items.as_slice(),
                _ => {
                    while !remaining.is_empty() {
                        let n = self.write_block(&mut writer, &remaining)?;
                        remaining.drain(..n);
                    }
                    break;
                }
            };
            while !remaining.is_empty() && remaining.len() + block.len() >= max_items_per_block {
                let m = remaining.len();
                let take = max_items_per_block - m;
                remaining.extend_from_slice(&block[..take]);
                let n = self.write_block(&mut writer, &remaining)?;
                if n >= m {
                    block = &block[n - m..];
                    remaining.clear();
                } else {
                    remaining.drain(..n);
                    remaining.truncate(m - n);
                }
            }
            while block.len() >= max_items_per_block {
                let n = self.write_block(&mut writer, block)?;
                block = &block[n..];
            }
            remaining.extend_from_slice(block);
        }

        self.meta.num_docs = self.docs.len();
        self.meta.min_doc_id = self.docs.min();
        self.meta.max_doc_id = self.docs.max();

        for &term in &self.block_index {
            writer.write_all(&term.to_le_bytes())?;
        }

        self.docs.write_to(&mut writer)?;

        writer.write_all(&[0u8])?;

        serde_json::to_writer(&mut writer, &self.meta)
            .map_err(|err| FpindexError::Io(err.into()))?;
        writer.write_all(b"\n")?;

        writer.flush()?;
        Ok(())
    }
}

impl Segment {
    /// Write a new segment file from a sorted item stream, then open it
    /// for reads.
    pub fn create(fs: &dyn FileSystem, id: u32, input: &mut dyn ItemReader) -> Result<Segment> {
        let started = Instant::now();
        let mut state = SegmentWriterState::new();

        let name = segment_file_name(id);
        let mut file = fs.create_atomic_file(&name)?;
        state.write_data(&mut file, input)?;
        file.commit()?;

        info!(
            segment = id,
            docs = state.meta.num_docs,
            items = state.meta.num_items,
            blocks = state.meta.num_blocks,
            checksum = state.meta.checksum,
            elapsed = ?started.elapsed(),
            "created segment"
        );

        let segment = Segment {
            id,
            update_id: 0,
            meta: state.meta,
            block_index: Arc::new(state.block_index),
            reader: None,
            docs: Arc::new(state.docs),
            deleted_docs: None,
            dirty: false,
        };

        match fs.open_file(&name) {
            Ok(reader) => Ok(Segment {
                reader: Some(reader),
                ..segment
            }),
            Err(err) => {
                let _ = segment.remove(fs);
                Err(err)
            }
        }
    }

    /// Open the segment file named by the metadata loaded from a
    /// manifest: load the block index, the doc-id set and any overlay.
    pub fn open(&mut self, fs: &dyn FileSystem) -> Result<()> {
        if self.meta.format != SEGMENT_FORMAT {
            return Err(FpindexError::CorruptedData(format!(
                "unsupported segment format {}",
                self.meta.format
            )));
        }

        let file = fs.open_file(&self.file_name())?;
        let mut cursor = FileCursor::new(file.clone());
        cursor.seek(SeekFrom::Start(
            (self.meta.block_size * self.meta.num_blocks) as u64,
        ))?;

        let mut block_index = Vec::with_capacity(self.meta.num_blocks);
        let mut buf = [0u8; 4];
        for _ in 0..self.meta.num_blocks {
            cursor.read_exact(&mut buf)?;
            block_index.push(u32::from_le_bytes(buf));
        }
        self.block_index = Arc::new(block_index);

        self.docs = Arc::new(SparseBitSet::read_from(&mut cursor)?);
        self.load_update(fs)?;
        self.reader = Some(file);
        Ok(())
    }

    pub fn file_name(&self) -> String {
        segment_file_name(self.id)
    }

    pub fn update_file_name(&self, update_id: u32) -> String {
        format!("segment-{:x}-{:x}.del", self.id, update_id)
    }

    /// All file names owned by this segment.
    pub fn file_names(&self) -> Vec<String> {
        let mut names = vec![self.file_name()];
        if self.update_id != 0 {
            names.push(self.update_file_name(self.update_id));
        }
        names
    }

    /// Delete the segment data file.
    pub fn remove(&self, fs: &dyn FileSystem) -> Result<()> {
        let name = self.file_name();
        fs.remove(&name)?;
        debug!(file = %name, "removed segment file");
        Ok(())
    }

    /// Estimated size of the segment file in bytes, based on block
    /// statistics. The actual file size might differ.
    pub fn size(&self) -> u64 {
        (self.meta.num_blocks * (4 + self.meta.block_size)) as u64
    }

    pub fn num_docs(&self) -> usize {
        self.meta.num_docs
    }

    pub fn num_deleted_docs(&self) -> usize {
        self.meta.num_deleted_docs
    }

    pub fn num_live_docs(&self) -> usize {
        self.meta.num_docs - self.meta.num_deleted_docs
    }

    pub fn num_items(&self) -> usize {
        self.meta.num_items
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn docs(&self) -> &SparseBitSet {
        &self.docs
    }

    pub(crate) fn deleted_docs(&self) -> Option<&SparseBitSet> {
        self.deleted_docs.as_deref()
    }

    /// Read and decode one block.
    pub fn read_block(&self, i: usize) -> Result<Vec<Item>> {
        if i >= self.meta.num_blocks {
            return Err(FpindexError::InvalidInput(format!("block {i} not found")));
        }
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| FpindexError::InvalidInput("segment is not open".into()))?;

        let mut data = vec![0u8; self.meta.block_size];
        reader.read_at(&mut data, (i * self.meta.block_size) as u64)?;
        decode_block(&data, self.meta.block_size)
    }

    /// Invoke `visit` for every live `(term, doc_id)` whose term appears
    /// in the ascending-sorted `query`.
    pub fn search(&self, query: &[u32], visit: &mut dyn FnMut(u32)) -> Result<()> {
        let blocks = &self.block_index;
        if query.is_empty() || blocks.is_empty() || query[0] > self.meta.max_term {
            return Ok(());
        }

        let mut qi = 0usize;
        let mut bi = 0usize;
        loop {
            let mut q = query[qi];
            if blocks[bi] > q {
                qi += query[qi + 1..].partition_point(|&term| term < blocks[bi]) + 1;
                if qi == query.len() {
                    return Ok(());
                }
                q = query[qi];
            }
            bi += blocks[bi + 1..].partition_point(|&term| term < q);
            let items = self.read_block(bi)?;
            for item in items {
                while item.term > q {
                    qi += 1;
                    if qi == query.len() {
                        return Ok(());
                    }
                    q = query[qi];
                }
                if item.term == q && !self.is_deleted(item.doc_id) {
                    visit(item.doc_id);
                }
            }
            bi += 1;
            if bi == blocks.len() {
                return Ok(());
            }
        }
    }

    fn is_deleted(&self, doc_id: u32) -> bool {
        match &self.deleted_docs {
            Some(deleted) => deleted.contains(doc_id),
            None => false,
        }
    }

    /// Check whether `doc_id` is live in this segment.
    pub fn contains(&self, doc_id: u32) -> bool {
        self.docs.contains(doc_id) && !self.is_deleted(doc_id)
    }

    /// Soft-delete one document. Returns true if the segment changed.
    /// The overlay bitset is copied before the first mutation so that
    /// previously published clones are unaffected.
    pub fn delete(&mut self, doc_id: u32) -> bool {
        if !self.contains(doc_id) {
            return false;
        }
        let deleted = self
            .deleted_docs
            .get_or_insert_with(|| Arc::new(SparseBitSet::new()));
        Arc::make_mut(deleted).add(doc_id);
        self.dirty = true;
        self.meta.num_deleted_docs += 1;
        true
    }

    /// Soft-delete every document in `docs` that is present in this
    /// segment. Returns true if the set of deleted docs grew.
    pub fn delete_multi(&mut self, docs: &SparseBitSet) -> bool {
        let (mut deleted, mut num_deleted) = self.docs.intersection(docs);
        if num_deleted == 0 {
            return false;
        }
        if let Some(existing) = &self.deleted_docs {
            deleted.union(existing);
            num_deleted = deleted.len();
            if self.meta.num_deleted_docs == num_deleted {
                return false;
            }
        }
        self.deleted_docs = Some(Arc::new(deleted));
        self.dirty = true;
        self.meta.num_deleted_docs = num_deleted;
        true
    }

    /// Fold the newer overlay of `other` (a later version of the same
    /// segment) into this one wholesale.
    pub(crate) fn adopt_update(&mut self, other: &Segment) {
        self.deleted_docs = other.deleted_docs.clone();
        self.meta.num_deleted_docs = other.meta.num_deleted_docs;
        self.update_id = other.update_id;
    }

    /// Persist the deleted-docs overlay if it changed since the last
    /// save. Idempotent when the segment is not dirty.
    pub fn save_update(&mut self, fs: &dyn FileSystem, update_id: u32) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let name = self.update_file_name(update_id);
        let deleted = self
            .deleted_docs
            .as_mut()
            .ok_or_else(|| FpindexError::InvalidInput("dirty segment has no overlay".into()))?;
        let set = Arc::make_mut(deleted);
        crate::vfs::write_file(fs, &name, |w| set.write_to(w))?;
        self.update_id = update_id;
        self.dirty = false;
        debug!(segment = self.id, update = update_id, "saved deleted-docs overlay");
        Ok(())
    }

    /// Load the deleted-docs overlay referenced by `update_id`.
    pub fn load_update(&mut self, fs: &dyn FileSystem) -> Result<()> {
        if self.update_id == 0 {
            return Ok(());
        }
        let file = fs.open_file(&self.update_file_name(self.update_id))?;
        let mut cursor = FileCursor::new(file);
        let deleted = SparseBitSet::read_from(&mut cursor)?;
        debug!(
            segment = self.id,
            update = self.update_id,
            deleted = self.meta.num_deleted_docs,
            "loaded deleted-docs overlay"
        );
        self.deleted_docs = Some(Arc::new(deleted));
        Ok(())
    }

    /// Stream the live items of this segment block by block.
    pub fn reader(&self) -> SegmentItemReader {
        SegmentItemReader {
            segment: self.clone(),
            block: 0,
        }
    }
}

impl Segment {
    /// Detached segment with metadata only, used by merge-planning tests.
    #[cfg(test)]
    pub(crate) fn stub(id: u32, meta: SegmentMeta) -> Segment {
        Segment {
            id,
            update_id: 0,
            meta,
            block_index: Arc::new(Vec::new()),
            reader: None,
            docs: Arc::new(SparseBitSet::new()),
            deleted_docs: None,
            dirty: false,
        }
    }
}

pub(crate) fn segment_file_name(id: u32) -> String {
    format!("segment-{id:x}.dat")
}

fn decode_block(data: &[u8], block_size: usize) -> Result<Vec<Item>> {
    if data.len() < BLOCK_HEADER_SIZE || data.len() > block_size {
        return Err(FpindexError::CorruptedData("invalid block header".into()));
    }

    let count_word = u16::from_le_bytes([data[0], data[1]]);
    let count = (count_word & BLOCK_COUNT_MASK) as usize;
    let flags = count_word >> BLOCK_FLAGS_SHIFT;
    if flags & !BLOCK_FLAG_FIXED_TERM_DELTAS != 0 {
        return Err(FpindexError::CorruptedData(format!(
            "unknown block flags {flags:#x}"
        )));
    }
    let term_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    let base_doc_id = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if BLOCK_HEADER_SIZE + term_len > data.len() {
        return Err(FpindexError::CorruptedData("invalid block header".into()));
    }

    let mut items = vec![Item::new(0, 0); count];

    let terms = &data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + term_len];
    let mut term = 0u32;
    if flags & BLOCK_FLAG_FIXED_TERM_DELTAS != 0 {
        if term_len < count {
            return Err(FpindexError::CorruptedData("invalid block data".into()));
        }
        for (i, item) in items.iter_mut().enumerate() {
            term += u32::from(terms[i]);
            item.term = term;
        }
    } else {
        let mut ptr = 0usize;
        for item in items.iter_mut() {
            let (delta, n) = uvarint32(&terms[ptr..])?;
            term += delta;
            item.term = term;
            ptr += n;
        }
    }

    let mut ptr = BLOCK_HEADER_SIZE + term_len;
    for item in items.iter_mut() {
        let (delta, n) = uvarint32(&data[ptr..])?;
        item.doc_id = base_doc_id + delta;
        ptr += n;
    }

    Ok(items)
}

/// Streams the live items of a segment, block by block, skipping deleted
/// docs.
pub struct SegmentItemReader {
    segment: Segment,
    block: usize,
}

impl ItemReader for SegmentItemReader {
    fn read_block(&mut self) -> Result<Option<Vec<Item>>> {
        if self.block >= self.segment.meta.num_blocks {
            return Ok(None);
        }
        let i = self.block;
        self.block += 1;
        let mut items = self.segment.read_block(i)?;
        if self.segment.deleted_docs.is_some() {
            items.retain(|item| !self.segment.is_deleted(item.doc_id));
        }
        Ok(Some(items))
    }
}
