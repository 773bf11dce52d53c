//! The manifest: a versioned catalogue of segments.
//!
//! Every committed state of the index is one manifest. Writers derive an
//! uncommitted child with [`Manifest::clone_for_update`], edit it locally
//! and publish it through [`Manifest::commit`], which rebases the child
//! onto whatever manifest was published in the meantime and resolves
//! concurrent deletes, adds and removals.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::segment::Segment;
use crate::error::{FpindexError, Result};
use crate::util::SparseBitSet;
use crate::vfs::{write_file, FileCursor, FileSystem};

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Versioned segment catalogue. `id` is the publication version; an id of
/// zero means the manifest is an uncommitted transaction view.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub id: u32,
    #[serde(rename = "ndocs")]
    pub num_docs: usize,
    #[serde(rename = "ndeldocs", default)]
    pub num_deleted_docs: usize,
    #[serde(rename = "nitems")]
    pub num_items: usize,
    pub checksum: u32,
    pub segments: HashMap<u32, Segment>,

    /// Publication version of the manifest this one was derived from.
    #[serde(skip)]
    pub base_id: u32,
    #[serde(skip)]
    added_segments: HashSet<u32>,
    #[serde(skip)]
    removed_segments: HashSet<u32>,
    #[serde(skip)]
    delete_all: bool,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive an uncommitted child of this manifest. The child starts with
    /// the same segments and stats, an id of zero and empty transaction
    /// deltas.
    pub fn clone_for_update(&self) -> Manifest {
        let mut manifest = self.clone();
        manifest.base_id = self.id;
        manifest.id = 0;
        manifest.added_segments.clear();
        manifest.removed_segments.clear();
        manifest.delete_all = false;
        manifest
    }

    /// Add a newly built segment. Documents that already exist in older
    /// segments are soft-deleted there, so the add overrides any previous
    /// copy.
    pub fn add_segment(&mut self, segment: Segment) {
        self.insert_segment(segment, true);
    }

    /// Add a segment without the duplicate-doc sweep. Used by merges,
    /// where the new segment replaces its sources verbatim.
    pub fn add_segment_unchecked(&mut self, segment: Segment) {
        self.insert_segment(segment, false);
    }

    fn insert_segment(&mut self, segment: Segment, dedupe: bool) {
        if dedupe {
            for other in self.segments.values_mut() {
                other.delete_multi(segment.docs());
            }
        }
        self.added_segments.insert(segment.id);
        self.removed_segments.remove(&segment.id);
        self.segments.insert(segment.id, segment);
        self.update_stats();
    }

    /// Remove a segment from the catalogue.
    pub fn remove_segment(&mut self, id: u32) {
        if self.segments.remove(&id).is_some() {
            if !self.added_segments.remove(&id) {
                self.removed_segments.insert(id);
            }
            self.update_stats();
        }
    }

    /// Soft-delete one document across all segments. Returns true if any
    /// segment changed.
    pub fn delete(&mut self, doc_id: u32) -> bool {
        let mut changed = false;
        for segment in self.segments.values_mut() {
            changed |= segment.delete(doc_id);
        }
        if changed {
            self.update_stats();
        }
        changed
    }

    /// Drop every segment and start over. Segments the base gains
    /// concurrently are not resurrected at rebase time.
    pub fn delete_all(&mut self) {
        self.segments.clear();
        self.added_segments.clear();
        self.removed_segments.clear();
        self.delete_all = true;
        self.update_stats();
    }

    /// Recompute the aggregate stats from the contained segments.
    pub fn update_stats(&mut self) {
        self.num_docs = 0;
        self.num_deleted_docs = 0;
        self.num_items = 0;
        self.checksum = 0;
        for segment in self.segments.values() {
            self.num_docs += segment.meta.num_docs;
            self.num_deleted_docs += segment.meta.num_deleted_docs;
            self.num_items += segment.meta.num_items;
            self.checksum = self.checksum.wrapping_add(segment.meta.checksum);
        }
    }

    pub fn num_live_docs(&self) -> usize {
        self.num_docs - self.num_deleted_docs
    }

    /// Whether this manifest differs from its base.
    pub fn has_changes(&self) -> bool {
        self.delete_all
            || !self.added_segments.is_empty()
            || !self.removed_segments.is_empty()
            || self.segments.values().any(|s| s.is_dirty())
    }

    /// Reconcile this uncommitted manifest with a newer published `base`.
    ///
    /// Fails with a conflict when the same segment was added or removed on
    /// both sides. Deletes are merged: overlays that advanced in the base
    /// are folded into our copy, our local deletes and added docs are
    /// applied to segments the base gained.
    pub fn rebase(&mut self, base: &Manifest) -> Result<()> {
        if self.id != 0 {
            return Err(FpindexError::TransactionDone);
        }

        for &id in &self.added_segments {
            if base.segments.contains_key(&id) {
                return Err(FpindexError::Conflict(format!(
                    "segment {id} was already added"
                )));
            }
        }
        for &id in &self.removed_segments {
            if !base.segments.contains_key(&id) {
                return Err(FpindexError::Conflict(format!(
                    "segment {id} was already removed"
                )));
            }
        }

        // segments on both sides: pick up deletes the base accumulated
        for (id, segment) in self.segments.iter_mut() {
            if let Some(base_segment) = base.segments.get(id) {
                if segment.update_id < base_segment.update_id {
                    if segment.is_dirty() {
                        if let Some(deleted) = base_segment.deleted_docs() {
                            segment.delete_multi(deleted);
                        }
                    } else {
                        segment.adopt_update(base_segment);
                    }
                }
            }
        }

        // segments the base dropped (e.g. a finished merge), unless we
        // added them ourselves
        {
            let added = &self.added_segments;
            let base_segments = &base.segments;
            self.segments
                .retain(|id, _| base_segments.contains_key(id) || added.contains(id));
        }

        // segments only the base has
        if !self.delete_all {
            let mut added_docs = SparseBitSet::new();
            for id in &self.added_segments {
                if let Some(segment) = self.segments.get(id) {
                    added_docs.union(segment.docs());
                }
            }
            let mut updated_deletes = SparseBitSet::new();
            for segment in self.segments.values() {
                if segment.is_dirty() {
                    if let Some(deleted) = segment.deleted_docs() {
                        updated_deletes.union(deleted);
                    }
                }
            }

            for (id, base_segment) in &base.segments {
                if !self.segments.contains_key(id) && !self.removed_segments.contains(id) {
                    let mut segment = base_segment.clone();
                    segment.delete_multi(&added_docs);
                    segment.delete_multi(&updated_deletes);
                    self.segments.insert(*id, segment);
                }
            }
        }

        self.update_stats();
        self.base_id = base.id;
        Ok(())
    }

    /// Publish this manifest as version `new_id`: rebase onto `base` if it
    /// moved, persist dirty overlays, then atomically write the manifest
    /// file. On failure the id is reset to zero so the commit can be
    /// retried.
    pub fn commit(&mut self, fs: &dyn FileSystem, new_id: u32, base: Option<&Manifest>) -> Result<()> {
        if let Some(base) = base {
            if base.id > self.base_id {
                self.rebase(base)?;
            }
        }

        for segment in self.segments.values_mut() {
            segment.save_update(fs, new_id)?;
        }

        self.id = new_id;
        if let Err(err) = self.save(fs) {
            self.id = 0;
            return Err(err);
        }

        self.added_segments.clear();
        self.removed_segments.clear();
        self.delete_all = false;
        Ok(())
    }

    /// Load the manifest from `fs`. With `create`, a missing manifest is
    /// replaced by a fresh one with id 1 and persisted.
    pub fn load(fs: &dyn FileSystem, create: bool) -> Result<Manifest> {
        let file = match fs.open_file(MANIFEST_FILENAME) {
            Ok(file) => file,
            Err(err) if err.is_not_found() && create => {
                let mut manifest = Manifest::new();
                manifest.id = 1;
                manifest.save(fs)?;
                return Ok(manifest);
            }
            Err(err) => return Err(err),
        };
        let cursor = FileCursor::new(file);
        serde_json::from_reader(cursor)
            .map_err(|err| FpindexError::CorruptedData(format!("manifest decode failed: {err}")))
    }

    /// Atomically write the manifest file.
    pub fn save(&self, fs: &dyn FileSystem) -> Result<()> {
        write_file(fs, MANIFEST_FILENAME, |w| {
            serde_json::to_writer_pretty(&mut *w, self)
                .map_err(|err| FpindexError::Io(err.into()))?;
            w.write_all(b"\n")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::item::ItemBuffer;
    use crate::vfs::MemoryFileSystem;

    fn new_segment(fs: &MemoryFileSystem, id: u32, doc_id: u32, terms: &[u32]) -> Segment {
        let mut buffer = ItemBuffer::new();
        buffer.add(doc_id, terms);
        Segment::create(fs, id, &mut buffer.into_reader()).unwrap()
    }

    #[test]
    fn test_add_remove_segment_stats() {
        let fs = MemoryFileSystem::new();
        let mut manifest = Manifest::new();

        manifest.add_segment(new_segment(&fs, 1, 1, &[1, 2]));
        manifest.add_segment(new_segment(&fs, 2, 2, &[3]));
        assert_eq!(manifest.num_docs, 2);
        assert_eq!(manifest.num_items, 3);
        let sum: u32 = manifest
            .segments
            .values()
            .map(|s| s.meta.checksum)
            .fold(0, |acc, c| acc.wrapping_add(c));
        assert_eq!(manifest.checksum, sum);

        manifest.remove_segment(1);
        assert_eq!(manifest.num_docs, 1);
        assert_eq!(manifest.num_items, 1);
        assert!(!manifest.segments.contains_key(&1));
    }

    #[test]
    fn test_add_segment_deduplicates_docs() {
        let fs = MemoryFileSystem::new();
        let mut manifest = Manifest::new();
        manifest.add_segment(new_segment(&fs, 1, 7, &[1, 2]));
        // same doc re-indexed in a newer segment
        manifest.add_segment(new_segment(&fs, 2, 7, &[3, 4]));

        let old = &manifest.segments[&1];
        assert_eq!(old.meta.num_deleted_docs, 1);
        assert!(!old.contains(7));
        assert!(manifest.segments[&2].contains(7));
        assert_eq!(manifest.num_deleted_docs, 1);
    }

    #[test]
    fn test_delete_and_stats() {
        let fs = MemoryFileSystem::new();
        let mut manifest = Manifest::new();
        manifest.add_segment(new_segment(&fs, 1, 1, &[1]));
        manifest.add_segment(new_segment(&fs, 2, 2, &[2]));

        assert!(manifest.delete(1));
        assert!(!manifest.delete(1));
        assert_eq!(manifest.num_deleted_docs, 1);
        assert!(manifest.has_changes());
    }

    #[test]
    fn test_rebase_noop() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.add_segment(new_segment(&fs, 2, 2, &[2]));
        m2.rebase(&m1).unwrap();
        assert_eq!(m2.num_docs, 2);
        assert!(m2.segments.contains_key(&1));
        assert!(m2.segments.contains_key(&2));
    }

    #[test]
    fn test_rebase_concurrent_add() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.add_segment(new_segment(&fs, 2, 2, &[2]));
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.add_segment(new_segment(&fs, 3, 3, &[3]));
        m3.rebase(&m2).unwrap();
        assert_eq!(m3.num_docs, 3);
        for id in [1u32, 2, 3] {
            assert!(m3.segments.contains_key(&id), "missing segment {id}");
        }
    }

    #[test]
    fn test_rebase_adopts_base_deletes() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.segments.get_mut(&1).unwrap().delete(1);
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.add_segment(new_segment(&fs, 3, 3, &[3]));
        m3.rebase(&m2).unwrap();
        assert_eq!(m3.num_docs, 2);
        assert_eq!(m3.num_deleted_docs, 1);
        assert_eq!(m3.segments[&1].update_id, m2.segments[&1].update_id);
        assert!(!m3.segments[&1].contains(1));
    }

    #[test]
    fn test_rebase_merges_concurrent_deletes() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.add_segment(new_segment(&fs, 2, 2, &[2]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.segments.get_mut(&1).unwrap().delete(1);
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.segments.get_mut(&2).unwrap().delete(2);
        m3.rebase(&m2).unwrap();
        assert_eq!(m3.num_docs, 2);
        assert_eq!(m3.num_deleted_docs, 2);
        assert!(!m3.segments[&1].contains(1));
        assert!(!m3.segments[&2].contains(2));
    }

    #[test]
    fn test_rebase_merges_deletes_on_same_segment() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        let segment = {
            let mut buffer = ItemBuffer::new();
            buffer.add(1, &[1]);
            buffer.add(2, &[2]);
            Segment::create(&fs, 1, &mut buffer.into_reader()).unwrap()
        };
        m1.add_segment(segment);
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.segments.get_mut(&1).unwrap().delete(1);
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.segments.get_mut(&1).unwrap().delete(2);
        m3.rebase(&m2).unwrap();
        assert_eq!(m3.num_deleted_docs, 2);
        assert!(!m3.segments[&1].contains(1));
        assert!(!m3.segments[&1].contains(2));
    }

    #[test]
    fn test_rebase_double_remove_conflict() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.remove_segment(1);
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.remove_segment(1);
        let err = m3.rebase(&m2).unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err}");
    }

    #[test]
    fn test_rebase_delete_all_wins_over_concurrent_add() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.add_segment(new_segment(&fs, 1, 1, &[1]));
        m1.id = 1;

        let mut m2 = m1.clone_for_update();
        m2.add_segment(new_segment(&fs, 2, 2, &[2]));
        m2.commit(&fs, 2, None).unwrap();

        let mut m3 = m1.clone_for_update();
        m3.delete_all();
        m3.rebase(&m2).unwrap();
        assert!(m3.segments.is_empty());
        assert_eq!(m3.num_docs, 0);
    }

    #[test]
    fn test_rebase_dedupes_docs_added_on_base_side() {
        let fs = MemoryFileSystem::new();
        let mut m1 = Manifest::new();
        m1.id = 1;

        // base gains a segment with doc 7
        let mut m2 = m1.clone_for_update();
        m2.add_segment(new_segment(&fs, 2, 7, &[1, 2]));
        m2.commit(&fs, 2, None).unwrap();

        // we re-add doc 7 concurrently; our copy must win
        let mut m3 = m1.clone_for_update();
        m3.add_segment(new_segment(&fs, 3, 7, &[3, 4]));
        m3.rebase(&m2).unwrap();
        assert!(!m3.segments[&2].contains(7));
        assert!(m3.segments[&3].contains(7));
        assert_eq!(m3.num_deleted_docs, 1);
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        let fs = MemoryFileSystem::new();
        let mut manifest = Manifest::new();
        manifest.add_segment(new_segment(&fs, 1, 1, &[1, 2, 3]));
        manifest.commit(&fs, 2, None).unwrap();
        assert_eq!(manifest.id, 2);
        assert!(!manifest.has_changes());

        let mut loaded = Manifest::load(&fs, false).unwrap();
        assert_eq!(loaded.id, 2);
        assert_eq!(loaded.num_docs, 1);
        assert_eq!(loaded.num_items, 3);
        assert_eq!(loaded.checksum, manifest.checksum);
        for segment in loaded.segments.values_mut() {
            segment.open(&fs).unwrap();
        }
        assert!(loaded.segments[&1].contains(1));
    }

    #[test]
    fn test_load_create() {
        let fs = MemoryFileSystem::new();
        assert!(Manifest::load(&fs, false).is_err());
        let manifest = Manifest::load(&fs, true).unwrap();
        assert_eq!(manifest.id, 1);
        // persisted, so a second load without create succeeds
        let manifest = Manifest::load(&fs, false).unwrap();
        assert_eq!(manifest.id, 1);
    }

    #[test]
    fn test_commit_writes_overlays() {
        let fs = MemoryFileSystem::new();
        let mut manifest = Manifest::new();
        manifest.add_segment(new_segment(&fs, 1, 1, &[1]));
        manifest.commit(&fs, 2, None).unwrap();

        let mut child = manifest.clone_for_update();
        child.delete(1);
        child.commit(&fs, 3, Some(&manifest)).unwrap();
        assert_eq!(child.segments[&1].update_id, 3);

        let mut loaded = Manifest::load(&fs, false).unwrap();
        for segment in loaded.segments.values_mut() {
            segment.open(&fs).unwrap();
        }
        assert!(!loaded.segments[&1].contains(1));
        assert_eq!(loaded.num_deleted_docs, 1);
    }
}
