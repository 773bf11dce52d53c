//! Tiered segment merging.
//!
//! The policy is an adaptation of the algorithm from Lucene's
//! TieredMergePolicy: segments are bucketed into size tiers and a merge is
//! proposed only when a tier holds more segments than allowed, preferring
//! balanced merges of small segments.

use tracing::{info, warn};

use super::db::Database;
use super::item::{merge_item_readers, ItemReader};
use super::manifest::Manifest;
use super::segment::Segment;
use crate::error::{FpindexError, Result};
use crate::util::SparseBitSet;

/// One planned merge operation, resulting in a single new segment.
#[derive(Clone, Debug)]
pub struct Merge {
    pub segments: Vec<Segment>,
    pub score: f64,
    pub size: u64,
}

impl Merge {
    /// Build the merged segment and commit the manifest transformation
    /// that swaps the sources for it. Fails with a conflict if a source
    /// segment disappeared concurrently; deletes that landed on a source
    /// while the merge ran are folded into the new segment.
    pub fn run(&mut self, db: &Database) -> Result<()> {
        self.segments.sort_by_key(|s| s.id);

        let readers: Vec<Box<dyn ItemReader>> = self
            .segments
            .iter()
            .map(|segment| Box::new(segment.reader()) as Box<dyn ItemReader>)
            .collect();

        let new_segment = db.create_segment(&mut *merge_item_readers(readers))?;
        info!(
            sources = ?self.segments.iter().map(|s| s.id).collect::<Vec<_>>(),
            merged = new_segment.id,
            "merged segments"
        );

        let result = db.commit_with(|base| self.prepare_commit(base, &new_segment));
        if let Err(err) = result {
            if let Err(remove_err) = db.discard_segment(&new_segment) {
                warn!(segment = new_segment.id, error = %remove_err, "failed to discard merged segment");
            }
            return Err(err);
        }
        Ok(())
    }

    fn prepare_commit(&self, base: &Manifest, new_segment: &Segment) -> Result<Manifest> {
        let mut manifest = base.clone_for_update();

        let mut newer_deletes: Option<SparseBitSet> = None;
        for old_segment in &self.segments {
            let current = manifest.segments.get(&old_segment.id).ok_or_else(|| {
                FpindexError::Conflict(format!("segment {} no longer exists", old_segment.id))
            })?;
            if current.update_id != old_segment.update_id {
                if let Some(deleted) = current.deleted_docs() {
                    newer_deletes
                        .get_or_insert_with(SparseBitSet::new)
                        .union(deleted);
                }
            }
            manifest.remove_segment(old_segment.id);
        }

        if manifest.segments.contains_key(&new_segment.id) {
            return Err(FpindexError::Conflict(format!(
                "segment {} already exists",
                new_segment.id
            )));
        }

        let mut new_segment = new_segment.clone();
        if let Some(deleted) = newer_deletes {
            new_segment.delete_multi(&deleted);
        }
        manifest.add_segment_unchecked(new_segment);

        Ok(manifest)
    }
}

/// Determines a sequence of merge operations.
pub trait MergePolicy {
    fn find_best_merge(&self, manifest: &Manifest, max_size: u64) -> Option<Merge>;
}

/// Size-tiered merge policy.
#[derive(Clone, Debug)]
pub struct TieredMergePolicy {
    /// Smallest segment size considered for tiering; smaller segments are
    /// rounded up so a long tail of tiny flushes cannot dominate.
    pub floor_segment_size: u64,
    /// Maximum size of a segment produced during normal merging. The
    /// estimate sums the sizes of the to-be-merged segments.
    pub max_merged_segment_size: u64,
    /// Maximum number of segments merged at once.
    pub max_merge_at_once: usize,
    /// Allowed number of segments per tier. Should be >= max_merge_at_once
    /// or merges are forced too eagerly.
    pub max_segments_per_tier: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self {
            floor_segment_size: 1024 * 1024,
            max_merged_segment_size: 2 * 1024 * 1024 * 1024,
            max_merge_at_once: 10,
            max_segments_per_tier: 10,
        }
    }
}

impl TieredMergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn floor_size(&self, size: u64) -> u64 {
        size.max(self.floor_segment_size)
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_best_merge(&self, manifest: &Manifest, max_size: u64) -> Option<Merge> {
        if manifest.segments.is_empty() {
            return None;
        }
        let max_size = if max_size == 0 {
            self.max_merged_segment_size
        } else {
            max_size
        };

        // Over-sized segments can never participate in a merge.
        let mut segments: Vec<&Segment> = manifest
            .segments
            .values()
            .filter(|segment| segment.size() <= max_size / 2)
            .collect();
        if segments.is_empty() {
            return None;
        }

        segments.sort_by(|a, b| b.size().cmp(&a.size()).then(a.id.cmp(&b.id)));

        // Walk the size distribution in tiers to compute how many segments
        // the index is allowed to hold.
        let mut remaining_size: i64 = segments.iter().map(|s| s.size() as i64).sum();
        let mut level_size = self.floor_size(segments.last()?.size()) as i64;
        let mut allowed_segment_count: i64 = 0;
        loop {
            let level_segment_count = if level_size > 0 {
                (remaining_size + level_size - 1) / level_size
            } else {
                remaining_size
            };
            if level_segment_count < self.max_segments_per_tier as i64 {
                allowed_segment_count += level_segment_count;
                break;
            }
            allowed_segment_count += self.max_segments_per_tier as i64;
            remaining_size -= self.max_segments_per_tier as i64 * level_size;
            level_size *= self.max_merge_at_once as i64;
        }

        if segments.len() as i64 <= allowed_segment_count {
            return None;
        }

        let mut best_merge: Option<Merge> = None;
        let last_start = segments.len().checked_sub(self.max_merge_at_once)?;
        for i in 0..=last_start {
            let mut merge_segments = Vec::new();
            let mut merge_size = 0u64;
            let mut merge_size_floored = 0u64;
            let mut hit_too_large = false;
            for segment in &segments[i..] {
                if segment.size() + merge_size > max_size {
                    hit_too_large = true;
                    continue;
                }
                merge_size += segment.size();
                merge_size_floored += self.floor_size(segment.size());
                merge_segments.push((*segment).clone());
                if merge_segments.len() >= self.max_merge_at_once {
                    break;
                }
            }
            if merge_segments.is_empty() {
                continue;
            }

            let skew = if hit_too_large {
                1.0 / self.max_merge_at_once as f64
            } else {
                self.floor_size(merge_segments[0].size()) as f64 / merge_size_floored as f64
            };
            let score = skew * (merge_size as f64).powf(0.05);

            if best_merge
                .as_ref()
                .map_or(true, |best| score < best.score)
            {
                best_merge = Some(Merge {
                    segments: merge_segments,
                    score,
                    size: merge_size,
                });
            }
        }
        best_merge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::SegmentMeta;

    fn stub_segment(id: u32, num_blocks: usize) -> Segment {
        Segment::stub(
            id,
            SegmentMeta {
                block_size: 1,
                num_blocks,
                ..SegmentMeta::default()
            },
        )
    }

    fn stub_manifest(sizes: &[(u32, usize)]) -> Manifest {
        let mut manifest = Manifest::new();
        for &(id, num_blocks) in sizes {
            manifest
                .segments
                .insert(id, stub_segment(id, num_blocks));
        }
        manifest
    }

    #[test]
    fn test_merge_equal_segments() {
        let policy = TieredMergePolicy {
            floor_segment_size: 0,
            max_merge_at_once: 3,
            max_segments_per_tier: 1,
            ..TieredMergePolicy::default()
        };
        let manifest = stub_manifest(&[(0, 1), (1, 1), (2, 1)]);

        let merge = policy.find_best_merge(&manifest, 0).unwrap();
        let mut ids: Vec<u32> = merge.segments.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_no_merge_needed() {
        let policy = TieredMergePolicy {
            floor_segment_size: 0,
            max_merge_at_once: 2,
            max_segments_per_tier: 1,
            ..TieredMergePolicy::default()
        };
        let manifest = stub_manifest(&[(0, 2), (1, 1), (2, 1)]);
        assert!(policy.find_best_merge(&manifest, 0).is_none());
    }

    #[test]
    fn test_prefers_smaller_segments() {
        let policy = TieredMergePolicy {
            floor_segment_size: 0,
            max_merge_at_once: 2,
            max_segments_per_tier: 1,
            ..TieredMergePolicy::default()
        };
        let manifest = stub_manifest(&[(0, 4), (1, 3), (2, 2), (3, 1), (4, 1)]);

        let merge = policy.find_best_merge(&manifest, 0).unwrap();
        let mut ids: Vec<u32> = merge.segments.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_ignores_oversized_segments() {
        let policy = TieredMergePolicy {
            floor_segment_size: 0,
            max_merge_at_once: 2,
            max_segments_per_tier: 1,
            ..TieredMergePolicy::default()
        };
        let huge = (policy.max_merged_segment_size / 5) as usize;
        let manifest = stub_manifest(&[(0, huge), (1, 3), (2, 2), (3, 1), (4, 1)]);

        let merge = policy.find_best_merge(&manifest, 0).unwrap();
        let mut ids: Vec<u32> = merge.segments.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_floored_sizes_merge_together() {
        let policy = TieredMergePolicy {
            floor_segment_size: 10,
            max_merge_at_once: 4,
            max_segments_per_tier: 1,
            ..TieredMergePolicy::default()
        };
        let manifest = stub_manifest(&[(0, 4), (1, 3), (2, 2), (3, 1), (4, 1)]);

        let merge = policy.find_best_merge(&manifest, 0).unwrap();
        let mut ids: Vec<u32> = merge.segments.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_manifest() {
        let policy = TieredMergePolicy::default();
        assert!(policy.find_best_merge(&Manifest::new(), 0).is_none());
    }
}
