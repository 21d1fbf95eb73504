//! Bucketed trigram postings index.
//!
//! Trigrams are 24-bit keys mapped to ordered `(file, byte offset)` postings.
//! The map is sharded into a fixed number of buckets by a deterministic hash
//! so per-file contributions computed by processors can be merged bucket by
//! bucket without cross-bucket contention.

use crate::store::FileId;
use roaring::RoaringBitmap;
use rustc_hash::{FxHashMap, FxHashSet};

/// Number of posting buckets. Must be a power of two.
pub const TRIGRAM_BUCKETS: usize = 64;

/// Files smaller than this skip the per-bucket capacity estimate.
const SMALL_FILE_BYTES: usize = 4096;

/// Pack 3 bytes into a 24-bit trigram key.
#[inline]
pub fn pack_trigram(bytes: [u8; 3]) -> u32 {
    (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
}

/// Deterministic bucket assignment for a trigram key.
#[inline]
pub fn bucket_for(trigram: u32) -> usize {
    // Knuth multiplicative hash over the 24-bit key, folded to bucket range
    let hashed = (trigram as u64).wrapping_mul(0x9e3779b97f4a7c15);
    (hashed >> 40) as usize & (TRIGRAM_BUCKETS - 1)
}

/// A single posting: a file and the byte offset of the trigram within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub file_id: u32,
    pub offset: u32,
}

/// Per-file, pre-sharded trigram contribution produced by processors.
///
/// Offsets per trigram are appended in ascending order (single forward pass
/// over the content), which the integrator relies on when merging.
pub struct BucketedTrigramResult {
    buckets: Vec<FxHashMap<u32, Vec<u32>>>,
}

impl BucketedTrigramResult {
    /// Single pass over content, emitting `(trigram, offset)` into the bucket
    /// chosen by `bucket_for`. Bucket maps are pre-sized from content length;
    /// small files skip the estimate.
    pub fn extract(content: &[u8]) -> Self {
        let trigram_count = content.len().saturating_sub(2);

        let per_bucket_estimate = if content.len() < SMALL_FILE_BYTES {
            0
        } else {
            (content.len() / 10) / TRIGRAM_BUCKETS
        };

        let mut buckets: Vec<FxHashMap<u32, Vec<u32>>> = (0..TRIGRAM_BUCKETS)
            .map(|_| FxHashMap::with_capacity_and_hasher(per_bucket_estimate, Default::default()))
            .collect();

        for i in 0..trigram_count {
            let trigram = pack_trigram([content[i], content[i + 1], content[i + 2]]);
            buckets[bucket_for(trigram)]
                .entry(trigram)
                .or_default()
                .push(i as u32);
        }

        Self { buckets }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Total number of distinct trigrams in this contribution.
    pub fn distinct_trigrams(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

#[derive(Default)]
struct TrigramBucket {
    postings: FxHashMap<u32, Vec<Posting>>,
}

/// The live postings index. Mutated only by the integrator under its write
/// lease; searches read it under a read lease.
pub struct TrigramIndex {
    buckets: Vec<TrigramBucket>,
}

impl TrigramIndex {
    pub fn new() -> Self {
        Self {
            buckets: (0..TRIGRAM_BUCKETS)
                .map(|_| TrigramBucket::default())
                .collect(),
        }
    }

    /// Merge a file's pre-sharded contribution, bucket by bucket.
    pub fn merge_file(&mut self, file_id: FileId, result: BucketedTrigramResult) {
        for (bucket, incoming) in self.buckets.iter_mut().zip(result.buckets) {
            for (trigram, offsets) in incoming {
                let postings = bucket.postings.entry(trigram).or_default();
                postings.reserve(offsets.len());
                for offset in offsets {
                    postings.push(Posting {
                        file_id: file_id.0,
                        offset,
                    });
                }
            }
        }
    }

    /// Remove all postings for a file (re-index or deletion).
    pub fn remove_file(&mut self, file_id: FileId) {
        for bucket in &mut self.buckets {
            bucket.postings.retain(|_, postings| {
                postings.retain(|p| p.file_id != file_id.0);
                !postings.is_empty()
            });
        }
    }

    /// Files containing every trigram of `query`.
    ///
    /// Returns `None` when the query is too short to produce a trigram, in
    /// which case the caller must fall back to scanning all files. An empty
    /// bitmap means the query provably matches nothing.
    pub fn candidate_files(&self, query: &[u8]) -> Option<RoaringBitmap> {
        if query.len() < 3 {
            return None;
        }

        let mut unique = FxHashSet::default();
        for window in query.windows(3) {
            unique.insert(pack_trigram([window[0], window[1], window[2]]));
        }

        let mut bitmaps: Vec<RoaringBitmap> = Vec::with_capacity(unique.len());
        for trigram in unique {
            match self.files_with_trigram(trigram) {
                Some(files) => bitmaps.push(files),
                // A trigram absent from the index means no file can match
                None => return Some(RoaringBitmap::new()),
            }
        }

        // Intersect smallest-first for the cheapest early exit
        bitmaps.sort_by_key(|b| b.len());
        let mut iter = bitmaps.into_iter();
        let mut result = iter.next()?;
        for bitmap in iter {
            result &= bitmap;
            if result.is_empty() {
                break;
            }
        }
        Some(result)
    }

    fn files_with_trigram(&self, trigram: u32) -> Option<RoaringBitmap> {
        let postings = self.buckets[bucket_for(trigram)].postings.get(&trigram)?;
        let mut files = RoaringBitmap::new();
        for posting in postings {
            files.insert(posting.file_id);
        }
        Some(files)
    }

    /// Ordered postings for one trigram, if present.
    pub fn postings(&self, trigram: u32) -> Option<&[Posting]> {
        self.buckets[bucket_for(trigram)]
            .postings
            .get(&trigram)
            .map(|v| v.as_slice())
    }

    pub fn num_trigrams(&self) -> usize {
        self.buckets.iter().map(|b| b.postings.len()).sum()
    }

    /// All file ids present in the index.
    pub fn all_files(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        for bucket in &self.buckets {
            for postings in bucket.postings.values() {
                for posting in postings {
                    all.insert(posting.file_id);
                }
            }
        }
        all
    }
}

impl Default for TrigramIndex {
    fn default() -> Self {
        Self::new()
    }
}
