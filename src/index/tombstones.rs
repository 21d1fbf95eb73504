//! Deleted-file tombstones.
//!
//! An immutable `RoaringBitmap` of deleted ids behind an atomic pointer.
//! Mutation is optimistic copy-on-write: clone, modify, compare-and-swap,
//! retry if a concurrent writer won. Reads never lock and never observe a
//! partial update. Tombstones are additive within a generation; `clear` is
//! issued only by a successful full reindex.

use crate::store::FileId;
use arc_swap::ArcSwap;
use roaring::RoaringBitmap;
use std::sync::Arc;

pub struct DeletedFileTracker {
    set: ArcSwap<RoaringBitmap>,
}

impl DeletedFileTracker {
    pub fn new() -> Self {
        Self {
            set: ArcSwap::from_pointee(RoaringBitmap::new()),
        }
    }

    pub fn mark_deleted(&self, id: FileId) {
        self.set.rcu(|current| {
            let mut next = RoaringBitmap::clone(current);
            next.insert(id.0);
            next
        });
    }

    pub fn mark_deleted_batch(&self, ids: &[FileId]) {
        if ids.is_empty() {
            return;
        }
        self.set.rcu(|current| {
            let mut next = RoaringBitmap::clone(current);
            for id in ids {
                next.insert(id.0);
            }
            next
        });
    }

    pub fn is_deleted(&self, id: FileId) -> bool {
        self.set.load().contains(id.0)
    }

    /// Drop tombstoned ids from a candidate list. The filter observes one
    /// consistent generation: ids marked while the filter runs may or may not
    /// be dropped, but ids marked before it started always are.
    pub fn filter_candidates(&self, candidates: &[FileId]) -> Vec<FileId> {
        let deleted = self.set.load_full();
        candidates
            .iter()
            .copied()
            .filter(|id| !deleted.contains(id.0))
            .collect()
    }

    /// Bitmap variant used on the search read path.
    pub fn filter_bitmap(&self, candidates: &RoaringBitmap) -> RoaringBitmap {
        let deleted = self.set.load_full();
        candidates - deleted.as_ref()
    }

    /// Reset the set. Only a successful full reindex calls this; incremental
    /// reindexes never do.
    pub fn clear(&self) {
        self.set.store(Arc::new(RoaringBitmap::new()));
    }

    pub fn len(&self) -> u64 {
        self.set.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.load().is_empty()
    }
}

impl Default for DeletedFileTracker {
    fn default() -> Self {
        Self::new()
    }
}
