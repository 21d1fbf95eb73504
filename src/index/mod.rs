pub mod intern;
pub mod locations;
pub mod references;
pub mod snapshot;
pub mod symbols;
pub mod tombstones;
pub mod trigram;

pub use intern::StringInterner;
pub use locations::{compute_line_offsets, LocationIndex};
pub use references::{ReferenceQuality, ReferenceRecord, ReferenceTracker};
pub use snapshot::{FileSnapshot, SnapshotHolder};
pub use symbols::{SymbolIndex, SymbolRecord};
pub use tombstones::DeletedFileTracker;
pub use trigram::{
    bucket_for, pack_trigram, BucketedTrigramResult, Posting, TrigramIndex, TRIGRAM_BUCKETS,
};

use parking_lot::RwLock;

/// The live index bundle.
///
/// The inner locks guard memory safety; the coordination protocol (leases
/// acquired through the `coordinate` module in a total order) is what keeps
/// cross-index access deadlock-free and consistent. Writers go through the
/// single integrator; searches take read leases.
pub struct IndexSet {
    pub trigrams: RwLock<TrigramIndex>,
    pub symbols: RwLock<SymbolIndex>,
    pub references: RwLock<ReferenceTracker>,
    pub locations: RwLock<LocationIndex>,
    pub snapshot: SnapshotHolder,
    pub deleted: DeletedFileTracker,
}

impl IndexSet {
    pub fn new() -> Self {
        Self {
            trigrams: RwLock::new(TrigramIndex::new()),
            symbols: RwLock::new(SymbolIndex::new()),
            references: RwLock::new(ReferenceTracker::new()),
            locations: RwLock::new(LocationIndex::new()),
            snapshot: SnapshotHolder::new(),
            deleted: DeletedFileTracker::new(),
        }
    }
}

impl Default for IndexSet {
    fn default() -> Self {
        Self::new()
    }
}
