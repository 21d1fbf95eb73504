//! Immutable path↔id snapshots published by atomic pointer swap.
//!
//! Readers grab the current `Arc<FileSnapshot>` without locking and keep a
//! consistent view for as long as they hold it. The integrator is the only
//! writer: it builds a new snapshot copy-on-write and swaps the pointer, so
//! publication is linearizable.

use crate::parse::ScopeInfo;
use crate::store::FileId;
use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable bundle of path↔id mappings and per-file scopes.
///
/// `forward` and `reverse` are mutual inverses, and every id with scopes
/// appears in `reverse`. Never mutated after publication.
#[derive(Default)]
pub struct FileSnapshot {
    forward: FxHashMap<PathBuf, u32>,
    reverse: FxHashMap<u32, PathBuf>,
    scopes: FxHashMap<u32, Arc<Vec<ScopeInfo>>>,
}

impl FileSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn id_for(&self, path: &Path) -> Option<FileId> {
        self.forward.get(path).copied().map(FileId)
    }

    pub fn path_for(&self, id: FileId) -> Option<&Path> {
        self.reverse.get(&id.0).map(|p| p.as_path())
    }

    pub fn scopes_for(&self, id: FileId) -> Option<&Arc<Vec<ScopeInfo>>> {
        self.scopes.get(&id.0)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn file_ids(&self) -> impl Iterator<Item = FileId> + '_ {
        self.reverse.keys().map(|&id| FileId(id))
    }

    /// Copy-on-write insert: a new snapshot with the entry added or updated.
    /// Maps are sized for the incoming entry up front.
    fn with_file(&self, path: PathBuf, id: FileId, scopes: Arc<Vec<ScopeInfo>>) -> Self {
        let mut forward = FxHashMap::with_capacity_and_hasher(self.forward.len() + 1, Default::default());
        let mut reverse = FxHashMap::with_capacity_and_hasher(self.reverse.len() + 1, Default::default());
        let mut scope_map = FxHashMap::with_capacity_and_hasher(self.scopes.len() + 1, Default::default());

        for (p, &i) in &self.forward {
            // A path re-indexed under a new id must not leave the old pair behind
            if *p == path || i == id.0 {
                continue;
            }
            forward.insert(p.clone(), i);
            reverse.insert(i, p.clone());
            if let Some(s) = self.scopes.get(&i) {
                scope_map.insert(i, s.clone());
            }
        }

        forward.insert(path.clone(), id.0);
        reverse.insert(id.0, path);
        scope_map.insert(id.0, scopes);

        Self {
            forward,
            reverse,
            scopes: scope_map,
        }
    }

    /// Copy-on-write removal by id.
    fn without_file(&self, id: FileId) -> Self {
        let mut forward = self.forward.clone();
        let mut reverse = self.reverse.clone();
        let mut scopes = self.scopes.clone();
        if let Some(path) = reverse.remove(&id.0) {
            forward.remove(&path);
        }
        scopes.remove(&id.0);
        Self {
            forward,
            reverse,
            scopes,
        }
    }
}

/// Holder of the current snapshot pointer.
pub struct SnapshotHolder {
    current: ArcSwap<FileSnapshot>,
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(FileSnapshot::empty()),
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn load(&self) -> Arc<FileSnapshot> {
        self.current.load_full()
    }

    /// Publish a snapshot containing the given file. Single-writer: only the
    /// integrator calls this.
    pub fn publish_file(&self, path: PathBuf, id: FileId, scopes: Arc<Vec<ScopeInfo>>) {
        let next = self.current.load().with_file(path, id, scopes);
        self.current.store(Arc::new(next));
    }

    /// Publish a snapshot without the given file.
    pub fn publish_removal(&self, id: FileId) {
        let next = self.current.load().without_file(id);
        self.current.store(Arc::new(next));
    }

    /// Reset to an empty snapshot.
    pub fn reset(&self) {
        self.current.store(Arc::new(FileSnapshot::empty()));
    }
}

impl Default for SnapshotHolder {
    fn default() -> Self {
        Self::new()
    }
}
