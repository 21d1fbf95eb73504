//! Canonical content store keyed by `FileId`.
//!
//! The store is the source of truth for file bytes during parsing: content
//! returned by `get_content` is stable until the entry is evicted or
//! replaced, and replaced entries stay alive for readers still holding them.

use crate::parse::Language;
use anyhow::{Context, Result};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

/// Opaque integer handle for a file's content. Never reused within a run.
/// `FileId::NONE` (0) means "not a file" (e.g. a directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    pub const NONE: FileId = FileId(0);

    pub fn is_file(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File bytes, either memory-mapped from disk or owned (in-memory updates).
enum ContentBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ContentBytes {
    fn as_bytes(&self) -> &[u8] {
        match self {
            ContentBytes::Mapped(mmap) => mmap,
            ContentBytes::Owned(bytes) => bytes,
        }
    }
}

/// A single canonicalized content entry.
pub struct ContentEntry {
    pub id: FileId,
    pub path: PathBuf,
    pub language: Language,
    pub mtime: Option<SystemTime>,
    bytes: ContentBytes,
    /// Cached result of UTF-8 validation (validated once, reused on subsequent calls)
    utf8_valid: OnceLock<bool>,
}

impl ContentEntry {
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.bytes.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.as_bytes().is_empty()
    }

    /// Content as a string slice, if valid UTF-8.
    /// Validation is cached after the first call.
    pub fn text(&self) -> Result<&str> {
        let is_valid = *self
            .utf8_valid
            .get_or_init(|| std::str::from_utf8(self.bytes.as_bytes()).is_ok());

        if is_valid {
            // SAFETY: validated above and the result is cached
            Ok(unsafe { std::str::from_utf8_unchecked(self.bytes.as_bytes()) })
        } else {
            anyhow::bail!("File is not valid UTF-8: {}", self.path.display())
        }
    }
}

/// Id-ified content cache. Writes are serialized; reads are lock-free after
/// the entry `Arc` is acquired.
pub struct FileService {
    entries: RwLock<FxHashMap<u32, Arc<ContentEntry>>>,
    path_to_id: Mutex<FxHashMap<PathBuf, u32>>,
    next_id: AtomicU32,
}

impl FileService {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            path_to_id: Mutex::new(FxHashMap::default()),
            // 0 is reserved for "not a file"
            next_id: AtomicU32::new(1),
        }
    }

    /// Load a file from disk and return its id. The first load assigns a
    /// fresh id; later loads of the same canonical path refresh the content
    /// under the existing id. Directories yield `FileId::NONE`.
    pub fn load_file(&self, path: &Path) -> Result<FileId> {
        if path.is_dir() {
            return Ok(FileId::NONE);
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let metadata = file.metadata().ok();
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("Failed to mmap file: {}", path.display()))?
        };

        self.insert(
            path,
            ContentBytes::Mapped(mmap),
            metadata.and_then(|m| m.modified().ok()),
        )
    }

    /// Register in-memory content (e.g. unsaved editor buffers) under a path.
    pub fn load_file_from_memory(&self, path: &Path, bytes: Vec<u8>) -> Result<FileId> {
        self.insert(path, ContentBytes::Owned(bytes), Some(SystemTime::now()))
    }

    fn insert(
        &self,
        path: &Path,
        bytes: ContentBytes,
        mtime: Option<SystemTime>,
    ) -> Result<FileId> {
        // Canonicalize to handle symlinks and differing path representations
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let mut ids = self.path_to_id.lock();
        let id = match ids.get(&canonical) {
            Some(&existing) => FileId(existing),
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                ids.insert(canonical.clone(), id);
                FileId(id)
            }
        };

        let entry = Arc::new(ContentEntry {
            id,
            path: canonical,
            language: Language::from_path(path),
            mtime,
            bytes,
            utf8_valid: OnceLock::new(),
        });
        self.entries.write().insert(id.0, entry);
        Ok(id)
    }

    /// Read-only view of the entry's content. Readers keep the returned
    /// `Arc` alive across eviction or replacement.
    pub fn get_content(&self, id: FileId) -> Option<Arc<ContentEntry>> {
        self.entries.read().get(&id.0).cloned()
    }

    /// Id for an already-loaded path, if any.
    pub fn id_of(&self, path: &Path) -> Option<FileId> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.path_to_id.lock().get(&canonical).copied().map(FileId)
    }

    /// Remove an entry. The id is never reassigned.
    pub fn evict(&self, id: FileId) {
        let path = self.entries.read().get(&id.0).map(|e| e.path.clone());
        let Some(path) = path else {
            return;
        };
        // Same lock order as insert: path map first, then the entry map
        let mut ids = self.path_to_id.lock();
        if ids.get(&path) == Some(&id.0) {
            ids.remove(&path);
        }
        self.entries.write().remove(&id.0);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total size of all stored content.
    pub fn total_size(&self) -> u64 {
        self.entries.read().values().map(|e| e.len() as u64).sum()
    }
}

impl Default for FileService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_assigns_stable_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rs");
        fs::write(&path, "fn a() {}").unwrap();

        let store = FileService::new();
        let id1 = store.load_file(&path).unwrap();
        let id2 = store.load_file(&path).unwrap();
        assert_eq!(id1, id2);
        assert!(id1.is_file());
    }

    #[test]
    fn test_directory_yields_none() {
        let dir = TempDir::new().unwrap();
        let store = FileService::new();
        let id = store.load_file(dir.path()).unwrap();
        assert_eq!(id, FileId::NONE);
    }

    #[test]
    fn test_content_stable_for_held_readers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "old content").unwrap();

        let store = FileService::new();
        let id = store.load_file(&path).unwrap();
        let held = store.get_content(id).unwrap();

        let id2 = store
            .load_file_from_memory(&path, b"new content".to_vec())
            .unwrap();
        assert_eq!(id, id2);

        // The held view still sees the bytes it was parsed against
        assert_eq!(held.text().unwrap(), "old content");
        assert_eq!(store.get_content(id).unwrap().text().unwrap(), "new content");
    }

    #[test]
    fn test_evict_removes_entry_but_not_id_space() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let store = FileService::new();
        let id_a = store.load_file(&a).unwrap();
        store.evict(id_a);
        assert!(store.get_content(id_a).is_none());

        // Ids keep increasing; evicted ids are not reused
        let id_b = store.load_file(&b).unwrap();
        assert!(id_b.0 > id_a.0);
    }

    #[test]
    fn test_invalid_utf8_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin.dat");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x41]).unwrap();

        let store = FileService::new();
        let id = store.load_file(&path).unwrap();
        let entry = store.get_content(id).unwrap();
        assert!(entry.text().is_err());
        assert_eq!(entry.bytes().len(), 4);
    }
}
