//! Per-file line offset tables for O(log n) byte-offset → line mapping.
//!
//! Processors compute the offsets in their single pass over content; the
//! integrator stores them here so searches can translate trigram posting
//! offsets into line numbers without re-scanning file bytes.

use crate::store::FileId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct LocationIndex {
    /// file → byte offset of the start of each line, ascending.
    offsets: FxHashMap<u32, Arc<Vec<u32>>>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&mut self, file_id: FileId, line_offsets: Arc<Vec<u32>>) {
        self.offsets.insert(file_id.0, line_offsets);
    }

    pub fn remove_file(&mut self, file_id: FileId) {
        self.offsets.remove(&file_id.0);
    }

    pub fn line_offsets(&self, file_id: FileId) -> Option<&Arc<Vec<u32>>> {
        self.offsets.get(&file_id.0)
    }

    /// 0-based line containing the byte offset.
    pub fn line_at_offset(&self, file_id: FileId, offset: u32) -> Option<u32> {
        let offsets = self.offsets.get(&file_id.0)?;
        if offsets.is_empty() {
            return None;
        }
        let line = match offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        Some(line as u32)
    }

    pub fn file_count(&self) -> usize {
        self.offsets.len()
    }
}

/// Byte offset of the start of each line. The first line starts at 0;
/// subsequent lines start one past each newline.
pub fn compute_line_offsets(content: &[u8]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(content.len() / 32 + 1);
    offsets.push(0);
    for pos in memchr::memchr_iter(b'\n', content) {
        offsets.push(pos as u32 + 1);
    }
    offsets
}
