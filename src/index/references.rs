//! Reference tracking and resolution against the symbol index.
//!
//! Raw references from the parser are resolved at integration time: a
//! same-file definition match is `Exact`, cross-file matches are `Heuristic`,
//! and unmatched names are kept unresolved with a failure reason so tooling
//! can inspect why.

use crate::index::symbols::{SymbolIndex, SymbolRecord};
use crate::parse::RawReference;
use crate::store::FileId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceQuality {
    Exact,
    Heuristic,
}

/// A reference after resolution.
#[derive(Debug, Clone)]
pub struct ReferenceRecord {
    /// Ordinal of the enclosing symbol in the source file, when known.
    pub source_symbol: Option<u32>,
    pub referenced_name: Arc<str>,
    pub candidates: Vec<Arc<SymbolRecord>>,
    pub resolved: bool,
    pub quality: ReferenceQuality,
    pub failure_reason: Option<&'static str>,
    pub file_id: FileId,
    pub line: u32,
}

#[derive(Default)]
pub struct ReferenceTracker {
    by_file: FxHashMap<u32, Vec<ReferenceRecord>>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and store a file's references using the current symbol index.
    pub fn insert_file(
        &mut self,
        file_id: FileId,
        references: Vec<(RawReference, Arc<str>)>,
        symbols: &SymbolIndex,
    ) {
        let records = references
            .into_iter()
            .map(|(raw, name)| Self::resolve(file_id, raw, name, symbols))
            .collect();
        self.by_file.insert(file_id.0, records);
    }

    fn resolve(
        file_id: FileId,
        raw: RawReference,
        name: Arc<str>,
        symbols: &SymbolIndex,
    ) -> ReferenceRecord {
        let sites = symbols.lookup(&name);

        let same_file: Vec<Arc<SymbolRecord>> = sites
            .iter()
            .filter(|s| s.file_id == file_id)
            .cloned()
            .collect();

        let (candidates, resolved, quality, failure_reason) = if !same_file.is_empty() {
            (same_file, true, ReferenceQuality::Exact, None)
        } else if !sites.is_empty() {
            (sites.to_vec(), true, ReferenceQuality::Heuristic, None)
        } else {
            (
                Vec::new(),
                false,
                ReferenceQuality::Heuristic,
                Some("no definition found"),
            )
        };

        ReferenceRecord {
            source_symbol: raw.source_symbol,
            referenced_name: name,
            candidates,
            resolved,
            quality,
            failure_reason,
            file_id,
            line: raw.line,
        }
    }

    pub fn remove_file(&mut self, file_id: FileId) {
        self.by_file.remove(&file_id.0);
    }

    pub fn references_in_file(&self, file_id: FileId) -> &[ReferenceRecord] {
        self.by_file
            .get(&file_id.0)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All resolved references whose candidate set includes a definition in
    /// the given file (i.e. incoming references).
    pub fn references_to_file(&self, target: FileId) -> Vec<&ReferenceRecord> {
        self.by_file
            .values()
            .flatten()
            .filter(|r| r.candidates.iter().any(|c| c.file_id == target))
            .collect()
    }

    pub fn total_references(&self) -> usize {
        self.by_file.values().map(|v| v.len()).sum()
    }
}
