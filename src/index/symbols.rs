//! Symbol index: name → definition sites, plus per-file symbol lists.
//!
//! Names are interned `Arc<str>`s supplied by the integrator. Write ops are
//! integrator-only; searches read under a read lease.

use crate::parse::{Symbol, SymbolKind};
use crate::store::FileId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A symbol as stored in the index, with its interned name and the chain of
/// enclosing scope ordinals computed by the processor.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub id: u32,
    pub name: Arc<str>,
    pub kind: SymbolKind,
    pub file_id: FileId,
    pub line: u32,
    pub end_line: u32,
    pub col: u32,
    pub end_col: u32,
    /// Indexes into the file's scope list, outermost first.
    pub scope_chain: Arc<Vec<u16>>,
}

impl SymbolRecord {
    pub fn from_symbol(symbol: &Symbol, name: Arc<str>, scope_chain: Arc<Vec<u16>>) -> Self {
        Self {
            id: symbol.id,
            name,
            kind: symbol.kind,
            file_id: symbol.file_id,
            line: symbol.line,
            end_line: symbol.end_line,
            col: symbol.col,
            end_col: symbol.end_col,
            scope_chain,
        }
    }
}

#[derive(Default)]
pub struct SymbolIndex {
    /// Per-file symbol lists, in parser emission order.
    by_file: FxHashMap<u32, Vec<Arc<SymbolRecord>>>,
    /// Name → definition sites across all files.
    by_name: FxHashMap<Arc<str>, Vec<Arc<SymbolRecord>>>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a file's symbols. Prior entries for the file must already have
    /// been removed via `remove_file` when re-indexing.
    pub fn insert_file(&mut self, file_id: FileId, symbols: Vec<Arc<SymbolRecord>>) {
        for symbol in &symbols {
            self.by_name
                .entry(symbol.name.clone())
                .or_default()
                .push(symbol.clone());
        }
        self.by_file.insert(file_id.0, symbols);
    }

    pub fn remove_file(&mut self, file_id: FileId) {
        let Some(symbols) = self.by_file.remove(&file_id.0) else {
            return;
        };
        for symbol in symbols {
            if let Some(sites) = self.by_name.get_mut(&symbol.name) {
                sites.retain(|s| s.file_id != file_id);
                if sites.is_empty() {
                    self.by_name.remove(&symbol.name);
                }
            }
        }
    }

    /// Definition sites for an exact name.
    pub fn lookup(&self, name: &str) -> &[Arc<SymbolRecord>] {
        self.by_name.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Definition sites for a name, restricted to the given kinds
    /// (empty = all kinds).
    pub fn lookup_kinds(&self, name: &str, kinds: &[SymbolKind]) -> Vec<Arc<SymbolRecord>> {
        self.lookup(name)
            .iter()
            .filter(|s| kinds.is_empty() || kinds.contains(&s.kind))
            .cloned()
            .collect()
    }

    pub fn symbols_in_file(&self, file_id: FileId) -> &[Arc<SymbolRecord>] {
        self.by_file
            .get(&file_id.0)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Symbols declared on the given line of a file.
    pub fn symbols_at_line(&self, file_id: FileId, line: u32) -> Vec<Arc<SymbolRecord>> {
        self.symbols_in_file(file_id)
            .iter()
            .filter(|s| s.line == line)
            .cloned()
            .collect()
    }

    pub fn total_symbols(&self) -> usize {
        self.by_file.values().map(|v| v.len()).sum()
    }

    pub fn file_count(&self) -> usize {
        self.by_file.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, name: &str, kind: SymbolKind, file: u32, line: u32) -> Arc<SymbolRecord> {
        Arc::new(SymbolRecord {
            id,
            name: Arc::from(name),
            kind,
            file_id: FileId(file),
            line,
            end_line: line,
            col: 0,
            end_col: 0,
            scope_chain: Arc::new(Vec::new()),
        })
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = SymbolIndex::new();
        index.insert_file(
            FileId(1),
            vec![
                record(0, "parse", SymbolKind::Function, 1, 3),
                record(1, "Config", SymbolKind::Struct, 1, 10),
            ],
        );
        index.insert_file(FileId(2), vec![record(0, "parse", SymbolKind::Function, 2, 7)]);

        assert_eq!(index.lookup("parse").len(), 2);
        assert_eq!(index.lookup("Config").len(), 1);
        assert!(index.lookup("missing").is_empty());
        assert_eq!(index.total_symbols(), 3);
    }

    #[test]
    fn test_lookup_kinds_filters() {
        let mut index = SymbolIndex::new();
        index.insert_file(
            FileId(1),
            vec![
                record(0, "value", SymbolKind::Function, 1, 1),
                record(1, "value", SymbolKind::Variable, 1, 5),
            ],
        );

        let functions = index.lookup_kinds("value", &[SymbolKind::Function]);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].kind, SymbolKind::Function);

        let all = index.lookup_kinds("value", &[]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_remove_file_drops_name_entries() {
        let mut index = SymbolIndex::new();
        index.insert_file(FileId(1), vec![record(0, "solo", SymbolKind::Function, 1, 1)]);
        index.insert_file(FileId(2), vec![record(0, "solo", SymbolKind::Function, 2, 1)]);

        index.remove_file(FileId(1));
        assert_eq!(index.lookup("solo").len(), 1);
        assert_eq!(index.lookup("solo")[0].file_id, FileId(2));

        index.remove_file(FileId(2));
        assert!(index.lookup("solo").is_empty());
    }
}
