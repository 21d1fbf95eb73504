//! Grep-like and symbol-aware search over the live indexes.
//!
//! Candidate files come from the trigram index when the query allows it
//! (literal, case-sensitive, at least one trigram); otherwise every file in
//! the current snapshot is scanned. Tombstoned files are filtered before any
//! result is assembled. Per-file matching fans out over rayon.

use crate::config::SearchConfig;
use crate::index::IndexSet;
use crate::parse::{Language, SymbolKind};
use crate::store::{FileId, FileService};
use anyhow::{Context, Result};
use rayon::prelude::*;
use regex::Regex;
use roaring::RoaringBitmap;
use std::sync::Arc;

/// Search options; every field mirrors a documented search behavior knob.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub use_regex: bool,
    pub case_insensitive: bool,
    pub word_boundary: bool,
    pub invert_match: bool,
    pub files_only: bool,
    pub count_per_file: bool,
    pub max_count_per_file: Option<usize>,
    /// Additional patterns OR-ed with the primary one.
    pub patterns: Vec<String>,
    /// Regex over file paths; non-matching files are skipped.
    pub include_pattern: Option<String>,
    /// Regex over file paths; matching files are skipped.
    pub exclude_pattern: Option<String>,
    /// Restrict matches to declarations of these symbol kinds.
    pub symbol_types: Vec<SymbolKind>,
    pub declaration_only: bool,
    pub comments_only: bool,
    pub code_only: bool,
    pub max_context_lines: usize,
    /// Result cap; 0 falls back to the configured default.
    pub max_results: usize,
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub file_id: FileId,
    pub file_path: String,
    /// 1-based line number.
    pub line_number: usize,
    pub content: String,
    /// Context window including the matching line itself.
    pub context: Vec<String>,
    pub is_symbol: bool,
    /// Populated in count-per-file mode.
    pub match_count: Option<usize>,
}

pub struct Searcher {
    indexes: Arc<IndexSet>,
    store: Arc<FileService>,
    config: SearchConfig,
}

impl Searcher {
    pub fn new(indexes: Arc<IndexSet>, store: Arc<FileService>, config: SearchConfig) -> Self {
        Self {
            indexes,
            store,
            config,
        }
    }

    /// Plain substring/trigram search with a result cap.
    pub fn search(&self, pattern: &str, limit: usize) -> Result<Vec<SearchMatch>> {
        let options = SearchOptions {
            max_results: limit,
            ..Default::default()
        };
        self.search_with_options(pattern, &options)
    }

    pub fn search_with_options(
        &self,
        pattern: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchMatch>> {
        let patterns: Vec<&str> = if options.patterns.is_empty() {
            if pattern.is_empty() {
                Vec::new()
            } else {
                vec![pattern]
            }
        } else {
            options.patterns.iter().map(|s| s.as_str()).collect()
        };

        if patterns.is_empty() && !options.invert_match {
            return Ok(Vec::new());
        }

        let include = options
            .include_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid include pattern")?;
        let exclude = options
            .exclude_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid exclude pattern")?;

        let matchers = compile_matchers(&patterns, options)?;
        let file_ids = self.admitted_files(&patterns, options, &include, &exclude);

        let symbol_mode = options.declaration_only || !options.symbol_types.is_empty();

        let mut results: Vec<SearchMatch> = file_ids
            .par_iter()
            .filter_map(|&id| {
                if symbol_mode {
                    self.match_symbols(FileId(id), &matchers, options)
                } else {
                    self.match_lines(FileId(id), &matchers, options)
                }
            })
            .flatten()
            .collect();

        if results.is_empty() && self.config.enable_fuzzy && !options.case_insensitive {
            // Fuzzy fallback: retry the same query case-insensitively.
            // Candidates are recomputed; the case-sensitive narrowing above
            // may have excluded the files a relaxed match would hit.
            let mut relaxed = options.clone();
            relaxed.case_insensitive = true;
            let fuzzy = compile_matchers(&patterns, &relaxed)?;
            let relaxed_ids = self.admitted_files(&patterns, &relaxed, &include, &exclude);
            results = relaxed_ids
                .par_iter()
                .filter_map(|&id| self.match_lines(FileId(id), &fuzzy, &relaxed))
                .flatten()
                .collect();
        }

        results.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then(a.line_number.cmp(&b.line_number))
        });

        let cap = if options.max_results > 0 {
            options.max_results
        } else {
            self.config.max_results
        };
        results.truncate(cap);
        Ok(results)
    }

    /// Candidate files after tombstone filtering and path include/exclude.
    fn admitted_files(
        &self,
        patterns: &[&str],
        options: &SearchOptions,
        include: &Option<Regex>,
        exclude: &Option<Regex>,
    ) -> Vec<u32> {
        let candidates = self.candidate_files(patterns, options);
        // Tombstoned files never surface, whatever the candidate source was
        let candidates = self.indexes.deleted.filter_bitmap(&candidates);

        let snapshot = self.indexes.snapshot.load();
        candidates
            .iter()
            .filter(|&id| {
                let Some(path) = snapshot.path_for(FileId(id)) else {
                    return false;
                };
                let path = path.to_string_lossy();
                if let Some(include) = include {
                    if !include.is_match(&path) {
                        return false;
                    }
                }
                if let Some(exclude) = exclude {
                    if exclude.is_match(&path) {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    /// Candidate selection. Trigram narrowing applies only when every pattern
    /// is a case-sensitive literal with at least one trigram; everything else
    /// falls back to the full snapshot (inverted matches always do).
    fn candidate_files(&self, patterns: &[&str], options: &SearchOptions) -> RoaringBitmap {
        let can_narrow = !options.invert_match
            && !options.use_regex
            && !options.case_insensitive
            && !patterns.is_empty()
            && patterns.iter().all(|p| p.len() >= 3);

        if can_narrow {
            let trigrams = self.indexes.trigrams.read();
            let mut union = RoaringBitmap::new();
            for pattern in patterns {
                match trigrams.candidate_files(pattern.as_bytes()) {
                    Some(files) => union |= files,
                    None => return self.all_files(),
                }
            }
            return union;
        }
        self.all_files()
    }

    fn all_files(&self) -> RoaringBitmap {
        let snapshot = self.indexes.snapshot.load();
        let mut all = RoaringBitmap::new();
        for id in snapshot.file_ids() {
            all.insert(id.0);
        }
        all
    }

    /// Line-oriented matching within one file.
    fn match_lines(
        &self,
        file_id: FileId,
        matchers: &[Regex],
        options: &SearchOptions,
    ) -> Option<Vec<SearchMatch>> {
        let entry = self.store.get_content(file_id)?;
        let content = entry.text().ok()?;
        let path = entry.path.to_string_lossy().to_string();
        let language = entry.language;
        let lines: Vec<&str> = content.lines().collect();

        let symbols = self.indexes.symbols.read();
        let per_file_cap = options.max_count_per_file.unwrap_or(usize::MAX);

        let mut matches = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let hit = matchers.iter().any(|m| m.is_match(line));
            let hit = if options.invert_match { !hit } else { hit };
            if !hit {
                continue;
            }

            if options.comments_only && !is_comment_line(line, language) {
                continue;
            }
            if options.code_only && is_comment_line(line, language) {
                continue;
            }

            let is_symbol = symbols
                .symbols_at_line(file_id, index as u32)
                .iter()
                .any(|s| matchers.iter().any(|m| m.is_match(&s.name)));

            matches.push(SearchMatch {
                file_id,
                file_path: path.clone(),
                line_number: index + 1,
                content: line.to_string(),
                context: context_window(&lines, index, options.max_context_lines, &self.config),
                is_symbol,
                match_count: None,
            });

            if matches.len() >= per_file_cap {
                break;
            }
        }

        if matches.is_empty() {
            return None;
        }

        if options.count_per_file {
            let count = matches.len();
            let mut first = matches.swap_remove(0);
            first.match_count = Some(count);
            first.content.clear();
            first.context.clear();
            return Some(vec![first]);
        }

        if options.files_only || self.config.merge_file_results {
            let count = matches.len();
            let mut first = matches.swap_remove(0);
            if options.files_only {
                first.content.clear();
                first.context.clear();
            }
            first.match_count = Some(count);
            return Some(vec![first]);
        }

        Some(matches)
    }

    /// Declaration matching: hits are symbol definition sites, filtered by
    /// kind when requested.
    fn match_symbols(
        &self,
        file_id: FileId,
        matchers: &[Regex],
        options: &SearchOptions,
    ) -> Option<Vec<SearchMatch>> {
        let entry = self.store.get_content(file_id)?;
        let content = entry.text().ok()?;
        let path = entry.path.to_string_lossy().to_string();
        let lines: Vec<&str> = content.lines().collect();

        let symbols = self.indexes.symbols.read();
        let per_file_cap = options.max_count_per_file.unwrap_or(usize::MAX);

        let mut matches = Vec::new();
        for symbol in symbols.symbols_in_file(file_id) {
            if !options.symbol_types.is_empty() && !options.symbol_types.contains(&symbol.kind) {
                continue;
            }
            if !matchers.iter().any(|m| m.is_match(&symbol.name)) {
                continue;
            }
            let index = symbol.line as usize;
            matches.push(SearchMatch {
                file_id,
                file_path: path.clone(),
                line_number: index + 1,
                content: lines.get(index).unwrap_or(&"").to_string(),
                context: context_window(&lines, index, options.max_context_lines, &self.config),
                is_symbol: true,
                match_count: None,
            });
            if matches.len() >= per_file_cap {
                break;
            }
        }

        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }
}

/// Compile the pattern list into regex matchers honoring the option flags.
fn compile_matchers(patterns: &[&str], options: &SearchOptions) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let mut source = if options.use_regex {
                pattern.to_string()
            } else {
                regex::escape(pattern)
            };
            if options.word_boundary {
                source = format!(r"\b(?:{source})\b");
            }
            if options.case_insensitive {
                source = format!("(?i){source}");
            }
            Regex::new(&source).with_context(|| format!("Invalid search pattern: {pattern}"))
        })
        .collect()
}

/// Context lines around the match, clamped to the file and to the configured
/// ceiling; includes the matching line itself.
fn context_window(
    lines: &[&str],
    index: usize,
    requested: usize,
    config: &SearchConfig,
) -> Vec<String> {
    if requested == 0 {
        return Vec::new();
    }
    let span = requested.min(config.max_context_lines);
    let start = index.saturating_sub(span);
    let mut end = (index + span).min(lines.len().saturating_sub(1));

    if config.ensure_complete_stmt {
        // Extend forward a little until a line looks statement-terminated
        let limit = (end + 5).min(lines.len().saturating_sub(1));
        while end < limit {
            let trimmed = lines[end].trim_end();
            if trimmed.ends_with(';') || trimmed.ends_with('}') || trimmed.ends_with('{') {
                break;
            }
            end += 1;
        }
    }

    lines[start..=end].iter().map(|l| l.to_string()).collect()
}

/// Coarse comment-line classification by language family.
fn is_comment_line(line: &str, language: Language) -> bool {
    let trimmed = line.trim_start();
    match language {
        Language::Python | Language::Shell | Language::Ruby | Language::Yaml | Language::Toml => {
            trimmed.starts_with('#')
        }
        Language::Html | Language::Markdown => trimmed.starts_with("<!--"),
        _ => {
            trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with("* ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_word_boundary() {
        let options = SearchOptions {
            word_boundary: true,
            ..Default::default()
        };
        let matchers = compile_matchers(&["user"], &options).unwrap();
        assert!(matchers[0].is_match("var user = 1"));
        assert!(!matchers[0].is_match("var username = 1"));
    }

    #[test]
    fn test_compile_escapes_literals() {
        let matchers = compile_matchers(&["a.b(c)"], &SearchOptions::default()).unwrap();
        assert!(matchers[0].is_match("call a.b(c) here"));
        assert!(!matchers[0].is_match("axb(c)"));
    }

    #[test]
    fn test_compile_case_insensitive() {
        let options = SearchOptions {
            case_insensitive: true,
            ..Default::default()
        };
        let matchers = compile_matchers(&["Error"], &options).unwrap();
        assert!(matchers[0].is_match("ERROR: failed"));
        assert!(matchers[0].is_match("error: failed"));
    }

    #[test]
    fn test_context_window_clamps() {
        let lines = vec!["l1", "l2", "l3", "l4", "l5"];
        let config = SearchConfig::default();

        let middle = context_window(&lines, 2, 1, &config);
        assert_eq!(middle, vec!["l2", "l3", "l4"]);

        let edge = context_window(&lines, 0, 2, &config);
        assert_eq!(edge, vec!["l1", "l2", "l3"]);

        let none = context_window(&lines, 2, 0, &config);
        assert!(none.is_empty());
    }

    #[test]
    fn test_comment_classification() {
        assert!(is_comment_line("  // note", Language::Rust));
        assert!(is_comment_line("# note", Language::Python));
        assert!(!is_comment_line("let x = 1; // trailing", Language::Rust));
        assert!(!is_comment_line("code()", Language::Rust));
    }
}
