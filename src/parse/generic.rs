//! Generic line-oriented parser used when no dedicated parser is available.
//!
//! Recognizes declaration keywords for the common languages and derives
//! coarse scopes from declaration extents. Deliberately conservative: it
//! never guesses at nesting beyond what indentation-free scanning supports,
//! and unknown languages produce only the file-level module scope.

use super::{
    AstHandle, Language, ParseOutput, ParsePerf, Parser, RawReference, ScopeInfo, ScopeKind,
    Symbol, SymbolKind,
};
use crate::store::FileId;
use anyhow::Result;
use std::path::Path;
use std::time::Instant;

pub struct GenericParser {
    language: Language,
}

impl GenericParser {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    /// Declaration keywords for the language: (keyword, kind, skip_to_name).
    fn keywords(&self) -> &'static [(&'static str, SymbolKind)] {
        match self.language {
            Language::Rust => &[
                ("fn ", SymbolKind::Function),
                ("struct ", SymbolKind::Struct),
                ("enum ", SymbolKind::Enum),
                ("trait ", SymbolKind::Trait),
                ("type ", SymbolKind::Type),
                ("const ", SymbolKind::Constant),
                ("static ", SymbolKind::Constant),
                ("mod ", SymbolKind::Module),
                ("use ", SymbolKind::Import),
            ],
            Language::Python => &[
                ("def ", SymbolKind::Function),
                ("class ", SymbolKind::Class),
                ("import ", SymbolKind::Import),
                ("from ", SymbolKind::Import),
            ],
            Language::JavaScript | Language::TypeScript => &[
                ("function ", SymbolKind::Function),
                ("class ", SymbolKind::Class),
                ("interface ", SymbolKind::Interface),
                ("type ", SymbolKind::Type),
                ("const ", SymbolKind::Variable),
                ("let ", SymbolKind::Variable),
                ("import ", SymbolKind::Import),
            ],
            Language::Go => &[
                ("func ", SymbolKind::Function),
                ("type ", SymbolKind::Type),
                ("var ", SymbolKind::Variable),
                ("const ", SymbolKind::Constant),
                ("import ", SymbolKind::Import),
            ],
            Language::Java | Language::CSharp => &[
                ("class ", SymbolKind::Class),
                ("interface ", SymbolKind::Interface),
                ("enum ", SymbolKind::Enum),
                ("import ", SymbolKind::Import),
                ("using ", SymbolKind::Import),
            ],
            Language::Ruby => &[
                ("def ", SymbolKind::Function),
                ("class ", SymbolKind::Class),
                ("module ", SymbolKind::Module),
                ("require ", SymbolKind::Import),
            ],
            _ => &[],
        }
    }
}

impl Parser for GenericParser {
    fn language(&self) -> Language {
        self.language
    }

    fn parse(&mut self, path: &Path, content: &str, file_id: FileId) -> Result<ParseOutput> {
        let started = Instant::now();
        let keywords = self.keywords();

        let mut symbols: Vec<Symbol> = Vec::new();
        let mut references: Vec<RawReference> = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            let line_no = line_no as u32;
            let trimmed = line.trim_start();
            let indent = (line.len() - trimmed.len()) as u32;

            // Strip common visibility/modifier prefixes before keyword matching
            let stripped = strip_modifiers(trimmed);

            let mut declared = false;
            for &(keyword, kind) in keywords {
                if let Some(rest) = stripped.strip_prefix(keyword) {
                    if let Some(name) = leading_identifier(rest) {
                        symbols.push(Symbol {
                            id: symbols.len() as u32,
                            name: name.to_string(),
                            kind,
                            file_id,
                            line: line_no,
                            end_line: line_no,
                            col: indent,
                            end_col: indent + stripped.len() as u32,
                        });
                        declared = true;
                    }
                    break;
                }
            }

            if !declared {
                // Call-shaped tokens are recorded as unresolved references
                for name in call_sites(trimmed) {
                    references.push(RawReference {
                        referenced_name: name.to_string(),
                        line: line_no,
                        source_symbol: None,
                    });
                }
            }
        }

        let total_lines = content.lines().count() as u32;

        // Extend each container symbol to the line before the next declaration
        // at the same or shallower column; the last one runs to end of file.
        close_extents(&mut symbols, total_lines);

        // Attribute references to their enclosing symbol by line extent
        for reference in &mut references {
            reference.source_symbol = symbols
                .iter()
                .filter(|s| is_container(s.kind))
                .filter(|s| reference.line >= s.line && reference.line <= s.end_line)
                .map(|s| s.id)
                .last();
        }

        let mut scopes = vec![ScopeInfo {
            kind: ScopeKind::Module,
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            start_line: 0,
            end_line: 0,
        }];
        for symbol in symbols.iter().filter(|s| is_container(s.kind)) {
            scopes.push(ScopeInfo {
                kind: match symbol.kind {
                    SymbolKind::Function | SymbolKind::Method => ScopeKind::Function,
                    _ => ScopeKind::Type,
                },
                name: symbol.name.clone(),
                start_line: symbol.line,
                end_line: symbol.end_line,
            });
        }

        Ok(ParseOutput {
            ast: AstHandle::none(),
            symbols,
            references,
            scopes,
            perf: ParsePerf {
                parse_time: started.elapsed(),
                node_count: total_lines as usize,
            },
            diagnostics: Vec::new(),
        })
    }
}

fn is_container(kind: SymbolKind) -> bool {
    matches!(
        kind,
        SymbolKind::Function
            | SymbolKind::Method
            | SymbolKind::Class
            | SymbolKind::Struct
            | SymbolKind::Enum
            | SymbolKind::Trait
            | SymbolKind::Interface
            | SymbolKind::Module
    )
}

fn strip_modifiers(line: &str) -> &str {
    let mut rest = line;
    loop {
        let mut advanced = false;
        for modifier in [
            "pub(crate) ", "pub ", "export ", "default ", "async ", "static ", "public ",
            "private ", "protected ", "abstract ", "unsafe ", "extern ",
        ] {
            if let Some(stripped) = rest.strip_prefix(modifier) {
                rest = stripped;
                advanced = true;
            }
        }
        if !advanced {
            return rest;
        }
    }
}

/// First identifier in the string, if it starts with one.
fn leading_identifier(s: &str) -> Option<&str> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some(&s[..end])
    }
}

/// Identifiers immediately followed by `(`, skipping obvious keywords.
fn call_sites(line: &str) -> Vec<&str> {
    const SKIP: &[&str] = &["if", "for", "while", "match", "switch", "return", "fn"];

    let bytes = line.as_bytes();
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        let is_ident = b.is_ascii_alphanumeric() || b == b'_';
        match (start, is_ident) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                if b == b'(' {
                    let name = &line[s..i];
                    if !SKIP.contains(&name) && !name.as_bytes()[0].is_ascii_digit() {
                        out.push(name);
                    }
                }
                start = None;
            }
            _ => {}
        }
    }
    out
}

/// Give container symbols an extent ending where the next declaration at the
/// same or shallower indentation starts.
fn close_extents(symbols: &mut [Symbol], total_lines: u32) {
    let decl_positions: Vec<(u32, u32)> = symbols
        .iter()
        .filter(|s| is_container(s.kind))
        .map(|s| (s.line, s.col))
        .collect();

    for symbol in symbols.iter_mut().filter(|s| is_container(s.kind)) {
        let next_start = decl_positions
            .iter()
            .filter(|&&(line, col)| line > symbol.line && col <= symbol.col)
            .map(|&(line, _)| line)
            .min();
        symbol.end_line = match next_start {
            Some(line) => line.saturating_sub(1).max(symbol.line),
            None => total_lines.saturating_sub(1).max(symbol.line),
        };
    }
}
