//! Parsing interface and the generic fallback parser.
//!
//! The real parse step is an external collaborator; this module pins down its
//! contract: a [`Parser`] turns file content into symbols, raw references,
//! scopes, and an opaque AST handle. Parsers are pooled and borrowed one at a
//! time; the pool guarantees return on every exit path, including unwinding
//! out of a panicking parser.

pub mod generic;

pub use generic::GenericParser;

use crate::store::FileId;
use anyhow::Result;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Source language, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    C,
    Cpp,
    Java,
    CSharp,
    Ruby,
    Php,
    Shell,
    Json,
    Toml,
    Yaml,
    Html,
    Css,
    Markdown,
    PlainText,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Language::PlainText;
        };

        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "py" | "pyi" | "pyw" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "go" => Language::Go,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "java" => Language::Java,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "sh" | "bash" | "zsh" => Language::Shell,
            "json" => Language::Json,
            "toml" => Language::Toml,
            "yaml" | "yml" => Language::Yaml,
            "html" | "htm" => Language::Html,
            "css" | "scss" | "less" => Language::Css,
            "md" | "markdown" => Language::Markdown,
            _ => Language::PlainText,
        }
    }

    /// Languages with code semantics (as opposed to markup/config/plain text).
    pub fn is_source(self) -> bool {
        !matches!(
            self,
            Language::Json
                | Language::Toml
                | Language::Yaml
                | Language::Html
                | Language::Css
                | Language::Markdown
                | Language::PlainText
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Trait,
    Interface,
    Type,
    Variable,
    Constant,
    Import,
    Module,
}

/// A symbol produced by a parser. Lines and columns are 0-based;
/// `line <= end_line` always holds.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Per-file ordinal assigned by the parser.
    pub id: u32,
    pub name: String,
    pub kind: SymbolKind,
    pub file_id: FileId,
    pub line: u32,
    pub end_line: u32,
    pub col: u32,
    pub end_col: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Type,
    Block,
}

/// A lexical scope. `end_line == 0` is a sentinel for "to end of file".
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub kind: ScopeKind,
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl ScopeInfo {
    /// Whether the scope covers the given line, honoring the end sentinel.
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && (self.end_line == 0 || line <= self.end_line)
    }
}

/// A name use site emitted by the parser, before resolution.
#[derive(Debug, Clone)]
pub struct RawReference {
    pub referenced_name: String,
    pub line: u32,
    /// Ordinal of the enclosing symbol in the same file, when known.
    pub source_symbol: Option<u32>,
}

/// Opaque AST handle. Consumers that know the concrete parser may downcast.
pub struct AstHandle {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl AstHandle {
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn new(tree: Arc<dyn Any + Send + Sync>) -> Self {
        Self { inner: Some(tree) }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().and_then(|a| a.downcast::<T>().ok())
    }
}

/// Parser-side performance counters.
#[derive(Debug, Clone, Default)]
pub struct ParsePerf {
    pub parse_time: Duration,
    pub node_count: usize,
}

/// Everything a parse produces.
pub struct ParseOutput {
    pub ast: AstHandle,
    pub symbols: Vec<Symbol>,
    pub references: Vec<RawReference>,
    pub scopes: Vec<ScopeInfo>,
    pub perf: ParsePerf,
    /// Parser-reported diagnostics (recoverable syntax issues etc.)
    pub diagnostics: Vec<String>,
}

pub trait Parser: Send {
    fn language(&self) -> Language;

    fn parse(&mut self, path: &Path, content: &str, file_id: FileId) -> Result<ParseOutput>;
}

/// Pool of reusable parser instances, one borrower at a time per instance.
pub struct ParserPool {
    idle: Mutex<FxHashMap<Language, Vec<Box<dyn Parser>>>>,
}

impl ParserPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(FxHashMap::default()),
        }
    }

    /// Borrow a parser for the language. Falls back to the generic parser for
    /// languages without a dedicated implementation. The returned guard gives
    /// the parser back on drop, which also runs during unwinding.
    pub fn borrow(&self, language: Language) -> PooledParser<'_> {
        let parser = self
            .idle
            .lock()
            .get_mut(&language)
            .and_then(|v| v.pop())
            .unwrap_or_else(|| Box::new(GenericParser::new(language)) as Box<dyn Parser>);

        PooledParser {
            pool: self,
            language,
            parser: Some(parser),
        }
    }

    fn give_back(&self, language: Language, parser: Box<dyn Parser>) {
        self.idle.lock().entry(language).or_default().push(parser);
    }

    #[cfg(test)]
    fn idle_count(&self, language: Language) -> usize {
        self.idle.lock().get(&language).map_or(0, |v| v.len())
    }
}

impl Default for ParserPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII borrow of a pooled parser.
pub struct PooledParser<'a> {
    pool: &'a ParserPool,
    language: Language,
    parser: Option<Box<dyn Parser>>,
}

impl PooledParser<'_> {
    pub fn parse(&mut self, path: &Path, content: &str, file_id: FileId) -> Result<ParseOutput> {
        self.parser
            .as_mut()
            .expect("parser present until drop")
            .parse(path, content, file_id)
    }
}

impl Drop for PooledParser<'_> {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            self.pool.give_back(self.language, parser);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::from_path(Path::new("a/b/c.rs")), Language::Rust);
        assert_eq!(Language::from_path(Path::new("x.PY")), Language::Python);
        assert_eq!(Language::from_path(Path::new("no_extension")), Language::PlainText);
        assert!(Language::Rust.is_source());
        assert!(!Language::Markdown.is_source());
    }

    #[test]
    fn test_scope_end_sentinel() {
        let scope = ScopeInfo {
            kind: ScopeKind::Module,
            name: "file".into(),
            start_line: 0,
            end_line: 0,
        };
        assert!(scope.contains_line(0));
        assert!(scope.contains_line(100_000));

        let bounded = ScopeInfo {
            kind: ScopeKind::Function,
            name: "f".into(),
            start_line: 3,
            end_line: 9,
        };
        assert!(bounded.contains_line(3));
        assert!(bounded.contains_line(9));
        assert!(!bounded.contains_line(10));
    }

    #[test]
    fn test_pool_reuses_returned_parsers() {
        let pool = ParserPool::new();
        {
            let _p = pool.borrow(Language::Rust);
            assert_eq!(pool.idle_count(Language::Rust), 0);
        }
        assert_eq!(pool.idle_count(Language::Rust), 1);
        {
            let _p = pool.borrow(Language::Rust);
            assert_eq!(pool.idle_count(Language::Rust), 0);
        }
    }

    #[test]
    fn test_pool_returns_parser_on_panic() {
        let pool = ParserPool::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _p = pool.borrow(Language::Rust);
            panic!("parser blew up");
        }));
        assert!(result.is_err());
        // The guard's Drop ran during unwinding and returned the parser
        assert_eq!(pool.idle_count(Language::Rust), 1);
    }
}
