//! Processor workers: the parallel "map" stage of the pipeline.
//!
//! Each worker pulls file tasks off the bounded task channel, loads content
//! through the file service, parses, and pre-computes everything the
//! integrator needs: line offsets, per-symbol scope chains, and bucketed
//! trigram postings. Results go to the integrator over the bounded result
//! channel with adaptive back-pressure.

use crate::cancel::CancelToken;
use crate::index::{compute_line_offsets, BucketedTrigramResult};
use crate::parse::{ParseOutput, ParserPool, RawReference, ScopeInfo, Symbol};
use crate::scan::{binary, FileTask};
use crate::store::{FileId, FileService};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// First send attempt waits this long before entering backoff.
const INITIAL_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Backoff growth per retry on a full channel.
const SEND_BACKOFF_FACTOR: f64 = 1.5;

/// Backoff ceiling and retry budget before a result is dropped.
const MAX_SEND_BACKOFF: Duration = Duration::from_secs(30);
const MAX_SEND_RETRIES: u32 = 10;

/// A processing failure recorded against the file.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub kind: &'static str,
    pub message: String,
}

/// Everything pre-computed for one successfully parsed file.
pub struct FileArtifacts {
    pub line_offsets: Arc<Vec<u32>>,
    pub symbols: Vec<Symbol>,
    /// Scope-chain per symbol, parallel to `symbols`. Outermost scope first.
    pub scope_chains: Vec<Arc<Vec<u16>>>,
    pub references: Vec<RawReference>,
    pub scopes: Vec<ScopeInfo>,
    pub trigrams: BucketedTrigramResult,
    pub diagnostics: Vec<String>,
}

/// Unit of work handed to the integrator.
pub struct ProcessedFile {
    pub path: std::path::PathBuf,
    pub file_id: FileId,
    pub outcome: Result<FileArtifacts, FileFailure>,
}

impl ProcessedFile {
    fn failed(path: &Path, file_id: FileId, kind: &'static str, message: String) -> Self {
        Self {
            path: path.to_path_buf(),
            file_id,
            outcome: Err(FileFailure { kind, message }),
        }
    }
}

pub struct FileProcessor {
    store: Arc<FileService>,
    parsers: Arc<ParserPool>,
}

impl FileProcessor {
    pub fn new(store: Arc<FileService>, parsers: Arc<ParserPool>) -> Self {
        Self { store, parsers }
    }

    /// Worker loop: drain tasks until the channel closes or cancellation.
    pub fn run(
        &self,
        tasks: Receiver<FileTask>,
        results: Sender<ProcessedFile>,
        token: &CancelToken,
    ) {
        loop {
            if token.is_cancelled() {
                debug!("Processor worker cancelled");
                return;
            }
            let task = match tasks.recv_timeout(Duration::from_millis(100)) {
                Ok(task) => task,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            };

            let processed = self.process_task(&task, token);
            if !send_with_backpressure(&results, processed, token) {
                return;
            }
            // Let other workers and the integrator run after each unit
            std::thread::yield_now();
        }
    }

    /// Process one task end to end.
    pub fn process_task(&self, task: &FileTask, token: &CancelToken) -> ProcessedFile {
        let path = task.path.as_path();

        let file_id = match self.store.load_file(path) {
            Ok(id) => id,
            Err(e) => {
                return ProcessedFile::failed(path, FileId::NONE, "load_failure", e.to_string());
            }
        };
        if !file_id.is_file() {
            return ProcessedFile::failed(
                path,
                FileId::NONE,
                "directory_skipped",
                "path resolved to a directory".into(),
            );
        }

        self.process_loaded(path, file_id, token)
    }

    /// Process content already registered in the store (also used by the
    /// single-file update path).
    pub fn process_loaded(
        &self,
        path: &Path,
        file_id: FileId,
        _token: &CancelToken,
    ) -> ProcessedFile {
        let Some(entry) = self.store.get_content(file_id) else {
            return ProcessedFile::failed(
                path,
                file_id,
                "load_failure",
                "content evicted before processing".into(),
            );
        };

        // Defensive re-check: the scanner filters by extension only
        if binary::is_binary_by_magic(entry.bytes()) {
            return ProcessedFile::failed(
                path,
                file_id,
                "binary_detection",
                "magic number detected in content".into(),
            );
        }

        let content = match entry.text() {
            Ok(text) => text,
            Err(e) => {
                return ProcessedFile::failed(path, file_id, "unreadable", e.to_string());
            }
        };

        let parsed = match self.parse_guarded(path, content, file_id, entry.language) {
            Ok(output) => output,
            Err(failure) => {
                return ProcessedFile {
                    path: path.to_path_buf(),
                    file_id,
                    outcome: Err(failure),
                };
            }
        };

        let line_offsets = Arc::new(compute_line_offsets(content.as_bytes()));
        let scope_chains = compute_scope_chains(&parsed.symbols, &parsed.scopes);
        let trigrams = BucketedTrigramResult::extract(content.as_bytes());

        ProcessedFile {
            path: path.to_path_buf(),
            file_id,
            outcome: Ok(FileArtifacts {
                line_offsets,
                symbols: parsed.symbols,
                scope_chains,
                references: parsed.references,
                scopes: parsed.scopes,
                trigrams,
                diagnostics: parsed.diagnostics,
            }),
        }
    }

    /// Borrow a parser and run it with panic containment. The pool guard
    /// returns the parser on every exit path, including unwinding.
    fn parse_guarded(
        &self,
        path: &Path,
        content: &str,
        file_id: FileId,
        language: crate::parse::Language,
    ) -> Result<ParseOutput, FileFailure> {
        let mut parser = self.parsers.borrow(language);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            parser.parse(path, content, file_id)
        }));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(FileFailure {
                kind: "parse_error",
                message: e.to_string(),
            }),
            Err(_) => {
                error!(path = %path.display(), "Parser panicked");
                Err(FileFailure {
                    kind: "parser_panic",
                    message: "parser panicked on file content".into(),
                })
            }
        }
    }
}

/// Enclosing-scope chain per symbol. A line-keyed cache avoids recomputation
/// when several symbols share a line.
fn compute_scope_chains(symbols: &[Symbol], scopes: &[ScopeInfo]) -> Vec<Arc<Vec<u16>>> {
    let mut by_line: FxHashMap<u32, Arc<Vec<u16>>> = FxHashMap::default();

    symbols
        .iter()
        .map(|symbol| {
            by_line
                .entry(symbol.line)
                .or_insert_with(|| {
                    let chain: Vec<u16> = scopes
                        .iter()
                        .enumerate()
                        .filter(|(_, scope)| scope.contains_line(symbol.line))
                        .map(|(i, _)| i as u16)
                        .collect();
                    Arc::new(chain)
                })
                .clone()
        })
        .collect()
}

/// Send a result with adaptive back-pressure: a bounded initial timeout, then
/// exponential backoff while the channel stays full. After the retry budget
/// the unit is dropped and logged.
fn send_with_backpressure(
    sender: &Sender<ProcessedFile>,
    mut message: ProcessedFile,
    token: &CancelToken,
) -> bool {
    let mut delay = INITIAL_SEND_TIMEOUT;
    for attempt in 0..=MAX_SEND_RETRIES {
        if token.is_cancelled() {
            return false;
        }
        match sender.send_timeout(message, delay) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                message = returned;
                if attempt == MAX_SEND_RETRIES {
                    break;
                }
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Result channel full, backing off"
                );
                delay = delay.mul_f64(SEND_BACKOFF_FACTOR).min(MAX_SEND_BACKOFF);
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
    error!(path = %message.path.display(), "Result channel saturated, work unit lost");
    true
}
