//! File discovery: walks the project root honoring include/exclude globs and
//! gitignore, and emits prioritized file tasks for the indexing pipeline.

pub mod binary;
pub mod gitignore;

pub use gitignore::GitignoreMatcher;

use crate::config::{Config, PriorityMode};
use crate::cancel::CancelToken;
use crate::parse::Language;
use crate::pipeline::progress::ProgressTracker;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Priority assigned to a file task by the scanner's policy.
/// Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// One step less urgent, saturating at Low.
    pub fn demoted(self) -> Self {
        match self {
            TaskPriority::High => TaskPriority::Normal,
            TaskPriority::Normal | TaskPriority::Low => TaskPriority::Low,
        }
    }
}

/// A file selected for indexing.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub path: PathBuf,
    pub language: Language,
    pub priority: TaskPriority,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// Walks a root directory and produces `FileTask`s.
///
/// Per-file failures are logged and skipped; the scan itself only fails on
/// construction (invalid glob patterns).
pub struct FileScanner {
    root: PathBuf,
    include: GlobSet,
    include_empty: bool,
    exclude: GlobSet,
    gitignore: GitignoreMatcher,
    max_file_size: u64,
    max_file_count: usize,
    max_total_size: u64,
    follow_symlinks: bool,
    priority_mode: PriorityMode,
    smart_size_control: bool,
}

/// Demotion thresholds for `smart_size_control`.
const DEMOTE_SIZE: u64 = 256 * 1024;
const DEMOTE_TO_LOW_SIZE: u64 = 1024 * 1024;

impl FileScanner {
    pub fn new(config: &Config) -> Result<Self> {
        let root = config.project.root.clone();
        let include = build_glob_set(&config.index.include)?;
        let exclude = build_glob_set(&config.index.exclude)?;
        let gitignore = if config.index.respect_gitignore {
            GitignoreMatcher::load(&root)
        } else {
            GitignoreMatcher::empty()
        };

        Ok(Self {
            root,
            include,
            include_empty: config.index.include.is_empty(),
            exclude,
            gitignore,
            max_file_size: config.index.max_file_size,
            max_file_count: config.index.max_file_count,
            max_total_size: config.index.max_total_size_mb * 1024 * 1024,
            follow_symlinks: config.index.follow_symlinks,
            priority_mode: config.index.priority_mode,
            smart_size_control: config.index.smart_size_control,
        })
    }

    /// Enumerate all files under the root that pass the filters.
    ///
    /// Increments the scanned counter per task and calls `set_total` exactly
    /// once when enumeration completes.
    pub fn scan(&self, token: &CancelToken, progress: &ProgressTracker) -> Vec<FileTask> {
        let mut tasks = Vec::new();
        let mut total_size = 0u64;

        // Canonical paths of directories already entered; breaks symlink cycles.
        let mut visited: HashSet<PathBuf> = HashSet::new();
        if let Ok(canonical_root) = self.root.canonicalize() {
            visited.insert(canonical_root);
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .into_iter();

        let mut it = walker.filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            if entry.depth() == 0 {
                return true;
            }
            self.should_descend(entry.path(), &mut visited)
        });

        while let Some(entry) = it.next() {
            if token.is_cancelled() {
                info!("Scan cancelled");
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Error walking directory");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(task) = self.examine_file(entry.path()) else {
                continue;
            };

            if tasks.len() >= self.max_file_count {
                warn!(
                    limit = self.max_file_count,
                    "File count cap reached, remaining files are skipped"
                );
                break;
            }
            if total_size + task.size > self.max_total_size {
                warn!(
                    limit = self.max_total_size,
                    "Total size cap reached, remaining files are skipped"
                );
                break;
            }

            debug!(
                path = %task.path.display(),
                priority = ?task.priority,
                size = task.size,
                "Scanned file"
            );
            total_size += task.size;
            progress.increment_scanned();
            tasks.push(task);
        }

        progress.set_total(tasks.len());
        info!("Total: {} files", tasks.len());
        tasks
    }

    /// Directory admission: gitignore, exclude globs, symlink cycle defense.
    fn should_descend(&self, path: &Path, visited: &mut HashSet<PathBuf>) -> bool {
        if self.gitignore.is_ignored(path, true) {
            debug!(path = %path.display(), "Directory ignored by gitignore");
            return false;
        }
        if self.matches(&self.exclude, path) {
            debug!(path = %path.display(), "Directory excluded by pattern");
            return false;
        }
        // Unresolvable paths are skipped, not fatal.
        match path.canonicalize() {
            Ok(canonical) => visited.insert(canonical),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unresolvable directory");
                false
            }
        }
    }

    /// Per-file filters. Returns None when the file should not be indexed.
    fn examine_file(&self, path: &Path) -> Option<FileTask> {
        if self.gitignore.is_ignored(path, false) {
            return None;
        }
        if self.matches(&self.exclude, path) {
            return None;
        }
        if !self.include_empty && !self.matches(&self.include, path) {
            return None;
        }
        if binary::has_binary_extension(path) {
            return None;
        }

        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to stat file, skipping");
                return None;
            }
        };
        let size = metadata.len();
        if size > self.max_file_size {
            debug!(
                path = %path.display(),
                size,
                limit = self.max_file_size,
                "Skipping file exceeding size limit"
            );
            return None;
        }

        let mtime = metadata.modified().ok();
        let language = Language::from_path(path);
        let mut priority = self.base_priority(language, mtime);
        if self.smart_size_control {
            if size > DEMOTE_TO_LOW_SIZE {
                priority = TaskPriority::Low;
            } else if size > DEMOTE_SIZE {
                priority = priority.demoted();
            }
        }

        Some(FileTask {
            path: path.to_path_buf(),
            language,
            priority,
            size,
            mtime,
        })
    }

    fn base_priority(&self, language: Language, mtime: Option<SystemTime>) -> TaskPriority {
        match self.priority_mode {
            PriorityMode::Recent => {
                let age = mtime
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or(Duration::MAX);
                if age < Duration::from_secs(24 * 3600) {
                    TaskPriority::High
                } else if age < Duration::from_secs(7 * 24 * 3600) {
                    TaskPriority::Normal
                } else {
                    TaskPriority::Low
                }
            }
            PriorityMode::Static => {
                if language.is_source() {
                    TaskPriority::High
                } else if language == Language::PlainText {
                    TaskPriority::Low
                } else {
                    TaskPriority::Normal
                }
            }
        }
    }

    /// Globs are applied against both the basename and the root-relative path.
    fn matches(&self, set: &GlobSet, path: &Path) -> bool {
        if let Some(name) = path.file_name() {
            if set.is_match(Path::new(name)) {
                return true;
            }
        }
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        set.is_match(rel)
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        builder.add(glob);
    }
    builder.build().context("Failed to compile glob patterns")
}
