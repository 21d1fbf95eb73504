//! Filesystem watching for incremental index updates.
//!
//! Subscribes to every non-excluded directory under the root (explicitly,
//! one watch per directory, with a canonical-path visited set breaking
//! symlink cycles), normalizes raw notify events, and hands them to the
//! debouncer for coalescing into batches.

pub mod debounce;

pub use debounce::{EventDebouncer, WatchBatch, WatchKind};

use crate::config::Config;
use crate::scan::{binary, GitignoreMatcher};
use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path admission shared by the initial watch-add and the event loop.
struct WatchFilters {
    root: PathBuf,
    exclude: GlobSet,
    gitignore: GitignoreMatcher,
    max_file_size: u64,
}

impl WatchFilters {
    fn from_config(config: &Config) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.index.exclude {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid exclude pattern: {pattern}"))?,
            );
        }
        Ok(Self {
            root: config.project.root.clone(),
            exclude: builder.build().context("Failed to compile exclude globs")?,
            gitignore: if config.index.respect_gitignore {
                GitignoreMatcher::load(&config.project.root)
            } else {
                GitignoreMatcher::empty()
            },
            max_file_size: config.index.max_file_size,
        })
    }

    fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        if self.gitignore.is_ignored(path, is_dir) {
            return true;
        }
        if let Some(name) = path.file_name() {
            if self.exclude.is_match(Path::new(name)) {
                return true;
            }
        }
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        self.exclude.is_match(rel)
    }
}

pub struct FileWatcher {
    /// Keeps the OS watcher alive; the drain thread holds its own handle.
    _watcher: Arc<Mutex<RecommendedWatcher>>,
    /// Dropped on stop, discarding pending events without flushing.
    _debouncer: Arc<EventDebouncer>,
    shutdown: Arc<AtomicBool>,
    drain_handle: Option<std::thread::JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching the configured root. `callback` receives coalesced
    /// batches on the debouncer's timer thread.
    pub fn start(
        config: &Config,
        callback: impl Fn(WatchBatch) + Send + 'static,
    ) -> Result<Self> {
        let filters = Arc::new(WatchFilters::from_config(config)?);
        let (raw_tx, raw_rx) = unbounded::<notify::Event>();

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        })
        .context("Failed to create filesystem watcher")?;
        let watcher = Arc::new(Mutex::new(watcher));

        // Canonical paths of directories already watched; also the symlink
        // cycle guard during recursive watch-add.
        let visited: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
        let watched = add_watch_tree(&watcher, &filters.root, &filters, &visited);
        info!(
            root = %filters.root.display(),
            directories = watched,
            "Watching directory tree"
        );

        let debouncer = Arc::new(EventDebouncer::new(
            Duration::from_millis(config.index.watch_debounce_ms),
            callback,
        ));

        let shutdown = Arc::new(AtomicBool::new(false));
        let drain_handle = {
            let shutdown = shutdown.clone();
            let debouncer = debouncer.clone();
            let filters = filters.clone();
            let watcher = watcher.clone();
            let visited = visited.clone();
            std::thread::Builder::new()
                .name("watch-drain".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        match raw_rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(event) => {
                                handle_event(&event, &debouncer, &filters, &watcher, &visited)
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .expect("spawn watch drain thread")
        };

        Ok(Self {
            _watcher: watcher,
            _debouncer: debouncer,
            shutdown,
            drain_handle: Some(drain_handle),
        })
    }

    /// Stop watching. Pending debounced events are dropped, not flushed.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.drain_handle.take() {
            let _ = handle.join();
        }
        // Debouncer drops with self, discarding whatever it still holds
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Recursively watch every admissible directory under `dir`. Unresolvable
/// paths are skipped, not fatal. Returns the number of directories added.
fn add_watch_tree(
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    dir: &Path,
    filters: &WatchFilters,
    visited: &Arc<Mutex<HashSet<PathBuf>>>,
) -> usize {
    let canonical = match dir.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Skipping unresolvable directory");
            return 0;
        }
    };
    if !visited.lock().insert(canonical) {
        debug!(path = %dir.display(), "Watch cycle detected, skipping");
        return 0;
    }
    if filters.is_excluded(dir, true) && dir != filters.root {
        return 0;
    }

    let mut added = 0usize;
    if let Err(e) = watcher.lock().watch(dir, RecursiveMode::NonRecursive) {
        warn!(path = %dir.display(), error = %e, "Failed to watch directory");
        return 0;
    }
    added += 1;

    let Ok(entries) = std::fs::read_dir(dir) else {
        return added;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            added += add_watch_tree(watcher, &path, filters, visited);
        }
    }
    added
}

/// Normalize one raw event and feed the debouncer.
fn handle_event(
    event: &notify::Event,
    debouncer: &EventDebouncer,
    filters: &WatchFilters,
    watcher: &Arc<Mutex<RecommendedWatcher>>,
    visited: &Arc<Mutex<HashSet<PathBuf>>>,
) {
    for path in &event.paths {
        let exists = path.exists();
        let is_dir = exists && path.is_dir();

        if filters.is_excluded(path, is_dir) {
            continue;
        }

        match &event.kind {
            EventKind::Remove(_) => {
                if !exists {
                    debouncer.record(path.clone(), WatchKind::Remove);
                }
            }
            EventKind::Create(kind) => {
                if is_dir || matches!(kind, CreateKind::Folder) {
                    // New directory: extend the watch tree under it
                    let added = add_watch_tree(watcher, path, filters, visited);
                    debug!(path = %path.display(), added, "Watching new directory");
                } else if admit_file(path, filters) {
                    debouncer.record(path.clone(), WatchKind::Create);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                if !exists {
                    debouncer.record(path.clone(), WatchKind::Remove);
                } else if is_dir {
                    add_watch_tree(watcher, path, filters, visited);
                } else if admit_file(path, filters) {
                    debouncer.record(path.clone(), WatchKind::Rename);
                }
            }
            EventKind::Modify(_) => {
                if !is_dir && exists && admit_file(path, filters) {
                    debouncer.record(path.clone(), WatchKind::Write);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }
}

/// File-level admission: size cap and binary extension.
fn admit_file(path: &Path, filters: &WatchFilters) -> bool {
    if binary::has_binary_extension(path) {
        return false;
    }
    match path.metadata() {
        Ok(metadata) if metadata.len() > filters.max_file_size => {
            debug!(
                path = %path.display(),
                size = metadata.len(),
                "Dropping oversized file event"
            );
            false
        }
        Ok(_) => true,
        Err(_) => false,
    }
}
