//! The facade the rest of the system talks to.
//!
//! Owns the component graph: file service, parser pool, live indexes,
//! coordinator, operations manager, queue processor, and (in watch mode) the
//! file watcher. Full builds run the scanner + pipeline; watcher batches and
//! single-file updates reuse the same processor → integrator path, with
//! deletions tombstoned before their postings are removed.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::coordinate::{
    IndexCoordinator, IndexType, OperationQueue, OperationsManager, QueueFullBehavior,
    QueueProcessor,
};
use crate::index::IndexSet;
use crate::parse::{Language, ParserPool};
use crate::pipeline::{
    run_pipeline, FileIntegrator, FileProcessor, IndexingProgress, ProgressTracker,
};
use crate::scan::{FileScanner, FileTask, TaskPriority};
use crate::search::{SearchMatch, SearchOptions, Searcher};
use crate::store::{FileId, FileService};
use crate::watch::{FileWatcher, WatchBatch};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Index types a search reads under its lease.
const SEARCH_TYPES: [IndexType; 3] = [IndexType::Trigram, IndexType::Symbol, IndexType::Location];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub errors: Vec<String>,
    pub metrics: FxHashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_symbols: usize,
    pub total_references: usize,
    pub total_trigrams: usize,
    pub deleted_files: u64,
    pub total_size_bytes: u64,
    pub interned_names: usize,
    pub active_operations: usize,
    pub queued_operations: usize,
}

pub struct MasterIndex {
    config: Config,
    store: Arc<FileService>,
    parsers: Arc<ParserPool>,
    indexes: Arc<IndexSet>,
    coordinator: Arc<IndexCoordinator>,
    operations: Arc<OperationsManager>,
    queue: Arc<OperationQueue>,
    queue_processor: Mutex<Option<QueueProcessor>>,
    integrator: Arc<Mutex<FileIntegrator>>,
    interned: Arc<std::sync::atomic::AtomicUsize>,
    searcher: Searcher,
    progress: Mutex<Arc<ProgressTracker>>,
    watcher: Mutex<Option<FileWatcher>>,
    /// Token of the in-flight full build, so close can interrupt it.
    run_token: Mutex<Option<CancelToken>>,
    closed: AtomicBool,
}

impl MasterIndex {
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(FileService::new());
        let parsers = Arc::new(ParserPool::new());
        let indexes = Arc::new(IndexSet::new());
        let coordinator = Arc::new(IndexCoordinator::new());
        let operations = Arc::new(OperationsManager::new(coordinator.clone(), &config));
        let queue = Arc::new(OperationQueue::new(
            operations.max_concurrent() * 2,
            QueueFullBehavior::default(),
        ));
        let queue_processor = QueueProcessor::start(queue.clone(), operations.clone());
        let integrator_inner =
            FileIntegrator::new(indexes.clone(), coordinator.clone(), store.clone());
        let interned = integrator_inner.interned_counter();
        let integrator = Arc::new(Mutex::new(integrator_inner));
        let searcher = Searcher::new(indexes.clone(), store.clone(), config.search.clone());

        Ok(Self {
            config,
            store,
            parsers,
            indexes,
            coordinator,
            operations,
            queue,
            queue_processor: Mutex::new(Some(queue_processor)),
            integrator,
            interned,
            searcher,
            progress: Mutex::new(Arc::new(ProgressTracker::new())),
            watcher: Mutex::new(None),
            run_token: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Convenience constructor rooted at a directory with default settings.
    pub fn for_root(root: impl Into<PathBuf>) -> Result<Self> {
        Self::new(Config::for_root(root))
    }

    /// Scan and index the configured root (or an override). A successful full
    /// build clears the tombstone generation and, in watch mode, starts the
    /// file watcher.
    pub fn index_directory(&self, token: &CancelToken, root: Option<&Path>) -> Result<usize> {
        self.ensure_open()?;

        let mut config = self.config.clone();
        if let Some(root) = root {
            config.project.root = root.to_path_buf();
        }

        let progress = Arc::new(ProgressTracker::new());
        *self.progress.lock() = progress.clone();
        *self.run_token.lock() = Some(token.clone());

        let scanner = FileScanner::new(&config)?;
        let tasks = scanner.scan(token, &progress);

        let merged = {
            let mut integrator = self.integrator.lock();
            run_pipeline(
                tasks,
                self.store.clone(),
                self.parsers.clone(),
                &mut integrator,
                config.worker_count(),
                token,
                &progress,
            )
        };

        *self.run_token.lock() = None;

        if token.is_cancelled() {
            warn!(merged, "Index build cancelled before completion");
            return Ok(merged);
        }

        // Full reindex completed: tombstones from the previous generation
        // no longer refer to live postings
        self.indexes.deleted.clear();
        info!(merged, "Full index build complete");

        if self.config.index.watch_mode {
            self.start_watcher(&config)?;
        }

        Ok(merged)
    }

    /// Index or re-index a single file from disk.
    pub fn index_file(&self, path: &Path) -> Result<FileId> {
        self.ensure_open()?;

        let metadata = path
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if metadata.len() > self.config.index.max_file_size {
            bail!("File exceeds size limit: {}", path.display());
        }

        let task = FileTask {
            path: path.to_path_buf(),
            language: Language::from_path(path),
            priority: TaskPriority::High,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
        };

        let processor = FileProcessor::new(self.store.clone(), self.parsers.clone());
        let processed = processor.process_task(&task, &CancelToken::none());
        let file_id = processed.file_id;

        let progress = self.progress.lock().clone();
        if !self.integrator.lock().integrate(processed, &progress) {
            bail!("Failed to index {}", path.display());
        }
        Ok(file_id)
    }

    /// Re-index a file from in-memory content (e.g. unsaved editor state).
    pub fn update_file(&self, path: &Path, bytes: Vec<u8>) -> Result<FileId> {
        self.ensure_open()?;

        let file_id = self.store.load_file_from_memory(path, bytes)?;
        let processor = FileProcessor::new(self.store.clone(), self.parsers.clone());
        let processed = processor.process_loaded(path, file_id, &CancelToken::none());

        let progress = self.progress.lock().clone();
        if !self.integrator.lock().integrate(processed, &progress) {
            bail!("Failed to update {}", path.display());
        }
        Ok(file_id)
    }

    /// Remove a file: tombstone first so searches stop surfacing it, then
    /// strip its postings.
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;

        if let Some(id) = self.indexes.snapshot.load().id_for(path) {
            self.indexes.deleted.mark_deleted(id);
        }
        self.integrator.lock().integrate_removal(path);
        Ok(())
    }

    pub fn search(&self, pattern: &str, limit: usize) -> Result<Vec<SearchMatch>> {
        self.ensure_open()?;
        let result = self
            .operations
            .execute_search(&CancelToken::none(), &SEARCH_TYPES, |_| {
                self.searcher.search(pattern, limit)
            })
            .map_err(anyhow::Error::from)?;
        result
    }

    pub fn search_with_options(
        &self,
        pattern: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchMatch>> {
        self.ensure_open()?;
        let result = self
            .operations
            .execute_search(&CancelToken::none(), &SEARCH_TYPES, |_| {
                self.searcher.search_with_options(pattern, options)
            })
            .map_err(anyhow::Error::from)?;
        result
    }

    pub fn progress(&self) -> IndexingProgress {
        self.progress.lock().get_progress()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_files: self.indexes.snapshot.load().len(),
            total_symbols: self.indexes.symbols.read().total_symbols(),
            total_references: self.indexes.references.read().total_references(),
            total_trigrams: self.indexes.trigrams.read().num_trigrams(),
            deleted_files: self.indexes.deleted.len(),
            total_size_bytes: self.store.total_size(),
            interned_names: self.interned.load(Ordering::Relaxed),
            active_operations: self.operations.active_count(),
            queued_operations: self.queue.len(),
        }
    }

    /// Structural health check.
    pub fn health_check(&self) -> HealthReport {
        let mut errors = Vec::new();
        let mut status = HealthStatus::Healthy;

        if self.closed.load(Ordering::Acquire) {
            return HealthReport {
                status: HealthStatus::Unhealthy,
                errors: vec!["index is closed".into()],
                metrics: FxHashMap::default(),
            };
        }

        if self.queue_processor.lock().is_none() {
            status = HealthStatus::Degraded;
            errors.push("queue processor is not running".into());
        }
        if self.config.index.watch_mode && self.watcher.lock().is_none() {
            status = HealthStatus::Degraded;
            errors.push("watch mode enabled but watcher is not running".into());
        }

        let stats = self.stats();
        let writing = self
            .coordinator
            .all_statuses()
            .iter()
            .filter(|(_, status)| status.is_indexing)
            .count();

        let mut metrics = FxHashMap::default();
        metrics.insert("indexes_writing".into(), writing as u64);
        metrics.insert("files".into(), stats.total_files as u64);
        metrics.insert("symbols".into(), stats.total_symbols as u64);
        metrics.insert("references".into(), stats.total_references as u64);
        metrics.insert("trigrams".into(), stats.total_trigrams as u64);
        metrics.insert("deleted".into(), stats.deleted_files);
        metrics.insert("content_bytes".into(), stats.total_size_bytes);
        metrics.insert("active_operations".into(), stats.active_operations as u64);

        HealthReport {
            status,
            errors,
            metrics,
        }
    }

    /// Shut down: stop the queue processor, stop the watcher without flushing
    /// its pending events, cancel everything active, and interrupt any
    /// in-flight build.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing index");

        if let Some(token) = self.run_token.lock().take() {
            token.cancel();
        }
        if let Some(mut processor) = self.queue_processor.lock().take() {
            processor.stop();
        }
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        self.operations.cancel_all();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("index is closed");
        }
        Ok(())
    }

    fn start_watcher(&self, config: &Config) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let applier = WatchApplier {
            store: self.store.clone(),
            parsers: self.parsers.clone(),
            indexes: self.indexes.clone(),
            integrator: self.integrator.clone(),
            max_file_size: config.index.max_file_size,
        };
        let progress = self.progress.lock().clone();

        let watcher = FileWatcher::start(config, move |batch| {
            applier.apply(batch, &progress);
        })?;
        *slot = Some(watcher);
        info!("File watcher started");
        Ok(())
    }
}

impl Drop for MasterIndex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Applies debounced watcher batches through the integrator path.
/// Deletes run first so freed capacity precedes new content.
struct WatchApplier {
    store: Arc<FileService>,
    parsers: Arc<ParserPool>,
    indexes: Arc<IndexSet>,
    integrator: Arc<Mutex<FileIntegrator>>,
    max_file_size: u64,
}

impl WatchApplier {
    fn apply(&self, batch: WatchBatch, progress: &Arc<ProgressTracker>) {
        info!(
            removes = batch.removes.len(),
            changes = batch.changes.len(),
            creates = batch.creates.len(),
            "Applying watch batch"
        );

        // Tombstone every delete up front; readers stop surfacing them even
        // before the postings are physically removed
        let snapshot = self.indexes.snapshot.load();
        let ids: Vec<FileId> = batch
            .removes
            .iter()
            .filter_map(|path| snapshot.id_for(path))
            .collect();
        drop(snapshot);
        self.indexes.deleted.mark_deleted_batch(&ids);

        let mut integrator = self.integrator.lock();
        for path in &batch.removes {
            integrator.integrate_removal(path);
        }

        let processor = FileProcessor::new(self.store.clone(), self.parsers.clone());
        for path in batch.changes.iter().chain(&batch.creates) {
            let Ok(metadata) = path.metadata() else {
                continue;
            };
            if metadata.len() > self.max_file_size {
                continue;
            }
            let task = FileTask {
                path: path.clone(),
                language: Language::from_path(path),
                priority: TaskPriority::High,
                size: metadata.len(),
                mtime: metadata.modified().ok(),
            };
            let processed = processor.process_task(&task, &CancelToken::none());
            integrator.integrate(processed, progress);
        }
    }
}
