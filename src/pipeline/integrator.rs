//! The single-writer "reduce" stage.
//!
//! Consumes `ProcessedFile`s sequentially and merges them into the live
//! indexes under a write lease covering the affected index types. Being the
//! sole writer, per-file merges are serialized; the copy-on-write snapshot
//! swap at the end of each merge is what readers observe. The integrator owns
//! the global string interner: processors never intern, avoiding double
//! allocation.

use crate::cancel::CancelToken;
use crate::coordinate::{IndexCoordinator, IndexType};
use crate::error::LockMode;
use crate::index::{IndexSet, StringInterner, SymbolRecord};
use crate::pipeline::processor::ProcessedFile;
use crate::pipeline::progress::ProgressTracker;
use crate::store::{FileId, FileService};
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Index types touched by a file merge.
const MERGE_TYPES: [IndexType; 4] = [
    IndexType::Trigram,
    IndexType::Symbol,
    IndexType::Reference,
    IndexType::Location,
];

pub struct FileIntegrator {
    indexes: Arc<IndexSet>,
    coordinator: Arc<IndexCoordinator>,
    store: Arc<FileService>,
    interner: StringInterner,
    /// Mirror of the interner size, readable without the integrator lock.
    interned_count: Arc<AtomicUsize>,
    lock_timeout: Duration,
}

impl FileIntegrator {
    pub fn new(
        indexes: Arc<IndexSet>,
        coordinator: Arc<IndexCoordinator>,
        store: Arc<FileService>,
    ) -> Self {
        Self {
            indexes,
            coordinator,
            store,
            interner: StringInterner::new(),
            interned_count: Arc::new(AtomicUsize::new(0)),
            lock_timeout: Duration::from_secs(30),
        }
    }

    /// Drain the result channel until it closes or cancellation trips.
    /// Returns the number of files merged.
    pub fn run(
        &mut self,
        results: Receiver<ProcessedFile>,
        token: &CancelToken,
        progress: &ProgressTracker,
    ) -> usize {
        let mut merged = 0usize;
        loop {
            if token.is_cancelled() {
                info!(merged, "Integrator cancelled");
                break;
            }
            match results.recv_timeout(Duration::from_millis(100)) {
                Ok(processed) => {
                    if self.integrate(processed, progress) {
                        merged += 1;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        progress.flush_all_shards();
        merged
    }

    /// Merge one processed file. Failures are recorded and skipped; they
    /// never abort the batch. Returns whether a merge happened.
    pub fn integrate(&mut self, processed: ProcessedFile, progress: &ProgressTracker) -> bool {
        let path_display = processed.path.display().to_string();

        let artifacts = match processed.outcome {
            Ok(artifacts) => artifacts,
            Err(failure) => {
                debug!(path = %path_display, kind = failure.kind, "Skipping failed file");
                progress.record_error(&path_display, failure.kind, &failure.message);
                return false;
            }
        };

        let lease = match self
            .coordinator
            .acquire_multiple(&MERGE_TYPES, LockMode::Write, self.lock_timeout)
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(path = %path_display, error = %e, "Write lease unavailable, skipping file");
                progress.record_error(&path_display, "lock_timeout", &e.to_string());
                return false;
            }
        };

        let file_id = processed.file_id;

        // Re-index: drop prior postings for this path before merging
        let prior = self.indexes.snapshot.load().id_for(&processed.path);
        if let Some(prior_id) = prior {
            self.remove_from_indexes(prior_id);
        }

        // Bucket-by-bucket merge; no cross-bucket contention
        self.indexes
            .trigrams
            .write()
            .merge_file(file_id, artifacts.trigrams);

        // Symbols, with names interned once, here
        let records: Vec<Arc<SymbolRecord>> = artifacts
            .symbols
            .iter()
            .zip(&artifacts.scope_chains)
            .map(|(symbol, chain)| {
                let name = self.interner.intern(&symbol.name);
                Arc::new(SymbolRecord::from_symbol(symbol, name, chain.clone()))
            })
            .collect();
        self.indexes.symbols.write().insert_file(file_id, records);
        self.interned_count
            .store(self.interner.len(), Ordering::Relaxed);

        // References resolve against the symbol index as it stands now
        {
            let named: Vec<_> = artifacts
                .references
                .into_iter()
                .map(|raw| {
                    let name = self.interner.intern(&raw.referenced_name);
                    (raw, name)
                })
                .collect();
            let symbols = self.indexes.symbols.read();
            self.indexes
                .references
                .write()
                .insert_file(file_id, named, &symbols);
        }

        self.indexes
            .locations
            .write()
            .insert_file(file_id, artifacts.line_offsets);

        // Copy-on-write snapshot swap publishes the file to readers
        self.indexes.snapshot.publish_file(
            processed.path.clone(),
            file_id,
            Arc::new(artifacts.scopes),
        );

        for index in MERGE_TYPES {
            self.coordinator.mark_built(index);
        }

        for diagnostic in &artifacts.diagnostics {
            debug!(path = %path_display, "{diagnostic}");
        }

        progress.increment_processed(&path_display);
        drop(lease);
        true
    }

    /// Remove a file from every index and publish its absence. The caller is
    /// responsible for tombstoning first so the read path never resurfaces
    /// the file between steps.
    pub fn integrate_removal(&mut self, path: &Path) -> Option<FileId> {
        let snapshot = self.indexes.snapshot.load();
        // Watcher and caller paths may differ in symlink resolution from the
        // path the file was indexed under; try both spellings.
        let file_id = snapshot.id_for(path).or_else(|| {
            let canonical = path.canonicalize().ok()?;
            snapshot.id_for(&canonical)
        })?;
        drop(snapshot);

        let lease = self
            .coordinator
            .acquire_multiple(&MERGE_TYPES, LockMode::Write, self.lock_timeout)
            .ok()?;

        self.remove_from_indexes(file_id);
        self.indexes.snapshot.publish_removal(file_id);
        self.store.evict(file_id);
        drop(lease);

        info!(path = %path.display(), file = %file_id, "File removed from index");
        Some(file_id)
    }

    fn remove_from_indexes(&self, file_id: FileId) {
        self.indexes.trigrams.write().remove_file(file_id);
        self.indexes.symbols.write().remove_file(file_id);
        self.indexes.references.write().remove_file(file_id);
        self.indexes.locations.write().remove_file(file_id);
    }

    /// Interned-name count, for stats.
    pub fn interned_names(&self) -> usize {
        self.interner.len()
    }

    /// Shareable counter for reading the interner size without taking the
    /// integrator itself.
    pub fn interned_counter(&self) -> Arc<AtomicUsize> {
        self.interned_count.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::ParserPool;
    use crate::pipeline::processor::FileProcessor;
    use crate::scan::{FileTask, TaskPriority};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<FileService>,
        indexes: Arc<IndexSet>,
        integrator: FileIntegrator,
        processor: FileProcessor,
        progress: ProgressTracker,
        root: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(FileService::new());
        let indexes = Arc::new(IndexSet::new());
        let coordinator = Arc::new(IndexCoordinator::new());
        let integrator = FileIntegrator::new(indexes.clone(), coordinator, store.clone());
        let processor = FileProcessor::new(store.clone(), Arc::new(ParserPool::new()));
        Fixture {
            _dir: dir,
            store,
            indexes,
            integrator,
            processor,
            progress: ProgressTracker::new(),
            root,
        }
    }

    fn write_and_integrate(fx: &mut Fixture, name: &str, content: &str) -> FileId {
        let path = fx.root.join(name);
        fs::write(&path, content).unwrap();
        let task = FileTask {
            path: path.clone(),
            language: crate::parse::Language::from_path(&path),
            priority: TaskPriority::Normal,
            size: content.len() as u64,
            mtime: None,
        };
        let processed = fx.processor.process_task(&task, &CancelToken::none());
        let id = processed.file_id;
        assert!(fx.integrator.integrate(processed, &fx.progress));
        id
    }

    #[test]
    fn test_merge_populates_all_indexes() {
        let mut fx = fixture();
        let id = write_and_integrate(&mut fx, "a.rs", "pub fn greet() {\n    wave();\n}\n");

        assert!(fx.indexes.trigrams.read().all_files().contains(id.0));
        assert_eq!(fx.indexes.symbols.read().lookup("greet").len(), 1);
        assert!(!fx
            .indexes
            .references
            .read()
            .references_in_file(id)
            .is_empty());
        assert!(fx.indexes.locations.read().line_offsets(id).is_some());

        let snapshot = fx.indexes.snapshot.load();
        assert_eq!(snapshot.path_for(id).unwrap().file_name().unwrap(), "a.rs");
        assert_eq!(fx.progress.processed(), 1);
    }

    #[test]
    fn test_reindex_replaces_prior_postings() {
        let mut fx = fixture();
        let id1 = write_and_integrate(&mut fx, "b.rs", "fn original_name() {}\n");
        assert_eq!(fx.indexes.symbols.read().lookup("original_name").len(), 1);

        let id2 = write_and_integrate(&mut fx, "b.rs", "fn replacement_name() {}\n");
        assert_eq!(id1, id2, "same canonical path keeps its id");

        assert!(fx.indexes.symbols.read().lookup("original_name").is_empty());
        assert_eq!(fx.indexes.symbols.read().lookup("replacement_name").len(), 1);

        // Old content trigrams are gone
        let candidates = fx
            .indexes
            .trigrams
            .read()
            .candidate_files(b"original_name")
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_failed_file_recorded_not_merged() {
        let mut fx = fixture();
        let processed = ProcessedFile {
            path: fx.root.join("broken.rs"),
            file_id: FileId::NONE,
            outcome: Err(crate::pipeline::processor::FileFailure {
                kind: "parser_panic",
                message: "boom".into(),
            }),
        };
        assert!(!fx.integrator.integrate(processed, &fx.progress));

        let progress = fx.progress.get_progress();
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].kind, "parser_panic");
        assert_eq!(fx.progress.processed(), 0);
    }

    #[test]
    fn test_removal_clears_everything() {
        let mut fx = fixture();
        let id = write_and_integrate(&mut fx, "c.rs", "fn doomed() {}\n");
        let path = fx.root.join("c.rs");

        fx.indexes.deleted.mark_deleted(id);
        let removed = fx.integrator.integrate_removal(&path);
        assert_eq!(removed, Some(id));

        assert!(fx.indexes.symbols.read().lookup("doomed").is_empty());
        assert!(fx.indexes.snapshot.load().path_for(id).is_none());
        assert!(fx.store.get_content(id).is_none());
        assert!(fx.indexes.deleted.is_deleted(id));
    }

    #[test]
    fn test_interner_deduplicates_across_files() {
        let mut fx = fixture();
        write_and_integrate(&mut fx, "d.rs", "fn shared_name() {}\n");
        write_and_integrate(&mut fx, "e.rs", "fn shared_name() {}\n");

        let d = fx.indexes.symbols.read();
        let sites = d.lookup("shared_name");
        assert_eq!(sites.len(), 2);
        assert!(Arc::ptr_eq(&sites[0].name, &sites[1].name));
    }
}
