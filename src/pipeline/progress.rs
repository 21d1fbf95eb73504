//! Sharded progress tracking for the indexing pipeline.
//!
//! Processed-file counts go through per-shard counters that flush into a
//! global total every few increments, so parallel processors never contend on
//! one cache line. `get_progress` assembles a consistent snapshot cheap
//! enough to poll from a UI.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Number of counter shards; paths are routed by hash.
const SHARD_COUNT: usize = 8;

/// Increments a shard accumulates before flushing into the global counter.
const FLUSH_EVERY: u64 = 10;

/// Scanning progress reported before the total is known.
const ESTIMATED_SCANNING_PROGRESS: f64 = 50.0;

/// Cap on retained error records.
const MAX_ERRORS: usize = 1000;

#[derive(Default)]
struct Shard {
    /// Increments not yet flushed into the global counter.
    pending: AtomicU64,
    /// Increments since the last flush, for the flush cadence.
    since_flush: AtomicU64,
}

/// An error recorded against a file during scan or processing.
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

/// Consistent point-in-time progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub files_processed: u64,
    pub total_files: u64,
    pub scanned_files: u64,
    pub current_file: String,
    pub files_per_second: f64,
    pub estimated_seconds_left: f64,
    pub errors: Vec<FileError>,
    pub scanning_progress: f64,
    pub indexing_progress: f64,
    pub is_scanning: bool,
    pub elapsed_seconds: f64,
}

type TotalCallback = Box<dyn FnOnce(u64) + Send>;

pub struct ProgressTracker {
    total_files: AtomicI64,
    scanned_files: AtomicI64,
    shards: [Shard; SHARD_COUNT],
    flushed_processed: AtomicI64,
    is_scanning: AtomicBool,
    current_file: Mutex<String>,
    errors: Mutex<Vec<FileError>>,
    on_total: Mutex<Option<TotalCallback>>,
    start_time: Instant,
    last_update: Mutex<Instant>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total_files: AtomicI64::new(0),
            scanned_files: AtomicI64::new(0),
            shards: Default::default(),
            flushed_processed: AtomicI64::new(0),
            is_scanning: AtomicBool::new(true),
            current_file: Mutex::new(String::new()),
            errors: Mutex::new(Vec::new()),
            on_total: Mutex::new(None),
            start_time: Instant::now(),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// One-shot callback fired when the scan total becomes known.
    pub fn on_total_known(&self, callback: impl FnOnce(u64) + Send + 'static) {
        *self.on_total.lock() = Some(Box::new(callback));
    }

    pub fn increment_scanned(&self) {
        self.scanned_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the file total and leave the scanning phase. Called exactly once,
    /// when enumeration completes.
    pub fn set_total(&self, total: usize) {
        self.total_files.store(total as i64, Ordering::Release);
        self.is_scanning.store(false, Ordering::Release);
        if let Some(callback) = self.on_total.lock().take() {
            callback(total as u64);
        }
        debug!(total, "Scan complete");
    }

    /// Record one processed file. Routed to a shard by path hash; the shard
    /// flushes into the global counter every few increments and refreshes the
    /// current-file display.
    pub fn increment_processed(&self, path: &str) {
        let shard = &self.shards[Self::shard_for(path)];
        shard.pending.fetch_add(1, Ordering::Relaxed);
        let since = shard.since_flush.fetch_add(1, Ordering::Relaxed) + 1;

        if since >= FLUSH_EVERY {
            shard.since_flush.store(0, Ordering::Relaxed);
            let drained = shard.pending.swap(0, Ordering::Relaxed);
            if drained > 0 {
                self.flushed_processed
                    .fetch_add(drained as i64, Ordering::Relaxed);
            }
            *self.current_file.lock() = path.to_string();
            *self.last_update.lock() = Instant::now();
        }
    }

    /// Force-drain every shard into the global counter.
    pub fn flush_all_shards(&self) {
        for shard in &self.shards {
            let drained = shard.pending.swap(0, Ordering::Relaxed);
            shard.since_flush.store(0, Ordering::Relaxed);
            if drained > 0 {
                self.flushed_processed
                    .fetch_add(drained as i64, Ordering::Relaxed);
            }
        }
    }

    pub fn record_error(&self, path: &str, kind: &str, message: &str) {
        let mut errors = self.errors.lock();
        if errors.len() < MAX_ERRORS {
            errors.push(FileError {
                path: path.to_string(),
                kind: kind.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Total processed so far: flushed plus whatever sits in the shards.
    pub fn processed(&self) -> u64 {
        let pending: u64 = self
            .shards
            .iter()
            .map(|s| s.pending.load(Ordering::Relaxed))
            .sum();
        self.flushed_processed.load(Ordering::Relaxed) as u64 + pending
    }

    pub fn get_progress(&self) -> IndexingProgress {
        let is_scanning = self.is_scanning.load(Ordering::Acquire);
        let total = self.total_files.load(Ordering::Acquire).max(0) as u64;
        let processed = self.processed();
        let elapsed = self.start_time.elapsed().as_secs_f64();

        let files_per_second = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };

        let (scanning_progress, indexing_progress) = if is_scanning {
            (ESTIMATED_SCANNING_PROGRESS, 0.0)
        } else if total == 0 {
            (100.0, 100.0)
        } else {
            (100.0, 100.0 * processed as f64 / total as f64)
        };

        let estimated_seconds_left = if files_per_second > 0.0 && total > processed {
            (total - processed) as f64 / files_per_second
        } else {
            0.0
        };

        IndexingProgress {
            files_processed: processed,
            total_files: total,
            scanned_files: self.scanned_files.load(Ordering::Relaxed).max(0) as u64,
            current_file: self.current_file.lock().clone(),
            files_per_second,
            estimated_seconds_left,
            errors: self.errors.lock().clone(),
            scanning_progress,
            indexing_progress,
            is_scanning,
            elapsed_seconds: elapsed,
        }
    }

    fn shard_for(path: &str) -> usize {
        // FNV-1a, folded to shard range
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in path.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash as usize) & (SHARD_COUNT - 1)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counts_conserved_across_shards() {
        let tracker = Arc::new(ProgressTracker::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let tracker = tracker.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    tracker.increment_processed(&format!("src/w{worker}/file{i}.rs"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // flushed + unflushed always equals the number of increments
        assert_eq!(tracker.processed(), 2000);
        tracker.flush_all_shards();
        assert_eq!(
            tracker.flushed_processed.load(Ordering::Relaxed),
            2000
        );
        assert_eq!(tracker.processed(), 2000);
    }

    #[test]
    fn test_scanning_phase_transition() {
        let tracker = ProgressTracker::new();
        tracker.increment_scanned();
        tracker.increment_scanned();

        let before = tracker.get_progress();
        assert!(before.is_scanning);
        assert_eq!(before.scanning_progress, 50.0);
        assert_eq!(before.indexing_progress, 0.0);
        assert_eq!(before.scanned_files, 2);

        tracker.set_total(2);
        let after = tracker.get_progress();
        assert!(!after.is_scanning);
        assert_eq!(after.scanning_progress, 100.0);
        assert_eq!(after.total_files, 2);
    }

    #[test]
    fn test_total_callback_fires_once() {
        let tracker = ProgressTracker::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        tracker.on_total_known(move |total| {
            fired_clone.store(total, Ordering::SeqCst);
        });

        tracker.set_total(42);
        assert_eq!(fired.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_indexing_progress_ratio() {
        let tracker = ProgressTracker::new();
        tracker.set_total(10);
        for i in 0..5 {
            // Distinct paths still count once each
            tracker.increment_processed(&format!("f{i}"));
        }
        let progress = tracker.get_progress();
        assert_eq!(progress.files_processed, 5);
        assert!((progress.indexing_progress - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_recording() {
        let tracker = ProgressTracker::new();
        tracker.record_error("a.bin", "binary_detection", "magic prefix");
        let progress = tracker.get_progress();
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.errors[0].kind, "binary_detection");
    }
}
