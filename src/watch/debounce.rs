//! Event coalescing for the file watcher.
//!
//! Burst events collapse into one batch: a per-path latest-event-wins map
//! plus a single timer that resets on every recorded event. When the timer
//! finally fires, the map is snapshotted and delivered as one batch, grouped
//! as removes, then changes, then creates, so deletions free capacity before
//! new files consume it.
//!
//! Shutdown drops pending events without flushing. Flushing during shutdown
//! can deadlock against an integrator holding write leases, and losing a
//! batch at shutdown is acceptable: the next full index rebuilds it.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Normalized file event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Create,
    Write,
    Remove,
    Rename,
}

/// One coalesced batch, grouped for delivery order.
#[derive(Debug, Default)]
pub struct WatchBatch {
    pub removes: Vec<PathBuf>,
    pub changes: Vec<PathBuf>,
    pub creates: Vec<PathBuf>,
}

impl WatchBatch {
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.changes.is_empty() && self.creates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removes.len() + self.changes.len() + self.creates.len()
    }
}

pub struct EventDebouncer {
    pending: Arc<Mutex<FxHashMap<PathBuf, WatchKind>>>,
    /// Every send resets the timer; dropping the sender stops the thread.
    reset_tx: Option<Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EventDebouncer {
    pub fn new(window: Duration, callback: impl Fn(WatchBatch) + Send + 'static) -> Self {
        let pending: Arc<Mutex<FxHashMap<PathBuf, WatchKind>>> =
            Arc::new(Mutex::new(FxHashMap::default()));
        let (reset_tx, reset_rx) = unbounded::<()>();
        let thread_pending = pending.clone();

        let handle = std::thread::Builder::new()
            .name("event-debounce".into())
            .spawn(move || {
                loop {
                    // Sleep until the first event of a burst arrives
                    if reset_rx.recv().is_err() {
                        // Sender dropped: shutdown, pending events are discarded
                        debug!("Debouncer stopped without flushing");
                        return;
                    }

                    // Timer phase: every further event resets the window
                    loop {
                        match reset_rx.recv_timeout(window) {
                            Ok(()) => continue,
                            Err(RecvTimeoutError::Timeout) => {
                                let snapshot = std::mem::take(&mut *thread_pending.lock());
                                let batch = group(snapshot);
                                if !batch.is_empty() {
                                    debug!(events = batch.len(), "Dispatching debounced batch");
                                    callback(batch);
                                }
                                break;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                debug!("Debouncer stopped without flushing");
                                return;
                            }
                        }
                    }
                }
            })
            .expect("spawn debounce thread");

        Self {
            pending,
            reset_tx: Some(reset_tx),
            handle: Some(handle),
        }
    }

    /// Record an event; the latest kind for a path wins.
    pub fn record(&self, path: PathBuf, kind: WatchKind) {
        self.pending.lock().insert(path, kind);
        if let Some(tx) = &self.reset_tx {
            let _ = tx.send(());
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop without flushing. Equivalent to dropping.
    pub fn stop(&mut self) {
        self.reset_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventDebouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn group(events: FxHashMap<PathBuf, WatchKind>) -> WatchBatch {
    let mut batch = WatchBatch::default();
    for (path, kind) in events {
        match kind {
            WatchKind::Remove => batch.removes.push(path),
            WatchKind::Create => batch.creates.push(path),
            WatchKind::Write | WatchKind::Rename => batch.changes.push(path),
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_millis(50);

    fn collecting_debouncer() -> (EventDebouncer, Arc<Mutex<Vec<WatchBatch>>>) {
        let batches: Arc<Mutex<Vec<WatchBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let debouncer = EventDebouncer::new(WINDOW, move |batch| {
            sink.lock().push(batch);
        });
        (debouncer, batches)
    }

    fn wait_for_batches(batches: &Arc<Mutex<Vec<WatchBatch>>>, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while batches.lock().len() < count && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_burst_coalesces_to_one_callback() {
        let (debouncer, batches) = collecting_debouncer();
        for _ in 0..20 {
            debouncer.record(PathBuf::from("/x/a.rs"), WatchKind::Write);
        }
        wait_for_batches(&batches, 1);

        let collected = batches.lock();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].changes, vec![PathBuf::from("/x/a.rs")]);
    }

    #[test]
    fn test_latest_event_wins_per_path() {
        let (debouncer, batches) = collecting_debouncer();
        debouncer.record(PathBuf::from("/x/b.rs"), WatchKind::Remove);
        debouncer.record(PathBuf::from("/x/b.rs"), WatchKind::Create);
        wait_for_batches(&batches, 1);

        let collected = batches.lock();
        assert!(collected[0].removes.is_empty());
        assert_eq!(collected[0].creates, vec![PathBuf::from("/x/b.rs")]);
    }

    #[test]
    fn test_groups_by_kind() {
        let (debouncer, batches) = collecting_debouncer();
        debouncer.record(PathBuf::from("/r"), WatchKind::Remove);
        debouncer.record(PathBuf::from("/w"), WatchKind::Write);
        debouncer.record(PathBuf::from("/c"), WatchKind::Create);
        debouncer.record(PathBuf::from("/n"), WatchKind::Rename);
        wait_for_batches(&batches, 1);

        let collected = batches.lock();
        assert_eq!(collected[0].removes.len(), 1);
        assert_eq!(collected[0].changes.len(), 2);
        assert_eq!(collected[0].creates.len(), 1);
    }

    #[test]
    fn test_shutdown_does_not_flush() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let mut debouncer = EventDebouncer::new(Duration::from_secs(60), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.record(PathBuf::from("/pending.rs"), WatchKind::Write);
        assert_eq!(debouncer.pending_len(), 1);
        debouncer.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0, "pending events are dropped");
    }

    #[test]
    fn test_separate_bursts_fire_separately() {
        let (debouncer, batches) = collecting_debouncer();
        debouncer.record(PathBuf::from("/first.rs"), WatchKind::Write);
        wait_for_batches(&batches, 1);
        debouncer.record(PathBuf::from("/second.rs"), WatchKind::Write);
        wait_for_batches(&batches, 2);

        assert_eq!(batches.lock().len(), 2);
    }
}
