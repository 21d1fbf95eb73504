//! The concurrent indexing pipeline: scanner output fans out to processor
//! workers over a bounded task channel, and their results funnel into the
//! single integrator over a bounded result channel.

pub mod integrator;
pub mod processor;
pub mod progress;

pub use integrator::FileIntegrator;
pub use processor::{FileArtifacts, FileFailure, FileProcessor, ProcessedFile};
pub use progress::{FileError, IndexingProgress, ProgressTracker};

use crate::cancel::CancelToken;
use crate::parse::ParserPool;
use crate::scan::FileTask;
use crate::store::FileService;
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Task channel capacity: `clamp(cores * 8, files / 20, 1000)`.
pub fn task_buffer_size(cores: usize, file_count: usize) -> usize {
    (cores * 8).max(file_count / 20).min(1000).max(1)
}

/// Result channel capacity: `clamp(cores * 16, files / 10, 2000)`.
pub fn result_buffer_size(cores: usize, file_count: usize) -> usize {
    (cores * 16).max(file_count / 10).min(2000).max(1)
}

/// Run the full map/reduce pipeline over the given tasks.
///
/// Spawns `worker_count` processor threads plus a feeder; the integrator runs
/// on the calling thread. Returns the number of files merged.
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline(
    mut tasks: Vec<FileTask>,
    store: Arc<FileService>,
    parsers: Arc<ParserPool>,
    integrator: &mut FileIntegrator,
    worker_count: usize,
    token: &CancelToken,
    progress: &ProgressTracker,
) -> usize {
    let file_count = tasks.len();
    if file_count == 0 {
        return 0;
    }

    // More urgent tasks first; the scanner's policy decided urgency
    tasks.sort_by_key(|t| t.priority);

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let workers = worker_count.max(1);
    let (task_tx, task_rx) = bounded::<FileTask>(task_buffer_size(cores, file_count));
    let (result_tx, result_rx) = bounded::<ProcessedFile>(result_buffer_size(cores, file_count));

    info!(
        files = file_count,
        workers,
        task_buffer = task_buffer_size(cores, file_count),
        result_buffer = result_buffer_size(cores, file_count),
        "Starting indexing pipeline"
    );

    let merged = std::thread::scope(|scope| {
        for worker in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let store = store.clone();
            let parsers = parsers.clone();
            let token = token.clone();
            std::thread::Builder::new()
                .name(format!("processor-{worker}"))
                .spawn_scoped(scope, move || {
                    FileProcessor::new(store, parsers).run(task_rx, result_tx, &token);
                })
                .expect("spawn processor worker");
        }
        // Workers hold their own clones
        drop(task_rx);
        drop(result_tx);

        let feeder_token = token.clone();
        scope.spawn(move || {
            'tasks: for task in tasks {
                if feeder_token.is_cancelled() {
                    debug!("Task feeder cancelled");
                    return;
                }
                // Same back-pressure policy as the result channel: bounded
                // initial timeout, then exponential backoff while full
                let mut pending = task;
                let mut delay = Duration::from_millis(100);
                for attempt in 0..=10u32 {
                    match task_tx.send_timeout(pending, delay) {
                        Ok(()) => continue 'tasks,
                        Err(crossbeam_channel::SendTimeoutError::Timeout(returned)) => {
                            if feeder_token.is_cancelled() {
                                return;
                            }
                            pending = returned;
                            if attempt == 10 {
                                break;
                            }
                            delay = delay.mul_f64(1.5).min(Duration::from_secs(30));
                        }
                        Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                    }
                }
                tracing::error!(path = %pending.path.display(), "Task channel saturated, task dropped");
            }
            // task_tx drops here, letting workers drain and exit
        });

        integrator.run(result_rx, token, progress)
    });

    info!(merged, "Pipeline complete");
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sizing() {
        // Small repo: worker-derived floor wins
        assert_eq!(task_buffer_size(8, 100), 64);
        assert_eq!(result_buffer_size(8, 100), 128);

        // Large repo: file-derived share wins, up to the cap
        assert_eq!(task_buffer_size(8, 10_000), 500);
        assert_eq!(task_buffer_size(8, 100_000), 1000);
        assert_eq!(result_buffer_size(8, 100_000), 2000);

        // Degenerate inputs keep a usable floor
        assert_eq!(task_buffer_size(0, 0), 1);
    }
}
