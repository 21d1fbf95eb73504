//! Admission control for concurrent index operations.
//!
//! Sits above the lock coordinator: enforces a global cap and a per-index-type
//! cap, registers every running operation so it can be inspected and
//! cancelled, and wraps each operation in a default timeout. Read operations
//! take one combined multi-read lease; write operations acquire their
//! per-type write leases one at a time in the total order, so work already
//! merged stays merged when a later lock times out.

use crate::cancel::CancelToken;
use crate::config::{Config, FeatureFlags};
use crate::coordinate::locks::{IndexCoordinator, IndexType, LockManager, ReleaseHandle};
use crate::error::{CoordinationError, LockMode};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-index-type concurrent operation cap.
pub const MAX_OPERATIONS_PER_INDEX_TYPE: usize = 10;

/// Default timeout wrapped around every operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Global cap default: `min(cores * 2, 16)`, floor 2.
pub fn default_max_concurrent_ops() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cores * 2).min(16).max(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Indexing,
    Search,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Registry entry for a running operation.
pub struct ActiveOperation {
    pub id: u64,
    pub kind: OperationKind,
    pub required: Vec<IndexType>,
    pub started: Instant,
    status: Mutex<OperationStatus>,
    token: CancelToken,
    /// Leases held on behalf of this operation; drained on cancel.
    leases: Mutex<Vec<ReleaseHandle>>,
}

impl ActiveOperation {
    pub fn status(&self) -> OperationStatus {
        *self.status.lock()
    }
}

/// Snapshot of an active operation for stats/health output.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: u64,
    pub kind: OperationKind,
    pub required: Vec<IndexType>,
    pub running_for: Duration,
    pub status: OperationStatus,
}

/// Memory-pressure gate; only consulted when the feature flags enable it.
struct MemoryGate {
    enabled: bool,
    degrade_search: bool,
    limit_bytes: u64,
    system: Mutex<sysinfo::System>,
    last_check: Mutex<Instant>,
    over_limit: AtomicBool,
}

impl MemoryGate {
    const CHECK_INTERVAL: Duration = Duration::from_millis(500);

    fn new(flags: &FeatureFlags, max_memory_mb: u64) -> Self {
        Self {
            enabled: flags.enable_memory_limits,
            degrade_search: flags.enable_graceful_degradation,
            limit_bytes: max_memory_mb * 1024 * 1024,
            system: Mutex::new(sysinfo::System::new()),
            last_check: Mutex::new(Instant::now() - Self::CHECK_INTERVAL),
            over_limit: AtomicBool::new(false),
        }
    }

    fn is_over_limit(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut last = self.last_check.lock();
        if last.elapsed() >= Self::CHECK_INTERVAL {
            *last = Instant::now();
            let pid = sysinfo::Pid::from_u32(std::process::id());
            let mut system = self.system.lock();
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let used = system.process(pid).map(|p| p.memory()).unwrap_or(0);
            let over = used > self.limit_bytes;
            if over && !self.over_limit.load(Ordering::Relaxed) {
                warn!(
                    used_bytes = used,
                    limit_bytes = self.limit_bytes,
                    "Memory threshold exceeded, deferring index operations"
                );
            }
            self.over_limit.store(over, Ordering::Relaxed);
        }
        self.over_limit.load(Ordering::Relaxed)
    }
}

pub struct OperationsManager {
    lock_manager: LockManager,
    max_concurrent: usize,
    active: Mutex<FxHashMap<u64, Arc<ActiveOperation>>>,
    active_count: AtomicUsize,
    per_type: [AtomicUsize; IndexType::ALL.len()],
    next_id: AtomicU64,
    memory: MemoryGate,
}

impl OperationsManager {
    pub fn new(coordinator: Arc<IndexCoordinator>, config: &Config) -> Self {
        Self {
            lock_manager: LockManager::new(coordinator),
            max_concurrent: default_max_concurrent_ops(),
            active: Mutex::new(FxHashMap::default()),
            active_count: AtomicUsize::new(0),
            per_type: Default::default(),
            next_id: AtomicU64::new(1),
            memory: MemoryGate::new(&config.feature_flags, config.performance.max_memory_mb),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Whether the queue processor may start another queued operation.
    pub fn can_start_queued(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    /// Run a read operation under one combined multi-read lease.
    pub fn execute_search<R>(
        &self,
        parent: &CancelToken,
        types: &[IndexType],
        f: impl FnOnce(&CancelToken) -> R,
    ) -> Result<R, CoordinationError> {
        if self.memory.is_over_limit() && self.memory.degrade_search {
            return Err(CoordinationError::SearchSuspended);
        }

        let op = self.admit(OperationKind::Search, types, parent)?;
        let result = (|| {
            if op.token.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let timeout = op.token.remaining().unwrap_or(DEFAULT_OPERATION_TIMEOUT);
            let lease = self
                .lock_manager
                .acquire_multiple(types, LockMode::Read, timeout)?;
            op.leases.lock().push(lease);

            let value = f(&op.token);

            op.leases.lock().clear();
            Ok(value)
        })();

        self.finish(&op, &result);
        result
    }

    /// Run a write operation. Write leases are taken per type, one at a time
    /// in the total order, and all held while `f` runs.
    pub fn execute_indexing(
        &self,
        parent: &CancelToken,
        types: &[IndexType],
        f: impl FnOnce(&CancelToken) -> anyhow::Result<()>,
    ) -> Result<(), CoordinationError> {
        if self.memory.is_over_limit() {
            return Err(CoordinationError::IndexingDeferred);
        }

        let op = self.admit(OperationKind::Indexing, types, parent)?;
        let result = (|| {
            let mut sorted: Vec<IndexType> = types.to_vec();
            sorted.sort();
            sorted.dedup();

            for index in sorted {
                if op.token.is_cancelled() {
                    return Err(CoordinationError::Cancelled);
                }
                let timeout = op.token.remaining().unwrap_or(DEFAULT_OPERATION_TIMEOUT);
                let lease = self
                    .lock_manager
                    .acquire_multiple(&[index], LockMode::Write, timeout)?;
                op.leases.lock().push(lease);
            }

            let outcome =
                f(&op.token).map_err(|e| CoordinationError::OperationFailed(e.to_string()));

            op.leases.lock().clear();
            outcome
        })();

        self.finish(&op, &result);
        result
    }

    /// Cancel a running operation: trip its token, release its leases, and
    /// mark it cancelled. Unknown ids are an error.
    pub fn cancel_operation(&self, id: u64) -> Result<(), CoordinationError> {
        let op = self
            .active
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CoordinationError::OperationNotFound { id })?;

        op.token.cancel();
        op.leases.lock().clear();
        *op.status.lock() = OperationStatus::Cancelled;
        info!(operation = id, "Operation cancelled");
        Ok(())
    }

    /// Cancel everything currently registered (used on close).
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = self.active.lock().keys().copied().collect();
        for id in ids {
            let _ = self.cancel_operation(id);
        }
    }

    pub fn active_operations(&self) -> Vec<OperationInfo> {
        self.active
            .lock()
            .values()
            .map(|op| OperationInfo {
                id: op.id,
                kind: op.kind,
                required: op.required.clone(),
                running_for: op.started.elapsed(),
                status: op.status(),
            })
            .collect()
    }

    /// Reserve capacity and register the operation.
    fn admit(
        &self,
        kind: OperationKind,
        types: &[IndexType],
        parent: &CancelToken,
    ) -> Result<Arc<ActiveOperation>, CoordinationError> {
        let active = self.active_count.fetch_add(1, Ordering::AcqRel) + 1;
        if active > self.max_concurrent {
            self.active_count.fetch_sub(1, Ordering::AcqRel);
            return Err(CoordinationError::GlobalCapExceeded {
                active: active - 1,
                limit: self.max_concurrent,
            });
        }

        let mut reserved = Vec::with_capacity(types.len());
        for &index in types {
            let count = self.per_type[index.id()].fetch_add(1, Ordering::AcqRel) + 1;
            if count > MAX_OPERATIONS_PER_INDEX_TYPE {
                self.per_type[index.id()].fetch_sub(1, Ordering::AcqRel);
                for &r in &reserved {
                    self.per_type[IndexType::id(r)].fetch_sub(1, Ordering::AcqRel);
                }
                self.active_count.fetch_sub(1, Ordering::AcqRel);
                return Err(CoordinationError::IndexCapExceeded {
                    index,
                    limit: MAX_OPERATIONS_PER_INDEX_TYPE,
                });
            }
            reserved.push(index);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = Arc::new(ActiveOperation {
            id,
            kind,
            required: types.to_vec(),
            started: Instant::now(),
            status: Mutex::new(OperationStatus::Running),
            token: parent.child_with_timeout(DEFAULT_OPERATION_TIMEOUT),
            leases: Mutex::new(Vec::new()),
        });
        self.active.lock().insert(id, op.clone());
        debug!(operation = id, kind = ?kind, "Operation registered");
        Ok(op)
    }

    /// Record the terminal status and unregister.
    fn finish<R>(&self, op: &Arc<ActiveOperation>, result: &Result<R, CoordinationError>) {
        {
            let mut status = op.status.lock();
            if !status.is_terminal() {
                *status = match result {
                    Ok(_) => OperationStatus::Completed,
                    Err(CoordinationError::Cancelled)
                    | Err(CoordinationError::DeadlineExceeded) => OperationStatus::Cancelled,
                    Err(_) => OperationStatus::Failed,
                };
            }
        }

        self.active.lock().remove(&op.id);
        for &index in &op.required {
            self.per_type[index.id()].fetch_sub(1, Ordering::AcqRel);
        }
        self.active_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn manager() -> OperationsManager {
        OperationsManager::new(Arc::new(IndexCoordinator::new()), &Config::default())
    }

    #[test]
    fn test_search_runs_under_read_lease() {
        let m = manager();
        let out = m
            .execute_search(
                &CancelToken::none(),
                &[IndexType::Trigram, IndexType::Symbol],
                |_| 41 + 1,
            )
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_indexing_failure_is_surfaced() {
        let m = manager();
        let result = m.execute_indexing(&CancelToken::none(), &[IndexType::Symbol], |_| {
            anyhow::bail!("merge exploded")
        });
        assert!(matches!(
            result,
            Err(CoordinationError::OperationFailed(_))
        ));
        // Capacity was returned
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_global_cap() {
        let m = Arc::new(manager());
        let held = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..m.max_concurrent() {
            let m = m.clone();
            let held = held.clone();
            let release = release.clone();
            handles.push(thread::spawn(move || {
                let _ = m.execute_search(&CancelToken::none(), &[IndexType::Content], |_| {
                    held.fetch_add(1, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                });
            }));
        }

        // Wait for all slots to fill
        while held.load(Ordering::SeqCst) < m.max_concurrent() {
            thread::sleep(Duration::from_millis(5));
        }

        let overflow = m.execute_search(&CancelToken::none(), &[IndexType::Content], |_| ());
        assert!(matches!(
            overflow,
            Err(CoordinationError::GlobalCapExceeded { .. })
        ));

        release.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_cancelled_parent_short_circuits() {
        let m = manager();
        let token = CancelToken::new();
        token.cancel();
        let result = m.execute_search(&token, &[IndexType::Trigram], |_| ());
        assert!(matches!(result, Err(CoordinationError::Cancelled)));
    }

    #[test]
    fn test_cancel_operation_not_found() {
        let m = manager();
        assert!(matches!(
            m.cancel_operation(12345),
            Err(CoordinationError::OperationNotFound { .. })
        ));
    }

    #[test]
    fn test_registry_visible_while_running() {
        let m = Arc::new(manager());
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));

        let handle = {
            let m = m.clone();
            let entered = entered.clone();
            let release = release.clone();
            thread::spawn(move || {
                let _ = m.execute_search(&CancelToken::none(), &[IndexType::Location], |_| {
                    entered.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                });
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        let ops = m.active_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Search);
        assert_eq!(ops[0].status, OperationStatus::Running);

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(m.active_operations().is_empty());
    }
}
