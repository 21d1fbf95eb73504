//! Per-index-type read/write locks with a total acquisition order.
//!
//! Callers that need several index types MUST go through
//! [`IndexCoordinator::acquire_multiple`], which sorts the requested types by
//! their integer id and acquires in that order; this makes deadlock
//! impossible for conforming callers. Failures mid-acquire release the locks
//! already taken in reverse order. Upgrading a read lease to a write lease is
//! forbidden: release and re-acquire instead.

use crate::error::{CoordinationError, LockMode};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Closed set of index types a lease can cover. The discriminant defines the
/// total acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum IndexType {
    Trigram = 0,
    Symbol = 1,
    Reference = 2,
    CallGraph = 3,
    Postings = 4,
    Location = 5,
    Content = 6,
}

impl IndexType {
    pub const ALL: [IndexType; 7] = [
        IndexType::Trigram,
        IndexType::Symbol,
        IndexType::Reference,
        IndexType::CallGraph,
        IndexType::Postings,
        IndexType::Location,
        IndexType::Content,
    ];

    pub fn id(self) -> usize {
        self as usize
    }
}

/// Point-in-time status of one index type's lock.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub is_indexing: bool,
    pub lock_holders: usize,
    pub last_build_at: Option<Instant>,
}

struct SlotState {
    lock: Arc<RwLock<()>>,
    readers: AtomicUsize,
    writer: AtomicBool,
    last_build: Mutex<Option<Instant>>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            readers: AtomicUsize::new(0),
            writer: AtomicBool::new(false),
            last_build: Mutex::new(None),
        }
    }
}

enum Guard {
    Read(#[allow(dead_code)] ArcRwLockReadGuard<RawRwLock, ()>),
    Write(#[allow(dead_code)] ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// One held per-type lock; bookkeeping is undone on drop.
struct HeldLock {
    state: Arc<SlotState>,
    index: IndexType,
    guard: Option<Guard>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        match self.guard.take() {
            Some(Guard::Read(_)) => {
                self.state.readers.fetch_sub(1, Ordering::Relaxed);
            }
            Some(Guard::Write(_)) => {
                self.state.writer.store(false, Ordering::Relaxed);
            }
            None => {}
        }
        debug!(index = ?self.index, "Released index lock");
    }
}

/// The right to read or write a set of index types until dropped.
pub struct ReleaseHandle {
    locks: Vec<HeldLock>,
}

impl ReleaseHandle {
    /// Types covered by this lease, in acquisition order.
    pub fn types(&self) -> Vec<IndexType> {
        self.locks.iter().map(|l| l.index).collect()
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        // Reverse acquisition order
        while self.locks.pop().is_some() {}
    }
}

/// Coordinator owning one reader-writer lock per index type.
pub struct IndexCoordinator {
    slots: Vec<Arc<SlotState>>,
}

impl IndexCoordinator {
    pub fn new() -> Self {
        Self {
            slots: IndexType::ALL.iter().map(|_| Arc::new(SlotState::new())).collect(),
        }
    }

    /// Acquire a single index lock with a timeout.
    pub fn acquire(
        &self,
        index: IndexType,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ReleaseHandle, CoordinationError> {
        let lock = self.acquire_slot(index, mode, timeout)?;
        Ok(ReleaseHandle { locks: vec![lock] })
    }

    /// Acquire several index locks as one lease. Types are deduplicated and
    /// sorted by id before acquisition; the overall timeout bounds the whole
    /// acquisition, not each lock.
    pub fn acquire_multiple(
        &self,
        types: &[IndexType],
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ReleaseHandle, CoordinationError> {
        let mut sorted: Vec<IndexType> = types.to_vec();
        sorted.sort();
        sorted.dedup();

        let deadline = Instant::now() + timeout;
        let mut locks = Vec::with_capacity(sorted.len());
        for index in sorted {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.acquire_slot(index, mode, remaining) {
                Ok(lock) => locks.push(lock),
                Err(e) => {
                    // `locks` drops here, releasing in reverse order
                    warn!(index = ?index, "Multi-lock acquisition failed midway");
                    return Err(e);
                }
            }
        }
        Ok(ReleaseHandle { locks })
    }

    fn acquire_slot(
        &self,
        index: IndexType,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<HeldLock, CoordinationError> {
        let state = self.slots[index.id()].clone();
        let guard = match mode {
            LockMode::Read => state
                .lock
                .try_read_arc_for(timeout)
                .map(Guard::Read),
            LockMode::Write => state
                .lock
                .try_write_arc_for(timeout)
                .map(Guard::Write),
        };

        match guard {
            Some(guard) => {
                match mode {
                    LockMode::Read => {
                        state.readers.fetch_add(1, Ordering::Relaxed);
                    }
                    LockMode::Write => {
                        state.writer.store(true, Ordering::Relaxed);
                    }
                }
                Ok(HeldLock {
                    state,
                    index,
                    guard: Some(guard),
                })
            }
            None => Err(CoordinationError::LockTimeout {
                index,
                mode,
                waited: timeout,
            }),
        }
    }

    pub fn status(&self, index: IndexType) -> IndexStatus {
        let state = &self.slots[index.id()];
        let writer = state.writer.load(Ordering::Relaxed);
        IndexStatus {
            is_indexing: writer,
            lock_holders: state.readers.load(Ordering::Relaxed) + usize::from(writer),
            last_build_at: *state.last_build.lock(),
        }
    }

    pub fn all_statuses(&self) -> Vec<(IndexType, IndexStatus)> {
        IndexType::ALL
            .iter()
            .map(|&index| (index, self.status(index)))
            .collect()
    }

    /// Record a completed build for the index type.
    pub fn mark_built(&self, index: IndexType) {
        *self.slots[index.id()].last_build.lock() = Some(Instant::now());
    }

    /// Block until the index is readable (no writer), up to the timeout.
    pub fn wait_for_index(
        &self,
        index: IndexType,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        self.acquire(index, LockMode::Read, timeout).map(|h| h.release())
    }
}

impl Default for IndexCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Retrying wrapper around the coordinator.
///
/// Retries classified-retryable failures (timeouts, transient busy) with
/// exponential backoff; invalid/not-found conditions are returned as is.
pub struct LockManager {
    coordinator: Arc<IndexCoordinator>,
    max_retry_attempts: u32,
    base_delay: Duration,
    factor: f64,
}

impl LockManager {
    pub fn new(coordinator: Arc<IndexCoordinator>) -> Self {
        Self {
            coordinator,
            max_retry_attempts: 3,
            base_delay: Duration::from_millis(50),
            factor: 2.0,
        }
    }

    pub fn with_retry_policy(
        mut self,
        max_retry_attempts: u32,
        base_delay: Duration,
        factor: f64,
    ) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self.base_delay = base_delay;
        self.factor = factor;
        self
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    pub fn acquire_multiple(
        &self,
        types: &[IndexType],
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ReleaseHandle, CoordinationError> {
        let mut attempt = 0u32;
        loop {
            match self.coordinator.acquire_multiple(types, mode, timeout) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() && attempt < self.max_retry_attempts => {
                    let delay = self
                        .base_delay
                        .mul_f64(self.factor.powi(attempt as i32));
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying lock acquisition"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
