//! Priority operation queue and its dispatcher.
//!
//! A binary min-heap over a `Vec` with a parallel id → slot map so `remove`
//! and `update_priority` stay O(log n). Ordering composes four keys: priority,
//! a staleness boost once an operation has waited past the threshold, queue
//! time, and the user-request flag. Because staleness moves with the clock,
//! the heap is restored against the current instant before every dequeue.
//!
//! The dispatcher is a single thread polling with adaptive backoff: 50ms when
//! work is flowing, doubling to 500ms when idle. Failed operations re-enter
//! the queue with exponential backoff and ±20% jitter until their retry
//! budget runs out.

use crate::cancel::CancelToken;
use crate::coordinate::locks::IndexType;
use crate::coordinate::operations::{OperationKind, OperationsManager};
use crate::error::CoordinationError;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Total order of operation priorities; lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperationPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl OperationPriority {
    /// One step more urgent, saturating at Critical.
    fn boosted(self) -> Self {
        match self {
            OperationPriority::Critical | OperationPriority::High => OperationPriority::Critical,
            OperationPriority::Normal => OperationPriority::High,
            OperationPriority::Low => OperationPriority::Normal,
            OperationPriority::Background => OperationPriority::Low,
        }
    }
}

/// Waiting time after which an operation gets its aging boost.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(30);

/// What enqueue does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullBehavior {
    Reject,
    #[default]
    Wait,
    /// Evict the worst queued operation if the incoming one ranks strictly
    /// better; reject otherwise.
    Prioritize,
}

pub type OperationFn = Arc<dyn Fn(&CancelToken) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct QueuedOperation {
    pub id: u64,
    pub kind: OperationKind,
    pub required: Vec<IndexType>,
    pub priority: OperationPriority,
    pub queued_at: Instant,
    pub est_duration: Option<Duration>,
    pub user_request: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub func: OperationFn,
    pub metadata: FxHashMap<String, String>,
}

impl QueuedOperation {
    pub fn new(
        id: u64,
        kind: OperationKind,
        required: Vec<IndexType>,
        priority: OperationPriority,
        func: impl Fn(&CancelToken) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            kind,
            required,
            priority,
            queued_at: Instant::now(),
            est_duration: None,
            user_request: false,
            retry_count: 0,
            max_retries: 3,
            func: Arc::new(func),
            metadata: FxHashMap::default(),
        }
    }

    pub fn user_requested(mut self) -> Self {
        self.user_request = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.queued_at) > STALENESS_THRESHOLD
    }

    fn effective_priority(&self, now: Instant) -> OperationPriority {
        if self.is_stale(now) {
            self.priority.boosted()
        } else {
            self.priority
        }
    }
}

/// Four-key comparison evaluated against `now`:
/// effective priority, staleness, queue time, then user-request flag.
fn compare(a: &QueuedOperation, b: &QueuedOperation, now: Instant) -> CmpOrdering {
    a.effective_priority(now)
        .cmp(&b.effective_priority(now))
        .then_with(|| b.is_stale(now).cmp(&a.is_stale(now)))
        .then_with(|| a.queued_at.cmp(&b.queued_at))
        .then_with(|| b.user_request.cmp(&a.user_request))
}

struct QueueInner {
    heap: Vec<QueuedOperation>,
    positions: FxHashMap<u64, usize>,
}

impl QueueInner {
    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.positions.insert(self.heap[i].id, i);
        self.positions.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize, now: Instant) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if compare(&self.heap[i], &self.heap[parent], now) == CmpOrdering::Less {
                self.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize, now: Instant) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.heap.len()
                && compare(&self.heap[left], &self.heap[smallest], now) == CmpOrdering::Less
            {
                smallest = left;
            }
            if right < self.heap.len()
                && compare(&self.heap[right], &self.heap[smallest], now) == CmpOrdering::Less
            {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    /// Repair the heap property against the current clock; aging can move
    /// entries that were placed before they became stale.
    fn restore(&mut self, now: Instant) {
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i, now);
        }
    }

    fn remove_at(&mut self, i: usize, now: Instant) -> QueuedOperation {
        let last = self.heap.len() - 1;
        self.swap(i, last);
        let removed = self.heap.pop().expect("non-empty heap");
        self.positions.remove(&removed.id);
        if i < self.heap.len() {
            self.sift_down(i, now);
            self.sift_up(i, now);
        }
        removed
    }

    /// Index of the worst entry under the comparison order (a leaf).
    fn worst_index(&self, now: Instant) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let start = self.heap.len() / 2;
        (start..self.heap.len()).max_by(|&a, &b| compare(&self.heap[a], &self.heap[b], now))
    }
}

pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    space: Condvar,
    size_limit: usize,
    full_behavior: QueueFullBehavior,
    /// How long `Wait` blocks for space before giving up.
    wait_timeout: Duration,
}

impl OperationQueue {
    pub fn new(size_limit: usize, full_behavior: QueueFullBehavior) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: Vec::new(),
                positions: FxHashMap::default(),
            }),
            space: Condvar::new(),
            size_limit: size_limit.max(1),
            full_behavior,
            wait_timeout: Duration::from_secs(10),
        }
    }

    pub fn enqueue(&self, op: QueuedOperation) -> Result<(), CoordinationError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.positions.contains_key(&op.id) {
            return Err(CoordinationError::DuplicateOperation { id: op.id });
        }

        if inner.heap.len() >= self.size_limit {
            match self.full_behavior {
                QueueFullBehavior::Reject => {
                    return Err(CoordinationError::QueueFull {
                        capacity: self.size_limit,
                    });
                }
                QueueFullBehavior::Wait => {
                    let deadline = Instant::now() + self.wait_timeout;
                    while inner.heap.len() >= self.size_limit {
                        if self
                            .space
                            .wait_until(&mut inner, deadline)
                            .timed_out()
                        {
                            return Err(CoordinationError::QueueFull {
                                capacity: self.size_limit,
                            });
                        }
                    }
                }
                QueueFullBehavior::Prioritize => {
                    let worst = inner
                        .worst_index(now)
                        .expect("full queue has entries");
                    if compare(&op, &inner.heap[worst], now) == CmpOrdering::Less {
                        let evicted = inner.remove_at(worst, now);
                        debug!(
                            evicted = evicted.id,
                            incoming = op.id,
                            "Evicted queued operation for higher-ranked arrival"
                        );
                    } else {
                        return Err(CoordinationError::QueueFull {
                            capacity: self.size_limit,
                        });
                    }
                }
            }
        }

        let i = inner.heap.len();
        inner.positions.insert(op.id, i);
        inner.heap.push(op);
        inner.sift_up(i, now);
        Ok(())
    }

    /// Remove and return the minimum under the four-key order.
    pub fn dequeue(&self) -> Option<QueuedOperation> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.heap.is_empty() {
            return None;
        }
        inner.restore(now);
        let op = inner.remove_at(0, now);
        drop(inner);
        self.space.notify_one();
        Some(op)
    }

    /// Id of the current minimum without removing it.
    pub fn peek_id(&self) -> Option<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.restore(now);
        inner.heap.first().map(|op| op.id)
    }

    pub fn remove(&self, id: u64) -> Option<QueuedOperation> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let i = *inner.positions.get(&id)?;
        let op = inner.remove_at(i, now);
        drop(inner);
        self.space.notify_one();
        Some(op)
    }

    pub fn update_priority(&self, id: u64, priority: OperationPriority) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(&i) = inner.positions.get(&id) else {
            return false;
        };
        inner.heap[i].priority = priority;
        inner.sift_up(i, now);
        inner.sift_down(i, now);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

/// Dispatcher polling bounds.
const MIN_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_millis(500);

/// Retry backoff cap.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// `min(2^(k-1) * 1s, 30s)` with ±20% jitter, floored at the base delay.
fn retry_delay(retry_count: u32) -> Duration {
    let exp = BASE_RETRY_DELAY
        .mul_f64(2f64.powi(retry_count.saturating_sub(1) as i32))
        .min(MAX_RETRY_DELAY);
    let jittered = exp.mul_f64(rand::rng().random_range(0.8..=1.2));
    jittered.max(BASE_RETRY_DELAY)
}

/// Single dispatcher thread draining the queue through the operations
/// manager. Each dequeued operation executes on its own thread so a slow
/// operation never stalls dispatch.
pub struct QueueProcessor {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl QueueProcessor {
    pub fn start(queue: Arc<OperationQueue>, manager: Arc<OperationsManager>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("queue-dispatch".into())
            .spawn(move || {
                let mut poll = MIN_POLL;
                info!("Queue processor started");
                while !thread_shutdown.load(Ordering::Acquire) {
                    let mut worked = false;
                    if manager.can_start_queued() {
                        if let Some(op) = queue.dequeue() {
                            worked = true;
                            Self::spawn_execution(op, queue.clone(), manager.clone());
                        }
                    }

                    poll = if worked {
                        MIN_POLL
                    } else {
                        (poll * 2).min(MAX_POLL)
                    };
                    std::thread::sleep(poll);
                }
                info!("Queue processor stopped");
            })
            .expect("spawn queue dispatcher");

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn spawn_execution(op: QueuedOperation, queue: Arc<OperationQueue>, manager: Arc<OperationsManager>) {
        std::thread::spawn(move || {
            let func = op.func.clone();
            let result = match op.kind {
                OperationKind::Search => manager
                    .execute_search(&CancelToken::none(), &op.required, |token| func(token))
                    .and_then(|r| {
                        r.map_err(|e| CoordinationError::OperationFailed(e.to_string()))
                    }),
                OperationKind::Indexing | OperationKind::Maintenance => {
                    manager.execute_indexing(&CancelToken::none(), &op.required, |token| {
                        func(token)
                    })
                }
            };

            if let Err(e) = result {
                if op.retry_count < op.max_retries {
                    let mut retry = op.clone();
                    retry.retry_count += 1;
                    let delay = retry_delay(retry.retry_count);
                    debug!(
                        operation = op.id,
                        attempt = retry.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, scheduling retry"
                    );
                    std::thread::sleep(delay);
                    if let Err(e) = queue.enqueue(retry) {
                        error!(operation = op.id, error = %e, "Failed to re-enqueue operation");
                    }
                } else {
                    error!(
                        operation = op.id,
                        retries = op.retry_count,
                        error = %e,
                        "Operation failed permanently"
                    );
                }
            }
        });
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> OperationFn {
        Arc::new(|_| Ok(()))
    }

    fn op(id: u64, priority: OperationPriority) -> QueuedOperation {
        QueuedOperation {
            id,
            kind: OperationKind::Indexing,
            required: vec![IndexType::Trigram],
            priority,
            queued_at: Instant::now(),
            est_duration: None,
            user_request: false,
            retry_count: 0,
            max_retries: 3,
            func: noop(),
            metadata: FxHashMap::default(),
        }
    }

    #[test]
    fn test_dequeue_order_by_priority() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        queue.enqueue(op(1, OperationPriority::Low)).unwrap();
        queue.enqueue(op(2, OperationPriority::Critical)).unwrap();
        queue.enqueue(op(3, OperationPriority::Normal)).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, 2);
        assert_eq!(queue.dequeue().unwrap().id, 3);
        assert_eq!(queue.dequeue().unwrap().id, 1);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        let mut first = op(1, OperationPriority::Normal);
        let mut second = op(2, OperationPriority::Normal);
        if let Some(earlier) = Instant::now().checked_sub(Duration::from_millis(10)) {
            first.queued_at = earlier;
        }
        second.queued_at = Instant::now();
        queue.enqueue(second).unwrap();
        queue.enqueue(first).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, 1);
    }

    #[test]
    fn test_user_request_breaks_ties() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        let at = Instant::now();
        let mut plain = op(1, OperationPriority::Normal);
        let mut user = op(2, OperationPriority::Normal);
        plain.queued_at = at;
        user.queued_at = at;
        user.user_request = true;
        queue.enqueue(plain).unwrap();
        queue.enqueue(user).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, 2);
    }

    #[test]
    fn test_aging_boosts_stale_background_over_fresh_low() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        let mut stale = op(1, OperationPriority::Background);
        let Some(past) = Instant::now().checked_sub(STALENESS_THRESHOLD + Duration::from_secs(1))
        else {
            return;
        };
        stale.queued_at = past;
        let fresh = op(2, OperationPriority::Low);
        queue.enqueue(fresh).unwrap();
        queue.enqueue(stale).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        queue.enqueue(op(7, OperationPriority::Normal)).unwrap();
        assert!(matches!(
            queue.enqueue(op(7, OperationPriority::High)),
            Err(CoordinationError::DuplicateOperation { id: 7 })
        ));
    }

    #[test]
    fn test_reject_when_full() {
        let queue = OperationQueue::new(2, QueueFullBehavior::Reject);
        queue.enqueue(op(1, OperationPriority::Normal)).unwrap();
        queue.enqueue(op(2, OperationPriority::Normal)).unwrap();
        assert!(matches!(
            queue.enqueue(op(3, OperationPriority::Normal)),
            Err(CoordinationError::QueueFull { capacity: 2 })
        ));
    }

    #[test]
    fn test_prioritize_evicts_worse() {
        let queue = OperationQueue::new(2, QueueFullBehavior::Prioritize);
        queue.enqueue(op(1, OperationPriority::Background)).unwrap();
        queue.enqueue(op(2, OperationPriority::Normal)).unwrap();

        // Better than the worst queued entry: evicts id 1
        queue.enqueue(op(3, OperationPriority::High)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap().id, 3);
        assert_eq!(queue.dequeue().unwrap().id, 2);

        // Not better than anything: rejected
        queue.enqueue(op(4, OperationPriority::Critical)).unwrap();
        queue.enqueue(op(5, OperationPriority::Critical)).unwrap();
        assert!(queue.enqueue(op(6, OperationPriority::Background)).is_err());
    }

    #[test]
    fn test_remove_and_update_priority() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        queue.enqueue(op(1, OperationPriority::Low)).unwrap();
        queue.enqueue(op(2, OperationPriority::Low)).unwrap();
        queue.enqueue(op(3, OperationPriority::Critical)).unwrap();

        assert!(queue.remove(3).is_some());
        assert!(queue.remove(99).is_none());

        assert!(queue.update_priority(2, OperationPriority::Critical));
        assert_eq!(queue.dequeue().unwrap().id, 2);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = OperationQueue::new(16, QueueFullBehavior::Reject);
        queue.enqueue(op(5, OperationPriority::High)).unwrap();
        assert_eq!(queue.peek_id(), Some(5));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retry_delay_bounds() {
        for k in 1..12 {
            let delay = retry_delay(k);
            assert!(delay >= BASE_RETRY_DELAY);
            assert!(delay <= MAX_RETRY_DELAY.mul_f64(1.2));
        }
    }

    #[test]
    fn test_processor_drains_queue() {
        use crate::config::Config;
        use crate::coordinate::locks::IndexCoordinator;

        let queue = Arc::new(OperationQueue::new(16, QueueFullBehavior::Reject));
        let manager = Arc::new(OperationsManager::new(
            Arc::new(IndexCoordinator::new()),
            &Config::default(),
        ));

        let counter = Arc::new(AtomicUsize::new(0));
        for id in 0..4 {
            let counter = counter.clone();
            queue
                .enqueue(QueuedOperation::new(
                    id,
                    OperationKind::Indexing,
                    vec![IndexType::Symbol],
                    OperationPriority::Normal,
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                ))
                .unwrap();
        }

        let mut processor = QueueProcessor::start(queue.clone(), manager);
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        processor.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(queue.is_empty());
    }
}
