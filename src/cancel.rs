//! Cooperative cancellation threaded through the indexing pipeline.
//!
//! Long-running operations hold a [`CancelToken`] and check it between work
//! units, before lock acquisition, and on channel sends. Tokens are cheap to
//! clone; cancelling any clone cancels all of them. Deriving a child token
//! adds a deadline while still observing the parent's cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled and has no deadline.
    pub fn none() -> Self {
        Self::new()
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// A token that trips automatically once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: None,
            }),
        }
    }

    /// Derive a child token with its own deadline. Cancelling the parent
    /// cancels the child; cancelling the child leaves the parent alone.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Time remaining until this token's own deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_deadline_trips_token() {
        let token = CancelToken::with_timeout(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
