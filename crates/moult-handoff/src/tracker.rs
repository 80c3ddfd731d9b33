//! Outstanding-work accounting for drain coordination.
//!
//! A [`DrainTracker`] counts live units of work (accepted connections,
//! forwarded dispatches) and lets a coordinator wait until the count
//! reaches zero. Each unit is represented by a [`DrainGuard`]; dropping the
//! guard releases the unit exactly once.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Atomic counter paired with a "wait until zero" primitive.
///
/// Cloning yields another handle to the same counter. The orchestrator owns
/// one tracker per concern and hands clones to the components that create
/// work, so no tracker is ever process-global.
#[derive(Clone)]
pub struct DrainTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    label: &'static str,
    count: AtomicUsize,
    idle: Notify,
}

/// One unit of outstanding work. Releases its unit when dropped.
#[must_use = "the unit is released as soon as the guard is dropped"]
pub struct DrainGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl fmt::Debug for DrainGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainGuard")
            .field("tracker", &self.inner.label)
            .finish()
    }
}

impl fmt::Debug for DrainTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTracker")
            .field("label", &self.inner.label)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl DrainTracker {
    /// Create a tracker. The label only shows up in logs.
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                label,
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register one unit of work.
    pub fn enter(&self) -> DrainGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of outstanding units.
    pub fn outstanding(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no unit is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            // Register interest before checking so a release racing with the
            // check cannot be missed.
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until idle or until `timeout` elapses.
    ///
    /// Returns `true` if everything drained, `false` if timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.outstanding();
        if active == 0 {
            debug!(tracker = self.inner.label, "Nothing outstanding, drain complete");
            return true;
        }

        debug!(
            tracker = self.inner.label,
            outstanding = active,
            timeout_secs = timeout.as_secs(),
            "Draining"
        );

        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    tracker = self.inner.label,
                    remaining = self.outstanding(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_counting() {
        let tracker = DrainTracker::new("test");
        assert_eq!(tracker.outstanding(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| tracker.enter()).collect();
        assert_eq!(tracker.outstanding(), 10);

        guards.truncate(5);
        assert_eq!(tracker.outstanding(), 5);

        drop(guards);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_last_release() {
        let tracker = DrainTracker::new("test");
        let g1 = tracker.enter();
        let g2 = tracker.enter();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::task::yield_now().await;
        drop(g1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_when_idle() {
        let tracker = DrainTracker::new("test");
        assert!(tracker.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let tracker = DrainTracker::new("test");
        let _guard = tracker.enter();

        assert!(!tracker.drain(Duration::from_millis(100)).await);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_enter_and_release() {
        let tracker = DrainTracker::new("test");
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = tracker.enter();
                tokio::task::yield_now().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracker.outstanding(), 0);
        assert!(tracker.drain(Duration::from_millis(10)).await);
    }
}
