//! Pausable work queue between producers and a dispatch worker.
//!
//! A queue starts [`QueueState::Paused`]: submissions are buffered. On
//! [`WorkQueue::resume`] the buffer is flushed in submission order and later
//! submissions pass straight through. [`WorkQueue::pause`] switches back to
//! buffering.
//!
//! Every forwarded item carries a [`DrainGuard`] from the orchestrator's
//! in-flight tracker, so work that left the queue but has not been handled
//! yet is still visible to the drain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use moult_handoff::{DrainGuard, DrainTracker};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Pause state of a [`WorkQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Paused,
    Running,
}

/// The dispatch worker behind this queue has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("work queue '{0}' is closed")]
pub struct QueueClosed(pub &'static str);

/// A forwarded item together with its in-flight guard.
///
/// The guard must live until the item has been handled.
#[derive(Debug)]
pub struct Tracked<T> {
    item: T,
    guard: DrainGuard,
}

impl<T> Tracked<T> {
    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn into_parts(self) -> (T, DrainGuard) {
        (self.item, self.guard)
    }
}

struct QueueInner<T> {
    state: QueueState,
    buffer: VecDeque<T>,
    output: mpsc::UnboundedSender<Tracked<T>>,
    in_flight: DrainTracker,
}

impl<T> QueueInner<T> {
    fn forward(&self, item: T) -> Result<(), T> {
        let tracked = Tracked {
            item,
            guard: self.in_flight.enter(),
        };
        self.output.send(tracked).map_err(|e| e.0.item)
    }
}

/// Buffering relay in front of a dispatch worker. Cheap to clone.
pub struct WorkQueue<T> {
    label: &'static str,
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("WorkQueue")
            .field("label", &self.label)
            .field("state", &inner.state)
            .field("buffered", &inner.buffer.len())
            .finish()
    }
}

impl<T> WorkQueue<T> {
    /// Create a paused queue and the receiving end for its dispatch worker.
    pub fn new(
        label: &'static str,
        in_flight: DrainTracker,
    ) -> (Self, mpsc::UnboundedReceiver<Tracked<T>>) {
        let (output, rx) = mpsc::unbounded_channel();
        let queue = Self {
            label,
            inner: Arc::new(Mutex::new(QueueInner {
                state: QueueState::Paused,
                buffer: VecDeque::new(),
                output,
                in_flight,
            })),
        };
        (queue, rx)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Submit an item. Never waits for the item to be handled.
    pub fn submit(&self, item: T) -> Result<(), QueueClosed> {
        let mut inner = self.lock();
        match inner.state {
            QueueState::Paused => {
                inner.buffer.push_back(item);
                Ok(())
            }
            QueueState::Running => inner.forward(item).map_err(|_| QueueClosed(self.label)),
        }
    }

    /// Flush the buffer in order and switch to pass-through.
    ///
    /// Flush and transition happen under one lock, so a concurrent
    /// submission can never overtake a buffered item. No-op when already
    /// running. Returns the number of flushed items.
    pub fn resume(&self) -> Result<usize, QueueClosed> {
        let mut inner = self.lock();
        if inner.state == QueueState::Running {
            return Ok(0);
        }

        let mut flushed = 0;
        while let Some(item) = inner.buffer.pop_front() {
            if let Err(item) = inner.forward(item) {
                inner.buffer.push_front(item);
                error!(queue = self.label, buffered = inner.buffer.len(), "Dispatch worker gone, queue stays paused");
                return Err(QueueClosed(self.label));
            }
            flushed += 1;
        }

        inner.state = QueueState::Running;
        debug!(queue = self.label, flushed, "Queue resumed");
        Ok(flushed)
    }

    /// Switch back to buffering. No-op when already paused.
    ///
    /// Items forwarded before the pause stay in flight.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Paused {
            return;
        }
        inner.state = QueueState::Paused;
        debug!(queue = self.label, "Queue paused");
    }

    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    pub fn is_paused(&self) -> bool {
        self.state() == QueueState::Paused
    }

    /// Number of items waiting for the next resume.
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_ready(rx: &mut mpsc::UnboundedReceiver<Tracked<u32>>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(tracked) = rx.try_recv() {
            out.push(tracked.into_parts().0);
        }
        out
    }

    #[test]
    fn test_starts_paused_and_buffers() {
        let (queue, mut rx) = WorkQueue::new("test", DrainTracker::new("in-flight"));
        assert!(queue.is_paused());

        for i in 0..3 {
            queue.submit(i).unwrap();
        }
        assert_eq!(queue.buffered(), 3);
        assert!(drain_ready(&mut rx).is_empty());
    }

    #[test]
    fn test_resume_flushes_in_submission_order() {
        let (queue, mut rx) = WorkQueue::new("test", DrainTracker::new("in-flight"));
        for i in 0..5 {
            queue.submit(i).unwrap();
        }

        assert_eq!(queue.resume(), Ok(5));
        queue.submit(5).unwrap();
        queue.submit(6).unwrap();

        assert_eq!(drain_ready(&mut rx), [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(queue.state(), QueueState::Running);
        assert_eq!(queue.buffered(), 0);
    }

    #[test]
    fn test_pause_stops_pass_through() {
        let (queue, mut rx) = WorkQueue::new("test", DrainTracker::new("in-flight"));
        queue.resume().unwrap();
        queue.submit(1).unwrap();

        queue.pause();
        queue.submit(2).unwrap();
        queue.submit(3).unwrap();
        assert_eq!(drain_ready(&mut rx), [1]);

        assert_eq!(queue.resume(), Ok(2));
        assert_eq!(drain_ready(&mut rx), [2, 3]);
    }

    #[test]
    fn test_repeated_transitions_are_no_ops() {
        let (queue, mut rx) = WorkQueue::new("test", DrainTracker::new("in-flight"));
        queue.pause();
        queue.submit(1).unwrap();
        queue.pause();
        assert_eq!(queue.buffered(), 1);

        assert_eq!(queue.resume(), Ok(1));
        assert_eq!(queue.resume(), Ok(0));
        assert_eq!(drain_ready(&mut rx), [1], "nothing forwarded twice");
    }

    #[test]
    fn test_forwarded_items_are_tracked_in_flight() {
        let in_flight = DrainTracker::new("in-flight");
        let (queue, mut rx) = WorkQueue::new("test", in_flight.clone());

        queue.submit(1).unwrap();
        queue.submit(2).unwrap();
        assert_eq!(in_flight.outstanding(), 0, "buffered items are not in flight");

        queue.resume().unwrap();
        assert_eq!(in_flight.outstanding(), 2);

        queue.pause();
        assert_eq!(in_flight.outstanding(), 2, "pause leaves forwarded work in flight");

        let first = rx.try_recv().unwrap();
        assert_eq!(*first.item(), 1);
        drop(first);
        assert_eq!(in_flight.outstanding(), 1);

        drop(rx);
        assert_eq!(in_flight.outstanding(), 0);
    }

    #[test]
    fn test_closed_worker_keeps_items_buffered() {
        let (queue, rx) = WorkQueue::<u32>::new("test", DrainTracker::new("in-flight"));
        queue.submit(1).unwrap();
        drop(rx);

        assert_eq!(queue.resume(), Err(QueueClosed("test")));
        assert!(queue.is_paused());
        assert_eq!(queue.buffered(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submit_during_resume() {
        let (queue, mut rx) = WorkQueue::new("test", DrainTracker::new("in-flight"));
        for i in 0..100 {
            queue.submit(i).unwrap();
        }

        let submitter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 100..200 {
                    queue.submit(i).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::task::yield_now().await;
        queue.resume().unwrap();
        submitter.await.unwrap();
        queue.resume().unwrap();

        let out = drain_ready(&mut rx);
        assert_eq!(out.len(), 200, "no loss, no duplication");
        assert_eq!(&out[..100], (0..100).collect::<Vec<_>>().as_slice());
        assert_eq!(&out[100..], (100..200).collect::<Vec<_>>().as_slice());
    }
}
