//! Bounded FIFO of capture frames between the capture pipeline and the
//! trigger engine.
//!
//! Backed by a pre-allocated crossbeam array channel. The producer never
//! blocks: when the queue is full the incoming frame is dropped and counted.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::SampleFrame;

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the frame was released and the drop counter bumped.
    Dropped,
}

/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct CaptureQueue {
    tx: Sender<SampleFrame>,
    rx: Receiver<SampleFrame>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_push(&self, frame: SampleFrame) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => PushOutcome::Queued,
            // Both ends live in `self`, so disconnection cannot occur; treat
            // it like a full queue.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
        }
    }

    /// Wait up to `timeout` for the oldest frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SampleFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<SampleFrame> {
        self.rx.try_recv().ok()
    }

    /// Discard every queued frame. Returns how many were released.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames dropped because the queue was full since the last
    /// [`reset_dropped`](Self::reset_dropped).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_dropped(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: i16) -> SampleFrame {
        SampleFrame::from_vec(vec![tag; 4], 16_000, 1).unwrap()
    }

    #[test]
    fn fifo_order_preserved() {
        let q = CaptureQueue::new(4);
        for i in 0..3 {
            assert_eq!(q.try_push(frame(i)), PushOutcome::Queued);
        }
        for i in 0..3 {
            assert_eq!(q.try_pop().unwrap().samples()[0], i);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn full_queue_drops_incoming_and_counts() {
        let q = CaptureQueue::new(2);
        q.try_push(frame(1));
        q.try_push(frame(2));
        assert_eq!(q.try_push(frame(3)), PushOutcome::Dropped);
        assert_eq!(q.try_push(frame(4)), PushOutcome::Dropped);
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.len(), 2);
        // Queued frames are untouched by the drops.
        assert_eq!(q.try_pop().unwrap().samples(), &[1, 1, 1, 1]);
        assert_eq!(q.try_pop().unwrap().samples(), &[2, 2, 2, 2]);
        q.reset_dropped();
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn clear_releases_everything() {
        let q = CaptureQueue::new(8);
        for i in 0..5 {
            q.try_push(frame(i));
        }
        assert_eq!(q.clear(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q = CaptureQueue::new(1);
        assert!(q.pop_timeout(Duration::from_millis(5)).is_none());
    }
}
