//! Consumer side of the capture queue.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::DetectorHandle;
use crate::buffering::CaptureQueue;
use crate::error::{Result, SomnusError};
use crate::events::TriggerEvent;
use crate::worker::Worker;

/// How long one queue pop waits before re-checking the running flag.
const POP_POLL: Duration = Duration::from_millis(20);

pub type TriggerCallback = Arc<dyn Fn(&TriggerEvent) + Send + Sync>;

/// Owns the trigger thread. Frames are processed strictly in queue order.
pub struct TriggerWorker {
    worker: Option<Worker>,
    queue: CaptureQueue,
    detector: DetectorHandle,
    events_tx: broadcast::Sender<TriggerEvent>,
    callback: Arc<Mutex<Option<TriggerCallback>>>,
    seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for TriggerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerWorker")
            .field("worker", &self.worker)
            .field("detector", &self.detector)
            .field("fired", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TriggerWorker {
    pub fn new(
        queue: CaptureQueue,
        detector: DetectorHandle,
        events_tx: broadcast::Sender<TriggerEvent>,
    ) -> Self {
        Self {
            worker: None,
            queue,
            detector,
            events_tx,
            callback: Arc::new(Mutex::new(None)),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the trigger callback. Invoked on the trigger thread.
    pub fn set_callback(&self, callback: TriggerCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn detector(&self) -> &DetectorHandle {
        &self.detector
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(previous) = self.worker.as_mut() {
            if !previous.has_exited() {
                return Err(SomnusError::AlreadyRunning);
            }
            previous.stop(Duration::ZERO)?;
        }
        self.worker = None;
        let queue = self.queue.clone();
        let detector = self.detector.clone();
        let events_tx = self.events_tx.clone();
        let callback = Arc::clone(&self.callback);
        let seq = Arc::clone(&self.seq);
        self.worker = Some(Worker::spawn("trigger", move |running| {
            run(&running, &queue, &detector, &events_tx, &callback, &seq)
        })?);
        Ok(())
    }

    /// On timeout the worker is kept, so a later `stop` can still join it.
    pub fn stop(&mut self, wait: Duration) -> Result<()> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        worker.stop(wait)?;
        self.worker = None;
        Ok(())
    }
}

fn run(
    running: &AtomicBool,
    queue: &CaptureQueue,
    detector: &DetectorHandle,
    events_tx: &broadcast::Sender<TriggerEvent>,
    callback: &Mutex<Option<TriggerCallback>>,
    seq: &AtomicU64,
) {
    info!("trigger worker started");
    let mut frames = 0u64;
    let mut fired = 0u64;

    while running.load(Ordering::Acquire) {
        let Some(frame) = queue.pop_timeout(POP_POLL) else {
            continue;
        };
        frames += 1;

        let Some(mut event) = detector.0.lock().process(&frame) else {
            continue;
        };
        event.seq = seq.fetch_add(1, Ordering::Relaxed) + 1;
        fired += 1;
        info!(
            seq = event.seq,
            detector = event.detector.as_str(),
            score = event.score,
            "trigger detected"
        );

        // Cloned out so the callback may replace itself.
        let cb = callback.lock().clone();
        if let Some(cb) = cb {
            cb(&event);
        }
        if events_tx.send(event).is_err() {
            debug!("trigger event not broadcast: no subscribers");
        }
    }

    info!(frames, fired, "trigger worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::SampleFrame;
    use crate::config::TriggerConfig;
    use crate::trigger::EnergyTrigger;
    use std::sync::atomic::AtomicUsize;

    fn frame(level: i16) -> SampleFrame {
        SampleFrame::from_vec(vec![level; 512], 16_000, 1).unwrap()
    }

    #[test]
    fn worker_broadcasts_and_calls_back() {
        let queue = CaptureQueue::new(16);
        let (tx, mut rx) = broadcast::channel(8);
        let detector = DetectorHandle::new(EnergyTrigger::new(&TriggerConfig::default()));
        let mut worker = TriggerWorker::new(queue.clone(), detector, tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        worker.set_callback(Arc::new(move |_: &TriggerEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        worker.start().unwrap();

        for _ in 0..5 {
            queue.try_push(frame(800));
        }
        for _ in 0..3 {
            queue.try_push(frame(0));
        }

        let event = rx.blocking_recv().unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.speech_frames, 5);
        worker.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_can_replace_itself() {
        let queue = CaptureQueue::new(16);
        let (tx, mut rx) = broadcast::channel(8);
        let detector = DetectorHandle::new(EnergyTrigger::new(&TriggerConfig::default()));
        let mut worker = TriggerWorker::new(queue.clone(), detector, tx);
        let slot = Arc::clone(&worker.callback);
        let replaced = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&replaced);
        worker.set_callback(Arc::new(move |_: &TriggerEvent| {
            let r = Arc::clone(&r);
            *slot.lock() = Some(Arc::new(move |_: &TriggerEvent| {
                r.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        worker.start().unwrap();

        for _ in 0..2 {
            for _ in 0..5 {
                queue.try_push(frame(800));
            }
            for _ in 0..3 {
                queue.try_push(frame(0));
            }
        }
        assert_eq!(rx.blocking_recv().unwrap().seq, 1);
        assert_eq!(rx.blocking_recv().unwrap().seq, 2);
        worker.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_refused_while_previous_thread_lingers() {
        let queue = CaptureQueue::new(16);
        let (tx, _rx) = broadcast::channel(8);
        let detector = DetectorHandle::new(EnergyTrigger::new(&TriggerConfig::default()));
        let mut worker = TriggerWorker::new(queue.clone(), detector, tx);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        worker.set_callback(Arc::new(move |_: &TriggerEvent| {
            let _ = entered_tx.try_send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
        }));
        worker.start().unwrap();
        for _ in 0..5 {
            queue.try_push(frame(800));
        }
        for _ in 0..3 {
            queue.try_push(frame(0));
        }
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(worker.stop(Duration::from_millis(20)).is_err());
        assert!(matches!(worker.start(), Err(SomnusError::AlreadyRunning)));

        release_tx.send(()).unwrap();
        worker.stop(Duration::from_secs(1)).unwrap();
        worker.start().unwrap();
        assert!(worker.is_running());
        worker.stop(Duration::from_secs(1)).unwrap();
    }
}
