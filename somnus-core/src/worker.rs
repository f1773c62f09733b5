//! Cooperatively stopped background threads.
//!
//! ```text
//! spawn(name, body) ──► thread runs body(running) ──► body returns
//!                                                      │
//!                                   ExitSignal::drop ──┘  (also on panic)
//! stop(wait): running=false ─► recv_timeout(exit) ─► join
//! ```
//!
//! The body polls `running` at every iteration boundary and performs its own
//! cleanup before returning. `stop` never kills the thread; if the exit signal
//! does not arrive within the bound `StopTimeout` is returned and the handle
//! stays with its owner, which must not spawn a replacement until
//! [`Worker::has_exited`] is true.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{Result, SomnusError};

/// Sent when the body returns, including by unwinding.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub(crate) struct Worker {
    name: &'static str,
    running: Arc<AtomicBool>,
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = bounded(1);
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("somnus-{name}"))
            .spawn(move || {
                let _signal = ExitSignal(exit_tx);
                body(flag);
            })?;
        debug!(worker = name, "worker spawned");
        Ok(Self {
            name,
            running,
            exited,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once the body has returned. A timed-out worker can be retried
    /// with another `stop` once this holds.
    pub(crate) fn has_exited(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Clear the running flag and wait up to `wait` for the body to return.
    /// Can be called again after a timeout.
    pub(crate) fn stop(&mut self, wait: Duration) -> Result<()> {
        self.running.store(false, Ordering::Release);
        match self.exited.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!(worker = self.name, "worker panicked");
                    }
                }
                debug!(worker = self.name, "worker stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = self.name, ?wait, "worker did not exit in time");
                Err(SomnusError::StopTimeout(self.name))
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_waits_for_cleanup() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cleaned);
        let mut worker = Worker::spawn("test-loop", move |running| {
            while running.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(worker.is_running());
        worker.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unresponsive_body_times_out() {
        let release = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&release);
        let mut worker = Worker::spawn("stuck", move |_running| {
            while !r.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        let err = worker.stop(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SomnusError::StopTimeout("stuck")));
        assert!(!worker.is_running());
        assert!(!worker.has_exited());

        release.store(true, Ordering::Release);
        worker.stop(Duration::from_secs(1)).unwrap();
        assert!(worker.has_exited());
    }
}
