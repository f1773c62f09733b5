//! Capture pipeline: bus → `CaptureQueue`.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Check running flag (cooperative stop)
//! 2. AudioBus::read(read_timeout)  ── Timeout → count, continue
//! 3. Update stats (frames, peak)
//! 4. Paused? → discard frame, continue
//! 5. Feed recording tap, if one is installed
//! 6. CaptureQueue::try_push  ── full → count drop, continue (never blocks)
//! ```
//!
//! On exit the loop releases the bus's partial frame and clears the queue
//! *before* signalling completion, so `stop()` returning means no capture
//! buffer is still owned by the pipeline.

pub mod recording;
pub mod stats;

pub use recording::{TriggerRecording, NEAR_SILENT_RMS};
pub use stats::CaptureStats;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::{CaptureQueue, PushOutcome};
use crate::config::CaptureConfig;
use crate::error::{Result, SomnusError};
use crate::events::CaptureStatsSnapshot;
use crate::memory::{MemoryPlacement, MemoryTier};
use crate::transport::AudioBus;
use crate::worker::Worker;
use recording::{RecordingTap, RECORD_GRACE};

/// Back-off after a non-timeout bus error so a failing channel is not spun on.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub struct CapturePipeline {
    bus: Arc<AudioBus>,
    queue: CaptureQueue,
    config: CaptureConfig,
    memory: MemoryPlacement,
    paused: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    tap: Arc<Mutex<Option<RecordingTap>>>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl CapturePipeline {
    pub fn new(
        bus: Arc<AudioBus>,
        queue: CaptureQueue,
        config: CaptureConfig,
        memory: MemoryPlacement,
    ) -> Self {
        Self {
            bus,
            queue,
            config,
            memory,
            paused: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            tap: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        if let Some(previous) = slot.as_mut() {
            // A loop whose stop timed out still owns the bus until it returns.
            if previous.is_running() || !previous.has_exited() {
                return Err(SomnusError::AlreadyRunning);
            }
            previous.stop(Duration::ZERO)?;
        }
        *slot = None;
        self.stats.reset();
        self.queue.reset_dropped();

        let ctx = CaptureContext {
            bus: Arc::clone(&self.bus),
            queue: self.queue.clone(),
            paused: Arc::clone(&self.paused),
            stats: Arc::clone(&self.stats),
            tap: Arc::clone(&self.tap),
            read_timeout: self.config.read_timeout(),
            log_interval: self.config.stats_log_interval_frames.max(1),
        };
        *slot = Some(Worker::spawn("capture", move |running| run(&running, ctx))?);
        Ok(())
    }

    /// Ask the loop to exit and wait (bounded) until it has cleaned up.
    ///
    /// On [`SomnusError::StopTimeout`] the loop is still draining its last
    /// read; `stop` may be retried and `start` refuses until it has exited.
    pub fn stop(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        let worker = slot.as_mut().ok_or(SomnusError::NotRunning)?;
        worker.stop(self.config.stop_wait())?;
        *slot = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Worker::is_running)
    }

    /// While paused, frames are still drained from the bus but discarded.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.queue_drops = self.queue.dropped();
        snap
    }

    /// Record `duration` of audio from the live stream.
    ///
    /// The first `record_lead_in_ms` are skipped so the trigger phrase that
    /// prompted the recording is not included. Returns whatever was captured
    /// once the buffer is full or `duration + 500 ms` has passed.
    ///
    /// # Errors
    /// - [`SomnusError::NotRunning`] if capture has not been started.
    /// - [`SomnusError::OutOfMemory`] if the recording buffer cannot be placed.
    pub fn record(&self, duration: Duration) -> Result<TriggerRecording> {
        if !self.is_running() {
            return Err(SomnusError::NotRunning);
        }
        let rate = self.bus.capture_sample_rate();
        let channels = self.config.channels;
        let per_ms = rate as u64 * channels as u64;
        let len = (per_ms * duration.as_millis() as u64 / 1000) as usize;
        let lead_in = (per_ms * self.config.record_lead_in_ms / 1000) as usize;

        let buf = self.memory.allocate::<i16>(len, MemoryTier::Auxiliary)?;
        let (done_tx, done_rx) = bounded(1);
        {
            let mut tap = self.tap.lock();
            if tap.is_some() {
                return Err(SomnusError::Other(anyhow::anyhow!(
                    "a recording is already in progress"
                )));
            }
            *tap = Some(RecordingTap::new(buf, lead_in, done_tx));
        }
        info!(?duration, samples = len, "recording trigger phrase");

        let lead = Duration::from_millis(self.config.record_lead_in_ms);
        let completed = done_rx.recv_timeout(lead + duration + RECORD_GRACE).is_ok();
        let tap = self
            .tap
            .lock()
            .take()
            .ok_or_else(|| SomnusError::Other(anyhow::anyhow!("recording tap vanished")))?;
        let recording = tap.into_recording(rate, channels);
        if !completed {
            warn!(
                wanted = len,
                got = recording.samples().len(),
                "recording deadline passed before buffer filled"
            );
        }
        info!(
            rms = recording.rms(),
            peak = recording.peak(),
            near_silent = recording.is_near_silent(),
            "recording complete"
        );
        Ok(recording)
    }
}

struct CaptureContext {
    bus: Arc<AudioBus>,
    queue: CaptureQueue,
    paused: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    tap: Arc<Mutex<Option<RecordingTap>>>,
    read_timeout: Duration,
    log_interval: u64,
}

fn run(running: &AtomicBool, ctx: CaptureContext) {
    info!(
        sample_rate = ctx.bus.capture_sample_rate(),
        "capture pipeline started"
    );
    let mut frames = 0u64;

    while running.load(Ordering::Acquire) {
        let frame = match ctx.bus.read(ctx.read_timeout) {
            Ok(frame) => frame,
            Err(e) if e.is_timeout() => {
                ctx.stats.read_timeouts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => {
                ctx.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!("capture read failed: {e}");
                std::thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };
        frames += 1;
        ctx.stats.record_frame(frame.peak());

        if frames % ctx.log_interval == 0 {
            let snap = ctx.stats.snapshot();
            info!(
                frames = snap.frames_captured,
                peak = snap.last_peak,
                max_peak = snap.max_peak,
                dropped = ctx.queue.dropped(),
                discarded = snap.frames_discarded,
                "capture stats"
            );
        }

        if ctx.paused.load(Ordering::Acquire) {
            ctx.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if let Some(tap) = ctx.tap.lock().as_mut() {
            tap.push(frame.samples());
        }

        if ctx.queue.try_push(frame) == PushOutcome::Dropped {
            ctx.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
            debug!(dropped = ctx.queue.dropped(), "capture queue full");
        }
    }

    let partial = ctx.bus.discard_partial_capture();
    let cleared = ctx.queue.clear();
    info!(frames, partial, cleared, "capture pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, PlaybackConfig};
    use crate::transport::sim::SimulatedChannel;

    fn pipeline(cap: &SimulatedChannel, queue_cap: usize) -> (CapturePipeline, CaptureQueue) {
        let config = CaptureConfig {
            read_timeout_ms: 10,
            ..CaptureConfig::default()
        };
        pipeline_with(cap, queue_cap, config)
    }

    fn pipeline_with(
        cap: &SimulatedChannel,
        queue_cap: usize,
        config: CaptureConfig,
    ) -> (CapturePipeline, CaptureQueue) {
        let memory = MemoryPlacement::new(&MemoryConfig::default());
        let bus = AudioBus::new(
            Box::new(cap.clone()),
            Box::new(SimulatedChannel::playback()),
            &config,
            &PlaybackConfig::default(),
            memory.clone(),
        )
        .unwrap();
        let queue = CaptureQueue::new(queue_cap);
        (
            CapturePipeline::new(Arc::new(bus), queue.clone(), config, memory),
            queue,
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn frames_flow_into_queue_in_order() {
        let cap = SimulatedChannel::capture();
        let (pipe, queue) = pipeline(&cap, 16);
        pipe.start().unwrap();
        cap.feed(&[1; 512]);
        cap.feed(&[2; 512]);
        wait_for(|| queue.len() == 2);
        assert_eq!(queue.try_pop().unwrap().samples()[0], 1);
        assert_eq!(queue.try_pop().unwrap().samples()[0], 2);
        pipe.stop().unwrap();
    }

    #[test]
    fn full_queue_counts_drops_without_blocking() {
        let cap = SimulatedChannel::capture();
        let (pipe, queue) = pipeline(&cap, 2);
        pipe.start().unwrap();
        cap.feed(&vec![5; 512 * 5]);
        wait_for(|| pipe.stats().frames_captured == 5);
        assert_eq!(queue.len(), 2);
        assert_eq!(pipe.stats().queue_drops, 3);
        pipe.stop().unwrap();
    }

    #[test]
    fn paused_frames_are_discarded() {
        let cap = SimulatedChannel::capture();
        let (pipe, queue) = pipeline(&cap, 16);
        pipe.set_paused(true);
        pipe.start().unwrap();
        cap.feed(&vec![5; 512 * 2]);
        wait_for(|| pipe.stats().frames_discarded == 2);
        assert!(queue.is_empty());
        pipe.stop().unwrap();
    }

    #[test]
    fn stop_clears_queue_and_partial_frame() {
        let cap = SimulatedChannel::capture();
        let (pipe, queue) = pipeline(&cap, 16);
        pipe.start().unwrap();
        cap.feed(&vec![3; 512 + 100]);
        wait_for(|| queue.len() == 1);
        pipe.stop().unwrap();
        assert!(queue.is_empty());
        assert!(!pipe.is_running());
        assert!(matches!(pipe.stop(), Err(SomnusError::NotRunning)));
    }

    #[test]
    fn restart_refused_until_timed_out_loop_exits() {
        let cap = SimulatedChannel::capture();
        let config = CaptureConfig {
            read_timeout_ms: 400,
            stop_wait_ms: 20,
            ..CaptureConfig::default()
        };
        let (pipe, queue) = pipeline_with(&cap, 16, config);
        pipe.start().unwrap();
        // Let the loop block inside its first read.
        std::thread::sleep(Duration::from_millis(30));

        assert!(matches!(pipe.stop(), Err(SomnusError::StopTimeout("capture"))));
        assert!(!pipe.is_running());
        assert!(matches!(pipe.start(), Err(SomnusError::AlreadyRunning)));

        wait_for(|| pipe.stop().is_ok());
        pipe.start().unwrap();
        cap.feed(&[4; 512]);
        wait_for(|| queue.len() == 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 1);
        assert_eq!(pipe.stats().frames_captured, 1);
        wait_for(|| pipe.stop().is_ok());
    }

    #[test]
    fn restart_resets_drop_count() {
        let cap = SimulatedChannel::capture();
        let (pipe, queue) = pipeline(&cap, 2);
        pipe.start().unwrap();
        cap.feed(&vec![5; 512 * 4]);
        wait_for(|| pipe.stats().frames_captured == 4);
        assert_eq!(pipe.stats().queue_drops, 2);
        pipe.stop().unwrap();

        pipe.start().unwrap();
        cap.feed(&vec![5; 512]);
        wait_for(|| pipe.stats().frames_captured == 1);
        let stats = pipe.stats();
        assert_eq!(stats.queue_drops, 0);
        assert_eq!(queue.len(), 1);
        pipe.stop().unwrap();
    }

    #[test]
    fn record_requires_running_pipeline() {
        let cap = SimulatedChannel::capture();
        let (pipe, _queue) = pipeline(&cap, 16);
        assert!(matches!(
            pipe.record(Duration::from_millis(100)),
            Err(SomnusError::NotRunning)
        ));
    }

    #[test]
    fn record_skips_lead_in() {
        let cap = SimulatedChannel::capture();
        let (pipe, _queue) = pipeline(&cap, 64);
        pipe.start().unwrap();

        // 200 ms lead-in at 16 kHz = 3200 samples, then 100 ms = 1600 samples.
        let feeder = cap.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            feeder.feed(&vec![1; 3584]);
            feeder.feed(&vec![700; 2048]);
        });
        let rec = pipe.record(Duration::from_millis(100)).unwrap();
        t.join().unwrap();

        assert_eq!(rec.samples().len(), 1600);
        assert_eq!(rec.samples()[0], 1);
        assert!(rec.samples()[400..].iter().all(|&s| s == 700));
        assert_eq!(rec.tier(), MemoryTier::Auxiliary);
        pipe.stop().unwrap();
    }
}
