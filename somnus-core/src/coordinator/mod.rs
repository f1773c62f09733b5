//! `AudioCore`: top-level lifecycle and capture/playback coordination.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioCore::new()     → codecs initialised, bus built, status = Idle
//!     └─► start()      → bus enabled, capture + trigger threads, status = Listening
//!         └─► shutdown() → threads stopped (bounded wait), bus disabled,
//!                          codecs powered down, status = Stopped
//! ```
//!
//! ## Pause/resume
//!
//! Capture is paused for the whole of every playback session so the device
//! does not trigger on its own output. Pauses nest: the pause depth is a
//! counter, and capture resumes only when it returns to zero. Playback entry
//! points hold a [`CapturePauseGuard`], so capture resumes whether the session
//! succeeds, fails or is stopped.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buffering::CaptureQueue;
use crate::capture::{CapturePipeline, TriggerRecording};
#[cfg(any(test, feature = "sim"))]
use crate::codec::sim::SimulatedCodecBus;
use crate::codec::{CodecHandle, CodecRole, RegisterBusHandle};
use crate::config::AudioCoreConfig;
use crate::error::{PlaybackError, Result, SomnusError};
use crate::events::{
    CaptureStatsSnapshot, CoreStatus, CoreStatusEvent, PlaybackProgress, TriggerEvent,
};
use crate::memory::{MemoryPlacement, MemoryUsage};
use crate::playback::{PlaybackEngine, PlaybackStopHandle};
#[cfg(any(test, feature = "sim"))]
use crate::transport::sim::SimulatedChannel;
use crate::transport::{AudioBus, BusChannel};
use crate::trigger::{DetectorHandle, EnergyTrigger, TriggerWorker};

/// Broadcast channel capacity for every event stream.
const BROADCAST_CAP: usize = 256;

/// The device-specific pieces the core drives.
pub struct AudioHardware {
    pub register_bus: RegisterBusHandle,
    pub capture_channel: Box<dyn BusChannel>,
    pub playback_channel: Box<dyn BusChannel>,
}

impl std::fmt::Debug for AudioHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHardware")
            .field("register_bus", &self.register_bus)
            .finish_non_exhaustive()
    }
}

/// Handles onto simulated hardware for inspection and feeding.
#[cfg(any(test, feature = "sim"))]
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    pub registers: SimulatedCodecBus,
    pub capture: SimulatedChannel,
    pub playback: SimulatedChannel,
}

#[cfg(any(test, feature = "sim"))]
impl AudioHardware {
    /// Simulated codecs and bus channels. Capture is fed explicitly through
    /// [`SimulatedHardware::capture`]; playback output is recorded.
    pub fn simulated() -> (Self, SimulatedHardware) {
        Self::simulated_with(SimulatedChannel::capture(), SimulatedChannel::playback())
    }

    pub fn simulated_with(
        capture: SimulatedChannel,
        playback: SimulatedChannel,
    ) -> (Self, SimulatedHardware) {
        let registers = SimulatedCodecBus::new();
        let hardware = Self {
            register_bus: RegisterBusHandle::new(registers.clone()),
            capture_channel: Box::new(capture.clone()),
            playback_channel: Box::new(playback.clone()),
        };
        (
            hardware,
            SimulatedHardware {
                registers,
                capture,
                playback,
            },
        )
    }
}

/// The real-time audio core.
///
/// `AudioCore` is `Send + Sync`; wrap it in an `Arc` to share between the
/// orchestration layer and event-forwarding tasks.
pub struct AudioCore {
    config: AudioCoreConfig,
    memory: MemoryPlacement,
    bus: Arc<AudioBus>,
    capture_codec: Mutex<CodecHandle>,
    playback_codec: Arc<Mutex<CodecHandle>>,
    queue: CaptureQueue,
    capture: CapturePipeline,
    trigger: Mutex<TriggerWorker>,
    detector: DetectorHandle,
    playback: PlaybackEngine,
    pause_depth: Mutex<u32>,
    status: Mutex<CoreStatus>,
    status_tx: broadcast::Sender<CoreStatusEvent>,
    trigger_tx: broadcast::Sender<TriggerEvent>,
}

impl std::fmt::Debug for AudioCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCore")
            .field("status", &self.status())
            .field("pause_depth", &self.pause_depth())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl AudioCore {
    /// Build the core with the default energy trigger.
    pub fn new(config: AudioCoreConfig, hardware: AudioHardware) -> Result<Self> {
        let config = config.normalized();
        let detector = DetectorHandle::new(EnergyTrigger::new(&config.trigger));
        Self::with_detector(config, hardware, detector)
    }

    /// Build the core around any trigger detector.
    ///
    /// Codec probe and path-verification failures are logged and tolerated;
    /// register write failures abort construction.
    pub fn with_detector(
        config: AudioCoreConfig,
        hardware: AudioHardware,
        detector: DetectorHandle,
    ) -> Result<Self> {
        let config = config.normalized();
        let memory = MemoryPlacement::new(&config.memory);
        let bus = Arc::new(AudioBus::new(
            hardware.capture_channel,
            hardware.playback_channel,
            &config.capture,
            &config.playback,
            memory.clone(),
        )?);

        let mut capture_codec = CodecHandle::new(hardware.register_bus.clone(), config.codec.clone());
        init_codec(&mut capture_codec, CodecRole::Capture, config.capture.sample_rate)?;
        let mut playback_codec = CodecHandle::new(hardware.register_bus, config.codec.clone());
        init_codec(
            &mut playback_codec,
            CodecRole::Playback,
            config.playback.default_sample_rate,
        )?;
        let playback_codec = Arc::new(Mutex::new(playback_codec));

        let queue = CaptureQueue::new(config.capture.queue_capacity);
        let capture = CapturePipeline::new(
            Arc::clone(&bus),
            queue.clone(),
            config.capture.clone(),
            memory.clone(),
        );

        let (trigger_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (progress_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        let trigger = TriggerWorker::new(queue.clone(), detector.clone(), trigger_tx.clone());
        let playback = PlaybackEngine::new(
            Arc::clone(&bus),
            Arc::clone(&playback_codec),
            config.playback.clone(),
            memory.clone(),
            progress_tx,
        );

        info!(
            capture_rate = config.capture.sample_rate,
            playback_rate = config.playback.default_sample_rate,
            "audio core ready"
        );

        Ok(Self {
            config,
            memory,
            bus,
            capture_codec: Mutex::new(capture_codec),
            playback_codec,
            queue,
            capture,
            trigger: Mutex::new(trigger),
            detector,
            playback,
            pause_depth: Mutex::new(0),
            status: Mutex::new(CoreStatus::Idle),
            status_tx,
            trigger_tx,
        })
    }

    /// Enable the bus and start the capture and trigger threads.
    ///
    /// # Errors
    /// - [`SomnusError::AlreadyRunning`] if already started.
    /// - [`SomnusError::NotRunning`] after `shutdown()`.
    pub fn start(&self) -> Result<()> {
        match self.status() {
            CoreStatus::Listening | CoreStatus::Paused => return Err(SomnusError::AlreadyRunning),
            CoreStatus::Stopped => return Err(SomnusError::NotRunning),
            CoreStatus::Idle => {}
        }
        self.bus.enable()?;
        self.trigger.lock().start()?;
        if let Err(e) = self.capture.start() {
            let _ = self.trigger.lock().stop(self.config.capture.stop_wait());
            return Err(e);
        }
        let status = if self.capture.is_paused() {
            CoreStatus::Paused
        } else {
            CoreStatus::Listening
        };
        self.set_status(status, None);
        info!("audio core started");
        Ok(())
    }

    /// Stop both threads (bounded waits), disable the bus and power the
    /// codecs down. Every step runs even if an earlier one fails; the first
    /// failure is returned.
    pub fn shutdown(&self) -> Result<()> {
        if self.status() == CoreStatus::Stopped {
            return Ok(());
        }
        let was_started = self.status() != CoreStatus::Idle;
        info!("audio core shutdown requested");
        self.playback.stop_handle().stop();

        let mut first_err: Option<SomnusError> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                warn!("shutdown step failed: {e}");
                first_err.get_or_insert(e);
            }
        };

        if was_started {
            note(self.trigger.lock().stop(self.config.capture.stop_wait()));
            note(self.capture.stop());
        }
        note(self.bus.disable().map_err(SomnusError::from));
        note(self.capture_codec.lock().power_down().map_err(SomnusError::from));
        note(self.playback_codec.lock().power_down().map_err(SomnusError::from));

        self.set_status(CoreStatus::Stopped, None);
        info!(stats = ?self.capture.stats(), "audio core stopped");
        first_err.map_or(Ok(()), Err)
    }

    // ── Capture pause / resume ───────────────────────────────────────────────

    /// Increment the pause depth; capture stops feeding the trigger engine
    /// on the first pause.
    pub fn pause_capture(&self) {
        let mut depth = self.pause_depth.lock();
        *depth += 1;
        if *depth == 1 {
            self.capture.set_paused(true);
            if self.status() == CoreStatus::Listening {
                self.set_status(CoreStatus::Paused, None);
            }
        }
        debug!(depth = *depth, "capture paused");
    }

    /// Decrement the pause depth; capture resumes when it reaches zero.
    ///
    /// Frames queued before the pause are discarded and the detector is reset,
    /// so audio from before playback cannot complete a trigger pattern.
    pub fn resume_capture(&self) {
        let mut depth = self.pause_depth.lock();
        if *depth == 0 {
            warn!("resume_capture called without a matching pause");
            return;
        }
        *depth -= 1;
        if *depth == 0 {
            let stale = self.queue.clear();
            self.detector.reset();
            self.capture.set_paused(false);
            if self.status() == CoreStatus::Paused {
                self.set_status(CoreStatus::Listening, None);
            }
            debug!(stale, "capture resumed");
        } else {
            debug!(depth = *depth, "capture pause released, still paused");
        }
    }

    /// Pause capture until the returned guard is dropped.
    pub fn pause_guard(&self) -> CapturePauseGuard<'_> {
        self.pause_capture();
        CapturePauseGuard { core: self }
    }

    pub fn pause_depth(&self) -> u32 {
        *self.pause_depth.lock()
    }

    pub fn is_capture_paused(&self) -> bool {
        self.capture.is_paused()
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// Play a RIFF/WAVE container with capture paused for the duration.
    pub fn play_container(&self, bytes: &[u8]) -> std::result::Result<(), PlaybackError> {
        let _pause = self.pause_guard();
        self.playback.play_container(bytes)
    }

    /// Play an MP3 stream with capture paused for the duration.
    pub fn play_compressed_stream<R: Read>(
        &self,
        reader: R,
        total_bytes: Option<u64>,
    ) -> std::result::Result<(), PlaybackError> {
        let _pause = self.pause_guard();
        self.playback.play_compressed_stream(reader, total_bytes)
    }

    /// Play raw PCM with capture paused for the duration.
    pub fn submit_pcm(
        &self,
        samples: &[i16],
        sample_rate: u32,
        channels: u16,
    ) -> std::result::Result<(), PlaybackError> {
        let _pause = self.pause_guard();
        self.playback.submit_pcm(samples, sample_rate, channels)
    }

    pub fn playback_stop_handle(&self) -> PlaybackStopHandle {
        self.playback.stop_handle()
    }

    // ── Recording ────────────────────────────────────────────────────────────

    /// Capture `duration` of audio following a trigger.
    pub fn record_trigger_phrase(&self, duration: Duration) -> Result<TriggerRecording> {
        self.capture.record(duration)
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.trigger_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<PlaybackProgress> {
        self.playback.subscribe_progress()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CoreStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Invoke `callback` on the trigger thread for every detected phrase.
    pub fn on_trigger<F>(&self, callback: F)
    where
        F: Fn(&TriggerEvent) + Send + Sync + 'static,
    {
        self.trigger.lock().set_callback(Arc::new(callback));
    }

    /// Invoke `callback` on the playing thread for every progress report.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(PlaybackProgress) + Send + Sync + 'static,
    {
        self.playback.on_progress(Arc::new(callback));
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    pub fn status(&self) -> CoreStatus {
        *self.status.lock()
    }

    pub fn capture_stats(&self) -> CaptureStatsSnapshot {
        self.capture.stats()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory.usage()
    }

    pub fn config(&self) -> &AudioCoreConfig {
        &self.config
    }

    /// `(capture, playback)` output-path verification results from init.
    pub fn codec_paths_verified(&self) -> (bool, bool) {
        (
            self.capture_codec.lock().path_verified(),
            self.playback_codec.lock().path_verified(),
        )
    }

    fn set_status(&self, status: CoreStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(CoreStatusEvent { status, detail });
    }
}

/// Resumes capture when dropped.
#[must_use = "capture resumes as soon as the guard is dropped"]
pub struct CapturePauseGuard<'a> {
    core: &'a AudioCore,
}

impl Drop for CapturePauseGuard<'_> {
    fn drop(&mut self) {
        self.core.resume_capture();
    }
}

fn init_codec(codec: &mut CodecHandle, role: CodecRole, sample_rate: u32) -> Result<()> {
    match codec.init(role, sample_rate) {
        Ok(()) => Ok(()),
        Err(e) if e.is_degraded() => {
            warn!(?role, "continuing with degraded codec: {e}");
            Ok(())
        }
        Err(e) => Err(SomnusError::Codec(e)),
    }
}
