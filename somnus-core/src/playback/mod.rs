//! Playback engine.
//!
//! ## Session flow
//!
//! ```text
//! play_container(bytes)                play_compressed_stream(reader)
//!   │ index container (no hardware)      │ prefill read-ahead
//!   ▼                                    │ decode first frame
//! PlaybackSession::open ◄────────────────┘
//!   │ negotiate bus + codec to the stream rate
//!   ▼
//! per chunk: stop? → decode → EQ (per channel) → scale → AudioBus::write
//!   │            └─► progress (monotonic, throttled)
//!   ▼
//! close: (1.0, playing) then (1.0, stopped)
//! ```
//!
//! Sessions are serialized: one stream plays at a time. Each entry point
//! blocks its caller until the stream has been written to the bus.

pub mod compressed;
pub mod container;
pub mod eq;
pub mod session;

pub use compressed::{CompressedDecoder, ReadAhead};
pub use container::{ContainerFormat, ContainerLayout, SampleEncoding};
pub use eq::{Equalizer, EqualizerPreset};
pub use session::PlaybackSession;

use std::io::Read;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, info_span, warn};

use crate::audio::convert::i16_to_f32;
use crate::codec::CodecHandle;
use crate::config::PlaybackConfig;
use crate::error::PlaybackError;
use crate::events::PlaybackProgress;
use crate::memory::MemoryPlacement;
use crate::transport::AudioBus;
use session::Completion;

/// Stream length assumed for progress when a compressed source's size is
/// unknown.
const ASSUMED_STREAM_SECS: f32 = 5.0;

pub type ProgressCallback = Arc<dyn Fn(PlaybackProgress) + Send + Sync>;

/// Cooperative stop for the current playback session.
#[derive(Debug, Clone)]
pub struct PlaybackStopHandle(Arc<AtomicBool>);

impl PlaybackStopHandle {
    /// Takes effect at the next chunk (or compressed frame) boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct PlaybackEngine {
    bus: Arc<AudioBus>,
    codec: Arc<Mutex<CodecHandle>>,
    config: PlaybackConfig,
    memory: MemoryPlacement,
    stop: Arc<AtomicBool>,
    progress_tx: broadcast::Sender<PlaybackProgress>,
    callback: Mutex<Option<ProgressCallback>>,
    active: Mutex<()>,
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("bus_rate", &self.bus.playback_sample_rate())
            .field("equalizer", &self.config.equalizer)
            .finish_non_exhaustive()
    }
}

impl PlaybackEngine {
    pub fn new(
        bus: Arc<AudioBus>,
        codec: Arc<Mutex<CodecHandle>>,
        config: PlaybackConfig,
        memory: MemoryPlacement,
        progress_tx: broadcast::Sender<PlaybackProgress>,
    ) -> Self {
        Self {
            bus,
            codec,
            config,
            memory,
            stop: Arc::new(AtomicBool::new(false)),
            progress_tx,
            callback: Mutex::new(None),
            active: Mutex::new(()),
        }
    }

    /// Replace the progress callback. Invoked on the playing thread.
    pub fn on_progress(&self, callback: ProgressCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn stop_handle(&self) -> PlaybackStopHandle {
        PlaybackStopHandle(Arc::clone(&self.stop))
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<PlaybackProgress> {
        self.progress_tx.subscribe()
    }

    /// Play a RIFF/WAVE container held in memory.
    ///
    /// # Errors
    /// - [`PlaybackError::Unsupported`] / [`PlaybackError::Corrupt`] from
    ///   indexing, before any hardware is reconfigured.
    /// - Transport or codec failures while playing abort this session only.
    pub fn play_container(&self, bytes: &[u8]) -> Result<(), PlaybackError> {
        let layout = container::parse(bytes)?;
        let format = layout.format;
        let _active = self.begin();
        let span = info_span!(
            "playback",
            kind = "container",
            rate = format.sample_rate,
            channels = format.channels
        );
        let _enter = span.enter();
        if layout.resyncs > 0 {
            warn!(resyncs = layout.resyncs, "container had damaged chunks");
        }
        info!(
            encoding = ?format.encoding,
            frames = layout.total_frames(),
            "playing container"
        );

        let gain = if format.encoding.is_float() {
            self.config.headroom
        } else {
            1.0
        };
        let mut session = PlaybackSession::open(
            self,
            format.sample_rate,
            format.channels,
            gain,
            self.config.equalizer,
        )?;
        let outcome = self.run_container(&layout, &mut session);
        session.close(outcome)
    }

    fn run_container(
        &self,
        layout: &ContainerLayout<'_>,
        session: &mut PlaybackSession<'_>,
    ) -> Result<Completion, PlaybackError> {
        let format = layout.format;
        let chunk_bytes = self.config.chunk_frames * format.block_align();
        let total = layout.total_frames().max(1) as f32;
        let mut scratch = Vec::with_capacity(self.config.chunk_frames * format.channels as usize);
        let mut frames_done = 0usize;

        for chunk in layout.data.chunks(chunk_bytes) {
            if self.stop_requested() {
                return Ok(Completion::Stopped);
            }
            scratch.clear();
            container::decode_into(format.encoding, chunk, &mut scratch);
            session.write_f32(&mut scratch)?;
            frames_done += chunk.len() / format.block_align();
            session.report(frames_done as f32 / total);
        }
        Ok(Completion::Finished)
    }

    /// Play a compressed (MP3) stream.
    ///
    /// `total_bytes` is only used for progress; pass `None` when unknown.
    ///
    /// # Errors
    /// - [`PlaybackError::Corrupt`] when no frame could be decoded.
    /// - [`PlaybackError::SourceStalled`] when the source stops delivering.
    pub fn play_compressed_stream<R: Read>(
        &self,
        reader: R,
        total_bytes: Option<u64>,
    ) -> Result<(), PlaybackError> {
        let _active = self.begin();
        let span = info_span!("playback", kind = "compressed");
        let _enter = span.enter();

        let mut decoder =
            CompressedDecoder::new(reader, self.config.read_ahead_bytes, self.config.source_stall())?;
        let Some(first) = decoder.next_frame()? else {
            return Err(PlaybackError::Corrupt("no decodable frames in stream".into()));
        };
        info!(
            rate = first.sample_rate,
            channels = first.channels,
            ?total_bytes,
            "playing compressed stream"
        );

        let mut session = PlaybackSession::open(
            self,
            first.sample_rate,
            first.channels,
            1.0,
            self.config.equalizer,
        )?;
        let outcome = self.run_compressed(&mut decoder, first, total_bytes, &mut session);
        if decoder.skipped_regions() > 0 {
            warn!(skipped = decoder.skipped_regions(), "stream had undecodable regions");
        }
        session.close(outcome)
    }

    fn run_compressed<R: Read>(
        &self,
        decoder: &mut CompressedDecoder<R>,
        first: compressed::DecodedFrame,
        total_bytes: Option<u64>,
        session: &mut PlaybackSession<'_>,
    ) -> Result<Completion, PlaybackError> {
        let mut played = Duration::ZERO;
        let mut next = Some(first);
        let mut scratch = Vec::new();

        while let Some(frame) = next {
            if self.stop_requested() {
                return Ok(Completion::Stopped);
            }
            if frame.sample_rate != session.source_rate()
                || frame.channels != session.source_channels()
            {
                info!(
                    rate = frame.sample_rate,
                    channels = frame.channels,
                    "stream format changed"
                );
                session.retune(frame.sample_rate, frame.channels)?;
            }

            scratch.clear();
            scratch.extend(frame.samples.iter().map(|&s| i16_to_f32(s)));
            session.write_f32(&mut scratch)?;

            let frames = frame.samples.len() / frame.channels.max(1) as usize;
            played += Duration::from_secs_f64(frames as f64 / frame.sample_rate.max(1) as f64);
            let fraction = match total_bytes {
                Some(total) if total > 0 => decoder.consumed_bytes() as f32 / total as f32,
                _ => played.as_secs_f32() / ASSUMED_STREAM_SECS,
            };
            session.report(fraction);

            next = decoder.next_frame()?;
        }
        Ok(Completion::Finished)
    }

    /// Play raw interleaved PCM (e.g. synthesized speech).
    ///
    /// Rates the codec cannot clock are resampled to the default playback
    /// rate. The equalizer is not applied.
    pub fn submit_pcm(
        &self,
        samples: &[i16],
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), PlaybackError> {
        if !(1..=2).contains(&channels) {
            return Err(PlaybackError::Unsupported(format!(
                "{channels} channel PCM submission"
            )));
        }
        if sample_rate == 0 || samples.len() % channels as usize != 0 {
            return Err(PlaybackError::Unsupported(format!(
                "{} samples at {sample_rate} Hz do not form whole {channels}-channel frames",
                samples.len()
            )));
        }
        let _active = self.begin();
        let span = info_span!("playback", kind = "pcm", rate = sample_rate, channels);
        let _enter = span.enter();

        let mut session =
            PlaybackSession::open(self, sample_rate, channels, 1.0, EqualizerPreset::Flat)?;
        let outcome = self.run_pcm(samples, channels, &mut session);
        session.close(outcome)
    }

    fn run_pcm(
        &self,
        samples: &[i16],
        channels: u16,
        session: &mut PlaybackSession<'_>,
    ) -> Result<Completion, PlaybackError> {
        let chunk = self.config.chunk_frames * channels as usize;
        let total = samples.len().max(1) as f32;
        let mut done = 0usize;
        for block in samples.chunks(chunk) {
            if self.stop_requested() {
                return Ok(Completion::Stopped);
            }
            session.write_i16(block.to_vec())?;
            done += block.len();
            session.report(done as f32 / total);
        }
        Ok(Completion::Finished)
    }

    // ── Session plumbing ─────────────────────────────────────────────────────

    /// Serialize sessions and clear any stale stop request.
    fn begin(&self) -> parking_lot::MutexGuard<'_, ()> {
        let guard = self.active.lock();
        self.stop.store(false, Ordering::Release);
        guard
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Move the bus (and codec clocks) to `rate` if it is not already there.
    pub(crate) fn negotiate(&self, rate: u32) -> Result<(), PlaybackError> {
        let mut codec = self.codec.lock();
        if self.bus.playback_sample_rate() == rate && codec.sample_rate() == Some(rate) {
            return Ok(());
        }
        self.bus.reconfigure_playback(rate, &mut codec)?;
        Ok(())
    }

    pub(crate) fn emit(&self, progress: PlaybackProgress) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(progress);
        }
        let _ = self.progress_tx.send(progress);
    }
}
