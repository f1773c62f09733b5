//! Audio bus transport.
//!
//! ```text
//!             ┌──────────── AudioBus ────────────┐
//! read() ◄──  │ capture side  (Mutex)            │ ◄── BusChannel (ADC)
//!             │   BusCapable frame buffer, carry │
//! write() ──► │ playback side (Mutex)            │ ──► BusChannel (DAC)
//!             │   BusCapable staging, mono→stereo│
//!             └──────────────────────────────────┘
//! ```
//!
//! Each direction has its own lock, so capture reads never wait on playback
//! writes. Reconfiguring a direction holds that direction's lock for the
//! whole disable → set rate → codec clock → enable sequence, so no frame
//! write is accepted mid-reconfiguration.

#[cfg(feature = "audio-cpal")]
pub mod host;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::SampleFrame;
use crate::codec::CodecHandle;
use crate::config::{CaptureConfig, PlaybackConfig};
use crate::error::TransportError;
use crate::memory::{AudioBuffer, MemoryPlacement, MemoryTier};

/// Pause between retries when a bus write makes no progress.
const PARTIAL_WRITE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Capture => "capture",
            Direction::Playback => "playback",
        }
    }
}

/// One direction of the hardware sample bus (an I2S channel on the device).
///
/// `write`/`read` move interleaved samples and may transfer fewer than
/// requested (including zero) without that being an error.
pub trait BusChannel: Send + 'static {
    fn direction(&self) -> Direction;

    fn write(&mut self, _samples: &[i16], _timeout: Duration) -> Result<usize, TransportError> {
        Err(TransportError::WrongDirection(self.direction().as_str()))
    }

    fn read(&mut self, _out: &mut [i16], _timeout: Duration) -> Result<usize, TransportError> {
        Err(TransportError::WrongDirection(self.direction().as_str()))
    }

    fn enable(&mut self) -> Result<(), TransportError>;

    fn disable(&mut self) -> Result<(), TransportError>;

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError>;
}

struct CaptureSide {
    channel: Box<dyn BusChannel>,
    sample_rate: u32,
    channels: u16,
    frame_samples: usize,
    /// Partially filled frame carried between `read` calls.
    pending: Option<(AudioBuffer<i16>, usize)>,
}

struct PlaybackSide {
    channel: Box<dyn BusChannel>,
    sample_rate: u32,
    bus_channels: u16,
    chunk_frames: usize,
    staging: AudioBuffer<i16>,
    mono_to_stereo: bool,
    stall: Duration,
}

pub struct AudioBus {
    capture: Mutex<CaptureSide>,
    playback: Mutex<PlaybackSide>,
    memory: MemoryPlacement,
}

impl std::fmt::Debug for AudioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBus")
            .field("capture_rate", &self.capture.lock().sample_rate)
            .field("playback_rate", &self.playback.lock().sample_rate)
            .finish()
    }
}

impl AudioBus {
    /// Wire both channels and allocate the playback staging buffer.
    ///
    /// # Errors
    /// [`TransportError::OutOfMemory`] if the staging buffer cannot be placed.
    pub fn new(
        capture_channel: Box<dyn BusChannel>,
        playback_channel: Box<dyn BusChannel>,
        capture: &CaptureConfig,
        playback: &PlaybackConfig,
        memory: MemoryPlacement,
    ) -> Result<Self, TransportError> {
        let staging = memory.allocate::<i16>(
            playback.bus_chunk_frames * playback.bus_channels as usize,
            MemoryTier::BusCapable,
        )?;
        if !staging.is_dma_safe() {
            warn!("playback staging buffer is not DMA-safe");
        }
        Ok(Self {
            capture: Mutex::new(CaptureSide {
                channel: capture_channel,
                sample_rate: capture.sample_rate,
                channels: capture.channels,
                frame_samples: capture.frame_samples,
                pending: None,
            }),
            playback: Mutex::new(PlaybackSide {
                channel: playback_channel,
                sample_rate: playback.default_sample_rate,
                bus_channels: playback.bus_channels,
                chunk_frames: playback.bus_chunk_frames,
                staging,
                mono_to_stereo: true,
                stall: playback.write_stall(),
            }),
            memory,
        })
    }

    pub fn enable(&self) -> Result<(), TransportError> {
        self.capture.lock().channel.enable()?;
        self.playback.lock().channel.enable()?;
        info!("audio bus enabled");
        Ok(())
    }

    pub fn disable(&self) -> Result<(), TransportError> {
        let capture = self.capture.lock().channel.disable();
        let playback = self.playback.lock().channel.disable();
        info!("audio bus disabled");
        capture.and(playback)
    }

    // ── Playback direction ────────────────────────────────────────────────

    /// Duplicate mono frames onto both slots of a stereo bus.
    pub fn set_channel_count_adapter(&self, mono_to_stereo: bool) {
        self.playback.lock().mono_to_stereo = mono_to_stereo;
    }

    pub fn playback_sample_rate(&self) -> u32 {
        self.playback.lock().sample_rate
    }

    pub fn playback_channels(&self) -> u16 {
        self.playback.lock().bus_channels
    }

    /// Transfer a whole frame, in bus-sized chunks.
    ///
    /// Partial transfers are retried until the frame is complete. Only a
    /// write that makes no progress for the configured stall bound fails.
    pub fn write(&self, frame: &SampleFrame) -> Result<(), TransportError> {
        let mut side = self.playback.lock();
        let side = &mut *side;
        let bus_ch = side.bus_channels as usize;
        let duplicate = match (frame.channels(), side.bus_channels) {
            (a, b) if a == b => false,
            (1, 2) if side.mono_to_stereo => true,
            (frame_ch, bus) => {
                return Err(TransportError::ChannelMismatch { frame: frame_ch, bus })
            }
        };
        if frame.sample_rate() != side.sample_rate {
            debug!(
                frame_rate = frame.sample_rate(),
                bus_rate = side.sample_rate,
                "frame rate differs from bus rate"
            );
        }

        let src_ch = frame.channels() as usize;
        for chunk in frame.samples().chunks(side.chunk_frames * src_ch) {
            let frames = chunk.len() / src_ch;
            let len = frames * bus_ch;
            let staging = &mut side.staging[..len];
            if duplicate {
                for (dst, &s) in staging.chunks_exact_mut(2).zip(chunk) {
                    dst[0] = s;
                    dst[1] = s;
                }
            } else {
                staging.copy_from_slice(chunk);
            }
            write_all(side.channel.as_mut(), &side.staging[..len], side.stall)?;
        }
        Ok(())
    }

    /// Disable the playback channel, change its clock, reprogram the codec
    /// and re-enable, all under the playback lock.
    ///
    /// The channel is re-enabled even if the codec step fails.
    pub fn reconfigure_playback(
        &self,
        hz: u32,
        codec: &mut CodecHandle,
    ) -> Result<(), TransportError> {
        let mut side = self.playback.lock();
        let result = reconfigure_channel(side.channel.as_mut(), hz, codec);
        if result.is_ok() {
            info!(from = side.sample_rate, to = hz, "playback sample rate changed");
            side.sample_rate = hz;
        }
        result
    }

    // ── Capture direction ─────────────────────────────────────────────────

    pub fn capture_sample_rate(&self) -> u32 {
        self.capture.lock().sample_rate
    }

    /// Block up to `timeout` for one full capture frame.
    ///
    /// Samples that arrive before the timeout are kept and completed on the
    /// next call. [`TransportError::Timeout`] means "no frame yet".
    pub fn read(&self, timeout: Duration) -> Result<SampleFrame, TransportError> {
        let mut side = self.capture.lock();
        let side = &mut *side;
        let len = side.frame_samples * side.channels as usize;
        let (mut buf, mut filled) = match side.pending.take() {
            Some(p) => p,
            None => (self.memory.allocate::<i16>(len, MemoryTier::BusCapable)?, 0),
        };

        let deadline = Instant::now() + timeout;
        while filled < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = match side.channel.read(&mut buf[filled..], remaining) {
                Ok(n) => n,
                Err(e) => {
                    side.pending = Some((buf, filled));
                    return Err(e);
                }
            };
            filled += n;
            if filled < len && Instant::now() >= deadline {
                side.pending = Some((buf, filled));
                return Err(TransportError::Timeout);
            }
        }
        SampleFrame::new(buf, side.sample_rate, side.channels)
    }

    /// Release a partially filled capture frame, if any.
    pub fn discard_partial_capture(&self) -> usize {
        self.capture
            .lock()
            .pending
            .take()
            .map(|(_, filled)| filled)
            .unwrap_or(0)
    }

    pub fn reconfigure_capture(
        &self,
        hz: u32,
        codec: &mut CodecHandle,
    ) -> Result<(), TransportError> {
        let mut side = self.capture.lock();
        let result = reconfigure_channel(side.channel.as_mut(), hz, codec);
        if result.is_ok() {
            side.pending = None;
            side.sample_rate = hz;
        }
        result
    }
}

fn write_all(
    channel: &mut dyn BusChannel,
    samples: &[i16],
    stall: Duration,
) -> Result<(), TransportError> {
    let mut written = 0;
    let mut last_progress = Instant::now();
    while written < samples.len() {
        let n = channel.write(&samples[written..], stall)?;
        if n == 0 {
            let waited = last_progress.elapsed();
            if waited >= stall {
                return Err(TransportError::Stalled {
                    transferred: written,
                    expected: samples.len(),
                    waited,
                });
            }
            std::thread::sleep(PARTIAL_WRITE_BACKOFF);
            continue;
        }
        written += n;
        last_progress = Instant::now();
    }
    Ok(())
}

fn reconfigure_channel(
    channel: &mut dyn BusChannel,
    hz: u32,
    codec: &mut CodecHandle,
) -> Result<(), TransportError> {
    channel.disable()?;
    let result = channel
        .set_sample_rate(hz)
        .and_then(|()| codec.reconfigure_sample_rate(hz).map_err(TransportError::from));
    let enabled = channel.enable();
    result.and(enabled)
}

#[cfg(test)]
mod tests {
    use super::sim::{ChannelEvent, SimulatedChannel};
    use super::*;
    use crate::codec::{sim::SimulatedCodecBus, CodecRole, RegisterBusHandle};
    use crate::config::{CodecConfig, MemoryConfig};

    fn bus_with(capture: &SimulatedChannel, playback: &SimulatedChannel) -> AudioBus {
        AudioBus::new(
            Box::new(capture.clone()),
            Box::new(playback.clone()),
            &CaptureConfig::default(),
            &PlaybackConfig::default(),
            MemoryPlacement::new(&MemoryConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn mono_frame_is_duplicated_to_stereo() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        let bus = bus_with(&cap, &play);
        bus.enable().unwrap();

        let frame = SampleFrame::from_vec(vec![1, 2, 3], 44_100, 1).unwrap();
        bus.write(&frame).unwrap();
        assert_eq!(play.written(), vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn mono_on_stereo_bus_rejected_without_adapter() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        let bus = bus_with(&cap, &play);
        bus.set_channel_count_adapter(false);
        let frame = SampleFrame::from_vec(vec![1, 2], 44_100, 1).unwrap();
        assert!(matches!(
            bus.write(&frame),
            Err(TransportError::ChannelMismatch { frame: 1, bus: 2 })
        ));
    }

    #[test]
    fn writes_are_chunked_and_partial_transfers_retried() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        play.limit_write_size(100);
        play.stall_next_writes(3);
        let bus = bus_with(&cap, &play);
        bus.enable().unwrap();

        let samples: Vec<i16> = (0..2000).map(|i| i as i16).collect();
        let frame = SampleFrame::from_vec(samples.clone(), 44_100, 2).unwrap();
        bus.write(&frame).unwrap();

        assert_eq!(play.written(), samples);
        // 256-frame stereo chunks never exceed 512 samples per call.
        assert!(play.write_sizes().iter().all(|&n| n <= 512));
    }

    #[test]
    fn write_that_never_progresses_reports_stall() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        play.stall_next_writes(usize::MAX);
        let mut cfg = PlaybackConfig::default();
        cfg.write_stall_ms = 10;
        let bus = AudioBus::new(
            Box::new(cap),
            Box::new(play.clone()),
            &CaptureConfig::default(),
            &cfg,
            MemoryPlacement::new(&MemoryConfig::default()),
        )
        .unwrap();

        let frame = SampleFrame::from_vec(vec![0; 64], 44_100, 2).unwrap();
        assert!(matches!(
            bus.write(&frame),
            Err(TransportError::Stalled { transferred: 0, .. })
        ));
    }

    #[test]
    fn read_times_out_then_completes_with_carry() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        let bus = bus_with(&cap, &play);

        cap.feed(&vec![7; 300]);
        let err = bus.read(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());

        cap.feed(&vec![9; 212]);
        let frame = bus.read(Duration::from_millis(50)).unwrap();
        assert_eq!(frame.samples().len(), 512);
        assert_eq!(frame.samples()[0], 7);
        assert_eq!(frame.samples()[511], 9);
        assert_eq!(frame.tier(), MemoryTier::BusCapable);
    }

    #[test]
    fn reconfigure_disables_before_and_enables_after() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        let bus = bus_with(&cap, &play);
        let regs = SimulatedCodecBus::new();
        let mut codec =
            CodecHandle::new(RegisterBusHandle::new(regs.clone()), CodecConfig::default());
        codec.init(CodecRole::Playback, 44_100).unwrap();
        play.clear_events();

        bus.reconfigure_playback(16_000, &mut codec).unwrap();
        assert_eq!(
            play.events(),
            vec![
                ChannelEvent::Disabled,
                ChannelEvent::RateSet(16_000),
                ChannelEvent::Enabled
            ]
        );
        assert_eq!(bus.playback_sample_rate(), 16_000);
        assert_eq!(codec.sample_rate(), Some(16_000));
    }

    #[test]
    fn failed_codec_reconfigure_still_reenables_channel() {
        let cap = SimulatedChannel::capture();
        let play = SimulatedChannel::playback();
        let bus = bus_with(&cap, &play);
        let mut codec = CodecHandle::new(
            RegisterBusHandle::new(SimulatedCodecBus::new()),
            CodecConfig::default(),
        );
        // Never initialised → NotInitialized from the codec step.
        assert!(bus.reconfigure_playback(16_000, &mut codec).is_err());
        assert_eq!(play.events().last(), Some(&ChannelEvent::Enabled));
        assert_eq!(bus.playback_sample_rate(), 44_100);
    }
}
