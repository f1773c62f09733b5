//! State owned by one playback stream.

use std::time::Instant;

use tracing::{debug, info};

use super::eq::{Equalizer, EqualizerPreset};
use super::PlaybackEngine;
use crate::audio::convert::{adapt_for_bus, adapted_channels, f32_to_i16};
use crate::audio::resample::RateConverter;
use crate::buffering::SampleFrame;
use crate::codec::is_supported_sample_rate;
use crate::error::PlaybackError;
use crate::events::PlaybackProgress;
use crate::memory::MemoryTier;

/// Minimum fraction advance between progress reports.
const PROGRESS_STEP: f32 = 0.01;
/// Seconds of audio between progress log lines.
const LOG_INTERVAL_SECS: u64 = 5;
/// Input frames per rubato call for streams the codec cannot clock.
const FALLBACK_RESAMPLE_CHUNK: usize = 1024;

/// How a decode loop ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Finished,
    Stopped,
}

/// One stream's format negotiation, filters and progress.
///
/// Created per stream, so equalizer and resampler state never carry over.
pub struct PlaybackSession<'a> {
    engine: &'a PlaybackEngine,
    source_rate: u32,
    source_channels: u16,
    bus_rate: u32,
    out_channels: u16,
    gain: f32,
    equalizer: Equalizer,
    converter: Option<RateConverter>,
    frames_written: u64,
    last_logged: u64,
    last_fraction: f32,
    last_emitted: f32,
    started: Instant,
}

impl<'a> PlaybackSession<'a> {
    /// Negotiate the bus for this stream.
    ///
    /// Rates the codec can clock are set on the bus directly; anything else is
    /// resampled to the configured default rate.
    pub(crate) fn open(
        engine: &'a PlaybackEngine,
        source_rate: u32,
        source_channels: u16,
        gain: f32,
        preset: EqualizerPreset,
    ) -> Result<Self, PlaybackError> {
        let bus_channels = engine.bus.playback_channels();
        let out_channels = adapted_channels(source_channels, bus_channels);

        let (bus_rate, converter) = if is_supported_sample_rate(source_rate) {
            (source_rate, None)
        } else {
            let target = engine.config.default_sample_rate;
            info!(
                source_rate,
                target, "sample rate not supported by codec, resampling"
            );
            let rc = RateConverter::new(source_rate, target, out_channels, FALLBACK_RESAMPLE_CHUNK)?;
            (target, Some(rc))
        };

        engine.negotiate(bus_rate)?;

        Ok(Self {
            engine,
            source_rate,
            source_channels,
            bus_rate,
            out_channels,
            gain,
            equalizer: Equalizer::new(preset, source_rate, source_channels),
            converter,
            frames_written: 0,
            last_logged: 0,
            last_fraction: 0.0,
            last_emitted: 0.0,
            started: Instant::now(),
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn source_channels(&self) -> u16 {
        self.source_channels
    }

    pub fn bus_rate(&self) -> u32 {
        self.bus_rate
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Switch to a new source format mid-stream, keeping progress.
    pub(crate) fn retune(&mut self, source_rate: u32, source_channels: u16) -> Result<(), PlaybackError> {
        self.flush_converter()?;
        let preset = self.equalizer.preset();
        let fresh = Self::open(self.engine, source_rate, source_channels, self.gain, preset)?;
        self.source_rate = fresh.source_rate;
        self.source_channels = fresh.source_channels;
        self.bus_rate = fresh.bus_rate;
        self.out_channels = fresh.out_channels;
        self.equalizer = fresh.equalizer;
        self.converter = fresh.converter;
        Ok(())
    }

    /// Equalize, scale and write normalized interleaved samples.
    pub(crate) fn write_f32(&mut self, samples: &mut [f32]) -> Result<(), PlaybackError> {
        self.equalizer.process_interleaved(samples);
        let gain = self.gain;
        let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s, gain)).collect();
        self.write_i16(pcm)
    }

    /// Write interleaved i16 samples in the source format, bypassing the
    /// equalizer.
    pub(crate) fn write_i16(&mut self, samples: Vec<i16>) -> Result<(), PlaybackError> {
        let adapted = adapt_for_bus(samples, self.source_channels, self.engine.bus.playback_channels());
        let out = match self.converter.as_mut() {
            Some(rc) => rc.process(&adapted),
            None => adapted,
        };
        self.write_bus(&out)
    }

    fn write_bus(&mut self, samples: &[i16]) -> Result<(), PlaybackError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut buf = self
            .engine
            .memory
            .allocate::<i16>(samples.len(), MemoryTier::Auxiliary)?;
        buf.copy_from_slice(samples);
        let frame = SampleFrame::new(buf, self.bus_rate, self.out_channels)?;
        self.engine.bus.write(&frame)?;

        self.frames_written += frame.frames() as u64;
        if self.frames_written - self.last_logged >= self.bus_rate as u64 * LOG_INTERVAL_SECS {
            self.last_logged = self.frames_written;
            info!(
                seconds = self.frames_written / self.bus_rate.max(1) as u64,
                fraction = self.last_fraction,
                "playback progress"
            );
        }
        Ok(())
    }

    fn flush_converter(&mut self) -> Result<(), PlaybackError> {
        let tail = match self.converter.as_mut() {
            Some(rc) => rc.flush(),
            None => return Ok(()),
        };
        self.write_bus(&tail)
    }

    /// Report progress; values never go backwards and stay below 1.0 until
    /// the stream completes.
    pub(crate) fn report(&mut self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 0.999).max(self.last_fraction);
        self.last_fraction = fraction;
        if fraction - self.last_emitted >= PROGRESS_STEP {
            self.last_emitted = fraction;
            self.engine.emit(PlaybackProgress::new(fraction, true));
        }
    }

    /// Emit the final progress calls and surface the outcome.
    pub(crate) fn close(
        mut self,
        outcome: Result<Completion, PlaybackError>,
    ) -> Result<(), PlaybackError> {
        let outcome = outcome.and_then(|c| match c {
            Completion::Finished => self.flush_converter().map(|()| c),
            Completion::Stopped => Ok(c),
        });
        let elapsed = self.started.elapsed();
        match outcome {
            Ok(Completion::Finished) => {
                self.engine.emit(PlaybackProgress::new(1.0, true));
                self.engine.emit(PlaybackProgress::new(1.0, false));
                info!(frames = self.frames_written, ?elapsed, "playback finished");
                Ok(())
            }
            Ok(Completion::Stopped) => {
                self.engine
                    .emit(PlaybackProgress::new(self.last_fraction, false));
                info!(frames = self.frames_written, ?elapsed, "playback stopped");
                Ok(())
            }
            Err(e) => {
                self.engine
                    .emit(PlaybackProgress::new(self.last_fraction, false));
                debug!(frames = self.frames_written, "playback aborted: {e}");
                Err(e)
            }
        }
    }
}
