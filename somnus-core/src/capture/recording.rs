//! Trigger-phrase recording taken from the live capture stream.

use std::io::Cursor;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::audio::convert::downmix_to_mono;
use crate::buffering::frame::rms_i16;
use crate::error::Result;
use crate::memory::{AudioBuffer, MemoryTier};

/// Recordings quieter than this RMS (raw 16-bit units) are flagged silent.
pub const NEAR_SILENT_RMS: f32 = 10.0;

/// Extra time allowed past the requested duration before giving up.
pub const RECORD_GRACE: Duration = Duration::from_millis(500);

/// Collects capture samples into a pre-allocated buffer.
pub(crate) struct RecordingTap {
    buf: AudioBuffer<i16>,
    filled: usize,
    /// Lead-in samples still to be skipped.
    skip: usize,
    done: Sender<()>,
    signalled: bool,
}

impl RecordingTap {
    pub(crate) fn new(buf: AudioBuffer<i16>, skip: usize, done: Sender<()>) -> Self {
        Self {
            buf,
            filled: 0,
            skip,
            done,
            signalled: false,
        }
    }

    pub(crate) fn push(&mut self, samples: &[i16]) {
        let skipped = self.skip.min(samples.len());
        self.skip -= skipped;
        let samples = &samples[skipped..];

        let n = samples.len().min(self.buf.len() - self.filled);
        self.buf[self.filled..self.filled + n].copy_from_slice(&samples[..n]);
        self.filled += n;

        if self.filled == self.buf.len() && !self.signalled {
            self.signalled = true;
            let _ = self.done.try_send(());
        }
    }

    pub(crate) fn into_recording(self, sample_rate: u32, channels: u16) -> TriggerRecording {
        TriggerRecording::new(self.buf, self.filled, sample_rate, channels)
    }
}

/// Captured samples plus the statistics the caller needs to decide whether
/// the recording is worth sending on.
#[derive(Debug)]
pub struct TriggerRecording {
    samples: AudioBuffer<i16>,
    len: usize,
    sample_rate: u32,
    channels: u16,
    rms: f32,
    peak: u16,
    mean: f32,
}

impl TriggerRecording {
    fn new(samples: AudioBuffer<i16>, len: usize, sample_rate: u32, channels: u16) -> Self {
        let valid = &samples[..len];
        let rms = rms_i16(valid);
        let peak = valid.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        let mean = if valid.is_empty() {
            0.0
        } else {
            valid.iter().map(|&s| s as f64).sum::<f64>() as f32 / valid.len() as f32
        };
        Self {
            samples,
            len,
            sample_rate,
            channels,
            rms,
            peak,
            mean,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.len]
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn tier(&self) -> MemoryTier {
        self.samples.tier()
    }

    pub fn duration(&self) -> Duration {
        let per_sec = self.sample_rate.max(1) as f64 * self.channels.max(1) as f64;
        Duration::from_secs_f64(self.len as f64 / per_sec)
    }

    pub fn rms(&self) -> f32 {
        self.rms
    }

    pub fn peak(&self) -> u16 {
        self.peak
    }

    /// Average signed sample value (DC offset).
    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn is_near_silent(&self) -> bool {
        self.rms < NEAR_SILENT_RMS
    }

    /// Render as a 16-bit mono WAV file.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let mono = downmix_to_mono(self.samples(), self.channels);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + mono.len() * 2));
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).map_err(anyhow::Error::from)?;
            for s in mono {
                writer.write_sample(s).map_err(anyhow::Error::from)?;
            }
            writer.finalize().map_err(anyhow::Error::from)?;
        }
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn tap_skips_lead_in_and_signals_when_full() {
        let (tx, rx) = bounded(1);
        let mut tap = RecordingTap::new(AudioBuffer::unpooled(vec![0i16; 4]), 3, tx);
        tap.push(&[9, 9, 9, 1, 2]);
        assert!(rx.try_recv().is_err());
        tap.push(&[3, 4, 5]);
        assert!(rx.try_recv().is_ok());

        let rec = tap.into_recording(16_000, 1);
        assert_eq!(rec.samples(), &[1, 2, 3, 4]);
        assert_eq!(rec.peak(), 4);
        approx::assert_relative_eq!(rec.mean(), 2.5);
    }

    #[test]
    fn short_recording_keeps_only_filled_samples() {
        let (tx, _rx) = bounded(1);
        let mut tap = RecordingTap::new(AudioBuffer::unpooled(vec![0i16; 100]), 0, tx);
        tap.push(&[2; 10]);
        let rec = tap.into_recording(16_000, 1);
        assert_eq!(rec.samples().len(), 10);
        assert!(rec.is_near_silent());
    }

    #[test]
    fn wav_rendering_is_readable() {
        let (tx, _rx) = bounded(1);
        let mut tap = RecordingTap::new(AudioBuffer::unpooled(vec![0i16; 4]), 0, tx);
        tap.push(&[100, -100, 200, -200]);
        let bytes = tap.into_recording(16_000, 1).to_wav_bytes().unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![100, -100, 200, -200]);
    }
}
