//! Typed audio frame passed between the bus, the capture queue and the
//! trigger engine.

use std::time::Duration;

use crate::error::TransportError;
use crate::memory::{AudioBuffer, MemoryTier};

/// A block of interleaved signed 16-bit samples at a known rate.
///
/// The sample buffer is private and exposed read-only, so a frame cannot be
/// modified once it has been handed to the bus or the queue.
#[derive(Debug)]
pub struct SampleFrame {
    samples: AudioBuffer<i16>,
    sample_rate: u32,
    channels: u16,
}

impl SampleFrame {
    /// # Errors
    /// [`TransportError::MalformedFrame`] when the sample count is not a
    /// multiple of `channels`, or `channels` is not 1 or 2.
    pub fn new(
        samples: AudioBuffer<i16>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, TransportError> {
        if !(1..=2).contains(&channels) || samples.len() % channels as usize != 0 {
            return Err(TransportError::MalformedFrame {
                len: samples.len(),
                channels,
            });
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Wrap plain samples that do not need bus-capable placement.
    pub fn from_vec(
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, TransportError> {
        Self::new(AudioBuffer::unpooled(samples), sample_rate, channels)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
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

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> u16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// Root-mean-square energy in raw 16-bit units.
    pub fn rms(&self) -> f32 {
        rms_i16(&self.samples)
    }
}

pub(crate) fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_length_stereo() {
        let err = SampleFrame::from_vec(vec![0; 5], 16_000, 2).unwrap_err();
        assert!(matches!(
            err,
            TransportError::MalformedFrame { len: 5, channels: 2 }
        ));
    }

    #[test]
    fn rejects_zero_channels() {
        assert!(SampleFrame::from_vec(vec![0; 4], 16_000, 0).is_err());
    }

    #[test]
    fn duration_counts_frames_not_samples() {
        let f = SampleFrame::from_vec(vec![0; 32_000], 16_000, 2).unwrap();
        assert_eq!(f.frames(), 16_000);
        assert_eq!(f.duration(), Duration::from_secs(1));
    }

    #[test]
    fn rms_and_peak() {
        let f = SampleFrame::from_vec(vec![100, -100, 100, -100], 16_000, 1).unwrap();
        approx::assert_relative_eq!(f.rms(), 100.0);
        assert_eq!(f.peak(), 100);

        let f = SampleFrame::from_vec(vec![i16::MIN, 0], 16_000, 1).unwrap();
        assert_eq!(f.peak(), 32_768);
    }
}
