//! Sample-rate conversion for interleaved i16 audio using a rubato
//! `FastFixedIn` resampler.
//!
//! ## Uses
//!
//! - `submit_pcm` at a rate the codec clock tree cannot produce is converted
//!   to the default playback rate before it reaches the bus.
//! - The host backend converts between the bus rate and the sound card's
//!   native rate.
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::TransportError;

/// Converts interleaved i16 audio from one fixed rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate.
    resampler: Option<FastFixedIn<f32>>,
    channels: usize,
    ratio: f64,
    /// Per-channel accumulation of input not yet consumed.
    input_buf: Vec<Vec<f32>>,
    /// Input frames per rubato call.
    chunk_size: usize,
    /// Pre-allocated `[channels][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("channels", &self.channels)
            .field("ratio", &self.ratio)
            .field("passthrough", &self.resampler.is_none())
            .finish()
    }
}

impl RateConverter {
    /// # Errors
    /// [`TransportError::Channel`] if rubato rejects the configuration.
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: u16,
        chunk_size: usize,
    ) -> Result<Self, TransportError> {
        let channels = channels.max(1) as usize;
        let ratio = target_rate as f64 / source_rate.max(1) as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                channels,
                ratio,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            channels,
        )
        .map_err(|e| TransportError::Channel(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(
            source_rate,
            target_rate,
            channels,
            chunk_size,
            "resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            channels,
            ratio,
            input_buf: vec![Vec::with_capacity(chunk_size * 2); channels],
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; channels],
        })
    }

    /// Feed interleaved samples; returns whatever full chunks produced.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }
        for frame in samples.chunks_exact(self.channels) {
            for (ch, &s) in frame.iter().enumerate() {
                self.input_buf[ch].push(s as f32 / 32768.0);
            }
        }

        let mut result = Vec::new();
        while self.input_buf[0].len() >= self.chunk_size {
            let produced = self.run_chunk(self.chunk_size, false);
            self.interleave_into(&mut result, produced);
            for ch in &mut self.input_buf {
                ch.drain(..self.chunk_size);
            }
        }
        result
    }

    /// Convert any buffered remainder (zero-padded) and return it.
    pub fn flush(&mut self) -> Vec<i16> {
        let mut result = Vec::new();
        if self.resampler.is_none() || self.input_buf[0].is_empty() {
            return result;
        }
        let pending = self.input_buf[0].len();
        let produced = self.run_chunk(pending, true);
        let expected = ((pending as f64) * self.ratio).round() as usize;
        self.interleave_into(&mut result, produced.min(expected));
        for ch in &mut self.input_buf {
            ch.clear();
        }
        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn run_chunk(&mut self, frames: usize, partial: bool) -> usize {
        let Some(resampler) = self.resampler.as_mut() else {
            return 0;
        };
        let input: Vec<&[f32]> = self.input_buf.iter().map(|c| &c[..frames]).collect();
        let outcome = if partial {
            resampler.process_partial_into_buffer(Some(input.as_slice()), &mut self.output_buf, None)
        } else {
            resampler.process_into_buffer(input.as_slice(), &mut self.output_buf, None)
        };
        match outcome {
            Ok((_consumed, produced)) => produced,
            Err(e) => {
                error!("resampler process error: {e}");
                0
            }
        }
    }

    fn interleave_into(&self, out: &mut Vec<i16>, frames: usize) {
        out.reserve(frames * self.channels);
        for i in 0..frames {
            for ch in &self.output_buf {
                out.push((ch[i].clamp(-1.0, 1.0) * 32767.0).round() as i16);
            }
        }
    }
}

/// Convert a complete interleaved buffer in one go.
pub fn resample_interleaved(
    samples: &[i16],
    source_rate: u32,
    target_rate: u32,
    channels: u16,
) -> Result<Vec<i16>, TransportError> {
    let mut rc = RateConverter::new(source_rate, target_rate, channels, 1024)?;
    let mut out = rc.process(samples);
    out.extend(rc.flush());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 1, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<i16> = (0..480).map(|i| i as i16).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 1, 960).unwrap();
        let out = rc.process(&vec![0i16; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_accumulation_returns_empty() {
        let mut rc = RateConverter::new(48_000, 16_000, 1, 960).unwrap();
        assert!(rc.process(&vec![0i16; 500]).is_empty());
        assert!(!rc.process(&vec![0i16; 500]).is_empty());
    }

    #[test]
    fn stereo_output_stays_interleaved() {
        let mut rc = RateConverter::new(22_050, 44_100, 2, 256).unwrap();
        let out = rc.process(&vec![0i16; 512]);
        assert_eq!(out.len() % 2, 0);
    }

    #[test]
    fn whole_buffer_conversion_includes_tail() {
        let input = vec![0i16; 12_000];
        let out = resample_interleaved(&input, 12_000, 16_000, 1).unwrap();
        assert!(
            (out.len() as isize - 16_000).unsigned_abs() <= 1100,
            "output len={}",
            out.len()
        );
    }
}
