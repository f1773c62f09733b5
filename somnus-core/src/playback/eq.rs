//! Per-channel equalizer built from RBJ-cookbook biquads.
//!
//! Every channel owns an independent filter cascade. A new [`Equalizer`] is
//! built for each stream, so no filter state survives from one stream to
//! the next.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EqualizerPreset {
    /// No filtering.
    Flat,
    /// Low-cut below ~120 Hz plus a gentle presence lift around 3 kHz,
    /// tuned for a small speaker.
    #[default]
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BandKind {
    HighPass,
    Peak { gain_db: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Band {
    kind: BandKind,
    freq_hz: f32,
    q: f32,
}

const VOICE_BANDS: [Band; 2] = [
    Band {
        kind: BandKind::HighPass,
        freq_hz: 120.0,
        q: 0.707,
    },
    Band {
        kind: BandKind::Peak { gain_db: 3.0 },
        freq_hz: 3_000.0,
        q: 1.0,
    },
];

impl EqualizerPreset {
    fn bands(self) -> &'static [Band] {
        match self {
            EqualizerPreset::Flat => &[],
            EqualizerPreset::Voice => &VOICE_BANDS,
        }
    }
}

/// Transposed direct-form II biquad.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn design(band: Band, sample_rate: u32) -> Self {
        let fs = sample_rate.max(1) as f32;
        // Keep the corner below Nyquist at low sample rates.
        let f0 = band.freq_hz.min(fs * 0.45);
        let w0 = std::f32::consts::TAU * f0 / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * band.q);

        let (b0, b1, b2, a0, a1, a2) = match band.kind {
            BandKind::HighPass => (
                (1.0 + cos) / 2.0,
                -(1.0 + cos),
                (1.0 + cos) / 2.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            BandKind::Peak { gain_db } => {
                let a = 10f32.powf(gain_db / 40.0);
                (
                    1.0 + alpha * a,
                    -2.0 * cos,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos,
                    1.0 - alpha / a,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[derive(Debug, Clone)]
pub struct Equalizer {
    preset: EqualizerPreset,
    /// `[channel][band]`
    filters: Vec<Vec<Biquad>>,
}

impl Equalizer {
    pub fn new(preset: EqualizerPreset, sample_rate: u32, channels: u16) -> Self {
        let cascade: Vec<Biquad> = preset
            .bands()
            .iter()
            .map(|&band| Biquad::design(band, sample_rate))
            .collect();
        Self {
            preset,
            filters: vec![cascade; channels.max(1) as usize],
        }
    }

    pub fn preset(&self) -> EqualizerPreset {
        self.preset
    }

    pub fn is_bypass(&self) -> bool {
        self.preset == EqualizerPreset::Flat
    }

    /// Filter interleaved samples in place; sample `i` goes through
    /// channel `i % channels`.
    pub fn process_interleaved(&mut self, samples: &mut [f32]) {
        if self.is_bypass() {
            return;
        }
        let channels = self.filters.len();
        for frame in samples.chunks_exact_mut(channels) {
            for (sample, cascade) in frame.iter_mut().zip(self.filters.iter_mut()) {
                *sample = cascade.iter_mut().fold(*sample, |x, f| f.process(x));
            }
        }
    }

    pub fn reset(&mut self) {
        for filter in self.filters.iter_mut().flatten() {
            filter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (std::f32::consts::TAU * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|s| s * s).sum::<f32>() / x.len() as f32).sqrt()
    }

    #[test]
    fn flat_preset_is_identity() {
        let mut eq = Equalizer::new(EqualizerPreset::Flat, 44_100, 2);
        let mut samples = vec![0.1, -0.2, 0.3, -0.4];
        eq.process_interleaved(&mut samples);
        assert_eq!(samples, vec![0.1, -0.2, 0.3, -0.4]);
    }

    #[test]
    fn voice_preset_cuts_low_rumble() {
        let mut eq = Equalizer::new(EqualizerPreset::Voice, 16_000, 1);
        let mut low = sine(30.0, 16_000, 16_000);
        eq.process_interleaved(&mut low);
        assert!(rms(&low[8_000..]) < 0.1, "rms={}", rms(&low[8_000..]));
    }

    #[test]
    fn voice_preset_passes_midband() {
        let mut eq = Equalizer::new(EqualizerPreset::Voice, 16_000, 1);
        let input = sine(1_000.0, 16_000, 16_000);
        let mut out = input.clone();
        eq.process_interleaved(&mut out);
        let ratio = rms(&out[8_000..]) / rms(&input[8_000..]);
        assert!((0.8..1.5).contains(&ratio), "ratio={ratio}");
    }

    #[test]
    fn channels_are_filtered_independently() {
        let mut eq = Equalizer::new(EqualizerPreset::Voice, 44_100, 2);
        // Impulse on the left only; right must stay silent.
        let mut samples = vec![0.0f32; 64];
        samples[0] = 1.0;
        eq.process_interleaved(&mut samples);
        assert!(samples.iter().skip(1).step_by(2).all(|&s| s == 0.0));
        assert!(samples[0] != 0.0);
    }

    #[test]
    fn reset_clears_filter_memory() {
        let mut eq = Equalizer::new(EqualizerPreset::Voice, 44_100, 1);
        let mut a = vec![1.0, 0.0, 0.0, 0.0];
        eq.process_interleaved(&mut a);
        eq.reset();
        let mut b = vec![1.0, 0.0, 0.0, 0.0];
        eq.process_interleaved(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-7);
        }
    }
}
