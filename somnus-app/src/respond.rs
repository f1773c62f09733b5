//! What the device plays back after a trigger, and the synthetic microphone
//! used when no audio hardware is attached.

use std::f32::consts::TAU;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use somnus_core::transport::sim::SampleGenerator;
use somnus_core::{AudioCore, PlaybackError};

const CHIME_RATE: u32 = 22_050;
/// Samples per chime tone (150 ms).
const TONE_LEN: usize = CHIME_RATE as usize * 3 / 20;

#[derive(Debug, Clone)]
pub enum Response {
    /// RIFF/WAVE bytes held in memory.
    Container(Vec<u8>),
    /// MP3 file, streamed from disk on every play.
    Compressed(PathBuf),
    /// Mono PCM at [`CHIME_RATE`].
    Chime(Vec<i16>),
}

impl Response {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::Chime(chime()));
        };
        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        if is_mp3 {
            File::open(path).with_context(|| format!("open {}", path.display()))?;
            Ok(Self::Compressed(path.to_path_buf()))
        } else {
            let bytes =
                std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            Ok(Self::Container(bytes))
        }
    }

    /// Blocks until playback finishes; capture is paused meanwhile.
    pub fn play(&self, core: &AudioCore) -> Result<(), PlaybackError> {
        match self {
            Self::Container(bytes) => core.play_container(bytes),
            Self::Compressed(path) => {
                let file = File::open(path)?;
                let total = file.metadata().ok().map(|m| m.len());
                core.play_compressed_stream(BufReader::new(file), total)
            }
            Self::Chime(pcm) => core.submit_pcm(pcm, CHIME_RATE, 1),
        }
    }
}

/// Two short rising tones with a linear fade on each.
fn chime() -> Vec<i16> {
    let mut out = Vec::with_capacity(TONE_LEN * 2);
    for freq in [660.0f32, 880.0] {
        for i in 0..TONE_LEN {
            let t = i as f32 / CHIME_RATE as f32;
            let fade = 1.0 - i as f32 / TONE_LEN as f32;
            let s = (TAU * freq * t).sin() * fade * 0.4;
            out.push((s * i16::MAX as f32) as i16);
        }
    }
    out
}

/// A repeating scene for the simulated microphone: a short loud burst (the
/// trigger), a pause, a longer spoken-level phrase, then near silence.
pub fn scripted_microphone(sample_rate: u32) -> SampleGenerator {
    let rate = sample_rate.max(1) as u64;
    let cycle = rate * 8;
    let mut n: u64 = 0;
    let mut noise: u32 = 0x1234_5678;
    Box::new(move |out: &mut [i16]| {
        for s in out.iter_mut() {
            let pos = n % cycle;
            let t = pos as f32 / rate as f32;
            noise = noise.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let hiss = ((noise >> 16) % 13) as f32 - 6.0;
            let v = if pos < rate * 6 / 10 {
                (TAU * 440.0 * t).sin() * 4_000.0
            } else if (rate * 14 / 10..rate * 29 / 10).contains(&pos) {
                let envelope = 0.6 + 0.4 * (TAU * 3.0 * t).sin();
                (TAU * 220.0 * t).sin() * 2_500.0 * envelope
            } else {
                hiss
            };
            *s = v as i16;
            n += 1;
        }
    })
}
