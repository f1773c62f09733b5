//! Construction-time parameters for the audio core.
//!
//! `AudioCoreConfig` is handed to [`crate::coordinator::AudioCore`] once. Every
//! section deserialises with `#[serde(default)]`, so partial JSON documents are
//! accepted; call [`AudioCoreConfig::normalize`] before use to clamp values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{is_supported_sample_rate, MclkSource};
use crate::playback::eq::EqualizerPreset;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AudioCoreConfig {
    pub pins: PinConfig,
    pub codec: CodecConfig,
    pub capture: CaptureConfig,
    pub trigger: TriggerConfig,
    pub playback: PlaybackConfig,
    pub memory: MemoryConfig,
}

impl AudioCoreConfig {
    pub fn normalize(&mut self) {
        self.codec.normalize();
        self.capture.normalize();
        self.trigger.normalize();
        self.playback.normalize();
        self.memory.normalize();
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

// ── Pins ─────────────────────────────────────────────────────────────────────

/// Bus and GPIO assignments. Informational on hosts without pin muxing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PinConfig {
    pub i2c_sda: u8,
    pub i2c_scl: u8,
    pub i2c_freq_hz: u32,
    pub playback_bclk: u8,
    pub playback_lrclk: u8,
    pub playback_dout: u8,
    pub playback_mclk: u8,
    pub capture_bclk: u8,
    pub capture_ws: u8,
    pub capture_din: u8,
    pub capture_mclk: u8,
    /// Power amplifier enable line.
    pub amplifier_enable: u8,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            i2c_sda: 1,
            i2c_scl: 2,
            i2c_freq_hz: 100_000,
            playback_bclk: 40,
            playback_lrclk: 41,
            playback_dout: 39,
            playback_mclk: 42,
            capture_bclk: 10,
            capture_ws: 9,
            capture_din: 11,
            capture_mclk: 20,
            amplifier_enable: 38,
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CodecConfig {
    /// 7-bit register-bus address of the playback DAC.
    pub playback_address: u8,
    /// 7-bit register-bus address of the capture ADC.
    pub capture_address: u8,
    pub mclk_source: MclkSource,
    /// Read-back attempts for the output-stage enable bit.
    pub verify_retries: u8,
    /// Output stage register value; bit 7 is the enable bit.
    pub output_volume: u8,
    /// Digital DAC volume.
    pub dac_volume: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            playback_address: 0x18,
            capture_address: 0x40,
            mclk_source: MclkSource::FromBitClock,
            verify_retries: 5,
            output_volume: 0xE0,
            dac_volume: 0xD0,
        }
    }
}

impl CodecConfig {
    fn normalize(&mut self) {
        self.playback_address &= 0x7F;
        self.capture_address &= 0x7F;
        self.verify_retries = self.verify_retries.clamp(1, 20);
        // The enable bit is part of the volume register.
        self.output_volume |= 0x80;
    }
}

// ── Capture ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one capture frame.
    pub frame_samples: usize,
    /// Frames held by the capture queue (16 × 512 @ 16 kHz ≈ 0.5 s).
    pub queue_capacity: usize,
    pub read_timeout_ms: u64,
    /// Upper bound on how long `stop()` waits for the loop to exit.
    pub stop_wait_ms: u64,
    pub stats_log_interval_frames: u64,
    /// Audio skipped at the start of a trigger-phrase recording.
    pub record_lead_in_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_samples: 512,
            queue_capacity: 16,
            read_timeout_ms: 100,
            stop_wait_ms: 500,
            stats_log_interval_frames: 500,
            record_lead_in_ms: 200,
        }
    }
}

impl CaptureConfig {
    fn normalize(&mut self) {
        if !is_supported_sample_rate(self.sample_rate) {
            self.sample_rate = 16_000;
        }
        self.channels = self.channels.clamp(1, 2);
        self.frame_samples = self.frame_samples.clamp(64, 4096);
        self.queue_capacity = self.queue_capacity.clamp(2, 256);
        self.read_timeout_ms = self.read_timeout_ms.clamp(5, 5_000);
        self.stop_wait_ms = self.stop_wait_ms.clamp(50, 10_000);
        self.stats_log_interval_frames = self.stats_log_interval_frames.max(1);
        self.record_lead_in_ms = self.record_lead_in_ms.min(2_000);
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

// ── Trigger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct TriggerConfig {
    /// RMS energy (raw 16-bit units) above which a frame counts as speech.
    pub speech_threshold: f32,
    pub speech_frames_required: u32,
    pub silence_frames_required: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 5.0,
            speech_frames_required: 3,
            silence_frames_required: 2,
        }
    }
}

impl TriggerConfig {
    fn normalize(&mut self) {
        if !self.speech_threshold.is_finite() {
            self.speech_threshold = Self::default().speech_threshold;
        }
        self.speech_threshold = self.speech_threshold.clamp(0.0, i16::MAX as f32);
        self.speech_frames_required = self.speech_frames_required.clamp(1, 500);
        self.silence_frames_required = self.silence_frames_required.clamp(1, 500);
    }
}

// ── Playback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlaybackConfig {
    pub default_sample_rate: u32,
    /// Channels carried by the playback bus.
    pub bus_channels: u16,
    /// Frames decoded per chunk.
    pub chunk_frames: usize,
    /// Frames per bus sub-transfer.
    pub bus_chunk_frames: usize,
    /// Fraction of full scale used when converting float samples.
    pub headroom: f32,
    pub equalizer: EqualizerPreset,
    pub read_ahead_bytes: usize,
    /// How long the compressed-stream reader waits for a slow source.
    pub source_stall_ms: u64,
    /// How long a bus write may make no progress before failing.
    pub write_stall_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: 44_100,
            bus_channels: 2,
            chunk_frames: 1024,
            bus_chunk_frames: 256,
            headroom: 0.90,
            equalizer: EqualizerPreset::Voice,
            read_ahead_bytes: 4096,
            source_stall_ms: 2_000,
            write_stall_ms: 1_000,
        }
    }
}

impl PlaybackConfig {
    fn normalize(&mut self) {
        if !is_supported_sample_rate(self.default_sample_rate) {
            self.default_sample_rate = 44_100;
        }
        self.bus_channels = self.bus_channels.clamp(1, 2);
        self.chunk_frames = self.chunk_frames.clamp(64, 8192);
        self.bus_chunk_frames = self.bus_chunk_frames.clamp(32, 2048);
        if !self.headroom.is_finite() {
            self.headroom = 0.90;
        }
        self.headroom = self.headroom.clamp(0.1, 1.0);
        self.read_ahead_bytes = self.read_ahead_bytes.clamp(1024, 64 * 1024);
        self.source_stall_ms = self.source_stall_ms.clamp(10, 30_000);
        self.write_stall_ms = self.write_stall_ms.clamp(10, 30_000);
    }

    pub fn source_stall(&self) -> Duration {
        Duration::from_millis(self.source_stall_ms)
    }

    pub fn write_stall(&self) -> Duration {
        Duration::from_millis(self.write_stall_ms)
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MemoryConfig {
    pub bus_pool_bytes: usize,
    pub auxiliary_pool_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            bus_pool_bytes: 160 * 1024,
            auxiliary_pool_bytes: 8 * 1024 * 1024,
        }
    }
}

impl MemoryConfig {
    fn normalize(&mut self) {
        self.bus_pool_bytes = self.bus_pool_bytes.max(16 * 1024);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: AudioCoreConfig =
            serde_json::from_str(r#"{"trigger":{"speechThreshold":42.0}}"#).unwrap();
        assert_eq!(cfg.trigger.speech_threshold, 42.0);
        assert_eq!(cfg.trigger.speech_frames_required, 3);
        assert_eq!(cfg.capture.frame_samples, 512);
        assert_eq!(cfg.codec.playback_address, 0x18);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut cfg = AudioCoreConfig::default();
        cfg.capture.sample_rate = 12_345;
        cfg.capture.queue_capacity = 0;
        cfg.playback.headroom = f32::NAN;
        cfg.codec.verify_retries = 0;
        cfg.codec.output_volume = 0x10;
        cfg.normalize();

        assert_eq!(cfg.capture.sample_rate, 16_000);
        assert_eq!(cfg.capture.queue_capacity, 2);
        assert_eq!(cfg.playback.headroom, 0.90);
        assert_eq!(cfg.codec.verify_retries, 1);
        assert_eq!(cfg.codec.output_volume, 0x90);
    }

    #[test]
    fn default_queue_holds_about_half_a_second() {
        let c = CaptureConfig::default();
        let seconds = (c.queue_capacity * c.frame_samples) as f64 / c.sample_rate as f64;
        assert!((0.4..=0.6).contains(&seconds), "{seconds}");
    }
}
