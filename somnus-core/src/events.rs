//! Event types emitted by the audio core to its collaborators.
//!
//! | Event | Delivery |
//! |-------|----------|
//! | `TriggerEvent` | `AudioCore::subscribe_triggers()` + optional callback |
//! | `PlaybackProgress` | `AudioCore::subscribe_progress()` + per-call callback |
//! | `CoreStatusEvent` | `AudioCore::subscribe_status()` |
//!
//! All events serialise to camelCase JSON for log shipping or a UI bridge.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trigger events
// ---------------------------------------------------------------------------

/// Raised once per detected trigger phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Name of the detector that fired.
    pub detector: String,
    /// Detector score. For the energy detector: peak RMS seen during speech.
    pub score: f32,
    /// Frames classified as speech before the trailing silence.
    pub speech_frames: u32,
    /// Frames of trailing silence that completed the pattern.
    pub silence_frames: u32,
}

// ---------------------------------------------------------------------------
// Playback progress
// ---------------------------------------------------------------------------

/// Fraction in [0.0, 1.0] plus a still-playing flag.
///
/// For visual feedback only; not tied to audio timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackProgress {
    pub fraction: f32,
    pub playing: bool,
}

impl PlaybackProgress {
    pub fn new(fraction: f32, playing: bool) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            playing,
        }
    }
}

// ---------------------------------------------------------------------------
// Capture statistics
// ---------------------------------------------------------------------------

/// Point-in-time capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatsSnapshot {
    pub frames_captured: u64,
    /// Frames read while capture was paused and discarded.
    pub frames_discarded: u64,
    /// Frames dropped because the capture queue was full.
    pub queue_drops: u64,
    pub read_timeouts: u64,
    pub read_errors: u64,
    pub last_peak: u16,
    pub max_peak: u16,
}

// ---------------------------------------------------------------------------
// Core status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreStatus {
    /// Constructed, `start()` not yet called.
    Idle,
    /// Capturing and feeding the trigger engine.
    Listening,
    /// Capture paused (playback in progress or caller request).
    Paused,
    /// Shut down; construct a new core to restart.
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatusEvent {
    pub status: CoreStatus,
    /// Optional human-readable detail.
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_event_serializes_camel_case() {
        let event = TriggerEvent {
            seq: 3,
            detector: "energy".into(),
            score: 812.5,
            speech_frames: 5,
            silence_frames: 3,
        };
        let json = serde_json::to_value(&event).expect("serialize trigger event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["detector"], "energy");
        assert_eq!(json["speechFrames"], 5);
        assert_eq!(json["silenceFrames"], 3);
    }

    #[test]
    fn progress_fraction_is_clamped() {
        assert_eq!(PlaybackProgress::new(1.7, true).fraction, 1.0);
        assert_eq!(PlaybackProgress::new(-0.2, true).fraction, 0.0);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(CoreStatusEvent {
            status: CoreStatus::Paused,
            detail: None,
        })
        .expect("serialize status event");
        assert_eq!(json["status"], "paused");
        assert!(json["detail"].is_null());
    }
}
