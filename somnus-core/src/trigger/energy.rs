//! Energy-pattern trigger: a burst of speech followed by trailing silence.
//!
//! ## Algorithm
//!
//! ```text
//!            rms ≥ T                     rms < T, n ≥ S
//!   Idle ───────────► SpeechRising(n) ───────────────► TrailingSilence(m)
//!    ▲                   │   ▲  rms ≥ T: n += 1          │    │
//!    │   rms < T, n < S  │   └──────── rms ≥ T ──────────┘    │ rms < T: m += 1
//!    └───────────────────┘                                    │
//!    └────────────────────── m ≥ Q: emit ─────────────────────┘
//! ```
//!
//! `T` = speech threshold (raw 16-bit RMS), `S` = speech frames required,
//! `Q` = silence frames required. The frame that ends the speech run is the
//! first trailing-silence frame, so a pattern fires if and only if it holds at
//! least `S` loud frames followed by at least `Q` quiet ones.

use tracing::debug;

use super::TriggerDetector;
use crate::buffering::SampleFrame;
use crate::config::TriggerConfig;
use crate::events::TriggerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    SpeechRising(u32),
    TrailingSilence(u32),
}

#[derive(Debug, Clone)]
pub struct EnergyTrigger {
    threshold: f32,
    speech_required: u32,
    silence_required: u32,
    state: TriggerState,
    /// Speech frames counted in the current pattern.
    speech_frames: u32,
    /// Loudest frame of the current pattern.
    peak_rms: f32,
}

impl EnergyTrigger {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            threshold: config.speech_threshold,
            speech_required: config.speech_frames_required.max(1),
            silence_required: config.silence_frames_required.max(1),
            state: TriggerState::Idle,
            speech_frames: 0,
            peak_rms: 0.0,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Advance the state machine with one frame's energy.
    pub fn observe(&mut self, rms: f32) -> Option<TriggerEvent> {
        let loud = rms > self.threshold;
        if loud {
            self.peak_rms = self.peak_rms.max(rms);
        }

        self.state = match (self.state, loud) {
            (TriggerState::Idle, true) => TriggerState::SpeechRising(1),
            (TriggerState::Idle, false) => TriggerState::Idle,
            (TriggerState::SpeechRising(n), true) => TriggerState::SpeechRising(n + 1),
            (TriggerState::SpeechRising(n), false) if n >= self.speech_required => {
                self.speech_frames = n;
                TriggerState::TrailingSilence(1)
            }
            (TriggerState::SpeechRising(_), false) => {
                self.peak_rms = 0.0;
                TriggerState::Idle
            }
            (TriggerState::TrailingSilence(_), true) => {
                TriggerState::SpeechRising(self.speech_frames + 1)
            }
            (TriggerState::TrailingSilence(m), false) => TriggerState::TrailingSilence(m + 1),
        };

        match self.state {
            TriggerState::TrailingSilence(m) if m >= self.silence_required => {
                let event = TriggerEvent {
                    seq: 0,
                    detector: self.name().to_string(),
                    score: self.peak_rms,
                    speech_frames: self.speech_frames,
                    silence_frames: m,
                };
                debug!(
                    speech_frames = self.speech_frames,
                    silence_frames = m,
                    score = self.peak_rms,
                    "energy trigger fired"
                );
                self.reset();
                Some(event)
            }
            _ => None,
        }
    }
}

impl Default for EnergyTrigger {
    fn default() -> Self {
        Self::new(&TriggerConfig::default())
    }
}

impl TriggerDetector for EnergyTrigger {
    fn name(&self) -> &str {
        "energy"
    }

    fn process(&mut self, frame: &SampleFrame) -> Option<TriggerEvent> {
        self.observe(frame.rms())
    }

    fn reset(&mut self) {
        self.state = TriggerState::Idle;
        self.speech_frames = 0;
        self.peak_rms = 0.0;
    }
}
