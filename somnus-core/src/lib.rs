//! # somnus-core
//!
//! Real-time audio I/O core for a voice device: codec bring-up, the duplex
//! audio bus, trigger-phrase detection and response playback.
//!
//! ## Architecture
//!
//! ```text
//! Mic codec → AudioBus::read → CapturePipeline ──► CaptureQueue ──► TriggerWorker
//!                                   │ (recording tap)                    │
//!                                   ▼                                    ▼
//!                           TriggerRecording            broadcast::Sender<TriggerEvent>
//!
//! WAV / MP3 / PCM → PlaybackEngine → EQ → AudioBus::write → Speaker codec
//!                        └─► broadcast::Sender<PlaybackProgress>
//! ```
//!
//! [`AudioCore`] owns both directions and pauses capture for the duration of
//! every playback session. Capture runs on its own thread and never blocks on
//! the trigger engine: a full queue drops the frame.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod memory;
pub mod playback;
pub mod transport;
pub mod trigger;
mod worker;

// Convenience re-exports for downstream crates
pub use config::AudioCoreConfig;
pub use coordinator::{AudioCore, AudioHardware, CapturePauseGuard};
pub use error::{CodecError, PlaybackError, SomnusError, TransportError};
pub use events::{
    CaptureStatsSnapshot, CoreStatus, CoreStatusEvent, PlaybackProgress, TriggerEvent,
};
pub use playback::{EqualizerPreset, PlaybackStopHandle};
pub use trigger::{DetectorHandle, EnergyTrigger, TriggerDetector};

#[cfg(feature = "sim")]
pub use coordinator::SimulatedHardware;

#[cfg(feature = "audio-cpal")]
pub use transport::host::{HostCaptureChannel, HostPlaybackChannel};
