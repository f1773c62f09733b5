//! Wake/trigger detection.
//!
//! The `TriggerDetector` trait is the extensibility point: the energy
//! pattern detector ([`EnergyTrigger`]) and any model-based scorer consume the
//! same `SampleFrame`s from the same [`CaptureQueue`] and are interchangeable.
//!
//! ```text
//! CaptureQueue ──pop──► TriggerWorker ──process──► DetectorHandle
//!                            │
//!                            ├──► broadcast::Sender<TriggerEvent>
//!                            └──► optional callback
//! ```
//!
//! [`CaptureQueue`]: crate::buffering::CaptureQueue

pub mod energy;
pub mod worker;

pub use energy::{EnergyTrigger, TriggerState};
pub use worker::{TriggerCallback, TriggerWorker};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::SampleFrame;
use crate::events::TriggerEvent;

/// Contract for trigger-phrase detectors.
pub trait TriggerDetector: Send + 'static {
    /// Short identifier reported in [`TriggerEvent::detector`].
    fn name(&self) -> &str;

    /// Feed one frame, in capture order. Returns an event when a phrase
    /// completes. `seq` is left at zero; the worker stamps it.
    fn process(&mut self, frame: &SampleFrame) -> Option<TriggerEvent>;

    /// Forget any partially observed pattern.
    fn reset(&mut self);
}

/// Thread-safe handle to any `TriggerDetector`.
#[derive(Clone)]
pub struct DetectorHandle(pub Arc<Mutex<dyn TriggerDetector>>);

impl DetectorHandle {
    pub fn new<D: TriggerDetector>(detector: D) -> Self {
        Self(Arc::new(Mutex::new(detector)))
    }

    pub fn reset(&self) {
        self.0.lock().reset();
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("name", &self.0.lock().name())
            .finish()
    }
}
