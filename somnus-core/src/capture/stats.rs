use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::events::CaptureStatsSnapshot;

/// Counters shared between the capture thread and observers.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_captured: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub queue_drops: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub read_errors: AtomicU64,
    last_peak: AtomicU32,
    max_peak: AtomicU32,
}

impl CaptureStats {
    pub fn record_frame(&self, peak: u16) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.last_peak.store(peak as u32, Ordering::Relaxed);
        self.max_peak.fetch_max(peak as u32, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_discarded.store(0, Ordering::Relaxed);
        self.queue_drops.store(0, Ordering::Relaxed);
        self.read_timeouts.store(0, Ordering::Relaxed);
        self.read_errors.store(0, Ordering::Relaxed);
        self.last_peak.store(0, Ordering::Relaxed);
        self.max_peak.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            last_peak: self.last_peak.load(Ordering::Relaxed) as u16,
            max_peak: self.max_peak.load(Ordering::Relaxed) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_track_last_and_max() {
        let stats = CaptureStats::default();
        stats.record_frame(300);
        stats.record_frame(120);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.last_peak, 120);
        assert_eq!(snap.max_peak, 300);

        stats.reset();
        assert_eq!(stats.snapshot(), CaptureStatsSnapshot::default());
    }
}
