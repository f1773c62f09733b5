//! Simulated bus channels for tests and the hardware-less device host.
//!
//! Clones share state. A capture channel is fed either explicitly with
//! [`SimulatedChannel::feed`] or by a real-time paced generator; a playback
//! channel records (or discards) what is written and can inject partial or
//! stalled transfers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{BusChannel, Direction};
use crate::error::TransportError;

/// Fills a slice of capture samples.
pub type SampleGenerator = Box<dyn FnMut(&mut [i16]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Enabled,
    Disabled,
    RateSet(u32),
}

struct ChannelState {
    direction: Direction,
    enabled: bool,
    sample_rate: u32,
    channels: u16,
    input: VecDeque<i16>,
    generator: Option<SampleGenerator>,
    output: Vec<i16>,
    keep_output: bool,
    paced: bool,
    write_sizes: Vec<usize>,
    write_limit: Option<usize>,
    stalls_remaining: usize,
    events: Vec<ChannelEvent>,
}

#[derive(Clone)]
pub struct SimulatedChannel {
    state: Arc<Mutex<ChannelState>>,
    data_ready: Arc<Condvar>,
}

impl std::fmt::Debug for SimulatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedChannel")
            .field("direction", &state.direction)
            .field("enabled", &state.enabled)
            .field("sample_rate", &state.sample_rate)
            .finish()
    }
}

impl SimulatedChannel {
    fn with_direction(direction: Direction, sample_rate: u32, channels: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                direction,
                enabled: false,
                sample_rate,
                channels,
                input: VecDeque::new(),
                generator: None,
                output: Vec::new(),
                keep_output: true,
                paced: false,
                write_sizes: Vec::new(),
                write_limit: None,
                stalls_remaining: 0,
                events: Vec::new(),
            })),
            data_ready: Arc::new(Condvar::new()),
        }
    }

    /// Mono 16 kHz capture channel fed with [`feed`](Self::feed).
    pub fn capture() -> Self {
        Self::with_direction(Direction::Capture, 16_000, 1)
    }

    /// Stereo 44.1 kHz playback channel that records every sample written.
    pub fn playback() -> Self {
        Self::with_direction(Direction::Playback, 44_100, 2)
    }

    /// Capture channel producing samples in real time from `generator`.
    pub fn generated(sample_rate: u32, channels: u16, generator: SampleGenerator) -> Self {
        let ch = Self::with_direction(Direction::Capture, sample_rate, channels);
        ch.state.lock().generator = Some(generator);
        ch
    }

    /// Playback channel that consumes samples at the bus rate and keeps none.
    pub fn paced_playback(sample_rate: u32, channels: u16) -> Self {
        let ch = Self::with_direction(Direction::Playback, sample_rate, channels);
        {
            let mut state = ch.state.lock();
            state.paced = true;
            state.keep_output = false;
        }
        ch
    }

    pub fn feed(&self, samples: &[i16]) {
        self.state.lock().input.extend(samples.iter().copied());
        self.data_ready.notify_all();
    }

    pub fn written(&self) -> Vec<i16> {
        self.state.lock().output.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().output.clear();
    }

    /// Requested length of every `write` call.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.state.lock().write_sizes.clone()
    }

    /// Accept at most `max` samples per write.
    pub fn limit_write_size(&self, max: usize) {
        self.state.lock().write_limit = Some(max.max(1));
    }

    /// The next `n` writes accept nothing.
    pub fn stall_next_writes(&self, n: usize) {
        self.state.lock().stalls_remaining = n;
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    fn read_generated(&mut self, out: &mut [i16], timeout: Duration) -> usize {
        let (rate, channels) = {
            let state = self.state.lock();
            (state.sample_rate.max(1), state.channels.max(1))
        };
        let samples_per_sec = rate as f64 * channels as f64;
        let wanted = Duration::from_secs_f64(out.len() as f64 / samples_per_sec);
        let wait = wanted.min(timeout);
        std::thread::sleep(wait);
        let n = ((wait.as_secs_f64() * samples_per_sec) as usize).min(out.len());
        let n = n - n % channels as usize;
        let mut state = self.state.lock();
        if let Some(generator) = state.generator.as_mut() {
            generator(&mut out[..n]);
        }
        n
    }
}

impl BusChannel for SimulatedChannel {
    fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    fn write(&mut self, samples: &[i16], _timeout: Duration) -> Result<usize, TransportError> {
        let (accepted, pace) = {
            let mut state = self.state.lock();
            if state.direction != Direction::Playback {
                return Err(TransportError::WrongDirection("capture"));
            }
            state.write_sizes.push(samples.len());
            if state.stalls_remaining > 0 {
                state.stalls_remaining -= 1;
                return Ok(0);
            }
            let n = state
                .write_limit
                .map_or(samples.len(), |limit| limit.min(samples.len()));
            if state.keep_output {
                state.output.extend_from_slice(&samples[..n]);
            }
            let pace = state.paced.then(|| {
                let per_sec = state.sample_rate.max(1) as f64 * state.channels.max(1) as f64;
                Duration::from_secs_f64(n as f64 / per_sec)
            });
            (n, pace)
        };
        if let Some(d) = pace {
            std::thread::sleep(d);
        }
        Ok(accepted)
    }

    fn read(&mut self, out: &mut [i16], timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.direction != Direction::Capture {
            return Err(TransportError::WrongDirection("playback"));
        }
        if state.generator.is_some() {
            drop(state);
            return Ok(self.read_generated(out, timeout));
        }
        if state.input.is_empty() {
            let _ = self.data_ready.wait_for(&mut state, timeout);
        }
        let n = out.len().min(state.input.len());
        for (dst, src) in out.iter_mut().zip(state.input.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn enable(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.enabled = true;
        state.events.push(ChannelEvent::Enabled);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.enabled = false;
        state.events.push(ChannelEvent::Disabled);
        Ok(())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.sample_rate = hz;
        state.events.push(ChannelEvent::RateSet(hz));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_blocks_until_fed() {
        let ch = SimulatedChannel::capture();
        let feeder = ch.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            feeder.feed(&[5, 6]);
        });
        let mut reader = ch.clone();
        let mut out = [0i16; 4];
        let n = reader.read(&mut out, Duration::from_secs(1)).unwrap();
        t.join().unwrap();
        assert_eq!(&out[..n], &[5, 6]);
    }

    #[test]
    fn generated_capture_produces_paced_samples() {
        let ch = SimulatedChannel::generated(16_000, 1, Box::new(|buf| buf.fill(3)));
        let mut reader = ch.clone();
        let mut out = [0i16; 160];
        let n = reader.read(&mut out, Duration::from_secs(1)).unwrap();
        assert_eq!(n, 160);
        assert!(out.iter().all(|&s| s == 3));
    }

    #[test]
    fn wrong_direction_rejected() {
        let mut ch = SimulatedChannel::capture();
        assert!(matches!(
            ch.write(&[0; 4], Duration::ZERO),
            Err(TransportError::WrongDirection(_))
        ));
    }
}
