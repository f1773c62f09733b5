//! In-memory register bus used by tests and the simulated device host.
//!
//! Clones share state, so a test can hand one clone to a [`CodecHandle`] and
//! inspect registers through another.
//!
//! [`CodecHandle`]: super::CodecHandle

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{es7210, es8311, RegisterBus};
use crate::error::BusError;

/// One logged register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusWrite {
    pub addr: u8,
    pub reg: u8,
    pub value: u8,
}

#[derive(Debug, Default)]
struct SimState {
    registers: HashMap<(u8, u8), u8>,
    writes: Vec<BusWrite>,
    /// `(writes.len() at the time, duration)`.
    settles: Vec<(usize, Duration)>,
    absent: HashSet<u8>,
    failing_reads: HashSet<(u8, u8)>,
    failing_writes: HashSet<(u8, u8)>,
    failing_values: HashSet<(u8, u8, u8)>,
    stuck_low: HashMap<(u8, u8), u8>,
    amplifier: bool,
}

#[derive(Debug, Clone)]
pub struct SimulatedCodecBus {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCodecBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCodecBus {
    /// Both chips present at their default addresses with plausible ids.
    pub fn new() -> Self {
        let mut state = SimState::default();
        state.registers.insert((0x18, es8311::CHIP_ID1_REGFD), 0x83);
        state.registers.insert((0x18, es8311::CHIP_ID2_REGFE), 0x11);
        state.registers.insert((0x40, es7210::CHIP_ID_REGFD), 0x21);
        state.registers.insert((0x40, es7210::ADC_MCLK_REG0A), 0x08);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make every transaction to `addr` NACK.
    pub fn detach(&self, addr: u8) {
        self.state.lock().absent.insert(addr);
    }

    pub fn fail_reads_of(&self, addr: u8, reg: u8) {
        self.state.lock().failing_reads.insert((addr, reg));
    }

    pub fn fail_writes_to(&self, addr: u8, reg: u8) {
        self.state.lock().failing_writes.insert((addr, reg));
    }

    /// Only writes of exactly `value` to the register time out.
    pub fn fail_value_writes(&self, addr: u8, reg: u8, value: u8) {
        self.state.lock().failing_values.insert((addr, reg, value));
    }

    /// Bits in `mask` read back as zero regardless of what is written.
    pub fn stick_bits_low(&self, addr: u8, reg: u8, mask: u8) {
        self.state.lock().stuck_low.insert((addr, reg), mask);
    }

    pub fn register(&self, addr: u8, reg: u8) -> Option<u8> {
        self.state.lock().registers.get(&(addr, reg)).copied()
    }

    pub fn writes(&self) -> Vec<BusWrite> {
        self.state.lock().writes.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.settles.clear();
    }

    /// Total settle time requested between write `index` and the next write.
    pub fn settled_after_write(&self, index: usize) -> Duration {
        self.state
            .lock()
            .settles
            .iter()
            .filter(|(at, _)| *at == index + 1)
            .map(|(_, d)| *d)
            .sum()
    }

    pub fn amplifier_enabled(&self) -> bool {
        self.state.lock().amplifier
    }
}

impl RegisterBus for SimulatedCodecBus {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.absent.contains(&addr) {
            return Err(BusError::Nack { addr });
        }
        if state.failing_writes.contains(&(addr, reg))
            || state.failing_values.contains(&(addr, reg, value))
        {
            return Err(BusError::Timeout);
        }
        state.writes.push(BusWrite { addr, reg, value });
        let stored = match state.stuck_low.get(&(addr, reg)) {
            Some(mask) => value & !mask,
            None => value,
        };
        state.registers.insert((addr, reg), stored);
        Ok(())
    }

    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u8, BusError> {
        let state = self.state.lock();
        if state.absent.contains(&addr) || state.failing_reads.contains(&(addr, reg)) {
            return Err(BusError::Nack { addr });
        }
        Ok(state.registers.get(&(addr, reg)).copied().unwrap_or(0))
    }

    fn settle(&mut self, duration: Duration) {
        let mut state = self.state.lock();
        let at = state.writes.len();
        state.settles.push((at, duration));
    }

    fn set_amplifier(&mut self, enabled: bool) -> Result<(), BusError> {
        self.state.lock().amplifier = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_bits_read_back_low() {
        let sim = SimulatedCodecBus::new();
        sim.stick_bits_low(0x18, 0x11, 0x80);
        let mut bus = sim.clone();
        bus.write_register(0x18, 0x11, 0xFF).unwrap();
        assert_eq!(bus.read_register(0x18, 0x11), Ok(0x7F));
        assert_eq!(sim.writes()[0].value, 0xFF);
    }

    #[test]
    fn detached_device_nacks() {
        let sim = SimulatedCodecBus::new();
        sim.detach(0x40);
        let mut bus = sim.clone();
        assert_eq!(
            bus.read_register(0x40, 0xFD),
            Err(BusError::Nack { addr: 0x40 })
        );
    }
}
